//! Image reductions used by the processor thread and the acquisition
//! procedures.
//!
//! Everything here is pure: frames and stacks in, scalars and curves out.
//! The session feeds these from the processor thread; the procedures also
//! call them directly on frames they already own.

use crate::core::{ImageFrame, ImageStack, Position};

/// Mean of the brightest quartile of pixels plus a rolling-mean intensity
/// profile along the display Y axis (one sample per row).
///
/// `window` is the width of the centred rolling mean; it is truncated at
/// the profile edges rather than padded.
pub fn rolling_y_intensity(frame: &ImageFrame, window: usize) -> (f64, Vec<f64>) {
    let row_means: Vec<f64> = (0..frame.height())
        .map(|y| {
            let row = frame.row(y);
            row.iter().map(|&p| f64::from(p)).sum::<f64>() / row.len() as f64
        })
        .collect();
    (mean_top_quartile(frame.pixels()), rolling_mean(&row_means, window))
}

/// Column-wise twin of [`rolling_y_intensity`]: profile along the display X
/// axis.
pub fn rolling_x_intensity(frame: &ImageFrame, window: usize) -> (f64, Vec<f64>) {
    let height = frame.height() as usize;
    let mut column_sums = vec![0.0f64; frame.width() as usize];
    for y in 0..frame.height() {
        for (sum, &p) in column_sums.iter_mut().zip(frame.row(y)) {
            *sum += f64::from(p);
        }
    }
    let column_means: Vec<f64> = column_sums.iter().map(|s| s / height as f64).collect();
    (mean_top_quartile(frame.pixels()), rolling_mean(&column_means, window))
}

/// Mean of the largest quarter of the sample values.
pub fn mean_top_quartile(pixels: &[u16]) -> f64 {
    if pixels.is_empty() {
        return 0.0;
    }
    let quarter = (pixels.len() / 4).max(1);
    let mut sorted = pixels.to_vec();
    let pivot = sorted.len() - quarter;
    sorted.select_nth_unstable(pivot);
    let top = &sorted[pivot..];
    top.iter().map(|&p| f64::from(p)).sum::<f64>() / top.len() as f64
}

/// Centred rolling mean with edge truncation.
fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let half = window.max(1) / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

/// Index of the sharpest plane of a stack.
///
/// Sharpness is the mean absolute response of the 4-neighbour discrete
/// Laplacian over the plane interior. Ties resolve to the lowest index.
pub fn find_most_in_focus_plane(stack: &ImageStack) -> usize {
    let mut best = 0usize;
    let mut best_score = f64::NEG_INFINITY;
    for (index, plane) in stack.planes().iter().enumerate() {
        let score = laplacian_sharpness(plane);
        if score > best_score {
            best_score = score;
            best = index;
        }
    }
    best
}

/// Mean `|4·I(x,y) − I(x−1,y) − I(x+1,y) − I(x,y−1) − I(x,y+1)|` over the
/// interior pixels. Frames smaller than 3×3 score zero.
pub fn laplacian_sharpness(frame: &ImageFrame) -> f64 {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = frame.pixels();
    let mut total = 0.0f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = f64::from(px[y * w + x]);
            let neighbours = f64::from(px[y * w + x - 1])
                + f64::from(px[y * w + x + 1])
                + f64::from(px[(y - 1) * w + x])
                + f64::from(px[(y + 1) * w + x]);
            total += (4.0 * center - neighbours).abs();
        }
    }
    total / ((w - 2) * (h - 2)) as f64
}

/// Indices of samples that are strictly greater than both neighbours and
/// exceed `mean + 4·stddev` of the whole sequence.
pub fn check_maxima(values: &[f64]) -> Vec<usize> {
    if values.len() < 3 {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let cutoff = mean + 4.0 * variance.sqrt();
    (1..values.len() - 1)
        .filter(|&i| {
            values[i] > values[i - 1] && values[i] > values[i + 1] && values[i] > cutoff
        })
        .collect()
}

/// Contiguous regions whose values exceed `threshold_pct` percent of the
/// global maximum, reported as `(low, high)` index pairs in order of
/// appearance, at most `num_peaks` of them.
///
/// A region touching the start or end of the sequence is open on that side:
/// the corresponding bound is `None` and the caller decides what to clamp
/// it to (see [`replace_none`]).
pub fn find_peak_bounds(
    values: &[f64],
    num_peaks: usize,
    threshold_pct: f64,
) -> Vec<(Option<usize>, Option<usize>)> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() || num_peaks == 0 || max <= 0.0 {
        return Vec::new();
    }
    let threshold = max * threshold_pct / 100.0;

    let mut regions = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        if v > threshold {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            regions.push((s, i - 1));
        }
    }
    if let Some(s) = start {
        regions.push((s, values.len() - 1));
    }

    regions
        .into_iter()
        .take(num_peaks)
        .map(|(lo, hi)| {
            let low = if lo == 0 { None } else { Some(lo) };
            let high = if hi == values.len() - 1 { None } else { Some(hi) };
            (low, high)
        })
        .collect()
}

/// Clamp open-ended peak bounds: a missing low bound becomes 0, a missing
/// high bound becomes `max_index`.
pub fn replace_none(
    bounds: &[(Option<usize>, Option<usize>)],
    max_index: usize,
) -> Vec<(usize, usize)> {
    bounds
        .iter()
        .map(|&(lo, hi)| (lo.unwrap_or(0), hi.unwrap_or(max_index)))
        .collect()
}

/// True when every region has both bounds resolved.
pub fn bounds_closed(bounds: &[(Option<usize>, Option<usize>)]) -> bool {
    !bounds.is_empty() && bounds.iter().all(|(lo, hi)| lo.is_some() && hi.is_some())
}

/// Midpoint of two bounding corners, shifted by half a camera frame in X
/// and Y so the sample centre lands in the centre of the field of view.
/// Rotation is taken from the top corner.
pub fn find_center(top: &Position, bottom: &Position, frame_shift_mm: f64) -> Position {
    Position {
        x_mm: (top.x_mm + bottom.x_mm) / 2.0 - frame_shift_mm,
        y_mm: (top.y_mm + bottom.y_mm) / 2.0 - frame_shift_mm,
        z_mm: (top.z_mm + bottom.z_mm) / 2.0,
        r_deg: top.r_deg,
    }
}

/// Interpolate a bounding point at `angle_deg` from a polyline of points
/// sampled at increasing rotation angles over one revolution.
///
/// Angles wrap: querying between the last sample and the first-plus-360°
/// interpolates across the seam. Returns `None` for an empty polyline.
pub fn bounding_point_from_angle(points: &[Position], angle_deg: f64) -> Option<Position> {
    if points.is_empty() {
        return None;
    }
    if points.len() == 1 {
        return Some(points[0].with_axis(crate::core::Axis::R, angle_deg));
    }

    let angle = angle_deg.rem_euclid(360.0);
    let span = |a: &Position, b: &Position, wrap: f64| -> (f64, f64) {
        (a.r_deg, b.r_deg + wrap)
    };

    for pair in points.windows(2) {
        let (lo, hi) = span(&pair[0], &pair[1], 0.0);
        if angle >= lo && angle <= hi && hi > lo {
            return Some(lerp(&pair[0], &pair[1], (angle - lo) / (hi - lo), angle_deg));
        }
    }

    // Seam: between the last point and the first point one turn later.
    let first = &points[0];
    let last = &points[points.len() - 1];
    let (lo, hi) = span(last, first, 360.0);
    if hi > lo {
        let wrapped = if angle < lo { angle + 360.0 } else { angle };
        if wrapped >= lo && wrapped <= hi {
            return Some(lerp(last, first, (wrapped - lo) / (hi - lo), angle_deg));
        }
    }
    // Query outside the sampled range entirely: clamp to the nearest end.
    Some(if angle < first.r_deg { *first } else { *last })
}

fn lerp(a: &Position, b: &Position, t: f64, angle_deg: f64) -> Position {
    Position {
        x_mm: a.x_mm + (b.x_mm - a.x_mm) * t,
        y_mm: a.y_mm + (b.y_mm - a.y_mm) * t,
        z_mm: a.z_mm + (b.z_mm - a.z_mm) * t,
        r_deg: angle_deg,
    }
}

/// Maximum-intensity projection of a stack.
pub fn max_project(stack: &ImageStack) -> Option<ImageFrame> {
    let first = stack.planes().first()?;
    let mut acc = first.pixels().to_vec();
    for plane in &stack.planes()[1..] {
        for (a, &p) in acc.iter_mut().zip(plane.pixels()) {
            *a = (*a).max(p);
        }
    }
    ImageFrame::new(first.width(), first.height(), acc)
}
