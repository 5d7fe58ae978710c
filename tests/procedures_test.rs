//! Coverage of the locate-sample maths: the Y boundary search over
//! synthetic tiles and the peak-bound edge policy it leans on.

use flamingo_core::calc;
use flamingo_core::core::ImageFrame;

const FRAME_PX: usize = 64;
const PIXEL_MM: f64 = 0.001;

/// A tile whose row intensity follows a Gaussian bump centred at global
/// row `center_px` (rows are indexed across the whole scan).
fn synthetic_tile(tile_index: usize, center_px: f64, sigma_px: f64) -> ImageFrame {
    let mut data = Vec::with_capacity(FRAME_PX * FRAME_PX);
    for row in 0..FRAME_PX {
        let global = (tile_index * FRAME_PX + row) as f64;
        let value = 1000.0 * (-((global - center_px).powi(2)) / (2.0 * sigma_px * sigma_px)).exp();
        for _ in 0..FRAME_PX {
            data.push(value as u16);
        }
    }
    ImageFrame::new(FRAME_PX as u32, FRAME_PX as u32, data).unwrap()
}

// A bump in the third tile is located at the right physical Y.
#[test]
fn test_y_search_profile_locates_gaussian_bump() {
    let y_start_mm = 5.0;
    let bump_center_px = 2.0 * FRAME_PX as f64 + 32.0; // tile 3, centre row
    let sigma_px = 8.0;

    // Scan tile by tile exactly the way the Y search accumulates profiles.
    let mut curve: Vec<f64> = Vec::new();
    let mut bounds = Vec::new();
    for tile in 0..5 {
        let frame = synthetic_tile(tile, bump_center_px, sigma_px);
        let (_, profile) = calc::rolling_y_intensity(&frame, 21);
        curve.extend(profile);
        bounds = calc::find_peak_bounds(&curve, 1, 50.0);
        if calc::bounds_closed(&bounds) {
            break;
        }
    }

    assert!(calc::bounds_closed(&bounds), "bump never boxed: {bounds:?}");
    let (low, high) = calc::replace_none(&bounds, curve.len() - 1)[0];
    let detected_px = (low + high) as f64 / 2.0;

    // Within one pixel of the seeded bump centre.
    assert!(
        (detected_px - bump_center_px).abs() <= 1.0,
        "detected {detected_px}, expected {bump_center_px}"
    );

    let detected_mm = y_start_mm + detected_px * PIXEL_MM;
    let expected_mm = y_start_mm + bump_center_px * PIXEL_MM;
    assert!((detected_mm - expected_mm).abs() <= PIXEL_MM);
}

// The scan stops early: bounds stay open while the bump is still rising at
// the scan frontier, and close once the falling edge is seen.
#[test]
fn test_y_search_bounds_stay_open_mid_bump() {
    let bump_center_px = 2.0 * FRAME_PX as f64 + 60.0; // near a tile seam
    let sigma_px = 8.0;

    let mut curve: Vec<f64> = Vec::new();
    for tile in 0..3 {
        let frame = synthetic_tile(tile, bump_center_px, sigma_px);
        let (_, profile) = calc::rolling_y_intensity(&frame, 21);
        curve.extend(profile);
    }
    // Tile 3 ends at px 191; the bump at 188 is cut off on its high side.
    let bounds = calc::find_peak_bounds(&curve, 1, 50.0);
    assert!(!calc::bounds_closed(&bounds));
    assert!(bounds[0].0.is_some());
    assert!(bounds[0].1.is_none());

    // One more tile closes it.
    let frame = synthetic_tile(3, bump_center_px, sigma_px);
    let (_, profile) = calc::rolling_y_intensity(&frame, 21);
    curve.extend(profile);
    let bounds = calc::find_peak_bounds(&curve, 1, 50.0);
    assert!(calc::bounds_closed(&bounds));
}

// Z sub-stack brightness means behave the same way over the loop index
// axis: the brightest sub-stacks bound the specimen in Z.
#[test]
fn test_z_search_means_bound_specimen() {
    let means = [2.0, 2.1, 40.0, 90.0, 88.0, 35.0, 2.2, 2.0];
    let bounds = calc::find_peak_bounds(&means, 1, 30.0);
    assert!(calc::bounds_closed(&bounds));
    let (low, high) = calc::replace_none(&bounds, means.len() - 1)[0];
    assert_eq!((low, high), (2, 5));

    let z_search_start = 12.0;
    let step = 0.1;
    let z_low = z_search_start + low as f64 * step;
    let z_high = z_search_start + high as f64 * step;
    assert!((z_low - 12.2).abs() < 1e-9);
    assert!((z_high - 12.5).abs() < 1e-9);
}
