//! Blocking TCP transport for the two controller channels.
//!
//! The session holds one [`Channel`] per socket direction: the sender
//! writes the control socket, the command listener reads it (via a cloned
//! handle), and the image listener reads the live socket. All reads and
//! writes are blocking and all-or-error; the only non-blocking entry points
//! are [`Channel::bytes_waiting`] and [`Channel::drain`], used to recover a
//! known state after a protocol slip.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, SessionError};

/// One direction-agnostic TCP channel to the controller.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
}

impl Channel {
    /// Connect with a deadline. Resolution failures, refusals, and timeouts
    /// all surface as [`SessionError::ConnectFailed`].
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Channel> {
        let addr: SocketAddr = (host, port)
            .to_socket_addrs()
            .map_err(|e| SessionError::ConnectFailed {
                reason: format!("cannot resolve {host}:{port}: {e}"),
            })?
            .next()
            .ok_or_else(|| SessionError::ConnectFailed {
                reason: format!("no address for {host}:{port}"),
            })?;

        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| SessionError::ConnectFailed {
                reason: format!("{addr}: {e}"),
            })?;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");
        Ok(Channel { stream })
    }

    /// A second handle on the same socket, for the opposite direction.
    pub fn try_clone(&self) -> std::io::Result<Channel> {
        Ok(Channel {
            stream: self.stream.try_clone()?,
        })
    }

    /// Write the whole buffer or fail.
    pub fn send_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Fill the whole buffer or fail. A clean remote close mid-buffer is an
    /// `UnexpectedEof` error, never a short read.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stream.read_exact(buf)
    }

    /// Fill the whole buffer within `timeout`.
    ///
    /// On expiry the error kind is `TimedOut`; bytes already consumed from
    /// the socket stay consumed, so a mid-frame timeout means the caller
    /// has lost framing and should resynchronize.
    pub fn recv_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0usize;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ErrorKind::TimedOut.into());
            }
            self.stream.set_read_timeout(Some(remaining))?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.stream.set_read_timeout(None)?;
                    return Err(ErrorKind::UnexpectedEof.into());
                }
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.stream.set_read_timeout(None)?;
                    return Err(ErrorKind::TimedOut.into());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stream.set_read_timeout(None)?;
                    return Err(e);
                }
            }
        }
        self.stream.set_read_timeout(None)?;
        Ok(())
    }

    /// Number of bytes immediately readable, without consuming them.
    pub fn bytes_waiting(&self) -> std::io::Result<usize> {
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 80_000];
        let waiting = match self.stream.peek(&mut probe) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
            Err(e) => {
                self.stream.set_nonblocking(false)?;
                return Err(e);
            }
        };
        self.stream.set_nonblocking(false)?;
        Ok(waiting)
    }

    /// Read and discard everything immediately readable. Returns the number
    /// of bytes discarded.
    pub fn drain(&mut self) -> std::io::Result<usize> {
        self.stream.set_nonblocking(true)?;
        let mut discarded = 0usize;
        let mut sink = [0u8; 4096];
        loop {
            match self.stream.read(&mut sink) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stream.set_nonblocking(false)?;
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        if discarded > 0 {
            debug!(discarded, "drained stale bytes from socket");
        }
        Ok(discarded)
    }

    /// Shut both directions down, unblocking any thread parked in a read.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Channel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let channel = Channel::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let (server, _) = listener.accept().unwrap();
        (channel, server)
    }

    #[test]
    fn test_connect_refused() {
        // Port 1 is almost certainly closed.
        let result = Channel::connect("127.0.0.1", 1, Duration::from_millis(200));
        assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    }

    #[test]
    fn test_send_and_recv_exact() {
        let (mut channel, mut server) = pair();
        channel.send_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"world").unwrap();
        let mut buf = [0u8; 5];
        channel.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_recv_exact_timeout_expires() {
        let (mut channel, server) = pair();
        let mut buf = [0u8; 4];
        let started = Instant::now();
        let err = channel
            .recv_exact_timeout(&mut buf, Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(100));
        drop(server);
    }

    #[test]
    fn test_bytes_waiting_and_drain() {
        let (mut channel, mut server) = pair();
        assert_eq!(channel.bytes_waiting().unwrap(), 0);

        server.write_all(&[7u8; 96]).unwrap();
        // Give the loopback a moment to deliver.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.bytes_waiting().unwrap(), 96);
        // Peeking does not consume.
        assert_eq!(channel.bytes_waiting().unwrap(), 96);

        assert_eq!(channel.drain().unwrap(), 96);
        assert_eq!(channel.bytes_waiting().unwrap(), 0);
    }
}
