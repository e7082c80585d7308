//! A bidirectional, identity-tagged datagram transport.
//!
//! Models the "local message bus" collaborator from the system overview:
//! a ROUTER/DEALER-style channel identified by a filesystem path, where
//! every outbound frame carries this session's identity and every inbound
//! frame is expected to carry it back. The actual message-bus library is
//! an external collaborator; this crate is the thin adapter the display
//! pipeline talks to, backed by a Unix datagram socket.

use std::fmt;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind local transport socket at {path}: {source}")]
    Bind { path: PathBuf, #[source] source: std::io::Error },

    #[error("failed to connect to {path}: {source}")]
    Connect { path: PathBuf, #[source] source: std::io::Error },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("received frame shorter than the identity-length prefix")]
    TruncatedIdentityPrefix,

    #[error("received frame's declared identity length ({declared}) exceeds frame size ({available})")]
    TruncatedIdentity { declared: usize, available: usize },
}

/// A duplex, identity-tagged datagram channel.
///
/// Implementations prepend the local identity to every outbound frame and
/// report the sender's claimed identity on every inbound frame; the caller
/// (the main I/O thread) is responsible for rejecting frames whose identity
/// doesn't match the configured session.
pub trait Transport: Send + Sync {
    /// Send one frame. Blocking; retried by the caller on transient failure.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Block until one frame is available, then return `(identity, payload)`.
    fn recv(&self) -> Result<(String, Vec<u8>), TransportError>;

    /// Block for up to `timeout`, returning whether a frame became readable.
    fn poll(&self, timeout: Duration) -> Result<bool, TransportError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Transport")
    }
}

/// A [`Transport`] backed by a connected `AF_UNIX` `SOCK_DGRAM` socket.
pub struct UnixDatagramTransport {
    socket: UnixDatagram,
    identity: String,
    local_path: PathBuf,
}

impl UnixDatagramTransport {
    /// Bind a local endpoint and connect it to the peer listening at `path`,
    /// tagging every outbound frame with `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] or [`TransportError::Connect`] if
    /// either socket operation fails.
    pub fn connect(path: impl AsRef<Path>, identity: &str) -> Result<Self, TransportError> {
        let remote_path = path.as_ref().to_path_buf();
        let local_path = std::env::temp_dir().join(format!("rdpmux-{identity}.sock"));
        // Remove a stale socket file left behind by a previous, uncleanly
        // terminated session at the same identity.
        let _ = std::fs::remove_file(&local_path);

        let socket = UnixDatagram::bind(&local_path).map_err(|source| TransportError::Bind {
            path: local_path.clone(),
            source,
        })?;
        socket
            .connect(&remote_path)
            .map_err(|source| TransportError::Connect { path: remote_path, source })?;

        tracing::info!(identity, local = %local_path.display(), "Transport connected");

        Ok(Self {
            socket,
            identity: identity.to_string(),
            local_path,
        })
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let id_bytes = self.identity.as_bytes();
        let mut frame = Vec::with_capacity(4 + id_bytes.len() + payload.len());
        frame.extend_from_slice(&(id_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(id_bytes);
        frame.extend_from_slice(payload);
        frame
    }
}

impl Drop for UnixDatagramTransport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}

impl Transport for UnixDatagramTransport {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = self.frame(payload);
        self.socket.send(&frame)?;
        Ok(())
    }

    fn recv(&self) -> Result<(String, Vec<u8>), TransportError> {
        self.socket.set_read_timeout(None)?;
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf)?;
        buf.truncate(n);
        parse_frame(&buf)
    }

    fn poll(&self, timeout: Duration) -> Result<bool, TransportError> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        match self.socket.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

fn parse_frame(buf: &[u8]) -> Result<(String, Vec<u8>), TransportError> {
    if buf.len() < 4 {
        return Err(TransportError::TruncatedIdentityPrefix);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let id_len = u32::from_be_bytes(len_bytes) as usize;

    let rest = &buf[4..];
    if rest.len() < id_len {
        return Err(TransportError::TruncatedIdentity {
            declared: id_len,
            available: rest.len(),
        });
    }

    let identity = String::from_utf8_lossy(&rest[..id_len]).into_owned();
    let payload = rest[id_len..].to_vec();
    Ok((identity, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_over_loopback_pair() {
        let dir = std::env::temp_dir();
        let a_path = dir.join(format!("rdpmux-test-a-{}.sock", std::process::id()));
        let b_path = dir.join(format!("rdpmux-test-b-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&a_path);
        let _ = std::fs::remove_file(&b_path);

        let a = UnixDatagram::bind(&a_path).unwrap();
        let b = UnixDatagram::bind(&b_path).unwrap();
        a.connect(&b_path).unwrap();
        b.connect(&a_path).unwrap();

        let transport_a = UnixDatagramTransportForTest { socket: a, identity: "vm-a".into() };
        let transport_b = UnixDatagramTransportForTest { socket: b, identity: "vm-b".into() };

        transport_a.send_raw(b"hello");
        let (identity, payload) = transport_b.recv_raw();
        assert_eq!(identity, "vm-a");
        assert_eq!(payload, b"hello");

        let _ = std::fs::remove_file(&a_path);
        let _ = std::fs::remove_file(&b_path);
    }

    /// Minimal harness duplicating `UnixDatagramTransport`'s framing without
    /// its temp-file lifecycle, so the test can drive both ends of a
    /// pre-bound pair directly.
    struct UnixDatagramTransportForTest {
        socket: UnixDatagram,
        identity: String,
    }

    impl UnixDatagramTransportForTest {
        fn send_raw(&self, payload: &[u8]) {
            let id_bytes = self.identity.as_bytes();
            let mut frame = Vec::with_capacity(4 + id_bytes.len() + payload.len());
            frame.extend_from_slice(&(id_bytes.len() as u32).to_be_bytes());
            frame.extend_from_slice(id_bytes);
            frame.extend_from_slice(payload);
            self.socket.send(&frame).unwrap();
        }

        fn recv_raw(&self) -> (String, Vec<u8>) {
            let mut buf = vec![0u8; 4096];
            let n = self.socket.recv(&mut buf).unwrap();
            buf.truncate(n);
            parse_frame(&buf).unwrap()
        }
    }

    #[test]
    fn parse_frame_rejects_truncated_prefix() {
        assert!(matches!(
            parse_frame(&[0, 0]),
            Err(TransportError::TruncatedIdentityPrefix)
        ));
    }

    #[test]
    fn parse_frame_rejects_truncated_identity() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");
        assert!(matches!(
            parse_frame(&buf),
            Err(TransportError::TruncatedIdentity { declared: 10, available: 5 })
        ));
    }

    #[test]
    fn parse_frame_accepts_empty_payload() {
        let mut buf = 5u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"hello");
        let (identity, payload) = parse_frame(&buf).unwrap();
        assert_eq!(identity, "hello");
        assert!(payload.is_empty());
    }
}
