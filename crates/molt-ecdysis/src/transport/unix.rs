//! Unix datagram transport.
//!
//! Every process binds `<dir>/molt-<pid>.sock`. A datagram carries the sender
//! pid followed by the control record:
//!
//! ```text
//! +----------------+------------------------+
//! | sender pid     | operation | payload    |
//! | u32 big-endian |                        |
//! +----------------+------------------------+
//! ```
//!
//! Datagrams keep message boundaries and, on a single host, arrive in the order
//! each sender wrote them.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::UnixDatagram;
use tracing::{debug, info, warn};

use super::{Envelope, Transport};
use crate::error::{EcdysisError, Result};
use crate::protocol::Pid;

/// Largest datagram accepted, sender header included.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

/// Socket path used by `pid` under `dir`.
pub fn socket_path(dir: &Path, pid: Pid) -> PathBuf {
    dir.join(format!("molt-{pid}.sock"))
}

/// Transport over Unix datagram sockets in a shared runtime directory.
#[derive(Debug)]
pub struct UnixTransport {
    pid: Pid,
    dir: PathBuf,
    path: PathBuf,
    socket: UnixDatagram,
}

impl UnixTransport {
    /// Bind the endpoint for `pid` in `dir`, replacing a stale socket file.
    pub fn bind(dir: impl AsRef<Path>, pid: Pid) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = socket_path(&dir, pid);

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let socket = UnixDatagram::bind(&path)?;
        info!(pid, path = %path.display(), "Control socket bound");
        Ok(Self {
            pid,
            dir,
            path,
            socket,
        })
    }

    /// Bind the endpoint for the current process.
    pub fn bind_current(dir: impl AsRef<Path>) -> Result<Self> {
        Self::bind(dir, std::process::id())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Transport for UnixTransport {
    fn pid(&self) -> Pid {
        self.pid
    }

    async fn send(&self, pid: Pid, bytes: Vec<u8>) -> Result<()> {
        let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
        frame.extend_from_slice(&self.pid.to_be_bytes());
        frame.extend_from_slice(&bytes);
        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(EcdysisError::malformed(format!(
                "control record of {} bytes exceeds datagram limit",
                bytes.len()
            )));
        }

        let target = socket_path(&self.dir, pid);
        match self.socket.send_to(&frame, &target).await {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(EcdysisError::unreachable(pid, e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let len = match self.socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "Control socket receive failed, closing transport");
                    return None;
                }
            };
            if len < HEADER_LEN {
                warn!(len, "Dropping short control datagram");
                continue;
            }
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&buf[..HEADER_LEN]);
            return Some(Envelope {
                sender: Pid::from_be_bytes(header),
                bytes: buf[HEADER_LEN..len].to_vec(),
            });
        }
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, Operation};

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let main = UnixTransport::bind(dir.path(), 100).unwrap();
        let child = UnixTransport::bind(dir.path(), 200).unwrap();

        let bytes = protocol::encode(Operation::NewFork, &protocol::encode_pid(200));
        child.send(100, bytes.clone()).await.unwrap();

        let envelope = main.recv().await.unwrap();
        assert_eq!(envelope.sender, 200);
        assert_eq!(envelope.bytes, bytes);
    }

    #[tokio::test]
    async fn test_missing_peer_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let main = UnixTransport::bind(dir.path(), 100).unwrap();
        let err = main.send(4242, vec![30]).await.unwrap_err();
        assert!(err.is_peer_gone(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let transport = UnixTransport::bind(dir.path(), 7).unwrap();
            assert!(transport.path().exists());
            transport.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_rebind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let first = UnixTransport::bind(dir.path(), 7).unwrap();
        std::mem::forget(first);
        tokio_test::assert_ok!(UnixTransport::bind(dir.path(), 7));
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = UnixTransport::bind(dir.path(), 1).unwrap();
        let _b = UnixTransport::bind(dir.path(), 2).unwrap();
        let err = a.send(2, vec![0; MAX_DATAGRAM_SIZE]).await.unwrap_err();
        assert!(matches!(err, EcdysisError::MalformedMessage(_)));
    }
}
