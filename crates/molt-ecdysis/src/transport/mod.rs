//! Process-to-process message transport.
//!
//! A transport delivers opaque byte payloads between processes on the same
//! host, keyed by sender pid, preserving per-sender order. Two
//! implementations are provided:
//!
//! - [`UnixTransport`]: one Unix datagram socket per process, for real groups
//! - [`MemoryNetwork`]: an in-process hub of channels, for tests
//!
//! The dispatch loop does not read the transport directly. It reads an
//! [`Inbox`], which merges the transport with events injected by the process
//! itself (signals, heartbeat evictions, reaped children) through a
//! [`LocalSender`]. Transport messages that have already arrived are delivered
//! before local events, so a notice that a peer is gone never overtakes what
//! that peer sent before it went.

mod memory;
mod unix;

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::protocol::{self, Operation, Pid};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use unix::{socket_path, UnixTransport, MAX_DATAGRAM_SIZE};

/// Raw inbound message: who sent it and the encoded control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Pid,
    pub bytes: Vec<u8>,
}

/// Point-to-point, ordered delivery of byte payloads between local processes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Pid of the local endpoint.
    fn pid(&self) -> Pid;

    /// Send `bytes` to `pid`.
    ///
    /// # Errors
    ///
    /// [`EcdysisError::PeerUnreachable`](crate::EcdysisError::PeerUnreachable)
    /// when the target process is gone.
    async fn send(&self, pid: Pid, bytes: Vec<u8>) -> Result<()>;

    /// Wait for the next inbound message. Returns `None` once the endpoint is closed.
    async fn recv(&self) -> Option<Envelope>;
}

/// Encode and send one control message.
pub async fn send_message(
    transport: &dyn Transport,
    pid: Pid,
    operation: Operation,
    payload: &[u8],
) -> Result<()> {
    transport.send(pid, protocol::encode(operation, payload)).await
}

/// Queues messages from the local process into its own [`Inbox`].
#[derive(Debug, Clone)]
pub struct LocalSender {
    pid: Pid,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LocalSender {
    /// Pid that injected messages carry as their sender.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Queue `operation` for the local dispatch loop.
    ///
    /// Returns false if the loop has already stopped.
    pub fn inject(&self, operation: Operation, payload: Vec<u8>) -> bool {
        let envelope = Envelope {
            sender: self.pid,
            bytes: protocol::encode(operation, &payload),
        };
        if self.tx.send(envelope).is_err() {
            warn!(%operation, "Dispatch loop stopped, dropping local event");
            return false;
        }
        true
    }
}

/// The dispatch loop's single source of messages.
pub struct Inbox {
    transport: Arc<dyn Transport>,
    local_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    /// Create an inbox over `transport` and the sender used to inject local events.
    pub fn new(transport: Arc<dyn Transport>) -> (Self, LocalSender) {
        let (tx, local_rx) = mpsc::unbounded_channel();
        let sender = LocalSender {
            pid: transport.pid(),
            tx,
        };
        (
            Self {
                transport,
                local_rx,
            },
            sender,
        )
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Wait for the next message. Anything the transport already holds comes
    /// before queued local events.
    ///
    /// Returns `None` once the transport is closed and no local event is queued.
    pub async fn recv(&mut self) -> Option<Envelope> {
        // Both transports' `recv` are cancel safe, so an unready poll loses nothing.
        match self.transport.recv().now_or_never() {
            Some(Some(envelope)) => return Some(envelope),
            Some(None) => return self.local_rx.try_recv().ok(),
            None => {}
        }
        if let Ok(envelope) = self.local_rx.try_recv() {
            return Some(envelope);
        }
        tokio::select! {
            biased;
            Some(envelope) = self.local_rx.recv() => Some(envelope),
            envelope = self.transport.recv() => envelope,
        }
    }
}
