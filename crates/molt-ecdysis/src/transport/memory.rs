//! In-process transport for tests and single-process demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Envelope, Transport};
use crate::error::{EcdysisError, Result};
use crate::protocol::Pid;

type Routes = Arc<Mutex<HashMap<Pid, Route>>>;

#[derive(Debug)]
struct Route {
    endpoint_id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// A set of in-process endpoints addressable by pid.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    routes: Routes,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the endpoint for `pid`, replacing any previous one.
    pub fn endpoint(&self, pid: Pid) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint_id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, Route { endpoint_id, tx });
        MemoryTransport {
            pid,
            endpoint_id,
            routes: Arc::clone(&self.routes),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Simulate the death of `pid`: later sends to it fail and its endpoint sees end of stream.
    pub fn disconnect(&self, pid: Pid) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    pub fn is_connected(&self, pid: Pid) -> bool {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&pid)
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    pid: Pid,
    endpoint_id: u64,
    routes: Routes,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn pid(&self) -> Pid {
        self.pid
    }

    async fn send(&self, pid: Pid, bytes: Vec<u8>) -> Result<()> {
        let target = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .map(|route| route.tx.clone());
        let target = target.ok_or_else(|| EcdysisError::unreachable(pid, "no such endpoint"))?;
        target
            .send(Envelope {
                sender: self.pid,
                bytes,
            })
            .map_err(|_| EcdysisError::unreachable(pid, "endpoint closed"))
    }

    async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer endpoint may have replaced ours.
        if routes
            .get(&self.pid)
            .is_some_and(|route| route.endpoint_id == self.endpoint_id)
        {
            routes.remove(&self.pid);
        }
    }
}
