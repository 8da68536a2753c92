//! Listener shutdown coordination.
//!
//! Two ways to stop serving, applied to every listener of every registered service:
//! - [`ShutdownCoordinator::drain_all`]: stop accepting, let in-flight work finish, then close
//! - [`ShutdownCoordinator::force_close_all`]: close immediately
//!
//! Neither exits the process; that is the dispatch loop's decision.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info};

use crate::error::Result;
use crate::snapshot::{ListenerEntry, ListenerSnapshot};

/// A listening socket and the serve loop behind it.
///
/// Implementations must make `shutdown` and `close` idempotent.
#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    /// Address and inheritable descriptor, for restart snapshots.
    fn describe(&self) -> ListenerEntry;

    /// Stop accepting, wait for in-flight work, then close.
    async fn shutdown(&self);

    /// Close immediately, abandoning in-flight work.
    fn close(&self);
}

/// A named set of listeners served by one application.
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    fn listeners(&self) -> Vec<Arc<dyn Listener>>;
}

/// Every service run by this process.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn Service>) {
        debug!(service = service.name(), "Registered service");
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(service);
    }

    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All listeners across all services.
    pub fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.services()
            .iter()
            .flat_map(|service| service.listeners())
            .collect()
    }

    /// Describe every listener for a restart hand-off.
    pub fn snapshot(&self) -> ListenerSnapshot {
        let mut snapshot = ListenerSnapshot::new();
        for service in self.services() {
            for listener in service.listeners() {
                snapshot.insert(service.name(), listener.name(), listener.describe());
            }
        }
        snapshot
    }
}

/// The application side of a child process.
#[async_trait]
pub trait ServiceHost: Send + Sync {
    /// Adopt the listeners described by `snapshot`, bind any that are missing,
    /// and start serving.
    async fn start(&self, snapshot: ListenerSnapshot) -> Result<()>;

    /// Describe the listeners currently being served.
    fn snapshot(&self) -> ListenerSnapshot;
}

/// Drains or closes every listener in a [`ServiceRegistry`].
#[derive(Clone)]
pub struct ShutdownCoordinator {
    services: Arc<ServiceRegistry>,
}

impl ShutdownCoordinator {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self { services }
    }

    /// Gracefully shut down every listener, concurrently, and wait for all of them.
    pub async fn drain_all(&self) {
        let listeners = self.services.listeners();
        info!(listeners = listeners.len(), "Draining all listeners");
        join_all(listeners.iter().map(|listener| listener.shutdown())).await;
        info!("All listeners drained");
    }

    /// Close every listener without waiting for in-flight work.
    pub fn force_close_all(&self) {
        let listeners = self.services.listeners();
        info!(listeners = listeners.len(), "Force-closing all listeners");
        for listener in &listeners {
            listener.close();
        }
    }
}
