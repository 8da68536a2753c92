//! Listening sockets: adoption from inherited descriptors and managed serving.
//!
//! A [`ManagedListener`] owns the serve task for one TCP listener plus a
//! duplicate of its descriptor, which is what restart snapshots hand to the
//! next child. Releasing that duplicate on shutdown leaves the socket open
//! only in processes still serving it.

use std::future::Future;
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EcdysisError, Result};
use crate::shutdown::{Listener, Service};
use crate::snapshot::ListenerEntry;

/// Default time a graceful shutdown may take before the serve task is aborted.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wrap an inherited descriptor as a tokio listener.
///
/// Takes ownership of `fd`.
///
/// # Errors
///
/// [`EcdysisError::Listener`] if `fd` is not an open socket.
pub fn adopt_tcp_listener(fd: RawFd) -> Result<TcpListener> {
    if !validate_fd(fd) {
        return Err(EcdysisError::listener(format!(
            "inherited fd {fd} is not a valid socket"
        )));
    }

    // SAFETY: fstat confirmed fd is an open socket, and the caller hands it over.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;

    let addr = listener.local_addr().ok();
    info!(fd, addr = ?addr, "Adopted inherited listener");
    Ok(listener)
}

/// Adopt the entry's descriptor if it has one, otherwise bind its address.
pub async fn adopt_or_bind(entry: &ListenerEntry) -> Result<TcpListener> {
    match entry.fd {
        Some(fd) => adopt_tcp_listener(fd),
        None => {
            let listener = TcpListener::bind(&entry.addr).await.map_err(|e| {
                EcdysisError::listener(format!("cannot bind {}: {e}", entry.addr))
            })?;
            info!(addr = %entry.addr, "Bound new listener");
            Ok(listener)
        }
    }
}

/// Validate that a file descriptor is a valid socket using fstat.
fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// One listener and the task serving it.
pub struct ManagedListener {
    name: String,
    addr: String,
    inheritable: Mutex<Option<OwnedFd>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    abort: AbortHandle,
    drain_timeout: Duration,
    draining: AtomicBool,
    closed: AtomicBool,
}

impl ManagedListener {
    /// Start serving `listener` with `serve`.
    ///
    /// `serve` must stop accepting once its token is cancelled and return when
    /// in-flight work is done.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        listener: TcpListener,
        drain_timeout: Duration,
        serve: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(TcpListener, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let addr = listener.local_addr()?.to_string();
        let inheritable = listener.as_fd().try_clone_to_owned()?;
        let stop = CancellationToken::new();

        let task = tokio::spawn(serve(listener, stop.clone()));
        let abort = task.abort_handle();
        info!(listener = %name, %addr, "Listener serving");

        Ok(Arc::new(Self {
            name,
            addr,
            inheritable: Mutex::new(Some(inheritable)),
            stop,
            task: Mutex::new(Some(task)),
            abort,
            drain_timeout,
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn release_fd(&self) {
        let fd = self
            .inheritable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(fd) = fd {
            debug!(listener = %self.name, fd = fd.as_raw_fd(), "Released inheritable descriptor");
        }
    }
}

#[async_trait]
impl Listener for ManagedListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> ListenerEntry {
        let fd = self
            .inheritable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(AsRawFd::as_raw_fd);
        ListenerEntry::new(self.addr.clone(), fd)
    }

    async fn shutdown(&self) {
        if self.closed.load(Ordering::SeqCst) || self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(listener = %self.name, timeout = ?self.drain_timeout, "Draining listener");
        self.release_fd();
        self.stop.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match tokio::time::timeout(self.drain_timeout, task).await {
                Ok(Ok(())) => info!(listener = %self.name, "Listener drained"),
                Ok(Err(e)) if e.is_cancelled() => {
                    debug!(listener = %self.name, "Listener closed during drain")
                }
                Ok(Err(e)) => warn!(listener = %self.name, error = %e, "Serve task failed"),
                Err(_) => {
                    warn!(listener = %self.name, "Drain timeout exceeded, aborting serve task");
                    self.abort.abort();
                }
            }
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(listener = %self.name, "Closing listener");
        self.release_fd();
        self.stop.cancel();
        self.abort.abort();
    }
}

/// A named service made of managed listeners.
pub struct ListenerGroup {
    name: String,
    listeners: RwLock<Vec<Arc<ManagedListener>>>,
}

impl ListenerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<ManagedListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn managed(&self) -> Vec<Arc<ManagedListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Service for ListenerGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.managed()
            .into_iter()
            .map(|l| l as Arc<dyn Listener>)
            .collect()
    }
}
