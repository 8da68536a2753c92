//! OS signal translation.
//!
//! - `SIGTERM` / `SIGINT` → local `Shutdown`
//! - `SIGQUIT` → local `Restart`
//!
//! Signals become ordinary control messages in the process's own inbox, so the
//! dispatch loop handles them like any other request.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::Operation;
use crate::transport::LocalSender;

/// Registered signal handlers feeding a local inbox.
pub struct SignalForwarder {
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
    local: LocalSender,
}

impl SignalForwarder {
    /// Register the handlers. Must be called inside a tokio runtime.
    pub fn install(local: LocalSender) -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigquit: signal(SignalKind::quit())?,
            local,
        })
    }

    /// Forward signals until `stop` is cancelled or the inbox is gone.
    pub async fn run(mut self, stop: CancellationToken) {
        loop {
            let operation = tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    Operation::Shutdown
                }
                _ = self.sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    Operation::Shutdown
                }
                _ = self.sigquit.recv() => {
                    info!("Received SIGQUIT, initiating graceful restart");
                    Operation::Restart
                }
            };
            if !self.local.inject(operation, Vec::new()) {
                break;
            }
        }
        debug!("Signal forwarder stopped");
    }
}

/// Install the handlers and forward in a background task.
pub fn forward_signals(local: LocalSender, stop: CancellationToken) -> Result<JoinHandle<()>> {
    let forwarder = SignalForwarder::install(local)?;
    Ok(tokio::spawn(forwarder.run(stop)))
}
