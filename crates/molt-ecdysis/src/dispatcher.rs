//! The message-receive loop.
//!
//! Every inbound envelope goes through the same steps:
//!
//! 1. decode; undecodable messages are logged and dropped
//! 2. [`Dispatcher::observe`], the one place liveness is recorded
//! 3. route to the role if it [accepts](crate::RoleKind::accepts) the operation
//!
//! Handler errors are logged; only the terminal transitions end the loop.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{ControlMessage, Pid};
use crate::role::Role;
use crate::transport::{Envelope, Inbox};

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A shutdown was handled
    Shutdown,
    /// Main only: the last child departed and none is pending
    AllChildrenGone,
    /// Child only: no contact from the parent within the heartbeat timeout
    ParentLost,
    /// The transport stopped delivering messages
    TransportClosed,
}

/// What the loop does after one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(LoopExit),
}

/// Decodes, observes and routes control messages for one role.
pub struct Dispatcher {
    role: Role,
    parent_lost: CancellationToken,
}

impl Dispatcher {
    pub fn new(role: Role) -> Self {
        let parent_lost = role.parent_lost();
        Self { role, parent_lost }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Token that ends the loop with [`LoopExit::ParentLost`] when cancelled.
    pub fn parent_lost(&self) -> CancellationToken {
        self.parent_lost.clone()
    }

    /// Record that a message arrived from `sender`.
    pub fn observe(&self, sender: Pid) {
        self.role.observe(sender);
    }

    /// Handle one envelope.
    pub async fn process(&self, envelope: Envelope) -> Flow {
        let message = match ControlMessage::decode_from(envelope.sender, &envelope.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(sender = envelope.sender, error = %e, "Discarding undecodable message");
                return Flow::Continue;
            }
        };

        self.observe(message.sender);

        let operation = message.operation;
        if !self.role.kind().accepts(operation) {
            warn!(
                sender = message.sender,
                %operation,
                role = ?self.role.kind(),
                "Operation not handled by this role, discarding"
            );
            return Flow::Continue;
        }

        debug!(sender = message.sender, %operation, "Dispatching");
        match self.role.handle(&message).await {
            Ok(flow) => flow,
            Err(e) => {
                error!(sender = message.sender, %operation, error = %e, "Handler failed");
                Flow::Continue
            }
        }
    }

    /// Process messages until a terminal transition.
    pub async fn run(&self, inbox: &mut Inbox) -> LoopExit {
        info!(pid = self.role.pid(), role = ?self.role.kind(), "Dispatch loop started");
        let exit = loop {
            let envelope = tokio::select! {
                biased;
                _ = self.parent_lost.cancelled() => {
                    self.role.on_parent_lost();
                    break LoopExit::ParentLost;
                }
                envelope = inbox.recv() => envelope,
            };

            let Some(envelope) = envelope else {
                warn!("Transport closed");
                break LoopExit::TransportClosed;
            };

            if let Flow::Exit(exit) = self.process(envelope).await {
                break exit;
            }
        };
        info!(?exit, "Dispatch loop stopped");
        exit
    }
}
