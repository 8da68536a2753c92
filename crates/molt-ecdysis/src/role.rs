//! Role-specific message handlers.
//!
//! A process is either the group's main or one of its children, resolved once
//! at startup. Each role owns its state and handles the operations that
//! [`RoleKind::accepts`] routes to it.
//!
//! | op            | main                                  | child                              |
//! |---------------|---------------------------------------|------------------------------------|
//! | start         | spawn the first child                 | adopt or bind listeners, announce  |
//! | restart       | forward to every child                | spawn replacement, announce, drain |
//! | shutdown      | forward to every child, exit          | drain, report removal, exit        |
//! | new-fork      | track the announced child             | -                                  |
//! | remove-child  | forget the child, exit if none remain | -                                  |
//! | heartbeat     | liveness only                         | liveness only                      |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::dispatcher::{Flow, LoopExit};
use crate::error::{EcdysisError, Result};
use crate::heartbeat::{HeartbeatState, ParentContact};
use crate::process::Spawner;
use crate::protocol::{self, ControlMessage, Operation, Pid};
use crate::registry::ProcessRegistry;
use crate::shutdown::{ServiceHost, ServiceRegistry, ShutdownCoordinator};
use crate::snapshot::ListenerSnapshot;
use crate::transport::{send_message, LocalSender, Transport};

/// Which handler table a process uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Main,
    Child,
}

impl RoleKind {
    /// Whether this role handles `operation` at all.
    pub fn accepts(self, operation: Operation) -> bool {
        match self {
            RoleKind::Main => true,
            RoleKind::Child => matches!(
                operation,
                Operation::Start | Operation::Restart | Operation::Heartbeat | Operation::Shutdown
            ),
        }
    }
}

/// The handler set of this process.
pub enum Role {
    Main(MainRole),
    Child(ChildRole),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Main(_) => RoleKind::Main,
            Role::Child(_) => RoleKind::Child,
        }
    }

    pub fn pid(&self) -> Pid {
        match self {
            Role::Main(main) => main.pid,
            Role::Child(child) => child.pid,
        }
    }

    /// Liveness bookkeeping for a message from `sender`.
    pub fn observe(&self, sender: Pid) {
        match self {
            Role::Main(main) => main.observe(sender),
            Role::Child(child) => child.observe(sender),
        }
    }

    pub async fn handle(&self, message: &ControlMessage) -> Result<Flow> {
        match self {
            Role::Main(main) => main.handle(message).await,
            Role::Child(child) => child.handle(message).await,
        }
    }

    /// Token cancelled once the parent is known to be gone. Never fires for the main.
    pub fn parent_lost(&self) -> CancellationToken {
        match self {
            Role::Main(_) => CancellationToken::new(),
            Role::Child(child) => child.parent_lost.clone(),
        }
    }

    /// Called when the loop ends because the parent is gone.
    pub fn on_parent_lost(&self) {
        if let Role::Child(child) = self {
            child.coordinator.force_close_all();
        }
    }
}

/// The supervising process.
pub struct MainRole {
    pid: Pid,
    registry: Arc<ProcessRegistry>,
    heartbeat: Arc<HeartbeatState>,
    transport: Arc<dyn Transport>,
    spawner: Arc<dyn Spawner>,
    clock: Arc<dyn Clock>,
    local: LocalSender,
}

impl MainRole {
    pub fn new(
        transport: Arc<dyn Transport>,
        spawner: Arc<dyn Spawner>,
        clock: Arc<dyn Clock>,
        local: LocalSender,
    ) -> Self {
        Self {
            pid: transport.pid(),
            registry: Arc::new(ProcessRegistry::new()),
            heartbeat: Arc::new(HeartbeatState::new()),
            transport,
            spawner,
            clock,
            local,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn heartbeat_state(&self) -> &Arc<HeartbeatState> {
        &self.heartbeat
    }

    fn observe(&self, sender: Pid) {
        if sender != self.pid {
            self.registry.record_contact(sender, self.clock.now_ms());
        }
    }

    async fn handle(&self, message: &ControlMessage) -> Result<Flow> {
        match message.operation {
            Operation::Start => self.on_start(message).await,
            Operation::Restart => self.on_restart().await,
            Operation::Shutdown => self.on_shutdown().await,
            Operation::NewFork => self.on_new_fork(message),
            Operation::RemoveChild => self.on_remove_child(message),
            Operation::Heartbeat => {
                let sent_at = protocol::decode_timestamp(&message.payload)?;
                trace!(child = message.sender, sent_at, "Heartbeat from child");
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_start(&self, message: &ControlMessage) -> Result<Flow> {
        let snapshot = ListenerSnapshot::from_bytes(&message.payload)?;
        let pid = self.spawner.spawn(&snapshot).await?;
        self.registry.expect(pid, self.clock.now_ms());
        info!(child = pid, listeners = snapshot.len(), "Started first child");
        self.arm_heartbeat();
        Ok(Flow::Continue)
    }

    async fn on_restart(&self) -> Result<Flow> {
        if !self.heartbeat.is_armed() {
            warn!("Restart requested before any child started, ignoring");
            return Ok(Flow::Continue);
        }
        info!(children = self.registry.size(), "Forwarding restart to children");
        // A pending child is already the product of a restart.
        self.forward(Operation::Restart, self.registry.pids()).await;
        Ok(Flow::Continue)
    }

    async fn on_shutdown(&self) -> Result<Flow> {
        info!(
            children = self.registry.size(),
            pending = self.registry.has_pending(),
            "Shutting down process group"
        );
        self.forward(Operation::Shutdown, self.registry.all_pids()).await;
        Ok(Flow::Exit(LoopExit::Shutdown))
    }

    fn on_new_fork(&self, message: &ControlMessage) -> Result<Flow> {
        let pid = message.pid_or_sender()?;
        if pid == message.sender {
            info!(child = pid, "Child announced itself");
        } else if self.registry.contains(pid) {
            debug!(child = pid, announced_by = message.sender, "Replacement already known");
        } else {
            self.registry.expect(pid, self.clock.now_ms());
            info!(child = pid, announced_by = message.sender, "Replacement child announced");
        }
        self.arm_heartbeat();
        Ok(Flow::Continue)
    }

    fn on_remove_child(&self, message: &ControlMessage) -> Result<Flow> {
        let pid = message.pid_or_sender()?;
        if self.registry.remove(pid).is_some() {
            info!(child = pid, remaining = self.registry.size(), "Child removed");
        } else {
            debug!(child = pid, "Removal of unknown child");
        }

        if self.registry.is_settled_empty() {
            info!("All children gone");
            return Ok(Flow::Exit(LoopExit::AllChildrenGone));
        }
        Ok(Flow::Continue)
    }

    fn arm_heartbeat(&self) {
        if self.heartbeat.arm() {
            info!("Heartbeat armed");
        }
    }

    async fn forward(&self, operation: Operation, pids: Vec<Pid>) {
        for pid in pids {
            match send_message(&*self.transport, pid, operation, &[]).await {
                Ok(()) => debug!(child = pid, %operation, "Forwarded to child"),
                // A pending child may not have bound its endpoint yet.
                Err(e) if e.is_peer_gone() && self.registry.is_pending(pid) => {
                    warn!(child = pid, %operation, error = %e, "Pending child not reachable yet")
                }
                Err(e) if e.is_peer_gone() => self.evict(pid, &e),
                Err(e) => warn!(child = pid, %operation, error = %e, "Failed to forward"),
            }
        }
    }

    fn evict(&self, pid: Pid, cause: &EcdysisError) {
        warn!(child = pid, error = %cause, "Child unreachable, evicting");
        self.registry.remove(pid);
        self.local
            .inject(Operation::RemoveChild, protocol::encode_pid(pid));
    }
}

/// A worker process holding listeners.
pub struct ChildRole {
    pid: Pid,
    parent: Pid,
    contact: Arc<ParentContact>,
    started: AtomicBool,
    restarting: AtomicBool,
    transport: Arc<dyn Transport>,
    host: Arc<dyn ServiceHost>,
    coordinator: ShutdownCoordinator,
    spawner: Arc<dyn Spawner>,
    clock: Arc<dyn Clock>,
    local: LocalSender,
    parent_lost: CancellationToken,
    heartbeat_stop: CancellationToken,
}

impl ChildRole {
    pub fn new(
        parent: Pid,
        transport: Arc<dyn Transport>,
        host: Arc<dyn ServiceHost>,
        services: Arc<ServiceRegistry>,
        spawner: Arc<dyn Spawner>,
        clock: Arc<dyn Clock>,
        local: LocalSender,
    ) -> Self {
        Self {
            pid: transport.pid(),
            parent,
            contact: Arc::new(ParentContact::new(clock.now_ms())),
            started: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            transport,
            host,
            coordinator: ShutdownCoordinator::new(services),
            spawner,
            clock,
            local,
            parent_lost: CancellationToken::new(),
            heartbeat_stop: CancellationToken::new(),
        }
    }

    pub fn parent(&self) -> Pid {
        self.parent
    }

    pub fn parent_contact(&self) -> &Arc<ParentContact> {
        &self.contact
    }

    /// Cancelled when the child stops heartbeating its parent.
    pub fn heartbeat_stop(&self) -> CancellationToken {
        self.heartbeat_stop.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn observe(&self, sender: Pid) {
        if sender == self.parent {
            self.contact.touch(self.clock.now_ms());
        }
    }

    async fn handle(&self, message: &ControlMessage) -> Result<Flow> {
        match message.operation {
            Operation::Start => self.on_start(message).await,
            Operation::Restart => self.on_restart().await,
            Operation::Shutdown => self.on_shutdown().await,
            Operation::Heartbeat => {
                let sent_at = protocol::decode_timestamp(&message.payload)?;
                trace!(parent = message.sender, sent_at, "Heartbeat from parent");
                Ok(Flow::Continue)
            }
            operation @ (Operation::NewFork | Operation::RemoveChild) => {
                debug!(%operation, "Not handled by children");
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_start(&self, message: &ControlMessage) -> Result<Flow> {
        if self.is_started() {
            warn!("Start received twice, ignoring");
            return Ok(Flow::Continue);
        }
        let snapshot = ListenerSnapshot::from_bytes(&message.payload)?;
        let inherited = snapshot.iter().filter(|(_, _, e)| e.fd.is_some()).count();
        self.host.start(snapshot).await?;
        self.started.store(true, Ordering::SeqCst);
        info!(inherited, "Child started serving");

        self.notify_parent(Operation::NewFork, protocol::encode_pid(self.pid))
            .await;
        Ok(Flow::Continue)
    }

    async fn on_restart(&self) -> Result<Flow> {
        if !self.is_started() {
            warn!("Restart requested before start, ignoring");
            return Ok(Flow::Continue);
        }
        if self.restarting.swap(true, Ordering::SeqCst) {
            warn!("Restart already in progress, ignoring");
            return Ok(Flow::Continue);
        }

        let snapshot = self.host.snapshot();
        let replacement = match self.spawner.spawn(&snapshot).await {
            Ok(pid) => pid,
            Err(e) => {
                self.restarting.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(replacement, listeners = snapshot.len(), "Spawned replacement child");

        self.notify_parent(Operation::NewFork, protocol::encode_pid(replacement))
            .await;
        self.local.inject(Operation::Shutdown, Vec::new());
        Ok(Flow::Continue)
    }

    async fn on_shutdown(&self) -> Result<Flow> {
        info!("Child shutting down");
        self.heartbeat_stop.cancel();
        self.coordinator.drain_all().await;

        if let Err(e) = send_message(
            &*self.transport,
            self.parent,
            Operation::RemoveChild,
            &protocol::encode_pid(self.pid),
        )
        .await
        {
            debug!(parent = self.parent, error = %e, "Could not report removal to parent");
        }
        Ok(Flow::Exit(LoopExit::Shutdown))
    }

    async fn notify_parent(&self, operation: Operation, payload: Vec<u8>) {
        match send_message(&*self.transport, self.parent, operation, &payload).await {
            Ok(()) => debug!(parent = self.parent, %operation, "Notified parent"),
            Err(e) if e.is_peer_gone() => {
                warn!(parent = self.parent, error = %e, "Parent unreachable");
                self.parent_lost.cancel();
            }
            Err(e) => warn!(parent = self.parent, %operation, error = %e, "Failed to notify parent"),
        }
    }
}
