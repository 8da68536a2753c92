//! Assembly of one process: role, dispatcher and background tasks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::GroupConfig;
use crate::dispatcher::{Dispatcher, LoopExit};
use crate::error::{EcdysisError, Result};
use crate::heartbeat::{ChildHeartbeat, HeartbeatPolicy, MainHeartbeat, ParentContact};
use crate::process::{ProcessRole, Spawner};
use crate::protocol::{Operation, Pid};
use crate::registry::ProcessRegistry;
use crate::role::{ChildRole, MainRole, Role};
use crate::shutdown::{ServiceHost, ServiceRegistry};
use crate::signals::forward_signals;
use crate::snapshot::ListenerSnapshot;
use crate::transport::{Inbox, LocalSender, Transport};

/// What a process needs besides its transport.
pub struct Collaborators {
    pub spawner: Arc<dyn Spawner>,
    pub clock: Arc<dyn Clock>,
    /// Required for children
    pub host: Option<Arc<dyn ServiceHost>>,
    pub services: Arc<ServiceRegistry>,
}

impl Collaborators {
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            clock: Arc::new(SystemClock),
            host: None,
            services: Arc::new(ServiceRegistry::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_host(mut self, host: Arc<dyn ServiceHost>, services: Arc<ServiceRegistry>) -> Self {
        self.host = Some(host);
        self.services = services;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub heartbeat: HeartbeatPolicy,
    /// Translate SIGTERM, SIGINT and SIGQUIT into control messages
    pub forward_signals: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatPolicy::default(),
            forward_signals: true,
        }
    }
}

impl From<&GroupConfig> for RuntimeConfig {
    fn from(config: &GroupConfig) -> Self {
        Self {
            heartbeat: config.heartbeat,
            forward_signals: true,
        }
    }
}

enum Monitor {
    Main(MainHeartbeat),
    Child {
        heartbeat: ChildHeartbeat,
        stop: CancellationToken,
    },
}

/// One member of a process group, ready to run.
pub struct Runtime {
    role: ProcessRole,
    dispatcher: Dispatcher,
    inbox: Inbox,
    local: LocalSender,
    monitor: Monitor,
    config: RuntimeConfig,
}

impl Runtime {
    /// Build the role, dispatcher and heartbeat for `role`.
    ///
    /// `local` must be the sender paired with `inbox`.
    ///
    /// # Errors
    ///
    /// [`EcdysisError::Config`] for a child without a service host.
    pub fn new(
        role: ProcessRole,
        inbox: Inbox,
        local: LocalSender,
        collaborators: Collaborators,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let transport = Arc::clone(inbox.transport());
        let Collaborators {
            spawner,
            clock,
            host,
            services,
        } = collaborators;

        let (handlers, monitor) = match role {
            ProcessRole::Main => {
                let main = MainRole::new(
                    Arc::clone(&transport),
                    spawner,
                    Arc::clone(&clock),
                    local.clone(),
                );
                let heartbeat = MainHeartbeat::new(
                    Arc::clone(main.registry()),
                    Arc::clone(main.heartbeat_state()),
                    transport,
                    clock,
                    config.heartbeat,
                    local.clone(),
                );
                (Role::Main(main), Monitor::Main(heartbeat))
            }
            ProcessRole::Child { parent } => {
                let host = host.ok_or_else(|| EcdysisError::config("child process needs a service host"))?;
                let child = ChildRole::new(
                    parent,
                    Arc::clone(&transport),
                    host,
                    services,
                    spawner,
                    Arc::clone(&clock),
                    local.clone(),
                );
                let heartbeat = ChildHeartbeat::new(
                    parent,
                    Arc::clone(child.parent_contact()),
                    transport,
                    clock,
                    config.heartbeat,
                );
                let stop = child.heartbeat_stop();
                (Role::Child(child), Monitor::Child { heartbeat, stop })
            }
        };

        Ok(Self {
            role,
            dispatcher: Dispatcher::new(handlers),
            inbox,
            local,
            monitor,
            config,
        })
    }

    pub fn pid(&self) -> Pid {
        self.dispatcher.role().pid()
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn local_sender(&self) -> LocalSender {
        self.local.clone()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.inbox.transport()
    }

    /// The child table. Main only.
    pub fn registry(&self) -> Option<&Arc<ProcessRegistry>> {
        match self.dispatcher.role() {
            Role::Main(main) => Some(main.registry()),
            Role::Child(_) => None,
        }
    }

    /// Last contact with the parent. Child only.
    pub fn parent_contact(&self) -> Option<&Arc<ParentContact>> {
        match self.dispatcher.role() {
            Role::Main(_) => None,
            Role::Child(child) => Some(child.parent_contact()),
        }
    }

    /// Queue the bootstrap `Start` carrying `snapshot`.
    pub fn start(&self, snapshot: &ListenerSnapshot) -> Result<()> {
        let payload = if snapshot.is_empty() {
            Vec::new()
        } else {
            snapshot.to_bytes()?
        };
        if !self.local.inject(Operation::Start, payload) {
            return Err(EcdysisError::TransportClosed);
        }
        Ok(())
    }

    /// Run until the dispatch loop exits, then stop the background tasks.
    pub async fn run(self) -> LoopExit {
        let span = info_span!("molt", role = %self.role, pid = self.pid());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> LoopExit {
        let Runtime {
            dispatcher,
            mut inbox,
            local,
            monitor,
            config,
            ..
        } = self;

        let (heartbeat_task, heartbeat_stop) = match monitor {
            Monitor::Main(heartbeat) => {
                let stop = CancellationToken::new();
                let task = tokio::spawn(heartbeat.run(stop.clone()).in_current_span());
                (task, stop)
            }
            Monitor::Child { heartbeat, stop } => {
                let lost = dispatcher.parent_lost();
                let task = tokio::spawn(heartbeat.run(lost, stop.clone()).in_current_span());
                (task, stop)
            }
        };

        let signal_stop = CancellationToken::new();
        let signal_task = if config.forward_signals {
            match forward_signals(local, signal_stop.clone()) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "Failed to install signal handlers");
                    None
                }
            }
        } else {
            None
        };

        let exit = dispatcher.run(&mut inbox).await;

        heartbeat_stop.cancel();
        signal_stop.cancel();
        if let Err(e) = heartbeat_task.await {
            warn!(error = %e, "Heartbeat task failed");
        }
        if let Some(task) = signal_task {
            if let Err(e) = task.await {
                warn!(error = %e, "Signal task failed");
            }
        }
        exit
    }
}
