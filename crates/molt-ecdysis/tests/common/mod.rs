//! Test utilities for process group scenarios.
//!
//! Runs a whole group inside one tokio runtime: every "process" is a
//! [`Runtime`] on its own task, connected through a [`MemoryNetwork`].
//! [`ForkingSpawner`] stands in for re-exec and [`FakeHost`] for the
//! application, recording what each child was asked to do.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use molt_ecdysis::{
    Collaborators, HeartbeatPolicy, Inbox, Listener, ListenerEntry, ListenerSnapshot, LocalSender,
    LoopExit, ParentContact, Pid, ProcessRole, Result, Runtime, RuntimeConfig, Service,
    ServiceHost, ServiceRegistry, Spawner,
};
use molt_ecdysis::transport::MemoryNetwork;
use tokio::task::JoinHandle;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pid of the main process in every harness.
pub const MAIN_PID: Pid = 1;

/// Pid given to the first spawned child; later children count up from here.
pub const FIRST_CHILD_PID: Pid = 1000;

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Heartbeat policy fast enough for tests.
pub fn fast_policy() -> HeartbeatPolicy {
    HeartbeatPolicy {
        interval: Duration::from_millis(20),
        ..HeartbeatPolicy::default()
    }
}

pub fn runtime_config(policy: HeartbeatPolicy) -> RuntimeConfig {
    RuntimeConfig {
        heartbeat: policy,
        forward_signals: false,
    }
}

/// Poll `condition` until it holds or [`DEFAULT_TIMEOUT`] passes.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A listener that only records how it was stopped.
pub struct FakeListener {
    name: String,
    addr: String,
    drained: AtomicBool,
    closed: AtomicBool,
}

impl FakeListener {
    pub fn new(name: &str, addr: &str) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            drained: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn was_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for FakeListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> ListenerEntry {
        ListenerEntry::new(self.addr.clone(), None)
    }

    async fn shutdown(&self) {
        if !self.was_closed() {
            self.drained.store(true, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        if !self.was_drained() {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

struct FakeService {
    name: String,
    listeners: Vec<Arc<FakeListener>>,
}

impl Service for FakeService {
    fn name(&self) -> &str {
        &self.name
    }

    fn listeners(&self) -> Vec<Arc<dyn Listener>> {
        self.listeners
            .iter()
            .map(|l| Arc::clone(l) as Arc<dyn Listener>)
            .collect()
    }
}

/// Application stand-in. A cold start serves `http/public`; otherwise it
/// serves exactly the listeners it was handed.
pub struct FakeHost {
    services: Arc<ServiceRegistry>,
    started_with: Mutex<Option<ListenerSnapshot>>,
    listeners: Mutex<Vec<Arc<FakeListener>>>,
}

impl FakeHost {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            services,
            started_with: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn started_with(&self) -> Option<ListenerSnapshot> {
        self.started_with.lock().unwrap().clone()
    }

    pub fn listeners(&self) -> Vec<Arc<FakeListener>> {
        self.listeners.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceHost for FakeHost {
    async fn start(&self, snapshot: ListenerSnapshot) -> Result<()> {
        let mut wanted = snapshot.clone();
        if wanted.is_empty() {
            wanted.insert("http", "public", ListenerEntry::new("127.0.0.1:8080", None));
        }

        let mut by_service: HashMap<String, Vec<Arc<FakeListener>>> = HashMap::new();
        for (service, name, entry) in wanted.iter() {
            let listener = Arc::new(FakeListener::new(name, &entry.addr));
            self.listeners.lock().unwrap().push(Arc::clone(&listener));
            by_service
                .entry(service.to_string())
                .or_default()
                .push(listener);
        }
        for (name, listeners) in by_service {
            self.services
                .register(Arc::new(FakeService { name, listeners }));
        }

        *self.started_with.lock().unwrap() = Some(snapshot);
        Ok(())
    }

    fn snapshot(&self) -> ListenerSnapshot {
        self.services.snapshot()
    }
}

/// Handles onto a child started by [`ForkingSpawner`].
#[derive(Clone)]
pub struct ChildHandle {
    pub pid: Pid,
    pub host: Arc<FakeHost>,
    pub contact: Arc<ParentContact>,
    pub local: LocalSender,
    task: Arc<Mutex<Option<JoinHandle<LoopExit>>>>,
}

impl ChildHandle {
    /// Wait for the child's dispatch loop to finish.
    pub async fn join(&self) -> LoopExit {
        let task = self.task.lock().unwrap().take().expect("child already joined");
        tokio::time::timeout(DEFAULT_TIMEOUT, task)
            .await
            .expect("child did not exit in time")
            .expect("child task panicked")
    }
}

/// Starts children as in-process runtimes on the shared network.
#[derive(Clone)]
pub struct ForkingSpawner {
    network: MemoryNetwork,
    policy: HeartbeatPolicy,
    next_pid: Arc<AtomicU32>,
    children: Arc<Mutex<HashMap<Pid, ChildHandle>>>,
}

impl ForkingSpawner {
    pub fn new(network: MemoryNetwork, policy: HeartbeatPolicy) -> Self {
        Self {
            network,
            policy,
            next_pid: Arc::new(AtomicU32::new(FIRST_CHILD_PID)),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn child(&self, pid: Pid) -> ChildHandle {
        self.children
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| panic!("no child {pid}"))
    }

    pub fn spawned(&self) -> usize {
        self.children.lock().unwrap().len()
    }
}

#[async_trait]
impl Spawner for ForkingSpawner {
    async fn spawn(&self, snapshot: &ListenerSnapshot) -> Result<Pid> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let services = Arc::new(ServiceRegistry::new());
        let host = Arc::new(FakeHost::new(Arc::clone(&services)));
        let (inbox, local) = Inbox::new(Arc::new(self.network.endpoint(pid)));

        let collaborators = Collaborators::new(Arc::new(self.clone()))
            .with_host(host.clone(), services);
        let runtime = Runtime::new(
            ProcessRole::Child { parent: MAIN_PID },
            inbox,
            local.clone(),
            collaborators,
            runtime_config(self.policy),
        )?;
        runtime.start(snapshot)?;

        let contact = Arc::clone(runtime.parent_contact().expect("child runtime"));
        let task = tokio::spawn(runtime.run());
        self.children.lock().unwrap().insert(
            pid,
            ChildHandle {
                pid,
                host,
                contact,
                local,
                task: Arc::new(Mutex::new(Some(task))),
            },
        );
        Ok(pid)
    }
}

/// A running main process and its spawner.
pub struct Group {
    pub network: MemoryNetwork,
    pub spawner: ForkingSpawner,
    pub registry: Arc<molt_ecdysis::ProcessRegistry>,
    pub local: LocalSender,
    task: JoinHandle<LoopExit>,
}

impl Group {
    /// Start a main process and queue its bootstrap `Start`.
    pub fn start(policy: HeartbeatPolicy) -> Self {
        let network = MemoryNetwork::new();
        let spawner = ForkingSpawner::new(network.clone(), policy);
        let (inbox, local) = Inbox::new(Arc::new(network.endpoint(MAIN_PID)));

        let runtime = Runtime::new(
            ProcessRole::Main,
            inbox,
            local.clone(),
            Collaborators::new(Arc::new(spawner.clone())),
            runtime_config(policy),
        )
        .expect("main runtime");
        let registry = Arc::clone(runtime.registry().expect("main runtime"));
        runtime.start(&ListenerSnapshot::new()).expect("bootstrap start");

        Self {
            network,
            spawner,
            registry,
            local,
            task: tokio::spawn(runtime.run()),
        }
    }

    /// Wait for the main's dispatch loop to finish.
    pub async fn join(self) -> LoopExit {
        tokio::time::timeout(DEFAULT_TIMEOUT, self.task)
            .await
            .expect("main did not exit in time")
            .expect("main task panicked")
    }
}
