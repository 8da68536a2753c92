//! Heartbeat-based liveness detection.
//!
//! The main watches every child it knows about, a child watches its one
//! parent. Both sides share [`HeartbeatPolicy`]: a peer is gone once nothing
//! has been heard from it for strictly longer than the timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::protocol::{self, Operation, Pid};
use crate::registry::ProcessRegistry;
use crate::transport::{send_message, LocalSender, Transport};

/// Default interval between heartbeat ticks.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default silence after which a peer is considered gone.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Shortest interval a policy accepts.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Timing shared by the main and child monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub timeout_ms: u64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: HEARTBEAT_INTERVAL,
            timeout_ms: HEARTBEAT_TIMEOUT_MS,
        }
    }
}

impl HeartbeatPolicy {
    /// Build a policy, see [`HeartbeatPolicy::clamped`].
    pub fn new(interval: Duration, timeout_ms: u64) -> Self {
        Self {
            interval,
            timeout_ms,
        }
        .clamped()
    }

    /// Raise the interval to at least [`MIN_HEARTBEAT_INTERVAL`] and the
    /// timeout to at least two intervals.
    pub fn clamped(self) -> Self {
        let interval = self.interval.max(MIN_HEARTBEAT_INTERVAL);
        let floor_ms = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(2);
        Self {
            interval,
            timeout_ms: self.timeout_ms.max(floor_ms),
        }
    }

    /// True when `now_ms - last_ms` exceeds the timeout.
    pub fn is_expired(&self, last_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(last_ms) > self.timeout_ms
    }
}

/// Whether timeout checks are live. Arms once, never disarms.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    armed: AtomicBool,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the monitor. Returns true only for the call that armed it.
    pub fn arm(&self) -> bool {
        !self.armed.swap(true, Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

/// When a child last heard from its parent, in milliseconds.
#[derive(Debug)]
pub struct ParentContact {
    last_contact_ms: AtomicU64,
}

impl ParentContact {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_contact_ms: AtomicU64::new(now_ms),
        }
    }

    /// Record contact at `now_ms`. Never moves backwards.
    pub fn touch(&self, now_ms: u64) {
        self.last_contact_ms.fetch_max(now_ms, Ordering::SeqCst);
    }

    pub fn last_contact_ms(&self) -> u64 {
        self.last_contact_ms.load(Ordering::SeqCst)
    }
}

/// Main-side monitor: evicts silent children and heartbeats the rest.
pub struct MainHeartbeat {
    registry: Arc<ProcessRegistry>,
    state: Arc<HeartbeatState>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: HeartbeatPolicy,
    local: LocalSender,
}

impl MainHeartbeat {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        state: Arc<HeartbeatState>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        policy: HeartbeatPolicy,
        local: LocalSender,
    ) -> Self {
        Self {
            registry,
            state,
            transport,
            clock,
            policy: policy.clamped(),
            local,
        }
    }

    /// One heartbeat round. Returns the pids removed during it.
    ///
    /// Does nothing until the heartbeat has been armed.
    pub async fn tick(&self) -> Vec<Pid> {
        if !self.state.is_armed() {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        let mut removed = self.check(now);
        removed.extend(self.broadcast(now).await);
        removed
    }

    /// Evict every child silent for longer than the timeout.
    pub fn check(&self, now_ms: u64) -> Vec<Pid> {
        let evicted = self.registry.evict_expired(now_ms, self.policy.timeout_ms);
        for &pid in &evicted {
            warn!(
                child = pid,
                timeout_ms = self.policy.timeout_ms,
                "Child heartbeat timed out, evicting"
            );
            self.notify_removed(pid);
        }
        evicted
    }

    /// Send `Heartbeat(now)` to every registered child.
    ///
    /// Children that turn out to be gone are evicted on the spot.
    pub async fn broadcast(&self, now_ms: u64) -> Vec<Pid> {
        let payload = protocol::encode_timestamp(now_ms);
        let mut gone = Vec::new();
        for pid in self.registry.pids() {
            match send_message(&*self.transport, pid, Operation::Heartbeat, &payload).await {
                Ok(()) => trace!(child = pid, "Heartbeat sent"),
                Err(e) if e.is_peer_gone() => {
                    warn!(child = pid, error = %e, "Child unreachable, evicting");
                    self.registry.remove(pid);
                    self.notify_removed(pid);
                    gone.push(pid);
                }
                Err(e) => warn!(child = pid, error = %e, "Failed to send heartbeat"),
            }
        }
        gone
    }

    fn notify_removed(&self, pid: Pid) {
        self.local
            .inject(Operation::RemoveChild, protocol::encode_pid(pid));
    }

    /// Tick every interval until `stop` is cancelled.
    pub async fn run(self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_ms = self.policy.interval.as_millis() as u64, "Main heartbeat started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("Main heartbeat stopped");
    }
}

/// Result of one child-side heartbeat round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    ParentLost,
}

/// Child-side monitor: watches the parent and keeps the main's record fresh.
///
/// Armed from construction.
pub struct ChildHeartbeat {
    parent: Pid,
    contact: Arc<ParentContact>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: HeartbeatPolicy,
}

impl ChildHeartbeat {
    pub fn new(
        parent: Pid,
        contact: Arc<ParentContact>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        policy: HeartbeatPolicy,
    ) -> Self {
        Self {
            parent,
            contact,
            transport,
            clock,
            policy: policy.clamped(),
        }
    }

    /// One heartbeat round.
    pub async fn tick(&self) -> HeartbeatOutcome {
        let now = self.clock.now_ms();
        let last = self.contact.last_contact_ms();
        if self.policy.is_expired(last, now) {
            warn!(
                parent = self.parent,
                silent_ms = now.saturating_sub(last),
                "No contact from parent within heartbeat timeout"
            );
            return HeartbeatOutcome::ParentLost;
        }

        let payload = protocol::encode_timestamp(now);
        match send_message(&*self.transport, self.parent, Operation::Heartbeat, &payload).await {
            Ok(()) => {
                trace!(parent = self.parent, "Heartbeat sent");
                HeartbeatOutcome::Alive
            }
            Err(e) if e.is_peer_gone() => {
                warn!(parent = self.parent, error = %e, "Parent unreachable");
                HeartbeatOutcome::ParentLost
            }
            Err(e) => {
                warn!(parent = self.parent, error = %e, "Failed to send heartbeat");
                HeartbeatOutcome::Alive
            }
        }
    }

    /// Tick every interval until the parent is lost or `stop` is cancelled.
    ///
    /// Cancels `parent_lost` when the parent is declared gone.
    pub async fn run(self, parent_lost: CancellationToken, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(parent = self.parent, "Child heartbeat started");

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if self.tick().await == HeartbeatOutcome::ParentLost {
                        info!(parent = self.parent, "Parent lost, terminating");
                        parent_lost.cancel();
                        break;
                    }
                }
            }
        }
        debug!("Child heartbeat stopped");
    }
}
