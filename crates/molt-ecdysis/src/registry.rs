//! Child process registry kept by the main process.
//!
//! Tracks every child the main believes alive, keyed by pid, with the time it
//! was first and last heard from. Children that were spawned or announced but
//! have not sent anything yet are kept separately as *pending*; while any are
//! pending the group is mid-restart and must not exit.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::protocol::Pid;

/// Liveness record for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRecord {
    pub pid: Pid,
    pub first_seen_at_ms: u64,
    pub last_seen_at_ms: u64,
}

#[derive(Debug, Default)]
struct Table {
    live: HashMap<Pid, ChildRecord>,
    /// Pid -> time it became expected
    pending: HashMap<Pid, u64>,
}

/// Thread-safe child table.
///
/// A single lock guards both the live records and the pending set. It is only
/// held for the duration of one read or write, so an eviction pass can never
/// interleave with a contact update.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    table: RwLock<Table>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Timestamps stay consistent across a panicking writer, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a message from `pid` at `now_ms`.
    ///
    /// Inserts a record on first sight, otherwise advances `last_seen_at_ms`.
    /// The last-seen time never moves backwards.
    pub fn record_contact(&self, pid: Pid, now_ms: u64) -> ChildRecord {
        let mut table = self.write();
        table.pending.remove(&pid);
        let record = table.live.entry(pid).or_insert_with(|| {
            debug!(child = pid, "First contact from child");
            ChildRecord {
                pid,
                first_seen_at_ms: now_ms,
                last_seen_at_ms: now_ms,
            }
        });
        record.last_seen_at_ms = record.last_seen_at_ms.max(now_ms);
        *record
    }

    /// Expect a child that has not contacted the main yet.
    ///
    /// Returns false if the pid is already live or already pending.
    pub fn expect(&self, pid: Pid, now_ms: u64) -> bool {
        let mut table = self.write();
        if table.live.contains_key(&pid) || table.pending.contains_key(&pid) {
            return false;
        }
        table.pending.insert(pid, now_ms);
        true
    }

    /// Forget `pid`, live or pending. No-op if absent.
    pub fn remove(&self, pid: Pid) -> Option<ChildRecord> {
        let mut table = self.write();
        table.pending.remove(&pid);
        table.live.remove(&pid)
    }

    /// Number of live children.
    pub fn size(&self) -> usize {
        self.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().live.is_empty()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.read().live.contains_key(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<ChildRecord> {
        self.read().live.get(&pid).copied()
    }

    pub fn is_pending(&self, pid: Pid) -> bool {
        self.read().pending.contains_key(&pid)
    }

    /// True while some spawned child has not been heard from.
    pub fn has_pending(&self) -> bool {
        !self.read().pending.is_empty()
    }

    /// True when no child is live and none is on its way.
    pub fn is_settled_empty(&self) -> bool {
        let table = self.read();
        table.live.is_empty() && table.pending.is_empty()
    }

    /// Snapshot of all live records, sorted by pid.
    pub fn all(&self) -> Vec<ChildRecord> {
        let mut records: Vec<ChildRecord> = self.read().live.values().copied().collect();
        records.sort_by_key(|r| r.pid);
        records
    }

    /// Pids of all live children, sorted.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.read().live.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Pids of all live and pending children, sorted.
    pub fn all_pids(&self) -> Vec<Pid> {
        let table = self.read();
        let mut pids: Vec<Pid> = table
            .live
            .keys()
            .chain(table.pending.keys())
            .copied()
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Remove every live or pending child not heard from for more than `timeout_ms`.
    ///
    /// Runs as one write-locked pass and returns the evicted pids, sorted.
    pub fn evict_expired(&self, now_ms: u64, timeout_ms: u64) -> Vec<Pid> {
        let mut table = self.write();
        let mut evicted = Vec::new();

        table.live.retain(|pid, record| {
            let expired = now_ms.saturating_sub(record.last_seen_at_ms) > timeout_ms;
            if expired {
                evicted.push(*pid);
            }
            !expired
        });
        table.pending.retain(|pid, since| {
            let expired = now_ms.saturating_sub(*since) > timeout_ms;
            if expired {
                evicted.push(*pid);
            }
            !expired
        });

        evicted.sort_unstable();
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_first_and_last_seen() {
        let registry = ProcessRegistry::new();
        registry.record_contact(42, 1_000);
        let record = registry.record_contact(42, 1_500);

        assert_eq!(record.first_seen_at_ms, 1_000);
        assert_eq!(record.last_seen_at_ms, 1_500);
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let registry = ProcessRegistry::new();
        registry.record_contact(7, 2_000);
        let record = registry.record_contact(7, 1_000);
        assert_eq!(record.last_seen_at_ms, 2_000);
        assert_eq!(record.first_seen_at_ms, 2_000);
    }

    #[test]
    fn test_all_pids_includes_pending() {
        let registry = ProcessRegistry::new();
        registry.record_contact(30, 1);
        registry.expect(12, 2);
        registry.record_contact(5, 3);
        assert_eq!(registry.pids(), vec![5, 30]);
        assert_eq!(registry.all_pids(), vec![5, 12, 30]);
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let registry = ProcessRegistry::new();
        assert!(registry.remove(5).is_none());
        registry.record_contact(5, 1);
        assert!(registry.remove(5).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pending_becomes_live_on_contact() {
        let registry = ProcessRegistry::new();
        assert!(registry.expect(9, 100));
        assert!(!registry.expect(9, 200));
        assert!(registry.has_pending());
        assert_eq!(registry.size(), 0);
        assert!(!registry.is_settled_empty());

        registry.record_contact(9, 300);
        assert!(!registry.has_pending());
        assert_eq!(registry.size(), 1);
        assert!(!registry.expect(9, 400));
    }

    #[test]
    fn test_remove_clears_pending() {
        let registry = ProcessRegistry::new();
        registry.expect(3, 0);
        registry.remove(3);
        assert!(registry.is_settled_empty());
    }

    #[test]
    fn test_eviction_boundary() {
        let registry = ProcessRegistry::new();
        registry.record_contact(1, 10_000);

        assert!(registry.evict_expired(10_000 + 29_999, 30_000).is_empty());
        assert!(registry.evict_expired(10_000 + 30_000, 30_000).is_empty());
        assert_eq!(registry.evict_expired(10_000 + 30_001, 30_000), vec![1]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_eviction_covers_pending() {
        let registry = ProcessRegistry::new();
        registry.expect(8, 0);
        registry.record_contact(2, 40_000);
        assert_eq!(registry.evict_expired(40_000, 30_000), vec![8]);
        assert_eq!(registry.pids(), vec![2]);
    }

    #[test]
    fn test_all_is_sorted_snapshot() {
        let registry = ProcessRegistry::new();
        for pid in [30, 10, 20] {
            registry.record_contact(pid, pid as u64);
        }
        let pids: Vec<Pid> = registry.all().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![10, 20, 30]);
    }

    /// Contact updates racing an eviction pass never corrupt records, and a
    /// freshly recorded pid is never evicted by that pass.
    #[test]
    fn test_concurrent_contacts_and_eviction() {
        const NOW: u64 = 1_000_000;
        const TIMEOUT: u64 = 30_000;

        let registry = Arc::new(ProcessRegistry::new());
        // Stale children that the pass must evict.
        let stale: Vec<Pid> = (1000..1005).collect();
        for pid in &stale {
            registry.record_contact(*pid, 0);
        }

        let barrier = Arc::new(Barrier::new(101));
        let mut handles = Vec::new();
        for i in 0..100u64 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let pid = (i % 10) as Pid + 1;
                registry.record_contact(pid, NOW + i);
            }));
        }

        let evictor = {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                registry.evict_expired(NOW, TIMEOUT)
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let evicted: HashSet<Pid> = evictor.join().unwrap().into_iter().collect();

        assert_eq!(evicted, stale.iter().copied().collect::<HashSet<_>>());
        for record in registry.all() {
            assert!(record.last_seen_at_ms >= record.first_seen_at_ms);
            assert!(!evicted.contains(&record.pid));
        }
        assert_eq!(registry.size(), 10);
    }
}
