//! Listener snapshots handed from one child generation to the next.
//!
//! A snapshot maps each service to its named listeners, with the listening
//! address and, when the socket can be inherited, its file descriptor:
//!
//! ```json
//! {"http": {"public": {"addr": "127.0.0.1:8080", "fd": 7}}}
//! ```
//!
//! An empty payload is an empty snapshot, which means a cold start.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One listener in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerEntry {
    /// Address the listener is bound to
    pub addr: String,
    /// Inheritable descriptor, absent when the socket must be bound fresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fd: Option<RawFd>,
}

impl ListenerEntry {
    pub fn new(addr: impl Into<String>, fd: Option<RawFd>) -> Self {
        Self {
            addr: addr.into(),
            fd,
        }
    }
}

/// Service name -> listener name -> entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerSnapshot {
    services: BTreeMap<String, BTreeMap<String, ListenerEntry>>,
}

impl ListenerSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        service: impl Into<String>,
        listener: impl Into<String>,
        entry: ListenerEntry,
    ) {
        self.services
            .entry(service.into())
            .or_default()
            .insert(listener.into(), entry);
    }

    pub fn get(&self, service: &str, listener: &str) -> Option<&ListenerEntry> {
        self.services.get(service)?.get(listener)
    }

    /// True when no listener is described (cold start).
    pub fn is_empty(&self) -> bool {
        self.services.values().all(BTreeMap::is_empty)
    }

    /// Number of listeners across all services.
    pub fn len(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }

    /// Iterate `(service, listener, entry)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &ListenerEntry)> {
        self.services.iter().flat_map(|(service, listeners)| {
            listeners
                .iter()
                .map(move |(name, entry)| (service.as_str(), name.as_str(), entry))
        })
    }

    /// Copy with descriptors renumbered contiguously from `first_fd`.
    ///
    /// Also returns the original descriptors in the order they were assigned,
    /// so that `sources[i]` must end up at `first_fd + i` in the new process.
    pub fn remapped(&self, first_fd: RawFd) -> (Self, Vec<RawFd>) {
        let mut sources = Vec::new();
        let mut remapped = self.clone();
        for listeners in remapped.services.values_mut() {
            for entry in listeners.values_mut() {
                if let Some(fd) = entry.fd {
                    entry.fd = Some(first_fd + sources.len() as RawFd);
                    sources.push(fd);
                }
            }
        }
        (remapped, sources)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a snapshot. Empty input decodes to an empty snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EcdysisError;

    fn sample() -> ListenerSnapshot {
        let mut snapshot = ListenerSnapshot::new();
        snapshot.insert("http", "public", ListenerEntry::new("0.0.0.0:8080", Some(12)));
        snapshot.insert("http", "admin", ListenerEntry::new("127.0.0.1:9090", Some(9)));
        snapshot.insert("metrics", "scrape", ListenerEntry::new("127.0.0.1:9100", None));
        snapshot
    }

    #[test]
    fn test_json_round_trip() {
        let snapshot = sample();
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(ListenerSnapshot::from_bytes(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_json_shape() {
        let mut snapshot = ListenerSnapshot::new();
        snapshot.insert("http", "public", ListenerEntry::new("127.0.0.1:8080", Some(7)));
        snapshot.insert("http", "plain", ListenerEntry::new("127.0.0.1:8081", None));
        let json = String::from_utf8(snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"http":{"plain":{"addr":"127.0.0.1:8081"},"public":{"addr":"127.0.0.1:8080","fd":7}}}"#
        );
    }

    #[test]
    fn test_empty_bytes_is_cold_start() {
        let snapshot = ListenerSnapshot::from_bytes(&[]).unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.len(), 0);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(matches!(
            ListenerSnapshot::from_bytes(b"not json"),
            Err(EcdysisError::Snapshot(_))
        ));
    }

    #[test]
    fn test_remapped_is_contiguous() {
        let (remapped, sources) = sample().remapped(3);

        // BTreeMap order: http/admin, http/public, metrics/scrape
        assert_eq!(sources, vec![9, 12]);
        assert_eq!(remapped.get("http", "admin").unwrap().fd, Some(3));
        assert_eq!(remapped.get("http", "public").unwrap().fd, Some(4));
        assert_eq!(remapped.get("metrics", "scrape").unwrap().fd, None);
        assert_eq!(remapped.len(), 3);
    }

    #[test]
    fn test_iter_order() {
        let names: Vec<(String, String)> = sample()
            .iter()
            .map(|(s, l, _)| (s.to_string(), l.to_string()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("http".to_string(), "admin".to_string()),
                ("http".to_string(), "public".to_string()),
                ("metrics".to_string(), "scrape".to_string()),
            ]
        );
    }
}
