//! The node table: known peers, keyed by (pid, iid), with timeout eviction.

use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Process UUID: stable for the lifetime of the process that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub Uuid);

/// Instance UUID: distinct per discovery instance within the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iid(pub Uuid);

impl Pid {
    pub fn new() -> Self {
        Pid(Uuid::new_v4())
    }
}

impl Iid {
    pub fn new() -> Self {
        Iid(Uuid::new_v4())
    }
}

impl Default for Pid {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Iid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The peer-asserted payload carried by every hello. Unlike [`Node`], this
/// carries no `Instant`, so it serializes cleanly for callers that want to
/// hand a snapshot to a UI or log it as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeData {
    pub is_master: bool,
    pub is_master_eligible: bool,
    pub weight: f64,
    /// The address the peer claims to have bound to — may differ from the
    /// observed source address of the datagram.
    pub address: String,
    pub advertisement: Option<Value>,
}

/// A known peer, keyed by (pid, iid).
#[derive(Debug, Clone)]
pub struct Node {
    pub pid: Pid,
    pub iid: Iid,
    /// Observed source address of the last hello.
    pub observed_addr: IpAddr,
    pub observed_port: u16,
    pub hostname: String,
    pub last_seen: Instant,
    pub data: NodeData,
}

impl Node {
    fn touch(&mut self, observed_addr: IpAddr, observed_port: u16, hostname: &str, data: NodeData, now: Instant) {
        self.observed_addr = observed_addr;
        self.observed_port = observed_port;
        self.hostname = hostname.to_string();
        self.last_seen = now;
        self.data = data;
    }
}

/// Ordered collection of known peers, one entry per (pid, iid).
///
/// Backed by an `IndexMap` so iteration order equals insertion order (used
/// only for callback ordering — election doesn't depend on it) while still
/// giving O(1)-amortized upsert/evict by key, per the design note that an
/// ordered map keyed by (pid, iid) is the natural replacement for the
/// original's hand-rolled doubly linked list.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: IndexMap<(Pid, Iid), Node>,
}

/// Result of an upsert: the node's current snapshot, whether it was newly
/// created, and whether it was a master *before* this update was applied.
pub struct UpsertOutcome {
    pub node: Node,
    pub is_new: bool,
    pub was_master_before: bool,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, pid: Pid, iid: Iid) -> Option<&Node> {
        self.nodes.get(&(pid, iid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Insert a new node or update an existing one, keyed by (pid, iid).
    pub fn upsert(
        &mut self,
        pid: Pid,
        iid: Iid,
        observed_addr: IpAddr,
        observed_port: u16,
        hostname: &str,
        data: NodeData,
        now: Instant,
    ) -> UpsertOutcome {
        match self.nodes.get_mut(&(pid, iid)) {
            Some(existing) => {
                let was_master_before = existing.data.is_master;
                existing.touch(observed_addr, observed_port, hostname, data, now);
                UpsertOutcome {
                    node: existing.clone(),
                    is_new: false,
                    was_master_before,
                }
            }
            None => {
                let node = Node {
                    pid,
                    iid,
                    observed_addr,
                    observed_port,
                    hostname: hostname.to_string(),
                    last_seen: now,
                    data,
                };
                self.nodes.insert((pid, iid), node.clone());
                UpsertOutcome {
                    node,
                    is_new: true,
                    was_master_before: false,
                }
            }
        }
    }

    /// Evict nodes whose timeout has elapsed, per the mixed-units rule: the
    /// configured timeout is in milliseconds, the elapsed comparison is in
    /// whole seconds (truncating) — this is intentional coarse grace,
    /// carried forward unchanged from the source protocol.
    pub fn evict_stale(&mut self, now: Instant, node_timeout: Duration, master_timeout: Duration) -> Vec<Node> {
        let node_timeout_secs = node_timeout.as_millis() / 1000;
        let master_timeout_secs = master_timeout.as_millis() / 1000;

        let mut evicted = Vec::new();
        self.nodes.retain(|_, node| {
            if now < node.last_seen {
                // Clock skew: a message dated in the future evicts the entry.
                evicted.push(node.clone());
                return false;
            }
            let elapsed_secs = now.duration_since(node.last_seen).as_secs() as u128;
            let limit = if node.data.is_master { master_timeout_secs } else { node_timeout_secs };
            if elapsed_secs > limit {
                evicted.push(node.clone());
                false
            } else {
                true
            }
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn data(is_master: bool, weight: f64) -> NodeData {
        NodeData {
            is_master,
            is_master_eligible: true,
            weight,
            address: "0.0.0.0".to_string(),
            advertisement: None,
        }
    }

    #[test]
    fn upsert_is_keyed_by_pid_and_iid() {
        let mut table = NodeTable::new();
        let pid = Pid::new();
        let iid = Iid::new();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let now = Instant::now();

        let first = table.upsert(pid, iid, addr, 1234, "host", data(false, 1.0), now);
        assert!(first.is_new);
        assert_eq!(table.len(), 1);

        let second = table.upsert(pid, iid, addr, 1235, "host", data(false, 2.0), now);
        assert!(!second.is_new);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(pid, iid).unwrap().data.weight, 2.0);
    }

    #[test]
    fn distinct_pid_iid_pairs_coexist() {
        let mut table = NodeTable::new();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let now = Instant::now();
        table.upsert(Pid::new(), Iid::new(), addr, 1, "a", data(false, 1.0), now);
        table.upsert(Pid::new(), Iid::new(), addr, 2, "b", data(false, 1.0), now);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn stale_non_master_is_evicted_after_node_timeout() {
        let mut table = NodeTable::new();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let old = Instant::now() - Duration::from_secs(10);
        let pid = Pid::new();
        let iid = Iid::new();
        table.upsert(pid, iid, addr, 1, "host", data(false, 1.0), old);

        let evicted = table.evict_stale(Instant::now(), Duration::from_millis(2000), Duration::from_millis(2000));
        assert_eq!(evicted.len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn master_uses_master_timeout_not_node_timeout() {
        let mut table = NodeTable::new();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let age = Instant::now() - Duration::from_secs(3);
        let pid = Pid::new();
        let iid = Iid::new();
        table.upsert(pid, iid, addr, 1, "host", data(true, 1.0), age);

        // node_timeout=2s would evict a non-master; master_timeout=10s keeps it.
        let evicted = table.evict_stale(Instant::now(), Duration::from_millis(2000), Duration::from_millis(10_000));
        assert!(evicted.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insertion_order_is_preserved_across_evictions() {
        let mut table = NodeTable::new();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let now = Instant::now();
        let (p1, i1) = (Pid::new(), Iid::new());
        let (p2, i2) = (Pid::new(), Iid::new());
        let (p3, i3) = (Pid::new(), Iid::new());
        table.upsert(p1, i1, addr, 1, "a", data(false, 1.0), now);
        table.upsert(p2, i2, addr, 2, "b", data(false, 1.0), now);
        table.upsert(p3, i3, addr, 3, "c", data(false, 1.0), now);

        let order: Vec<_> = table.iter().map(|n| n.hostname.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
