//! What this host heard, and what its peers heard.
//!
//! Three tables behind one lock:
//!   heard_hosts  remote host name → when we last decoded a report from it
//!   heard_ips    source address   → when we last decoded a report from it
//!   heard_db     remote host name → that host's own heard table
//!
//! Written only by the receiver's read task. Read by report construction and
//! the dashboard. Entries are never evicted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use macy_core::Report;
use parking_lot::Mutex;

/// A point-in-time copy of all three tables.
#[derive(Debug, Clone, Default)]
pub struct ReachabilitySnapshot {
    pub heard_hosts: HashMap<String, Instant>,
    pub heard_ips: HashMap<IpAddr, Instant>,
    pub heard_db: HashMap<String, HashMap<String, Duration>>,
}

/// Cloneable handle to the shared tables.
#[derive(Debug, Clone, Default)]
pub struct ReachabilityStore {
    inner: Arc<Mutex<ReachabilitySnapshot>>,
}

impl ReachabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded report that arrived from `from` at `at`.
    ///
    /// All three tables change under one lock acquisition, so a reader never
    /// sees a host in `heard_db` that is missing from `heard_hosts`.
    pub fn record(&self, report: Report, from: IpAddr, at: Instant) {
        let mut tables = self.inner.lock();
        tables.heard_hosts.insert(report.host.clone(), at);
        tables.heard_ips.insert(from, at);
        tables.heard_db.insert(report.host, report.heard);
    }

    /// The report this host sends: every source address heard, with its age.
    pub fn build_report(&self, host: &str, now: Instant) -> Report {
        let tables = self.inner.lock();
        let heard = tables
            .heard_ips
            .iter()
            .map(|(ip, at)| (ip.to_string(), now.saturating_duration_since(*at)))
            .collect();
        Report {
            host: host.to_string(),
            heard,
        }
    }

    pub fn snapshot(&self) -> ReachabilitySnapshot {
        self.inner.lock().clone()
    }

    pub fn heard_host(&self, host: &str) -> Option<Instant> {
        self.inner.lock().heard_hosts.get(host).copied()
    }

    pub fn heard_ip(&self, ip: &IpAddr) -> Option<Instant> {
        self.inner.lock().heard_ips.get(ip).copied()
    }

    /// The heard table `host` sent in its latest report.
    pub fn reported_by(&self, host: &str) -> Option<HashMap<String, Duration>> {
        self.inner.lock().heard_db.get(host).cloned()
    }

    /// Number of distinct hosts ever heard.
    pub fn host_count(&self) -> usize {
        self.inner.lock().heard_hosts.len()
    }
}
