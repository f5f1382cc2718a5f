//! Host × address age matrix for the dashboard.
//!
//! Rows are addresses, columns are hosts. A cell is how long ago `host` heard
//! `addr`, as seen from here:
//!
//!   local host   now − heard_ips[addr]
//!   remote host  heard_db[host][addr] + (now − heard_hosts[host])
//!
//! A remote age is the age in its last report plus the time since that report
//! arrived. Unknown and zero ages are empty cells.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::reachability::ReachabilitySnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityMatrix {
    /// Column labels, sorted.
    pub hosts: Vec<String>,
    /// Row labels, sorted.
    pub addrs: Vec<String>,
    /// `cells[row][col]`.
    pub cells: Vec<Vec<Option<Duration>>>,
}

impl ReachabilityMatrix {
    /// Build from a store snapshot.
    ///
    /// `local_addrs` are the addresses this host currently sends from; they
    /// get a row even before anyone has heard them.
    pub fn build(
        snapshot: &ReachabilitySnapshot,
        local_host: &str,
        local_addrs: impl IntoIterator<Item = IpAddr>,
        now: Instant,
    ) -> Self {
        let mut addrs: BTreeSet<String> = local_addrs.into_iter().map(|a| a.to_string()).collect();
        addrs.extend(snapshot.heard_ips.keys().map(|a| a.to_string()));
        for heard in snapshot.heard_db.values() {
            addrs.extend(heard.keys().cloned());
        }

        let mut hosts: BTreeSet<String> = snapshot.heard_hosts.keys().cloned().collect();
        hosts.insert(local_host.to_string());

        let hosts: Vec<String> = hosts.into_iter().collect();
        let addrs: Vec<String> = addrs.into_iter().collect();

        let cells = addrs
            .iter()
            .map(|addr| {
                hosts
                    .iter()
                    .map(|host| {
                        let age = if host == local_host {
                            local_age(snapshot, addr, now)
                        } else {
                            remote_age(snapshot, host, addr, now)
                        };
                        age.filter(|d| !d.is_zero())
                    })
                    .collect()
            })
            .collect();

        Self { hosts, addrs, cells }
    }

    pub fn cell(&self, addr: &str, host: &str) -> Option<Duration> {
        let row = self.addrs.iter().position(|a| a == addr)?;
        let col = self.hosts.iter().position(|h| h == host)?;
        self.cells[row][col]
    }
}

fn local_age(snapshot: &ReachabilitySnapshot, addr: &str, now: Instant) -> Option<Duration> {
    let ip: IpAddr = addr.parse().ok()?;
    let at = snapshot.heard_ips.get(&ip)?;
    Some(now.saturating_duration_since(*at))
}

fn remote_age(
    snapshot: &ReachabilitySnapshot,
    host: &str,
    addr: &str,
    now: Instant,
) -> Option<Duration> {
    let reported = *snapshot.heard_db.get(host)?.get(addr)?;
    if reported.is_zero() {
        return None;
    }
    let received = snapshot.heard_hosts.get(host)?;
    Some(reported.saturating_add(now.saturating_duration_since(*received)))
}
