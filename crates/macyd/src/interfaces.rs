//! Interface and address selection.
//!
//! Every reconcile starts from a fresh interface table. An interface is usable
//! when its name passes the interface filter, it is up, it supports multicast,
//! and it has at least one usable address. An address is usable when it has
//! the probe's family, is not link-local (unless enabled), and passes the
//! address filter.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use macy_core::Settings;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use parking_lot::Mutex;

/// One row of the OS interface table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub multicast: bool,
    pub addrs: Vec<IpAddr>,
}

/// A usable interface together with its usable addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub index: u32,
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Where the interface table comes from.
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> io::Result<Vec<Interface>>;
}

/// The live OS table, read with getifaddrs(3).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<Interface>> {
        let mut table: Vec<Interface> = Vec::new();

        for entry in getifaddrs().map_err(io::Error::from)? {
            let pos = match table.iter().position(|i| i.name == entry.interface_name) {
                Some(pos) => pos,
                None => {
                    let index = match if_nametoindex(entry.interface_name.as_str()) {
                        Ok(index) => index,
                        Err(e) => {
                            tracing::debug!(name = %entry.interface_name, error = %e, "no index for interface");
                            continue;
                        }
                    };
                    table.push(Interface {
                        index,
                        name: entry.interface_name.clone(),
                        up: entry.flags.contains(InterfaceFlags::IFF_UP),
                        multicast: entry.flags.contains(InterfaceFlags::IFF_MULTICAST),
                        addrs: Vec::new(),
                    });
                    table.len() - 1
                }
            };

            let Some(storage) = entry.address else { continue };
            let addr = if let Some(sin) = storage.as_sockaddr_in() {
                IpAddr::V4(*SocketAddrV4::from(*sin).ip())
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                IpAddr::V6(*SocketAddrV6::from(*sin6).ip())
            } else {
                continue;
            };
            table[pos].addrs.push(addr);
        }

        table.sort_by_key(|i| i.index);
        Ok(table)
    }
}

/// 169.254.0.0/16 and fe80::/10.
pub fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Applies the configured filters to an interface table.
///
/// Rejection reasons are logged at debug level once per (interface, address,
/// reason) until the outcome for that key changes.
pub struct Selector {
    settings: Arc<Settings>,
    seen: Mutex<HashMap<String, String>>,
}

impl Selector {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn usable_interfaces(&self, table: &[Interface]) -> Vec<Candidate> {
        let mut usable = Vec::new();

        for iface in table {
            let tag = format!("{} {}", iface.index, iface.name);

            if !self.settings.interface_filter.is_match(&iface.name) {
                self.note(
                    format!("{tag} match"),
                    format!("{} does not match regex {}", iface.name, self.settings.interface_filter),
                );
                continue;
            }
            if !iface.up {
                self.note(format!("{tag} up"), format!("{} is not up", iface.name));
                continue;
            }
            if !iface.multicast {
                self.note(
                    format!("{tag} multicast"),
                    format!("{} does not support multicast", iface.name),
                );
                continue;
            }
            let addrs = self.usable_addresses(iface);
            if addrs.is_empty() {
                self.note(
                    format!("{tag} addresses"),
                    format!("{} has no usable addresses", iface.name),
                );
                continue;
            }

            self.note(format!("{tag} usable"), format!("{} is a usable interface", iface.name));
            usable.push(Candidate {
                index: iface.index,
                name: iface.name.clone(),
                addrs,
            });
        }

        usable
    }

    pub fn usable_addresses(&self, iface: &Interface) -> Vec<IpAddr> {
        let settings = &self.settings;
        let mut usable = Vec::new();

        for addr in &iface.addrs {
            let text = addr.to_string();
            let tag = format!("{} {} {}", iface.index, iface.name, text);

            if !settings.address_filter.is_match(&text) {
                self.note(
                    format!("{tag} match"),
                    format!("{text} does not match regex {}", settings.address_filter),
                );
                continue;
            }
            if !settings.transport.matches(addr) {
                self.note(
                    format!("{tag} family"),
                    format!("{text} is not a {} address", settings.transport),
                );
                continue;
            }
            if !settings.link_local && is_link_local(addr) {
                self.note(
                    format!("{tag} linklocal"),
                    format!("{text} is link-local and link-local senders are disabled"),
                );
                continue;
            }

            self.note(format!("{tag} usable"), format!("{text} is a usable address"));
            usable.push(*addr);
        }

        usable
    }

    fn note(&self, key: String, msg: String) {
        let mut seen = self.seen.lock();
        if seen.get(&key) != Some(&msg) {
            tracing::debug!("{msg}");
            seen.insert(key, msg);
        }
    }

    #[cfg(test)]
    fn noted(&self) -> usize {
        self.seen.lock().len()
    }
}
