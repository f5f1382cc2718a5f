//! Socket lifecycle — keeps the Receiver and the Senders in step with the
//! interface table.
//!
//! Endpoint states: Absent → Active → Errored → (closed) → Absent. An Endpoint
//! comes back on a later cycle if its interface and address are still usable.
//!
//! `reconcile` runs once per probe cycle on the control task:
//!   1. close every Endpoint whose error flag is set
//!   2. create the Receiver if there is none
//!   3. re-join the group on every usable interface
//!   4. create a Sender for every usable (interface, address) pair without one
//!
//! Senders whose pair stops being usable are left alone; only errors remove
//! them.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use macy_core::Settings;
use macy_services::ReachabilityStore;

use crate::endpoint::{Endpoint, SenderKey};
use crate::fragment::{Fragmentation, PlatformFragmentation};
use crate::interfaces::{Candidate, InterfaceSource, Selector};

/// What the status endpoint shows about the socket set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointSnapshot {
    pub receiver: bool,
    pub senders: Vec<SenderStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SenderStatus {
    pub interface: String,
    pub index: u32,
    pub addr: IpAddr,
}

pub struct SocketManager<S: InterfaceSource> {
    settings: Arc<Settings>,
    source: S,
    selector: Selector,
    frag: Box<dyn Fragmentation>,
    store: ReachabilityStore,
    receiver: Option<Endpoint>,
    senders: BTreeMap<SenderKey, Endpoint>,
    next_id: u64,
    snapshot: watch::Sender<EndpointSnapshot>,
}

impl<S: InterfaceSource> SocketManager<S> {
    pub fn new(settings: Arc<Settings>, source: S, store: ReachabilityStore) -> Self {
        let (snapshot, _) = watch::channel(EndpointSnapshot::default());
        Self {
            selector: Selector::new(settings.clone()),
            settings,
            source,
            frag: Box::new(PlatformFragmentation),
            store,
            receiver: None,
            senders: BTreeMap::new(),
            next_id: 1,
            snapshot,
        }
    }

    /// Socket set updates, published after every reconcile.
    pub fn subscribe(&self) -> watch::Receiver<EndpointSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn reconcile(&mut self) {
        self.close_errored();

        let candidates = match self.source.interfaces() {
            Ok(table) => self.selector.usable_interfaces(&table),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list interfaces");
                Vec::new()
            }
        };

        self.ensure_receiver();
        self.refresh_membership(&candidates);
        self.ensure_senders(&candidates);
        self.publish();
    }

    /// Hand one datagram to every Sender. A failing Sender only trips its own
    /// flag. Returns how many Senders were tried.
    pub fn transmit_all(&self, datagram: &[u8]) -> usize {
        for sender in self.senders.values() {
            sender.transmit(datagram);
        }
        self.senders.len()
    }

    /// Addresses this host currently sends from.
    pub fn local_addrs(&self) -> Vec<IpAddr> {
        self.senders.keys().map(|k| k.addr).collect()
    }

    pub fn receiver(&self) -> Option<&Endpoint> {
        self.receiver.as_ref()
    }

    pub fn sender(&self, key: &SenderKey) -> Option<&Endpoint> {
        self.senders.get(key)
    }

    pub fn senders(&self) -> impl Iterator<Item = &Endpoint> {
        self.senders.values()
    }

    /// Close every Endpoint and stop its read task.
    pub fn shutdown(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.close();
        }
        let closed = self.senders.len();
        for (_, sender) in std::mem::take(&mut self.senders) {
            sender.close();
        }
        tracing::info!(senders = closed, "sockets closed");
        self.publish();
    }

    // ── Reconcile steps ──────────────────────────────────────────────────────

    fn close_errored(&mut self) {
        if let Some(reason) = self
            .receiver
            .as_ref()
            .and_then(|r| r.flag().reason().map(str::to_owned))
        {
            tracing::warn!(error = %reason, "deleting receiver");
            if let Some(receiver) = self.receiver.take() {
                receiver.close();
            }
        }

        let errored: Vec<SenderKey> = self
            .senders
            .iter()
            .filter(|(_, s)| s.flag().is_set())
            .map(|(k, _)| k.clone())
            .collect();
        for key in errored {
            if let Some(sender) = self.senders.remove(&key) {
                tracing::warn!(
                    socket = %key,
                    error = sender.flag().reason().unwrap_or_default(),
                    "deleting sender"
                );
                sender.close();
            }
        }
    }

    fn ensure_receiver(&mut self) {
        if self.receiver.is_some() {
            return;
        }
        tracing::info!(group = %self.settings.group, port = self.settings.port, "making receiver");
        let id = self.allocate_id();
        match Endpoint::receiver(id, &self.settings, self.store.clone()) {
            Ok(receiver) => {
                tracing::debug!(local = %receiver.local_addr(), "receiver bound");
                self.receiver = Some(receiver);
            }
            Err(e) => tracing::warn!(error = format!("{e:#}"), "receiver not created"),
        }
    }

    fn refresh_membership(&self, candidates: &[Candidate]) {
        let Some(receiver) = &self.receiver else { return };
        for candidate in candidates {
            if let Err(e) = receiver.join(self.settings.group, candidate) {
                tracing::trace!(interface = %candidate.name, error = %e, "group join (likely already joined)");
            }
        }
    }

    fn ensure_senders(&mut self, candidates: &[Candidate]) {
        for candidate in candidates {
            for addr in &candidate.addrs {
                let key = SenderKey::new(candidate, *addr);
                if self.senders.contains_key(&key) {
                    continue;
                }
                tracing::info!(socket = %key, "making sender");
                let id = self.allocate_id();
                match Endpoint::sender(id, key.clone(), &self.settings, self.frag.as_ref()) {
                    Ok(sender) => {
                        tracing::debug!(socket = %key, local = %sender.local_addr(), "sender bound");
                        self.senders.insert(key, sender);
                    }
                    Err(e) => {
                        tracing::warn!(socket = %key, error = format!("{e:#}"), "sender not created")
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let snapshot = EndpointSnapshot {
            receiver: self.receiver.is_some(),
            senders: self
                .senders
                .keys()
                .map(|k| SenderStatus {
                    interface: k.name.clone(),
                    index: k.index,
                    addr: k.addr,
                })
                .collect(),
        };
        self.snapshot.send_replace(snapshot);
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
