//! The probe loop: the single control task.
//!
//! Each tick reconciles the socket set, then sends this host's report through
//! every Sender. Ticks never overlap, and a late tick is not made up for.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use macy_core::{Codec, Settings};
use macy_services::ReachabilityStore;

use crate::interfaces::InterfaceSource;
use crate::lifecycle::SocketManager;

pub struct ProbeLoop<S: InterfaceSource> {
    settings: Arc<Settings>,
    manager: SocketManager<S>,
    store: ReachabilityStore,
    codec: Codec,
    shutdown: broadcast::Receiver<()>,
}

impl<S: InterfaceSource> ProbeLoop<S> {
    pub fn new(
        settings: Arc<Settings>,
        manager: SocketManager<S>,
        store: ReachabilityStore,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            codec: Codec::new(settings.size),
            settings,
            manager,
            store,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut interval = tokio::time::interval(self.settings.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            period_ms = self.settings.period.as_millis() as u64,
            host = %self.settings.host,
            "probe loop starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("probe loop shutting down");
                    self.manager.shutdown();
                    return Ok(());
                }

                _ = interval.tick() => {
                    self.manager.reconcile();
                    self.send_cycle();
                }
            }
        }
    }

    /// Build this host's report, encode it once, and send it through every
    /// Sender. Returns the number of Senders tried.
    pub fn send_cycle(&self) -> usize {
        let report = self.store.build_report(&self.settings.host, Instant::now());
        match self.codec.encode(&report) {
            Ok(datagram) => {
                let senders = self.manager.transmit_all(&datagram);
                tracing::trace!(bytes = datagram.len(), senders, heard = report.heard.len(), "send cycle");
                senders
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode report");
                0
            }
        }
    }
}
