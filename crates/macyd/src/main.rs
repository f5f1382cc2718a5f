//! macyd — multicast reachability probe daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use macy_core::{MacyConfig, Settings};
use macy_services::ReachabilityStore;

mod endpoint;
mod event_log;
mod fragment;
mod interfaces;
mod lifecycle;
mod probe;
mod status;

use event_log::{EventLog, EVENT_LOG_LINES};
use interfaces::SystemInterfaces;
use lifecycle::SocketManager;
use probe::ProbeLoop;

#[tokio::main]
async fn main() -> Result<()> {
    // Config is read before tracing starts so `verbose` can pick the level;
    // problems are reported once the subscriber is up.
    let written = MacyConfig::write_default_if_missing();
    let loaded = MacyConfig::load();
    let verbose = loaded.as_ref().map(|c| c.log.verbose).unwrap_or(false);

    let event_log = EventLog::new(EVENT_LOG_LINES);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(event_log.layer())
        .init();

    match written {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = loaded.context("failed to load config")?;

    let os_host = match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read host name");
            String::new()
        }
    };
    let settings = Arc::new(config.validate(&os_host).context("invalid configuration")?);
    log_settings(&settings);

    let store = ReachabilityStore::new();
    let manager = SocketManager::new(settings.clone(), SystemInterfaces, store.clone());
    let endpoints = manager.subscribe();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let mut probe_task = tokio::spawn(
        ProbeLoop::new(
            settings.clone(),
            manager,
            store.clone(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let _status_task = settings.api_port.map(|port| {
        let state = status::StatusState {
            settings: settings.clone(),
            store,
            endpoints,
            log: event_log,
        };
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, port, shutdown).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = &mut probe_task    => {
            tracing::error!("probe loop exited: {:?}", r);
            return Ok(());
        }
    }

    // The probe loop closes every socket before it returns.
    match probe_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "probe loop failed"),
        Err(e) => tracing::error!(error = %e, "probe loop panicked"),
    }

    Ok(())
}

fn log_settings(s: &Settings) {
    tracing::info!(
        host = %s.host,
        group = %s.group,
        port = s.port,
        transport = %s.transport,
        "macyd starting"
    );
    tracing::info!(
        ttl = s.ttl,
        qos = s.qos,
        fragments = s.fragments,
        size = s.size.map_or(0, |n| n.get()),
        link_local = s.link_local,
        period_ms = s.period.as_millis() as u64,
        "probe settings"
    );
    tracing::info!(
        interfaces = %s.interface_filter,
        addresses = %s.address_filter,
        api_port = ?s.api_port,
        "filters"
    );
}
