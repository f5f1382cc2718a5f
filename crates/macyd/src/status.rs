//! The HTTP status endpoint, the dashboard's read-only view of the daemon.
//!
//!   GET /api/status   settings, receiver state, senders
//!   GET /api/matrix   host × address age matrix, ages in seconds
//!   GET /api/log      event log tail (?lines=N)

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::cors::{Any, CorsLayer};

use macy_core::{Settings, Transport};
use macy_services::{ReachabilityMatrix, ReachabilityStore};

use crate::event_log::EventLog;
use crate::lifecycle::{EndpointSnapshot, SenderStatus};

const DEFAULT_LOG_LINES: usize = 200;

#[derive(Clone)]
pub struct StatusState {
    pub settings: Arc<Settings>,
    pub store: ReachabilityStore,
    pub endpoints: watch::Receiver<EndpointSnapshot>,
    pub log: EventLog,
}

// ── /api/status ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub host: String,
    pub group: IpAddr,
    pub port: u16,
    pub transport: Transport,
    pub ttl: u32,
    pub qos: u32,
    pub fragments: bool,
    pub size: usize,
    pub link_local: bool,
    pub period_ms: u64,
    pub receiver: bool,
    pub senders: Vec<SenderStatus>,
    pub hosts_heard: usize,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let s = &state.settings;
    let endpoints = state.endpoints.borrow().clone();
    Json(StatusResponse {
        host: s.host.clone(),
        group: s.group,
        port: s.port,
        transport: s.transport,
        ttl: s.ttl,
        qos: s.qos,
        fragments: s.fragments,
        size: s.size.map_or(0, |n| n.get()),
        link_local: s.link_local,
        period_ms: s.period.as_millis() as u64,
        receiver: endpoints.receiver,
        senders: endpoints.senders,
        hosts_heard: state.store.host_count(),
    })
}

// ── /api/matrix ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct MatrixResponse {
    pub hosts: Vec<String>,
    pub rows: Vec<MatrixRow>,
}

#[derive(Debug, Serialize)]
pub struct MatrixRow {
    pub addr: String,
    pub ages: Vec<Option<f64>>,
}

impl From<ReachabilityMatrix> for MatrixResponse {
    fn from(m: ReachabilityMatrix) -> Self {
        let rows = m
            .addrs
            .into_iter()
            .zip(m.cells)
            .map(|(addr, cells)| MatrixRow {
                addr,
                ages: cells.into_iter().map(|c| c.map(|d| d.as_secs_f64())).collect(),
            })
            .collect();
        Self { hosts: m.hosts, rows }
    }
}

async fn handle_matrix(State(state): State<StatusState>) -> Json<MatrixResponse> {
    let local: Vec<IpAddr> = state
        .endpoints
        .borrow()
        .senders
        .iter()
        .map(|s| s.addr)
        .collect();
    let matrix = ReachabilityMatrix::build(
        &state.store.snapshot(),
        &state.settings.host,
        local,
        Instant::now(),
    );
    Json(matrix.into())
}

// ── /api/log ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

#[derive(Serialize)]
pub struct LogResponse {
    pub lines: Vec<String>,
}

async fn handle_log(
    State(state): State<StatusState>,
    Query(query): Query<LogQuery>,
) -> Json<LogResponse> {
    let n = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    Json(LogResponse {
        lines: state.log.tail(n),
    })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/matrix", get(handle_matrix))
        .route("/api/log", get(handle_log))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
