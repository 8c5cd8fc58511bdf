use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::ledger::Cost;
use crate::orchestrator::Waterfall;
use crate::trace::TierOutcomeTrace;

const DEFAULT_TRACE_PAGE: usize = 20;

#[derive(Clone)]
pub struct DiagState {
    waterfall: Arc<Waterfall>,
}

impl DiagState {
    pub fn new(waterfall: Arc<Waterfall>) -> Self {
        Self { waterfall }
    }
}

/// Read-only diagnostics over a running waterfall. Merge with
/// `Metrics::router()` to expose `/metrics` on the same listener.
pub fn router(waterfall: Arc<Waterfall>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/debug/traces", get(debug_traces))
        .route("/debug/traces/{key}", get(debug_trace_for))
        .route("/debug/ledger", get(debug_ledger))
        .layer(CorsLayer::very_permissive())
        .with_state(DiagState::new(waterfall))
}

#[derive(Deserialize)]
struct TracesQuery {
    n: Option<usize>,
}

async fn debug_traces(
    State(state): State<DiagState>,
    Query(q): Query<TracesQuery>,
) -> Json<Vec<TierOutcomeTrace>> {
    let n = q.n.unwrap_or(DEFAULT_TRACE_PAGE);
    Json(state.waterfall.traces().last_n(n))
}

async fn debug_trace_for(
    State(state): State<DiagState>,
    Path(key): Path<String>,
) -> Result<Json<TierOutcomeTrace>, StatusCode> {
    state
        .waterfall
        .traces()
        .latest_for(&key)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Serialize)]
struct LedgerOut {
    entries: usize,
    total: Cost,
    by_tier: std::collections::BTreeMap<String, Cost>,
}

async fn debug_ledger(State(state): State<DiagState>) -> Json<LedgerOut> {
    let ledger = state.waterfall.ledger();
    Json(LedgerOut {
        entries: ledger.len(),
        total: ledger.total(),
        by_tier: ledger.totals_by_tier(None),
    })
}
