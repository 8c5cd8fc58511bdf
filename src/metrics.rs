use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metric descriptions (so series show up on /metrics before first use).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(describe_all);
}

fn describe_all() {
    describe_counter!("waterfall_cache_hits_total", "Subjects served from the enrichment cache.");
    describe_counter!(
        "waterfall_cache_misses_total",
        "Cache lookups that fell through to tier iteration."
    );
    describe_counter!("waterfall_tier_invocations_total", "Provider calls per tier.");
    describe_counter!("waterfall_tier_accepted_total", "Accepted results per tier.");
    describe_counter!(
        "waterfall_tier_rejected_total",
        "Rejected results per tier and reason code."
    );
    describe_counter!(
        "waterfall_tier_skipped_total",
        "Tiers skipped for ineligibility or exhausted budget."
    );
    describe_counter!("waterfall_not_found_total", "Subjects that exhausted every tier.");
    describe_counter!(
        "waterfall_cost_micros_total",
        "Cost charged per tier, in accounting micro-units."
    );
    describe_histogram!("waterfall_enrich_ms", "Single-subject enrichment time in milliseconds.");
    describe_gauge!("waterfall_batch_last_run_ts", "Unix ts when a batch last finished.");
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        // descriptions issued before the recorder existed were dropped
        describe_all();
        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
