// src/lib.rs
// Public library surface: the waterfall, its batch coordinator, and diagnostics.

pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod providers;
pub mod subject;
pub mod tier;
pub mod trace;
pub mod validate;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::batch::{BatchCoordinator, BatchOptions, BatchReport, SubjectOutcome, SubjectStatus};
pub use crate::cache::EnrichmentCache;
pub use crate::config::WaterfallConfig;
pub use crate::error::{ConfigError, EnrichError};
pub use crate::ledger::{BatchId, Cost, CostLedger};
pub use crate::orchestrator::{AcceptedResult, EnrichOptions, EnrichOutcome, Enrichment, Waterfall};
pub use crate::subject::{Subject, SubjectKey};
pub use crate::tier::eligibility::Eligibility;
pub use crate::tier::registry::{TierDescriptor, TierRegistry};
pub use crate::tier::{TierProvider, TierRequest, TierResult};
pub use crate::validate::{ContentRules, ValidationMode};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_JSON: &str = "WATERFALL_LOG_JSON";

/// Install the global subscriber. `RUST_LOG` wins over the default filter;
/// `WATERFALL_LOG_JSON=1` switches to JSON lines. Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("enrichment_waterfall=info,waterfall=info,batch=info,warn"));

    let json = std::env::var(ENV_LOG_JSON).ok().is_some_and(|v| v == "1");
    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
