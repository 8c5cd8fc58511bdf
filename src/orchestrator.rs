//! # Waterfall Orchestrator
//! Enriches one subject: cache first, then each tier in registry order until
//! one result is accepted.
//!
//! Per tier: eligibility → budget admission → invoke → charge ledger →
//! validate. Skipped tiers cost nothing; invoked tiers are always charged,
//! whatever the outcome. Provider errors never escape `enrich`; they are
//! recorded in the trace and the walk continues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::EnrichmentCache;
use crate::config::WaterfallConfig;
use crate::error::{ConfigError, EnrichError};
use crate::ledger::{BatchId, Cost, CostLedger, LedgerEntry};
use crate::metrics::ensure_metrics_described;
use crate::subject::{Subject, SubjectKey};
use crate::tier::budget::BatchBudget;
use crate::tier::registry::{TierDescriptor, TierRegistry};
use crate::tier::{Fields, PartialHint, ScrapedPage, TierRequest, TierResult};
use crate::trace::{TierOutcome, TierOutcomeTrace, TraceLog};
use crate::validate::{self, effective_confidence, ValidationOutcome, ValidatorDefaults};

pub const DEFAULT_TRACE_CAPACITY: usize = 500;

/// The single result that survives an orchestration pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedResult {
    pub tier: String,
    pub fields: Fields,
    pub confidence: f64,
    /// Cost of the accepting invocation (not the whole walk).
    pub cost: Cost,
    #[serde(default)]
    pub page: Option<ScrapedPage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichOutcome {
    Accepted {
        result: AcceptedResult,
        from_cache: bool,
    },
    /// Every tier was skipped or rejected. A normal outcome, not an error.
    NotFound,
}

impl EnrichOutcome {
    pub fn accepted(&self) -> Option<&AcceptedResult> {
        match self {
            EnrichOutcome::Accepted { result, .. } => Some(result),
            EnrichOutcome::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EnrichOutcome::NotFound)
    }
}

#[derive(Debug, Clone)]
pub struct Enrichment {
    pub key: SubjectKey,
    pub outcome: EnrichOutcome,
    pub trace: TierOutcomeTrace,
}

impl Enrichment {
    /// Cost charged during this pass (zero for cache hits).
    pub fn cost(&self) -> Cost {
        self.trace.total_cost()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnrichOptions {
    /// Skip the cache read; a successful result is still written back.
    pub force_refresh: bool,
    /// Shared batch budget. `None` means no caps apply.
    pub budget: Option<Arc<BatchBudget>>,
    /// Ledger entries are tagged with this batch.
    pub batch: Option<BatchId>,
}

impl EnrichOptions {
    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

pub struct Waterfall {
    registry: Arc<TierRegistry>,
    cache: Arc<EnrichmentCache>,
    ledger: Arc<CostLedger>,
    traces: Arc<TraceLog>,
    defaults: ValidatorDefaults,
    call_timeout: Option<Duration>,
}

impl Waterfall {
    /// In-memory cache, fresh ledger, default thresholds.
    pub fn new(registry: TierRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            cache: Arc::new(EnrichmentCache::in_memory()),
            ledger: Arc::new(CostLedger::new()),
            traces: Arc::new(TraceLog::with_capacity(DEFAULT_TRACE_CAPACITY)),
            defaults: ValidatorDefaults::default(),
            call_timeout: None,
        }
    }

    /// Wire everything from a loaded config; providers are looked up by tier name.
    pub fn from_config(
        cfg: &WaterfallConfig,
        providers: &std::collections::HashMap<String, Arc<dyn crate::tier::TierProvider>>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let registry = TierRegistry::from_config(&cfg.tiers, providers)?;
        let cache = cfg.build_cache()?;
        Ok(Self::new(registry)
            .with_cache(Arc::new(cache))
            .with_trace_log(Arc::new(TraceLog::with_capacity(cfg.trace_capacity)))
            .with_defaults(ValidatorDefaults {
                threshold: cfg.confidence_threshold,
                nominal_confidence: cfg.nominal_confidence,
            })
            .with_call_timeout(cfg.provider_timeout_ms.map(Duration::from_millis)))
    }

    pub fn with_cache(mut self, cache: Arc<EnrichmentCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_trace_log(mut self, traces: Arc<TraceLog>) -> Self {
        self.traces = traces;
        self
    }

    pub fn with_defaults(mut self, defaults: ValidatorDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Backstop timeout around provider calls. Provider clients should
    /// still enforce their own; an expiry here is handled like any failure.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<EnrichmentCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn traces(&self) -> &Arc<TraceLog> {
        &self.traces
    }

    pub fn defaults(&self) -> ValidatorDefaults {
        self.defaults
    }

    pub async fn enrich(&self, subject: &Subject, opts: &EnrichOptions) -> Result<Enrichment, EnrichError> {
        ensure_metrics_described();
        let t0 = Instant::now();

        let key = subject.key()?;
        let anon = key.anon();
        let mut trace = TierOutcomeTrace::new(key.clone(), opts.batch.clone(), opts.force_refresh);

        if !opts.force_refresh {
            if let Some(entry) = self.cache.get(&key) {
                counter!("waterfall_cache_hits_total").increment(1);
                debug!(target: "waterfall", subject = %anon, tier = %entry.tier, "cache hit");
                trace.record(TierOutcome::CacheHit {
                    tier: entry.tier.clone(),
                    accepted_at: entry.accepted_at,
                });
                let outcome = EnrichOutcome::Accepted {
                    result: entry.result,
                    from_cache: true,
                };
                return Ok(self.finish(key, outcome, trace, t0));
            }
            counter!("waterfall_cache_misses_total").increment(1);
        }

        let mut hint: Option<PartialHint> = None;

        for tier in self.registry.tiers() {
            let name = tier.name();

            if !tier.eligibility().evaluate(subject) {
                counter!("waterfall_tier_skipped_total", "tier" => name.to_string(), "cause" => "ineligible")
                    .increment(1);
                trace.record(TierOutcome::Ineligible {
                    tier: name.to_string(),
                });
                continue;
            }

            if let Some(budget) = &opts.budget {
                if !budget.try_admit(name) {
                    counter!("waterfall_tier_skipped_total", "tier" => name.to_string(), "cause" => "budget")
                        .increment(1);
                    debug!(target: "waterfall", subject = %anon, tier = name, "budget exhausted, falling through");
                    trace.record(TierOutcome::BudgetExhausted {
                        tier: name.to_string(),
                    });
                    continue;
                }
            }

            let result = self.invoke(tier, subject, &key, hint.as_ref()).await;
            let cost = result.cost();
            self.charge(tier, &key, cost, opts.batch.as_ref());

            if let TierResult::Error { detail, .. } = &result {
                warn!(target: "waterfall", subject = %anon, tier = name, error = %detail, "tier invocation failed");
                trace.record(TierOutcome::InvocationFailed {
                    tier: name.to_string(),
                    cost,
                    detail: detail.clone(),
                });
                continue;
            }

            match validate::validate(&result, tier.validation_mode(), &self.defaults) {
                ValidationOutcome::Accept { confidence } => {
                    let accepted = accepted_from(name, result, confidence);
                    if let Err(e) = self.cache.put(&key, &accepted) {
                        warn!(target: "waterfall", subject = %anon, error = ?e, "cache write failed");
                    }
                    counter!("waterfall_tier_accepted_total", "tier" => name.to_string()).increment(1);
                    info!(target: "waterfall", subject = %anon, tier = name, %cost, confidence, "accepted");
                    trace.record(TierOutcome::Accepted {
                        tier: name.to_string(),
                        cost,
                        confidence,
                    });
                    let outcome = EnrichOutcome::Accepted {
                        result: accepted,
                        from_cache: false,
                    };
                    return Ok(self.finish(key, outcome, trace, t0));
                }
                ValidationOutcome::Reject(reason) => {
                    counter!("waterfall_tier_rejected_total", "tier" => name.to_string(), "reason" => reason.code())
                        .increment(1);
                    debug!(target: "waterfall", subject = %anon, tier = name, reason = %reason, "rejected");
                    hint = better_hint(hint, name, &result, &self.defaults);
                    trace.record(TierOutcome::Rejected {
                        tier: name.to_string(),
                        cost,
                        reason,
                    });
                }
            }
        }

        counter!("waterfall_not_found_total").increment(1);
        info!(
            target: "waterfall",
            subject = %anon,
            attempts = trace.invocations(),
            cost = %trace.total_cost(),
            "all tiers exhausted"
        );
        Ok(self.finish(key, EnrichOutcome::NotFound, trace, t0))
    }

    async fn invoke(
        &self,
        tier: &TierDescriptor,
        subject: &Subject,
        key: &SubjectKey,
        hint: Option<&PartialHint>,
    ) -> TierResult {
        let req = TierRequest { subject, key, hint };
        let call = tier.provider().invoke(req);
        let res = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(anyhow::anyhow!("timed out after {}ms", limit.as_millis())),
            },
            None => call.await,
        };
        // No billing report on transport errors: charge the tier's unit cost.
        res.unwrap_or_else(|e| TierResult::Error {
            cost: tier.approx_cost(),
            detail: format!("{e:#}"),
        })
    }

    fn charge(&self, tier: &TierDescriptor, key: &SubjectKey, cost: Cost, batch: Option<&BatchId>) {
        counter!("waterfall_tier_invocations_total", "tier" => tier.name().to_string()).increment(1);
        counter!("waterfall_cost_micros_total", "tier" => tier.name().to_string()).increment(cost.micros());
        self.ledger.append(LedgerEntry {
            tier: tier.name().to_string(),
            subject: key.clone(),
            cost,
            at: Utc::now(),
            batch: batch.cloned(),
        });
    }

    fn finish(&self, key: SubjectKey, outcome: EnrichOutcome, mut trace: TierOutcomeTrace, t0: Instant) -> Enrichment {
        trace.finish();
        self.traces.push(trace.clone());
        histogram!("waterfall_enrich_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Enrichment {
            key,
            outcome,
            trace,
        }
    }
}

fn accepted_from(tier: &str, result: TierResult, confidence: f64) -> AcceptedResult {
    match result {
        TierResult::Found {
            fields, cost, page, ..
        } => AcceptedResult {
            tier: tier.to_string(),
            fields,
            confidence,
            cost,
            page,
        },
        // validation only accepts Found
        other => AcceptedResult {
            tier: tier.to_string(),
            fields: Fields::new(),
            confidence,
            cost: other.cost(),
            page: None,
        },
    }
}

/// Keep the highest-confidence partial result seen so far.
fn better_hint(
    current: Option<PartialHint>,
    tier: &str,
    result: &TierResult,
    defaults: &ValidatorDefaults,
) -> Option<PartialHint> {
    let TierResult::Found {
        fields, confidence, ..
    } = result
    else {
        return current;
    };
    if fields.values().all(|v| v.trim().is_empty()) {
        return current;
    }
    let confidence = effective_confidence(*confidence, defaults);
    match current {
        Some(h) if h.confidence >= confidence => Some(h),
        _ => Some(PartialHint {
            tier: tier.to_string(),
            fields: fields.clone(),
            confidence,
        }),
    }
}
