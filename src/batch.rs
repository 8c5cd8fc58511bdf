//! # Batch Coordinator
//! Fans a batch of subjects out to the waterfall with bounded concurrency
//! and folds each subject's outcome into a `BatchReport` as it completes.
//!
//! Budget caps are sized once at batch start from the batch length. Which
//! subjects win a contended cap depends on completion order; losers fall
//! through to the next tier. That is the only place batch composition
//! changes an individual subject's outcome.
//!
//! Cancellation stops dispatching; subjects already in flight finish their
//! current walk so no tier is left charged but unrecorded.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::gauge;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::EnrichError;
use crate::ledger::{BatchId, Cost};
use crate::orchestrator::{EnrichOptions, EnrichOutcome, Enrichment, Waterfall};
use crate::subject::Subject;
use crate::tier::budget::{BatchBudget, BudgetUsage};

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub force_refresh: bool,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubjectStatus {
    Accepted { tier: String, from_cache: bool },
    NotFound,
    /// Subject could not be normalized; no tier ran.
    Invalid { error: String },
    /// Not dispatched because the batch was cancelled first.
    Cancelled,
    /// The orchestration task itself died (provider panic).
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectOutcome {
    /// Position in the submitted batch.
    pub index: usize,
    pub key: Option<String>,
    pub status: SubjectStatus,
    pub cost: Cost,
    pub attempts: usize,
}

impl SubjectOutcome {
    fn from_enrichment(index: usize, res: Result<Enrichment, EnrichError>) -> Self {
        match res {
            Ok(e) => {
                let status = match &e.outcome {
                    EnrichOutcome::Accepted { result, from_cache } => SubjectStatus::Accepted {
                        tier: result.tier.clone(),
                        from_cache: *from_cache,
                    },
                    EnrichOutcome::NotFound => SubjectStatus::NotFound,
                };
                Self {
                    index,
                    key: Some(e.key.to_string()),
                    status,
                    cost: e.cost(),
                    attempts: e.trace.invocations(),
                }
            }
            Err(err) => Self {
                index,
                key: None,
                status: SubjectStatus::Invalid {
                    error: err.to_string(),
                },
                cost: Cost::ZERO,
                attempts: 0,
            },
        }
    }

    fn without_run(index: usize, subject: &Subject, status: SubjectStatus) -> Self {
        Self {
            index,
            key: subject.key().ok().map(|k| k.to_string()),
            status,
            cost: Cost::ZERO,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub subjects: usize,
    pub cache_hits: usize,
    /// Fresh acceptances per tier (cache hits counted separately).
    pub accepted_by_tier: BTreeMap<String, usize>,
    pub not_found: usize,
    pub invalid: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub budget: BTreeMap<String, BudgetUsage>,
    pub cost_by_tier: BTreeMap<String, Cost>,
    pub total_cost: Cost,
    /// Ordered by `index` once finalized.
    pub outcomes: Vec<SubjectOutcome>,
}

impl BatchReport {
    fn new(batch_id: BatchId, subjects: usize) -> Self {
        Self {
            batch_id,
            started_at: Utc::now(),
            finished_at: None,
            subjects,
            cache_hits: 0,
            accepted_by_tier: BTreeMap::new(),
            not_found: 0,
            invalid: 0,
            cancelled: 0,
            failed: 0,
            budget: BTreeMap::new(),
            cost_by_tier: BTreeMap::new(),
            total_cost: Cost::ZERO,
            outcomes: Vec::with_capacity(subjects),
        }
    }

    /// Completion-order independent accumulation.
    fn absorb(&mut self, o: SubjectOutcome) {
        match &o.status {
            SubjectStatus::Accepted {
                from_cache: true, ..
            } => self.cache_hits += 1,
            SubjectStatus::Accepted { tier, .. } => {
                *self.accepted_by_tier.entry(tier.clone()).or_insert(0) += 1;
            }
            SubjectStatus::NotFound => self.not_found += 1,
            SubjectStatus::Invalid { .. } => self.invalid += 1,
            SubjectStatus::Cancelled => self.cancelled += 1,
            SubjectStatus::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(o);
    }

    pub fn accepted(&self) -> usize {
        self.cache_hits + self.accepted_by_tier.values().sum::<usize>()
    }

    /// Keys of subjects that went through every tier without acceptance.
    pub fn not_found_keys(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.status == SubjectStatus::NotFound)
            .filter_map(|o| o.key.as_deref())
            .collect()
    }

    pub fn outcome_for(&self, key: &str) -> Option<&SubjectOutcome> {
        self.outcomes.iter().find(|o| o.key.as_deref() == Some(key))
    }
}

pub struct BatchCoordinator {
    waterfall: Arc<Waterfall>,
    concurrency: usize,
}

impl BatchCoordinator {
    pub fn new(waterfall: Arc<Waterfall>, concurrency: usize) -> Self {
        Self {
            waterfall,
            concurrency: concurrency.max(1),
        }
    }

    pub fn waterfall(&self) -> &Arc<Waterfall> {
        &self.waterfall
    }

    pub async fn enrich_batch(&self, subjects: Vec<Subject>, opts: &BatchOptions) -> BatchReport {
        let batch = BatchId::generate();
        let budget = Arc::new(BatchBudget::for_batch(self.waterfall.registry(), subjects.len()));
        let report = BatchReport::new(batch.clone(), subjects.len());

        info!(
            target: "batch",
            batch = %batch,
            subjects = subjects.len(),
            concurrency = self.concurrency,
            "batch started"
        );

        let mut report = stream::iter(subjects.into_iter().enumerate())
            .map(|(index, subject)| {
                let wf = Arc::clone(&self.waterfall);
                let cancel = opts.cancel.clone();
                let enrich_opts = EnrichOptions {
                    force_refresh: opts.force_refresh,
                    budget: Some(Arc::clone(&budget)),
                    batch: Some(batch.clone()),
                };
                async move {
                    // checked at dispatch time; in-flight subjects are never aborted
                    if cancel.is_cancelled() {
                        return SubjectOutcome::without_run(index, &subject, SubjectStatus::Cancelled);
                    }
                    let fallback = subject.clone();
                    let handle = tokio::spawn(async move { wf.enrich(&subject, &enrich_opts).await });
                    match handle.await {
                        Ok(res) => SubjectOutcome::from_enrichment(index, res),
                        Err(e) => {
                            warn!(target: "batch", error = %e, index, "subject task failed");
                            SubjectOutcome::without_run(
                                index,
                                &fallback,
                                SubjectStatus::Failed { error: e.to_string() },
                            )
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .fold(report, |mut r, outcome| async move {
                r.absorb(outcome);
                r
            })
            .await;

        report.outcomes.sort_by_key(|o| o.index);
        report.budget = budget.snapshot();
        let ledger = self.waterfall.ledger();
        report.cost_by_tier = ledger.totals_by_tier(Some(&batch));
        report.total_cost = ledger.total_for(&batch);
        report.finished_at = Some(Utc::now());

        gauge!("waterfall_batch_last_run_ts").set(Utc::now().timestamp() as f64);
        info!(
            target: "batch",
            batch = %batch,
            accepted = report.accepted(),
            cache_hits = report.cache_hits,
            not_found = report.not_found,
            invalid = report.invalid,
            cancelled = report.cancelled,
            total_cost = %report.total_cost,
            "batch finished"
        );
        report
    }
}
