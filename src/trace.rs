//! Tier outcome traces: what happened at each step of one subject's
//! waterfall, plus a bounded in-memory log of recent traces for diagnostics.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{BatchId, Cost};
use crate::subject::SubjectKey;
use crate::validate::RejectReason;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TierOutcome {
    /// Served from cache; `tier` is the tier that originally produced it.
    CacheHit { tier: String, accepted_at: DateTime<Utc> },
    Ineligible { tier: String },
    BudgetExhausted { tier: String },
    Accepted { tier: String, cost: Cost, confidence: f64 },
    Rejected { tier: String, cost: Cost, reason: RejectReason },
    /// Transport-level failure (timeout, 5xx); treated as not found.
    InvocationFailed { tier: String, cost: Cost, detail: String },
}

impl TierOutcome {
    pub fn tier(&self) -> &str {
        match self {
            TierOutcome::CacheHit { tier, .. }
            | TierOutcome::Ineligible { tier }
            | TierOutcome::BudgetExhausted { tier }
            | TierOutcome::Accepted { tier, .. }
            | TierOutcome::Rejected { tier, .. }
            | TierOutcome::InvocationFailed { tier, .. } => tier,
        }
    }

    /// Cost charged by this step (zero for skips and cache hits).
    pub fn cost(&self) -> Cost {
        match self {
            TierOutcome::Accepted { cost, .. }
            | TierOutcome::Rejected { cost, .. }
            | TierOutcome::InvocationFailed { cost, .. } => *cost,
            _ => Cost::ZERO,
        }
    }

    /// True when the provider was actually called.
    pub fn was_invoked(&self) -> bool {
        matches!(
            self,
            TierOutcome::Accepted { .. } | TierOutcome::Rejected { .. } | TierOutcome::InvocationFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierOutcomeTrace {
    pub subject: SubjectKey,
    pub batch: Option<BatchId>,
    pub force_refresh: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<TierOutcome>,
}

impl TierOutcomeTrace {
    pub fn new(subject: SubjectKey, batch: Option<BatchId>, force_refresh: bool) -> Self {
        Self {
            subject,
            batch,
            force_refresh,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: TierOutcome) {
        self.steps.push(step);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn accepted_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, TierOutcome::Accepted { .. }))
            .count()
    }

    pub fn accepted_tier(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| match s {
            TierOutcome::Accepted { tier, .. } => Some(tier.as_str()),
            _ => None,
        })
    }

    pub fn is_cache_hit(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, TierOutcome::CacheHit { .. }))
    }

    pub fn invocations(&self) -> usize {
        self.steps.iter().filter(|s| s.was_invoked()).count()
    }

    pub fn total_cost(&self) -> Cost {
        self.steps.iter().map(TierOutcome::cost).sum()
    }
}

/// Ring buffer of the most recent traces.
#[derive(Debug)]
pub struct TraceLog {
    inner: Mutex<VecDeque<TierOutcomeTrace>>,
    cap: usize,
}

impl TraceLog {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 100_000);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
        }
    }

    pub fn push(&self, trace: TierOutcomeTrace) {
        let mut v = self.inner.lock().expect("trace log mutex poisoned");
        v.push_back(trace);
        while v.len() > self.cap {
            v.pop_front();
        }
    }

    /// Oldest first.
    pub fn last_n(&self, n: usize) -> Vec<TierOutcomeTrace> {
        let v = self.inner.lock().expect("trace log mutex poisoned");
        let start = v.len().saturating_sub(n);
        v.iter().skip(start).cloned().collect()
    }

    /// Most recent trace recorded for `key`, if still retained.
    pub fn latest_for(&self, key: &str) -> Option<TierOutcomeTrace> {
        let v = self.inner.lock().expect("trace log mutex poisoned");
        v.iter().rev().find(|t| t.subject.to_string() == key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("trace log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}
