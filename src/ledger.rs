//! # Cost Ledger
//! Append-only record of what each tier attempt cost, in a single accounting
//! currency. Pure bookkeeping, no I/O.
//!
//! Amounts are fixed-point micro-units so totals are exact and do not depend
//! on the order concurrent subjects finished in.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subject::SubjectKey;

const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// Non-negative amount in the accounting currency, stored as micro-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_micros(micros: u64) -> Self {
        Cost(micros)
    }

    /// Rounds to the nearest micro-unit; negative or non-finite input is zero.
    pub fn from_units(units: f64) -> Self {
        if !units.is_finite() || units <= 0.0 {
            return Cost::ZERO;
        }
        Cost((units * MICROS_PER_UNIT).round() as u64)
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    pub fn as_units(self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for Cost {
    type Output = Cost;
    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, |a, b| a + b)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Identifier of one `enrich_batch` run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        BatchId(id.into())
    }

    /// Timestamp + process-local sequence, unique within a process.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        BatchId(format!("b{}-{:04}", Utc::now().format("%Y%m%dT%H%M%S"), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tier: String,
    pub subject: SubjectKey,
    pub cost: Cost,
    pub at: DateTime<Utc>,
    /// `None` for single-subject `enrich` calls.
    pub batch: Option<BatchId>,
}

#[derive(Debug, Default)]
pub struct CostLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: LedgerEntry) {
        let mut v = self.entries.lock().expect("ledger mutex poisoned");
        v.push(entry);
    }

    pub fn total_for(&self, batch: &BatchId) -> Cost {
        let v = self.entries.lock().expect("ledger mutex poisoned");
        v.iter()
            .filter(|e| e.batch.as_ref() == Some(batch))
            .map(|e| e.cost)
            .sum()
    }

    pub fn total(&self) -> Cost {
        let v = self.entries.lock().expect("ledger mutex poisoned");
        v.iter().map(|e| e.cost).sum()
    }

    pub fn entries_for(&self, batch: &BatchId) -> Vec<LedgerEntry> {
        let v = self.entries.lock().expect("ledger mutex poisoned");
        v.iter()
            .filter(|e| e.batch.as_ref() == Some(batch))
            .cloned()
            .collect()
    }

    pub fn totals_by_tier(&self, batch: Option<&BatchId>) -> BTreeMap<String, Cost> {
        let v = self.entries.lock().expect("ledger mutex poisoned");
        let mut out = BTreeMap::new();
        for e in v.iter().filter(|e| batch.is_none() || e.batch.as_ref() == batch) {
            *out.entry(e.tier.clone()).or_insert(Cost::ZERO) += e.cost;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("ledger mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
