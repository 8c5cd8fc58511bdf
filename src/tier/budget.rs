//! Per-batch budget caps for rationed tiers.
//!
//! `cap = floor(batch_size × fraction)` is fixed at batch start. Each
//! admission takes one slot with an atomic decrement-if-positive, so
//! concurrent subjects can never both take the last slot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::tier::registry::TierRegistry;

#[derive(Debug)]
struct Slot {
    cap: usize,
    remaining: AtomicUsize,
}

/// Shared handle passed into every subject orchestration of one batch.
#[derive(Debug, Default)]
pub struct BatchBudget {
    slots: BTreeMap<String, Slot>,
}

/// Snapshot of one tier's consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub cap: usize,
    pub admitted: usize,
}

impl BatchBudget {
    /// Caps for every budgeted tier of `registry`, sized for `batch_size`.
    pub fn for_batch(registry: &TierRegistry, batch_size: usize) -> Self {
        let mut slots = BTreeMap::new();
        for t in registry.tiers() {
            if let Some(fraction) = t.budget_fraction() {
                let cap = cap_for(batch_size, fraction);
                slots.insert(
                    t.name().to_string(),
                    Slot {
                        cap,
                        remaining: AtomicUsize::new(cap),
                    },
                );
            }
        }
        Self { slots }
    }

    /// Take one slot. Tiers without a cap always succeed.
    pub fn try_admit(&self, tier: &str) -> bool {
        let Some(slot) = self.slots.get(tier) else {
            return true;
        };
        slot.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn usage(&self, tier: &str) -> Option<BudgetUsage> {
        self.slots.get(tier).map(|s| BudgetUsage {
            cap: s.cap,
            admitted: s.cap - s.remaining.load(Ordering::Acquire),
        })
    }

    pub fn snapshot(&self) -> BTreeMap<String, BudgetUsage> {
        self.slots
            .keys()
            .filter_map(|k| self.usage(k).map(|u| (k.clone(), u)))
            .collect()
    }
}

/// `floor(batch_size × fraction)`, with a small epsilon so 20 × 0.15 is 3
/// and not 2 from binary rounding.
pub fn cap_for(batch_size: usize, fraction: f64) -> usize {
    let raw = batch_size as f64 * fraction;
    (raw + 1e-9).floor().max(0.0) as usize
}
