//! Error types raised to callers.
//!
//! Only configuration mistakes and un-normalizable subjects surface as errors.
//! Provider failures, validation rejections and exhausted waterfalls are normal
//! outcomes and live in the trace / `EnrichOutcome` instead.

use std::path::PathBuf;

/// Per-subject errors returned from `Waterfall::enrich`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichError {
    /// No identifying field could be normalized into a lookup key.
    #[error("subject has no usable identifier: {reason}")]
    SubjectInvalid { reason: String },
}

/// Registry / configuration errors. These are bugs in deployment config and
/// fail at construction time, never per subject.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Budget fraction outside `(0, 1]`.
    #[error("tier `{tier}`: budget fraction {fraction} is outside (0, 1]")]
    BudgetFraction { tier: String, fraction: f64 },

    /// Eligibility predicate cannot be evaluated (empty set, NaN bound, ...).
    #[error("tier `{tier}`: invalid eligibility predicate: {reason}")]
    Eligibility { tier: String, reason: String },

    #[error("duplicate tier name `{0}`")]
    DuplicateTier(String),

    /// Tier configured but no provider instance was injected for it.
    #[error("no provider registered for tier `{0}`")]
    UnknownProvider(String),

    #[error("{field} = {value} is outside [0, 1]")]
    InvalidThreshold { field: String, value: f64 },

    #[error("tier `{tier}`: unit cost {cost} must be a finite, non-negative amount")]
    InvalidCost { tier: String, cost: f64 },

    #[error("cache.ttl_days = {0} is negative or out of range")]
    InvalidTtl(i64),

    #[error("reading config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(String),
}
