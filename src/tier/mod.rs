//! Tier contract: what a provider returns, and the trait every provider
//! client implements.

pub mod budget;
pub mod eligibility;
pub mod registry;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ledger::Cost;
use crate::subject::{Subject, SubjectKey};

/// Discovered fields, all optional. Empty strings count as missing.
pub type Fields = BTreeMap<String, String>;

/// Raw page fetched by scrape-style tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub body: String,
    pub final_url: Option<String>,
    /// Every hop the fetch went through, in order (excluding `final_url`).
    #[serde(default)]
    pub redirect_chain: Vec<String>,
}

/// What one provider invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TierResult {
    Found {
        #[serde(default)]
        fields: Fields,
        /// `None` when the provider cannot self-score.
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        cost: Cost,
        #[serde(default)]
        page: Option<ScrapedPage>,
    },
    NotFound {
        #[serde(default)]
        cost: Cost,
    },
    Error {
        #[serde(default)]
        cost: Cost,
        detail: String,
    },
}

impl TierResult {
    pub fn found(fields: Fields, confidence: f64, cost: Cost) -> Self {
        TierResult::Found {
            fields,
            confidence: Some(confidence),
            cost,
            page: None,
        }
    }

    pub fn scraped(page: ScrapedPage, cost: Cost) -> Self {
        TierResult::Found {
            fields: Fields::new(),
            confidence: None,
            cost,
            page: Some(page),
        }
    }

    pub fn cost(&self) -> Cost {
        match self {
            TierResult::Found { cost, .. }
            | TierResult::NotFound { cost }
            | TierResult::Error { cost, .. } => *cost,
        }
    }
}

/// Best rejected-but-found result so far, offered to later tiers as a hint.
/// Providers may ignore it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialHint {
    pub tier: String,
    pub fields: Fields,
    pub confidence: f64,
}

/// Per-invocation input handed to a provider.
#[derive(Debug, Clone, Copy)]
pub struct TierRequest<'a> {
    pub subject: &'a Subject,
    pub key: &'a SubjectKey,
    pub hint: Option<&'a PartialHint>,
}

/// One external data provider behind a uniform contract.
///
/// Transport errors (timeouts, 5xx) may be returned as `Err`; the waterfall
/// treats them like a not-found result and moves on. Retries and per-call
/// timeouts belong to the implementation, not the caller.
#[async_trait::async_trait]
pub trait TierProvider: Send + Sync {
    async fn invoke(&self, req: TierRequest<'_>) -> Result<TierResult>;
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_reported_for_every_variant() {
        let c = Cost::from_units(0.2);
        assert_eq!(TierResult::found(Fields::new(), 0.9, c).cost(), c);
        assert_eq!(TierResult::NotFound { cost: c }.cost(), c);
        let err = TierResult::Error {
            cost: c,
            detail: "timeout".into(),
        };
        assert_eq!(err.cost(), c);
    }

    #[test]
    fn tagged_json_shape() {
        let json = r#"{"status":"found","fields":{"email":"jo@acme.com"},"confidence":0.8,"cost":50000}"#;
        let r: TierResult = serde_json::from_str(json).unwrap();
        match r {
            TierResult::Found {
                fields, confidence, ..
            } => {
                assert_eq!(fields["email"], "jo@acme.com");
                assert_eq!(confidence, Some(0.8));
            }
            other => panic!("unexpected {other:?}"),
        }
        let nf: TierResult = serde_json::from_str(r#"{"status":"not_found"}"#).unwrap();
        assert_eq!(nf, TierResult::NotFound { cost: Cost::ZERO });
    }
}
