//! # Result Validator
//! Decides whether a tier's result clears the quality bar.
//!
//! Two modes, chosen per tier:
//! - **fields**: `found`, confidence ≥ threshold, every required field non-empty.
//! - **content**: scrape-style checks on the raw page (see [`content`]).
//!
//! Both are pure functions of their inputs.

pub mod content;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tier::{ScrapedPage, TierResult};

pub use content::ContentRules;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.70;
pub const DEFAULT_NOMINAL_CONFIDENCE: f64 = 0.50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidationMode {
    Fields {
        #[serde(default)]
        required_fields: Vec<String>,
        /// Overrides the deployment-wide threshold for this tier.
        #[serde(default)]
        threshold: Option<f64>,
    },
    Content(ContentRules),
}

impl Default for ValidationMode {
    fn default() -> Self {
        ValidationMode::Fields {
            required_fields: Vec::new(),
            threshold: None,
        }
    }
}

impl ValidationMode {
    pub fn fields<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ValidationMode::Fields {
            required_fields: required.into_iter().map(Into::into).collect(),
            threshold: None,
        }
    }

    pub fn with_threshold(self, t: f64) -> Self {
        match self {
            ValidationMode::Fields {
                required_fields, ..
            } => ValidationMode::Fields {
                required_fields,
                threshold: Some(t),
            },
            other => other,
        }
    }
}

/// Deployment-wide defaults the modes fall back to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorDefaults {
    pub threshold: f64,
    /// Confidence assumed for providers that cannot self-score.
    pub nominal_confidence: f64,
}

impl Default for ValidatorDefaults {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nominal_confidence: DEFAULT_NOMINAL_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    NotFound,
    LowConfidence { confidence: f64, threshold: f64 },
    MissingRequiredField { field: String },
    ContentTooShort { len: usize, min: usize },
    BlockedContentDetected { markers: Vec<String> },
    ParkedDomainDetected { evidence: String },
}

impl RejectReason {
    /// Stable reason code, e.g. `missing_required_field:email`.
    pub fn code(&self) -> String {
        match self {
            RejectReason::NotFound => "not_found".to_string(),
            RejectReason::LowConfidence { .. } => "low_confidence".to_string(),
            RejectReason::MissingRequiredField { field } => {
                format!("missing_required_field:{field}")
            }
            RejectReason::ContentTooShort { .. } => "content_too_short".to_string(),
            RejectReason::BlockedContentDetected { .. } => "blocked_content_detected".to_string(),
            RejectReason::ParkedDomainDetected { .. } => "parked_domain_detected".to_string(),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// Accepted with the effective confidence.
    Accept { confidence: f64 },
    Reject(RejectReason),
}

impl ValidationOutcome {
    pub fn is_accept(&self) -> bool {
        matches!(self, ValidationOutcome::Accept { .. })
    }
}

/// Effective confidence: self-reported, else the nominal default; clamped to [0,1].
pub fn effective_confidence(reported: Option<f64>, defaults: &ValidatorDefaults) -> f64 {
    reported
        .filter(|c| c.is_finite())
        .unwrap_or(defaults.nominal_confidence)
        .clamp(0.0, 1.0)
}

pub fn validate(result: &TierResult, mode: &ValidationMode, defaults: &ValidatorDefaults) -> ValidationOutcome {
    let TierResult::Found {
        fields,
        confidence,
        page,
        ..
    } = result
    else {
        return ValidationOutcome::Reject(RejectReason::NotFound);
    };
    let confidence = effective_confidence(*confidence, defaults);

    match mode {
        ValidationMode::Fields {
            required_fields,
            threshold,
        } => {
            let threshold = threshold.unwrap_or(defaults.threshold);
            if confidence < threshold {
                return ValidationOutcome::Reject(RejectReason::LowConfidence {
                    confidence,
                    threshold,
                });
            }
            for name in required_fields {
                let present = fields.get(name).is_some_and(|v| !v.trim().is_empty());
                if !present {
                    return ValidationOutcome::Reject(RejectReason::MissingRequiredField {
                        field: name.clone(),
                    });
                }
            }
            ValidationOutcome::Accept { confidence }
        }
        ValidationMode::Content(rules) => {
            let empty = ScrapedPage::default();
            match rules.check(page.as_ref().unwrap_or(&empty)) {
                Ok(()) => ValidationOutcome::Accept { confidence },
                Err(reason) => ValidationOutcome::Reject(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Cost;
    use crate::tier::Fields;

    fn found(conf: Option<f64>, pairs: &[(&str, &str)]) -> TierResult {
        let fields: Fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TierResult::Found {
            fields,
            confidence: conf,
            cost: Cost::ZERO,
            page: None,
        }
    }

    #[test]
    fn not_found_and_error_reject_as_not_found() {
        let d = ValidatorDefaults::default();
        let mode = ValidationMode::fields(["email"]);
        for r in [
            TierResult::NotFound { cost: Cost::ZERO },
            TierResult::Error {
                cost: Cost::ZERO,
                detail: "504".into(),
            },
        ] {
            assert_eq!(
                validate(&r, &mode, &d),
                ValidationOutcome::Reject(RejectReason::NotFound)
            );
        }
    }

    #[test]
    fn low_confidence_rejected_before_field_check() {
        let d = ValidatorDefaults::default();
        let out = validate(&found(Some(0.5), &[]), &ValidationMode::fields(["email"]), &d);
        match out {
            ValidationOutcome::Reject(r) => assert_eq!(r.code(), "low_confidence"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let d = ValidatorDefaults::default();
        let out = validate(&found(Some(0.70), &[("email", "x@y.com")]), &ValidationMode::fields(["email"]), &d);
        assert!(out.is_accept());
    }

    #[test]
    fn blank_required_field_is_missing() {
        let d = ValidatorDefaults::default();
        let r = found(Some(0.95), &[("email", "jo@acme.com"), ("phone", "  ")]);
        let out = validate(&r, &ValidationMode::fields(["email", "phone"]), &d);
        match out {
            ValidationOutcome::Reject(r) => assert_eq!(r.code(), "missing_required_field:phone"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nominal_confidence_used_when_provider_cannot_score() {
        let d = ValidatorDefaults {
            threshold: 0.7,
            nominal_confidence: 0.8,
        };
        let out = validate(&found(None, &[("abn", "123")]), &ValidationMode::fields(["abn"]), &d);
        assert_eq!(out, ValidationOutcome::Accept { confidence: 0.8 });

        let strict = ValidationMode::fields(["abn"]).with_threshold(0.9);
        assert!(!validate(&found(None, &[("abn", "123")]), &strict, &d).is_accept());
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let d = ValidatorDefaults::default();
        assert_eq!(effective_confidence(Some(1.7), &d), 1.0);
        assert_eq!(effective_confidence(Some(f64::NAN), &d), d.nominal_confidence);
    }
}
