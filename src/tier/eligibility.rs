//! Eligibility predicates: pure boolean gates over a subject's context
//! attributes, built from equality/membership, numeric thresholds and
//! AND/OR/NOT combinators.
//!
//! A missing attribute never satisfies a primitive check.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::subject::{AttrValue, Subject};

/// Opaque predicate supplied by the integrating application.
#[derive(Clone)]
pub struct CustomPredicate {
    label: String,
    f: Arc<dyn Fn(&Subject) -> bool + Send + Sync>,
}

impl CustomPredicate {
    pub fn new(label: impl Into<String>, f: impl Fn(&Subject) -> bool + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomPredicate({})", self.label)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Eligibility {
    #[default]
    Always,
    /// Attribute equals the value (case-insensitive for text).
    Equals { attr: String, value: String },
    /// Attribute is one of the values, e.g. jurisdiction ∈ {AU}.
    OneOf { attr: String, values: Vec<String> },
    AtLeast { attr: String, min: f64 },
    AtMost { attr: String, max: f64 },
    /// Attribute is present and not `false` / blank.
    Present { attr: String },
    All { of: Vec<Eligibility> },
    Any { of: Vec<Eligibility> },
    Not { pred: Box<Eligibility> },
    #[serde(skip)]
    Custom(CustomPredicate),
}

impl Eligibility {
    pub fn equals(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Eligibility::Equals {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn one_of<I, S>(attr: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Eligibility::OneOf {
            attr: attr.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn at_least(attr: impl Into<String>, min: f64) -> Self {
        Eligibility::AtLeast {
            attr: attr.into(),
            min,
        }
    }

    pub fn at_most(attr: impl Into<String>, max: f64) -> Self {
        Eligibility::AtMost {
            attr: attr.into(),
            max,
        }
    }

    pub fn present(attr: impl Into<String>) -> Self {
        Eligibility::Present { attr: attr.into() }
    }

    pub fn custom(label: impl Into<String>, f: impl Fn(&Subject) -> bool + Send + Sync + 'static) -> Self {
        Eligibility::Custom(CustomPredicate::new(label, f))
    }

    pub fn and(self, other: Eligibility) -> Self {
        match self {
            Eligibility::All { mut of } => {
                of.push(other);
                Eligibility::All { of }
            }
            first => Eligibility::All {
                of: vec![first, other],
            },
        }
    }

    pub fn or(self, other: Eligibility) -> Self {
        match self {
            Eligibility::Any { mut of } => {
                of.push(other);
                Eligibility::Any { of }
            }
            first => Eligibility::Any {
                of: vec![first, other],
            },
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Eligibility::Not {
            pred: Box::new(self),
        }
    }

    /// Structural check run once at registry construction, so evaluation
    /// can never fail per subject.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Eligibility::Always | Eligibility::Custom(_) => Ok(()),
            Eligibility::Equals { attr, .. } | Eligibility::Present { attr } => check_attr(attr),
            Eligibility::OneOf { attr, values } => {
                check_attr(attr)?;
                if values.iter().all(|v| v.trim().is_empty()) {
                    return Err(format!("`{attr}` one_of has no values"));
                }
                Ok(())
            }
            Eligibility::AtLeast { attr, min: bound } | Eligibility::AtMost { attr, max: bound } => {
                check_attr(attr)?;
                if !bound.is_finite() {
                    return Err(format!("`{attr}` bound {bound} is not finite"));
                }
                Ok(())
            }
            Eligibility::All { of } | Eligibility::Any { of } => {
                if of.is_empty() {
                    return Err("empty combinator".to_string());
                }
                of.iter().try_for_each(Eligibility::validate)
            }
            Eligibility::Not { pred } => pred.validate(),
        }
    }

    pub fn evaluate(&self, subject: &Subject) -> bool {
        match self {
            Eligibility::Always => true,
            Eligibility::Equals { attr, value } => subject
                .context_attr(attr)
                .is_some_and(|v| v.matches_text(value)),
            Eligibility::OneOf { attr, values } => subject
                .context_attr(attr)
                .is_some_and(|v| values.iter().any(|x| v.matches_text(x))),
            Eligibility::AtLeast { attr, min } => subject
                .context_attr(attr)
                .and_then(AttrValue::as_number)
                .is_some_and(|n| n >= *min),
            Eligibility::AtMost { attr, max } => subject
                .context_attr(attr)
                .and_then(AttrValue::as_number)
                .is_some_and(|n| n <= *max),
            Eligibility::Present { attr } => match subject.context_attr(attr) {
                None | Some(AttrValue::Bool(false)) => false,
                Some(AttrValue::Text(s)) => !s.trim().is_empty(),
                Some(_) => true,
            },
            Eligibility::All { of } => of.iter().all(|p| p.evaluate(subject)),
            Eligibility::Any { of } => of.iter().any(|p| p.evaluate(subject)),
            Eligibility::Not { pred } => !pred.evaluate(subject),
            Eligibility::Custom(c) => (c.f)(subject),
        }
    }
}

fn check_attr(attr: &str) -> Result<(), String> {
    if attr.trim().is_empty() {
        Err("attribute name is empty".to_string())
    } else {
        Ok(())
    }
}
