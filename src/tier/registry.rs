//! Ordered tier configuration.
//!
//! Descriptors are validated and sorted once at construction; afterwards the
//! registry is read-only. Ordinal ties keep configuration order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ledger::Cost;
use crate::tier::eligibility::Eligibility;
use crate::tier::TierProvider;
use crate::validate::ValidationMode;

/// Static configuration of one waterfall step.
#[derive(Clone)]
pub struct TierDescriptor {
    name: String,
    ordinal: i32,
    unit_cost: f64,
    eligibility: Eligibility,
    budget_fraction: Option<f64>,
    validation: ValidationMode,
    provider: Arc<dyn TierProvider>,
}

impl fmt::Debug for TierDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierDescriptor")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .field("unit_cost", &self.unit_cost)
            .field("eligibility", &self.eligibility)
            .field("budget_fraction", &self.budget_fraction)
            .field("validation", &self.validation)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl TierDescriptor {
    pub fn new(name: impl Into<String>, ordinal: i32, provider: Arc<dyn TierProvider>) -> Self {
        Self {
            name: name.into(),
            ordinal,
            unit_cost: 0.0,
            eligibility: Eligibility::Always,
            budget_fraction: None,
            validation: ValidationMode::default(),
            provider,
        }
    }

    pub fn unit_cost(mut self, units: f64) -> Self {
        self.unit_cost = units;
        self
    }

    pub fn eligible_when(mut self, pred: Eligibility) -> Self {
        self.eligibility = pred;
        self
    }

    /// At most `floor(batch_size × fraction)` subjects of a batch may use this tier.
    pub fn budget(mut self, fraction: f64) -> Self {
        self.budget_fraction = Some(fraction);
        self
    }

    pub fn validation(mut self, mode: ValidationMode) -> Self {
        self.validation = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn approx_cost(&self) -> Cost {
        Cost::from_units(self.unit_cost)
    }

    pub fn eligibility(&self) -> &Eligibility {
        &self.eligibility
    }

    pub fn budget_fraction(&self) -> Option<f64> {
        self.budget_fraction
    }

    pub fn validation_mode(&self) -> &ValidationMode {
        &self.validation
    }

    pub fn provider(&self) -> &Arc<dyn TierProvider> {
        &self.provider
    }

    fn check(&self) -> Result<(), ConfigError> {
        if let Some(f) = self.budget_fraction {
            if !(f.is_finite() && f > 0.0 && f <= 1.0) {
                return Err(ConfigError::BudgetFraction {
                    tier: self.name.clone(),
                    fraction: f,
                });
            }
        }
        if !(self.unit_cost.is_finite() && self.unit_cost >= 0.0) {
            return Err(ConfigError::InvalidCost {
                tier: self.name.clone(),
                cost: self.unit_cost,
            });
        }
        self.eligibility
            .validate()
            .map_err(|reason| ConfigError::Eligibility {
                tier: self.name.clone(),
                reason,
            })?;
        if let ValidationMode::Fields {
            threshold: Some(t), ..
        } = &self.validation
        {
            if !(0.0..=1.0).contains(t) {
                return Err(ConfigError::InvalidThreshold {
                    field: format!("tiers.{}.validation.threshold", self.name),
                    value: *t,
                });
            }
        }
        Ok(())
    }
}

/// Serializable form of a descriptor; the provider is bound by `name`.
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub ordinal: i32,
    #[serde(default)]
    pub unit_cost: f64,
    #[serde(default)]
    pub budget_fraction: Option<f64>,
    #[serde(default)]
    pub eligibility: Eligibility,
    #[serde(default)]
    pub validation: ValidationMode,
}

#[derive(Debug, Clone)]
pub struct TierRegistry {
    tiers: Vec<TierDescriptor>,
}

impl TierRegistry {
    pub fn new(mut tiers: Vec<TierDescriptor>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for t in &tiers {
            t.check()?;
            if !seen.insert(t.name.clone()) {
                return Err(ConfigError::DuplicateTier(t.name.clone()));
            }
        }
        // stable: equal ordinals keep configuration order
        tiers.sort_by_key(|t| t.ordinal);
        Ok(Self { tiers })
    }

    /// Build from config, binding each tier to an injected provider instance.
    pub fn from_config(
        configs: &[TierConfig],
        providers: &HashMap<String, Arc<dyn TierProvider>>,
    ) -> Result<Self, ConfigError> {
        let tiers = configs
            .iter()
            .map(|c| {
                let provider = providers
                    .get(&c.name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownProvider(c.name.clone()))?;
                let mut d = TierDescriptor::new(c.name.clone(), c.ordinal, provider)
                    .unit_cost(c.unit_cost)
                    .eligible_when(c.eligibility.clone())
                    .validation(c.validation.clone());
                d.budget_fraction = c.budget_fraction;
                Ok(d)
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(tiers)
    }

    pub fn tiers(&self) -> &[TierDescriptor] {
        &self.tiers
    }

    pub fn get(&self, name: &str) -> Option<&TierDescriptor> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fixed::StaticProvider;
    use crate::tier::TierResult;

    fn p(name: &str) -> Arc<dyn TierProvider> {
        Arc::new(StaticProvider::new(name, TierResult::NotFound { cost: Cost::ZERO }))
    }

    #[test]
    fn sorted_by_ordinal_with_stable_ties() {
        let reg = TierRegistry::new(vec![
            TierDescriptor::new("premium", 30, p("premium")),
            TierDescriptor::new("cache-ish", 10, p("a")),
            TierDescriptor::new("hunter", 20, p("b")),
            TierDescriptor::new("apollo", 20, p("c")),
        ])
        .unwrap();
        assert_eq!(reg.names(), vec!["cache-ish", "hunter", "apollo", "premium"]);
    }

    #[test]
    fn budget_fraction_out_of_range_fails_construction() {
        for f in [0.0, -0.1, 1.5, f64::NAN] {
            let err = TierRegistry::new(vec![TierDescriptor::new("clay", 1, p("clay")).budget(f)]).unwrap_err();
            assert!(matches!(err, ConfigError::BudgetFraction { .. }), "{f}: {err}");
        }
        assert!(TierRegistry::new(vec![TierDescriptor::new("clay", 1, p("clay")).budget(1.0)]).is_ok());
    }

    #[test]
    fn malformed_eligibility_fails_construction() {
        let err = TierRegistry::new(vec![TierDescriptor::new("abn", 1, p("abn"))
            .eligible_when(Eligibility::one_of("jurisdiction", Vec::<String>::new()))])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Eligibility { .. }));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = TierRegistry::new(vec![
            TierDescriptor::new("x", 1, p("x")),
            TierDescriptor::new("x", 2, p("x")),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTier(n) if n == "x"));
    }

    #[test]
    fn from_config_requires_injected_provider() {
        let cfgs: Vec<TierConfig> = toml::from_str::<HashMap<String, Vec<TierConfig>>>(
            r#"
[[tiers]]
name = "abn_lookup"
ordinal = 1
eligibility = { op = "one_of", attr = "jurisdiction", values = ["AU"] }
validation = { mode = "fields", required_fields = ["abn"] }

[[tiers]]
name = "premium"
ordinal = 3
unit_cost = 0.40
budget_fraction = 0.15
"#,
        )
        .unwrap()
        .remove("tiers")
        .unwrap();

        let mut providers: HashMap<String, Arc<dyn TierProvider>> = HashMap::new();
        providers.insert("abn_lookup".into(), p("abn_lookup"));
        let err = TierRegistry::from_config(&cfgs, &providers).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(n) if n == "premium"));

        providers.insert("premium".into(), p("premium"));
        let reg = TierRegistry::from_config(&cfgs, &providers).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get("premium").unwrap().budget_fraction(), Some(0.15));
        assert_eq!(reg.get("premium").unwrap().approx_cost(), Cost::from_units(0.40));
    }
}
