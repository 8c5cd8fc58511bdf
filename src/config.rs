//! Deployment configuration (TOML or JSON) with env overrides.
//!
//! Lookup order for [`WaterfallConfig::load_default`]:
//! 1) `$WATERFALL_CONFIG_PATH` (must exist if set)
//! 2) `config/waterfall.toml`
//! 3) `config/waterfall.json`
//! 4) built-in defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::cache::{CacheStore, EnrichmentCache, FileStore, MemoryStore, DEFAULT_CACHE_TTL_DAYS, DEFAULT_CACHE_VERSION};
use crate::error::ConfigError;
use crate::orchestrator::DEFAULT_TRACE_CAPACITY;
use crate::tier::registry::TierConfig;
use crate::validate::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_NOMINAL_CONFIDENCE};

pub const DEFAULT_CONFIG_PATH: &str = "config/waterfall.toml";
pub const FALLBACK_JSON_CONFIG_PATH: &str = "config/waterfall.json";
pub const DEFAULT_CONCURRENCY: usize = 8;

pub const ENV_CONFIG_PATH: &str = "WATERFALL_CONFIG_PATH";
pub const ENV_CONFIDENCE_THRESHOLD: &str = "WATERFALL_CONFIDENCE_THRESHOLD";
pub const ENV_CACHE_TTL_DAYS: &str = "WATERFALL_CACHE_TTL_DAYS";
pub const ENV_CACHE_VERSION: &str = "WATERFALL_CACHE_VERSION";
pub const ENV_CONCURRENCY: &str = "WATERFALL_CONCURRENCY";
pub const ENV_TRACE_CAPACITY: &str = "WATERFALL_TRACE_CAPACITY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub version: String,
    pub ttl_days: i64,
    /// Durable file store directory; in-memory when absent.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            ttl_days: DEFAULT_CACHE_TTL_DAYS,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaterfallConfig {
    pub confidence_threshold: f64,
    /// Confidence assumed for providers that cannot self-score.
    pub nominal_confidence: f64,
    /// Subjects enriched in parallel by the batch coordinator.
    pub concurrency: usize,
    pub trace_capacity: usize,
    /// Optional backstop around provider calls.
    pub provider_timeout_ms: Option<u64>,
    pub cache: CacheConfig,
    pub tiers: Vec<TierConfig>,
}

impl Default for WaterfallConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nominal_confidence: DEFAULT_NOMINAL_CONFIDENCE,
            concurrency: DEFAULT_CONCURRENCY,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            provider_timeout_ms: None,
            cache: CacheConfig::default(),
            tiers: Vec::new(),
        }
    }
}

impl WaterfallConfig {
    /// Parse an explicit file; format by extension, sniffing as fallback.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = Self::parse(&content, &ext)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        info!(
            path = %path.display(),
            tiers = cfg.tiers.len(),
            threshold = cfg.confidence_threshold,
            "waterfall config loaded"
        );
        Ok(cfg)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(ConfigError::Parse(format!(
                    "{ENV_CONFIG_PATH} points to non-existent path {}",
                    pb.display()
                )));
            }
            return Self::load_from(&pb);
        }
        for candidate in [DEFAULT_CONFIG_PATH, FALLBACK_JSON_CONFIG_PATH] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(s: &str, hint_ext: &str) -> Result<Self, ConfigError> {
        let looks_json = s.trim_start().starts_with('{');
        if hint_ext == "json" || (hint_ext != "toml" && looks_json) {
            return serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()));
        }
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Env wins over file values. Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(t) = env_parse::<f64>(ENV_CONFIDENCE_THRESHOLD) {
            self.confidence_threshold = t.clamp(0.0, 1.0);
        }
        if let Some(days) = env_parse::<i64>(ENV_CACHE_TTL_DAYS) {
            self.cache.ttl_days = days.max(0);
        }
        if let Ok(v) = std::env::var(ENV_CACHE_VERSION) {
            if !v.trim().is_empty() {
                self.cache.version = v.trim().to_string();
            }
        }
        if let Some(n) = env_parse::<usize>(ENV_CONCURRENCY) {
            self.concurrency = n.max(1);
        }
        if let Some(n) = env_parse::<usize>(ENV_TRACE_CAPACITY) {
            self.trace_capacity = n.max(1);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nominal_confidence", self.nominal_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold {
                    field: field.to_string(),
                    value,
                });
            }
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Parse("concurrency must be at least 1".into()));
        }
        if self.cache.version.trim().is_empty() {
            return Err(ConfigError::Parse("cache.version must not be empty".into()));
        }
        self.cache_ttl()?;
        Ok(())
    }

    fn cache_ttl(&self) -> Result<chrono::Duration, ConfigError> {
        let days = self.cache.ttl_days;
        if days < 0 {
            return Err(ConfigError::InvalidTtl(days));
        }
        chrono::Duration::try_days(days).ok_or(ConfigError::InvalidTtl(days))
    }

    pub fn build_cache(&self) -> Result<EnrichmentCache, ConfigError> {
        let store: Arc<dyn CacheStore> = match &self.cache.dir {
            Some(dir) => Arc::new(FileStore::new(dir).map_err(|e| ConfigError::Io {
                path: dir.clone(),
                source: std::io::Error::other(format!("{e:#}")),
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let ttl = self.cache_ttl()?;
        Ok(EnrichmentCache::new(store, self.cache.version.clone(), ttl))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::ValidationMode;
    use std::env;

    const SAMPLE: &str = r#"
confidence_threshold = 0.75
concurrency = 4

[cache]
version = "v3"
ttl_days = 90

[[tiers]]
name = "abn_lookup"
ordinal = 1
eligibility = { op = "one_of", attr = "jurisdiction", values = ["AU"] }
validation = { mode = "fields", required_fields = ["abn", "legal_name"] }

[[tiers]]
name = "light_scrape"
ordinal = 2
unit_cost = 0.001
validation = { mode = "content", min_bytes = 300 }

[[tiers]]
name = "premium_identity"
ordinal = 9
unit_cost = 0.40
budget_fraction = 0.15
eligibility = { op = "at_least", attr = "lead_score", min = 85 }
"#;

    fn clear_env() {
        for v in [
            ENV_CONFIG_PATH,
            ENV_CONFIDENCE_THRESHOLD,
            ENV_CACHE_TTL_DAYS,
            ENV_CACHE_VERSION,
            ENV_CONCURRENCY,
            ENV_TRACE_CAPACITY,
        ] {
            env::remove_var(v);
        }
    }

    #[serial_test::serial]
    #[test]
    fn parses_toml_tiers_and_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("waterfall.toml");
        fs::write(&p, SAMPLE).unwrap();

        let cfg = WaterfallConfig::load_from(&p).unwrap();
        assert_eq!(cfg.confidence_threshold, 0.75);
        assert_eq!(cfg.nominal_confidence, DEFAULT_NOMINAL_CONFIDENCE);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.cache.version, "v3");
        assert_eq!(cfg.cache.ttl_days, 90);
        assert_eq!(cfg.tiers.len(), 3);
        assert_eq!(cfg.tiers[2].budget_fraction, Some(0.15));
        match &cfg.tiers[1].validation {
            ValidationMode::Content(rules) => {
                assert_eq!(rules.min_bytes, 300);
                assert!(!rules.blocked_markers.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[serial_test::serial]
    #[test]
    fn json_config_is_accepted() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("waterfall.json");
        fs::write(&p, r#"{"confidence_threshold": 0.8, "tiers": [{"name": "x", "ordinal": 1}]}"#).unwrap();
        let cfg = WaterfallConfig::load_from(&p).unwrap();
        assert_eq!(cfg.confidence_threshold, 0.8);
        assert_eq!(cfg.tiers[0].name, "x");
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_take_precedence() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("waterfall.toml");
        fs::write(&p, SAMPLE).unwrap();

        env::set_var(ENV_CONFIDENCE_THRESHOLD, "1.7");
        env::set_var(ENV_CACHE_VERSION, "v4");
        env::set_var(ENV_CONCURRENCY, "0");
        env::set_var(ENV_CACHE_TTL_DAYS, "not-a-number");
        let cfg = WaterfallConfig::load_from(&p).unwrap();
        clear_env();

        assert_eq!(cfg.confidence_threshold, 1.0);
        assert_eq!(cfg.cache.version, "v4");
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.cache.ttl_days, 90);
    }

    #[serial_test::serial]
    #[test]
    fn invalid_threshold_in_file_is_rejected() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("waterfall.toml");
        fs::write(&p, "nominal_confidence = 1.5\n").unwrap();
        let err = WaterfallConfig::load_from(&p).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }

    #[serial_test::serial]
    #[test]
    fn out_of_range_ttl_is_a_config_error() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("waterfall.toml");
        fs::write(&p, "[cache]\nttl_days = 9999999999999999\n").unwrap();
        let err = WaterfallConfig::load_from(&p).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTtl(9999999999999999)));

        fs::write(&p, "[cache]\nttl_days = 7\n").unwrap();
        env::set_var(ENV_CACHE_TTL_DAYS, "9999999999999999");
        let err = WaterfallConfig::load_from(&p).unwrap_err();
        clear_env();
        assert!(matches!(err, ConfigError::InvalidTtl(_)));

        let mut cfg = WaterfallConfig::default();
        cfg.cache.ttl_days = i64::MAX;
        assert!(matches!(cfg.build_cache(), Err(ConfigError::InvalidTtl(_))));
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        clear_env();
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();

        // nothing on disk → built-in defaults
        let cfg = WaterfallConfig::load_default().unwrap();
        assert!(cfg.tiers.is_empty());
        assert_eq!(cfg.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);

        // fallback file in ./config/
        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(tmp.path().join(DEFAULT_CONFIG_PATH), SAMPLE).unwrap();
        assert_eq!(WaterfallConfig::load_default().unwrap().tiers.len(), 3);

        // env path wins; missing env path is an error
        env::set_var(ENV_CONFIG_PATH, tmp.path().join("nope.toml").display().to_string());
        assert!(WaterfallConfig::load_default().is_err());
        clear_env();

        env::set_current_dir(&old).unwrap();
    }

    #[test]
    fn file_cache_dir_builds_durable_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WaterfallConfig {
            cache: CacheConfig {
                dir: Some(dir.path().join("cache")),
                ..CacheConfig::default()
            },
            ..WaterfallConfig::default()
        };
        let cache = cfg.build_cache().unwrap();
        assert_eq!(cache.version(), DEFAULT_CACHE_VERSION);
        assert!(dir.path().join("cache").is_dir());
    }
}
