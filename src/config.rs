//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults, so a missing section yields the documented
//! values. Secrets (API keys) are referenced by env-var name in the config
//! and resolved at runtime.
//!
//! Invalid values are rejected by [`AppConfig::validate`] at startup,
//! never silently replaced.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::engine::detection::EngineConfig;
use crate::engine::ranker::RankerConfig;
use crate::engine::scanner::ScannerConfig;
use crate::types::{EngineError, EngineResult, RiskProfile};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub scanner: ScannerConfig,
    pub fusion: FusionSection,
    pub ranker: RankerConfig,
    pub risk: RiskSection,
    pub advisor: AdvisorSection,
    pub exchange: ExchangeSection,
    pub dashboard: DashboardSection,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineSection {
    pub name: String,
    pub cycle_interval_secs: u64,
    /// First backoff after a failed cycle; doubles per consecutive failure.
    pub error_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub advisory_timeout_secs: u64,
    pub advisory_concurrency: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            name: "TRADESCOUT-001".to_string(),
            cycle_interval_secs: 30,
            error_backoff_secs: 5,
            max_backoff_secs: 300,
            advisory_timeout_secs: 10,
            advisory_concurrency: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FusionSection {
    /// Relative weight per strategy id. Need not sum to 1.
    pub weights: BTreeMap<String, f64>,
    /// Fallback stop distance. Uses the active profile's `stop_loss_pct` when unset.
    pub fallback_stop_pct: Option<f64>,
    /// Fallback target distance. Uses the active profile's `take_profit_pct` when unset.
    pub fallback_target_pct: Option<f64>,
}

impl Default for FusionSection {
    fn default() -> Self {
        let weights = [
            ("support_resistance", 0.20),
            ("channel", 0.15),
            ("ict", 0.25),
            ("fibonacci", 0.15),
            ("session", 0.15),
            ("spread", 0.10),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            weights,
            fallback_stop_pct: None,
            fallback_target_pct: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskSection {
    pub active_profile: String,
    /// Extra profiles. A custom profile named like a built-in replaces it.
    pub custom_profiles: Vec<RiskProfile>,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            active_profile: "conservative".to_string(),
            custom_profiles: Vec::new(),
        }
    }
}

impl RiskSection {
    /// Built-in profiles merged with custom ones, keyed by name.
    pub fn profiles(&self) -> BTreeMap<String, RiskProfile> {
        RiskProfile::builtin()
            .into_iter()
            .chain(self.custom_profiles.iter().cloned())
            .map(|p| (p.name.clone(), p))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdvisorSection {
    pub enabled: bool,
    /// OpenAI-compatible chat completions base URL.
    pub base_url: String,
    pub model: String,
    /// Env var holding the bearer token. Unset for local endpoints.
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
}

impl Default for AdvisorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            max_tokens: 256,
        }
    }
}

impl AdvisorSection {
    /// Resolve the API key, if one is configured and set.
    pub fn api_key(&self) -> Option<SecretString> {
        self.api_key_env
            .as_deref()
            .and_then(|env| AppConfig::resolve_env(env).ok())
            .filter(|k| !k.is_empty())
            .map(SecretString::new)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExchangeSection {
    /// REST base URL. Defaults to the public Binance endpoint.
    pub base_url: Option<String>,
    pub quote_asset: String,
    /// Leverage ceiling attributed to every pair.
    pub max_leverage: f64,
    pub paper_balance: f64,
    pub state_file: Option<String>,
    /// Discard the saved portfolio on startup.
    pub fresh_start: bool,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        Self {
            base_url: None,
            quote_asset: "USDT".to_string(),
            max_leverage: 20.0,
            paper_balance: 10_000.0,
            state_file: None,
            fresh_start: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardSection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Check the configuration against the strategies that will run.
    pub fn validate(&self, strategy_ids: &[&str]) -> EngineResult<()> {
        let err = |msg: String| Err(EngineError::Configuration(msg));

        for (id, w) in &self.fusion.weights {
            if !w.is_finite() || *w < 0.0 {
                return err(format!("weight for '{id}' must be a non-negative number, got {w}"));
            }
        }
        for id in strategy_ids {
            if !self.fusion.weights.contains_key(*id) {
                return err(format!("strategy '{id}' has no fusion weight"));
            }
        }
        for (name, pct) in [
            ("fallback_stop_pct", self.fusion.fallback_stop_pct),
            ("fallback_target_pct", self.fusion.fallback_target_pct),
        ] {
            if let Some(v) = pct {
                if !(v > 0.0 && v < 1.0) {
                    return err(format!("{name} must be in (0, 1), got {v}"));
                }
            }
        }

        let profiles = self.risk.profiles();
        for profile in profiles.values() {
            profile.validate()?;
        }
        if !profiles.contains_key(&self.risk.active_profile) {
            return err(format!("unknown active profile '{}'", self.risk.active_profile));
        }

        self.scanner.validate()?;
        self.ranker.validate()?;

        if self.engine.cycle_interval_secs == 0 {
            return err("cycle_interval_secs must be at least 1".to_string());
        }
        if self.engine.advisory_concurrency == 0 {
            return err("advisory_concurrency must be at least 1".to_string());
        }
        if !(self.exchange.paper_balance >= 0.0) {
            return err(format!("paper_balance must be non-negative, got {}", self.exchange.paper_balance));
        }
        Ok(())
    }

    /// Loop timing and advisory settings for the detection engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cycle_interval: Duration::from_secs(self.engine.cycle_interval_secs),
            error_backoff: Duration::from_secs(self.engine.error_backoff_secs),
            max_backoff: Duration::from_secs(self.engine.max_backoff_secs.max(self.engine.error_backoff_secs)),
            timeframes: self.scanner.timeframes.clone(),
            advisory_timeout: Duration::from_secs(self.engine.advisory_timeout_secs),
            advisory_concurrency: self.engine.advisory_concurrency,
            fallback_stop_pct: self.fusion.fallback_stop_pct,
            fallback_target_pct: self.fusion.fallback_target_pct,
        }
    }
}
