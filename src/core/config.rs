//! Configuration - Type-safe config loaded from `config.toml`.
//!
//! Nothing reloads on its own; `EngineContext::reload` is the only way a
//! running process picks up an edited file.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::types::{InstrumentType, OrderLimits, Route, StratMode};
use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Simulated kill-switch behaviour of the logging simulator
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,

    /// Broker/route used when no primary broker can take an order
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Risk-limit defaults
    #[serde(default)]
    pub risk: RiskLimitsConfig,

    #[serde(default)]
    pub shm: ShmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    #[default]
    LogSimulator,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix of every client order id; random when absent
    pub instance_id: Option<String>,

    /// Fallback log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub bartering_link: LinkKind,

    #[serde(default = "default_sim_host")]
    pub log_simulator_host: String,

    #[serde(default = "default_sim_port")]
    pub log_simulator_port: u16,

    /// Max order intents queued for the async loop before workers block
    #[serde(default = "default_queue_capacity")]
    pub bridge_queue_capacity: usize,

    #[serde(default)]
    pub strat_mode: StratMode,

    /// Fixed seed for the relaxed min-notional sampler (replays)
    pub rng_seed: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_sim_host() -> String {
    "127.0.0.1".to_string()
}
fn default_sim_port() -> u16 {
    8040
}
fn default_queue_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            log_level: default_log_level(),
            bartering_link: LinkKind::default(),
            log_simulator_host: default_sim_host(),
            log_simulator_port: default_sim_port(),
            bridge_queue_capacity: default_queue_capacity(),
            strat_mode: StratMode::default(),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    #[serde(default)]
    pub is_kill_switch_enabled: bool,
    #[serde(default = "default_true")]
    pub trigger_kill_switch: bool,
    #[serde(default = "default_true")]
    pub revoke_kill_switch_n_resume: bool,
}

fn default_true() -> bool {
    true
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            is_kill_switch_enabled: false,
            trigger_kill_switch: true,
            revoke_kill_switch_n_resume: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRoute {
    pub broker: String,
    pub route: Route,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub equity: Option<FallbackRoute>,
    pub convertible_bond: Option<FallbackRoute>,
}

impl FallbackConfig {
    pub fn for_instrument(&self, instrument_type: InstrumentType) -> Option<&FallbackRoute> {
        match instrument_type {
            InstrumentType::Equity => self.equity.as_ref(),
            InstrumentType::ConvertibleBond => self.convertible_bond.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    pub min_chore_notional: f64,
    pub max_chore_notional: f64,
    pub min_chore_notional_allowance: f64,
    pub max_chore_qty: u64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        let limits = OrderLimits::default();
        Self {
            min_chore_notional: limits.min_chore_notional,
            max_chore_notional: limits.max_chore_notional,
            min_chore_notional_allowance: limits.min_chore_notional_allowance,
            max_chore_qty: limits.max_chore_qty,
        }
    }
}

impl From<RiskLimitsConfig> for OrderLimits {
    fn from(cfg: RiskLimitsConfig) -> Self {
        Self {
            min_chore_notional: cfg.min_chore_notional,
            max_chore_notional: cfg.max_chore_notional,
            min_chore_notional_allowance: cfg.min_chore_notional_allowance,
            max_chore_qty: cfg.max_chore_qty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// File name under /dev/shm
    pub name: String,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            name: "pairtx-md".to_string(),
        }
    }
}

impl ShmConfig {
    pub fn path(&self) -> String {
        format!("/dev/shm/{}", self.name)
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to built-in defaults.
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!("📋 Loaded config from {}", path);
                    return cfg;
                }
                Err(Error::Config(_)) => continue,
                Err(e) => tracing::warn!("Ignoring {}: {}", path, e),
            }
        }

        tracing::warn!("⚠️ No config.toml found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        let r = &self.risk;
        if r.min_chore_notional < 0.0 || r.min_chore_notional_allowance < 0.0 {
            return Err(Error::Config(
                "min_chore_notional and its allowance must be non-negative".into(),
            ));
        }
        if r.max_chore_notional < r.min_chore_notional {
            return Err(Error::Config(format!(
                "max_chore_notional {} below min_chore_notional {}",
                r.max_chore_notional, r.min_chore_notional
            )));
        }
        if self.engine.bridge_queue_capacity == 0 {
            return Err(Error::Config("bridge_queue_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn order_limits(&self) -> OrderLimits {
        self.risk.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.kill_switch, KillSwitchConfig::default());
        assert!(!cfg.kill_switch.is_kill_switch_enabled);
        assert!(cfg.kill_switch.trigger_kill_switch);
        assert!(cfg.kill_switch.revoke_kill_switch_n_resume);
        assert_eq!(cfg.engine.bartering_link, LinkKind::LogSimulator);
        assert_eq!(cfg.shm.path(), "/dev/shm/pairtx-md");
    }

    #[test]
    fn test_full_config() {
        let cfg = Config::parse(
            r#"
            [engine]
            instance_id = "exec-7"
            strat_mode = "relaxed"
            rng_seed = 42

            [kill_switch]
            is_kill_switch_enabled = true
            revoke_kill_switch_n_resume = false

            [fallback]
            equity = { broker = "BKR_B", route = "qfii" }

            [risk]
            min_chore_notional = 2000.0
            max_chore_notional = 50000.0
            min_chore_notional_allowance = 500.0
            max_chore_qty = 800
            "#,
        )
        .unwrap();

        assert_eq!(cfg.engine.instance_id.as_deref(), Some("exec-7"));
        assert_eq!(cfg.engine.strat_mode, StratMode::Relaxed);
        assert!(cfg.kill_switch.is_kill_switch_enabled);
        assert!(cfg.kill_switch.trigger_kill_switch);
        assert!(!cfg.kill_switch.revoke_kill_switch_n_resume);
        let fb = cfg.fallback.for_instrument(InstrumentType::Equity).unwrap();
        assert_eq!(fb.broker, "BKR_B");
        assert_eq!(fb.route, Route::Qfii);
        assert!(cfg.fallback.for_instrument(InstrumentType::ConvertibleBond).is_none());
        assert_eq!(cfg.order_limits().max_chore_qty, 800);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let err = Config::parse(
            r#"
            [risk]
            min_chore_notional = 2000.0
            max_chore_notional = 100.0
            min_chore_notional_allowance = 0.0
            max_chore_qty = 1
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
