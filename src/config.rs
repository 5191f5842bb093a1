//! Declarative configuration.
//!
//! A single TOML file at `<data_root>/config.toml`. The data root is located
//! by `OPTIONEER_DATA_ROOT` (default `~/.optioneer`); a missing config file
//! is populated from the bundled template on first run. Validation here is
//! the only gate — every other component trusts the parsed `Config`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const DATA_ROOT_ENV: &str = "OPTIONEER_DATA_ROOT";
pub const LIVE_TRADING_ENV: &str = "OPTIONEER_LIVE_TRADING";
const CONFIG_TEMPLATE: &str = include_str!("../config.template.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrchestrationConfig {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    pub mode: ExecutionMode,
    #[garde(range(min = 1, max = 64))]
    pub max_parallel_workers: usize,
    #[garde(range(min = 1))]
    pub tick_interval_s: u64,
    #[garde(skip)]
    pub fallback_to_legacy: bool,
    #[garde(skip)]
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ExecutionMode::Sequential,
            max_parallel_workers: 4,
            tick_interval_s: 30,
            fallback_to_legacy: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MarketConfig {
    #[garde(length(min = 1))]
    pub timezone: String,
    #[garde(skip)]
    #[serde(default)]
    pub extended_hours: bool,
    #[garde(skip)]
    #[serde(default = "default_holidays_source")]
    pub holidays_source: String,
}

fn default_holidays_source() -> String {
    "builtin".to_string()
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            extended_hours: false,
            holidays_source: default_holidays_source(),
        }
    }
}

impl MarketConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|_| EngineError::Config(format!("unknown timezone: {}", self.timezone)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MonitoringConfig {
    #[garde(range(min = 1))]
    pub polling_interval_s: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            polling_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProviderConfig {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    #[serde(default)]
    pub base_url: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct MarketDataConfig {
    #[garde(dive)]
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl MarketDataConfig {
    /// Enabled providers in configured (priority) order.
    pub fn enabled_providers(&self) -> Vec<&ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerAccountConfig {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(skip)]
    pub api_key: String,
    #[garde(length(min = 1))]
    pub base_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    #[garde(skip)]
    #[serde(default)]
    pub default_account: Option<String>,
    #[garde(dive)]
    #[serde(default)]
    pub accounts: Vec<BrokerAccountConfig>,
}

impl BrokerConfig {
    pub fn default_account(&self) -> Option<&BrokerAccountConfig> {
        match &self.default_account {
            Some(name) => self.accounts.iter().find(|a| &a.name == name),
            None => self.accounts.first(),
        }
    }
}

/// Per-strategy block. One shared shape: every strategy reads the subset it
/// cares about, so operators see a uniform config surface.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StrategyConfig {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(inner(pattern(r"^[A-Za-z0-9.]{1,6}$")))]
    #[serde(default)]
    pub default_symbol: Option<String>,
    #[garde(inner(range(min = 1, max = 365)))]
    #[serde(default)]
    pub dte_min: Option<i64>,
    #[garde(inner(range(min = 1, max = 365)))]
    #[serde(default)]
    pub dte_max: Option<i64>,
    #[garde(inner(range(min = 0.01, max = 1.0)))]
    #[serde(default)]
    pub delta_target: Option<f64>,
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    #[serde(default)]
    pub iv_rank_min: Option<f64>,
    #[garde(inner(range(min = 0.0001)))]
    #[serde(default)]
    pub profit_target_pct: Option<f64>,
    #[garde(inner(range(min = 0.0001)))]
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[garde(inner(range(min = 0, max = 365)))]
    #[serde(default)]
    pub roll_dte: Option<i64>,
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    #[serde(default)]
    pub capital_allocation_pct: Option<f64>,
    #[garde(inner(range(min = 0.1)))]
    #[serde(default)]
    pub max_notional_leverage: Option<f64>,
    #[garde(inner(range(min = 1)))]
    #[serde(default)]
    pub contracts: Option<u32>,
    #[garde(inner(range(min = 0.5)))]
    #[serde(default)]
    pub spread_width: Option<f64>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_symbol: None,
            dte_min: None,
            dte_max: None,
            delta_target: None,
            iv_rank_min: None,
            profit_target_pct: None,
            stop_loss_pct: None,
            roll_dte: None,
            capital_allocation_pct: None,
            max_notional_leverage: None,
            contracts: None,
            spread_width: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct Config {
    #[garde(dive)]
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[garde(dive)]
    #[serde(default)]
    pub market: MarketConfig,
    #[garde(dive)]
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[garde(dive)]
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[garde(dive)]
    #[serde(default)]
    pub broker: BrokerConfig,
    #[garde(skip)]
    #[serde(default)]
    pub strategies: BTreeMap<String, StrategyConfig>,
}

impl Config {
    /// Parse and validate.
    pub fn from_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        Validate::validate(&config).map_err(|e| EngineError::Config(e.to_string()))?;
        for (tag, strategy) in &config.strategies {
            Validate::validate(strategy)
                .map_err(|e| EngineError::Config(format!("strategies.{tag}: {e}")))?;
        }
        Ok(config)
    }

    /// Load `<data_root>/config.toml`, copying the bundled template into
    /// place on first run.
    pub fn load_or_init(data_root: &Path) -> Result<Self> {
        let path = data_root.join("config.toml");
        if !path.exists() {
            std::fs::create_dir_all(data_root)
                .map_err(|e| EngineError::Config(format!("cannot create data root: {e}")))?;
            std::fs::write(&path, CONFIG_TEMPLATE)
                .map_err(|e| EngineError::Config(format!("cannot write config template: {e}")))?;
            tracing::info!(path = %path.display(), "wrote first-run config from template");
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_str(&raw)
    }

    pub fn strategy(&self, tag: &str) -> StrategyConfig {
        self.strategies.get(tag).cloned().unwrap_or_default()
    }

    pub fn enabled_strategy_tags(&self) -> Vec<String> {
        self.strategies
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(tag, _)| tag.clone())
            .collect()
    }
}

/// Resolve the data root from the environment.
pub fn data_root() -> PathBuf {
    match std::env::var(DATA_ROOT_ENV) {
        Ok(val) if !val.is_empty() => PathBuf::from(val),
        _ => home_dir().join(".optioneer"),
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
}

/// Live trading requires the explicit environment opt-in; paper endpoints
/// never do.
pub fn live_trading_approved() -> bool {
    std::env::var(LIVE_TRADING_ENV)
        .map(|v| v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}
