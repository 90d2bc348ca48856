// =============================================================================
// Engine Configuration — hot-loadable settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine.  Every tunable
// parameter lives here.  All fields carry `#[serde(default)]` so that adding
// new fields never breaks loading an older config file.
//
// Precedence: environment variable override > config file > built-in default.
// The default environment is testnet.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Environment, TradeMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_kline_interval() -> String {
    "1".to_string()
}

fn default_kline_limit() -> usize {
    300
}

fn default_orderbook_depth() -> u32 {
    50
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_per_trade_pct() -> f64 {
    1.0
}

fn default_max_leverage() -> f64 {
    5.0
}

fn default_max_total_exposure() -> f64 {
    5000.0
}

fn default_high_vol_atr_pct() -> f64 {
    5.0
}

fn default_high_vol_attenuation() -> f64 {
    0.5
}

fn default_max_spread_pct() -> f64 {
    2.0
}

fn default_max_depth_imbalance() -> f64 {
    0.9
}

fn default_error_budget_ceiling() -> u32 {
    5
}

fn default_max_atr_pct() -> f64 {
    10.0
}

fn default_max_pyramid_levels() -> u32 {
    3
}

fn default_pyramid_qty_increase() -> f64 {
    0.5
}

fn default_max_qty_increase_percent() -> f64 {
    50.0
}

fn default_min_confidence_for_action() -> f64 {
    0.7
}

fn default_level_timeout_minutes() -> u64 {
    30
}

fn default_min_level_notional() -> f64 {
    10.0
}

fn default_mtf_max_atr_pct() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_join_timeout_secs() -> u64 {
    30
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_journal_path() -> String {
    "signal_journal.jsonl".to_string()
}

fn default_backtest_balance() -> f64 {
    10_000.0
}

// =============================================================================
// Sections
// =============================================================================

/// Equity-percent risk model limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Equity percent risked per trade (1.0 = 1 %).
    #[serde(default = "default_per_trade_pct")]
    pub per_trade_pct: f64,

    /// Cap on notional / equity per position.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,

    /// Cap on the sum of notionals across all open symbols (USD).
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    /// ATR% above which the risk budget is attenuated.
    #[serde(default = "default_high_vol_atr_pct")]
    pub high_vol_atr_pct: f64,

    /// Multiplier applied to the risk budget in high-ATR% markets.
    #[serde(default = "default_high_vol_attenuation")]
    pub high_vol_attenuation: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            per_trade_pct: default_per_trade_pct(),
            max_leverage: default_max_leverage(),
            max_total_exposure: default_max_total_exposure(),
            high_vol_atr_pct: default_high_vol_atr_pct(),
            high_vol_attenuation: default_high_vol_attenuation(),
        }
    }
}

/// Hygiene filter thresholds (no-trade zones).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoTradeZonesConfig {
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    #[serde(default = "default_max_atr_pct")]
    pub max_atr_pct: f64,

    /// Relax the anomaly block on testnet (extreme thresholds still apply).
    #[serde(default)]
    pub allow_anomaly_on_testnet: bool,

    /// Depth-imbalance gate; off by default on testnet.
    #[serde(default)]
    pub check_depth_imbalance: Option<bool>,

    #[serde(default = "default_max_depth_imbalance")]
    pub max_depth_imbalance: f64,

    #[serde(default = "default_error_budget_ceiling")]
    pub error_budget_ceiling: u32,
}

impl Default for NoTradeZonesConfig {
    fn default() -> Self {
        Self {
            max_spread_pct: default_max_spread_pct(),
            max_atr_pct: default_max_atr_pct(),
            allow_anomaly_on_testnet: false,
            check_depth_imbalance: None,
            max_depth_imbalance: default_max_depth_imbalance(),
            error_budget_ceiling: default_error_budget_ceiling(),
        }
    }
}

impl NoTradeZonesConfig {
    /// The depth gate defaults to off on testnet and on for mainnet unless
    /// explicitly configured.
    pub fn depth_imbalance_enabled(&self, environment: Environment) -> bool {
        self.check_depth_imbalance
            .unwrap_or(!environment.is_testnet())
    }
}

/// What to do when a new signal arrives while a position is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameDirectionAction {
    Ignore,
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OppositeDirectionAction {
    Ignore,
    Flip,
}

/// Per-symbol signal-conflict policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalActionsConfig {
    #[serde(default = "SignalActionsConfig::default_same")]
    pub on_same_direction: SameDirectionAction,

    #[serde(default = "SignalActionsConfig::default_opposite")]
    pub on_opposite_direction: OppositeDirectionAction,

    #[serde(default = "default_max_pyramid_levels")]
    pub max_pyramid_levels: u32,

    /// Fraction of the current position added per pyramid step.
    #[serde(default = "default_pyramid_qty_increase")]
    pub pyramid_qty_increase: f64,

    /// Max percent increase of the current qty allowed per ADD.
    #[serde(default = "default_max_qty_increase_percent")]
    pub max_qty_increase_percent: f64,

    /// Cap on total notional after an ADD (USD).
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    /// ADD/FLIP require the new signal to clear a confidence floor.
    #[serde(default)]
    pub require_higher_confidence: bool,

    #[serde(default = "default_min_confidence_for_action")]
    pub min_confidence_for_action: f64,
}

impl SignalActionsConfig {
    fn default_same() -> SameDirectionAction {
        SameDirectionAction::Ignore
    }
    fn default_opposite() -> OppositeDirectionAction {
        OppositeDirectionAction::Ignore
    }
}

impl Default for SignalActionsConfig {
    fn default() -> Self {
        Self {
            on_same_direction: Self::default_same(),
            on_opposite_direction: Self::default_opposite(),
            max_pyramid_levels: default_max_pyramid_levels(),
            pyramid_qty_increase: default_pyramid_qty_increase(),
            max_qty_increase_percent: default_max_qty_increase_percent(),
            max_total_exposure: default_max_total_exposure(),
            require_higher_confidence: false,
            min_confidence_for_action: default_min_confidence_for_action(),
        }
    }
}

/// Multi-level entry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaledEntryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_level_timeout_minutes")]
    pub level_timeout_minutes: u64,

    #[serde(default = "default_min_level_notional")]
    pub min_level_notional: f64,
}

impl Default for ScaledEntryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level_timeout_minutes: default_level_timeout_minutes(),
            min_level_notional: default_min_level_notional(),
        }
    }
}

/// Multi-timeframe confluence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 15m ATR% ceiling above which confluence fails.
    #[serde(default = "default_mtf_max_atr_pct")]
    pub max_atr_pct_15m: f64,
}

impl Default for MtfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_atr_pct_15m: default_mtf_max_atr_pct(),
        }
    }
}

/// Linear transform applied to a strategy's raw confidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalerParams {
    pub a: f64,
    pub b: f64,
}

impl Default for ScalerParams {
    fn default() -> Self {
        Self { a: 1.0, b: 0.0 }
    }
}

/// Per-strategy (plus optional per-symbol override) confidence scaling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceScalerConfig {
    #[serde(default)]
    pub per_strategy: HashMap<String, ScalerParams>,

    /// Keyed "SYMBOL:Strategy" — overrides the per-strategy entry.
    #[serde(default)]
    pub per_symbol: HashMap<String, ScalerParams>,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Operational modes ---------------------------------------------------
    #[serde(default)]
    pub environment: Environment,

    #[serde(default)]
    pub mode: TradeMode,

    // --- Symbols & market data ----------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Trading kline interval in Bybit notation ("1", "5", "15", ...).
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,

    #[serde(default = "default_kline_limit")]
    pub kline_limit: usize,

    #[serde(default = "default_orderbook_depth")]
    pub orderbook_depth: u32,

    /// Seconds slept between loop iterations.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    // --- Subsystems ----------------------------------------------------------
    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub no_trade_zones: NoTradeZonesConfig,

    #[serde(default)]
    pub signal_actions: SignalActionsConfig,

    #[serde(default)]
    pub scaled_entry: ScaledEntryConfig,

    #[serde(default)]
    pub mtf: MtfConfig,

    #[serde(default)]
    pub confidence_scaler: ConfidenceScalerConfig,

    // --- Orchestrator --------------------------------------------------------
    /// Concurrency cap on simultaneously running symbol loops.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// Halt all other loops when one crashes.
    #[serde(default)]
    pub stop_on_error: bool,

    // --- Storage -------------------------------------------------------------
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_journal_path")]
    pub journal_path: String,

    // --- Backtest ------------------------------------------------------------
    #[serde(default = "default_backtest_balance")]
    pub backtest_initial_balance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Testnet,
            mode: TradeMode::Paper,
            symbols: default_symbols(),
            kline_interval: default_kline_interval(),
            kline_limit: default_kline_limit(),
            orderbook_depth: default_orderbook_depth(),
            tick_interval_secs: default_tick_interval_secs(),
            risk: RiskConfig::default(),
            no_trade_zones: NoTradeZonesConfig::default(),
            signal_actions: SignalActionsConfig::default(),
            scaled_entry: ScaledEntryConfig::default(),
            mtf: MtfConfig::default(),
            confidence_scaler: ConfidenceScalerConfig::default(),
            max_concurrent: None,
            check_interval_secs: default_check_interval_secs(),
            join_timeout_secs: default_join_timeout_secs(),
            stop_on_error: false,
            db_path: default_db_path(),
            journal_path: default_journal_path(),
            backtest_initial_balance: default_backtest_balance(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            mode = %config.mode,
            environment = %config.environment,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Apply environment-variable overrides. Called after load.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(env) = std::env::var("MERIDIAN_ENV") {
            match env.to_lowercase().as_str() {
                "mainnet" => self.environment = Environment::Mainnet,
                "testnet" => self.environment = Environment::Testnet,
                other => warn!(value = %other, "ignoring unknown MERIDIAN_ENV"),
            }
        }

        if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("config error: symbol set is empty");
        }
        if self.risk.per_trade_pct <= 0.0 || self.risk.per_trade_pct > 100.0 {
            anyhow::bail!(
                "config error: risk.per_trade_pct {} out of (0, 100]",
                self.risk.per_trade_pct
            );
        }
        if self.risk.max_leverage <= 0.0 {
            anyhow::bail!("config error: risk.max_leverage must be positive");
        }
        if !matches!(self.orderbook_depth, 1 | 50 | 200 | 500) {
            anyhow::bail!(
                "config error: orderbook_depth {} not in {{1, 50, 200, 500}}",
                self.orderbook_depth
            );
        }
        Ok(())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Kline interval length in minutes (Bybit notation: "1".."720", "D").
    pub fn kline_interval_minutes(&self) -> u32 {
        match self.kline_interval.as_str() {
            "D" => 1440,
            "W" => 10_080,
            s => s.parse().unwrap_or(1),
        }
    }
}
