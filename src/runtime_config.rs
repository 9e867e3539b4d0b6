// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine.  Every tunable
// parameter lives here so the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allocation::AllocationConfig;
use crate::hysteresis::HysteresisConfig;
use crate::types::{AccountMode, CostModel, SignalGenerationMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_slippage_factor() -> f64 {
    0.0
}

fn default_signal_generation_interval() -> u32 {
    1
}

fn default_early_exit_penalty() -> f64 {
    0.02
}

fn default_max_position_value() -> f64 {
    500_000.0
}

fn default_max_portfolio_leverage() -> f64 {
    4.0
}

fn default_daily_loss_limit() -> f64 {
    0.05
}

fn default_max_bars_in_position() -> u32 {
    100
}

fn default_eod_window_start() -> String {
    "15:55".to_string()
}

fn default_eod_window_end() -> String {
    "16:00".to_string()
}

fn default_starting_capital() -> f64 {
    100_000.0
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_broker_timeout_secs() -> u64 {
    10
}

// =============================================================================
// InstrumentFamily
// =============================================================================

/// The correlated ETF family the engine trades: a 1x base instrument, its
/// inverse, and their 3x leveraged counterparts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentFamily {
    pub base_long: String,
    pub levered_long: String,
    pub base_short: String,
    pub levered_short: String,
}

impl Default for InstrumentFamily {
    fn default() -> Self {
        Self {
            base_long: "QQQ".to_string(),
            levered_long: "TQQQ".to_string(),
            base_short: "PSQ".to_string(),
            levered_short: "SQQQ".to_string(),
        }
    }
}

impl InstrumentFamily {
    /// All four symbols, base legs first.
    pub fn symbols(&self) -> Vec<String> {
        vec![
            self.base_long.clone(),
            self.levered_long.clone(),
            self.base_short.clone(),
            self.levered_short.clone(),
        ]
    }

    /// Whether `symbol` is one of the 3x legs.
    pub fn is_leveraged(&self, symbol: &str) -> bool {
        symbol == self.levered_long || symbol == self.levered_short
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against a real broker or the simulator.
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Instruments ---------------------------------------------------------

    /// The ETF family traded by the engine.
    #[serde(default)]
    pub instruments: InstrumentFamily,

    /// When false, leveraged targets collapse to the base instrument and the
    /// 3x legs are never traded.
    #[serde(default = "default_true")]
    pub leverage_enabled: bool,

    // --- Execution costs -----------------------------------------------------

    /// Fee model applied to simulated executions.
    #[serde(default)]
    pub cost_model: CostModel,

    /// Slippage as a fraction of price, applied against the order side.
    #[serde(default = "default_slippage_factor")]
    pub slippage_factor: f64,

    // --- Decision cadence ----------------------------------------------------

    /// Whether every bar or only every N-th bar yields a fresh decision.
    #[serde(default)]
    pub signal_generation_mode: SignalGenerationMode,

    /// Decision interval in bars when the mode is Adaptive.
    #[serde(default = "default_signal_generation_interval")]
    pub signal_generation_interval: u32,

    // --- Hold periods --------------------------------------------------------

    /// Enforce the minimum hold period implied by each signal's horizon.
    #[serde(default = "default_true")]
    pub enforce_minimum_hold: bool,

    /// Accounting-side price haircut applied to sells that exit before the
    /// earliest allowed exit bar. Live execution is unaffected.
    #[serde(default = "default_early_exit_penalty")]
    pub early_exit_penalty: f64,

    /// Force re-evaluation toward cash after this many bars in a position.
    #[serde(default = "default_max_bars_in_position")]
    pub max_bars_in_position: u32,

    // --- Risk limits ---------------------------------------------------------

    /// Maximum total dollar value of a single order batch.
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,

    /// Maximum leverage-weighted exposure relative to portfolio value.
    #[serde(default = "default_max_portfolio_leverage")]
    pub max_portfolio_leverage: f64,

    /// Daily loss fraction that triggers a loss-limit log breach.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,

    // --- End of day ----------------------------------------------------------

    /// EOD flattening window start, local ET ("HH:MM").
    #[serde(default = "default_eod_window_start")]
    pub eod_window_start: String,

    /// EOD flattening window end, local ET ("HH:MM", exclusive).
    #[serde(default = "default_eod_window_end")]
    pub eod_window_end: String,

    // --- Capital & persistence -----------------------------------------------

    /// Starting capital for the session.
    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,

    /// Directory holding persisted engine and EOD state.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    // --- Cadences ------------------------------------------------------------

    /// Seconds between broker reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Timeout applied to broker HTTP calls.
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_timeout_secs: u64,

    // --- Subsystem parameters ------------------------------------------------

    /// Dynamic hysteresis thresholds.
    #[serde(default)]
    pub hysteresis: HysteresisConfig,

    /// Capital allocation between base and leveraged legs.
    #[serde(default)]
    pub allocation: AllocationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Mock,
            instruments: InstrumentFamily::default(),
            leverage_enabled: true,
            cost_model: CostModel::Alpaca,
            slippage_factor: default_slippage_factor(),
            signal_generation_mode: SignalGenerationMode::EveryBar,
            signal_generation_interval: default_signal_generation_interval(),
            enforce_minimum_hold: true,
            early_exit_penalty: default_early_exit_penalty(),
            max_bars_in_position: default_max_bars_in_position(),
            max_position_value: default_max_position_value(),
            max_portfolio_leverage: default_max_portfolio_leverage(),
            daily_loss_limit: default_daily_loss_limit(),
            eod_window_start: default_eod_window_start(),
            eod_window_end: default_eod_window_end(),
            starting_capital: default_starting_capital(),
            state_dir: default_state_dir(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            broker_timeout_secs: default_broker_timeout_secs(),
            hysteresis: HysteresisConfig::default(),
            allocation: AllocationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            symbols = ?config.instruments.symbols(),
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Sanity checks that must hold before the engine starts.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.early_exit_penalty) {
            bail!(
                "early_exit_penalty must be in [0, 1), got {}",
                self.early_exit_penalty
            );
        }
        if self.slippage_factor < 0.0 || self.slippage_factor >= 1.0 {
            bail!(
                "slippage_factor must be in [0, 1), got {}",
                self.slippage_factor
            );
        }
        if self.signal_generation_interval < 1 {
            bail!("signal_generation_interval must be >= 1");
        }

        let syms = self.instruments.symbols();
        let distinct: std::collections::HashSet<&String> = syms.iter().collect();
        if distinct.len() != 4 {
            bail!("instrument family must contain four distinct symbols, got {syms:?}");
        }

        Ok(())
    }
}
