// =============================================================================
// Dynamic Hysteresis Manager — state- and regime-dependent signal thresholds
// =============================================================================
//
// Turns a raw probability into a classified signal through thresholds that
// depend on the current portfolio state, recent signal statistics, and time
// in position. The asymmetry (harder to add, harder to exit) is what resists
// whipsaw and rewards trend persistence.
//
// Threshold pipeline per bar:
//   1. base buy/sell
//   2. state-dependent entry/exit biases (dual states bias entry twice)
//   3. time-in-position exit hardening
//   4. variance widening of the neutral zone
//   5. momentum shift of both thresholds (trend following)
//   6. clamp to [min_threshold, max_threshold]
//   7. recenter to preserve the minimum neutral-zone width
//   8. strong margins
//   9. volatile-regime confidence raise
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::signals::Signal;
use crate::state_machine::PortfolioState;

/// Minimum width of the neutral zone after recentering.
const MIN_NEUTRAL_ZONE: f64 = 0.10;

/// Minimum samples before variance/momentum adjustments engage.
const MIN_SAMPLES_FOR_ADJUSTMENT: usize = 10;

/// Minimum samples before a regime can be labelled.
const MIN_SAMPLES_FOR_REGIME: usize = 5;

// =============================================================================
// Config
// =============================================================================

fn default_base_buy() -> f64 {
    0.55
}

fn default_base_sell() -> f64 {
    0.45
}

fn default_strong_margin() -> f64 {
    0.15
}

fn default_confidence_threshold() -> f64 {
    0.70
}

fn default_entry_bias() -> f64 {
    0.02
}

fn default_exit_bias() -> f64 {
    0.05
}

fn default_variance_sensitivity() -> f64 {
    0.10
}

fn default_history_window() -> usize {
    20
}

fn default_min_threshold() -> f64 {
    0.35
}

fn default_max_threshold() -> f64 {
    0.65
}

fn default_dual_entry_multiplier() -> f64 {
    2.0
}

fn default_momentum_factor() -> f64 {
    0.03
}

/// Tunable hysteresis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisConfig {
    #[serde(default = "default_base_buy")]
    pub base_buy_threshold: f64,

    #[serde(default = "default_base_sell")]
    pub base_sell_threshold: f64,

    #[serde(default = "default_strong_margin")]
    pub strong_margin: f64,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Added to the entry-side threshold while positioned.
    #[serde(default = "default_entry_bias")]
    pub entry_bias: f64,

    /// Subtracted from the exit-side threshold while positioned.
    #[serde(default = "default_exit_bias")]
    pub exit_bias: f64,

    /// Scales variance into neutral-zone widening.
    #[serde(default = "default_variance_sensitivity")]
    pub variance_sensitivity: f64,

    /// Signal probabilities retained for statistics.
    #[serde(default = "default_history_window")]
    pub signal_history_window: usize,

    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,

    #[serde(default = "default_max_threshold")]
    pub max_threshold: f64,

    /// Dual states bias the entry side this many times harder.
    #[serde(default = "default_dual_entry_multiplier")]
    pub dual_state_entry_multiplier: f64,

    /// Scales momentum into a shift of both thresholds.
    #[serde(default = "default_momentum_factor")]
    pub momentum_factor: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            base_buy_threshold: default_base_buy(),
            base_sell_threshold: default_base_sell(),
            strong_margin: default_strong_margin(),
            confidence_threshold: default_confidence_threshold(),
            entry_bias: default_entry_bias(),
            exit_bias: default_exit_bias(),
            variance_sensitivity: default_variance_sensitivity(),
            signal_history_window: default_history_window(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            dual_state_entry_multiplier: default_dual_entry_multiplier(),
            momentum_factor: default_momentum_factor(),
        }
    }
}

// =============================================================================
// Regime
// =============================================================================

/// Discrete label for the recent signal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Stable,
    Volatile,
    TrendingUp,
    TrendingDown,
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "STABLE"),
            Self::Volatile => write!(f, "VOLATILE"),
            Self::TrendingUp => write!(f, "TRENDING_UP"),
            Self::TrendingDown => write!(f, "TRENDING_DOWN"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// A complete threshold set for one decision bar, with diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicThresholds {
    pub buy: f64,
    pub sell: f64,
    pub strong_buy: f64,
    pub strong_sell: f64,
    pub confidence: f64,

    // Diagnostics
    pub variance: f64,
    pub mean: f64,
    pub momentum: f64,
    pub regime: Regime,
    pub neutral_zone_width: f64,
    /// Total drift from the base thresholds.
    pub hysteresis_strength: f64,
    pub bars_in_position: u32,
}

impl DynamicThresholds {
    /// The static default set (cash state, empty history).
    pub fn baseline() -> Self {
        let config = HysteresisConfig::default();
        Self {
            buy: config.base_buy_threshold,
            sell: config.base_sell_threshold,
            strong_buy: config.base_buy_threshold + config.strong_margin,
            strong_sell: config.base_sell_threshold - config.strong_margin,
            confidence: config.confidence_threshold,
            variance: 0.0,
            mean: 0.5,
            momentum: 0.0,
            regime: Regime::Unknown,
            neutral_zone_width: config.base_buy_threshold - config.base_sell_threshold,
            hysteresis_strength: 0.0,
            bars_in_position: 0,
        }
    }
}

// =============================================================================
// Signal statistics
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct SignalStatistics {
    mean: f64,
    variance: f64,
    momentum: f64,
}

// =============================================================================
// DynamicHysteresisManager
// =============================================================================

pub struct DynamicHysteresisManager {
    config: HysteresisConfig,
    history: VecDeque<f64>,
}

impl DynamicHysteresisManager {
    pub fn new(config: HysteresisConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    /// Append the latest probability, trimming to the configured window.
    pub fn update_signal_history(&mut self, signal: &Signal) {
        self.history.push_back(signal.probability);
        while self.history.len() > self.config.signal_history_window {
            self.history.pop_front();
        }
    }

    /// Drop all history (new session or walk-forward window 0).
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Current regime label for the signal stream.
    pub fn regime(&self) -> Regime {
        if self.history.len() < MIN_SAMPLES_FOR_REGIME {
            return Regime::Unknown;
        }
        let stats = self.statistics();
        if stats.variance > 0.01 {
            Regime::Volatile
        } else if stats.momentum > 0.02 {
            Regime::TrendingUp
        } else if stats.momentum < -0.02 {
            Regime::TrendingDown
        } else {
            Regime::Stable
        }
    }

    /// Compute the threshold set for the current state and position age.
    pub fn thresholds(&self, state: PortfolioState, bars_in_position: u32) -> DynamicThresholds {
        let cfg = &self.config;
        let base_buy = cfg.base_buy_threshold;
        let base_sell = cfg.base_sell_threshold;

        let mut buy = base_buy;
        let mut sell = base_sell;

        // State-dependent biases: harder to add, harder to exit.
        match state {
            PortfolioState::CashOnly | PortfolioState::Invalid => {}
            PortfolioState::BaseLong | PortfolioState::LeveredLong => {
                buy = base_buy + cfg.entry_bias;
                sell = base_sell - cfg.exit_bias;
            }
            PortfolioState::BaseShort | PortfolioState::LeveredShort => {
                sell = base_sell - cfg.entry_bias;
                buy = base_buy + cfg.exit_bias;
            }
            PortfolioState::DualLong => {
                buy = base_buy + cfg.dual_state_entry_multiplier * cfg.entry_bias;
                sell = base_sell - cfg.exit_bias;
            }
            PortfolioState::DualShort => {
                sell = base_sell - cfg.dual_state_entry_multiplier * cfg.entry_bias;
                buy = base_buy + cfg.exit_bias;
            }
        }

        // Time in position hardens the exit side further.
        if bars_in_position > 5 && bars_in_position < 50 {
            let time_factor = (bars_in_position as f64 * 0.001).min(0.02);
            if state.is_long() {
                sell -= time_factor;
            } else if state.is_short() {
                buy += time_factor;
            }
        }

        let stats = self.statistics();

        // Volatile signals widen the neutral zone symmetrically.
        if self.history.len() >= MIN_SAMPLES_FOR_ADJUSTMENT {
            let variance_adj = (stats.variance * cfg.variance_sensitivity).min(0.10);
            buy += variance_adj;
            sell -= variance_adj;
        }

        // Momentum shifts both thresholds with the trend.
        if self.history.len() >= MIN_SAMPLES_FOR_ADJUSTMENT && cfg.momentum_factor > 0.0 {
            let momentum_adj = stats.momentum * cfg.momentum_factor;
            buy += momentum_adj;
            sell += momentum_adj;
        }

        buy = buy.clamp(cfg.min_threshold, cfg.max_threshold);
        sell = sell.clamp(cfg.min_threshold, cfg.max_threshold);

        // Preserve the minimum neutral zone by recentering.
        if buy - sell < MIN_NEUTRAL_ZONE {
            let mid = (buy + sell) / 2.0;
            buy = mid + MIN_NEUTRAL_ZONE / 2.0;
            sell = mid - MIN_NEUTRAL_ZONE / 2.0;
        }

        let regime = self.regime();

        let mut confidence = cfg.confidence_threshold;
        if regime == Regime::Volatile {
            confidence = (cfg.confidence_threshold + 0.10).min(0.85);
        }

        let thresholds = DynamicThresholds {
            buy,
            sell,
            strong_buy: buy + cfg.strong_margin,
            strong_sell: sell - cfg.strong_margin,
            confidence,
            variance: stats.variance,
            mean: stats.mean,
            momentum: stats.momentum,
            regime,
            neutral_zone_width: buy - sell,
            hysteresis_strength: (base_buy - buy).abs() + (base_sell - sell).abs(),
            bars_in_position,
        };

        debug!(
            state = %state,
            buy = thresholds.buy,
            sell = thresholds.sell,
            variance = thresholds.variance,
            momentum = thresholds.momentum,
            regime = %thresholds.regime,
            bars_in_position,
            "dynamic thresholds"
        );

        thresholds
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    fn statistics(&self) -> SignalStatistics {
        let n = self.history.len();
        if n == 0 {
            return SignalStatistics {
                mean: 0.5,
                ..Default::default()
            };
        }

        let sum: f64 = self.history.iter().sum();
        let mean = sum / n as f64;

        let variance = if n > 1 {
            self.history
                .iter()
                .map(|p| (p - mean) * (p - mean))
                .sum::<f64>()
                / n as f64
        } else {
            0.0
        };

        // Least-squares slope of probability over bar index.
        let momentum = if n >= MIN_SAMPLES_FOR_REGIME {
            let mut sum_x = 0.0;
            let mut sum_y = 0.0;
            let mut sum_xy = 0.0;
            let mut sum_x2 = 0.0;
            for (i, p) in self.history.iter().enumerate() {
                let x = i as f64;
                sum_x += x;
                sum_y += p;
                sum_xy += x * p;
                sum_x2 += x * x;
            }
            let nf = n as f64;
            let denominator = nf * sum_x2 - sum_x * sum_x;
            if denominator.abs() > 1e-4 {
                (nf * sum_xy - sum_x * sum_y) / denominator
            } else {
                0.0
            }
        } else {
            0.0
        };

        SignalStatistics {
            mean,
            variance,
            momentum,
        }
    }
}
