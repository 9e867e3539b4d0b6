// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against a real broker account or the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Mock,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Mock
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mock => write!(f, "Mock"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Order side from the book's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1.0 for buys, -1.0 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Transaction-cost model applied to simulated fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostModel {
    /// No fees at all.
    Zero,
    /// Flat $1.00 per order.
    Fixed,
    /// 0.1% of trade value.
    Percentage,
    /// Commission-free equities model.
    Alpaca,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::Alpaca
    }
}

impl CostModel {
    /// Fee charged for a fill of `trade_value` dollars.
    pub fn fee(self, trade_value: f64) -> f64 {
        match self {
            Self::Zero | Self::Alpaca => 0.0,
            Self::Fixed => 1.0,
            Self::Percentage => trade_value * 0.001,
        }
    }
}

impl std::fmt::Display for CostModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zero => write!(f, "ZERO"),
            Self::Fixed => write!(f, "FIXED"),
            Self::Percentage => write!(f, "PERCENTAGE"),
            Self::Alpaca => write!(f, "ALPACA"),
        }
    }
}

/// How often the backend produces a fresh trading decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalGenerationMode {
    /// Decide on every incoming bar.
    EveryBar,
    /// Decide only every `signal_generation_interval`-th bar; other bars hold.
    Adaptive,
}

impl Default for SignalGenerationMode {
    fn default() -> Self {
        Self::EveryBar
    }
}

impl std::fmt::Display for SignalGenerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EveryBar => write!(f, "EVERY_BAR"),
            Self::Adaptive => write!(f, "ADAPTIVE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_model_fees() {
        assert_eq!(CostModel::Zero.fee(10_000.0), 0.0);
        assert_eq!(CostModel::Alpaca.fee(10_000.0), 0.0);
        assert_eq!(CostModel::Fixed.fee(10_000.0), 1.0);
        assert!((CostModel::Percentage.fee(10_000.0) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn order_side_sign() {
        assert_eq!(OrderSide::Buy.sign(), 1.0);
        assert_eq!(OrderSide::Sell.sign(), -1.0);
    }

    #[test]
    fn defaults_are_safe() {
        assert_eq!(TradingMode::default(), TradingMode::Paused);
        assert_eq!(AccountMode::default(), AccountMode::Mock);
        assert_eq!(CostModel::default(), CostModel::Alpaca);
        assert_eq!(SignalGenerationMode::default(), SignalGenerationMode::EveryBar);
    }
}
