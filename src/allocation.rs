// =============================================================================
// Dynamic Allocation Manager — capital split between base and leveraged legs
// =============================================================================
//
// For dual-position targets the manager splits available capital between the
// 1x base instrument and its 3x counterpart under one of four sizing
// strategies. Every strategy produces a tentative split; a shared
// post-processing pass then applies the hard limits, floors share counts,
// optionally scales for volatility, computes risk metrics, and validates.
//
// Post-processing order:
//   1. leveraged cap (spill excess to base)
//   2. base floor (reduce leveraged)
//   3. effective-leverage cap (scale leveraged down)
//   4. floor-divide share counts, recompute actual values and percentages
//   5. volatility scaling (down only), recompute quantities
//   6. risk metrics
//   7. validation flags
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::runtime_config::InstrumentFamily;
use crate::signals::Signal;
use crate::state_machine::PortfolioState;

/// Correlation assumed between the base and leveraged legs.
const LEG_CORRELATION: f64 = 0.95;

/// Leverage factor of the 3x instruments.
const LEVERAGE_FACTOR: f64 = 3.0;

// =============================================================================
// Config
// =============================================================================

/// Sizing strategy for dual-position targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStrategy {
    ConfidenceBased,
    RiskParity,
    KellyCriterion,
    Hybrid,
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        Self::ConfidenceBased
    }
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfidenceBased => write!(f, "CONFIDENCE_BASED"),
            Self::RiskParity => write!(f, "RISK_PARITY"),
            Self::KellyCriterion => write!(f, "KELLY_CRITERION"),
            Self::Hybrid => write!(f, "HYBRID"),
        }
    }
}

fn default_max_leverage_allocation() -> f64 {
    0.85
}

fn default_min_base_allocation() -> f64 {
    0.10
}

fn default_max_total_leverage() -> f64 {
    3.0
}

fn default_min_total_allocation() -> f64 {
    0.95
}

fn default_max_total_allocation() -> f64 {
    1.0
}

fn default_confidence_power() -> f64 {
    1.0
}

fn default_confidence_floor() -> f64 {
    0.5
}

fn default_confidence_ceiling() -> f64 {
    0.95
}

fn default_base_volatility() -> f64 {
    0.15
}

fn default_leveraged_volatility() -> f64 {
    0.45
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_expected_win_rate() -> f64 {
    0.55
}

fn default_avg_win_loss_ratio() -> f64 {
    1.2
}

fn default_volatility_target() -> f64 {
    0.20
}

/// Tunable allocation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default)]
    pub strategy: AllocationStrategy,

    /// Maximum fraction of capital in the leveraged instrument.
    #[serde(default = "default_max_leverage_allocation")]
    pub max_leverage_allocation: f64,

    /// Minimum fraction of capital in the base instrument.
    #[serde(default = "default_min_base_allocation")]
    pub min_base_allocation: f64,

    /// Maximum effective portfolio leverage.
    #[serde(default = "default_max_total_leverage")]
    pub max_total_leverage: f64,

    /// Minimum fraction of capital deployed (risk-parity / single sizing).
    #[serde(default = "default_min_total_allocation")]
    pub min_total_allocation: f64,

    /// Maximum fraction of capital deployed.
    #[serde(default = "default_max_total_allocation")]
    pub max_total_allocation: f64,

    /// Exponent applied to signal strength (higher = more aggressive).
    #[serde(default = "default_confidence_power")]
    pub confidence_power: f64,

    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    #[serde(default = "default_confidence_ceiling")]
    pub confidence_ceiling: f64,

    /// Assumed annual volatility of the base instrument.
    #[serde(default = "default_base_volatility")]
    pub base_volatility: f64,

    /// Assumed annual volatility of the 3x instrument.
    #[serde(default = "default_leveraged_volatility")]
    pub leveraged_volatility: f64,

    /// Fraction of full Kelly to use.
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    #[serde(default = "default_expected_win_rate")]
    pub expected_win_rate: f64,

    #[serde(default = "default_avg_win_loss_ratio")]
    pub avg_win_loss_ratio: f64,

    /// Scale allocations down when observed volatility exceeds the target.
    #[serde(default = "default_enable_volatility_scaling")]
    pub enable_volatility_scaling: bool,

    #[serde(default = "default_volatility_target")]
    pub volatility_target: f64,
}

fn default_enable_volatility_scaling() -> bool {
    true
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::ConfidenceBased,
            max_leverage_allocation: default_max_leverage_allocation(),
            min_base_allocation: default_min_base_allocation(),
            max_total_leverage: default_max_total_leverage(),
            min_total_allocation: default_min_total_allocation(),
            max_total_allocation: default_max_total_allocation(),
            confidence_power: default_confidence_power(),
            confidence_floor: default_confidence_floor(),
            confidence_ceiling: default_confidence_ceiling(),
            base_volatility: default_base_volatility(),
            leveraged_volatility: default_leveraged_volatility(),
            kelly_fraction: default_kelly_fraction(),
            expected_win_rate: default_expected_win_rate(),
            avg_win_loss_ratio: default_avg_win_loss_ratio(),
            enable_volatility_scaling: true,
            volatility_target: default_volatility_target(),
        }
    }
}

// =============================================================================
// Market conditions & result
// =============================================================================

/// Observed market conditions fed into sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketConditions {
    /// Annualised volatility observed right now (0 = unknown).
    pub current_volatility: f64,
    /// Trend strength in [-1, 1].
    pub trend_strength: f64,
}

/// The outcome of an allocation request.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationResult {
    pub base_symbol: String,
    pub base_allocation_pct: f64,
    pub base_position_value: f64,
    pub base_quantity: u64,

    /// Absent for single-position sizing.
    pub leveraged_symbol: Option<String>,
    pub leveraged_allocation_pct: f64,
    pub leveraged_position_value: f64,
    pub leveraged_quantity: u64,

    pub total_allocation_pct: f64,
    pub total_position_value: f64,
    pub cash_reserve_pct: f64,

    pub effective_leverage: f64,
    pub risk_score: f64,
    pub expected_volatility: f64,
    pub max_drawdown_estimate: f64,

    pub strategy: String,
    pub rationale: String,
    pub signal_strength_used: f64,
    pub kelly_sizing: f64,

    pub is_valid: bool,
    pub warnings: Vec<String>,
}

impl AllocationResult {
    fn empty_invalid(reason: &str) -> Self {
        Self {
            base_symbol: String::new(),
            base_allocation_pct: 0.0,
            base_position_value: 0.0,
            base_quantity: 0,
            leveraged_symbol: None,
            leveraged_allocation_pct: 0.0,
            leveraged_position_value: 0.0,
            leveraged_quantity: 0,
            total_allocation_pct: 0.0,
            total_position_value: 0.0,
            cash_reserve_pct: 1.0,
            effective_leverage: 0.0,
            risk_score: 0.0,
            expected_volatility: 0.0,
            max_drawdown_estimate: 0.0,
            strategy: String::new(),
            rationale: reason.to_string(),
            signal_strength_used: 0.0,
            kelly_sizing: 0.0,
            is_valid: false,
            warnings: vec![reason.to_string()],
        }
    }
}

/// Tentative percentage split produced by a strategy before post-processing.
#[derive(Debug, Clone, Copy)]
struct TentativeSplit {
    base_pct: f64,
    leveraged_pct: f64,
    /// Fraction of capital the strategy wants deployed overall.
    deploy_fraction: f64,
    kelly_sizing: f64,
    rationale_hint: &'static str,
}

// =============================================================================
// DynamicAllocationManager
// =============================================================================

pub struct DynamicAllocationManager {
    config: AllocationConfig,
    family: InstrumentFamily,
}

impl DynamicAllocationManager {
    pub fn new(config: AllocationConfig, family: InstrumentFamily) -> Self {
        Self { config, family }
    }

    // -------------------------------------------------------------------------
    // Dual allocation
    // -------------------------------------------------------------------------

    /// Split capital between the base and leveraged legs for a dual target.
    pub fn calculate_dual_allocation(
        &self,
        target_state: PortfolioState,
        signal: &Signal,
        available_capital: f64,
        price_base: f64,
        price_leveraged: f64,
        market: &MarketConditions,
    ) -> AllocationResult {
        let is_long = match target_state {
            PortfolioState::DualLong => true,
            PortfolioState::DualShort => false,
            other => {
                warn!(state = %other, "dual allocation requested for non-dual state");
                return AllocationResult::empty_invalid("Invalid state for dual allocation");
            }
        };

        if price_base <= 0.0 || price_leveraged <= 0.0 {
            return AllocationResult::empty_invalid("Non-positive leg price");
        }

        let (base_symbol, leveraged_symbol) = if is_long {
            (self.family.base_long.clone(), self.family.levered_long.clone())
        } else {
            (self.family.base_short.clone(), self.family.levered_short.clone())
        };

        let strength = signal.strength();

        let split = match self.config.strategy {
            AllocationStrategy::ConfidenceBased => self.confidence_split(strength),
            AllocationStrategy::RiskParity => self.risk_parity_split(strength, market),
            AllocationStrategy::KellyCriterion => self.kelly_split(is_long, signal),
            AllocationStrategy::Hybrid => self.hybrid_split(is_long, signal, market),
        };

        let mut result = AllocationResult {
            base_symbol,
            base_allocation_pct: split.base_pct,
            base_position_value: 0.0,
            base_quantity: 0,
            leveraged_symbol: Some(leveraged_symbol),
            leveraged_allocation_pct: split.leveraged_pct,
            leveraged_position_value: 0.0,
            leveraged_quantity: 0,
            total_allocation_pct: 0.0,
            total_position_value: 0.0,
            cash_reserve_pct: 1.0,
            effective_leverage: 0.0,
            risk_score: 0.0,
            expected_volatility: 0.0,
            max_drawdown_estimate: 0.0,
            strategy: self.config.strategy.to_string(),
            rationale: format!(
                "{} split: {:.0}% base, {:.0}% leveraged (strength={:.2})",
                split.rationale_hint,
                split.base_pct * 100.0,
                split.leveraged_pct * 100.0,
                strength
            ),
            signal_strength_used: strength,
            kelly_sizing: split.kelly_sizing,
            is_valid: false,
            warnings: Vec::new(),
        };

        self.apply_risk_limits(&mut result);
        self.compute_quantities(
            &mut result,
            available_capital * split.deploy_fraction,
            available_capital,
            price_base,
            price_leveraged,
        );

        if self.config.enable_volatility_scaling {
            self.apply_volatility_scaling(
                &mut result,
                market,
                available_capital,
                price_base,
                price_leveraged,
            );
        }

        self.compute_risk_metrics(&mut result);
        self.add_validation_warnings(&mut result);
        result.is_valid = self.validate_allocation(&result);

        info!(
            strategy = %result.strategy,
            base = %result.base_symbol,
            base_pct = result.base_allocation_pct,
            base_qty = result.base_quantity,
            leveraged = result.leveraged_symbol.as_deref().unwrap_or(""),
            leveraged_pct = result.leveraged_allocation_pct,
            leveraged_qty = result.leveraged_quantity,
            effective_leverage = result.effective_leverage,
            risk_score = result.risk_score,
            valid = result.is_valid,
            "dual allocation"
        );

        result
    }

    // -------------------------------------------------------------------------
    // Single allocation
    // -------------------------------------------------------------------------

    /// Size a single-instrument position.
    pub fn calculate_single_allocation(
        &self,
        symbol: &str,
        signal: &Signal,
        available_capital: f64,
        current_price: f64,
        is_leveraged: bool,
    ) -> AllocationResult {
        if current_price <= 0.0 {
            return AllocationResult::empty_invalid("Non-positive price");
        }

        let strength = signal.strength();
        let mut position_pct = self.config.min_total_allocation
            + (self.config.max_total_allocation - self.config.min_total_allocation) * strength;

        // A lone 3x position is sized down.
        if is_leveraged {
            position_pct *= 0.7;
        }

        let tentative_value = available_capital * position_pct;
        let quantity = (tentative_value / current_price).floor().max(0.0) as u64;
        let actual_value = quantity as f64 * current_price;

        let (pct, total_pct) = if available_capital > 0.0 {
            let p = actual_value / available_capital;
            (p, p)
        } else {
            (0.0, 0.0)
        };

        let effective_leverage = if is_leveraged {
            LEVERAGE_FACTOR * pct
        } else {
            pct
        };
        let expected_volatility = if is_leveraged {
            self.config.leveraged_volatility
        } else {
            self.config.base_volatility
        };

        let mut result = AllocationResult {
            base_symbol: symbol.to_string(),
            base_allocation_pct: pct,
            base_position_value: actual_value,
            base_quantity: quantity,
            leveraged_symbol: None,
            leveraged_allocation_pct: 0.0,
            leveraged_position_value: 0.0,
            leveraged_quantity: 0,
            total_allocation_pct: total_pct,
            total_position_value: actual_value,
            cash_reserve_pct: 1.0 - total_pct,
            effective_leverage,
            risk_score: 0.0,
            expected_volatility,
            max_drawdown_estimate: estimate_max_drawdown(effective_leverage, expected_volatility),
            strategy: "SINGLE_POSITION".to_string(),
            rationale: format!("Single position in {symbol}"),
            signal_strength_used: strength,
            kelly_sizing: 0.0,
            is_valid: true,
            warnings: Vec::new(),
        };

        result.risk_score = self.risk_score_of(&result);
        if quantity == 0 {
            result
                .warnings
                .push("Insufficient capital for a single share".to_string());
        }

        result
    }

    // -------------------------------------------------------------------------
    // Strategy splits
    // -------------------------------------------------------------------------

    /// Signal strength drives the leveraged share directly.
    fn confidence_split(&self, raw_strength: f64) -> TentativeSplit {
        let cfg = &self.config;
        let mut strength = raw_strength.clamp(cfg.confidence_floor, cfg.confidence_ceiling);
        strength = strength.powf(cfg.confidence_power);

        let mut leveraged_pct = strength;
        let mut base_pct = 1.0 - strength;

        leveraged_pct = leveraged_pct.min(cfg.max_leverage_allocation);
        base_pct = base_pct.max(cfg.min_base_allocation);

        let total = leveraged_pct + base_pct;
        if total > 0.0 {
            leveraged_pct /= total;
            base_pct /= total;
        }

        TentativeSplit {
            base_pct,
            leveraged_pct,
            deploy_fraction: cfg.max_total_allocation,
            kelly_sizing: 0.0,
            rationale_hint: "Signal-strength",
        }
    }

    /// Inverse-volatility weights; deployment grows with signal strength.
    fn risk_parity_split(&self, strength: f64, market: &MarketConditions) -> TentativeSplit {
        let cfg = &self.config;

        let mut base_vol = cfg.base_volatility;
        let mut leveraged_vol = cfg.leveraged_volatility;
        if market.current_volatility > 0.0 {
            let vol_multiplier = market.current_volatility / 0.15;
            base_vol *= vol_multiplier;
            leveraged_vol *= vol_multiplier;
        }

        let base_weight = 1.0 / base_vol;
        let leveraged_weight = 1.0 / leveraged_vol;
        let total_weight = base_weight + leveraged_weight;

        let deploy_fraction = cfg.min_total_allocation
            + (cfg.max_total_allocation - cfg.min_total_allocation) * strength;

        TentativeSplit {
            base_pct: base_weight / total_weight,
            leveraged_pct: leveraged_weight / total_weight,
            deploy_fraction,
            kelly_sizing: 0.0,
            rationale_hint: "Risk-parity",
        }
    }

    /// Fractional Kelly sizing splits between the legs.
    fn kelly_split(&self, is_long: bool, signal: &Signal) -> TentativeSplit {
        let cfg = &self.config;
        let strength = signal.strength();

        let win_prob = if is_long {
            signal.probability
        } else {
            1.0 - signal.probability
        }
        .clamp(0.45, 0.65);

        let win_loss_ratio = cfg.avg_win_loss_ratio * (0.8 + 0.4 * strength);
        let raw_kelly = kelly_fraction(win_prob, win_loss_ratio);
        let kelly = (apply_kelly_safety(raw_kelly) * cfg.kelly_fraction).clamp(0.0, 1.0);

        let mut leveraged_pct = kelly * 0.8;
        let mut base_pct = kelly * 0.2 + (1.0 - kelly) * 0.5;

        let total = leveraged_pct + base_pct;
        if total > 1.0 {
            leveraged_pct /= total;
            base_pct /= total;
        }

        TentativeSplit {
            base_pct,
            leveraged_pct,
            deploy_fraction: 1.0,
            kelly_sizing: kelly,
            rationale_hint: "Kelly",
        }
    }

    /// Blend of the three approaches: 50% confidence, 30% parity, 20% Kelly.
    fn hybrid_split(
        &self,
        is_long: bool,
        signal: &Signal,
        market: &MarketConditions,
    ) -> TentativeSplit {
        let strength = signal.strength();
        let confidence = self.confidence_split(strength);
        let parity = self.risk_parity_split(strength, market);
        let kelly = self.kelly_split(is_long, signal);

        TentativeSplit {
            base_pct: 0.5 * confidence.base_pct + 0.3 * parity.base_pct + 0.2 * kelly.base_pct,
            leveraged_pct: 0.5 * confidence.leveraged_pct
                + 0.3 * parity.leveraged_pct
                + 0.2 * kelly.leveraged_pct,
            deploy_fraction: 1.0,
            kelly_sizing: kelly.kelly_sizing,
            rationale_hint: "Hybrid",
        }
    }

    // -------------------------------------------------------------------------
    // Post-processing
    // -------------------------------------------------------------------------

    /// Steps 1–3: hard percentage limits.
    fn apply_risk_limits(&self, result: &mut AllocationResult) {
        let cfg = &self.config;

        if result.leveraged_allocation_pct > cfg.max_leverage_allocation {
            let excess = result.leveraged_allocation_pct - cfg.max_leverage_allocation;
            result.leveraged_allocation_pct = cfg.max_leverage_allocation;
            result.base_allocation_pct += excess;
        }

        if result.base_allocation_pct < cfg.min_base_allocation {
            let shortfall = cfg.min_base_allocation - result.base_allocation_pct;
            result.base_allocation_pct = cfg.min_base_allocation;
            result.leveraged_allocation_pct =
                (result.leveraged_allocation_pct - shortfall).max(0.0);
        }

        let effective = effective_leverage(
            result.base_allocation_pct,
            result.leveraged_allocation_pct,
        );
        if effective > cfg.max_total_leverage {
            let max_leveraged =
                (cfg.max_total_leverage - result.base_allocation_pct) / LEVERAGE_FACTOR;
            result.leveraged_allocation_pct =
                result.leveraged_allocation_pct.min(max_leveraged.max(0.0));
        }
    }

    /// Step 4: floor share counts and recompute actual values/percentages.
    fn compute_quantities(
        &self,
        result: &mut AllocationResult,
        deployed_capital: f64,
        available_capital: f64,
        price_base: f64,
        price_leveraged: f64,
    ) {
        let base_value = deployed_capital * result.base_allocation_pct;
        let leveraged_value = deployed_capital * result.leveraged_allocation_pct;

        result.base_quantity = (base_value / price_base).floor().max(0.0) as u64;
        result.leveraged_quantity = (leveraged_value / price_leveraged).floor().max(0.0) as u64;

        result.base_position_value = result.base_quantity as f64 * price_base;
        result.leveraged_position_value = result.leveraged_quantity as f64 * price_leveraged;
        result.total_position_value =
            result.base_position_value + result.leveraged_position_value;

        if available_capital > 0.0 {
            result.base_allocation_pct = result.base_position_value / available_capital;
            result.leveraged_allocation_pct =
                result.leveraged_position_value / available_capital;
            result.total_allocation_pct = result.total_position_value / available_capital;
            result.cash_reserve_pct = 1.0 - result.total_allocation_pct;
        }
    }

    /// Step 5: scale down when observed volatility exceeds the target.
    fn apply_volatility_scaling(
        &self,
        result: &mut AllocationResult,
        market: &MarketConditions,
        available_capital: f64,
        price_base: f64,
        price_leveraged: f64,
    ) {
        if market.current_volatility <= 0.0 {
            return;
        }

        let scalar =
            (self.config.volatility_target / market.current_volatility).clamp(0.5, 1.5);
        if scalar >= 1.0 {
            return;
        }

        result.base_allocation_pct *= scalar;
        result.leveraged_allocation_pct *= scalar;
        result
            .warnings
            .push("Position scaled down due to high volatility".to_string());

        // Re-floor quantities from the scaled percentages.
        self.compute_quantities(
            result,
            available_capital,
            available_capital,
            price_base,
            price_leveraged,
        );
    }

    /// Step 6: leverage, risk score, expected volatility, drawdown estimate.
    fn compute_risk_metrics(&self, result: &mut AllocationResult) {
        result.effective_leverage = effective_leverage(
            result.base_allocation_pct,
            result.leveraged_allocation_pct,
        );
        result.expected_volatility = self.expected_volatility(
            result.base_allocation_pct,
            result.leveraged_allocation_pct,
        );
        result.max_drawdown_estimate =
            estimate_max_drawdown(result.effective_leverage, result.expected_volatility);
        result.risk_score = self.risk_score_of(result);
    }

    fn add_validation_warnings(&self, result: &mut AllocationResult) {
        if result.effective_leverage > 2.5 {
            result
                .warnings
                .push(format!("High leverage: {:.2}x", result.effective_leverage));
        }
        if result.cash_reserve_pct > 0.1 {
            result.warnings.push(format!(
                "Significant cash reserve: {:.0}%",
                result.cash_reserve_pct * 100.0
            ));
        }
        if result.base_quantity < 1 || result.leveraged_quantity < 1 {
            result
                .warnings
                .push("Insufficient capital for full dual position".to_string());
        }
    }

    /// Step 7: hard validity checks.
    pub fn validate_allocation(&self, result: &AllocationResult) -> bool {
        // 1% rounding slack on total allocation, 10% buffer on leverage.
        if result.total_allocation_pct > 1.01 {
            return false;
        }
        if result.effective_leverage > self.config.max_total_leverage * 1.1 {
            return false;
        }
        true
    }

    fn risk_score_of(&self, result: &AllocationResult) -> f64 {
        let leverage_score = result.effective_leverage / self.config.max_total_leverage;
        let concentration_score = result
            .base_allocation_pct
            .max(result.leveraged_allocation_pct);
        let volatility_score = result.expected_volatility / 0.5;

        (0.4 * leverage_score + 0.3 * concentration_score + 0.3 * volatility_score)
            .clamp(0.0, 1.0)
    }

    fn expected_volatility(&self, base_pct: f64, leveraged_pct: f64) -> f64 {
        let bv = self.config.base_volatility;
        let lv = self.config.leveraged_volatility;
        let variance = base_pct * base_pct * bv * bv
            + leveraged_pct * leveraged_pct * lv * lv
            + 2.0 * base_pct * leveraged_pct * bv * lv * LEG_CORRELATION;
        variance.max(0.0).sqrt()
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn effective_leverage(base_pct: f64, leveraged_pct: f64) -> f64 {
    base_pct + leveraged_pct * LEVERAGE_FACTOR
}

fn estimate_max_drawdown(effective_leverage: f64, expected_vol: f64) -> f64 {
    2.0 * expected_vol * effective_leverage.max(0.0).sqrt()
}

/// Kelly formula `f* = (p*b - q) / b`.
fn kelly_fraction(win_probability: f64, win_loss_ratio: f64) -> f64 {
    if win_loss_ratio <= 0.0 {
        return 0.0;
    }
    let q = 1.0 - win_probability;
    (win_probability * win_loss_ratio - q) / win_loss_ratio
}

/// Cap raw Kelly at 2.0 and compress the portion above 1.0 by half.
fn apply_kelly_safety(raw_kelly: f64) -> f64 {
    let capped = raw_kelly.clamp(0.0, 2.0);
    if capped > 1.0 {
        1.0 + 0.5 * (capped - 1.0)
    } else {
        capped
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalDirection;

    fn manager() -> DynamicAllocationManager {
        DynamicAllocationManager::new(AllocationConfig::default(), InstrumentFamily::default())
    }

    fn manager_with(strategy: AllocationStrategy) -> DynamicAllocationManager {
        let config = AllocationConfig {
            strategy,
            ..AllocationConfig::default()
        };
        DynamicAllocationManager::new(config, InstrumentFamily::default())
    }

    fn long_signal(probability: f64) -> Signal {
        Signal::new(1, 0, "QQQ", probability, SignalDirection::Long, 1)
    }

    #[test]
    fn confidence_allocation_matches_worked_example() {
        // probability 0.80, $100k capital, QQQ=$400, TQQQ=$80:
        // strength 0.60 -> 60% leveraged / 40% base -> 750 and 100 shares.
        let mgr = manager();
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );

        assert!(result.is_valid);
        assert_eq!(result.base_symbol, "QQQ");
        assert_eq!(result.leveraged_symbol.as_deref(), Some("TQQQ"));
        assert_eq!(result.leveraged_quantity, 750);
        assert_eq!(result.base_quantity, 100);
        assert!((result.leveraged_position_value - 60_000.0).abs() < 1e-9);
        assert!((result.base_position_value - 40_000.0).abs() < 1e-9);
        assert!((result.effective_leverage - 2.2).abs() < 1e-9);
    }

    #[test]
    fn confidence_floor_applies_to_weak_signals() {
        // strength 0.1 is clamped up to the 0.5 floor: an even split.
        let mgr = manager();
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.55),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        assert!(result.is_valid);
        assert!((result.leveraged_allocation_pct - 0.5).abs() < 0.01);
        assert!((result.base_allocation_pct - 0.5).abs() < 0.01);
    }

    #[test]
    fn leveraged_cap_spills_to_base() {
        let mgr = manager();
        // strength clamps to the 0.95 ceiling, then the 0.85 cap bites.
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.999),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        assert!(result.leveraged_allocation_pct <= 0.85 + 1e-9);
        assert!(result.is_valid);
    }

    #[test]
    fn effective_leverage_cap_scales_leveraged_down() {
        let config = AllocationConfig {
            max_total_leverage: 2.0,
            ..AllocationConfig::default()
        };
        let mgr = DynamicAllocationManager::new(config, InstrumentFamily::default());
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        assert!(result.effective_leverage <= 2.0 + 1e-9);
        assert!(result.is_valid);
    }

    #[test]
    fn short_dual_uses_inverse_family() {
        let mgr = manager();
        let signal = Signal::new(1, 0, "QQQ", 0.20, SignalDirection::Short, 1);
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualShort,
            &signal,
            100_000.0,
            30.0,
            25.0,
            &MarketConditions::default(),
        );
        assert_eq!(result.base_symbol, "PSQ");
        assert_eq!(result.leveraged_symbol.as_deref(), Some("SQQQ"));
        assert!(result.is_valid);
    }

    #[test]
    fn non_dual_state_is_rejected() {
        let mgr = manager();
        let result = mgr.calculate_dual_allocation(
            PortfolioState::BaseLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        assert!(!result.is_valid);
    }

    #[test]
    fn risk_parity_weights_are_inverse_volatility() {
        let mgr = manager_with(AllocationStrategy::RiskParity);
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        // 1/0.15 : 1/0.45 = 3 : 1 favours the base leg.
        assert!(result.base_allocation_pct > result.leveraged_allocation_pct);
        assert!(result.is_valid);
        // Deployment grows with strength: 0.95 + 0.05*0.6 = 0.98 of capital,
        // minus flooring losses.
        assert!(result.total_allocation_pct > 0.90);
    }

    #[test]
    fn kelly_sizing_matches_formula() {
        let mgr = manager_with(AllocationStrategy::KellyCriterion);
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        // p_win clamps to 0.65; b = 1.2*(0.8+0.4*0.6) = 1.248;
        // f* = (0.65*1.248 - 0.35)/1.248 ≈ 0.3696; quarter-Kelly ≈ 0.0924.
        assert!((result.kelly_sizing - 0.0924).abs() < 0.001);
        assert!(result.is_valid);
        // The leveraged leg is a small fraction under quarter-Kelly.
        assert!(result.leveraged_allocation_pct < 0.10);
    }

    #[test]
    fn hybrid_blends_the_three_strategies() {
        let confidence = manager_with(AllocationStrategy::ConfidenceBased);
        let hybrid = manager_with(AllocationStrategy::Hybrid);
        let market = MarketConditions::default();
        let signal = long_signal(0.80);

        let c = confidence.calculate_dual_allocation(
            PortfolioState::DualLong,
            &signal,
            100_000.0,
            400.0,
            80.0,
            &market,
        );
        let h = hybrid.calculate_dual_allocation(
            PortfolioState::DualLong,
            &signal,
            100_000.0,
            400.0,
            80.0,
            &market,
        );
        assert!(h.is_valid);
        // The blend pulls the leveraged share below the pure-confidence split.
        assert!(h.leveraged_allocation_pct < c.leveraged_allocation_pct);
    }

    #[test]
    fn insufficient_capital_yields_zero_quantities_with_warning() {
        let mgr = manager();
        let result = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            50.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        assert_eq!(result.base_quantity, 0);
        assert_eq!(result.leveraged_quantity, 0);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("Insufficient capital")));
    }

    #[test]
    fn volatility_scaling_reduces_size_and_warns() {
        let mgr = manager();
        let market = MarketConditions {
            current_volatility: 0.40,
            trend_strength: 0.0,
        };
        let calm = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &MarketConditions::default(),
        );
        let stormy = mgr.calculate_dual_allocation(
            PortfolioState::DualLong,
            &long_signal(0.80),
            100_000.0,
            400.0,
            80.0,
            &market,
        );
        assert!(stormy.total_position_value < calm.total_position_value);
        assert!(stormy.warnings.iter().any(|w| w.contains("volatility")));
    }

    #[test]
    fn single_allocation_scales_with_strength() {
        let mgr = manager();
        let result =
            mgr.calculate_single_allocation("QQQ", &long_signal(0.80), 100_000.0, 400.0, false);
        // 0.95 + 0.05*0.6 = 0.98 of capital -> 245 shares of $400.
        assert_eq!(result.base_quantity, 245);
        assert!(result.is_valid);
        assert!(result.leveraged_symbol.is_none());
    }

    #[test]
    fn single_leveraged_position_is_sized_down() {
        let mgr = manager();
        let plain =
            mgr.calculate_single_allocation("QQQ", &long_signal(0.80), 100_000.0, 400.0, false);
        let levered =
            mgr.calculate_single_allocation("TQQQ", &long_signal(0.80), 100_000.0, 400.0, true);
        assert!(levered.base_position_value < plain.base_position_value);
        assert!((levered.effective_leverage - 3.0 * levered.base_allocation_pct).abs() < 1e-9);
    }

    #[test]
    fn validity_caps_hold_for_all_strategies() {
        for strategy in [
            AllocationStrategy::ConfidenceBased,
            AllocationStrategy::RiskParity,
            AllocationStrategy::KellyCriterion,
            AllocationStrategy::Hybrid,
        ] {
            let mgr = manager_with(strategy);
            for p in [0.55, 0.65, 0.80, 0.95, 0.999] {
                let result = mgr.calculate_dual_allocation(
                    PortfolioState::DualLong,
                    &long_signal(p),
                    100_000.0,
                    400.0,
                    80.0,
                    &MarketConditions::default(),
                );
                assert!(result.is_valid, "{strategy} p={p}");
                assert!(result.total_allocation_pct <= 1.01, "{strategy} p={p}");
                assert!(
                    result.effective_leverage <= 3.0 * 1.1 + 1e-9,
                    "{strategy} p={p}"
                );
            }
        }
    }
}
