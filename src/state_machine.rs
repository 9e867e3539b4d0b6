// =============================================================================
// Position State Machine — legal portfolio states over the ETF family and
// the allowed transitions between them given a classified signal
// =============================================================================
//
// States span a four-instrument family: a 1x base long, its 3x leveraged
// counterpart, a 1x inverse, and the 3x inverse. Long-family and short-family
// holdings are never mixed; a book that somehow contains both is Invalid and
// the only exit from Invalid is emergency liquidation to cash.
//
// The state machine also owns hold-period enforcement: a position opened at
// bar B with horizon H may not be closed before bar B+H, except by the EOD
// guardian or the Invalid path.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hysteresis::DynamicThresholds;
use crate::position_book::Position;
use crate::runtime_config::InstrumentFamily;
use crate::signals::Signal;

/// Quantities below this are treated as flat.
pub const FLAT_EPSILON: f64 = 1e-9;

/// Number of recent trade results retained for win-rate queries.
const TRADE_RESULT_WINDOW: usize = 50;

// ---------------------------------------------------------------------------
// States and classified signals
// ---------------------------------------------------------------------------

/// Legal portfolio states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortfolioState {
    CashOnly,
    BaseLong,
    LeveredLong,
    BaseShort,
    LeveredShort,
    DualLong,
    DualShort,
    /// Emergency sink; transitions only to CashOnly.
    Invalid,
}

impl PortfolioState {
    pub fn is_long(self) -> bool {
        matches!(self, Self::BaseLong | Self::LeveredLong | Self::DualLong)
    }

    pub fn is_short(self) -> bool {
        matches!(self, Self::BaseShort | Self::LeveredShort | Self::DualShort)
    }

    pub fn is_dual(self) -> bool {
        matches!(self, Self::DualLong | Self::DualShort)
    }

    /// The instruments held in this state.
    pub fn instruments(self, family: &InstrumentFamily) -> Vec<String> {
        match self {
            Self::CashOnly | Self::Invalid => vec![],
            Self::BaseLong => vec![family.base_long.clone()],
            Self::LeveredLong => vec![family.levered_long.clone()],
            Self::BaseShort => vec![family.base_short.clone()],
            Self::LeveredShort => vec![family.levered_short.clone()],
            Self::DualLong => vec![family.base_long.clone(), family.levered_long.clone()],
            Self::DualShort => vec![family.base_short.clone(), family.levered_short.clone()],
        }
    }
}

impl std::fmt::Display for PortfolioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CashOnly => write!(f, "CASH_ONLY"),
            Self::BaseLong => write!(f, "BASE_LONG"),
            Self::LeveredLong => write!(f, "LEVERED_LONG"),
            Self::BaseShort => write!(f, "BASE_SHORT"),
            Self::LeveredShort => write!(f, "LEVERED_SHORT"),
            Self::DualLong => write!(f, "DUAL_LONG"),
            Self::DualShort => write!(f, "DUAL_SHORT"),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Discrete signal classification against a threshold set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    StrongBuy,
    WeakBuy,
    Neutral,
    WeakSell,
    StrongSell,
}

impl SignalKind {
    /// Classify a probability against dynamic thresholds.
    ///
    /// Comparisons are strict: a probability exactly on a threshold stays
    /// Neutral.
    pub fn classify(probability: f64, thresholds: &DynamicThresholds) -> Self {
        if probability > thresholds.strong_buy {
            Self::StrongBuy
        } else if probability > thresholds.buy {
            Self::WeakBuy
        } else if probability < thresholds.strong_sell {
            Self::StrongSell
        } else if probability < thresholds.sell {
            Self::WeakSell
        } else {
            Self::Neutral
        }
    }

    pub fn is_buy(self) -> bool {
        matches!(self, Self::StrongBuy | Self::WeakBuy)
    }

    pub fn is_sell(self) -> bool {
        matches!(self, Self::StrongSell | Self::WeakSell)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongBuy => write!(f, "STRONG_BUY"),
            Self::WeakBuy => write!(f, "WEAK_BUY"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::WeakSell => write!(f, "WEAK_SELL"),
            Self::StrongSell => write!(f, "STRONG_SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// The state machine's verdict for one bar.
#[derive(Debug, Clone)]
pub struct Transition {
    pub current_state: PortfolioState,
    pub signal_kind: SignalKind,
    pub target_state: PortfolioState,
    pub rationale: String,
    /// True when the minimum hold period suppressed a state change.
    pub is_hold_enforced: bool,
    /// True when position age forced an exit signal.
    pub forced_by_age: bool,
    pub bars_in_position: u32,
    pub prediction_horizon: u32,
    /// Bars until the earliest held symbol may be closed (0 when free).
    pub bars_remaining: u64,
}

// ---------------------------------------------------------------------------
// Hold tracking
// ---------------------------------------------------------------------------

/// Per-symbol hold-period bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldTracking {
    pub open_bar_id: u64,
    pub horizon: u32,
    pub entry_price: f64,
    pub earliest_exit_bar_id: u64,
}

/// Outcome of one completed trade, kept for adaptation queries.
#[derive(Debug, Clone, Copy)]
struct TradeResult {
    pnl: f64,
    profitable: bool,
}

/// Transition statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransitionStats {
    pub total_signals: u64,
    pub transitions_triggered: u64,
    pub long_signals: u64,
    pub long_transitions: u64,
    pub short_signals: u64,
    pub short_transitions: u64,
}

// ---------------------------------------------------------------------------
// PositionStateMachine
// ---------------------------------------------------------------------------

pub struct PositionStateMachine {
    family: InstrumentFamily,
    leverage_enabled: bool,
    enforce_minimum_hold: bool,
    max_bars_in_position: u32,

    current_state: PortfolioState,
    previous_state: PortfolioState,
    bars_in_position: u32,

    tracking: HashMap<String, HoldTracking>,
    recent_trades: VecDeque<TradeResult>,
    stats: TransitionStats,
}

impl PositionStateMachine {
    pub fn new(
        family: InstrumentFamily,
        leverage_enabled: bool,
        enforce_minimum_hold: bool,
        max_bars_in_position: u32,
    ) -> Self {
        Self {
            family,
            leverage_enabled,
            enforce_minimum_hold,
            max_bars_in_position,
            current_state: PortfolioState::CashOnly,
            previous_state: PortfolioState::CashOnly,
            bars_in_position: 0,
            tracking: HashMap::new(),
            recent_trades: VecDeque::new(),
            stats: TransitionStats::default(),
        }
    }

    // -------------------------------------------------------------------------
    // State determination
    // -------------------------------------------------------------------------

    /// Derive the portfolio state from the book's non-flat positions.
    ///
    /// Simultaneous long-family and short-family holdings are Invalid.
    pub fn determine_state(&self, positions: &[Position]) -> PortfolioState {
        let held = |symbol: &str| {
            positions
                .iter()
                .any(|p| p.symbol == symbol && p.quantity.abs() > FLAT_EPSILON)
        };

        let base_long = held(&self.family.base_long);
        let levered_long = held(&self.family.levered_long);
        let base_short = held(&self.family.base_short);
        let levered_short = held(&self.family.levered_short);

        let any_long = base_long || levered_long;
        let any_short = base_short || levered_short;

        if any_long && any_short {
            warn!("long-family and short-family positions held simultaneously");
            return PortfolioState::Invalid;
        }

        match (base_long, levered_long, base_short, levered_short) {
            (false, false, false, false) => PortfolioState::CashOnly,
            (true, true, _, _) => PortfolioState::DualLong,
            (true, false, _, _) => PortfolioState::BaseLong,
            (false, true, _, _) => PortfolioState::LeveredLong,
            (_, _, true, true) => PortfolioState::DualShort,
            (_, _, true, false) => PortfolioState::BaseShort,
            (_, _, false, true) => PortfolioState::LeveredShort,
        }
    }

    /// Update position-age tracking against the freshly determined state and
    /// return `(state, bars_in_position)` for threshold computation.
    pub fn observe(&mut self, positions: &[Position]) -> (PortfolioState, u32) {
        let state = self.determine_state(positions);
        if state != self.current_state {
            self.previous_state = self.current_state;
            self.current_state = state;
            self.bars_in_position = 0;
        } else {
            self.bars_in_position = self.bars_in_position.saturating_add(1);
        }
        (state, self.bars_in_position)
    }

    pub fn current_state(&self) -> PortfolioState {
        self.current_state
    }

    pub fn bars_in_position(&self) -> u32 {
        self.bars_in_position
    }

    pub fn stats(&self) -> TransitionStats {
        self.stats
    }

    // -------------------------------------------------------------------------
    // Decision
    // -------------------------------------------------------------------------

    /// Decide the target state for this bar.
    ///
    /// `state` and `bars_in_position` come from [`observe`]; `thresholds`
    /// from the hysteresis manager. Hold enforcement and position-age forcing
    /// are applied here.
    pub fn decide(
        &mut self,
        state: PortfolioState,
        signal: &Signal,
        thresholds: &DynamicThresholds,
        current_bar_id: u64,
    ) -> Transition {
        if state == PortfolioState::Invalid {
            return Transition {
                current_state: state,
                signal_kind: SignalKind::Neutral,
                target_state: PortfolioState::CashOnly,
                rationale: "Emergency liquidation".to_string(),
                is_hold_enforced: false,
                forced_by_age: false,
                bars_in_position: self.bars_in_position,
                prediction_horizon: signal.prediction_horizon,
                bars_remaining: 0,
            };
        }

        let mut kind = SignalKind::classify(signal.probability, thresholds);
        let mut forced_by_age = false;

        // Aged positions are pushed back toward cash with a weak exit signal.
        if state != PortfolioState::CashOnly && self.bars_in_position >= self.max_bars_in_position
        {
            kind = if state.is_long() {
                SignalKind::WeakSell
            } else {
                SignalKind::WeakBuy
            };
            forced_by_age = true;
            info!(
                state = %state,
                bars = self.bars_in_position,
                "position age limit reached, forcing exit signal"
            );
        }

        self.stats.total_signals += 1;
        if kind.is_buy() {
            self.stats.long_signals += 1;
        } else if kind.is_sell() {
            self.stats.short_signals += 1;
        }

        let (mut target, mut rationale) = transition_target(state, kind, self.leverage_enabled);

        // Hold enforcement: a transition that would close a symbol before its
        // earliest exit bar is suppressed. Age-forced exits still honor the
        // hold; EOD and the Invalid path bypass this method entirely.
        let mut is_hold_enforced = false;
        let mut bars_remaining = 0u64;
        if self.enforce_minimum_hold && target != state {
            let target_instruments = target.instruments(&self.family);

            for symbol in state.instruments(&self.family) {
                if target_instruments.contains(&symbol) {
                    continue;
                }
                if let Some(track) = self.tracking.get(&symbol) {
                    if current_bar_id < track.earliest_exit_bar_id {
                        is_hold_enforced = true;
                        bars_remaining =
                            bars_remaining.max(track.earliest_exit_bar_id - current_bar_id);
                    }
                }
            }

            if is_hold_enforced {
                target = state;
                rationale = "Minimum hold period active".to_string();
                debug!(
                    state = %state,
                    bars_remaining,
                    "transition suppressed by hold period"
                );
            }
        }

        if target != state {
            self.stats.transitions_triggered += 1;
            if kind.is_buy() && target.is_long() {
                self.stats.long_transitions += 1;
            } else if kind.is_sell() && target.is_short() {
                self.stats.short_transitions += 1;
            }
            info!(
                from = %state,
                to = %target,
                signal = %kind,
                rationale = %rationale,
                "state transition"
            );
        }

        Transition {
            current_state: state,
            signal_kind: kind,
            target_state: target,
            rationale,
            is_hold_enforced,
            forced_by_age,
            bars_in_position: self.bars_in_position,
            prediction_horizon: signal.prediction_horizon,
            bars_remaining,
        }
    }

    // -------------------------------------------------------------------------
    // Hold tracking
    // -------------------------------------------------------------------------

    /// Record a position entry for hold enforcement.
    pub fn record_position_entry(
        &mut self,
        symbol: &str,
        bar_id: u64,
        horizon: u32,
        entry_price: f64,
    ) {
        let horizon = horizon.max(1);
        self.tracking.insert(
            symbol.to_string(),
            HoldTracking {
                open_bar_id: bar_id,
                horizon,
                entry_price,
                earliest_exit_bar_id: bar_id + horizon as u64,
            },
        );
    }

    /// Forget hold tracking for a closed symbol.
    pub fn record_position_exit(&mut self, symbol: &str) {
        self.tracking.remove(symbol);
    }

    /// Whether `symbol` may be closed at `current_bar_id`.
    ///
    /// `bar_id == earliest_exit_bar_id` is the first bar on which exit is
    /// allowed. Untracked symbols are always closeable.
    pub fn can_close(&self, symbol: &str, current_bar_id: u64) -> bool {
        self.tracking
            .get(symbol)
            .map_or(true, |t| current_bar_id >= t.earliest_exit_bar_id)
    }

    pub fn hold_tracking(&self, symbol: &str) -> Option<&HoldTracking> {
        self.tracking.get(symbol)
    }

    pub fn clear_tracking(&mut self) {
        self.tracking.clear();
    }

    /// Restore tracking from persisted state on warm restart.
    pub fn restore_tracking(&mut self, entries: HashMap<String, HoldTracking>) {
        self.tracking = entries;
    }

    pub fn tracking_snapshot(&self) -> HashMap<String, HoldTracking> {
        self.tracking.clone()
    }

    // -------------------------------------------------------------------------
    // Trade-result window
    // -------------------------------------------------------------------------

    /// Record the PnL of a completed round trip.
    pub fn record_trade_result(&mut self, pnl: f64) {
        self.recent_trades.push_back(TradeResult {
            pnl,
            profitable: pnl > 0.0,
        });
        while self.recent_trades.len() > TRADE_RESULT_WINDOW {
            self.recent_trades.pop_front();
        }
    }

    /// Fraction of recent trades that were profitable (0.5 when no history).
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.5;
        }
        let wins = self.recent_trades.iter().filter(|t| t.profitable).count();
        wins as f64 / self.recent_trades.len() as f64
    }

    /// Mean PnL of recent trades (0.0 when no history).
    pub fn recent_avg_pnl(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        let total: f64 = self.recent_trades.iter().map(|t| t.pnl).sum();
        total / self.recent_trades.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// The fixed `(state, signal) → target` mapping.
///
/// With leverage disabled, dual and leveraged targets collapse to the base
/// instrument of the same side.
fn transition_target(
    state: PortfolioState,
    kind: SignalKind,
    leverage_enabled: bool,
) -> (PortfolioState, String) {
    use PortfolioState::*;
    use SignalKind::*;

    let dual_long = if leverage_enabled { DualLong } else { BaseLong };
    let dual_short = if leverage_enabled { DualShort } else { BaseShort };

    let (target, why): (PortfolioState, &str) = match (state, kind) {
        // --- From cash -----------------------------------------------------
        (CashOnly, StrongBuy) => (dual_long, "Strong bullish signal, enter long with leverage"),
        (CashOnly, WeakBuy) => (BaseLong, "Moderate bullish signal, enter base long"),
        (CashOnly, Neutral) => (CashOnly, "No edge, stay in cash"),
        (CashOnly, WeakSell) => (BaseShort, "Moderate bearish signal, enter base short"),
        (CashOnly, StrongSell) => (dual_short, "Strong bearish signal, enter short with leverage"),

        // --- Long family ---------------------------------------------------
        (BaseLong, StrongBuy) => (dual_long, "Scale up into leveraged long"),
        (BaseLong, WeakBuy) => (BaseLong, "Already long, hold"),
        (BaseLong, Neutral) => (BaseLong, "Signal neutral, hold long"),
        (BaseLong, WeakSell) => (CashOnly, "Bearish signal against long, exit to cash"),
        (BaseLong, StrongSell) => (CashOnly, "Strong bearish signal against long, exit to cash"),

        (LeveredLong, StrongBuy) => (dual_long, "Add base leg to leveraged long"),
        (LeveredLong, WeakBuy) => (LeveredLong, "Already leveraged long, hold"),
        (LeveredLong, Neutral) => (LeveredLong, "Signal neutral, hold leveraged long"),
        (LeveredLong, WeakSell) => (CashOnly, "Bearish signal against long, exit to cash"),
        (LeveredLong, StrongSell) => (CashOnly, "Strong bearish signal, exit to cash"),

        (DualLong, StrongBuy) => (DualLong, "Fully positioned long, hold"),
        (DualLong, WeakBuy) => (DualLong, "Fully positioned long, hold"),
        (DualLong, Neutral) => (DualLong, "Signal neutral, hold dual long"),
        (DualLong, WeakSell) => (CashOnly, "Opposing signal, exit long family to cash"),
        (DualLong, StrongSell) => (CashOnly, "Opposing signal, exit long family to cash"),

        // --- Short family --------------------------------------------------
        (BaseShort, StrongSell) => (dual_short, "Scale up into leveraged short"),
        (BaseShort, WeakSell) => (BaseShort, "Already short, hold"),
        (BaseShort, Neutral) => (BaseShort, "Signal neutral, hold short"),
        (BaseShort, WeakBuy) => (CashOnly, "Bullish signal against short, exit to cash"),
        (BaseShort, StrongBuy) => (CashOnly, "Strong bullish signal against short, exit to cash"),

        (LeveredShort, StrongSell) => (dual_short, "Add base leg to leveraged short"),
        (LeveredShort, WeakSell) => (LeveredShort, "Already leveraged short, hold"),
        (LeveredShort, Neutral) => (LeveredShort, "Signal neutral, hold leveraged short"),
        (LeveredShort, WeakBuy) => (CashOnly, "Bullish signal against short, exit to cash"),
        (LeveredShort, StrongBuy) => (CashOnly, "Strong bullish signal, exit to cash"),

        (DualShort, StrongSell) => (DualShort, "Fully positioned short, hold"),
        (DualShort, WeakSell) => (DualShort, "Fully positioned short, hold"),
        (DualShort, Neutral) => (DualShort, "Signal neutral, hold dual short"),
        (DualShort, WeakBuy) => (CashOnly, "Opposing signal, exit short family to cash"),
        (DualShort, StrongBuy) => (CashOnly, "Opposing signal, exit short family to cash"),

        // --- Emergency sink ------------------------------------------------
        (Invalid, _) => (CashOnly, "Emergency liquidation"),
    };

    (target, why.to_string())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hysteresis::DynamicThresholds;
    use crate::signals::SignalDirection;

    fn family() -> InstrumentFamily {
        InstrumentFamily::default()
    }

    fn psm() -> PositionStateMachine {
        PositionStateMachine::new(family(), true, true, 100)
    }

    fn thresholds() -> DynamicThresholds {
        DynamicThresholds::baseline()
    }

    fn signal(bar_id: u64, probability: f64) -> Signal {
        let direction = if probability > 0.5 {
            SignalDirection::Long
        } else if probability < 0.5 {
            SignalDirection::Short
        } else {
            SignalDirection::Neutral
        };
        Signal::new(bar_id, bar_id as i64 * 60_000, "QQQ", probability, direction, 5)
    }

    fn position(symbol: &str, qty: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            avg_entry_price: 100.0,
            current_price: 100.0,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn classification_boundaries_are_strict() {
        let t = thresholds();
        assert_eq!(SignalKind::classify(t.buy, &t), SignalKind::Neutral);
        assert_eq!(SignalKind::classify(t.sell, &t), SignalKind::Neutral);
        assert_eq!(SignalKind::classify(t.buy + 1e-9, &t), SignalKind::WeakBuy);
        assert_eq!(SignalKind::classify(t.sell - 1e-9, &t), SignalKind::WeakSell);
        assert_eq!(
            SignalKind::classify(t.strong_buy + 1e-9, &t),
            SignalKind::StrongBuy
        );
        assert_eq!(
            SignalKind::classify(t.strong_sell - 1e-9, &t),
            SignalKind::StrongSell
        );
    }

    #[test]
    fn cash_transitions_cover_all_signals() {
        use PortfolioState::*;
        let cases = [
            (SignalKind::StrongBuy, DualLong),
            (SignalKind::WeakBuy, BaseLong),
            (SignalKind::Neutral, CashOnly),
            (SignalKind::WeakSell, BaseShort),
            (SignalKind::StrongSell, DualShort),
        ];
        for (kind, expected) in cases {
            let (target, _) = transition_target(CashOnly, kind, true);
            assert_eq!(target, expected, "kind {kind}");
        }
    }

    #[test]
    fn leverage_disabled_collapses_dual_targets() {
        let (target, _) = transition_target(PortfolioState::CashOnly, SignalKind::StrongBuy, false);
        assert_eq!(target, PortfolioState::BaseLong);
        let (target, _) =
            transition_target(PortfolioState::CashOnly, SignalKind::StrongSell, false);
        assert_eq!(target, PortfolioState::BaseShort);
    }

    #[test]
    fn no_state_crosses_families_in_one_step() {
        use PortfolioState::*;
        let all_states = [
            CashOnly,
            BaseLong,
            LeveredLong,
            BaseShort,
            LeveredShort,
            DualLong,
            DualShort,
        ];
        let all_kinds = [
            SignalKind::StrongBuy,
            SignalKind::WeakBuy,
            SignalKind::Neutral,
            SignalKind::WeakSell,
            SignalKind::StrongSell,
        ];
        for state in all_states {
            for kind in all_kinds {
                let (target, _) = transition_target(state, kind, true);
                assert!(
                    !(state.is_long() && target.is_short())
                        && !(state.is_short() && target.is_long()),
                    "{state} + {kind} -> {target} crosses families"
                );
            }
        }
    }

    #[test]
    fn invalid_state_targets_cash_with_emergency_rationale() {
        let mut machine = psm();
        let t = machine.decide(PortfolioState::Invalid, &signal(10, 0.9), &thresholds(), 10);
        assert_eq!(t.target_state, PortfolioState::CashOnly);
        assert_eq!(t.rationale, "Emergency liquidation");
    }

    #[test]
    fn determine_state_from_positions() {
        let machine = psm();
        assert_eq!(machine.determine_state(&[]), PortfolioState::CashOnly);
        assert_eq!(
            machine.determine_state(&[position("QQQ", 100.0)]),
            PortfolioState::BaseLong
        );
        assert_eq!(
            machine.determine_state(&[position("QQQ", 100.0), position("TQQQ", 50.0)]),
            PortfolioState::DualLong
        );
        assert_eq!(
            machine.determine_state(&[position("SQQQ", -300.0)]),
            PortfolioState::LeveredShort
        );
        assert_eq!(
            machine.determine_state(&[position("SQQQ", -300.0), position("PSQ", -200.0)]),
            PortfolioState::DualShort
        );
        // Long + short simultaneously is the emergency case.
        assert_eq!(
            machine.determine_state(&[position("QQQ", 100.0), position("PSQ", 50.0)]),
            PortfolioState::Invalid
        );
    }

    #[test]
    fn hold_period_suppresses_exit() {
        // Position opened at bar 1000, horizon 5: bars 1000..1004 are locked.
        let mut machine = psm();
        machine.record_position_entry("QQQ", 1000, 5, 400.0);

        let positions = [position("QQQ", 100.0)];
        let (state, _) = machine.observe(&positions);
        assert_eq!(state, PortfolioState::BaseLong);

        // Strong sell at bar 1003 is suppressed.
        let t = machine.decide(state, &signal(1003, 0.10), &thresholds(), 1003);
        assert!(t.is_hold_enforced);
        assert_eq!(t.target_state, PortfolioState::BaseLong);
        assert_eq!(t.bars_remaining, 2);

        // Bar 1005 is the first bar exit is allowed.
        assert!(!machine.can_close("QQQ", 1004));
        assert!(machine.can_close("QQQ", 1005));
        let t = machine.decide(state, &signal(1005, 0.10), &thresholds(), 1005);
        assert!(!t.is_hold_enforced);
        assert_eq!(t.target_state, PortfolioState::CashOnly);
    }

    #[test]
    fn scaling_up_does_not_trip_hold_enforcement() {
        // BaseLong -> DualLong keeps the base leg, so its hold is irrelevant.
        let mut machine = psm();
        machine.record_position_entry("QQQ", 1000, 10, 400.0);
        let positions = [position("QQQ", 100.0)];
        let (state, _) = machine.observe(&positions);
        let t = machine.decide(state, &signal(1002, 0.95), &thresholds(), 1002);
        assert!(!t.is_hold_enforced);
        assert_eq!(t.target_state, PortfolioState::DualLong);
    }

    #[test]
    fn position_age_forces_weak_exit() {
        let mut machine = PositionStateMachine::new(family(), true, false, 3);
        let positions = [position("QQQ", 100.0)];
        // Observe 4 times: bars_in_position reaches 3.
        machine.observe(&positions);
        machine.observe(&positions);
        machine.observe(&positions);
        let (state, bars) = machine.observe(&positions);
        assert_eq!(bars, 3);
        // Even a strongly bullish probability is overridden to an exit.
        let t = machine.decide(state, &signal(2000, 0.95), &thresholds(), 2000);
        assert!(t.forced_by_age);
        assert_eq!(t.signal_kind, SignalKind::WeakSell);
        assert_eq!(t.target_state, PortfolioState::CashOnly);
    }

    #[test]
    fn observe_resets_bar_count_on_state_change() {
        let mut machine = psm();
        let long = [position("QQQ", 100.0)];
        machine.observe(&long);
        machine.observe(&long);
        assert_eq!(machine.bars_in_position(), 1);
        let (state, bars) = machine.observe(&[]);
        assert_eq!(state, PortfolioState::CashOnly);
        assert_eq!(bars, 0);
    }

    #[test]
    fn trade_result_window_tracks_win_rate() {
        let mut machine = psm();
        assert!((machine.recent_win_rate() - 0.5).abs() < f64::EPSILON);
        machine.record_trade_result(100.0);
        machine.record_trade_result(-50.0);
        machine.record_trade_result(25.0);
        assert!((machine.recent_win_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert!((machine.recent_avg_pnl() - 25.0).abs() < 1e-12);
    }
}
