// =============================================================================
// Enhanced Backend — per-bar orchestration of PSM + hysteresis + allocation
// =============================================================================
//
// One bar in, one decision out:
//
//   signal -> history append -> state from book -> thresholds -> classify ->
//   transition -> liquidation/entry orders -> risk gate -> (engine executes)
//
// The backend owns the three decision subsystems and produces order intents;
// it never talks to a broker. Live execution and simulation feed the same
// decision path, so backtest and live behavior can only diverge at the fill.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocation::{
    AllocationResult, DynamicAllocationManager, MarketConditions,
};
use crate::hysteresis::{DynamicHysteresisManager, DynamicThresholds};
use crate::market_data::{Bar, PriceView};
use crate::position_book::{Position, PositionBook};
use crate::runtime_config::{InstrumentFamily, RuntimeConfig};
use crate::signals::trade_log::{TradeAction, TradeLogRecord, TRADE_LOG_VERSION};
use crate::signals::Signal;
use crate::state_machine::{PortfolioState, PositionStateMachine, Transition};
use crate::types::{CostModel, OrderSide, SignalGenerationMode};

/// Returns tracked per horizon for success-rate estimation.
const HORIZON_RETURN_WINDOW: usize = 100;

/// Bars between performance report log lines.
const PERFORMANCE_REPORT_INTERVAL: u64 = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Conditions that should be impossible given valid inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum InvariantError {
    /// A leg the engine must price has no quote this bar.
    MissingPrice { symbol: String, bar_id: u64 },
}

impl std::fmt::Display for InvariantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPrice { symbol, bar_id } => {
                write!(f, "no price for {symbol} at bar {bar_id}")
            }
        }
    }
}

impl std::error::Error for InvariantError {}

/// Risk-gate outcomes that modify or reject an order batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskViolation {
    /// Batch value above the cap; quantities were scaled down.
    PositionValueScaled { total: f64, limit: f64 },
    /// Leverage above the cap; the batch was rejected.
    LeverageRejected { leverage: f64, limit: f64 },
}

impl std::fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PositionValueScaled { total, limit } => {
                write!(f, "order batch value {total:.0} scaled to limit {limit:.0}")
            }
            Self::LeverageRejected { leverage, limit } => {
                write!(f, "portfolio leverage {leverage:.2} exceeds limit {limit:.2}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Orders and decisions
// ---------------------------------------------------------------------------

/// One order intent produced by the backend.
#[derive(Debug, Clone, Serialize)]
pub struct TradeOrder {
    pub order_uuid: String,
    pub bar_id: u64,
    pub timestamp_ms: i64,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    /// Estimated execution price (slippage applied against the side).
    pub price: f64,
    pub trade_value: f64,
    pub fees: f64,
    // Multi-bar metadata.
    pub prediction_horizon: u32,
    pub target_bar_id: u64,
    pub entry_bar_id: u64,
    pub reason: String,
}

/// Everything the backend concluded for one bar.
#[derive(Debug, Clone)]
pub struct BackendDecision {
    pub transition: Transition,
    pub thresholds: DynamicThresholds,
    pub allocation: Option<AllocationResult>,
    pub orders: Vec<TradeOrder>,
    pub rejection_reason: Option<String>,
    /// False on bars throttled by ADAPTIVE mode.
    pub fresh_decision: bool,
}

/// The portfolio facts the backend decides against.
#[derive(Debug, Clone)]
pub struct PortfolioView {
    pub cash: f64,
    pub equity: f64,
    pub positions: Vec<Position>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// The slice of runtime configuration the backend needs.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub family: InstrumentFamily,
    pub leverage_enabled: bool,
    pub cost_model: CostModel,
    pub slippage_factor: f64,
    pub signal_generation_mode: SignalGenerationMode,
    pub signal_generation_interval: u32,
    pub enforce_minimum_hold: bool,
    pub early_exit_penalty: f64,
    pub max_bars_in_position: u32,
    pub max_position_value: f64,
    pub max_portfolio_leverage: f64,
    pub daily_loss_limit: f64,
    pub starting_capital: f64,
    pub hysteresis: crate::hysteresis::HysteresisConfig,
    pub allocation: crate::allocation::AllocationConfig,
}

impl BackendConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            family: config.instruments.clone(),
            leverage_enabled: config.leverage_enabled,
            cost_model: config.cost_model,
            slippage_factor: config.slippage_factor,
            signal_generation_mode: config.signal_generation_mode,
            signal_generation_interval: config.signal_generation_interval,
            enforce_minimum_hold: config.enforce_minimum_hold,
            early_exit_penalty: config.early_exit_penalty,
            max_bars_in_position: config.max_bars_in_position,
            max_position_value: config.max_position_value,
            max_portfolio_leverage: config.max_portfolio_leverage,
            daily_loss_limit: config.daily_loss_limit,
            starting_capital: config.starting_capital,
            hysteresis: config.hysteresis.clone(),
            allocation: config.allocation.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct BackendMetrics {
    pub bars_processed: u64,
    pub total_transitions: u64,
    pub dual_transitions: u64,
    pub single_transitions: u64,
    pub hold_decisions: u64,
    pub risk_rejections: u64,
    pub daily_pnl: f64,
}

#[derive(Debug, Clone)]
struct HorizonEntry {
    symbol: String,
    target_bar_id: u64,
    entry_price: f64,
    is_long: bool,
    horizon: u32,
}

// =============================================================================
// EnhancedBackend
// =============================================================================

pub struct EnhancedBackend {
    config: BackendConfig,
    run_id: String,
    hysteresis: DynamicHysteresisManager,
    allocation: DynamicAllocationManager,
    psm: PositionStateMachine,
    bars_since_last_decision: u32,
    metrics: BackendMetrics,
    bars_since_report: u64,
    horizon_entries: Vec<HorizonEntry>,
    horizon_returns: HashMap<u32, VecDeque<f64>>,
}

impl EnhancedBackend {
    pub fn new(config: BackendConfig) -> Self {
        let hysteresis = DynamicHysteresisManager::new(config.hysteresis.clone());
        let allocation =
            DynamicAllocationManager::new(config.allocation.clone(), config.family.clone());
        let psm = PositionStateMachine::new(
            config.family.clone(),
            config.leverage_enabled,
            config.enforce_minimum_hold,
            config.max_bars_in_position,
        );

        info!(
            leverage_enabled = config.leverage_enabled,
            cost_model = %config.cost_model,
            mode = %config.signal_generation_mode,
            "enhanced backend initialised"
        );

        Self {
            config,
            run_id: Uuid::new_v4().to_string(),
            hysteresis,
            allocation,
            psm,
            bars_since_last_decision: 0,
            metrics: BackendMetrics::default(),
            bars_since_report: 0,
            horizon_entries: Vec::new(),
            horizon_returns: HashMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn metrics(&self) -> BackendMetrics {
        self.metrics
    }

    pub fn psm_mut(&mut self) -> &mut PositionStateMachine {
        &mut self.psm
    }

    pub fn hysteresis_mut(&mut self) -> &mut DynamicHysteresisManager {
        &mut self.hysteresis
    }

    /// Per-horizon success rates observed so far.
    pub fn horizon_success_rates(&self) -> HashMap<u32, f64> {
        self.horizon_returns
            .iter()
            .filter(|(_, returns)| !returns.is_empty())
            .map(|(horizon, returns)| {
                let wins = returns.iter().filter(|r| **r > 0.0).count();
                (*horizon, wins as f64 / returns.len() as f64)
            })
            .collect()
    }

    /// Roll realized P&L into the daily counter and check the loss limit.
    pub fn record_realized_pnl(&mut self, delta: f64, equity: f64) {
        self.metrics.daily_pnl += delta;
        if self.metrics.daily_pnl < 0.0 && equity > 0.0 {
            let loss_pct = -self.metrics.daily_pnl / equity;
            if loss_pct > self.config.daily_loss_limit {
                error!(
                    loss_pct = loss_pct * 100.0,
                    limit_pct = self.config.daily_loss_limit * 100.0,
                    "DAILY LOSS LIMIT BREACHED"
                );
            }
        }
    }

    pub fn reset_daily_pnl(&mut self) {
        self.metrics.daily_pnl = 0.0;
    }

    // -------------------------------------------------------------------------
    // Per-bar decision
    // -------------------------------------------------------------------------

    /// Run the full decision pipeline for one bar.
    pub fn process_bar(
        &mut self,
        signal: &Signal,
        bar: &Bar,
        prices: &PriceView,
        portfolio: &PortfolioView,
    ) -> Result<BackendDecision, InvariantError> {
        self.metrics.bars_processed += 1;

        // 1. History feeds the hysteresis statistics on every bar.
        self.hysteresis.update_signal_history(signal);

        // 2. Current state from the book.
        let (state, bars_in_position) = self.psm.observe(&portfolio.positions);

        // Settle any horizon entries whose target bar arrived.
        self.settle_horizon_entries(bar.bar_id, prices);

        // 3. Invalid book: flatten everything, skip the rest of the pipeline.
        if state == PortfolioState::Invalid {
            let thresholds = self.hysteresis.thresholds(state, bars_in_position);
            let transition = self.psm.decide(state, signal, &thresholds, bar.bar_id);
            let orders =
                self.liquidation_orders(&portfolio.positions, &[], signal, bar, prices, true)?;
            warn!(bar_id = bar.bar_id, "invalid portfolio state, emergency flatten");
            self.metrics.total_transitions += 1;
            return Ok(BackendDecision {
                transition,
                thresholds,
                allocation: None,
                orders,
                rejection_reason: None,
                fresh_decision: true,
            });
        }

        // 4. Adaptive throttling: stale bars propagate a hold.
        let fresh_decision = match self.config.signal_generation_mode {
            SignalGenerationMode::EveryBar => true,
            SignalGenerationMode::Adaptive => {
                if self.bars_since_last_decision >= self.config.signal_generation_interval {
                    self.bars_since_last_decision = 0;
                    true
                } else {
                    self.bars_since_last_decision += 1;
                    false
                }
            }
        };

        // 5. Thresholds, classification, transition.
        let thresholds = self.hysteresis.thresholds(state, bars_in_position);
        let transition = self.psm.decide(state, signal, &thresholds, bar.bar_id);

        debug!(
            bar_id = bar.bar_id,
            state = %state,
            signal = %transition.signal_kind,
            target = %transition.target_state,
            buy = thresholds.buy,
            sell = thresholds.sell,
            regime = %thresholds.regime,
            bars_in_position,
            fresh = fresh_decision,
            "bar decision"
        );

        if !fresh_decision
            || transition.is_hold_enforced
            || transition.target_state == transition.current_state
        {
            self.metrics.hold_decisions += 1;
            return Ok(BackendDecision {
                transition,
                thresholds,
                allocation: None,
                orders: Vec::new(),
                rejection_reason: None,
                fresh_decision,
            });
        }

        // 6. Build liquidation + entry orders for the state change.
        let target_instruments = transition.target_state.instruments(&self.config.family);
        let mut orders = self.liquidation_orders(
            &portfolio.positions,
            &target_instruments,
            signal,
            bar,
            prices,
            false,
        )?;

        let liquidation_proceeds: f64 = orders.iter().map(|o| o.trade_value).sum();
        let available_capital = portfolio.cash + liquidation_proceeds;

        let mut allocation = None;
        if transition.target_state.is_dual() {
            let result = self.dual_entry_orders(
                &transition,
                signal,
                bar,
                prices,
                available_capital,
                &mut orders,
            )?;
            allocation = Some(result);
        } else if transition.target_state != PortfolioState::CashOnly {
            let result = self.single_entry_orders(
                &transition,
                signal,
                bar,
                prices,
                available_capital,
                &mut orders,
            )?;
            allocation = Some(result);
        }

        // An invalid allocation turns the whole bar into a hold.
        if let Some(ref alloc) = allocation {
            if !alloc.is_valid {
                warn!(bar_id = bar.bar_id, rationale = %alloc.rationale, "allocation invalid, holding");
                self.metrics.hold_decisions += 1;
                return Ok(BackendDecision {
                    transition,
                    thresholds,
                    allocation,
                    orders: Vec::new(),
                    rejection_reason: Some("invalid allocation".to_string()),
                    fresh_decision,
                });
            }
        }

        // 7. Risk gate.
        let rejection_reason = match self.apply_risk_gate(&mut orders, portfolio.equity) {
            Some(RiskViolation::LeverageRejected { leverage, limit }) => {
                self.metrics.risk_rejections += 1;
                orders.clear();
                Some(format!(
                    "leverage {leverage:.2}x exceeds cap {limit:.2}x"
                ))
            }
            Some(RiskViolation::PositionValueScaled { .. }) | None => None,
        };

        if !orders.is_empty() {
            self.metrics.total_transitions += 1;
            if transition.target_state.is_dual() {
                self.metrics.dual_transitions += 1;
            } else if transition.target_state != PortfolioState::CashOnly {
                self.metrics.single_transitions += 1;
            }
            // Hold bookkeeping: exits clear tracking, entries record it.
            for order in &orders {
                match order.action {
                    TradeAction::Sell => self.psm.record_position_exit(&order.symbol),
                    TradeAction::Buy => {
                        self.psm.record_position_entry(
                            &order.symbol,
                            bar.bar_id,
                            signal.prediction_horizon,
                            order.price,
                        );
                        self.horizon_entries.push(HorizonEntry {
                            symbol: order.symbol.clone(),
                            target_bar_id: signal.target_bar_id,
                            entry_price: order.price,
                            is_long: transition.target_state.is_long(),
                            horizon: signal.prediction_horizon,
                        });
                    }
                    TradeAction::Hold => {}
                }
            }
        }

        self.maybe_log_performance_report();

        Ok(BackendDecision {
            transition,
            thresholds,
            allocation,
            orders,
            rejection_reason,
            fresh_decision,
        })
    }

    // -------------------------------------------------------------------------
    // Order construction
    // -------------------------------------------------------------------------

    /// Sell orders closing every held position not in the target set.
    ///
    /// Leveraged legs are released first to shed risk first. Exits before the
    /// earliest allowed bar take the early-exit price haircut (accounting
    /// only); `bypass_hold` marks the emergency path.
    fn liquidation_orders(
        &mut self,
        positions: &[Position],
        target_instruments: &[String],
        signal: &Signal,
        bar: &Bar,
        prices: &PriceView,
        bypass_hold: bool,
    ) -> Result<Vec<TradeOrder>, InvariantError> {
        let mut to_close: Vec<&Position> = positions
            .iter()
            .filter(|p| !p.is_flat() && !target_instruments.contains(&p.symbol))
            .collect();

        // Leveraged symbols first.
        to_close.sort_by_key(|p| {
            if self.config.family.is_leveraged(&p.symbol) {
                0
            } else {
                1
            }
        });

        let mut orders = Vec::new();
        for position in to_close {
            let market_price = prices.price_of(&position.symbol).ok_or_else(|| {
                InvariantError::MissingPrice {
                    symbol: position.symbol.clone(),
                    bar_id: bar.bar_id,
                }
            })?;

            let mut price = self.execution_price(market_price, OrderSide::Sell);

            let early_exit = !bypass_hold && !self.psm.can_close(&position.symbol, bar.bar_id);
            if early_exit && self.config.early_exit_penalty > 0.0 {
                price *= 1.0 - self.config.early_exit_penalty;
                warn!(
                    symbol = %position.symbol,
                    penalty_pct = self.config.early_exit_penalty * 100.0,
                    "early exit penalty applied"
                );
            }

            let quantity = position.quantity.abs();
            let trade_value = quantity * price;
            orders.push(TradeOrder {
                order_uuid: Uuid::new_v4().to_string(),
                bar_id: bar.bar_id,
                timestamp_ms: bar.timestamp_ms,
                symbol: position.symbol.clone(),
                action: TradeAction::Sell,
                quantity,
                price,
                trade_value,
                fees: self.config.cost_model.fee(trade_value),
                prediction_horizon: signal.prediction_horizon,
                target_bar_id: signal.target_bar_id,
                entry_bar_id: signal.bar_id,
                reason: if bypass_hold {
                    "Emergency liquidation".to_string()
                } else {
                    "Release position for state transition".to_string()
                },
            });
        }

        Ok(orders)
    }

    /// Entry orders for a dual target from the allocation manager.
    fn dual_entry_orders(
        &mut self,
        transition: &Transition,
        signal: &Signal,
        bar: &Bar,
        prices: &PriceView,
        available_capital: f64,
        orders: &mut Vec<TradeOrder>,
    ) -> Result<AllocationResult, InvariantError> {
        let family = &self.config.family;
        let (base_symbol, leveraged_symbol) = if transition.target_state.is_long() {
            (family.base_long.clone(), family.levered_long.clone())
        } else {
            (family.base_short.clone(), family.levered_short.clone())
        };

        let price_base =
            prices
                .price_of(&base_symbol)
                .ok_or_else(|| InvariantError::MissingPrice {
                    symbol: base_symbol.clone(),
                    bar_id: bar.bar_id,
                })?;
        let price_leveraged =
            prices
                .price_of(&leveraged_symbol)
                .ok_or_else(|| InvariantError::MissingPrice {
                    symbol: leveraged_symbol.clone(),
                    bar_id: bar.bar_id,
                })?;

        let market = MarketConditions {
            current_volatility: 0.0,
            trend_strength: 0.0,
        };
        let allocation = self.allocation.calculate_dual_allocation(
            transition.target_state,
            signal,
            available_capital,
            price_base,
            price_leveraged,
            &market,
        );

        if allocation.is_valid {
            if allocation.base_quantity >= 1 {
                orders.push(self.entry_order(
                    &allocation.base_symbol,
                    allocation.base_quantity as f64,
                    price_base,
                    signal,
                    bar,
                    &transition.rationale,
                ));
            }
            if allocation.leveraged_quantity >= 1 {
                if let Some(ref leveraged) = allocation.leveraged_symbol {
                    orders.push(self.entry_order(
                        leveraged,
                        allocation.leveraged_quantity as f64,
                        price_leveraged,
                        signal,
                        bar,
                        &transition.rationale,
                    ));
                }
            }
        }

        Ok(allocation)
    }

    /// Entry order for a single non-cash target.
    fn single_entry_orders(
        &mut self,
        transition: &Transition,
        signal: &Signal,
        bar: &Bar,
        prices: &PriceView,
        available_capital: f64,
        orders: &mut Vec<TradeOrder>,
    ) -> Result<AllocationResult, InvariantError> {
        let instruments = transition.target_state.instruments(&self.config.family);
        let symbol = instruments
            .first()
            .cloned()
            .unwrap_or_else(|| self.config.family.base_long.clone());

        let price = prices
            .price_of(&symbol)
            .ok_or_else(|| InvariantError::MissingPrice {
                symbol: symbol.clone(),
                bar_id: bar.bar_id,
            })?;

        let is_leveraged = self.config.family.is_leveraged(&symbol);
        let allocation = self.allocation.calculate_single_allocation(
            &symbol,
            signal,
            available_capital,
            price,
            is_leveraged,
        );

        if allocation.is_valid && allocation.base_quantity >= 1 {
            orders.push(self.entry_order(
                &symbol,
                allocation.base_quantity as f64,
                price,
                signal,
                bar,
                &transition.rationale,
            ));
        }

        Ok(allocation)
    }

    fn entry_order(
        &self,
        symbol: &str,
        quantity: f64,
        market_price: f64,
        signal: &Signal,
        bar: &Bar,
        reason: &str,
    ) -> TradeOrder {
        let price = self.execution_price(market_price, OrderSide::Buy);
        let trade_value = quantity * price;
        TradeOrder {
            order_uuid: Uuid::new_v4().to_string(),
            bar_id: bar.bar_id,
            timestamp_ms: bar.timestamp_ms,
            symbol: symbol.to_string(),
            action: TradeAction::Buy,
            quantity,
            price,
            trade_value,
            fees: self.config.cost_model.fee(trade_value),
            prediction_horizon: signal.prediction_horizon,
            target_bar_id: signal.target_bar_id,
            entry_bar_id: signal.bar_id,
            reason: reason.to_string(),
        }
    }

    /// Simulated execution price: slippage works against the side.
    fn execution_price(&self, base_price: f64, side: OrderSide) -> f64 {
        base_price + side.sign() * base_price * self.config.slippage_factor
    }

    // -------------------------------------------------------------------------
    // Risk gate
    // -------------------------------------------------------------------------

    /// Enforce batch value and leverage caps. Returns the violation applied.
    fn apply_risk_gate(
        &self,
        orders: &mut Vec<TradeOrder>,
        reference_equity: f64,
    ) -> Option<RiskViolation> {
        if orders.is_empty() {
            return None;
        }

        let total_value: f64 = orders.iter().map(|o| o.trade_value).sum();

        let mut applied = None;
        if total_value > self.config.max_position_value {
            let scale = self.config.max_position_value / total_value;
            for order in orders.iter_mut() {
                order.quantity = (order.quantity * scale).floor();
                order.trade_value = order.quantity * order.price;
                order.fees = self.config.cost_model.fee(order.trade_value);
            }
            orders.retain(|o| o.quantity >= 1.0);
            warn!(
                total_value,
                limit = self.config.max_position_value,
                "order batch scaled down to position-value limit"
            );
            applied = Some(RiskViolation::PositionValueScaled {
                total: total_value,
                limit: self.config.max_position_value,
            });
        }

        let weighted_exposure: f64 = orders
            .iter()
            .map(|o| {
                let factor = if self.config.family.is_leveraged(&o.symbol) {
                    3.0
                } else {
                    1.0
                };
                o.trade_value * factor
            })
            .sum();

        if reference_equity > 0.0 {
            let leverage = weighted_exposure / reference_equity;
            if leverage > self.config.max_portfolio_leverage {
                error!(
                    leverage,
                    limit = self.config.max_portfolio_leverage,
                    "order batch rejected by leverage cap"
                );
                return Some(RiskViolation::LeverageRejected {
                    leverage,
                    limit: self.config.max_portfolio_leverage,
                });
            }
        }

        applied
    }

    // -------------------------------------------------------------------------
    // Horizon performance tracking
    // -------------------------------------------------------------------------

    fn settle_horizon_entries(&mut self, current_bar_id: u64, prices: &PriceView) {
        let mut remaining = Vec::with_capacity(self.horizon_entries.len());
        for entry in self.horizon_entries.drain(..) {
            if current_bar_id < entry.target_bar_id {
                remaining.push(entry);
                continue;
            }

            let Some(current_price) = prices.price_of(&entry.symbol) else {
                remaining.push(entry);
                continue;
            };

            let mut return_pct = (current_price - entry.entry_price) / entry.entry_price;
            if !entry.is_long {
                return_pct = -return_pct;
            }

            let returns = self.horizon_returns.entry(entry.horizon).or_default();
            returns.push_back(return_pct);
            while returns.len() > HORIZON_RETURN_WINDOW {
                returns.pop_front();
            }
        }
        self.horizon_entries = remaining;
    }

    fn maybe_log_performance_report(&mut self) {
        self.bars_since_report += 1;
        if self.bars_since_report < PERFORMANCE_REPORT_INTERVAL {
            return;
        }
        self.bars_since_report = 0;

        let psm_stats = self.psm.stats();
        info!(
            bars = self.metrics.bars_processed,
            transitions = self.metrics.total_transitions,
            dual = self.metrics.dual_transitions,
            single = self.metrics.single_transitions,
            holds = self.metrics.hold_decisions,
            risk_rejections = self.metrics.risk_rejections,
            daily_pnl = self.metrics.daily_pnl,
            recent_win_rate = self.psm.recent_win_rate(),
            long_transitions = psm_stats.long_transitions,
            long_signals = psm_stats.long_signals,
            short_transitions = psm_stats.short_transitions,
            short_signals = psm_stats.short_signals,
            "performance report"
        );
        for (horizon, rate) in self.horizon_success_rates() {
            info!(horizon, success_rate = rate, "horizon performance");
        }
    }

    // -------------------------------------------------------------------------
    // Trade log
    // -------------------------------------------------------------------------

    /// Build the single trade-log record for one consumed signal.
    ///
    /// With no orders the record is a HOLD; otherwise the largest order by
    /// value represents the batch and fees are summed across it.
    #[allow(clippy::too_many_arguments)]
    pub fn make_trade_record(
        &self,
        signal: &Signal,
        bar: &Bar,
        bar_index: i64,
        decision: &BackendDecision,
        cash_before: f64,
        equity_before: f64,
        cash_after: f64,
        equity_after: f64,
        positions_after: &[Position],
        realized_pnl_delta: f64,
    ) -> TradeLogRecord {
        let total_fees: f64 = decision.orders.iter().map(|o| o.fees).sum();
        let representative = decision
            .orders
            .iter()
            .max_by(|a, b| a.trade_value.total_cmp(&b.trade_value));

        let (action, symbol, quantity, price, trade_value) = match representative {
            Some(order) => (
                order.action,
                order.symbol.clone(),
                order.quantity,
                order.price,
                order.trade_value,
            ),
            None => (TradeAction::Hold, signal.symbol.clone(), 0.0, bar.close, 0.0),
        };

        let positions_summary = positions_after
            .iter()
            .map(|p| format!("{}:{}", p.symbol, p.quantity))
            .collect::<Vec<_>>()
            .join(",");
        let unrealized_after: f64 = positions_after.iter().map(|p| p.unrealized_pnl).sum();

        TradeLogRecord {
            version: TRADE_LOG_VERSION.to_string(),
            run_id: self.run_id.clone(),
            bar_id: signal.bar_id,
            timestamp_ms: bar.timestamp_ms,
            bar_index,
            symbol,
            action,
            quantity,
            price,
            trade_value,
            fees: total_fees,
            cash_before,
            equity_before,
            cash_after,
            equity_after,
            positions_after: positions_after.len() as i64,
            signal_probability: signal.probability,
            execution_reason: decision.transition.rationale.clone(),
            rejection_reason: decision.rejection_reason.clone().unwrap_or_default(),
            conflict_check_passed: decision.rejection_reason.is_none(),
            realized_pnl_delta,
            unrealized_after,
            positions_summary,
        }
    }
}

// =============================================================================
// Simulation — the canonical in-memory execution path
// =============================================================================

/// Result of a simulated run over aligned signal and bar slices.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Equity marked at every processed bar.
    pub equity_curve: Vec<f64>,
    pub final_equity: f64,
    pub trade_count: usize,
    pub records: Vec<TradeLogRecord>,
}

/// Run the backend over aligned signals/bars with synthesized fills.
///
/// `pricer` supplies the per-symbol prices for each bar; the default prices
/// every family leg at the bar close.
pub fn simulate(
    config: &BackendConfig,
    signals: &[Signal],
    bars: &[Bar],
    pricer: Option<&dyn Fn(&Bar) -> PriceView>,
) -> SimulationResult {
    let family = config.family.clone();
    let default_pricer = move |bar: &Bar| {
        let mut view = PriceView::new();
        for symbol in family.symbols() {
            view.set(&symbol, bar.close);
        }
        view
    };

    let mut backend = EnhancedBackend::new(config.clone());
    let mut book = PositionBook::new();
    let mut cash = config.starting_capital;
    let mut equity_curve = Vec::with_capacity(bars.len());
    let mut records = Vec::new();
    let mut trade_count = 0usize;

    let n = signals.len().min(bars.len());
    for i in 0..n {
        let signal = &signals[i];
        let bar = &bars[i];

        let prices = match pricer {
            Some(p) => p(bar),
            None => default_pricer(bar),
        };

        // Mark open positions before deciding.
        for position in book.get_all_positions() {
            if let Some(price) = prices.price_of(&position.symbol) {
                book.update_market_price(&position.symbol, price);
            }
        }

        let equity_before = cash
            + book
                .get_all_positions()
                .iter()
                .map(|p| p.market_value())
                .sum::<f64>();
        let cash_before = cash;

        let portfolio = PortfolioView {
            cash,
            equity: equity_before,
            positions: book.get_all_positions(),
        };

        let decision = match backend.process_bar(signal, bar, &prices, &portfolio) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(bar_id = bar.bar_id, error = %e, "simulation skipped bar");
                equity_curve.push(equity_before);
                continue;
            }
        };

        // Synthesize immediate fills at the order price.
        let mut realized_delta = 0.0;
        for order in &decision.orders {
            let side = match order.action {
                TradeAction::Buy => OrderSide::Buy,
                TradeAction::Sell => OrderSide::Sell,
                TradeAction::Hold => continue,
            };
            let report = crate::broker::ExecutionReport {
                order_id: order.order_uuid.clone(),
                symbol: order.symbol.clone(),
                side,
                filled_qty: order.quantity,
                avg_fill_price: order.price,
                status: "filled".to_string(),
                timestamp_ms: order.timestamp_ms,
            };
            realized_delta += book.on_execution(&report);
            cash -= side.sign() * order.trade_value + order.fees;
            trade_count += 1;
        }
        if realized_delta != 0.0 {
            backend.psm_mut().record_trade_result(realized_delta);
        }

        // Re-mark after fills.
        for position in book.get_all_positions() {
            if let Some(price) = prices.price_of(&position.symbol) {
                book.update_market_price(&position.symbol, price);
            }
        }
        let equity_after = cash
            + book
                .get_all_positions()
                .iter()
                .map(|p| p.market_value())
                .sum::<f64>();

        backend.record_realized_pnl(realized_delta, equity_after);

        records.push(backend.make_trade_record(
            signal,
            bar,
            i as i64,
            &decision,
            cash_before,
            equity_before,
            cash,
            equity_after,
            &book.get_all_positions(),
            realized_delta,
        ));

        equity_curve.push(equity_after);
    }

    let final_equity = equity_curve.last().copied().unwrap_or(config.starting_capital);
    SimulationResult {
        equity_curve,
        final_equity,
        trade_count,
        records,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalDirection;

    fn config() -> BackendConfig {
        BackendConfig::from_runtime(&RuntimeConfig::default())
    }

    fn bar(bar_id: u64, close: f64) -> Bar {
        Bar {
            symbol: "QQQ".to_string(),
            bar_id,
            timestamp_ms: bar_id as i64 * 60_000,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 10_000,
        }
    }

    fn signal(bar_id: u64, probability: f64, horizon: u32) -> Signal {
        let direction = if probability > 0.5 {
            SignalDirection::Long
        } else if probability < 0.5 {
            SignalDirection::Short
        } else {
            SignalDirection::Neutral
        };
        Signal::new(bar_id, bar_id as i64 * 60_000, "QQQ", probability, direction, horizon)
    }

    fn prices() -> PriceView {
        let mut view = PriceView::new();
        view.set("QQQ", 400.0);
        view.set("TQQQ", 80.0);
        view.set("PSQ", 30.0);
        view.set("SQQQ", 20.0);
        view
    }

    fn cash_portfolio(cash: f64) -> PortfolioView {
        PortfolioView {
            cash,
            equity: cash,
            positions: Vec::new(),
        }
    }

    fn position(symbol: &str, qty: f64, avg: f64, current: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            avg_entry_price: avg,
            current_price: current,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn strong_buy_from_cash_enters_dual_long() {
        // The worked entry example: p=0.80, $100k, QQQ=$400, TQQQ=$80.
        let mut backend = EnhancedBackend::new(config());
        let decision = backend
            .process_bar(&signal(1, 0.80, 1), &bar(1, 400.0), &prices(), &cash_portfolio(100_000.0))
            .unwrap();

        assert_eq!(decision.transition.target_state, PortfolioState::DualLong);
        assert_eq!(decision.orders.len(), 2);

        let base = decision.orders.iter().find(|o| o.symbol == "QQQ").unwrap();
        let leveraged = decision.orders.iter().find(|o| o.symbol == "TQQQ").unwrap();
        assert_eq!(base.action, TradeAction::Buy);
        assert_eq!(base.quantity, 100.0);
        assert_eq!(leveraged.quantity, 750.0);
        assert_eq!(base.entry_bar_id, 1);
        assert_eq!(base.target_bar_id, 2);
        assert!(decision.allocation.as_ref().unwrap().is_valid);
    }

    #[test]
    fn neutral_signal_is_a_hold_with_no_orders() {
        let mut backend = EnhancedBackend::new(config());
        let decision = backend
            .process_bar(&signal(1, 0.50, 1), &bar(1, 400.0), &prices(), &cash_portfolio(100_000.0))
            .unwrap();
        assert!(decision.orders.is_empty());
        assert_eq!(decision.transition.target_state, PortfolioState::CashOnly);
        assert_eq!(backend.metrics().hold_decisions, 1);
    }

    #[test]
    fn hold_period_produces_hold_and_no_orders() {
        // Position opened at bar 1000 with horizon 5; strong sell at 1003.
        let mut backend = EnhancedBackend::new(config());
        backend.psm_mut().record_position_entry("QQQ", 1000, 5, 400.0);

        let portfolio = PortfolioView {
            cash: 60_000.0,
            equity: 100_000.0,
            positions: vec![position("QQQ", 100.0, 400.0, 400.0)],
        };
        let decision = backend
            .process_bar(&signal(1003, 0.10, 5), &bar(1003, 400.0), &prices(), &portfolio)
            .unwrap();

        assert!(decision.transition.is_hold_enforced);
        assert!(decision.orders.is_empty());

        // At bar 1005 the exit goes through.
        let decision = backend
            .process_bar(&signal(1005, 0.10, 5), &bar(1005, 400.0), &prices(), &portfolio)
            .unwrap();
        assert!(!decision.transition.is_hold_enforced);
        assert_eq!(decision.orders.len(), 1);
        assert_eq!(decision.orders[0].action, TradeAction::Sell);
    }

    #[test]
    fn exit_liquidates_leveraged_leg_first() {
        let mut backend = EnhancedBackend::new(config());
        let portfolio = PortfolioView {
            cash: 0.0,
            equity: 100_000.0,
            positions: vec![
                position("QQQ", 100.0, 400.0, 400.0),
                position("TQQQ", 750.0, 80.0, 80.0),
            ],
        };
        let decision = backend
            .process_bar(&signal(10, 0.10, 1), &bar(10, 400.0), &prices(), &portfolio)
            .unwrap();

        assert_eq!(decision.transition.target_state, PortfolioState::CashOnly);
        let sells: Vec<&TradeOrder> = decision
            .orders
            .iter()
            .filter(|o| o.action == TradeAction::Sell)
            .collect();
        assert_eq!(sells.len(), 2);
        assert_eq!(sells[0].symbol, "TQQQ");
        assert_eq!(sells[1].symbol, "QQQ");
    }

    #[test]
    fn invalid_state_emergency_flattens() {
        let mut backend = EnhancedBackend::new(config());
        // Long and short family held at once.
        let portfolio = PortfolioView {
            cash: 0.0,
            equity: 100_000.0,
            positions: vec![
                position("QQQ", 100.0, 400.0, 400.0),
                position("PSQ", 200.0, 30.0, 30.0),
            ],
        };
        let decision = backend
            .process_bar(&signal(10, 0.80, 1), &bar(10, 400.0), &prices(), &portfolio)
            .unwrap();

        assert_eq!(decision.transition.rationale, "Emergency liquidation");
        assert_eq!(decision.orders.len(), 2);
        assert!(decision.orders.iter().all(|o| o.action == TradeAction::Sell));
    }

    #[test]
    fn adaptive_mode_throttles_decisions() {
        let mut cfg = config();
        cfg.signal_generation_mode = SignalGenerationMode::Adaptive;
        cfg.signal_generation_interval = 3;
        let mut backend = EnhancedBackend::new(cfg);

        let mut order_bars = Vec::new();
        for i in 1..=8u64 {
            let decision = backend
                .process_bar(&signal(i, 0.80, 1), &bar(i, 400.0), &prices(), &cash_portfolio(100_000.0))
                .unwrap();
            if !decision.orders.is_empty() {
                order_bars.push(i);
            }
        }
        // Only every third bar yields a fresh decision (counter starts ready).
        assert!(order_bars.len() <= 3, "got orders on bars {order_bars:?}");
    }

    #[test]
    fn leverage_cap_rejects_batch() {
        let mut cfg = config();
        cfg.max_portfolio_leverage = 1.0;
        let mut backend = EnhancedBackend::new(cfg);

        let decision = backend
            .process_bar(&signal(1, 0.80, 1), &bar(1, 400.0), &prices(), &cash_portfolio(100_000.0))
            .unwrap();
        assert!(decision.orders.is_empty());
        assert!(decision.rejection_reason.is_some());
        assert_eq!(backend.metrics().risk_rejections, 1);
    }

    #[test]
    fn position_value_cap_scales_batch() {
        let mut cfg = config();
        cfg.max_position_value = 50_000.0;
        let mut backend = EnhancedBackend::new(cfg);

        let decision = backend
            .process_bar(&signal(1, 0.80, 1), &bar(1, 400.0), &prices(), &cash_portfolio(100_000.0))
            .unwrap();
        let total: f64 = decision.orders.iter().map(|o| o.trade_value).sum();
        assert!(total <= 50_000.0 + 1e-9);
        assert!(!decision.orders.is_empty());
        assert!(decision.rejection_reason.is_none());
    }

    #[test]
    fn missing_leg_price_fails_fast() {
        let mut backend = EnhancedBackend::new(config());
        let mut view = PriceView::new();
        view.set("QQQ", 400.0); // TQQQ unpriced

        let err = backend
            .process_bar(&signal(1, 0.80, 1), &bar(1, 400.0), &view, &cash_portfolio(100_000.0))
            .unwrap_err();
        assert!(matches!(err, InvariantError::MissingPrice { ref symbol, .. } if symbol == "TQQQ"));
    }

    #[test]
    fn trade_record_carries_bar_id_and_action() {
        let mut backend = EnhancedBackend::new(config());
        let s = signal(42, 0.80, 1);
        let b = bar(42, 400.0);
        let decision = backend
            .process_bar(&s, &b, &prices(), &cash_portfolio(100_000.0))
            .unwrap();

        let record = backend.make_trade_record(
            &s,
            &b,
            0,
            &decision,
            100_000.0,
            100_000.0,
            0.0,
            100_000.0,
            &[],
            0.0,
        );
        assert_eq!(record.bar_id, 42);
        assert_eq!(record.action, TradeAction::Buy);
        // TQQQ leg is the larger: 750 * 80 = 60 000.
        assert_eq!(record.symbol, "TQQQ");
        assert!(record.conflict_check_passed);

        // A neutral bar yields a HOLD record with the same bar_id.
        let s2 = signal(43, 0.50, 1);
        let b2 = bar(43, 400.0);
        let decision2 = backend
            .process_bar(&s2, &b2, &prices(), &cash_portfolio(100_000.0))
            .unwrap();
        let record2 = backend.make_trade_record(
            &s2,
            &b2,
            1,
            &decision2,
            100_000.0,
            100_000.0,
            100_000.0,
            100_000.0,
            &[],
            0.0,
        );
        assert_eq!(record2.action, TradeAction::Hold);
        assert_eq!(record2.bar_id, 43);
    }

    #[test]
    fn simulation_emits_one_record_per_signal() {
        let cfg = config();
        let probs = [0.5, 0.8, 0.55, 0.5, 0.2, 0.5, 0.5, 0.5];
        let signals: Vec<Signal> = probs
            .iter()
            .enumerate()
            .map(|(i, p)| signal(i as u64 + 1, *p, 1))
            .collect();
        let bars: Vec<Bar> = (1..=probs.len() as u64).map(|i| bar(i, 400.0)).collect();

        let result = simulate(&cfg, &signals, &bars, None);
        assert_eq!(result.records.len(), signals.len());
        assert_eq!(result.equity_curve.len(), signals.len());
        for (record, s) in result.records.iter().zip(&signals) {
            assert_eq!(record.bar_id, s.bar_id);
        }
        assert!(result.trade_count > 0);
    }

    #[test]
    fn simulation_equity_is_flat_without_trades() {
        let cfg = config();
        let signals: Vec<Signal> = (1..=5u64).map(|i| signal(i, 0.5, 1)).collect();
        let bars: Vec<Bar> = (1..=5u64).map(|i| bar(i, 400.0)).collect();

        let result = simulate(&cfg, &signals, &bars, None);
        assert_eq!(result.trade_count, 0);
        for equity in &result.equity_curve {
            assert!((equity - 100_000.0).abs() < 1e-9);
        }
    }

    #[test]
    fn horizon_success_rates_accumulate() {
        let cfg = config();
        // Enter long at bar 1, price rises by bar 3 when the horizon settles.
        let signals = vec![signal(1, 0.80, 2), signal(2, 0.62, 2), signal(3, 0.62, 2)];
        let bars = vec![bar(1, 400.0), bar(2, 404.0), bar(3, 408.0)];

        let mut backend = EnhancedBackend::new(cfg);
        let mut portfolio = cash_portfolio(100_000.0);
        for (s, b) in signals.iter().zip(&bars) {
            let mut view = PriceView::new();
            for sym in ["QQQ", "TQQQ", "PSQ", "SQQQ"] {
                view.set(sym, b.close);
            }
            let decision = backend.process_bar(s, b, &view, &portfolio).unwrap();
            // Keep the portfolio long after the entry so state persists.
            if !decision.orders.is_empty() {
                portfolio = PortfolioView {
                    cash: 0.0,
                    equity: 100_000.0,
                    positions: vec![
                        position("QQQ", 100.0, 400.0, b.close),
                        position("TQQQ", 200.0, 400.0, b.close),
                    ],
                };
            }
        }

        let rates = backend.horizon_success_rates();
        assert_eq!(rates.get(&2).copied(), Some(1.0));
    }
}
