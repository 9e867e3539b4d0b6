// =============================================================================
// Mock broker — deterministic immediate fills for simulation and tests
// =============================================================================
//
// Fills are synchronous and complete: a market order executes at the last
// market price set for the symbol, adjusted by the configured slippage
// against the order side, with fees from the cost model. Every fill is also
// delivered over the execution channel so the engine applies it to the book
// the same way it would a live fill.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    AccountInfo, BrokerClient, BrokerError, BrokerPosition, ExecutionReport, Order,
};
use crate::state_machine::FLAT_EPSILON;
use crate::types::{CostModel, OrderSide};

struct Inner {
    cash: f64,
    /// symbol -> (signed qty, avg entry price)
    positions: HashMap<String, (f64, f64)>,
    market_prices: HashMap<String, f64>,
    orders: HashMap<String, Order>,
    next_order_id: u64,
    total_fees: f64,
    total_orders: u64,
    receiver: Option<mpsc::UnboundedReceiver<ExecutionReport>>,
}

pub struct MockBroker {
    inner: Mutex<Inner>,
    account_number: String,
    cost_model: CostModel,
    slippage_factor: f64,
    fills_tx: mpsc::UnboundedSender<ExecutionReport>,
}

impl MockBroker {
    pub fn new(initial_cash: f64, cost_model: CostModel, slippage_factor: f64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!(initial_cash, cost_model = %cost_model, slippage_factor, "mock broker created");
        Self {
            inner: Mutex::new(Inner {
                cash: initial_cash,
                positions: HashMap::new(),
                market_prices: HashMap::new(),
                orders: HashMap::new(),
                next_order_id: 1,
                total_fees: 0.0,
                total_orders: 0,
                receiver: Some(rx),
            }),
            account_number: format!("MOCK-{}", uuid::Uuid::new_v4().simple()),
            cost_model,
            slippage_factor,
            fills_tx: tx,
        }
    }

    /// Set the mark used for the next fill of `symbol`.
    pub fn set_market_price(&self, symbol: &str, price: f64) {
        self.inner
            .lock()
            .market_prices
            .insert(symbol.to_string(), price);
    }

    pub fn total_fees(&self) -> f64 {
        self.inner.lock().total_fees
    }

    pub fn total_orders(&self) -> u64 {
        self.inner.lock().total_orders
    }

    fn portfolio_value(inner: &Inner) -> f64 {
        let positions_value: f64 = inner
            .positions
            .iter()
            .map(|(symbol, (qty, _))| {
                qty * inner.market_prices.get(symbol).copied().unwrap_or(0.0)
            })
            .sum();
        inner.cash + positions_value
    }

    fn fill_order(&self, inner: &mut Inner, symbol: &str, signed_qty: f64) -> Result<Order, BrokerError> {
        let market_price = inner
            .market_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::Rejected(format!("no market price for {symbol}")))?;

        let side = if signed_qty > 0.0 {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };

        // Slippage works against the order.
        let fill_price = market_price + side.sign() * market_price * self.slippage_factor;
        let qty = signed_qty.abs();
        let trade_value = qty * fill_price;
        let fee = self.cost_model.fee(trade_value);

        let order_id = format!("ORD-{:06}", inner.next_order_id);
        inner.next_order_id += 1;
        inner.total_orders += 1;
        inner.total_fees += fee;

        // Cash and position bookkeeping.
        inner.cash -= side.sign() * trade_value + fee;
        let (old_qty, old_avg) = inner
            .positions
            .get(symbol)
            .copied()
            .unwrap_or((0.0, 0.0));
        let new_qty = old_qty + signed_qty;
        let new_avg = if old_qty.abs() < FLAT_EPSILON {
            fill_price
        } else if old_qty.signum() == signed_qty.signum() {
            (old_qty.abs() * old_avg + qty * fill_price) / new_qty.abs()
        } else {
            old_avg
        };
        if new_qty.abs() < FLAT_EPSILON {
            inner.positions.remove(symbol);
        } else {
            inner.positions.insert(symbol.to_string(), (new_qty, new_avg));
        }

        let order = Order {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            quantity: signed_qty,
            side,
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
            status: "filled".to_string(),
            filled_qty: qty,
            filled_avg_price: fill_price,
        };
        inner.orders.insert(order_id.clone(), order.clone());

        let report = ExecutionReport {
            order_id,
            symbol: symbol.to_string(),
            side,
            filled_qty: qty,
            avg_fill_price: fill_price,
            status: "filled".to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        if self.fills_tx.send(report).is_err() {
            warn!("execution channel closed; fill report dropped");
        }

        debug!(
            symbol,
            side = %side,
            qty,
            fill_price,
            fee,
            cash_after = inner.cash,
            "mock fill"
        );

        Ok(order)
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let inner = self.inner.lock();
        let equity = Self::portfolio_value(&inner);
        Ok(AccountInfo {
            account_number: self.account_number.clone(),
            cash: inner.cash,
            equity,
            buying_power: inner.cash * 2.0,
            portfolio_value: equity,
            pattern_day_trader: false,
            trading_blocked: false,
            account_blocked: false,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let inner = self.inner.lock();
        let mut result: Vec<BrokerPosition> = inner
            .positions
            .iter()
            .filter(|(_, (qty, _))| qty.abs() > FLAT_EPSILON)
            .map(|(symbol, (qty, avg))| {
                let current = inner.market_prices.get(symbol).copied().unwrap_or(*avg);
                let mut pnl_per_share = current - avg;
                if *qty < 0.0 {
                    pnl_per_share = -pnl_per_share;
                }
                BrokerPosition {
                    symbol: symbol.clone(),
                    quantity: *qty,
                    avg_entry_price: *avg,
                    current_price: current,
                    unrealized_pl: qty.abs() * pnl_per_share,
                }
            })
            .collect();
        result.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(result)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        signed_qty: f64,
        _time_in_force: &str,
    ) -> Result<Order, BrokerError> {
        if signed_qty.abs() < FLAT_EPSILON {
            return Err(BrokerError::Rejected("zero quantity order".to_string()));
        }
        let mut inner = self.inner.lock();
        self.fill_order(&mut inner, symbol, signed_qty)
    }

    async fn close_position(&self, symbol: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let qty = inner.positions.get(symbol).map(|(q, _)| *q).unwrap_or(0.0);
        if qty.abs() < FLAT_EPSILON {
            return Ok(());
        }
        self.fill_order(&mut inner, symbol, -qty)?;
        Ok(())
    }

    async fn close_all_positions(&self) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        let open: Vec<(String, f64)> = inner
            .positions
            .iter()
            .filter(|(_, (qty, _))| qty.abs() > FLAT_EPSILON)
            .map(|(s, (q, _))| (s.clone(), *q))
            .collect();
        for (symbol, qty) in open {
            self.fill_order(&mut inner, &symbol, -qty)?;
        }
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        match inner.orders.get_mut(order_id) {
            Some(order) if order.status != "filled" => {
                order.status = "canceled".to_string();
                Ok(())
            }
            Some(_) => Err(BrokerError::Rejected(format!(
                "order {order_id} already filled"
            ))),
            None => Err(BrokerError::Rejected(format!("unknown order {order_id}"))),
        }
    }

    async fn cancel_all_orders(&self) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        for order in inner.orders.values_mut() {
            if order.status == "new" || order.status == "partially_filled" {
                order.status = "canceled".to_string();
            }
        }
        Ok(())
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>, BrokerError> {
        let inner = self.inner.lock();
        Ok(inner
            .orders
            .values()
            .filter(|o| o.status == "new" || o.status == "partially_filled")
            .cloned()
            .collect())
    }

    async fn is_market_open(&self) -> Result<bool, BrokerError> {
        Ok(true)
    }

    fn note_market_price(&self, symbol: &str, price: f64) {
        self.set_market_price(symbol, price);
    }

    fn take_execution_receiver(&self) -> Option<mpsc::UnboundedReceiver<ExecutionReport>> {
        self.inner.lock().receiver.take()
    }
}
