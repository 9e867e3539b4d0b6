// =============================================================================
// Position Book — authoritative local mirror of broker positions
// =============================================================================
//
// The book is updated only from execution reports, in arrival order, and is
// the single source the engine trusts for flatness checks, state
// determination, and the EOD positions hash. Reconciliation compares the
// book against broker-reported positions by (symbol, signed quantity) and
// refuses to mutate anything on mismatch.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::broker::{BrokerPosition, ExecutionReport};
use crate::state_machine::FLAT_EPSILON;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One tracked position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity; positive long, negative short.
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: 0.0,
            avg_entry_price: 0.0,
            current_price: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() < FLAT_EPSILON
    }

    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }
}

// ---------------------------------------------------------------------------
// Reconciliation error
// ---------------------------------------------------------------------------

/// Local book and broker disagree on (symbol, signed quantity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationError {
    pub discrepancies: Vec<String>,
}

impl std::fmt::Display for ReconciliationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "position drift detected, local != broker: {}",
            self.discrepancies.join("; ")
        )
    }
}

impl std::error::Error for ReconciliationError {}

// ---------------------------------------------------------------------------
// PositionBook
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PositionBook {
    positions: HashMap<String, Position>,
    execution_history: Vec<ExecutionReport>,
    total_realized_pnl: f64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Execution updates
    // -------------------------------------------------------------------------

    /// Apply one execution report. Never fails; zero-quantity fills no-op.
    ///
    /// Returns the realized P&L delta from this fill.
    pub fn on_execution(&mut self, exec: &ExecutionReport) -> f64 {
        self.execution_history.push(exec.clone());

        if exec.filled_qty <= 0.0 {
            return 0.0;
        }

        let old = self
            .positions
            .get(&exec.symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(&exec.symbol));

        let realized = realized_pnl_of_fill(&old, exec);
        self.total_realized_pnl += realized;

        let signed_fill = exec.side.sign() * exec.filled_qty;
        let new_qty = old.quantity + signed_fill;

        let entry = self
            .positions
            .entry(exec.symbol.clone())
            .or_insert_with(|| Position::flat(&exec.symbol));

        if old.quantity.abs() < FLAT_EPSILON {
            // Opening a fresh position.
            entry.avg_entry_price = exec.avg_fill_price;
        } else if old.quantity.signum() == signed_fill.signum() {
            // Adding in the same direction: weighted average entry.
            entry.avg_entry_price = (old.quantity.abs() * old.avg_entry_price
                + exec.filled_qty * exec.avg_fill_price)
                / new_qty.abs();
        }
        // Reducing or reversing keeps the previous average entry price.

        entry.quantity = new_qty;
        entry.current_price = exec.avg_fill_price;

        if entry.quantity.abs() < FLAT_EPSILON {
            entry.quantity = 0.0;
            entry.avg_entry_price = 0.0;
            entry.unrealized_pnl = 0.0;
        }

        debug!(
            symbol = %exec.symbol,
            side = %exec.side,
            filled_qty = exec.filled_qty,
            price = exec.avg_fill_price,
            qty_after = entry.quantity,
            avg_entry = entry.avg_entry_price,
            realized,
            "execution applied to book"
        );

        realized
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Position for `symbol` (a flat placeholder when unknown).
    pub fn get_position(&self, symbol: &str) -> Position {
        self.positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol))
    }

    /// All non-flat positions.
    pub fn get_all_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub fn is_flat(&self) -> bool {
        self.positions.values().all(Position::is_flat)
    }

    pub fn realized_pnl(&self) -> f64 {
        self.total_realized_pnl
    }

    /// Number of execution reports applied so far.
    pub fn executions_seen(&self) -> usize {
        self.execution_history.len()
    }

    // -------------------------------------------------------------------------
    // Market prices
    // -------------------------------------------------------------------------

    /// Refresh the mark for `symbol`. Unknown or flat symbols are ignored.
    pub fn update_market_price(&mut self, symbol: &str, price: f64) {
        let Some(pos) = self.positions.get_mut(symbol) else {
            return;
        };
        if pos.is_flat() {
            return;
        }

        pos.current_price = price;
        let mut pnl_per_share = price - pos.avg_entry_price;
        if pos.quantity < 0.0 {
            pnl_per_share = -pnl_per_share;
        }
        pos.unrealized_pnl = pos.quantity.abs() * pnl_per_share;
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Compare the book against broker-reported positions.
    ///
    /// Any extra, missing, or quantity-differing symbol fails the pass. P&L
    /// values are never compared. The book is not mutated.
    pub fn reconcile_with_broker(
        &self,
        broker_positions: &[BrokerPosition],
    ) -> Result<(), ReconciliationError> {
        let mut discrepancies = Vec::new();

        let broker_map: HashMap<&str, f64> = broker_positions
            .iter()
            .map(|p| (p.symbol.as_str(), p.quantity))
            .collect();

        for (symbol, local) in &self.positions {
            if local.is_flat() {
                continue;
            }
            match broker_map.get(symbol.as_str()) {
                None => {
                    discrepancies.push(format!(
                        "local has {symbol} ({}), broker has 0",
                        local.quantity
                    ));
                }
                Some(broker_qty) => {
                    if (local.quantity - broker_qty).abs() > FLAT_EPSILON {
                        discrepancies.push(format!(
                            "{symbol} local={} broker={broker_qty}",
                            local.quantity
                        ));
                    }
                }
            }
        }

        for bp in broker_positions {
            if bp.quantity.abs() < FLAT_EPSILON {
                continue;
            }
            let local_flat = self
                .positions
                .get(&bp.symbol)
                .map_or(true, Position::is_flat);
            if local_flat {
                discrepancies.push(format!(
                    "broker has {} ({}), local has 0",
                    bp.symbol, bp.quantity
                ));
            }
        }

        if discrepancies.is_empty() {
            info!("position reconciliation OK");
            Ok(())
        } else {
            for d in &discrepancies {
                error!(drift = %d, "position reconciliation drift");
            }
            Err(ReconciliationError { discrepancies })
        }
    }

    // -------------------------------------------------------------------------
    // Positions hash
    // -------------------------------------------------------------------------

    /// Stable hash over sorted (symbol, signed quantity) of non-flat
    /// positions. A flat book hashes to the distinguished empty hash
    /// (the empty string).
    pub fn positions_hash(&self) -> String {
        let non_flat: BTreeMap<&str, f64> = self
            .positions
            .iter()
            .filter(|(_, p)| !p.is_flat())
            .map(|(s, p)| (s.as_str(), p.quantity))
            .collect();

        if non_flat.is_empty() {
            return String::new();
        }

        let mut hasher = Sha256::new();
        for (symbol, qty) in non_flat {
            hasher.update(symbol.as_bytes());
            hasher.update(b":");
            hasher.update(format!("{qty:.6}").as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }

    // -------------------------------------------------------------------------
    // Warm restart
    // -------------------------------------------------------------------------

    /// Seed a position directly (restoring persisted state).
    pub fn set_position(&mut self, symbol: &str, quantity: f64, avg_entry_price: f64) {
        self.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                quantity,
                avg_entry_price,
                current_price: avg_entry_price,
                unrealized_pnl: 0.0,
            },
        );
    }
}

/// Realized P&L of one fill against an existing position: the closed portion
/// at `exit - entry`, sign-inverted for shorts. Opening or adding realizes
/// nothing.
fn realized_pnl_of_fill(old: &Position, exec: &ExecutionReport) -> f64 {
    if old.quantity.abs() < FLAT_EPSILON {
        return 0.0;
    }

    let signed_fill = exec.side.sign() * exec.filled_qty;
    if old.quantity.signum() == signed_fill.signum() {
        return 0.0;
    }

    let closed_qty = exec.filled_qty.min(old.quantity.abs());
    let mut pnl_per_share = exec.avg_fill_price - old.avg_entry_price;
    if old.quantity < 0.0 {
        pnl_per_share = -pnl_per_share;
    }
    closed_qty * pnl_per_share
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;

    fn exec(symbol: &str, side: OrderSide, qty: f64, price: f64) -> ExecutionReport {
        ExecutionReport {
            order_id: "ord-1".to_string(),
            symbol: symbol.to_string(),
            side,
            filled_qty: qty,
            avg_fill_price: price,
            status: "filled".to_string(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn open_then_add_updates_weighted_average() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 410.0));

        let pos = book.get_position("QQQ");
        assert_eq!(pos.quantity, 200.0);
        assert!((pos.avg_entry_price - 405.0).abs() < 1e-9);
        assert_eq!(book.realized_pnl(), 0.0);
    }

    #[test]
    fn reduce_realizes_pnl_and_keeps_entry() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        let realized = book.on_execution(&exec("QQQ", OrderSide::Sell, 40.0, 410.0));

        assert!((realized - 400.0).abs() < 1e-9);
        let pos = book.get_position("QQQ");
        assert_eq!(pos.quantity, 60.0);
        assert!((pos.avg_entry_price - 400.0).abs() < 1e-9);
        assert!((book.realized_pnl() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn full_close_zeroes_the_position() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        book.on_execution(&exec("QQQ", OrderSide::Sell, 100.0, 395.0));

        let pos = book.get_position("QQQ");
        assert_eq!(pos.quantity, 0.0);
        assert_eq!(pos.avg_entry_price, 0.0);
        assert_eq!(pos.unrealized_pnl, 0.0);
        assert!(book.is_flat());
        assert!((book.realized_pnl() + 500.0).abs() < 1e-9);
    }

    #[test]
    fn short_positions_invert_pnl() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("SQQQ", OrderSide::Sell, 300.0, 20.0));
        let pos = book.get_position("SQQQ");
        assert_eq!(pos.quantity, -300.0);
        assert!((pos.avg_entry_price - 20.0).abs() < 1e-9);

        // Price falls; a short profits on the buy-back.
        let realized = book.on_execution(&exec("SQQQ", OrderSide::Buy, 300.0, 18.0));
        assert!((realized - 600.0).abs() < 1e-9);
        assert!(book.is_flat());
    }

    #[test]
    fn reversal_keeps_prior_entry_and_realizes_closed_portion() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        // Sell 150: closes 100 at +10, leaves 50 short.
        let realized = book.on_execution(&exec("QQQ", OrderSide::Sell, 150.0, 410.0));
        assert!((realized - 1000.0).abs() < 1e-9);

        let pos = book.get_position("QQQ");
        assert_eq!(pos.quantity, -50.0);
        assert!((pos.avg_entry_price - 400.0).abs() < 1e-9);
    }

    #[test]
    fn market_price_updates_unrealized() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        book.update_market_price("QQQ", 404.0);
        let pos = book.get_position("QQQ");
        assert!((pos.unrealized_pnl - 400.0).abs() < 1e-9);

        // Short: falling price is a gain.
        book.on_execution(&exec("PSQ", OrderSide::Sell, 200.0, 30.0));
        book.update_market_price("PSQ", 29.0);
        let pos = book.get_position("PSQ");
        assert!((pos.unrealized_pnl - 200.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_symbol_price_update_is_ignored() {
        let mut book = PositionBook::new();
        book.update_market_price("XYZ", 100.0);
        assert!(book.is_flat());
        assert_eq!(book.get_position("XYZ").current_price, 0.0);
    }

    #[test]
    fn zero_quantity_fill_is_a_noop() {
        let mut book = PositionBook::new();
        let realized = book.on_execution(&exec("QQQ", OrderSide::Buy, 0.0, 400.0));
        assert_eq!(realized, 0.0);
        assert!(book.is_flat());
    }

    #[test]
    fn reconciliation_passes_when_quantities_match() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));

        let broker = vec![BrokerPosition {
            symbol: "QQQ".to_string(),
            quantity: 100.0,
            avg_entry_price: 399.0, // prices are never compared
            current_price: 401.0,
            unrealized_pl: 123.0,
        }];
        assert!(book.reconcile_with_broker(&broker).is_ok());
    }

    #[test]
    fn reconciliation_drift_raises() {
        // Book holds QQQ=+100, broker reports +90.
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));

        let broker = vec![BrokerPosition {
            symbol: "QQQ".to_string(),
            quantity: 90.0,
            avg_entry_price: 400.0,
            current_price: 400.0,
            unrealized_pl: 0.0,
        }];
        let err = book.reconcile_with_broker(&broker).unwrap_err();
        assert_eq!(err.discrepancies.len(), 1);
        assert!(err.discrepancies[0].contains("QQQ"));
    }

    #[test]
    fn reconciliation_catches_missing_and_extra() {
        let mut book = PositionBook::new();
        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));

        // Broker is flat but holds an unknown symbol instead.
        let broker = vec![BrokerPosition {
            symbol: "TQQQ".to_string(),
            quantity: 50.0,
            avg_entry_price: 80.0,
            current_price: 80.0,
            unrealized_pl: 0.0,
        }];
        let err = book.reconcile_with_broker(&broker).unwrap_err();
        assert_eq!(err.discrepancies.len(), 2);
    }

    #[test]
    fn positions_hash_is_stable_and_order_independent() {
        let mut a = PositionBook::new();
        a.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        a.on_execution(&exec("TQQQ", OrderSide::Buy, 50.0, 80.0));

        let mut b = PositionBook::new();
        b.on_execution(&exec("TQQQ", OrderSide::Buy, 50.0, 80.0));
        b.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));

        assert_eq!(a.positions_hash(), b.positions_hash());
        assert!(!a.positions_hash().is_empty());
    }

    #[test]
    fn flat_book_has_empty_hash() {
        let mut book = PositionBook::new();
        assert_eq!(book.positions_hash(), "");

        book.on_execution(&exec("QQQ", OrderSide::Buy, 100.0, 400.0));
        assert_ne!(book.positions_hash(), "");
        book.on_execution(&exec("QQQ", OrderSide::Sell, 100.0, 400.0));
        assert_eq!(book.positions_hash(), "");
    }

    #[test]
    fn set_position_seeds_warm_restart() {
        let mut book = PositionBook::new();
        book.set_position("QQQ", 100.0, 400.0);
        assert!(!book.is_flat());
        let pos = book.get_position("QQQ");
        assert_eq!(pos.quantity, 100.0);
        assert_eq!(pos.avg_entry_price, 400.0);
    }
}
