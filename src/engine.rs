// =============================================================================
// Trading Engine — the single logical trading loop
// =============================================================================
//
// One task owns all mutable engine state. Feeds push bars into a channel;
// the loop drains it and runs, per decision bar:
//
//   validate -> prices -> drain fills -> account -> backend decision ->
//   execute -> drain fills -> trade record -> EOD tick -> persistence
//
// Reconciliation drift halts order emission until resolved externally. A
// shutdown signal stops processing between bars and force-liquidates only if
// inside the EOD window.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::backend::{BackendConfig, EnhancedBackend, PortfolioView};
use crate::broker::{BrokerClient, ExecutionReport};
use crate::eod::{EodGuardian, EodStateStore};
use crate::et_time::{EodWindow, SessionClock};
use crate::market_data::{validate_bar, Bar, BarBuffer, PriceView};
use crate::persistence::{PersistedPosition, StatePersistence, TradingState};
use crate::position_book::PositionBook;
use crate::runtime_config::RuntimeConfig;
use crate::signals::trade_log::TradeLogWriter;
use crate::signals::Signal;

/// Bars between periodic persistence saves.
const PERSIST_INTERVAL_BARS: u64 = 10;

// ---------------------------------------------------------------------------
// Signal source
// ---------------------------------------------------------------------------

/// Supplies the per-bar signal for each decision bar.
pub trait SignalSource: Send {
    /// The signal joined to `bar` by bar_id, if the producer emitted one.
    fn signal_for(&mut self, bar: &Bar) -> Option<Signal>;
}

/// Signal source backed by a JSONL file, joined by bar_id.
pub struct JsonlSignalSource {
    by_bar_id: HashMap<u64, Signal>,
}

impl JsonlSignalSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read signal file {}", path.display()))?;

        let mut by_bar_id = HashMap::new();
        let mut rejected = 0usize;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match Signal::from_json_line(line) {
                Ok(signal) => {
                    by_bar_id.insert(signal.bar_id, signal);
                }
                Err(e) => {
                    rejected += 1;
                    warn!(error = %e, "rejected signal record");
                }
            }
        }

        info!(
            path = %path.display(),
            signals = by_bar_id.len(),
            rejected,
            "signal file loaded"
        );
        Ok(Self { by_bar_id })
    }

    pub fn is_empty(&self) -> bool {
        self.by_bar_id.is_empty()
    }
}

impl SignalSource for JsonlSignalSource {
    fn signal_for(&mut self, bar: &Bar) -> Option<Signal> {
        self.by_bar_id.get(&bar.bar_id).cloned()
    }
}

impl crate::validation::SignalProducer for JsonlSignalSource {
    fn reset(&mut self) {
        // The file is static; there is no indicator state to clear.
    }

    fn produce(&mut self, bars: &[Bar]) -> Vec<Signal> {
        bars.iter()
            .filter_map(|bar| self.by_bar_id.get(&bar.bar_id).cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TradingEngine {
    config: RuntimeConfig,
    backend: EnhancedBackend,
    book: PositionBook,
    broker: Arc<dyn BrokerClient>,
    guardian: EodGuardian,
    persistence: StatePersistence,
    trade_log: TradeLogWriter,
    signal_source: Box<dyn SignalSource>,
    bar_buffer: BarBuffer,

    fills_rx: Option<mpsc::UnboundedReceiver<ExecutionReport>>,
    last_seen: HashMap<String, i64>,
    bar_index: i64,
    bars_since_persist: u64,
    bars_since_reconcile: u64,
    /// Set on reconciliation drift; no orders are emitted until cleared.
    trading_halted: bool,
    session_id: String,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        broker: Arc<dyn BrokerClient>,
        clock: Box<dyn SessionClock>,
        signal_source: Box<dyn SignalSource>,
        trade_log_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let backend = EnhancedBackend::new(BackendConfig::from_runtime(&config));
        let persistence = StatePersistence::new(&config.state_dir)?;

        let window = EodWindow::parse(&config.eod_window_start, &config.eod_window_end)?;
        let store =
            EodStateStore::new(Path::new(&config.state_dir).join("eod_state.txt"))?;
        let guardian = EodGuardian::new(broker.clone(), store, clock, window)?;

        let fills_rx = broker.take_execution_receiver();
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut engine = Self {
            config,
            backend,
            book: PositionBook::new(),
            broker,
            guardian,
            persistence,
            trade_log: TradeLogWriter::new(trade_log_path),
            signal_source,
            bar_buffer: BarBuffer::new(1000),
            fills_rx,
            last_seen: HashMap::new(),
            bar_index: 0,
            bars_since_persist: 0,
            bars_since_reconcile: 0,
            trading_halted: false,
            session_id,
        };
        engine.restore_state()?;
        Ok(engine)
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn records_written(&self) -> u64 {
        self.trade_log.records_written()
    }

    /// True when every processed day ended with a verified-flat book.
    pub fn eod_clean(&self) -> bool {
        self.guardian.is_eod_complete(&self.book)
            || (self.book.is_flat() && self.guardian.state().positions_hash.is_empty())
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Drain bars until the channel closes or shutdown fires.
    pub async fn run(
        &mut self,
        mut bar_rx: mpsc::Receiver<Bar>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(session_id = %self.session_id, "trading engine started");

        loop {
            tokio::select! {
                maybe_bar = bar_rx.recv() => {
                    match maybe_bar {
                        Some(bar) => {
                            if let Err(e) = self.on_bar(bar).await {
                                error!(error = %e, "bar processing failed fatally");
                                return Err(e);
                            }
                        }
                        None => {
                            info!("bar channel closed, engine stopping");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means no one can keep us running.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received between bars");
                        break;
                    }
                }
            }
        }

        self.on_shutdown().await
    }

    /// Handle one incoming bar.
    pub async fn on_bar(&mut self, bar: Bar) -> Result<()> {
        // Admission: validation errors reject the record without advancing.
        if let Err(e) = validate_bar(&bar) {
            warn!(symbol = %bar.symbol, bar_id = bar.bar_id, error = %e, "rejected bar");
            return Ok(());
        }
        if let Some(last) = self.last_seen.get(&bar.symbol) {
            if bar.timestamp_ms <= *last {
                warn!(symbol = %bar.symbol, bar_id = bar.bar_id, "rejected non-monotonic bar");
                return Ok(());
            }
        }
        self.last_seen.insert(bar.symbol.clone(), bar.timestamp_ms);
        self.bar_buffer.push(bar.clone());

        // Marks: book, backend horizon tracking, and simulated broker.
        self.book.update_market_price(&bar.symbol, bar.close);
        self.broker.note_market_price(&bar.symbol, bar.close);

        // Decisions run on the base-long instrument's bars only; other
        // symbols' bars are price updates.
        if bar.symbol != self.config.instruments.base_long {
            return Ok(());
        }

        let Some(signal) = self.signal_source.signal_for(&bar) else {
            return Ok(());
        };

        self.drain_fills();
        self.decide_and_execute(&signal, &bar).await?;

        // Guardian runs between bars on the trading task.
        let fills = &mut self.fills_rx;
        let mut drain = move |book: &mut PositionBook| {
            if let Some(rx) = fills.as_mut() {
                while let Ok(report) = rx.try_recv() {
                    book.on_execution(&report);
                }
            }
        };
        self.guardian.tick(&mut self.book, &mut drain).await?;

        self.maybe_persist()?;
        Ok(())
    }

    async fn decide_and_execute(&mut self, signal: &Signal, bar: &Bar) -> Result<()> {
        let account = match self.broker.get_account().await {
            Ok(account) => account,
            Err(e) => {
                // Broker failure: do not advance state for this bar.
                warn!(error = %e, "account fetch failed, skipping bar");
                return Ok(());
            }
        };

        let prices = self.family_prices();
        let portfolio = PortfolioView {
            cash: account.cash,
            equity: account.equity,
            positions: self.book.get_all_positions(),
        };
        let cash_before = account.cash;
        let equity_before = account.equity;

        let mut decision = match self.backend.process_bar(signal, bar, &prices, &portfolio) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(bar_id = bar.bar_id, error = %e, "decision failed, holding");
                return Ok(());
            }
        };

        // Reconciliation drift keeps the engine observing but never trading.
        if self.trading_halted && !decision.orders.is_empty() {
            warn!(bar_id = bar.bar_id, "orders suppressed: trading halted by reconciliation drift");
            decision.orders.clear();
            decision.rejection_reason = Some("trading halted by reconciliation drift".to_string());
        }

        let mut realized_delta = 0.0;
        for order in &decision.orders {
            let signed_qty = match order.action {
                crate::signals::trade_log::TradeAction::Buy => order.quantity,
                crate::signals::trade_log::TradeAction::Sell => -order.quantity,
                crate::signals::trade_log::TradeAction::Hold => continue,
            };
            match self
                .broker
                .place_market_order(&order.symbol, signed_qty, "day")
                .await
            {
                Ok(ack) => {
                    info!(
                        symbol = %order.symbol,
                        action = %order.action,
                        qty = order.quantity,
                        price = order.price,
                        order_id = %ack.order_id,
                        reason = %order.reason,
                        "order placed"
                    );
                }
                Err(e) => {
                    // The book is only ever mutated by fills.
                    error!(symbol = %order.symbol, error = %e, "order placement failed");
                }
            }
        }

        realized_delta += self.drain_fills();
        if realized_delta != 0.0 {
            self.backend.psm_mut().record_trade_result(realized_delta);
        }

        let (cash_after, equity_after) = match self.broker.get_account().await {
            Ok(account) => (account.cash, account.equity),
            Err(_) => (cash_before, equity_before),
        };
        self.backend.record_realized_pnl(realized_delta, equity_after);

        let positions_after = self.book.get_all_positions();
        let record = self.backend.make_trade_record(
            signal,
            bar,
            self.bar_index,
            &decision,
            cash_before,
            equity_before,
            cash_after,
            equity_after,
            &positions_after,
            realized_delta,
        );
        self.trade_log.append(&record)?;
        self.bar_index += 1;

        info!(
            bar_id = bar.bar_id,
            state = %decision.transition.current_state,
            signal = %decision.transition.signal_kind,
            target = %decision.transition.target_state,
            buy_threshold = decision.thresholds.buy,
            sell_threshold = decision.thresholds.sell,
            regime = %decision.thresholds.regime,
            bars_in_position = decision.transition.bars_in_position,
            horizon = decision.transition.prediction_horizon,
            hold_enforced = decision.transition.is_hold_enforced,
            bars_remaining = decision.transition.bars_remaining,
            forced_by_age = decision.transition.forced_by_age,
            orders = decision.orders.len(),
            fresh = decision.fresh_decision,
            rejection = decision.rejection_reason.as_deref().unwrap_or(""),
            equity = equity_after,
            "decision recorded"
        );

        self.maybe_reconcile().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Apply pending fills to the book; returns the realized P&L delta.
    fn drain_fills(&mut self) -> f64 {
        let mut realized = 0.0;
        if let Some(rx) = self.fills_rx.as_mut() {
            while let Ok(report) = rx.try_recv() {
                realized += self.book.on_execution(&report);
            }
        }
        realized
    }

    /// Last known close for every family instrument.
    fn family_prices(&self) -> PriceView {
        let mut view = PriceView::new();
        for symbol in self.config.instruments.symbols() {
            if let Some(close) = self.bar_buffer.last_close(&symbol) {
                view.set(&symbol, close);
            }
        }
        view
    }

    async fn maybe_reconcile(&mut self) {
        // One decision bar spans a minute of market time.
        let interval_bars = (self.config.reconcile_interval_secs / 60).max(1);
        self.bars_since_reconcile += 1;
        if self.bars_since_reconcile < interval_bars {
            return;
        }
        self.bars_since_reconcile = 0;

        let broker_positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "reconciliation fetch failed");
                return;
            }
        };

        match self.book.reconcile_with_broker(&broker_positions) {
            Ok(()) => {
                if self.trading_halted {
                    info!("reconciliation clean again, trading resumed");
                    self.trading_halted = false;
                }
            }
            Err(e) => {
                error!(error = %e, "reconciliation drift, halting order emission");
                self.trading_halted = true;
            }
        }
    }

    fn maybe_persist(&mut self) -> Result<()> {
        self.bars_since_persist += 1;
        if self.bars_since_persist < PERSIST_INTERVAL_BARS {
            return Ok(());
        }
        self.bars_since_persist = 0;
        self.persist_now()
    }

    fn persist_now(&mut self) -> Result<()> {
        let positions = self
            .book
            .get_all_positions()
            .iter()
            .map(|p| PersistedPosition {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                avg_entry_price: p.avg_entry_price,
                entry_timestamp: 0,
            })
            .collect();

        let state = TradingState {
            psm_state: self.backend.psm_mut().current_state(),
            bars_held: self.backend.psm_mut().bars_in_position(),
            entry_equity: self.config.starting_capital,
            last_bar_timestamp: self
                .last_seen
                .get(&self.config.instruments.base_long)
                .copied()
                .unwrap_or(0),
            session_id: self.session_id.clone(),
            save_timestamp: 0,
            save_count: 0,
            positions,
            hold_tracking: self.backend.psm_mut().tracking_snapshot(),
            checksum: String::new(),
        };
        self.persistence.save_state(&state)
    }

    fn restore_state(&mut self) -> Result<()> {
        let Some(state) = self.persistence.load_state()? else {
            return Ok(());
        };

        info!(
            session_id = %state.session_id,
            psm_state = ?state.psm_state,
            positions = state.positions.len(),
            "warm restart from persisted state"
        );
        for position in &state.positions {
            self.book
                .set_position(&position.symbol, position.quantity, position.avg_entry_price);
        }
        self.backend
            .psm_mut()
            .restore_tracking(state.hold_tracking);
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        // Only flatten on shutdown when inside the EOD window.
        let decision = self.guardian.calc_decision(&self.book);
        if decision.in_window && decision.has_positions {
            warn!("shutdown inside EOD window, forcing liquidation");
            let fills = &mut self.fills_rx;
            let mut drain = move |book: &mut PositionBook| {
                if let Some(rx) = fills.as_mut() {
                    while let Ok(report) = rx.try_recv() {
                        book.on_execution(&report);
                    }
                }
            };
            self.guardian
                .force_liquidate(&mut self.book, &mut drain)
                .await?;
        }

        self.persist_now()?;
        info!(
            records = self.trade_log.records_written(),
            executions = self.book.executions_seen(),
            realized_pnl = self.book.realized_pnl(),
            "trading engine stopped"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use crate::et_time::FixedClock;
    use crate::signals::SignalDirection;
    use crate::types::CostModel;

    struct MapSource(HashMap<u64, Signal>);

    impl SignalSource for MapSource {
        fn signal_for(&mut self, bar: &Bar) -> Option<Signal> {
            self.0.get(&bar.bar_id).cloned()
        }
    }

    fn bar(symbol: &str, bar_id: u64, ts: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            bar_id,
            timestamp_ms: ts,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 5_000,
        }
    }

    fn signal(bar_id: u64, probability: f64) -> Signal {
        let direction = if probability > 0.5 {
            SignalDirection::Long
        } else if probability < 0.5 {
            SignalDirection::Short
        } else {
            SignalDirection::Neutral
        };
        Signal::new(bar_id, bar_id as i64 * 60_000, "QQQ", probability, direction, 1)
    }

    fn test_config(tag: &str) -> RuntimeConfig {
        let dir = std::env::temp_dir().join(format!(
            "meridian-engine-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        RuntimeConfig {
            state_dir: dir.to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        }
    }

    fn engine_with(
        tag: &str,
        signals: Vec<Signal>,
    ) -> (TradingEngine, Arc<MockBroker>, String) {
        let config = test_config(tag);
        let state_dir = config.state_dir.clone();
        let broker = Arc::new(MockBroker::new(
            config.starting_capital,
            CostModel::Zero,
            0.0,
        ));
        let map: HashMap<u64, Signal> = signals.into_iter().map(|s| (s.bar_id, s)).collect();
        let trade_log = Path::new(&state_dir).join("trades.jsonl");

        let engine = TradingEngine::new(
            config,
            broker.clone(),
            Box::new(FixedClock::at(2025, 6, 2, 10, 30)),
            Box::new(MapSource(map)),
            trade_log,
        )
        .unwrap();
        (engine, broker, state_dir)
    }

    #[tokio::test]
    async fn entry_flow_places_orders_and_logs_records() {
        let (mut engine, broker, dir) =
            engine_with("entry", vec![signal(1, 0.5), signal(2, 0.8)]);

        // Price every family leg before the decision bar.
        engine.on_bar(bar("TQQQ", 901, 30_000, 80.0)).await.unwrap();
        engine.on_bar(bar("PSQ", 902, 30_001, 30.0)).await.unwrap();
        engine.on_bar(bar("SQQQ", 903, 30_002, 20.0)).await.unwrap();

        engine.on_bar(bar("QQQ", 1, 60_000, 400.0)).await.unwrap();
        assert_eq!(engine.records_written(), 1); // HOLD record

        engine.on_bar(bar("QQQ", 2, 120_000, 400.0)).await.unwrap();
        assert_eq!(engine.records_written(), 2);

        // Dual-long entry: 100 QQQ + 750 TQQQ.
        assert_eq!(broker.total_orders(), 2);
        let positions = engine.book().get_all_positions();
        assert_eq!(positions.len(), 2);
        let qqq = positions.iter().find(|p| p.symbol == "QQQ").unwrap();
        let tqqq = positions.iter().find(|p| p.symbol == "TQQQ").unwrap();
        assert_eq!(qqq.quantity, 100.0);
        assert_eq!(tqqq.quantity, 750.0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn invalid_bar_produces_no_record() {
        let (mut engine, broker, dir) = engine_with("badbar", vec![signal(1, 0.8)]);

        // high < low: rejected before any signal is consumed.
        let mut corrupt = bar("QQQ", 1, 60_000, 395.0);
        corrupt.high = 390.0;
        corrupt.low = 410.0;
        engine.on_bar(corrupt).await.unwrap();

        assert_eq!(engine.records_written(), 0);
        assert_eq!(broker.total_orders(), 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn non_monotonic_bar_is_rejected() {
        let (mut engine, _broker, dir) =
            engine_with("monotonic", vec![signal(1, 0.5), signal(2, 0.5)]);

        engine.on_bar(bar("QQQ", 1, 60_000, 400.0)).await.unwrap();
        assert_eq!(engine.records_written(), 1);

        // Same timestamp again: rejected, no record.
        engine.on_bar(bar("QQQ", 2, 60_000, 401.0)).await.unwrap();
        assert_eq!(engine.records_written(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn bars_without_signals_are_price_updates_only() {
        let (mut engine, broker, dir) = engine_with("nosignal", vec![]);
        engine.on_bar(bar("QQQ", 7, 60_000, 400.0)).await.unwrap();
        assert_eq!(engine.records_written(), 0);
        assert_eq!(broker.total_orders(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn round_trip_realizes_pnl_in_book() {
        let signals = vec![signal(2, 0.8), signal(3, 0.62), signal(4, 0.62), signal(5, 0.62), signal(6, 0.62), signal(7, 0.62), signal(8, 0.1)];
        let (mut engine, _broker, dir) = engine_with("roundtrip", signals);

        engine.on_bar(bar("TQQQ", 901, 30_000, 80.0)).await.unwrap();
        engine.on_bar(bar("PSQ", 902, 30_001, 30.0)).await.unwrap();
        engine.on_bar(bar("SQQQ", 903, 30_002, 20.0)).await.unwrap();

        engine.on_bar(bar("QQQ", 2, 120_000, 400.0)).await.unwrap();
        assert!(!engine.book().is_flat());

        // Hold through the horizon, then exit on a strong sell at a higher
        // price.
        for (id, ts) in [(3u64, 180_000i64), (4, 240_000), (5, 300_000), (6, 360_000), (7, 420_000)] {
            engine.on_bar(bar("QQQ", id, ts, 402.0)).await.unwrap();
        }
        engine.on_bar(bar("TQQQ", 904, 421_000, 81.0)).await.unwrap();
        engine.on_bar(bar("QQQ", 8, 480_000, 404.0)).await.unwrap();

        assert!(engine.book().is_flat());
        assert!(engine.book().realized_pnl() > 0.0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn run_drains_channel_until_closed() {
        let (mut engine, _broker, dir) =
            engine_with("run", vec![signal(1, 0.5), signal(2, 0.5)]);

        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(bar("QQQ", 1, 60_000, 400.0)).await.unwrap();
        tx.send(bar("QQQ", 2, 120_000, 400.5)).await.unwrap();
        drop(tx);

        engine.run(rx, shutdown_rx).await.unwrap();
        assert_eq!(engine.records_written(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn warm_restart_restores_book_and_tracking() {
        let config = test_config("warm");
        let state_dir = config.state_dir.clone();

        // First engine takes a position and persists.
        {
            let broker = Arc::new(MockBroker::new(100_000.0, CostModel::Zero, 0.0));
            let map: HashMap<u64, Signal> =
                [(2u64, signal(2, 0.66))].into_iter().collect();
            let mut engine = TradingEngine::new(
                config.clone(),
                broker.clone(),
                Box::new(FixedClock::at(2025, 6, 2, 10, 30)),
                Box::new(MapSource(map)),
                Path::new(&state_dir).join("trades.jsonl"),
            )
            .unwrap();

            engine.on_bar(bar("QQQ", 2, 120_000, 400.0)).await.unwrap();
            assert!(!engine.book().is_flat());
            engine.persist_now().unwrap();
        }

        // Second engine warm-starts from disk.
        let broker = Arc::new(MockBroker::new(100_000.0, CostModel::Zero, 0.0));
        let engine = TradingEngine::new(
            config,
            broker,
            Box::new(FixedClock::at(2025, 6, 2, 10, 35)),
            Box::new(MapSource(HashMap::new())),
            Path::new(&state_dir).join("trades.jsonl"),
        )
        .unwrap();
        assert!(!engine.book().is_flat());
        let qqq = engine.book().get_position("QQQ");
        assert!(qqq.quantity > 0.0);

        std::fs::remove_dir_all(&state_dir).unwrap();
    }
}
