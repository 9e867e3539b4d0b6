// =============================================================================
// Meridian Intraday Engine — Main Entry Point
// =============================================================================
//
// The engine starts Paused against the mock broker for safety; live trading
// requires explicit configuration. One trading task owns all mutable state,
// feeds push bars through a channel, and the EOD guardian runs between bars.
// The process exits cleanly only when every processed trading day ended with
// a verified-flat book.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod allocation;
mod backend;
mod broker;
mod engine;
mod eod;
mod et_time;
mod feed;
mod hysteresis;
mod market_data;
mod persistence;
mod position_book;
mod runtime_config;
mod signals;
mod state_machine;
mod types;
mod validation;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{AlpacaBroker, BrokerClient, MockBroker};
use crate::engine::{JsonlSignalSource, TradingEngine};
use crate::et_time::SystemClock;
use crate::feed::{BarFeed, ReplayBarFeed, RestBarFeed, StreamBarFeed};
use crate::runtime_config::RuntimeConfig;
use crate::types::AccountMode;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Intraday Engine starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "runtime_config.json".to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for the instrument family and state directory.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        let parts: Vec<String> = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() == 4 {
            config.instruments.base_long = parts[0].clone();
            config.instruments.levered_long = parts[1].clone();
            config.instruments.base_short = parts[2].clone();
            config.instruments.levered_short = parts[3].clone();
        } else if !parts.is_empty() {
            warn!(got = parts.len(), "MERIDIAN_SYMBOLS needs exactly 4 symbols, ignoring");
        }
    }
    if let Ok(dir) = std::env::var("MERIDIAN_STATE_DIR") {
        config.state_dir = dir;
    }
    config.validate()?;

    info!(
        symbols = ?config.instruments.symbols(),
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        leverage_enabled = config.leverage_enabled,
        "configured"
    );

    // ── 2. Walk-forward mode: evaluate and exit instead of trading ───────
    if std::env::var("MERIDIAN_WALKFORWARD").is_ok() {
        return run_walk_forward(&config);
    }

    // ── 3. Broker (mock and live are peers behind one trait) ────────────
    let broker: Arc<dyn BrokerClient> = match config.account_mode {
        AccountMode::Mock => Arc::new(MockBroker::new(
            config.starting_capital,
            config.cost_model,
            config.slippage_factor,
        )),
        AccountMode::Live => {
            let base_url = std::env::var("ALPACA_BASE_URL")
                .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
            let key_id =
                std::env::var("ALPACA_KEY_ID").context("ALPACA_KEY_ID required for live mode")?;
            let secret = std::env::var("ALPACA_SECRET_KEY")
                .context("ALPACA_SECRET_KEY required for live mode")?;
            Arc::new(AlpacaBroker::new(
                base_url,
                &key_id,
                &secret,
                Duration::from_secs(config.broker_timeout_secs),
            ))
        }
    };

    // ── 4. Feed selection ────────────────────────────────────────────────
    let mut feed: Box<dyn BarFeed> = if let Ok(path) = std::env::var("MERIDIAN_REPLAY_FILE") {
        let bars = market_data::load_bars_jsonl(&path)?;
        if bars.is_empty() {
            bail!("replay file {path} contains no usable bars");
        }
        let speed: f64 = std::env::var("MERIDIAN_REPLAY_SPEED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60.0);
        Box::new(ReplayBarFeed::new(bars, speed))
    } else if let Ok(url) = std::env::var("MERIDIAN_STREAM_URL") {
        Box::new(StreamBarFeed::new(url))
    } else if let Ok(url) = std::env::var("MERIDIAN_REST_URL") {
        Box::new(RestBarFeed::new(
            url,
            Duration::from_secs(15),
            Duration::from_secs(config.broker_timeout_secs),
        ))
    } else {
        bail!(
            "no feed configured: set MERIDIAN_REPLAY_FILE, MERIDIAN_STREAM_URL, \
             or MERIDIAN_REST_URL"
        );
    };

    // ── 5. Signal source ─────────────────────────────────────────────────
    let signal_path = std::env::var("MERIDIAN_SIGNAL_FILE")
        .context("MERIDIAN_SIGNAL_FILE required (JSONL signals keyed by bar_id)")?;
    let signal_source = JsonlSignalSource::load(&signal_path)?;
    if signal_source.is_empty() {
        bail!("signal file {signal_path} contains no usable signals");
    }

    // ── 6. Engine assembly ───────────────────────────────────────────────
    let trade_log_path = Path::new(&config.state_dir).join("trades.jsonl");
    let config_for_save = config.clone();
    let mut engine = TradingEngine::new(
        config,
        broker,
        Box::new(SystemClock),
        Box::new(signal_source),
        trade_log_path,
    )?;

    // ── 7. Feed task ─────────────────────────────────────────────────────
    let (bar_tx, bar_rx) = mpsc::channel(1024);
    let symbols = config_for_save.instruments.symbols();
    let feed_handle = tokio::spawn(async move {
        feed.connect().await?;
        feed.subscribe(&symbols);
        feed.start(bar_tx).await
    });

    // ── 8. Shutdown wiring ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // ── 9. Run ───────────────────────────────────────────────────────────
    let run_result = engine.run(bar_rx, shutdown_rx).await;
    feed_handle.abort();

    if let Err(e) = config_for_save.save(&config_path) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    run_result?;

    // Exit code reflects verified EOD flatness for the processed days.
    if !engine.eod_clean() {
        bail!("EOD guardian did not reach a verified-flat DONE state");
    }

    info!("Meridian shut down cleanly");
    Ok(())
}

/// Out-of-sample evaluation over a historical dataset, then exit.
fn run_walk_forward(config: &RuntimeConfig) -> Result<()> {
    use crate::backend::BackendConfig;
    use crate::validation::{WalkForwardConfig, WalkForwardValidator};

    let bars_path = std::env::var("MERIDIAN_REPLAY_FILE")
        .context("MERIDIAN_REPLAY_FILE required for walk-forward mode")?;
    let signal_path = std::env::var("MERIDIAN_SIGNAL_FILE")
        .context("MERIDIAN_SIGNAL_FILE required for walk-forward mode")?;

    let bars = market_data::load_bars_jsonl(&bars_path)?;
    let mut producer = JsonlSignalSource::load(&signal_path)?;

    let wf_config = WalkForwardConfig::default();
    let backend_config = BackendConfig::from_runtime(config);
    let result =
        WalkForwardValidator::validate(&mut producer, &bars, &wf_config, &backend_config);

    info!(
        assessment = %result.assessment,
        windows = result.total_windows,
        passing = result.passing_windows,
        mean_test_mrb_pct = result.mean_test_mrb * 100.0,
        std_test_mrb_pct = result.std_test_mrb * 100.0,
        win_rate = result.win_rate,
        consistency = result.consistency_score,
        t_statistic = result.t_statistic,
        significant = result.statistically_significant,
        overfit_pct = result.overfit_percentage,
        "walk-forward evaluation complete"
    );
    for issue in &result.issues {
        warn!(issue = %issue, "walk-forward issue");
    }
    for recommendation in &result.recommendations {
        info!(recommendation = %recommendation, "walk-forward recommendation");
    }

    if !result.passed {
        bail!("walk-forward validation assessment: {}", result.assessment);
    }
    Ok(())
}
