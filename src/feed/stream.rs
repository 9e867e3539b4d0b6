// =============================================================================
// Streaming feed — websocket bar messages with reconnecting outer loop
// =============================================================================
//
// The socket yields one JSON object per completed minute bar. The feed
// assigns monotonically increasing bar ids at delivery time (the stream has
// no dataset-wide ids) and validates before forwarding. The caller wraps
// `start` in a reconnect loop; a dropped socket simply returns an error.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use super::{BarFeed, FeedHealth};
use crate::market_data::{validate_bar, Bar, BarBuffer};

pub struct StreamBarFeed {
    url: String,
    symbols: Vec<String>,
    next_bar_id: Arc<AtomicU64>,
    recent: Arc<BarBuffer>,
    health: FeedHealth,
    stop_flag: Arc<AtomicBool>,
}

impl StreamBarFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            symbols: Vec::new(),
            next_bar_id: Arc::new(AtomicU64::new(1)),
            recent: Arc::new(BarBuffer::new(1000)),
            health: FeedHealth::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Parse one streamed bar message.
///
/// Expected shape:
/// ```json
/// {"symbol":"QQQ","timestamp_ms":1700000000000,
///  "open":400.0,"high":401.0,"low":399.5,"close":400.5,"volume":12000}
/// ```
pub fn parse_stream_bar(text: &str, next_bar_id: &AtomicU64) -> Result<Bar> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream bar JSON")?;

    let symbol = value
        .get("symbol")
        .and_then(|v| v.as_str())
        .context("stream bar missing symbol")?
        .to_string();

    let get_f64 = |key: &str| -> Result<f64> {
        value
            .get(key)
            .and_then(|v| v.as_f64())
            .with_context(|| format!("stream bar missing {key}"))
    };

    Ok(Bar {
        symbol,
        bar_id: next_bar_id.fetch_add(1, Ordering::Relaxed),
        timestamp_ms: value
            .get("timestamp_ms")
            .and_then(|v| v.as_i64())
            .context("stream bar missing timestamp_ms")?,
        open: get_f64("open")?,
        high: get_f64("high")?,
        low: get_f64("low")?,
        close: get_f64("close")?,
        volume: value.get("volume").and_then(|v| v.as_i64()).unwrap_or(0),
    })
}

#[async_trait]
impl BarFeed for StreamBarFeed {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "stream bar feed ready");
        Ok(())
    }

    fn subscribe(&mut self, symbols: &[String]) {
        self.symbols = symbols.to_vec();
    }

    async fn start(&mut self, tx: mpsc::Sender<Bar>) -> Result<()> {
        let (ws, _) = connect_async(&self.url)
            .await
            .with_context(|| format!("websocket connect failed: {}", self.url))?;
        info!(url = %self.url, "bar stream connected");

        let (_, mut read) = ws.split();

        while let Some(message) = read.next().await {
            if self.stop_flag.load(Ordering::Relaxed) {
                info!("stream bar feed stopped");
                return Ok(());
            }

            let message = message.context("websocket read failed")?;
            if !message.is_text() {
                continue;
            }
            let text = message.into_text().context("websocket text decode failed")?;

            let bar = match parse_stream_bar(&text, &self.next_bar_id) {
                Ok(bar) => bar,
                Err(e) => {
                    warn!(error = %e, "skipping malformed stream message");
                    continue;
                }
            };

            if !self.symbols.is_empty() && !self.symbols.contains(&bar.symbol) {
                continue;
            }
            if let Err(e) = validate_bar(&bar) {
                warn!(symbol = %bar.symbol, error = %e, "rejected streamed bar");
                continue;
            }

            self.health.mark_message();
            self.recent.push(bar.clone());
            debug!(symbol = %bar.symbol, bar_id = bar.bar_id, "streamed bar delivered");

            if tx.send(bar).await.is_err() {
                warn!("bar channel closed, stream ending");
                return Ok(());
            }
        }

        anyhow::bail!("bar stream closed by server")
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    fn get_recent_bars(&self, symbol: &str, count: usize) -> Vec<Bar> {
        self.recent.recent(symbol, count)
    }

    fn is_connection_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    fn seconds_since_last_message(&self) -> u64 {
        self.health.seconds_since_last_message()
    }
}
