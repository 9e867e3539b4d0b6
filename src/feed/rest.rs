// =============================================================================
// REST polling feed — fetch latest bars on a fixed interval
// =============================================================================
//
// Each poll fetches the most recent bars per symbol and forwards only those
// with `timestamp_ms` beyond the last seen, so restarts and overlapping
// responses never replay old bars into the engine.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BarFeed, FeedHealth};
use crate::market_data::{validate_bar, Bar, BarBuffer};

pub struct RestBarFeed {
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    symbols: Vec<String>,
    last_seen: HashMap<String, i64>,
    recent: Arc<BarBuffer>,
    health: FeedHealth,
    stop_flag: Arc<AtomicBool>,
}

impl RestBarFeed {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            poll_interval,
            symbols: Vec::new(),
            last_seen: HashMap::new(),
            recent: Arc::new(BarBuffer::new(1000)),
            health: FeedHealth::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn poll_symbol(&mut self, symbol: &str, tx: &mpsc::Sender<Bar>) -> Result<()> {
        let url = format!("{}/bars?symbol={symbol}&limit=10", self.base_url);
        let body: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("bar poll request failed for {symbol}"))?
            .json()
            .await
            .with_context(|| format!("bar poll parse failed for {symbol}"))?;

        let mut bars = parse_bars(&body, symbol);
        bars.sort_by_key(|b| b.timestamp_ms);

        let last_seen = self.last_seen.get(symbol).copied().unwrap_or(i64::MIN);
        for bar in bars {
            if bar.timestamp_ms <= last_seen {
                continue;
            }
            if let Err(e) = validate_bar(&bar) {
                warn!(symbol, bar_id = bar.bar_id, error = %e, "rejected polled bar");
                continue;
            }

            self.last_seen.insert(symbol.to_string(), bar.timestamp_ms);
            self.health.mark_message();
            self.recent.push(bar.clone());
            debug!(symbol, bar_id = bar.bar_id, "polled bar delivered");

            if tx.send(bar).await.is_err() {
                anyhow::bail!("bar channel closed");
            }
        }

        Ok(())
    }
}

/// Parse a `{"bars": [...]}` (or bare array) response into bars for `symbol`.
pub fn parse_bars(body: &serde_json::Value, symbol: &str) -> Vec<Bar> {
    let items = body
        .get("bars")
        .and_then(|v| v.as_array())
        .or_else(|| body.as_array())
        .cloned()
        .unwrap_or_default();

    items
        .iter()
        .filter_map(|item| {
            Some(Bar {
                symbol: symbol.to_string(),
                bar_id: item.get("bar_id")?.as_u64()?,
                timestamp_ms: item.get("timestamp_ms")?.as_i64()?,
                open: item.get("open")?.as_f64()?,
                high: item.get("high")?.as_f64()?,
                low: item.get("low")?.as_f64()?,
                close: item.get("close")?.as_f64()?,
                volume: item.get("volume").and_then(|v| v.as_i64()).unwrap_or(0),
            })
        })
        .collect()
}

#[async_trait]
impl BarFeed for RestBarFeed {
    async fn connect(&mut self) -> Result<()> {
        info!(base_url = %self.base_url, interval_secs = self.poll_interval.as_secs(), "REST bar feed ready");
        Ok(())
    }

    fn subscribe(&mut self, symbols: &[String]) {
        self.symbols = symbols.to_vec();
    }

    async fn start(&mut self, tx: mpsc::Sender<Bar>) -> Result<()> {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            if self.stop_flag.load(Ordering::Relaxed) {
                info!("REST bar feed stopped");
                return Ok(());
            }

            let symbols = self.symbols.clone();
            for symbol in &symbols {
                if let Err(e) = self.poll_symbol(symbol, &tx).await {
                    warn!(symbol = %symbol, error = %e, "bar poll failed");
                }
            }
        }
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

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bars_handles_wrapped_and_bare_arrays() {
        let wrapped = serde_json::json!({
            "bars": [
                {"bar_id": 1, "timestamp_ms": 1000, "open": 400.0, "high": 401.0,
                 "low": 399.0, "close": 400.5, "volume": 1234}
            ]
        });
        let bars = parse_bars(&wrapped, "QQQ");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "QQQ");
        assert_eq!(bars[0].bar_id, 1);
        assert_eq!(bars[0].volume, 1234);

        let bare = serde_json::json!([
            {"bar_id": 2, "timestamp_ms": 2000, "open": 1.0, "high": 2.0,
             "low": 0.5, "close": 1.5}
        ]);
        let bars = parse_bars(&bare, "TQQQ");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, 0);
    }

    #[test]
    fn parse_bars_skips_malformed_entries() {
        let body = serde_json::json!({
            "bars": [
                {"timestamp_ms": 1000, "open": 400.0},
                {"bar_id": 3, "timestamp_ms": 3000, "open": 400.0, "high": 401.0,
                 "low": 399.0, "close": 400.5, "volume": 10}
            ]
        });
        let bars = parse_bars(&body, "QQQ");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].bar_id, 3);
    }
}
