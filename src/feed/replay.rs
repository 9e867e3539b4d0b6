// =============================================================================
// Replay feed — historical bars on a drift-free accelerated schedule
// =============================================================================
//
// Delivery times are computed from an absolute real-time anchor:
//
//   target = anchor + (bar_time - session_start) / speed
//
// so per-bar jitter never accumulates: a late wake-up on one bar does not
// push every later bar back.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BarFeed, FeedHealth};
use crate::market_data::{Bar, BarBuffer};

pub struct ReplayBarFeed {
    dataset: Vec<Bar>,
    /// Real seconds per bar-time second; 60 plays an hour per minute.
    speed: f64,
    symbols: Vec<String>,
    recent: Arc<BarBuffer>,
    health: FeedHealth,
    stop_flag: Arc<AtomicBool>,
}

impl ReplayBarFeed {
    /// `speed` must be positive; 1.0 replays in real time.
    pub fn new(dataset: Vec<Bar>, speed: f64) -> Self {
        Self {
            dataset,
            speed: if speed > 0.0 { speed } else { 1.0 },
            symbols: Vec::new(),
            recent: Arc::new(BarBuffer::new(1000)),
            health: FeedHealth::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

}

/// Offset from the replay anchor at which a bar is due.
pub fn schedule_offset(bar_timestamp_ms: i64, session_start_ms: i64, speed: f64) -> Duration {
    let elapsed_ms = (bar_timestamp_ms - session_start_ms).max(0) as f64 / speed;
    Duration::from_millis(elapsed_ms as u64)
}

#[async_trait]
impl BarFeed for ReplayBarFeed {
    async fn connect(&mut self) -> Result<()> {
        info!(bars = self.dataset.len(), speed = self.speed, "replay feed ready");
        Ok(())
    }

    fn subscribe(&mut self, symbols: &[String]) {
        self.symbols = symbols.to_vec();
    }

    async fn start(&mut self, tx: mpsc::Sender<Bar>) -> Result<()> {
        let Some(first) = self.dataset.first() else {
            warn!("replay feed has no bars");
            return Ok(());
        };
        let session_start_ms = first.timestamp_ms;
        let anchor = Instant::now();

        for bar in &self.dataset {
            if self.stop_flag.load(Ordering::Relaxed) {
                info!("replay feed stopped");
                break;
            }
            if !self.symbols.is_empty() && !self.symbols.contains(&bar.symbol) {
                continue;
            }

            let due = anchor + schedule_offset(bar.timestamp_ms, session_start_ms, self.speed);
            tokio::time::sleep_until(due).await;

            self.health.mark_message();
            self.recent.push(bar.clone());
            debug!(symbol = %bar.symbol, bar_id = bar.bar_id, "replay bar delivered");

            if tx.send(bar.clone()).await.is_err() {
                warn!("bar channel closed, replay ending");
                break;
            }
        }

        Ok(())
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
