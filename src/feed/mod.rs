// =============================================================================
// Bar feeds — sources of validated 1-minute bars for the trading loop
// =============================================================================
//
// Feeds never touch engine state: they push bars into an mpsc channel that
// the trading task drains between decisions. Replay, REST-polling, and
// websocket-streaming feeds are peers behind one trait; a factory in main
// selects by mode.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::market_data::Bar;

pub mod replay;
pub mod rest;
pub mod stream;

pub use replay::ReplayBarFeed;
pub use rest::RestBarFeed;
pub use stream::StreamBarFeed;

/// A feed is unhealthy after this long without a message.
pub const STALE_FEED_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Shared last-message tracking for feed health checks.
#[derive(Clone)]
pub struct FeedHealth {
    last_message: Arc<Mutex<Option<Instant>>>,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self {
            last_message: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mark_message(&self) {
        *self.last_message.lock() = Some(Instant::now());
    }

    /// Seconds since the last message; `u64::MAX` before the first one.
    pub fn seconds_since_last_message(&self) -> u64 {
        self.last_message
            .lock()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(u64::MAX)
    }

    /// Healthy iff a message arrived within the staleness window.
    pub fn is_healthy(&self) -> bool {
        self.seconds_since_last_message() < STALE_FEED_SECS
    }
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The feed contract the engine consumes.
#[async_trait]
pub trait BarFeed: Send {
    async fn connect(&mut self) -> Result<()>;

    fn subscribe(&mut self, symbols: &[String]);

    /// Run the feed, pushing bars into `tx` until stopped or exhausted.
    async fn start(&mut self, tx: mpsc::Sender<Bar>) -> Result<()>;

    fn stop(&mut self);

    /// Most recent `count` bars for warm-up queries (oldest first).
    fn get_recent_bars(&self, symbol: &str, count: usize) -> Vec<Bar>;

    fn is_connection_healthy(&self) -> bool;

    fn seconds_since_last_message(&self) -> u64;
}
