// =============================================================================
// Market data — canonical bar record and the per-symbol recent-bar cache
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod validate;

pub use validate::{validate_bar, BarValidationError};

/// Upper bound on retained bars per symbol.
const MAX_BARS_PER_SYMBOL: usize = 1000;

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// A single 1-minute OHLCV bar.
///
/// `bar_id` is assigned by the loader and is strictly monotonic and non-zero
/// across the loaded dataset; it is the primary join key between bars,
/// signals, and the trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub bar_id: u64,
    /// UTC milliseconds; strictly increasing per symbol.
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

// ---------------------------------------------------------------------------
// BarBuffer — bounded per-symbol ring of recent bars
// ---------------------------------------------------------------------------

/// Thread-safe cache of the most recent bars per symbol.
///
/// Writers (the trading task) append and truncate; readers take snapshots for
/// warm-up queries. Out-of-order bars are rejected, never reordered.
pub struct BarBuffer {
    buffers: RwLock<HashMap<String, VecDeque<Bar>>>,
    max_bars: usize,
}

impl BarBuffer {
    /// Create a buffer retaining at most `max_bars` bars per symbol.
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_bars: max_bars.min(MAX_BARS_PER_SYMBOL),
        }
    }

    /// Append a bar for its symbol.
    ///
    /// Returns `false` (and logs) when the bar does not advance the symbol's
    /// timestamp — reordered or duplicate delivery is rejected.
    pub fn push(&self, bar: Bar) -> bool {
        let mut map = self.buffers.write();
        let ring = map
            .entry(bar.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars));

        if let Some(last) = ring.back() {
            if bar.timestamp_ms <= last.timestamp_ms {
                warn!(
                    symbol = %bar.symbol,
                    incoming_ts = bar.timestamp_ms,
                    last_ts = last.timestamp_ms,
                    "rejected non-monotonic bar"
                );
                return false;
            }
        }

        ring.push_back(bar);
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
        true
    }

    /// The most recent `count` bars for `symbol` (oldest first).
    pub fn recent(&self, symbol: &str, count: usize) -> Vec<Bar> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the newest bar for `symbol`, if any.
    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        let map = self.buffers.read();
        map.get(symbol).and_then(|ring| ring.back().map(|b| b.close))
    }

    /// Timestamp of the newest bar for `symbol`, if any.
    pub fn last_timestamp(&self, symbol: &str) -> Option<i64> {
        let map = self.buffers.read();
        map.get(symbol)
            .and_then(|ring| ring.back().map(|b| b.timestamp_ms))
    }

    /// Number of bars currently held for `symbol`.
    pub fn len(&self, symbol: &str) -> usize {
        let map = self.buffers.read();
        map.get(symbol).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load bars from a JSONL file, one bar per line.
///
/// The loader owns bar-id assignment: ids are rewritten to a strictly
/// increasing sequence starting at 1, malformed or invalid bars are rejected
/// with a warning, and per-symbol timestamps must advance.
pub fn load_bars_jsonl(path: impl AsRef<std::path::Path>) -> anyhow::Result<Vec<Bar>> {
    use anyhow::Context as _;

    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bar file {}", path.display()))?;

    let mut bars: Vec<Bar> = Vec::new();
    let mut last_ts: HashMap<String, i64> = HashMap::new();
    let mut next_bar_id = 1u64;
    let mut rejected = 0usize;

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: Result<Bar, _> = serde_json::from_str(line);
        let mut bar = match parsed {
            Ok(bar) => bar,
            Err(e) => {
                rejected += 1;
                warn!(error = %e, "rejected malformed bar line");
                continue;
            }
        };

        bar.bar_id = next_bar_id;
        if let Err(e) = validate::validate_bar(&bar) {
            rejected += 1;
            warn!(symbol = %bar.symbol, error = %e, "rejected invalid bar");
            continue;
        }
        if let Some(last) = last_ts.get(&bar.symbol) {
            if bar.timestamp_ms <= *last {
                rejected += 1;
                warn!(symbol = %bar.symbol, "rejected non-monotonic bar");
                continue;
            }
        }

        last_ts.insert(bar.symbol.clone(), bar.timestamp_ms);
        next_bar_id += 1;
        bars.push(bar);
    }

    tracing::info!(
        path = %path.display(),
        bars = bars.len(),
        rejected,
        "bar file loaded"
    );
    Ok(bars)
}

// ---------------------------------------------------------------------------
// PriceView — per-symbol close prices for one decision bar
// ---------------------------------------------------------------------------

/// Prices for every instrument in the family at a single decision point.
///
/// Every leg the engine may trade must be priced; a missing leg is an error
/// surfaced by [`PriceView::price_of`], never approximated from the base.
#[derive(Debug, Clone, Default)]
pub struct PriceView {
    prices: HashMap<String, f64>,
}

impl PriceView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
    }

    /// Price of `symbol`, or `None` when no quote was supplied this bar.
    pub fn price_of(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).copied().filter(|p| *p > 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, bar_id: u64, ts: i64, close: f64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            bar_id,
            timestamp_ms: ts,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn push_and_recent_preserve_order() {
        let buf = BarBuffer::new(10);
        assert!(buf.push(bar("QQQ", 1, 1000, 400.0)));
        assert!(buf.push(bar("QQQ", 2, 2000, 401.0)));
        assert!(buf.push(bar("QQQ", 3, 3000, 402.0)));

        let recent = buf.recent("QQQ", 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].bar_id, 2);
        assert_eq!(recent[1].bar_id, 3);
        assert_eq!(buf.last_close("QQQ"), Some(402.0));
    }

    #[test]
    fn non_monotonic_bar_is_rejected() {
        let buf = BarBuffer::new(10);
        assert!(buf.push(bar("QQQ", 1, 2000, 400.0)));
        assert!(!buf.push(bar("QQQ", 2, 2000, 401.0)));
        assert!(!buf.push(bar("QQQ", 3, 1500, 402.0)));
        assert_eq!(buf.len("QQQ"), 1);
    }

    #[test]
    fn ring_is_bounded() {
        let buf = BarBuffer::new(5);
        for i in 1..=20u64 {
            assert!(buf.push(bar("QQQ", i, i as i64 * 1000, 400.0)));
        }
        assert_eq!(buf.len("QQQ"), 5);
        let recent = buf.recent("QQQ", 100);
        assert_eq!(recent.first().unwrap().bar_id, 16);
    }

    #[test]
    fn symbols_are_independent() {
        let buf = BarBuffer::new(10);
        assert!(buf.push(bar("QQQ", 1, 1000, 400.0)));
        assert!(buf.push(bar("TQQQ", 2, 1000, 80.0)));
        assert_eq!(buf.len("QQQ"), 1);
        assert_eq!(buf.len("TQQQ"), 1);
        assert_eq!(buf.last_close("TQQQ"), Some(80.0));
    }

    #[test]
    fn loader_assigns_monotonic_ids_and_rejects_bad_lines() {
        let dir = std::env::temp_dir().join(format!("meridian-bars-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bars.jsonl");

        let good1 = serde_json::to_string(&bar("QQQ", 99, 1000, 400.0)).unwrap();
        let bad = "{ not json";
        let invalid = serde_json::to_string(&Bar {
            high: 1.0,
            low: 2.0,
            ..bar("QQQ", 99, 2000, 400.0)
        })
        .unwrap();
        let stale = serde_json::to_string(&bar("QQQ", 99, 1000, 401.0)).unwrap();
        let good2 = serde_json::to_string(&bar("QQQ", 99, 3000, 402.0)).unwrap();
        std::fs::write(&path, format!("{good1}\n{bad}\n{invalid}\n{stale}\n{good2}\n")).unwrap();

        let bars = load_bars_jsonl(&path).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].bar_id, 1);
        assert_eq!(bars[1].bar_id, 2);
        assert_eq!(bars[1].timestamp_ms, 3000);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn price_view_missing_leg_is_none() {
        let mut view = PriceView::new();
        view.set("QQQ", 400.0);
        view.set("TQQQ", 0.0);
        assert_eq!(view.price_of("QQQ"), Some(400.0));
        assert_eq!(view.price_of("TQQQ"), None);
        assert_eq!(view.price_of("PSQ"), None);
    }
}
