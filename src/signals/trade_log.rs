// =============================================================================
// Trade log — one JSONL record per consumed signal, HOLDs included
// =============================================================================
//
// The invariant the rest of the system leans on: for every signal the backend
// consumes, exactly one record lands here carrying the same bar_id, whether
// the decision was a trade, a hold, or a rejection.
//
// Version "2.0" stores `equity_after` as a number. Version "1.0" files in the
// wild store it as a string, sometimes with stray whitespace or quoting, so
// parsing tolerates both.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Current trade-log wire version.
pub const TRADE_LOG_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Action recorded for a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "HOLD")]
    Hold,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Canonical trade-log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLogRecord {
    pub version: String,
    pub run_id: String,
    pub bar_id: u64,
    pub timestamp_ms: i64,
    pub bar_index: i64,
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub price: f64,
    pub trade_value: f64,
    pub fees: f64,
    pub cash_before: f64,
    pub equity_before: f64,
    pub cash_after: f64,
    /// Numeric in v2; v1 files may store a (possibly quoted, padded) string.
    #[serde(deserialize_with = "de_equity_tolerant")]
    pub equity_after: f64,
    pub positions_after: i64,
    pub signal_probability: f64,
    pub execution_reason: String,
    pub rejection_reason: String,
    pub conflict_check_passed: bool,
    pub realized_pnl_delta: f64,
    pub unrealized_after: f64,
    /// "SYM:qty,SYM:qty" summary of open positions.
    pub positions_summary: String,
}

/// Accept `equity_after` as either a number or a legacy string with optional
/// whitespace and embedded quotes.
fn de_equity_tolerant<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Str(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '"' && *c != '\'')
                .collect();
            cleaned
                .parse::<f64>()
                .map_err(|_| serde::de::Error::custom(format!("unparseable equity_after: {s:?}")))
        }
    }
}

impl TradeLogRecord {
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).expect("trade record serialisation cannot fail")
    }

    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("failed to parse trade-log record")
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only JSONL trade-log writer.
pub struct TradeLogWriter {
    path: PathBuf,
    records_written: u64,
}

impl TradeLogWriter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            records_written: 0,
        }
    }

    /// Append one record.
    pub fn append(&mut self, record: &TradeLogRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open trade log {}", self.path.display()))?;

        writeln!(file, "{}", record.to_json_line())
            .with_context(|| format!("failed to append trade log {}", self.path.display()))?;

        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}
