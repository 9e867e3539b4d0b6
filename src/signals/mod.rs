// =============================================================================
// Signal records — per-bar directional probabilities from the signal producer
// =============================================================================
//
// Wire format is JSONL, one object per line. Version "2.0" is canonical;
// version "1.0" records are accepted read-only with a warning. A record
// missing `bar_id` is fatal for that record: bar_id is the join key between
// bars, signals, and the trade log, and nothing downstream can work without
// it.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod trade_log;

/// Current signal wire version.
pub const SIGNAL_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Raw signal direction as produced upstream (before classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "NEUTRAL")]
    Neutral,
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// One per-bar signal from the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Absent in pre-2.0 files; treated as "1.0".
    #[serde(default = "default_version_legacy")]
    pub version: String,
    pub bar_id: u64,
    pub timestamp_ms: i64,
    pub symbol: String,
    /// Probability that the predicted move is up, in [0, 1]. Never NaN.
    pub probability: f64,
    pub signal_type: SignalDirection,
    /// How many bars ahead this signal predicts (>= 1).
    #[serde(default = "default_horizon")]
    pub prediction_horizon: u32,
    /// `bar_id + prediction_horizon`.
    #[serde(default)]
    pub target_bar_id: u64,
}

fn default_horizon() -> u32 {
    1
}

fn default_version_legacy() -> String {
    "1.0".to_string()
}

/// Why a signal record was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The record has no `bar_id`.
    MissingBarId,
    /// Probability is NaN or outside [0, 1].
    InvalidProbability(String),
    /// The line is not a valid JSON object of the expected shape.
    Malformed(String),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingBarId => write!(f, "signal record missing bar_id"),
            Self::InvalidProbability(p) => write!(f, "invalid signal probability: {p}"),
            Self::Malformed(msg) => write!(f, "malformed signal record: {msg}"),
        }
    }
}

impl std::error::Error for SignalError {}

// ---------------------------------------------------------------------------
// Construction & codec
// ---------------------------------------------------------------------------

impl Signal {
    /// Build a canonical v2.0 signal, deriving `target_bar_id`.
    pub fn new(
        bar_id: u64,
        timestamp_ms: i64,
        symbol: &str,
        probability: f64,
        signal_type: SignalDirection,
        prediction_horizon: u32,
    ) -> Self {
        let horizon = prediction_horizon.max(1);
        Self {
            version: SIGNAL_VERSION.to_string(),
            bar_id,
            timestamp_ms,
            symbol: symbol.to_string(),
            probability,
            signal_type,
            prediction_horizon: horizon,
            target_bar_id: bar_id + horizon as u64,
        }
    }

    /// Signal strength derived from probability distance to 0.5, in [0, 1].
    pub fn strength(&self) -> f64 {
        (self.probability - 0.5).abs() * 2.0
    }

    /// Serialise to one JSONL line (no trailing newline).
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).expect("signal serialisation cannot fail")
    }

    /// Parse one JSONL line.
    ///
    /// Missing `bar_id` and NaN/out-of-range probability reject the record.
    /// Version "1.0" records are accepted with a warning and upgraded in
    /// memory (their `target_bar_id` is derived when absent).
    pub fn from_json_line(line: &str) -> Result<Self, SignalError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| SignalError::Malformed(e.to_string()))?;

        if value.get("bar_id").and_then(|v| v.as_u64()).is_none() {
            return Err(SignalError::MissingBarId);
        }

        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("1.0")
            .to_string();
        if version != SIGNAL_VERSION {
            warn!(version = %version, "accepting legacy signal record read-only");
        }

        let mut signal: Signal = serde_json::from_value(value)
            .map_err(|e| SignalError::Malformed(e.to_string()))?;

        if !signal.probability.is_finite() || !(0.0..=1.0).contains(&signal.probability) {
            return Err(SignalError::InvalidProbability(format!(
                "{}",
                signal.probability
            )));
        }

        signal.prediction_horizon = signal.prediction_horizon.max(1);
        if signal.target_bar_id == 0 {
            signal.target_bar_id = signal.bar_id + signal.prediction_horizon as u64;
        }

        Ok(signal)
    }
}
