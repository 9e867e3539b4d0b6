// =============================================================================
// MRB — Mean Return per Block from a backend equity curve
// =============================================================================
//
// Trading MRB is the per-block total return of the equity curve produced by
// the backend under real execution rules. It is the only MRB used as a pass
// criterion; per-signal diagnostics are not computed here.
// =============================================================================

use crate::market_data::Bar;
use crate::signals::{Signal, SignalDirection};

/// Standard block size in bars.
pub const BLOCK_SIZE: usize = 480;

/// Mean return per block over `num_blocks` blocks of the equity curve.
///
/// Degenerate inputs (empty curve, zero starting equity, zero blocks)
/// yield 0.
pub fn trading_mrb(equity_curve: &[f64], num_blocks: usize) -> f64 {
    if equity_curve.len() < 2 || num_blocks == 0 {
        return 0.0;
    }
    let first = equity_curve[0];
    let last = equity_curve[equity_curve.len() - 1];
    if first <= 0.0 {
        return 0.0;
    }
    (last / first - 1.0) / num_blocks as f64
}

/// Fraction of non-neutral signals whose direction matched the next bar's
/// close-to-close move. 0 when no non-neutral signal can be scored.
pub fn signal_accuracy(signals: &[Signal], bars: &[Bar]) -> f64 {
    let n = signals.len().min(bars.len());
    if n < 2 {
        return 0.0;
    }

    let mut scored = 0usize;
    let mut correct = 0usize;
    for i in 0..n - 1 {
        let direction = match signals[i].signal_type {
            SignalDirection::Long => 1.0,
            SignalDirection::Short => -1.0,
            SignalDirection::Neutral => continue,
        };
        let delta = bars[i + 1].close - bars[i].close;
        if delta == 0.0 {
            continue;
        }
        scored += 1;
        if delta * direction > 0.0 {
            correct += 1;
        }
    }

    if scored == 0 {
        0.0
    } else {
        correct as f64 / scored as f64
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(bar_id: u64, close: f64) -> Bar {
        Bar {
            symbol: "QQQ".to_string(),
            bar_id,
            timestamp_ms: bar_id as i64 * 60_000,
            open: close,
            high: close + 0.1,
            low: close - 0.1,
            close,
            volume: 100,
        }
    }

    fn signal(bar_id: u64, direction: SignalDirection) -> Signal {
        let p = match direction {
            SignalDirection::Long => 0.8,
            SignalDirection::Short => 0.2,
            SignalDirection::Neutral => 0.5,
        };
        Signal::new(bar_id, 0, "QQQ", p, direction, 1)
    }

    #[test]
    fn mrb_divides_total_return_by_blocks() {
        // +4% over 10 blocks = 0.4% per block.
        let curve = vec![100_000.0, 102_000.0, 104_000.0];
        assert!((trading_mrb(&curve, 10) - 0.004).abs() < 1e-12);
    }

    #[test]
    fn mrb_degenerate_inputs_are_zero() {
        assert_eq!(trading_mrb(&[], 10), 0.0);
        assert_eq!(trading_mrb(&[100.0], 10), 0.0);
        assert_eq!(trading_mrb(&[100.0, 110.0], 0), 0.0);
        assert_eq!(trading_mrb(&[0.0, 110.0], 10), 0.0);
    }

    #[test]
    fn mrb_is_negative_for_losses() {
        let curve = vec![100_000.0, 99_000.0];
        assert!(trading_mrb(&curve, 1) < 0.0);
    }

    #[test]
    fn accuracy_scores_directional_signals_only() {
        let bars = vec![bar(1, 100.0), bar(2, 101.0), bar(3, 100.5), bar(4, 100.5)];
        let signals = vec![
            signal(1, SignalDirection::Long),    // next up: correct
            signal(2, SignalDirection::Long),    // next down: wrong
            signal(3, SignalDirection::Neutral), // skipped
            signal(4, SignalDirection::Short),   // no next bar
        ];
        assert!((signal_accuracy(&signals, &bars) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn accuracy_with_no_directional_signals_is_zero() {
        let bars = vec![bar(1, 100.0), bar(2, 101.0)];
        let signals = vec![signal(1, SignalDirection::Neutral), signal(2, SignalDirection::Neutral)];
        assert_eq!(signal_accuracy(&signals, &bars), 0.0);
    }
}
