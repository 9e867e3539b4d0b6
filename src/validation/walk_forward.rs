// =============================================================================
// Walk-Forward Validator — out-of-sample evaluation over windowed slices
// =============================================================================
//
// The bar stream is sliced into train/test windows (rolling, anchored, or
// expanding, in 480-bar blocks). For each window the signal producer
// generates signals for the train and test slices, both are run through the
// full backend (PSM + hysteresis + allocation, simulated fills), and the
// resulting Trading MRBs drive per-window pass/fail plus aggregate
// statistics and an overall assessment.
//
// Producer state is reset only before window 0; later windows carry
// indicator warm-up forward, mirroring live behavior.
// =============================================================================

use tracing::{info, warn};

use super::mrb::{signal_accuracy, trading_mrb, BLOCK_SIZE};
use super::{
    Assessment, WalkForwardConfig, WalkForwardResult, WindowMode, WindowResult,
};
use crate::backend::{simulate, BackendConfig};
use crate::market_data::Bar;
use crate::signals::{Signal, SignalDirection};

/// Two-sided 95% z-value, also the significance cut for the t-statistic.
const Z_95: f64 = 1.96;

/// Produces per-bar signals for a slice of market data.
///
/// Implementations keep indicator state between calls; the validator resets
/// them only at the first window.
pub trait SignalProducer {
    fn reset(&mut self);
    fn produce(&mut self, bars: &[Bar]) -> Vec<Signal>;
}

pub struct WalkForwardValidator;

impl WalkForwardValidator {
    /// Run the full walk-forward evaluation.
    pub fn validate(
        producer: &mut dyn SignalProducer,
        bars: &[Bar],
        config: &WalkForwardConfig,
        backend_config: &BackendConfig,
    ) -> WalkForwardResult {
        let train_bars = config.train_window_blocks * BLOCK_SIZE;
        let test_bars = config.test_window_blocks * BLOCK_SIZE;
        let step_bars = config.step_size_blocks * BLOCK_SIZE;
        let min_window = train_bars + test_bars;

        if step_bars == 0 || train_bars == 0 || test_bars == 0 {
            return WalkForwardResult::empty_failure(
                "window and step sizes must be positive".to_string(),
            );
        }
        if bars.len() < min_window {
            return WalkForwardResult::empty_failure(format!(
                "insufficient data: need {min_window} bars, have {}",
                bars.len()
            ));
        }

        let windows = generate_windows(config.mode, bars.len(), train_bars, test_bars, step_bars);
        if windows.is_empty() {
            return WalkForwardResult::empty_failure("no valid windows generated".to_string());
        }

        info!(
            mode = %config.mode,
            windows = windows.len(),
            train_blocks = config.train_window_blocks,
            test_blocks = config.test_window_blocks,
            step_blocks = config.step_size_blocks,
            "walk-forward validation started"
        );

        let mut window_results = Vec::with_capacity(windows.len());
        for (index, window) in windows.iter().enumerate() {
            let result =
                process_window(producer, bars, config, backend_config, *window, index);
            info!(
                window = index + 1,
                total = windows.len(),
                test_mrb_pct = result.test_mrb * 100.0,
                passed = result.passed,
                "window evaluated"
            );
            window_results.push(result);
        }

        aggregate(window_results, config)
    }
}

/// `(train_start, train_end, test_start, test_end)` index tuples.
type Window = (usize, usize, usize, usize);

fn generate_windows(
    mode: WindowMode,
    total_bars: usize,
    train_bars: usize,
    test_bars: usize,
    step_bars: usize,
) -> Vec<Window> {
    let mut windows = Vec::new();

    match mode {
        WindowMode::Rolling => {
            let mut start = 0usize;
            while start + train_bars + test_bars <= total_bars {
                let train_end = start + train_bars;
                windows.push((start, train_end, train_end, train_end + test_bars));
                start += step_bars;
            }
        }
        WindowMode::Anchored => {
            let mut train_end = train_bars;
            while train_end + test_bars <= total_bars {
                windows.push((0, train_end, train_end, train_end + test_bars));
                train_end += step_bars;
            }
        }
        WindowMode::Expanding => {
            let mut test_start = train_bars;
            while test_start + test_bars <= total_bars {
                windows.push((0, test_start, test_start, test_start + test_bars));
                test_start += step_bars;
            }
        }
    }

    windows
}

fn process_window(
    producer: &mut dyn SignalProducer,
    bars: &[Bar],
    config: &WalkForwardConfig,
    backend_config: &BackendConfig,
    (train_start, train_end, test_start, test_end): Window,
    window_index: usize,
) -> WindowResult {
    let mut result = WindowResult {
        window_index,
        train_start_bar: train_start,
        train_end_bar: train_end,
        test_start_bar: test_start,
        test_end_bar: test_end,
        ..WindowResult::default()
    };

    // Only the first window starts cold.
    if window_index == 0 {
        producer.reset();
    }

    let train_slice = &bars[train_start..train_end];
    let test_slice = &bars[test_start..test_end];

    // In-sample.
    let train_signals = producer.produce(train_slice);
    result.train_signals = train_signals.len();
    result.train_non_neutral = count_non_neutral(&train_signals);
    result.train_accuracy = signal_accuracy(&train_signals, train_slice);
    let train_run = simulate(backend_config, &train_signals, train_slice, None);
    result.train_mrb = trading_mrb(&train_run.equity_curve, config.train_window_blocks);

    // Out-of-sample; producer state carries the warm-up forward.
    let test_signals = producer.produce(test_slice);
    result.test_signals = test_signals.len();
    result.test_non_neutral = count_non_neutral(&test_signals);
    result.test_accuracy = signal_accuracy(&test_signals, test_slice);
    let test_run = simulate(backend_config, &test_signals, test_slice, None);
    result.test_mrb = trading_mrb(&test_run.equity_curve, config.test_window_blocks);

    result.degradation_ratio = if result.train_mrb > 0.0 {
        (result.train_mrb - result.test_mrb) / result.train_mrb
    } else {
        0.0
    };
    result.is_overfit = result.degradation_ratio > config.max_degradation_ratio;
    result.passed = result.test_mrb >= config.min_mrb_threshold && !result.is_overfit;

    if !result.passed {
        result.failure_reason = Some(if result.test_mrb < config.min_mrb_threshold {
            format!("low MRB: {:.4}%", result.test_mrb * 100.0)
        } else {
            format!(
                "overfitting: {:.1}% degradation",
                result.degradation_ratio * 100.0
            )
        });
    }

    result
}

fn count_non_neutral(signals: &[Signal]) -> usize {
    signals
        .iter()
        .filter(|s| s.signal_type != SignalDirection::Neutral)
        .count()
}

/// Fold per-window results into aggregate statistics and an assessment.
pub fn aggregate(windows: Vec<WindowResult>, config: &WalkForwardConfig) -> WalkForwardResult {
    if windows.is_empty() {
        return WalkForwardResult::empty_failure("no windows to aggregate".to_string());
    }

    let n = windows.len();
    let passing = windows.iter().filter(|w| w.passed).count();
    let overfit = windows.iter().filter(|w| w.is_overfit).count();

    let mean_test_mrb = windows.iter().map(|w| w.test_mrb).sum::<f64>() / n as f64;
    let mean_train_mrb = windows.iter().map(|w| w.train_mrb).sum::<f64>() / n as f64;
    let mean_degradation =
        windows.iter().map(|w| w.degradation_ratio).sum::<f64>() / n as f64;

    let variance = windows
        .iter()
        .map(|w| (w.test_mrb - mean_test_mrb) * (w.test_mrb - mean_test_mrb))
        .sum::<f64>()
        / n as f64;
    let std_test_mrb = variance.sqrt();

    let win_rate = passing as f64 / n as f64;
    let overfit_percentage = overfit as f64 / n as f64;

    let consistency_score = if mean_test_mrb.abs() > 1e-4 {
        (1.0 - std_test_mrb / mean_test_mrb.abs()).max(0.0)
    } else {
        0.0
    };

    let std_error = if n >= 2 {
        std_test_mrb / (n as f64).sqrt()
    } else {
        0.0
    };
    let (ci_lower_95, ci_upper_95) = if n >= 2 {
        (
            mean_test_mrb - Z_95 * std_error,
            mean_test_mrb + Z_95 * std_error,
        )
    } else {
        (mean_test_mrb, mean_test_mrb)
    };

    let (t_statistic, statistically_significant) = if n >= 2 && std_error > 0.0 {
        let t = mean_test_mrb / std_error;
        (t, t.abs() >= Z_95)
    } else {
        (0.0, false)
    };

    // Six pass criteria feed the assessment bucket.
    let mrb_sufficient = mean_test_mrb >= config.min_mrb_threshold;
    let ci_positive = ci_lower_95 > 0.0;
    let high_win_rate = win_rate >= 0.6;
    let consistent = consistency_score >= 0.6;
    let low_overfitting = overfit_percentage < 0.3;

    let criteria_passed = [
        mrb_sufficient,
        ci_positive,
        high_win_rate,
        consistent,
        statistically_significant,
        low_overfitting,
    ]
    .iter()
    .filter(|c| **c)
    .count();

    let (assessment, passed) = match criteria_passed {
        5 | 6 => (Assessment::Excellent, true),
        4 => (Assessment::Good, true),
        3 => (Assessment::Fair, false),
        2 => (Assessment::Poor, false),
        _ => (Assessment::Failed, false),
    };

    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    if !mrb_sufficient {
        issues.push(format!(
            "mean test MRB {:.4}% below threshold {:.4}%",
            mean_test_mrb * 100.0,
            config.min_mrb_threshold * 100.0
        ));
        recommendations
            .push("improve signal quality or adjust strategy parameters".to_string());
    }
    if !ci_positive {
        issues.push(format!(
            "95% CI lower bound is not positive ({:.4}%)",
            ci_lower_95 * 100.0
        ));
    }
    if !high_win_rate {
        issues.push(format!(
            "low window win rate ({:.0}%, target 60%+)",
            win_rate * 100.0
        ));
    }
    if !consistent {
        issues.push(format!(
            "inconsistent performance (consistency {:.0}%, target 60%+)",
            consistency_score * 100.0
        ));
        recommendations.push("investigate regime-dependent performance".to_string());
    }
    if !statistically_significant {
        issues.push("results not statistically significant".to_string());
    }
    if !low_overfitting {
        issues.push(format!(
            "high overfit rate ({:.0}%)",
            overfit_percentage * 100.0
        ));
        recommendations
            .push("reduce model complexity or widen training windows".to_string());
    }

    if !passed {
        warn!(
            assessment = %assessment,
            criteria_passed,
            "walk-forward validation did not pass"
        );
    } else {
        info!(
            assessment = %assessment,
            mean_test_mrb_pct = mean_test_mrb * 100.0,
            win_rate,
            "walk-forward validation passed"
        );
    }

    WalkForwardResult {
        windows,
        total_windows: n,
        passing_windows: passing,
        overfit_windows: overfit,
        mean_test_mrb,
        mean_train_mrb,
        std_test_mrb,
        mean_degradation,
        win_rate,
        overfit_percentage,
        consistency_score,
        ci_lower_95,
        ci_upper_95,
        t_statistic,
        statistically_significant,
        assessment,
        passed,
        issues,
        recommendations,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;

    fn synthetic_window(index: usize, test_mrb: f64, threshold: f64) -> WindowResult {
        WindowResult {
            window_index: index,
            test_mrb,
            train_mrb: test_mrb * 1.2,
            passed: test_mrb >= threshold,
            ..WindowResult::default()
        }
    }

    #[test]
    fn aggregation_matches_reference_figures() {
        // Eight windows with the reference MRB series.
        let mrbs = [0.006, 0.004, 0.002, 0.005, 0.003, 0.007, 0.004, 0.005];
        let config = WalkForwardConfig::default();
        let windows: Vec<WindowResult> = mrbs
            .iter()
            .enumerate()
            .map(|(i, mrb)| synthetic_window(i, *mrb, config.min_mrb_threshold))
            .collect();

        let result = aggregate(windows, &config);

        assert_eq!(result.total_windows, 8);
        assert_eq!(result.passing_windows, 6);
        assert!((result.win_rate - 0.75).abs() < 1e-12);
        assert!((result.mean_test_mrb - 0.0045).abs() < 1e-12);
        assert!(result.std_test_mrb > 0.0014 && result.std_test_mrb < 0.0017);
        assert!(result.ci_lower_95 > 0.0030 && result.ci_lower_95 < 0.0036);
        assert!(result.ci_upper_95 > 0.0054 && result.ci_upper_95 < 0.0060);
        assert!(result.t_statistic > 7.5);
        assert!(result.statistically_significant);
        assert!(result.consistency_score > 0.6 && result.consistency_score < 0.7);
        assert!(result.assessment >= Assessment::Good);
        assert!(result.passed);
    }

    #[test]
    fn failing_series_is_assessed_low() {
        let config = WalkForwardConfig::default();
        let windows: Vec<WindowResult> = (0..6)
            .map(|i| synthetic_window(i, -0.001, config.min_mrb_threshold))
            .collect();
        let result = aggregate(windows, &config);
        assert!(!result.passed);
        assert!(result.assessment <= Assessment::Fair);
        assert!(!result.issues.is_empty());
    }

    #[test]
    fn rolling_windows_advance_by_step() {
        let windows = generate_windows(WindowMode::Rolling, 4800, 1920, 480, 480);
        // (4800 - 2400) / 480 + 1 = 6 windows.
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[0], (0, 1920, 1920, 2400));
        assert_eq!(windows[1], (480, 2400, 2400, 2880));
        for (train_start, train_end, test_start, test_end) in windows {
            assert_eq!(train_end - train_start, 1920);
            assert_eq!(test_end - test_start, 480);
            assert_eq!(train_end, test_start);
        }
    }

    #[test]
    fn anchored_windows_grow_from_fixed_start() {
        let windows = generate_windows(WindowMode::Anchored, 4800, 1920, 480, 480);
        assert!(windows.len() >= 2);
        for (i, (train_start, train_end, _, _)) in windows.iter().enumerate() {
            assert_eq!(*train_start, 0);
            assert_eq!(*train_end, 1920 + i * 480);
        }
    }

    #[test]
    fn expanding_windows_use_all_prior_data() {
        let windows = generate_windows(WindowMode::Expanding, 4800, 1920, 480, 480);
        for (train_start, train_end, test_start, _) in windows {
            assert_eq!(train_start, 0);
            assert_eq!(train_end, test_start);
        }
    }

    #[test]
    fn insufficient_data_fails_cleanly() {
        struct Never;
        impl SignalProducer for Never {
            fn reset(&mut self) {}
            fn produce(&mut self, _bars: &[Bar]) -> Vec<Signal> {
                Vec::new()
            }
        }

        let config = WalkForwardConfig::default();
        let backend_config = BackendConfig::from_runtime(&RuntimeConfig::default());
        let result =
            WalkForwardValidator::validate(&mut Never, &[], &config, &backend_config);
        assert!(!result.passed);
        assert_eq!(result.assessment, Assessment::Failed);
        assert!(result.issues[0].contains("insufficient data"));
    }

    #[test]
    fn end_to_end_validation_runs_and_resets_once() {
        // A momentum producer over a gently trending series.
        struct Momentum {
            resets: usize,
            last_close: Option<f64>,
            next_bar_id: u64,
        }
        impl SignalProducer for Momentum {
            fn reset(&mut self) {
                self.resets += 1;
                self.last_close = None;
            }
            fn produce(&mut self, bars: &[Bar]) -> Vec<Signal> {
                bars.iter()
                    .map(|bar| {
                        let p = match self.last_close {
                            Some(prev) if bar.close > prev => 0.75,
                            Some(prev) if bar.close < prev => 0.25,
                            _ => 0.5,
                        };
                        self.last_close = Some(bar.close);
                        self.next_bar_id += 1;
                        let direction = if p > 0.5 {
                            SignalDirection::Long
                        } else if p < 0.5 {
                            SignalDirection::Short
                        } else {
                            SignalDirection::Neutral
                        };
                        Signal::new(bar.bar_id, bar.timestamp_ms, &bar.symbol, p, direction, 1)
                    })
                    .collect()
            }
        }

        // 3 blocks train + 1 block test + a step, tiny but structurally real.
        let config = WalkForwardConfig {
            mode: WindowMode::Rolling,
            train_window_blocks: 3,
            test_window_blocks: 1,
            step_size_blocks: 1,
            ..WalkForwardConfig::default()
        };
        let backend_config = BackendConfig::from_runtime(&RuntimeConfig::default());

        let bars: Vec<Bar> = (0..2880u64)
            .map(|i| {
                let close = 400.0 * (1.0 + 0.00001 * i as f64);
                Bar {
                    symbol: "QQQ".to_string(),
                    bar_id: i + 1,
                    timestamp_ms: i as i64 * 60_000,
                    open: close,
                    high: close * 1.0005,
                    low: close * 0.9995,
                    close,
                    volume: 1_000,
                }
            })
            .collect();

        let mut producer = Momentum {
            resets: 0,
            last_close: None,
            next_bar_id: 1,
        };
        let result =
            WalkForwardValidator::validate(&mut producer, &bars, &config, &backend_config);

        // (2880 - 1920) / 480 + 1 = 3 windows; reset only before window 0.
        assert_eq!(result.total_windows, 3);
        assert_eq!(producer.resets, 1);
        assert_eq!(result.windows.len(), 3);
        for window in &result.windows {
            assert_eq!(window.test_signals, 480);
            assert!(window.train_signals >= 1440);
        }
    }
}
