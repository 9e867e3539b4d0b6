// =============================================================================
// Validation — out-of-sample evaluation of the signal/trading pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

pub mod mrb;
pub mod walk_forward;

pub use walk_forward::{SignalProducer, WalkForwardValidator};

/// How train/test windows advance over the bar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowMode {
    /// Fixed train and test windows advancing by `step`.
    Rolling,
    /// Fixed start, growing train window, constant test window.
    Anchored,
    /// Train window is all data up to the test window.
    Expanding,
}

impl std::fmt::Display for WindowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rolling => write!(f, "ROLLING"),
            Self::Anchored => write!(f, "ANCHORED"),
            Self::Expanding => write!(f, "EXPANDING"),
        }
    }
}

fn default_train_blocks() -> usize {
    40
}

fn default_test_blocks() -> usize {
    10
}

fn default_step_blocks() -> usize {
    10
}

fn default_min_mrb_threshold() -> f64 {
    0.0035
}

fn default_max_degradation_ratio() -> f64 {
    0.5
}

/// Walk-forward parameters, in 480-bar blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub mode: WindowMode,
    #[serde(default = "default_train_blocks")]
    pub train_window_blocks: usize,
    #[serde(default = "default_test_blocks")]
    pub test_window_blocks: usize,
    #[serde(default = "default_step_blocks")]
    pub step_size_blocks: usize,
    #[serde(default = "default_min_mrb_threshold")]
    pub min_mrb_threshold: f64,
    #[serde(default = "default_max_degradation_ratio")]
    pub max_degradation_ratio: f64,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            mode: WindowMode::Rolling,
            train_window_blocks: default_train_blocks(),
            test_window_blocks: default_test_blocks(),
            step_size_blocks: default_step_blocks(),
            min_mrb_threshold: default_min_mrb_threshold(),
            max_degradation_ratio: default_max_degradation_ratio(),
        }
    }
}

/// Per-window outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowResult {
    pub window_index: usize,
    pub train_start_bar: usize,
    pub train_end_bar: usize,
    pub test_start_bar: usize,
    pub test_end_bar: usize,
    pub train_signals: usize,
    pub test_signals: usize,
    pub train_non_neutral: usize,
    pub test_non_neutral: usize,
    pub train_mrb: f64,
    pub test_mrb: f64,
    pub train_accuracy: f64,
    pub test_accuracy: f64,
    pub degradation_ratio: f64,
    pub is_overfit: bool,
    pub passed: bool,
    pub failure_reason: Option<String>,
}

/// Overall quality bucket from the six pass criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Assessment {
    Failed,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl std::fmt::Display for Assessment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed => write!(f, "FAILED"),
            Self::Poor => write!(f, "POOR"),
            Self::Fair => write!(f, "FAIR"),
            Self::Good => write!(f, "GOOD"),
            Self::Excellent => write!(f, "EXCELLENT"),
        }
    }
}

/// Aggregated walk-forward outcome.
#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardResult {
    pub windows: Vec<WindowResult>,
    pub total_windows: usize,
    pub passing_windows: usize,
    pub overfit_windows: usize,

    pub mean_test_mrb: f64,
    pub mean_train_mrb: f64,
    pub std_test_mrb: f64,
    pub mean_degradation: f64,

    pub win_rate: f64,
    pub overfit_percentage: f64,
    pub consistency_score: f64,

    pub ci_lower_95: f64,
    pub ci_upper_95: f64,
    pub t_statistic: f64,
    pub statistically_significant: bool,

    pub assessment: Assessment,
    pub passed: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl WalkForwardResult {
    pub(crate) fn empty_failure(reason: String) -> Self {
        Self {
            windows: Vec::new(),
            total_windows: 0,
            passing_windows: 0,
            overfit_windows: 0,
            mean_test_mrb: 0.0,
            mean_train_mrb: 0.0,
            std_test_mrb: 0.0,
            mean_degradation: 0.0,
            win_rate: 0.0,
            overfit_percentage: 0.0,
            consistency_score: 0.0,
            ci_lower_95: 0.0,
            ci_upper_95: 0.0,
            t_statistic: 0.0,
            statistically_significant: false,
            assessment: Assessment::Failed,
            passed: false,
            issues: vec![reason],
            recommendations: Vec::new(),
        }
    }
}
