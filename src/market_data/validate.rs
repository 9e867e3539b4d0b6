// =============================================================================
// Bar validation — reject malformed bars, never correct them
// =============================================================================

use super::Bar;

/// Why a bar failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarValidationError {
    /// One of O/H/L/C is NaN or infinite.
    NonFiniteOhlc,
    /// Negative volume.
    NegativeVolume,
    /// `bar_id` must be non-zero.
    ZeroBarId,
    /// High is below low.
    HighBelowLow,
    /// High is not the highest of O/H/L/C.
    HighNotHighest,
    /// Low is not the lowest of O/H/L/C.
    LowNotLowest,
    /// A price is zero or negative.
    NonPositivePrice,
    /// Intrabar move exceeds 50% (high/low > 1.5).
    ExcessiveIntrabarMove,
}

impl std::fmt::Display for BarValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFiniteOhlc => write!(f, "non-finite OHLC values"),
            Self::NegativeVolume => write!(f, "negative volume"),
            Self::ZeroBarId => write!(f, "bar_id must be non-zero"),
            Self::HighBelowLow => write!(f, "high < low"),
            Self::HighNotHighest => write!(f, "high not highest"),
            Self::LowNotLowest => write!(f, "low not lowest"),
            Self::NonPositivePrice => write!(f, "non-positive prices"),
            Self::ExcessiveIntrabarMove => write!(f, "excessive intrabar move (>50%)"),
        }
    }
}

impl std::error::Error for BarValidationError {}

/// Validate a bar against the engine's admission rules.
///
/// A failing bar is rejected by the caller; no field is ever repaired.
pub fn validate_bar(bar: &Bar) -> Result<(), BarValidationError> {
    if !bar.open.is_finite()
        || !bar.high.is_finite()
        || !bar.low.is_finite()
        || !bar.close.is_finite()
    {
        return Err(BarValidationError::NonFiniteOhlc);
    }

    if bar.volume < 0 {
        return Err(BarValidationError::NegativeVolume);
    }

    if bar.bar_id == 0 {
        return Err(BarValidationError::ZeroBarId);
    }

    if bar.high <= 0.0 || bar.low <= 0.0 || bar.open <= 0.0 || bar.close <= 0.0 {
        return Err(BarValidationError::NonPositivePrice);
    }

    if bar.high < bar.low {
        return Err(BarValidationError::HighBelowLow);
    }
    if bar.high < bar.open || bar.high < bar.close {
        return Err(BarValidationError::HighNotHighest);
    }
    if bar.low > bar.open || bar.low > bar.close {
        return Err(BarValidationError::LowNotLowest);
    }

    // A >50% intrabar range is treated as corrupt data.
    if bar.high / bar.low > 1.5 {
        return Err(BarValidationError::ExcessiveIntrabarMove);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_bar() -> Bar {
        Bar {
            symbol: "QQQ".to_string(),
            bar_id: 42,
            timestamp_ms: 1_700_000_000_000,
            open: 400.0,
            high: 401.5,
            low: 399.0,
            close: 400.5,
            volume: 12_000,
        }
    }

    #[test]
    fn valid_bar_passes() {
        assert!(validate_bar(&good_bar()).is_ok());
    }

    #[test]
    fn high_below_low_rejected() {
        // The literal case from the admission rules: high=390, low=410.
        let mut bar = good_bar();
        bar.high = 390.0;
        bar.low = 410.0;
        bar.close = 395.0;
        bar.open = 395.0;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::HighBelowLow));
    }

    #[test]
    fn high_must_bound_open_and_close() {
        let mut bar = good_bar();
        bar.close = bar.high + 1.0;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::HighNotHighest));

        let mut bar = good_bar();
        bar.open = bar.low - 1.0;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::LowNotLowest));
    }

    #[test]
    fn non_finite_rejected() {
        let mut bar = good_bar();
        bar.close = f64::NAN;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::NonFiniteOhlc));

        let mut bar = good_bar();
        bar.high = f64::INFINITY;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::NonFiniteOhlc));
    }

    #[test]
    fn non_positive_prices_rejected() {
        let mut bar = good_bar();
        bar.low = 0.0;
        bar.open = 0.5;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::NonPositivePrice));
    }

    #[test]
    fn negative_volume_rejected() {
        let mut bar = good_bar();
        bar.volume = -1;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::NegativeVolume));
    }

    #[test]
    fn zero_bar_id_rejected() {
        let mut bar = good_bar();
        bar.bar_id = 0;
        assert_eq!(validate_bar(&bar), Err(BarValidationError::ZeroBarId));
    }

    #[test]
    fn excessive_intrabar_move_rejected() {
        let mut bar = good_bar();
        bar.high = 600.0;
        bar.low = 399.0;
        bar.open = 400.0;
        bar.close = 599.0;
        assert_eq!(
            validate_bar(&bar),
            Err(BarValidationError::ExcessiveIntrabarMove)
        );
    }

    #[test]
    fn boundary_fifty_percent_move_passes() {
        let mut bar = good_bar();
        bar.low = 400.0;
        bar.high = 600.0;
        bar.open = 450.0;
        bar.close = 550.0;
        // high/low == 1.5 exactly is the last admissible ratio.
        assert!(validate_bar(&bar).is_ok());
    }
}
