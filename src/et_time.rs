// =============================================================================
// Eastern-time session clock — trading dates and the EOD window
// =============================================================================
//
// All end-of-day decisions are anchored to America/New_York wall-clock time,
// independent of the host timezone. The clock is a trait so tests can pin
// the time.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

/// Source of "now" in Eastern time.
pub trait SessionClock: Send + Sync {
    fn now_et(&self) -> DateTime<Tz>;
}

/// The real wall clock.
pub struct SystemClock;

impl SessionClock for SystemClock {
    fn now_et(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&New_York)
    }
}

/// A pinned clock for tests and replay.
pub struct FixedClock(pub DateTime<Tz>);

impl FixedClock {
    /// Build from an ET wall-clock date and time.
    pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Self {
        let dt = New_York
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("unambiguous ET timestamp");
        Self(dt)
    }
}

impl SessionClock for FixedClock {
    fn now_et(&self) -> DateTime<Tz> {
        self.0
    }
}

/// ET trading date (YYYY-MM-DD) of an instant.
pub fn et_date(now: &DateTime<Tz>) -> String {
    now.format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------------
// EOD window
// ---------------------------------------------------------------------------

/// Half-open local-ET time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EodWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl EodWindow {
    /// Parse from "HH:MM" strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let start = NaiveTime::parse_from_str(start, "%H:%M")
            .with_context(|| format!("invalid EOD window start {start:?}"))?;
        let end = NaiveTime::parse_from_str(end, "%H:%M")
            .with_context(|| format!("invalid EOD window end {end:?}"))?;
        if start >= end {
            bail!("EOD window start {start} must precede end {end}");
        }
        Ok(Self { start, end })
    }

    /// Whether `now` falls inside the window.
    pub fn contains(&self, now: &DateTime<Tz>) -> bool {
        let t = now.time();
        t >= self.start && t < self.end
    }
}

impl Default for EodWindow {
    fn default() -> Self {
        Self::parse("15:55", "16:00").expect("default window is valid")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_half_open() {
        let window = EodWindow::default();
        assert!(!window.contains(&FixedClock::at(2025, 6, 2, 15, 54).0));
        assert!(window.contains(&FixedClock::at(2025, 6, 2, 15, 55).0));
        assert!(window.contains(&FixedClock::at(2025, 6, 2, 15, 57).0));
        assert!(window.contains(&FixedClock::at(2025, 6, 2, 15, 59).0));
        assert!(!window.contains(&FixedClock::at(2025, 6, 2, 16, 0).0));
    }

    #[test]
    fn parse_rejects_inverted_window() {
        assert!(EodWindow::parse("16:00", "15:55").is_err());
        assert!(EodWindow::parse("nope", "16:00").is_err());
    }

    #[test]
    fn et_date_formats() {
        let clock = FixedClock::at(2025, 6, 2, 15, 57);
        assert_eq!(et_date(&clock.now_et()), "2025-06-02");
    }

    #[test]
    fn et_date_rolls_on_midnight() {
        let before = FixedClock::at(2025, 6, 2, 23, 59);
        let after = FixedClock::at(2025, 6, 3, 0, 1);
        assert_ne!(et_date(&before.now_et()), et_date(&after.now_et()));
    }
}
