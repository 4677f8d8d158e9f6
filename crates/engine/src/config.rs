//! Engine configuration
//!
//! Knobs for lot matching and for the reporting calendar.

use chrono::{FixedOffset, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

use crate::types::LotAlgorithm;

/// `setting` key that overrides [`EngineConfig::reporting_offset_hours`]
pub const REPORTING_OFFSET_SETTING: &str = "reporting_timezone_offset_hours";

/// Seconds in an average Gregorian year
pub const SECONDS_PER_YEAR: i64 = 31_556_952;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ordering used for ordinary drawdowns
    pub lot_algorithm: LotAlgorithm,
    /// Ordering used when unwinding the asset behind a receipt
    pub unwind_algorithm: LotAlgorithm,
    /// Holding period at which a disposal becomes long-term
    pub long_term_seconds: i64,
    /// Offset from UTC of the reporting calendar
    pub reporting_offset_hours: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lot_algorithm: LotAlgorithm::Hifo,
            unwind_algorithm: LotAlgorithm::Low,
            long_term_seconds: SECONDS_PER_YEAR,
            reporting_offset_hours: 0,
        }
    }
}

impl EngineConfig {
    /// Inclusive `(start, end)` unix bounds of a reporting year
    pub fn year_bounds(&self, year: i32) -> (i64, i64) {
        // out-of-range offsets fall back to UTC
        let Some(offset) = FixedOffset::east_opt(self.reporting_offset_hours * 3600)
            .or_else(|| FixedOffset::east_opt(0))
        else {
            return (i64::MIN, i64::MAX);
        };
        let start_of = |y: i32| {
            NaiveDate::from_ymd_opt(y, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .and_then(|dt| offset.from_local_datetime(&dt).single())
                .map(|dt| dt.timestamp())
        };
        let start = start_of(year).unwrap_or(i64::MIN);
        let end = start_of(year + 1).map(|t| t - 1).unwrap_or(i64::MAX);
        (start, end)
    }

    pub fn is_long_term(&self, duration_held: i64) -> bool {
        duration_held > self.long_term_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_bounds_utc() {
        let config = EngineConfig::default();
        let (start, end) = config.year_bounds(2022);
        assert_eq!(start, 1_640_995_200);
        assert_eq!(end, 1_672_531_199);
    }

    #[test]
    fn test_year_bounds_with_offset() {
        let config = EngineConfig {
            reporting_offset_hours: -8,
            ..Default::default()
        };
        let (start, _) = config.year_bounds(2022);
        // midnight in UTC-8 is 08:00 UTC
        assert_eq!(start, 1_640_995_200 + 8 * 3600);
    }

    #[test]
    fn test_long_term_threshold() {
        let config = EngineConfig::default();
        assert!(!config.is_long_term(SECONDS_PER_YEAR));
        assert!(config.is_long_term(SECONDS_PER_YEAR + 1));
    }
}
