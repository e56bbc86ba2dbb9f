/// US exchange holiday calendar (New York dates)
use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashSet;

/// NYSE full-day closures for 2025 and 2026 (update annually)
pub fn us_market_holidays() -> HashSet<NaiveDate> {
    [
        // 2025
        (2025, 1, 1),   // New Year's Day
        (2025, 1, 20),  // Martin Luther King Jr. Day
        (2025, 2, 17),  // Washington's Birthday
        (2025, 4, 18),  // Good Friday
        (2025, 5, 26),  // Memorial Day
        (2025, 6, 19),  // Juneteenth
        (2025, 7, 4),   // Independence Day
        (2025, 9, 1),   // Labor Day
        (2025, 11, 27), // Thanksgiving
        (2025, 12, 25), // Christmas
        // 2026
        (2026, 1, 1),
        (2026, 1, 19),
        (2026, 2, 16),
        (2026, 4, 3),
        (2026, 5, 25),
        (2026, 6, 19),
        (2026, 7, 3), // Independence Day observed
        (2026, 9, 7),
        (2026, 11, 26),
        (2026, 12, 25),
    ]
    .into_iter()
    .filter_map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d))
    .collect()
}

#[derive(Debug, Clone)]
pub struct HolidayCalendar {
    holidays: HashSet<NaiveDate>,
}

impl HolidayCalendar {
    /// Built-in US holidays plus any configured extras
    pub fn new(extra: &[NaiveDate]) -> Self {
        let mut holidays = us_market_holidays();
        holidays.extend(extra.iter().copied());
        HolidayCalendar { holidays }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Weekday that is not a holiday
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }
}

impl Default for HolidayCalendar {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_builtin_and_configured_holidays() {
        let calendar = HolidayCalendar::new(&[date(2025, 3, 11)]);
        assert!(!calendar.is_trading_day(date(2025, 12, 25)));
        assert!(!calendar.is_trading_day(date(2025, 3, 11)));
        assert!(calendar.is_trading_day(date(2025, 3, 12)));
    }

    #[test]
    fn test_weekends_and_good_friday() {
        let calendar = HolidayCalendar::default();
        assert!(!calendar.is_trading_day(date(2025, 3, 8))); // Saturday
        assert!(calendar.is_trading_day(date(2025, 4, 17)));
        assert!(!calendar.is_trading_day(date(2025, 4, 18)));
    }
}
