/// Market session hours per asset class, evaluated in New York time
use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;

use crate::time::holidays::HolidayCalendar;
use crate::types::{AssetType, Timeframe};

const SAMPLE_STEP_MINUTES: i64 = 15;

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// Trading sessions:
/// stocks Mon-Fri 09:30-16:00, forex Sun 17:00 to Fri 17:00,
/// commodities Sun 18:00 to Fri 17:00 with a 17:00-18:00 daily break,
/// crypto always open. Holidays close stocks and commodities.
#[derive(Debug, Clone, Default)]
pub struct SessionCalendar {
    holidays: HolidayCalendar,
}

impl SessionCalendar {
    pub fn new(holidays: HolidayCalendar) -> Self {
        SessionCalendar { holidays }
    }

    pub fn is_open(&self, asset_type: AssetType, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&New_York);
        let weekday = local.weekday();
        let time = local.time().with_second(0).unwrap_or(local.time());

        match asset_type {
            AssetType::Crypto => true,
            AssetType::Stock => {
                self.holidays.is_trading_day(local.date_naive())
                    && time >= hm(9, 30)
                    && time < hm(16, 0)
            }
            AssetType::Forex => match weekday {
                Weekday::Sat => false,
                Weekday::Sun => time >= hm(17, 0),
                Weekday::Fri => time < hm(17, 0),
                _ => true,
            },
            AssetType::Commodity => {
                if self.holidays.is_holiday(local.date_naive()) {
                    return false;
                }
                match weekday {
                    Weekday::Sat => false,
                    Weekday::Sun => time >= hm(18, 0),
                    Weekday::Fri => time < hm(17, 0),
                    _ => !(time >= hm(17, 0) && time < hm(18, 0)),
                }
            }
        }
    }

    /// True when no instant sampled across the period falls in a session
    pub fn is_closed(
        &self,
        asset_type: AssetType,
        timeframe: Timeframe,
        period_start: DateTime<Utc>,
    ) -> bool {
        let step = Duration::minutes(SAMPLE_STEP_MINUTES.min(timeframe.duration_minutes()));
        let end = period_start + timeframe.duration();

        let mut at = period_start;
        while at < end {
            if self.is_open(asset_type, at) {
                return false;
            }
            at += step;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_stock_session() {
        let calendar = SessionCalendar::default();
        // Wednesday 2025-03-12
        assert!(calendar.is_open(AssetType::Stock, ny(2025, 3, 12, 10, 0)));
        assert!(!calendar.is_open(AssetType::Stock, ny(2025, 3, 12, 9, 0)));
        assert!(!calendar.is_open(AssetType::Stock, ny(2025, 3, 12, 16, 0)));
        // Saturday
        assert!(!calendar.is_open(AssetType::Stock, ny(2025, 3, 15, 11, 0)));
        // Good Friday
        assert!(!calendar.is_open(AssetType::Stock, ny(2025, 4, 18, 11, 0)));
    }

    #[test]
    fn test_forex_and_commodity_weekends() {
        let calendar = SessionCalendar::default();
        // Sunday 2025-03-16
        assert!(!calendar.is_open(AssetType::Forex, ny(2025, 3, 16, 16, 0)));
        assert!(calendar.is_open(AssetType::Forex, ny(2025, 3, 16, 17, 30)));
        assert!(!calendar.is_open(AssetType::Commodity, ny(2025, 3, 16, 17, 30)));
        assert!(calendar.is_open(AssetType::Commodity, ny(2025, 3, 16, 18, 30)));
        // Daily commodity break on a Tuesday
        assert!(!calendar.is_open(AssetType::Commodity, ny(2025, 3, 18, 17, 15)));
        assert!(calendar.is_open(AssetType::Forex, ny(2025, 3, 18, 17, 15)));
        assert!(calendar.is_open(AssetType::Crypto, ny(2025, 3, 15, 3, 0)));
    }

    #[test]
    fn test_period_closure() {
        let calendar = SessionCalendar::default();
        let saturday = Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap();
        assert!(calendar.is_closed(AssetType::Stock, Timeframe::OneDay, saturday));
        assert!(calendar.is_closed(AssetType::Forex, Timeframe::OneDay, saturday));
        assert!(!calendar.is_closed(AssetType::Crypto, Timeframe::OneDay, saturday));

        // 14:00 UTC Wednesday is inside the NY cash session
        let midday = Utc.with_ymd_and_hms(2025, 3, 12, 14, 0, 0).unwrap();
        assert!(!calendar.is_closed(AssetType::Stock, Timeframe::OneHour, midday));
        let overnight = Utc.with_ymd_and_hms(2025, 3, 12, 3, 0, 0).unwrap();
        assert!(calendar.is_closed(AssetType::Stock, Timeframe::OneHour, overnight));

        // weekly bars always contain a session
        let monday = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        assert!(!calendar.is_closed(AssetType::Stock, Timeframe::OneWeek, monday));
    }
}
