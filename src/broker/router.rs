/// Dispatches fetches to the provider serving each asset class
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::broker::{BarFetcher, BinanceFetcher, CsvFeedFetcher, FetchRequest};
use crate::error::{FetchError, Result};
use crate::time::{HolidayCalendar, SessionCalendar};
use crate::types::{AssetType, Bar, Config, SeriesKey};
use crate::utils::RateLimiter;

/// Crypto goes to Binance when enabled, everything else (and crypto without
/// Binance) to the CSV feed. Market closure is confirmed from session hours.
pub struct MarketDataRouter {
    binance: Option<BinanceFetcher>,
    csv_feed: Option<CsvFeedFetcher>,
    calendar: SessionCalendar,
}

impl MarketDataRouter {
    pub fn new(
        binance: Option<BinanceFetcher>,
        csv_feed: Option<CsvFeedFetcher>,
        calendar: SessionCalendar,
    ) -> Self {
        MarketDataRouter {
            binance,
            csv_feed,
            calendar,
        }
    }

    /// Builds the configured providers. `limiter` is the one the sync engine
    /// paces fetches with; Binance draws on it for follow-up pages.
    pub fn from_config(config: &Config, limiter: Arc<RateLimiter>) -> Result<Self> {
        let binance = if config.providers.binance.enabled {
            let timeout = Duration::from_secs(config.sync.fetch_timeout_sec);
            let fetcher = BinanceFetcher::new(&config.providers.binance, timeout)?;
            Some(fetcher.with_rate_limiter(limiter))
        } else {
            None
        };
        let csv_feed = config.providers.csv_feed.root.as_ref().map(CsvFeedFetcher::new);
        let calendar = SessionCalendar::new(HolidayCalendar::new(&config.calendar.holidays));

        info!(
            "Providers: binance={}, csv_feed={}",
            binance.is_some(),
            csv_feed.is_some()
        );
        Ok(Self::new(binance, csv_feed, calendar))
    }
}

impl BarFetcher for MarketDataRouter {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<Vec<Bar>, FetchError> {
        match (request.key.asset_type, &self.binance, &self.csv_feed) {
            (AssetType::Crypto, Some(binance), _) => binance.fetch(request).await,
            (_, _, Some(feed)) => feed.fetch(request).await,
            (asset_type, _, None) => Err(FetchError::Permanent(format!(
                "No data provider configured for {}",
                asset_type
            ))),
        }
    }

    fn confirm_closed(&self, key: &SeriesKey, period: DateTime<Utc>) -> bool {
        self.calendar.is_closed(key.asset_type, key.timeframe, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_unconfigured_asset_is_permanent() {
        let router = MarketDataRouter::new(None, None, SessionCalendar::default());
        let request = FetchRequest {
            key: SeriesKey::new("AAPL", AssetType::Stock, Timeframe::OneDay),
            start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
        };
        let err = router.fetch(&request).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("STOCK"));
    }

    #[test]
    fn test_closure_follows_sessions() {
        let router = MarketDataRouter::new(None, None, SessionCalendar::default());
        let saturday = Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap();
        let stock = SeriesKey::new("AAPL", AssetType::Stock, Timeframe::OneDay);
        let crypto = SeriesKey::new("BTCUSDT", AssetType::Crypto, Timeframe::OneDay);
        assert!(router.confirm_closed(&stock, saturday));
        assert!(!router.confirm_closed(&crypto, saturday));
    }

    #[tokio::test]
    async fn test_default_config_routes_only_crypto() {
        let limiter = Arc::new(RateLimiter::new(5));
        let router = MarketDataRouter::from_config(&Config::default(), limiter).unwrap();
        let request = FetchRequest {
            key: SeriesKey::new("EURUSD", AssetType::Forex, Timeframe::OneHour),
            start: Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 10, 5, 0, 0).unwrap(),
        };
        // no csv feed root in the defaults
        let err = router.fetch(&request).await.unwrap_err();
        assert!(err.message().contains("FOREX"));
    }
}
