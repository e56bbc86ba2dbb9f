/// Market data providers behind the bar fetcher seam
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::FetchError;
use crate::types::{Bar, SeriesKey};

pub mod binance;
pub mod csv_feed;
pub mod router;

pub use binance::BinanceFetcher;
pub use csv_feed::CsvFeedFetcher;
pub use router::MarketDataRouter;

/// Bars for one series over an inclusive time window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: SeriesKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Source of historical bars
pub trait BarFetcher: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = std::result::Result<Vec<Bar>, FetchError>> + Send;

    /// Whether the provider can vouch that the market was closed for the
    /// period starting at `period`. Unknown means not closed.
    fn confirm_closed(&self, _key: &SeriesKey, _period: DateTime<Utc>) -> bool {
        false
    }
}
