/// File-drop bar feed: `<root>/<asset>/<SYMBOL>_<timeframe>.csv`
///
/// Each file carries a `timestamp,open,high,low,close,volume` header.
/// Timestamps are RFC 3339 or epoch seconds.
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::broker::{BarFetcher, FetchRequest};
use crate::error::FetchError;
use crate::types::{AssetType, Bar, SeriesKey};

#[derive(Debug, Deserialize)]
struct FeedRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

pub struct CsvFeedFetcher {
    root: PathBuf,
}

impl CsvFeedFetcher {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        CsvFeedFetcher {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &SeriesKey) -> PathBuf {
        let dir = match key.asset_type {
            AssetType::Stock => "stocks",
            AssetType::Forex => "forex",
            AssetType::Commodity => "commodities",
            AssetType::Crypto => "crypto",
        };
        self.root
            .join(dir)
            .join(format!("{}_{}.csv", key.symbol.to_uppercase(), key.timeframe))
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

const FEED_COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// Parse feed content, keeping rows inside the request window.
/// Unreadable rows are logged and skipped; a file without the feed header
/// is rejected outright.
pub fn parse_feed(
    request: &FetchRequest,
    content: &str,
) -> std::result::Result<Vec<Bar>, FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers().map_err(|e| {
        FetchError::Permanent(format!("Unreadable feed header for {}: {}", request.key, e))
    })?;
    if let Some(missing) = FEED_COLUMNS
        .iter()
        .find(|column| !headers.iter().any(|h| h == **column))
    {
        return Err(FetchError::Permanent(format!(
            "Feed for {} has no '{}' column",
            request.key, missing
        )));
    }

    let mut bars = Vec::new();
    let mut skipped = 0;
    for (line, row) in reader.deserialize::<FeedRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!(series = %request.key, "⚠️  Skipping corrupt feed row {}: {}", line + 2, e);
                skipped += 1;
                continue;
            }
        };
        let Some(timestamp) = parse_timestamp(&row.timestamp) else {
            warn!(
                series = %request.key,
                "⚠️  Skipping feed row {}: bad timestamp '{}'",
                line + 2,
                row.timestamp
            );
            skipped += 1;
            continue;
        };

        if timestamp < request.start || timestamp > request.end {
            continue;
        }

        bars.push(Bar {
            symbol: request.key.symbol.clone(),
            asset_type: request.key.asset_type,
            timeframe: request.key.timeframe,
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }

    if skipped > 0 {
        warn!(series = %request.key, "{} feed rows skipped", skipped);
    }
    Ok(bars)
}

impl BarFetcher for CsvFeedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<Vec<Bar>, FetchError> {
        let path = self.path_for(&request.key);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                FetchError::Permanent(format!("No feed file {}", path.display()))
            }
            _ => FetchError::Transient(format!("Failed to read {}: {}", path.display(), e)),
        })?;

        let bars = parse_feed(request, &content)?;
        debug!(series = %request.key, "Read {} bars from {}", bars.len(), path.display());
        Ok(bars)
    }
}
