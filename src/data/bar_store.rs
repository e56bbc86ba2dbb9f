/// Bar storage contract plus an in-memory implementation
/// Per-series locking: writers to different series never wait on each other
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::data::series::Series;
use crate::error::Result;
use crate::types::{Bar, GapRecord, GapStatus, SeriesKey};

/// Keyed bar table. Implementations must make `upsert` atomic per call and
/// must not serialize writers of disjoint series behind one lock.
pub trait BarStore: Send + Sync {
    /// Insert or correct bars; returns how many rows actually changed.
    /// A bar identical to the stored one is not counted.
    fn upsert(&self, bars: &[Bar]) -> impl Future<Output = Result<usize>> + Send;

    fn latest_timestamp(
        &self,
        key: &SeriesKey,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    fn earliest_timestamp(
        &self,
        key: &SeriesKey,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Bars with `start <= timestamp <= end`, ascending
    fn read_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send;

    /// Insert or replace gap records for a series
    fn record_gaps(
        &self,
        key: &SeriesKey,
        gaps: &[GapRecord],
    ) -> impl Future<Output = Result<()>> + Send;

    fn gaps_in_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<GapRecord>>> + Send;

    /// Oldest pending gap still below the retry budget
    fn earliest_pending_gap(
        &self,
        key: &SeriesKey,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Every series with at least one stored bar
    fn list_series(&self) -> impl Future<Output = Result<Vec<SeriesKey>>> + Send;

    fn load_series(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Series>> + Send {
        async move {
            let bars = self.read_range(key, start, end).await?;
            let gaps = self.gaps_in_range(key, start, end).await?;
            Ok(Series::new(key.clone(), bars, gaps))
        }
    }
}

impl<S: BarStore> BarStore for Arc<S> {
    fn upsert(&self, bars: &[Bar]) -> impl Future<Output = Result<usize>> + Send {
        S::upsert(self, bars)
    }

    fn latest_timestamp(
        &self,
        key: &SeriesKey,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send {
        S::latest_timestamp(self, key)
    }

    fn earliest_timestamp(
        &self,
        key: &SeriesKey,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send {
        S::earliest_timestamp(self, key)
    }

    fn read_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Bar>>> + Send {
        S::read_range(self, key, start, end)
    }

    fn record_gaps(
        &self,
        key: &SeriesKey,
        gaps: &[GapRecord],
    ) -> impl Future<Output = Result<()>> + Send {
        S::record_gaps(self, key, gaps)
    }

    fn gaps_in_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<GapRecord>>> + Send {
        S::gaps_in_range(self, key, start, end)
    }

    fn earliest_pending_gap(
        &self,
        key: &SeriesKey,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send {
        S::earliest_pending_gap(self, key, max_attempts)
    }

    fn list_series(&self) -> impl Future<Output = Result<Vec<SeriesKey>>> + Send {
        S::list_series(self)
    }
}

#[derive(Debug, Default)]
struct SeriesData {
    bars: BTreeMap<DateTime<Utc>, Bar>,
    gaps: BTreeMap<DateTime<Utc>, GapRecord>,
}

/// In-memory bar store: one lock per series
#[derive(Default)]
pub struct MemoryBarStore {
    series: RwLock<HashMap<SeriesKey, Arc<RwLock<SeriesData>>>>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn existing(&self, key: &SeriesKey) -> Option<Arc<RwLock<SeriesData>>> {
        let series = self.series.read().await;
        series.get(key).cloned()
    }

    async fn handle(&self, key: &SeriesKey) -> Arc<RwLock<SeriesData>> {
        if let Some(handle) = self.existing(key).await {
            return handle;
        }
        let mut series = self.series.write().await;
        Arc::clone(series.entry(key.clone()).or_default())
    }

    /// Total bars across all series
    pub async fn total_count(&self) -> usize {
        let handles: Vec<_> = {
            let series = self.series.read().await;
            series.values().cloned().collect()
        };
        let mut total = 0;
        for handle in handles {
            total += handle.read().await.bars.len();
        }
        total
    }
}

impl BarStore for MemoryBarStore {
    async fn upsert(&self, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut grouped: BTreeMap<SeriesKey, Vec<&Bar>> = BTreeMap::new();
        for bar in bars {
            grouped.entry(bar.key()).or_default().push(bar);
        }

        // Lock every touched series (in key order) before writing so the
        // whole call lands at once
        let mut guards: Vec<(Vec<&Bar>, OwnedRwLockWriteGuard<SeriesData>)> = Vec::new();
        for (key, series_bars) in grouped {
            let handle = self.handle(&key).await;
            guards.push((series_bars, handle.write_owned().await));
        }

        let mut written = 0;
        for (series_bars, mut data) in guards {
            for bar in series_bars {
                let unchanged = data
                    .bars
                    .get(&bar.timestamp)
                    .is_some_and(|stored| stored.same_values(bar));
                if unchanged {
                    continue;
                }
                data.gaps.remove(&bar.timestamp);
                data.bars.insert(bar.timestamp, bar.clone());
                written += 1;
            }
        }

        debug!("Memory store upsert: {} of {} bars written", written, bars.len());
        Ok(written)
    }

    async fn latest_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>> {
        let Some(handle) = self.existing(key).await else {
            return Ok(None);
        };
        let data = handle.read().await;
        Ok(data.bars.keys().next_back().copied())
    }

    async fn earliest_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>> {
        let Some(handle) = self.existing(key).await else {
            return Ok(None);
        };
        let data = handle.read().await;
        Ok(data.bars.keys().next().copied())
    }

    async fn read_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        if start > end {
            return Ok(Vec::new());
        }
        let Some(handle) = self.existing(key).await else {
            return Ok(Vec::new());
        };
        let data = handle.read().await;
        Ok(data.bars.range(start..=end).map(|(_, bar)| bar.clone()).collect())
    }

    async fn record_gaps(&self, key: &SeriesKey, gaps: &[GapRecord]) -> Result<()> {
        if gaps.is_empty() {
            return Ok(());
        }
        let handle = self.handle(key).await;
        let mut data = handle.write().await;
        for gap in gaps {
            if data.bars.contains_key(&gap.timestamp) {
                continue;
            }
            data.gaps.insert(gap.timestamp, gap.clone());
        }
        Ok(())
    }

    async fn gaps_in_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GapRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        let Some(handle) = self.existing(key).await else {
            return Ok(Vec::new());
        };
        let data = handle.read().await;
        Ok(data.gaps.range(start..=end).map(|(_, gap)| gap.clone()).collect())
    }

    async fn earliest_pending_gap(
        &self,
        key: &SeriesKey,
        max_attempts: u32,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(handle) = self.existing(key).await else {
            return Ok(None);
        };
        let data = handle.read().await;
        Ok(data
            .gaps
            .values()
            .find(|gap| gap.status == GapStatus::Pending && gap.attempts < max_attempts)
            .map(|gap| gap.timestamp))
    }

    async fn list_series(&self) -> Result<Vec<SeriesKey>> {
        let entries: Vec<_> = {
            let series = self.series.read().await;
            series
                .iter()
                .map(|(key, handle)| (key.clone(), Arc::clone(handle)))
                .collect()
        };

        let mut keys = Vec::new();
        for (key, handle) in entries {
            if !handle.read().await.bars.is_empty() {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{AssetType, Timeframe};
    use chrono::{Duration, TimeZone};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap()
    }

    pub fn bar_at(key: &SeriesKey, timestamp: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            symbol: key.symbol.clone(),
            asset_type: key.asset_type,
            timeframe: key.timeframe,
            timestamp,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000_000.0,
        }
    }

    /// Consecutive bars from `t0()` with the given closes
    pub fn bars_from_closes(key: &SeriesKey, closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| bar_at(key, t0() + key.timeframe.duration() * i as i32, *close))
            .collect()
    }

    pub fn btc_hourly() -> SeriesKey {
        SeriesKey::new("BTCUSDT", AssetType::Crypto, Timeframe::OneHour)
    }

    pub fn hours(n: i64) -> Duration {
        Duration::hours(n)
    }
}
