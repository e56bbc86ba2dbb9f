/// Periodic sync: every asset class re-synced on its own cadence until cancelled
use chrono::Utc;
use futures_util::future::try_join_all;
use std::path::Path;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::broker::BarFetcher;
use crate::data::bar_store::BarStore;
use crate::data::historical_sync::{save_sync_report, SyncEngine};
use crate::error::Result;
use crate::types::{AssetType, ScheduleSettings, SeriesKey};
use crate::utils::CancelToken;

/// Tuples of one asset class and how often they are synced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub asset_type: AssetType,
    pub keys: Vec<SeriesKey>,
    pub every: Duration,
}

/// Groups tuples by asset class, one job per class that has any
pub fn jobs_for(keys: &[SeriesKey], schedule: &ScheduleSettings) -> Vec<SyncJob> {
    AssetType::all()
        .into_iter()
        .filter_map(|asset_type| {
            let keys: Vec<SeriesKey> = keys
                .iter()
                .filter(|k| k.asset_type == asset_type)
                .cloned()
                .collect();
            (!keys.is_empty()).then(|| SyncJob {
                asset_type,
                keys,
                every: schedule.interval_for(asset_type),
            })
        })
        .collect()
}

/// Totals over every run a schedule performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub runs: usize,
    pub incomplete_runs: usize,
    pub bars_written: usize,
}

impl ScheduleSummary {
    fn merge(self, other: ScheduleSummary) -> Self {
        ScheduleSummary {
            runs: self.runs + other.runs,
            incomplete_runs: self.incomplete_runs + other.incomplete_runs,
            bars_written: self.bars_written + other.bars_written,
        }
    }
}

impl<S: BarStore, F: BarFetcher> SyncEngine<S, F> {
    /// Run every job on its interval until `cancel` fires. The first run of
    /// each job starts immediately; a run that overruns its interval delays
    /// the next one instead of stacking. A fatal store error stops all jobs.
    pub async fn run_scheduled(
        &self,
        jobs: &[SyncJob],
        cancel: &CancelToken,
        report_dir: Option<&Path>,
    ) -> Result<ScheduleSummary> {
        info!("⏰ Scheduling {} sync jobs", jobs.len());
        let summaries =
            try_join_all(jobs.iter().map(|job| self.run_job(job, cancel, report_dir))).await?;
        let summary = summaries
            .into_iter()
            .fold(ScheduleSummary::default(), ScheduleSummary::merge);

        info!(
            "🛑 Schedule stopped after {} runs ({} incomplete), {} bars written",
            summary.runs, summary.incomplete_runs, summary.bars_written
        );
        Ok(summary)
    }

    async fn run_job(
        &self,
        job: &SyncJob,
        cancel: &CancelToken,
        report_dir: Option<&Path>,
    ) -> Result<ScheduleSummary> {
        info!(
            "   {}: {} tuples every {:?}",
            job.asset_type,
            job.keys.len(),
            job.every
        );

        let mut ticker = tokio::time::interval(job.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = ScheduleSummary::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.run(&job.keys, Utc::now(), None, cancel).await?;
            report.log_summary();
            if let Some(dir) = report_dir {
                if let Err(e) = save_sync_report(&report, dir).await {
                    warn!("⚠️  Could not save report for {}: {}", job.asset_type, e);
                }
            }

            summary.runs += 1;
            summary.bars_written += report.bars_written();
            if report.has_failures() || report.cancelled {
                summary.incomplete_runs += 1;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FetchRequest;
    use crate::data::bar_store::test_support::*;
    use crate::data::MemoryBarStore;
    use crate::error::{FetchError, SyncError};
    use crate::types::{Bar, GapRecord, PerAsset, SyncSettings, Timeframe};
    use chrono::DateTime;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves the same three recent hourly bars on every call
    struct RecentBars {
        bars: Vec<Bar>,
        calls: AtomicU32,
    }

    impl RecentBars {
        fn new(key: &SeriesKey) -> Self {
            let latest = Timeframe::OneHour.align(Utc::now());
            let bars = (0..3)
                .map(|i| bar_at(key, latest - hours(2 - i), 100.0 + i as f64))
                .collect();
            RecentBars {
                bars,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl BarFetcher for RecentBars {
        async fn fetch(&self, request: &FetchRequest) -> std::result::Result<Vec<Bar>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .bars
                .iter()
                .filter(|b| b.key() == request.key && b.timestamp >= request.start)
                .cloned()
                .collect())
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            requests_per_second: 1_000,
            ..SyncSettings::default()
        }
    }

    #[test]
    fn test_jobs_grouped_by_asset_class() {
        let eurusd = SeriesKey::new("EURUSD", AssetType::Forex, Timeframe::OneHour);
        let eth = SeriesKey::new("ETHUSDT", AssetType::Crypto, Timeframe::OneDay);
        let schedule = ScheduleSettings {
            interval_minutes: PerAsset {
                forex: Some(30),
                ..PerAsset::default()
            },
        };

        let jobs = jobs_for(&[btc_hourly(), eurusd.clone(), eth.clone()], &schedule);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].asset_type, AssetType::Forex);
        assert_eq!(jobs[0].keys, vec![eurusd]);
        assert_eq!(jobs[0].every, Duration::from_secs(1_800));
        assert_eq!(jobs[1].asset_type, AssetType::Crypto);
        assert_eq!(jobs[1].keys, vec![btc_hourly(), eth]);
        assert_eq!(jobs[1].every, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_repeats_until_cancelled() {
        let key = btc_hourly();
        let engine = SyncEngine::new(MemoryBarStore::new(), RecentBars::new(&key), settings());
        let jobs = vec![SyncJob {
            asset_type: AssetType::Crypto,
            keys: vec![key.clone()],
            every: Duration::from_millis(20),
        }];

        let cancel = CancelToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            stopper.cancel();
        });

        let dir = tempfile::tempdir().unwrap();
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run_scheduled(&jobs, &cancel, Some(dir.path())),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(summary.runs >= 2);
        // later runs find nothing new
        assert_eq!(summary.bars_written, 3);
        assert_eq!(engine.store().total_count().await, 3);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), summary.runs);
    }

    #[tokio::test]
    async fn test_cancelled_schedule_never_runs() {
        let key = btc_hourly();
        let engine = SyncEngine::new(MemoryBarStore::new(), RecentBars::new(&key), settings());
        let jobs = jobs_for(&[key], &ScheduleSettings::default());
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = engine.run_scheduled(&jobs, &cancel, None).await.unwrap();
        assert_eq!(summary, ScheduleSummary::default());
        assert_eq!(engine.fetcher().calls.load(Ordering::SeqCst), 0);
    }

    /// Store that refuses every call
    struct DownStore;

    fn down<T: Send>() -> impl Future<Output = crate::error::Result<T>> + Send {
        async { Err(SyncError::StoreUnavailable("unable to open database file".to_string())) }
    }

    impl BarStore for DownStore {
        fn upsert(&self, _: &[Bar]) -> impl Future<Output = crate::error::Result<usize>> + Send {
            down()
        }
        fn latest_timestamp(
            &self,
            _: &SeriesKey,
        ) -> impl Future<Output = crate::error::Result<Option<DateTime<Utc>>>> + Send {
            down()
        }
        fn earliest_timestamp(
            &self,
            _: &SeriesKey,
        ) -> impl Future<Output = crate::error::Result<Option<DateTime<Utc>>>> + Send {
            down()
        }
        fn read_range(
            &self,
            _: &SeriesKey,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> impl Future<Output = crate::error::Result<Vec<Bar>>> + Send {
            down()
        }
        fn record_gaps(
            &self,
            _: &SeriesKey,
            _: &[GapRecord],
        ) -> impl Future<Output = crate::error::Result<()>> + Send {
            down()
        }
        fn gaps_in_range(
            &self,
            _: &SeriesKey,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> impl Future<Output = crate::error::Result<Vec<GapRecord>>> + Send {
            down()
        }
        fn earliest_pending_gap(
            &self,
            _: &SeriesKey,
            _: u32,
        ) -> impl Future<Output = crate::error::Result<Option<DateTime<Utc>>>> + Send {
            down()
        }
        fn list_series(&self) -> impl Future<Output = crate::error::Result<Vec<SeriesKey>>> + Send {
            down()
        }
    }

    #[tokio::test]
    async fn test_store_outage_stops_schedule() {
        let key = btc_hourly();
        let engine = SyncEngine::new(DownStore, RecentBars::new(&key), settings());
        let jobs = jobs_for(&[key], &ScheduleSettings::default());

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run_scheduled(&jobs, &CancelToken::new(), None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
