/// Incremental historical bar synchronization
/// Fetches only what is new (plus a small overlap) for each
/// (asset type, symbol, timeframe) tuple and merges it into the bar store
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BarFetcher, FetchRequest};
use crate::data::bar_store::BarStore;
use crate::data::series::missing_periods;
use crate::data::validation::{validate_bars, BarRejection};
use crate::error::{FetchError, Result};
use crate::types::{Bar, GapRecord, GapStatus, SeriesKey, SyncSettings};
use crate::utils::{CancelToken, RateLimiter, RetryPolicy};

/// Outcome of one tuple in a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TupleStatus {
    Succeeded,
    RetriedThenSucceeded { attempts: u32 },
    Failed { reason: String, permanent: bool },
    Skipped { reason: String },
    Cancelled,
}

impl TupleStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TupleStatus::Succeeded | TupleStatus::RetriedThenSucceeded { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TupleReport {
    pub key: SeriesKey,
    #[serde(flatten)]
    pub status: TupleStatus,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub bars_fetched: usize,
    pub bars_written: usize,
    pub rejected: Vec<BarRejection>,
    pub gaps_closed: usize,
    pub gaps_pending: usize,
    pub duration_ms: u64,
}

impl TupleReport {
    fn new(key: SeriesKey, status: TupleStatus) -> Self {
        TupleReport {
            key,
            status,
            window_start: None,
            window_end: None,
            attempts: 0,
            bars_fetched: 0,
            bars_written: 0,
            rejected: Vec::new(),
            gaps_closed: 0,
            gaps_pending: 0,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub tuples: Vec<TupleReport>,
}

impl SyncReport {
    fn count(&self, pred: impl Fn(&TupleStatus) -> bool) -> usize {
        self.tuples.iter().filter(|t| pred(&t.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TupleStatus::is_success)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TupleStatus::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn bars_written(&self) -> usize {
        self.tuples.iter().map(|t| t.bars_written).sum()
    }

    pub fn log_summary(&self) {
        info!("📊 Sync run {} summary:", self.run_id);
        info!(
            "   Tuples: {} total, {} succeeded, {} failed",
            self.tuples.len(),
            self.succeeded(),
            self.failed()
        );
        info!("   Bars written: {}", self.bars_written());
        if self.cancelled {
            warn!("   Run was cancelled; remaining tuples skipped");
        }

        for tuple in &self.tuples {
            match &tuple.status {
                TupleStatus::Succeeded => debug!(
                    "   ✅ {}: {} fetched, {} written",
                    tuple.key, tuple.bars_fetched, tuple.bars_written
                ),
                TupleStatus::RetriedThenSucceeded { attempts } => info!(
                    "   ✅ {}: {} written after {} attempts",
                    tuple.key, tuple.bars_written, attempts
                ),
                TupleStatus::Failed { reason, .. } => {
                    warn!("   ❌ {}: {}", tuple.key, reason)
                }
                TupleStatus::Skipped { reason } => info!("   ⏭️  {}: {}", tuple.key, reason),
                TupleStatus::Cancelled => debug!("   {}: cancelled", tuple.key),
            }
        }
    }
}

/// Persist a run report as pretty JSON under `dir`
pub async fn save_sync_report(report: &SyncReport, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let filename = dir.join(format!(
        "sync_report_{}_{}.json",
        report.started_at.format("%Y%m%d_%H%M%S"),
        report.run_id.simple()
    ));

    let json = serde_json::to_string_pretty(report)?;
    tokio::fs::write(&filename, json).await?;

    info!("💾 Saved sync report to {}", filename.display());
    Ok(filename)
}

type InFlight = Arc<Mutex<HashSet<SeriesKey>>>;

/// Marks a tuple as being synced; released on drop
struct InFlightGuard {
    in_flight: InFlight,
    key: SeriesKey,
}

impl InFlightGuard {
    fn acquire(in_flight: &InFlight, key: &SeriesKey) -> Option<Self> {
        let mut set = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(in_flight),
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
    }
}

/// Fetch window for one tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub struct SyncEngine<S, F> {
    store: S,
    fetcher: F,
    settings: SyncSettings,
    retry: RetryPolicy,
    fetch_timeout: std::time::Duration,
    limiter: Arc<RateLimiter>,
    in_flight: InFlight,
}

impl<S: BarStore, F: BarFetcher> SyncEngine<S, F> {
    pub fn new(store: S, fetcher: F, settings: SyncSettings) -> Self {
        SyncEngine {
            retry: RetryPolicy::from_settings(&settings),
            fetch_timeout: std::time::Duration::from_secs(settings.fetch_timeout_sec),
            limiter: Arc::new(RateLimiter::new(settings.requests_per_second)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            store,
            fetcher,
            settings,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Share a limiter with providers that issue several requests per fetch
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Sync every tuple in `keys`. Tuple failures are recorded in the report;
    /// only a fatal store error aborts the run.
    pub async fn run(
        &self,
        keys: &[SeriesKey],
        now: DateTime<Utc>,
        days_back: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut seen = HashSet::new();
        let unique: Vec<SeriesKey> = keys
            .iter()
            .filter(|k| seen.insert((*k).clone()))
            .cloned()
            .collect();
        if unique.len() < keys.len() {
            debug!("Collapsed {} duplicate tuples", keys.len() - unique.len());
        }

        info!(
            "🔄 Sync run {}: {} tuples, concurrency {}",
            run_id,
            unique.len(),
            self.settings.max_concurrency
        );

        let mut tuples: Vec<TupleReport> = stream::iter(
            unique
                .into_iter()
                .map(|key| self.sync_tuple(key, now, days_back, cancel)),
        )
        .buffer_unordered(self.settings.max_concurrency.max(1))
        .try_collect()
        .await
        .inspect_err(|e| error!("❌ Sync run {} aborted: {}", run_id, e))?;

        tuples.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
            tuples,
        })
    }

    /// Fetch window: a few bars back from the latest stored bar, or the
    /// history depth for an empty series; pulled back to the oldest pending
    /// gap still worth retrying. Never starts before the history depth, so a
    /// long-stale series restarts there instead of at its last bar.
    pub async fn fetch_window(
        &self,
        key: &SeriesKey,
        latest: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        days_back: Option<u32>,
    ) -> Result<SyncWindow> {
        let floor = now - Duration::days(self.settings.days_back_for(key, days_back) as i64);
        let base = match latest {
            Some(latest) => {
                let resume = latest - key.timeframe.duration() * self.settings.overlap_bars as i32;
                if resume < floor {
                    info!(
                        series = %key,
                        "Latest bar {} is beyond history depth, restarting at {}",
                        latest,
                        floor
                    );
                }
                resume.max(floor)
            }
            None => floor,
        };

        let start = match self
            .store
            .earliest_pending_gap(key, self.settings.max_gap_attempts)
            .await?
        {
            Some(gap) if gap < base => gap.max(floor),
            _ => base,
        };

        Ok(SyncWindow {
            start: key.timeframe.align(start),
            end: now,
        })
    }

    async fn sync_tuple(
        &self,
        key: SeriesKey,
        now: DateTime<Utc>,
        days_back: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<TupleReport> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &key) else {
            return Ok(TupleReport::new(
                key,
                TupleStatus::Skipped {
                    reason: "sync already in progress".to_string(),
                },
            ));
        };

        if cancel.is_cancelled() {
            return Ok(TupleReport::new(key, TupleStatus::Cancelled));
        }

        let started = Instant::now();
        let latest = self.store.latest_timestamp(&key).await?;
        let window = self.fetch_window(&key, latest, now, days_back).await?;

        let mut report = TupleReport::new(key.clone(), TupleStatus::Succeeded);
        report.window_start = Some(window.start);
        report.window_end = Some(window.end);

        if window.start > window.end {
            report.status = TupleStatus::Skipped {
                reason: format!("window starts after {}", window.end),
            };
            return Ok(report);
        }

        let request = FetchRequest {
            key: key.clone(),
            start: window.start,
            end: window.end,
        };

        let bars = match self.fetch_with_retry(&request).await {
            Ok((bars, attempts)) => {
                report.attempts = attempts;
                bars
            }
            Err((e, attempts)) => {
                report.attempts = attempts;
                report.status = TupleStatus::Failed {
                    reason: e.message().to_string(),
                    permanent: !e.is_transient(),
                };
                report.duration_ms = started.elapsed().as_millis() as u64;
                warn!(series = %key, "❌ Fetch failed after {} attempts: {}", attempts, e);
                return Ok(report);
            }
        };

        report.bars_fetched = bars.len();
        let batch = validate_bars(&request, bars);
        report.bars_written = self.store.upsert(&batch.accepted).await?;
        report.rejected = batch.rejected;

        let (closed, pending) = self.reconcile_gaps(&key, window).await?;
        report.gaps_closed = closed;
        report.gaps_pending = pending;

        if report.attempts > 1 {
            report.status = TupleStatus::RetriedThenSucceeded {
                attempts: report.attempts,
            };
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            series = %key,
            "✅ {} fetched, {} written, {} rejected, gaps {} closed / {} pending",
            report.bars_fetched,
            report.bars_written,
            report.rejected.len(),
            closed,
            pending
        );
        Ok(report)
    }

    /// Fetch under a timeout, retrying transient failures with backoff
    async fn fetch_with_retry(
        &self,
        request: &FetchRequest,
    ) -> std::result::Result<(Vec<Bar>, u32), (FetchError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let outcome = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(request)).await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Transient(format!(
                    "fetch timed out after {:?}",
                    self.fetch_timeout
                ))),
            };

            match outcome {
                Ok(bars) => return Ok((bars, attempt)),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        series = %request.key,
                        "⚠️  Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Record every expected period without a bar between the scan start
    /// and the latest stored bar. Returns (closed, pending) counts.
    async fn reconcile_gaps(&self, key: &SeriesKey, window: SyncWindow) -> Result<(usize, usize)> {
        let (Some(earliest), Some(latest)) = (
            self.store.earliest_timestamp(key).await?,
            self.store.latest_timestamp(key).await?,
        ) else {
            return Ok((0, 0));
        };

        let scan_start = window.start.max(earliest);
        if scan_start > latest {
            return Ok((0, 0));
        }

        let bars = self.store.read_range(key, scan_start, latest).await?;
        let missing = missing_periods(key.timeframe, &bars, scan_start, latest);
        if missing.is_empty() {
            return Ok((0, 0));
        }

        let known: HashMap<DateTime<Utc>, GapRecord> = self
            .store
            .gaps_in_range(key, scan_start, latest)
            .await?
            .into_iter()
            .map(|g| (g.timestamp, g))
            .collect();

        let mut updates = Vec::new();
        let (mut closed, mut pending) = (0, 0);
        for period in missing {
            let previous = known.get(&period);
            if self.fetcher.confirm_closed(key, period) {
                closed += 1;
                if previous.is_some_and(|g| g.status == GapStatus::Closed) {
                    continue;
                }
                updates.push(GapRecord {
                    timestamp: period,
                    status: GapStatus::Closed,
                    attempts: previous.map_or(1, |g| g.attempts + 1),
                });
            } else {
                pending += 1;
                updates.push(GapRecord {
                    timestamp: period,
                    status: GapStatus::Pending,
                    attempts: previous.map_or(1, |g| g.attempts.saturating_add(1)),
                });
            }
        }

        if pending > 0 {
            debug!(series = %key, "{} periods still pending", pending);
        }
        self.store.record_gaps(key, &updates).await?;
        Ok((closed, pending))
    }
}
