/// MA crossover signals recomputed from stored history
/// Nothing is cached between calls; every evaluation reads the store afresh
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use crate::data::{BarStore, SeriesDefect};
use crate::error::Result;
use crate::strategy::liquidity::{AnnotatedEvent, Liquidity, LiquidityFilter};
use crate::strategy::ma_crossover::{MaCrossover, MaSignal};
use crate::strategy::regime::RegimeSummary;
use crate::types::{LiquiditySettings, MaWindows, PerAsset, SeriesKey};

#[derive(Debug, Clone, Serialize)]
pub struct SignalReport {
    pub key: SeriesKey,
    pub as_of: DateTime<Utc>,
    pub bars: usize,
    /// `None` until the slow window is filled
    pub signal: Option<MaSignal>,
    pub events: Vec<AnnotatedEvent>,
    pub latest_liquidity: Liquidity,
    pub regime: Option<RegimeSummary>,
    pub defects: Vec<SeriesDefect>,
}

impl SignalReport {
    /// Annotated event on the most recent bar, if any
    pub fn fresh_event(&self) -> Option<&AnnotatedEvent> {
        self.events
            .last()
            .filter(|e| e.event.index + 1 == self.bars)
    }
}

impl fmt::Display for SignalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} ({} bars)", self.key, self.as_of, self.bars)?;
        match (&self.signal, &self.regime) {
            (Some(signal), Some(regime)) => {
                write!(
                    f,
                    ": {} since {}, fast {:.4} slow {:.4}, {} close {:.4} ({:+.2}%)",
                    signal.direction.as_str(),
                    signal
                        .changed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    signal.fast_ma,
                    signal.slow_ma,
                    regime.trend.as_str(),
                    regime.last_price,
                    regime.change_percent
                )?;
            }
            _ => write!(f, ": not enough history")?,
        }
        if let Liquidity::Illiquid(reason) = &self.latest_liquidity {
            write!(f, " [illiquid: {}]", reason)?;
        }
        if !self.defects.is_empty() {
            write!(f, " [{} unresolved periods]", self.defects.len())?;
        }
        Ok(())
    }
}

pub struct SignalMonitor<S: BarStore> {
    store: S,
    windows: PerAsset<MaWindows>,
    filter: LiquidityFilter,
}

impl<S: BarStore> SignalMonitor<S> {
    pub fn new(store: S, windows: PerAsset<MaWindows>, liquidity: LiquiditySettings) -> Self {
        Self {
            store,
            windows,
            filter: LiquidityFilter::new(liquidity),
        }
    }

    /// Signal for one series using every stored bar up to `now`.
    /// Returns `None` when the series has no bars.
    pub async fn evaluate(&self, key: &SeriesKey, now: DateTime<Utc>) -> Result<Option<SignalReport>> {
        let calc = MaCrossover::from_windows(*self.windows.get(key.asset_type))?;
        let series = self
            .store
            .load_series(key, DateTime::<Utc>::UNIX_EPOCH, now)
            .await?;

        let Some(latest) = series.bars.last() else {
            debug!("{}: no stored bars", key);
            return Ok(None);
        };

        let defects = series.defects();
        if !defects.is_empty() {
            warn!("{}: {} unresolved periods in history", key, defects.len());
        }

        let signal = calc.evaluate(&series.bars);
        let (events, regime) = match &signal {
            Some(signal) => (
                self.filter.annotate(&signal.events, &series.bars),
                Some(RegimeSummary::from_signal(signal, &series.bars)),
            ),
            None => {
                warn!(
                    "{}: Not enough bars ({} < {})",
                    key,
                    series.len(),
                    calc.slow()
                );
                (Vec::new(), None)
            }
        };

        let report = SignalReport {
            key: key.clone(),
            as_of: latest.timestamp,
            bars: series.len(),
            latest_liquidity: self.filter.classify(latest),
            signal,
            events,
            regime,
            defects,
        };

        if let Some(fresh) = report.fresh_event() {
            info!(
                "🎯 CROSSOVER: {} {} @ {} (fast {:.4}, slow {:.4}, close {:.4}){}",
                key,
                fresh.event.direction.as_str(),
                fresh.event.timestamp,
                fresh.event.fast,
                fresh.event.slow,
                fresh.event.close,
                if fresh.low_confidence { " ⚠️ low confidence" } else { "" }
            );
        }

        Ok(Some(report))
    }

    /// Evaluates `keys`, or every stored series when `keys` is `None`
    pub async fn evaluate_all(
        &self,
        keys: Option<&[SeriesKey]>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SignalReport>> {
        let keys = match keys {
            Some(keys) => keys.to_vec(),
            None => self.store.list_series().await?,
        };

        let mut reports = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(report) = self.evaluate(key, now).await? {
                reports.push(report);
            }
        }
        info!("📊 Evaluated {} of {} series", reports.len(), keys.len());
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::test_support::*;
    use crate::data::MemoryBarStore;
    use crate::strategy::ma_crossover::CrossDirection;
    use crate::strategy::regime::TrendStatus;
    use crate::types::{AssetType, Timeframe};

    // opening tie, then a bullish crossing at index 4 and a bearish one at 7
    const CLOSES: [f64; 9] = [100.0, 100.0, 100.0, 100.0, 120.0, 140.0, 160.0, 90.0, 90.0];

    fn monitor(store: MemoryBarStore) -> SignalMonitor<MemoryBarStore> {
        let windows = PerAsset {
            crypto: MaWindows { fast: 2, slow: 4 },
            ..PerAsset::default()
        };
        SignalMonitor::new(store, windows, LiquiditySettings::default())
    }

    fn now() -> DateTime<Utc> {
        t0() + hours(100)
    }

    #[tokio::test]
    async fn test_evaluate_from_store() {
        let store = MemoryBarStore::new();
        store.upsert(&bars_from_closes(&btc_hourly(), &CLOSES)).await.unwrap();
        let monitor = monitor(store);

        let report = monitor.evaluate(&btc_hourly(), now()).await.unwrap().unwrap();
        assert_eq!(report.bars, 9);
        assert_eq!(report.as_of, t0() + hours(8));
        assert!(report.defects.is_empty());
        assert!(report.latest_liquidity.is_liquid());

        let signal = report.signal.as_ref().unwrap();
        assert_eq!(signal.direction, CrossDirection::Bearish);
        assert_eq!(signal.changed_at, Some(t0() + hours(7)));

        assert_eq!(report.events.len(), 2);
        assert!(report.events.iter().all(|e| !e.low_confidence));
        assert!(report.fresh_event().is_none());

        let regime = report.regime.as_ref().unwrap();
        assert_eq!(regime.trend, TrendStatus::StrongBearish);
        assert_eq!(regime.support, Some(105.0));
        assert_eq!(regime.resistance, Some(127.5));
    }

    #[tokio::test]
    async fn test_history_cut_at_now() {
        let store = MemoryBarStore::new();
        store.upsert(&bars_from_closes(&btc_hourly(), &CLOSES)).await.unwrap();
        let monitor = monitor(store);

        // as of the bearish bar the event is the freshest one
        let report = monitor
            .evaluate(&btc_hourly(), t0() + hours(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.bars, 8);
        let fresh = report.fresh_event().unwrap();
        assert_eq!(fresh.event.direction, CrossDirection::Bearish);
    }

    #[tokio::test]
    async fn test_short_history_and_defects() {
        let store = MemoryBarStore::new();
        let mut bars = bars_from_closes(&btc_hourly(), &[100.0, 101.0, 102.0]);
        bars.remove(1);
        store.upsert(&bars).await.unwrap();
        let monitor = monitor(store);

        let report = monitor.evaluate(&btc_hourly(), now()).await.unwrap().unwrap();
        assert!(report.signal.is_none());
        assert!(report.regime.is_none());
        assert!(report.events.is_empty());
        assert_eq!(
            report.defects,
            vec![SeriesDefect::Missing { timestamp: t0() + hours(1) }]
        );
        assert!(report.to_string().contains("not enough history"));
    }

    #[tokio::test]
    async fn test_evaluate_all() {
        let store = MemoryBarStore::new();
        store.upsert(&bars_from_closes(&btc_hourly(), &CLOSES)).await.unwrap();
        let eth = SeriesKey::new("ETHUSDT", AssetType::Crypto, Timeframe::OneHour);
        store.upsert(&bars_from_closes(&eth, &[50.0; 6])).await.unwrap();
        let monitor = monitor(store);

        let reports = monitor.evaluate_all(None, now()).await.unwrap();
        assert_eq!(reports.len(), 2);

        let missing = SeriesKey::new("SOLUSDT", AssetType::Crypto, Timeframe::OneHour);
        let reports = monitor
            .evaluate_all(Some(&[missing, eth.clone()][..]), now())
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].key, eth);
        assert_eq!(reports[0].signal.as_ref().unwrap().direction, CrossDirection::None);
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let store = MemoryBarStore::new();
        store.upsert(&bars_from_closes(&btc_hourly(), &CLOSES)).await.unwrap();
        let report = monitor(store)
            .evaluate(&btc_hourly(), now())
            .await
            .unwrap()
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["signal"]["direction"], "bearish");
        assert_eq!(json["regime"]["trend"], "STRONG_BEARISH");
        assert_eq!(json["events"][0]["direction"], "bullish");
        assert_eq!(json["latest_liquidity"]["state"], "liquid");
    }
}
