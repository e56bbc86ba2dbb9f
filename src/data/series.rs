/// Gap-aware bar series and missing-period detection
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::types::{Bar, GapRecord, GapStatus, SeriesKey, Timeframe};

/// Expected period that is neither a bar nor a confirmed closure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesDefect {
    /// No bar and no gap record at all
    Missing { timestamp: DateTime<Utc> },
    /// Recorded as pending; not yet confirmed closed
    Pending {
        timestamp: DateTime<Utc>,
        attempts: u32,
    },
}

impl SeriesDefect {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SeriesDefect::Missing { timestamp } | SeriesDefect::Pending { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// Ordered bars for one series plus the gap records between them
#[derive(Debug, Clone)]
pub struct Series {
    pub key: SeriesKey,
    pub bars: Vec<Bar>,
    pub gaps: Vec<GapRecord>,
}

impl Series {
    pub fn new(key: SeriesKey, mut bars: Vec<Bar>, mut gaps: Vec<GapRecord>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        gaps.sort_by_key(|g| g.timestamp);
        Series { key, bars, gaps }
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }

    /// Expected periods between the first and last bar that lack both a bar
    /// and a `closed` gap record
    pub fn defects(&self) -> Vec<SeriesDefect> {
        let (Some(first), Some(last)) = (self.first_timestamp(), self.last_timestamp()) else {
            return Vec::new();
        };

        let gaps: HashMap<DateTime<Utc>, &GapRecord> =
            self.gaps.iter().map(|g| (g.timestamp, g)).collect();

        missing_periods(self.key.timeframe, &self.bars, first, last)
            .into_iter()
            .filter_map(|timestamp| match gaps.get(&timestamp) {
                Some(gap) if gap.status == GapStatus::Closed => None,
                Some(gap) => Some(SeriesDefect::Pending {
                    timestamp,
                    attempts: gap.attempts,
                }),
                None => Some(SeriesDefect::Missing { timestamp }),
            })
            .collect()
    }
}

/// Grid periods in `[start, end]` that have no bar in `bars`
pub fn missing_periods(
    timeframe: Timeframe,
    bars: &[Bar],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    if start > end {
        return Vec::new();
    }
    let present: BTreeSet<DateTime<Utc>> = bars.iter().map(|b| b.timestamp).collect();
    timeframe
        .periods(start, end)
        .filter(|t| !present.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::test_support::*;

    #[test]
    fn test_missing_periods() {
        let key = btc_hourly();
        let mut bars = bars_from_closes(&key, &[1.0, 2.0, 3.0, 4.0, 5.0]);
        bars.remove(3);
        bars.remove(1);

        let missing = missing_periods(key.timeframe, &bars, t0(), t0() + hours(4));
        assert_eq!(missing, vec![t0() + hours(1), t0() + hours(3)]);

        assert!(missing_periods(key.timeframe, &bars, t0() + hours(5), t0()).is_empty());
    }

    #[test]
    fn test_defects_ignore_closed_gaps() {
        let key = btc_hourly();
        let mut bars = bars_from_closes(&key, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        bars.retain(|b| b.timestamp != t0() + hours(1) && b.timestamp != t0() + hours(2));
        bars.remove(2);

        let gaps = vec![
            GapRecord {
                timestamp: t0() + hours(1),
                status: GapStatus::Closed,
                attempts: 1,
            },
            GapRecord {
                timestamp: t0() + hours(2),
                status: GapStatus::Pending,
                attempts: 2,
            },
        ];

        let series = Series::new(key, bars, gaps);
        assert_eq!(
            series.defects(),
            vec![
                SeriesDefect::Pending {
                    timestamp: t0() + hours(2),
                    attempts: 2
                },
                SeriesDefect::Missing {
                    timestamp: t0() + hours(4)
                },
            ]
        );
    }

    #[test]
    fn test_complete_series_has_no_defects() {
        let key = btc_hourly();
        let series = Series::new(key.clone(), bars_from_closes(&key, &[1.0, 2.0, 3.0]), Vec::new());
        assert!(series.defects().is_empty());
        assert!(Series::new(key, Vec::new(), Vec::new()).defects().is_empty());
    }
}
