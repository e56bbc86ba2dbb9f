/// Moving average crossover detector
///
/// Both averages are simple moving averages of closes and are defined only
/// once `slow` bars are available. A bullish event fires on the bar where
/// fast moves above slow after the last non-tie relation had fast below slow
/// (or when no relation has been established yet); bearish is symmetric.
/// Ties never fire and leave the last relation untouched, so events always
/// alternate. An event on the very first bar with both averages is marked
/// `initial`: it reports the opening relation, not an observed crossing.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{Result, SyncError};
use crate::strategy::indicators::sma_at;
use crate::types::{Bar, MaWindows};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossDirection {
    None,
    Bullish,
    Bearish,
}

impl CrossDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossDirection::None => "none",
            CrossDirection::Bullish => "bullish",
            CrossDirection::Bearish => "bearish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossoverEvent {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub direction: CrossDirection,
    pub fast: f64,
    pub slow: f64,
    pub close: f64,
    pub initial: bool,
}

/// Crossover state as of the last bar
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaSignal {
    pub fast_window: usize,
    pub slow_window: usize,
    pub as_of: DateTime<Utc>,
    pub last_close: f64,
    pub fast_ma: f64,
    pub slow_ma: f64,
    pub direction: CrossDirection,
    pub changed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub events: Vec<CrossoverEvent>,
}

impl MaSignal {
    pub fn last_event(&self) -> Option<&CrossoverEvent> {
        self.events.last()
    }

    pub fn last_event_of(&self, direction: CrossDirection) -> Option<&CrossoverEvent> {
        self.events.iter().rev().find(|e| e.direction == direction)
    }

    /// Most recent observed crossing in `direction`, skipping an initial event
    pub fn last_crossing_of(&self, direction: CrossDirection) -> Option<&CrossoverEvent> {
        self.events
            .iter()
            .rev()
            .find(|e| e.direction == direction && !e.initial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaCrossover {
    fast: usize,
    slow: usize,
}

impl MaCrossover {
    pub fn new(fast: usize, slow: usize) -> Result<Self> {
        if fast == 0 || fast >= slow {
            return Err(SyncError::InvalidParameter(format!(
                "fast window ({}) must be >= 1 and < slow window ({})",
                fast, slow
            )));
        }
        Ok(MaCrossover { fast, slow })
    }

    pub fn from_windows(windows: MaWindows) -> Result<Self> {
        Self::new(windows.fast, windows.slow)
    }

    pub fn fast(&self) -> usize {
        self.fast
    }

    pub fn slow(&self) -> usize {
        self.slow
    }

    /// Lazy pass over `bars`; each call starts from scratch
    pub fn events<'a>(&self, bars: &'a [Bar]) -> CrossoverIter<'a> {
        CrossoverIter {
            closes: bars.iter().map(|b| b.close).collect(),
            bars,
            fast: self.fast,
            slow: self.slow,
            index: self.slow.saturating_sub(1),
            relation: None,
        }
    }

    /// Current direction, last change and every event; `None` with fewer
    /// than `slow` bars
    pub fn evaluate(&self, bars: &[Bar]) -> Option<MaSignal> {
        if bars.len() < self.slow {
            return None;
        }
        let last_index = bars.len() - 1;
        let last = &bars[last_index];

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let fast_ma = sma_at(&closes, last_index, self.fast)?;
        let slow_ma = sma_at(&closes, last_index, self.slow)?;

        let events: Vec<CrossoverEvent> = self.events(bars).collect();
        let (direction, changed_at) = match events.last() {
            Some(event) => (event.direction, Some(event.timestamp)),
            None => (CrossDirection::None, None),
        };

        Some(MaSignal {
            fast_window: self.fast,
            slow_window: self.slow,
            as_of: last.timestamp,
            last_close: last.close,
            fast_ma,
            slow_ma,
            direction,
            changed_at,
            events,
        })
    }
}

pub struct CrossoverIter<'a> {
    bars: &'a [Bar],
    closes: Vec<f64>,
    fast: usize,
    slow: usize,
    index: usize,
    relation: Option<Ordering>,
}

impl Iterator for CrossoverIter<'_> {
    type Item = CrossoverEvent;

    fn next(&mut self) -> Option<CrossoverEvent> {
        while self.index < self.bars.len() {
            let i = self.index;
            self.index += 1;

            let fast = sma_at(&self.closes, i, self.fast)?;
            let slow = sma_at(&self.closes, i, self.slow)?;
            let current = match fast.partial_cmp(&slow) {
                Some(Ordering::Equal) | None => continue,
                Some(ordering) => ordering,
            };

            if self.relation == Some(current) {
                continue;
            }
            self.relation = Some(current);

            let direction = if current == Ordering::Greater {
                CrossDirection::Bullish
            } else {
                CrossDirection::Bearish
            };
            return Some(CrossoverEvent {
                index: i,
                timestamp: self.bars[i].timestamp,
                direction,
                fast,
                slow,
                close: self.closes[i],
                initial: i + 1 == self.slow,
            });
        }
        None
    }
}
