/// Trend regime summary derived from the latest crossover state
use serde::{Deserialize, Serialize};

use crate::strategy::indicators::percent_change;
use crate::strategy::ma_crossover::{CrossDirection, MaSignal};
use crate::types::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendStatus {
    StrongBullish,
    Bullish,
    StrongBearish,
    Bearish,
    Neutral,
}

impl TrendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendStatus::StrongBullish => "STRONG_BULLISH",
            TrendStatus::Bullish => "BULLISH",
            TrendStatus::StrongBearish => "STRONG_BEARISH",
            TrendStatus::Bearish => "BEARISH",
            TrendStatus::Neutral => "NEUTRAL",
        }
    }

    /// Close against the slow average, strengthened when fast agrees
    pub fn classify(close: f64, fast: f64, slow: f64) -> Self {
        if close > slow {
            if fast > slow {
                TrendStatus::StrongBullish
            } else {
                TrendStatus::Bullish
            }
        } else if close < slow {
            if fast < slow {
                TrendStatus::StrongBearish
            } else {
                TrendStatus::Bearish
            }
        } else {
            TrendStatus::Neutral
        }
    }
}

/// Support and resistance come from observed crossings only; the initial
/// event on the first bar with both averages does not count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeSummary {
    pub last_price: f64,
    /// Percent change against the previous close; 0 with a single bar
    pub change_percent: f64,
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub trend: TrendStatus,
}

impl RegimeSummary {
    pub fn from_signal(signal: &MaSignal, bars: &[Bar]) -> Self {
        let change_percent = match bars {
            [.., previous, last] => percent_change(previous.close, last.close),
            _ => 0.0,
        };

        let support = signal
            .last_crossing_of(CrossDirection::Bullish)
            .map(|e| e.fast.min(e.slow));
        let resistance = signal
            .last_crossing_of(CrossDirection::Bearish)
            .map(|e| e.fast.max(e.slow));

        RegimeSummary {
            last_price: signal.last_close,
            change_percent,
            support,
            resistance,
            trend: TrendStatus::classify(signal.last_close, signal.fast_ma, signal.slow_ma),
        }
    }
}
