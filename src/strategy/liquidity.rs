/// Per-bar liquidity gate
use serde::Serialize;
use tracing::debug;

use crate::strategy::indicators::relative_range;
use crate::strategy::ma_crossover::CrossoverEvent;
use crate::types::{AssetType, Bar, LiquiditySettings, Timeframe};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IlliquidReason {
    LowVolume { volume: f64, minimum: f64 },
    WideRange { range: f64, maximum: f64 },
    NonPositiveClose,
}

impl std::fmt::Display for IlliquidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IlliquidReason::LowVolume { volume, minimum } => {
                write!(f, "volume {} below minimum {}", volume, minimum)
            }
            IlliquidReason::WideRange { range, maximum } => {
                write!(f, "range {:.4} above maximum {:.4}", range, maximum)
            }
            IlliquidReason::NonPositiveClose => write!(f, "non-positive close"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liquidity {
    Liquid,
    Illiquid(IlliquidReason),
}

impl Liquidity {
    pub fn is_liquid(&self) -> bool {
        matches!(self, Liquidity::Liquid)
    }
}

/// Crossover event with the liquidity of the bar it fired on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedEvent {
    #[serde(flatten)]
    pub event: CrossoverEvent,
    pub liquidity: Liquidity,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LiquidityFilter {
    settings: LiquiditySettings,
}

impl LiquidityFilter {
    pub fn new(settings: LiquiditySettings) -> Self {
        Self { settings }
    }

    /// Explicit timeframe override, else the daily minimum scaled to the
    /// bar period
    pub fn min_volume_for(&self, asset_type: AssetType, timeframe: Timeframe) -> f64 {
        let thresholds = self.settings.for_asset(asset_type);
        match thresholds.min_volume.get(&timeframe) {
            Some(minimum) => *minimum,
            None => thresholds.min_volume_per_day * timeframe.duration_minutes() as f64 / 1_440.0,
        }
    }

    pub fn classify(&self, bar: &Bar) -> Liquidity {
        if bar.close <= 0.0 {
            return Liquidity::Illiquid(IlliquidReason::NonPositiveClose);
        }

        let minimum = self.min_volume_for(bar.asset_type, bar.timeframe);
        if bar.volume < minimum {
            return Liquidity::Illiquid(IlliquidReason::LowVolume {
                volume: bar.volume,
                minimum,
            });
        }

        let maximum = self.settings.for_asset(bar.asset_type).max_relative_range;
        let range = relative_range(bar);
        if range > maximum {
            return Liquidity::Illiquid(IlliquidReason::WideRange { range, maximum });
        }

        Liquidity::Liquid
    }

    /// Keeps every event; events on illiquid bars are flagged low confidence
    pub fn annotate(&self, events: &[CrossoverEvent], bars: &[Bar]) -> Vec<AnnotatedEvent> {
        events
            .iter()
            .filter_map(|event| {
                let bar = bars.get(event.index)?;
                let liquidity = self.classify(bar);
                let low_confidence = !liquidity.is_liquid();
                if low_confidence {
                    debug!(
                        "{} {} event at {} on illiquid bar",
                        bar.key(),
                        event.direction.as_str(),
                        event.timestamp
                    );
                }
                Some(AnnotatedEvent {
                    event: event.clone(),
                    liquidity,
                    low_confidence,
                })
            })
            .collect()
    }
}
