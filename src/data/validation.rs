/// Checks applied to fetched bars before they reach the store
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::broker::FetchRequest;
use crate::error::ValidationError;
use crate::types::Bar;

#[derive(Debug, Clone, Serialize)]
pub struct BarRejection {
    pub timestamp: DateTime<Utc>,
    pub code: String,
    pub reason: String,
}

impl BarRejection {
    fn new(timestamp: DateTime<Utc>, error: &ValidationError) -> Self {
        BarRejection {
            timestamp,
            code: error.error_code().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Outcome of validating one fetch result
#[derive(Debug, Clone, Default)]
pub struct ValidatedBatch {
    pub accepted: Vec<Bar>,
    pub rejected: Vec<BarRejection>,
}

impl ValidatedBatch {
    pub fn clipped(&self) -> usize {
        self.rejected.iter().filter(|r| r.code == "VAL_004").count()
    }
}

/// Check a single bar's payload in isolation
pub fn check_bar(request: &FetchRequest, bar: &Bar) -> Result<(), ValidationError> {
    if !bar.belongs_to(&request.key) {
        return Err(ValidationError::WrongSeries {
            expected: request.key.to_string(),
            found: bar.key().to_string(),
        });
    }

    if !request.key.timeframe.is_aligned(bar.timestamp) {
        return Err(ValidationError::Misaligned(bar.timestamp));
    }

    if bar.timestamp < request.start || bar.timestamp > request.end {
        return Err(ValidationError::OutsideWindow(bar.timestamp));
    }

    let prices = [bar.open, bar.high, bar.low, bar.close];
    if prices.iter().any(|p| !p.is_finite()) {
        return Err(ValidationError::InvalidPrice("non-finite value".to_string()));
    }
    if bar.close <= 0.0 {
        return Err(ValidationError::InvalidPrice(format!(
            "non-positive close {}",
            bar.close
        )));
    }
    if bar.low > bar.high {
        return Err(ValidationError::InvalidPrice(format!(
            "low {} above high {}",
            bar.low, bar.high
        )));
    }
    for (name, value) in [("open", bar.open), ("close", bar.close)] {
        if value < bar.low || value > bar.high {
            return Err(ValidationError::InvalidPrice(format!(
                "{} {} outside [{}, {}]",
                name, value, bar.low, bar.high
            )));
        }
    }

    if !bar.volume.is_finite() || bar.volume < 0.0 {
        return Err(ValidationError::InvalidVolume(bar.volume));
    }

    Ok(())
}

/// Split fetched bars into accepted and rejected. Timestamps must strictly
/// increase; a bar that does not advance past the last accepted one is
/// rejected rather than reordered.
pub fn validate_bars(request: &FetchRequest, bars: Vec<Bar>) -> ValidatedBatch {
    let mut batch = ValidatedBatch::default();
    let mut previous: Option<DateTime<Utc>> = None;

    for bar in bars {
        let result = check_bar(request, &bar).and_then(|_| match previous {
            Some(prev) if bar.timestamp <= prev => Err(ValidationError::OutOfOrder {
                timestamp: bar.timestamp,
                previous: prev,
            }),
            _ => Ok(()),
        });

        match result {
            Ok(()) => {
                previous = Some(bar.timestamp);
                batch.accepted.push(bar);
            }
            Err(e) => batch.rejected.push(BarRejection::new(bar.timestamp, &e)),
        }
    }

    let clipped = batch.clipped();
    if clipped > 0 {
        warn!(
            series = %request.key,
            "Clipped {} bars outside [{}, {}]",
            clipped, request.start, request.end
        );
    }
    if batch.rejected.len() > clipped {
        warn!(
            series = %request.key,
            "Rejected {} malformed bars",
            batch.rejected.len() - clipped
        );
    }

    batch
}
