/// Technical indicators implementation
use crate::types::Bar;

/// Simple moving average of the `window` values ending at `index`
/// (inclusive). Summed directly so equal windows give bit-identical results.
pub fn sma_at(values: &[f64], index: usize, window: usize) -> Option<f64> {
    if window == 0 || index >= values.len() || index + 1 < window {
        return None;
    }
    let slice = &values[index + 1 - window..=index];
    Some(slice.iter().sum::<f64>() / window as f64)
}

/// (high - low) / close
pub fn relative_range(bar: &Bar) -> f64 {
    (bar.high - bar.low) / bar.close
}

/// Percent change from `previous` to `current`; 0 when `previous` is 0
pub fn percent_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::test_support::*;

    #[test]
    fn test_sma_at() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma_at(&values, 2, 3), Some(2.0));
        assert_eq!(sma_at(&values, 4, 2), Some(4.5));
        assert_eq!(sma_at(&values, 1, 3), None);
        assert_eq!(sma_at(&values, 5, 1), None);
        assert_eq!(sma_at(&values, 0, 0), None);
    }

    #[test]
    fn test_range_and_change() {
        let bar = bar_at(&btc_hourly(), t0(), 100.0);
        assert!((relative_range(&bar) - 0.02).abs() < 1e-12);
        assert!((percent_change(100.0, 110.0) - 10.0).abs() < 1e-9);
        assert_eq!(percent_change(0.0, 5.0), 0.0);
    }
}
