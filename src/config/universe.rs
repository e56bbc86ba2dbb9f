/// Symbol universe: which (asset type, symbol, timeframe) tuples a run covers
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::types::{AssetType, Config, SeriesKey, Timeframe};

/// Read a symbol file. Symbols are separated by commas and/or newlines;
/// blank entries are ignored.
pub fn load_symbol_file<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| SyncError::ConfigError(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut symbols = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|e| SyncError::ConfigError(format!("Failed to parse {}: {}", path.display(), e)))?;
        symbols.extend(
            record
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        );
    }

    debug!("Loaded {} symbols from {}", symbols.len(), path.display());
    Ok(symbols)
}

/// Configured symbols for one asset class: inline list plus symbol file
pub fn symbols_for(config: &Config, asset_type: AssetType) -> Result<Vec<String>> {
    let mut symbols = config.universe.symbols.get(asset_type).clone();

    if let Some(path) = config.universe.symbol_files.get(asset_type) {
        symbols.extend(load_symbol_file(path)?);
    }

    // Keep first-seen order, drop repeats
    let mut seen = BTreeSet::new();
    symbols.retain(|s| seen.insert(s.clone()));
    Ok(symbols)
}

/// Cross product of asset types × symbols × timeframes. `None` means
/// "all known" for that dimension.
pub fn build_sync_tasks(
    config: &Config,
    asset_types: Option<&[AssetType]>,
    symbols: Option<&[String]>,
    timeframes: Option<&[Timeframe]>,
) -> Result<Vec<SeriesKey>> {
    let asset_types = match asset_types {
        Some(types) if !types.is_empty() => types.to_vec(),
        _ => AssetType::all(),
    };

    let timeframes = match timeframes {
        Some(tfs) if !tfs.is_empty() => tfs.to_vec(),
        _ => config.universe.timeframes.clone(),
    };

    let mut tasks = Vec::new();
    for asset_type in asset_types {
        let asset_symbols = match symbols {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => symbols_for(config, asset_type)?,
        };

        for symbol in &asset_symbols {
            for timeframe in &timeframes {
                let key = SeriesKey::new(symbol.clone(), asset_type, *timeframe);
                if !tasks.contains(&key) {
                    tasks.push(key);
                }
            }
        }
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_symbol_file_formats() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "BTCUSDT, ETHUSDT,SOLUSDT").unwrap();
        writeln!(file, "ADAUSDT").unwrap();
        writeln!(file).unwrap();

        let symbols = load_symbol_file(file.path()).unwrap();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT", "ADAUSDT"]);
    }

    #[test]
    fn test_cross_product_defaults() {
        let mut config = Config::default();
        config.universe.symbols.crypto = vec!["BTCUSDT".to_string()];
        config.universe.symbols.stocks = vec!["AAPL".to_string(), "MSFT".to_string()];
        config.universe.timeframes = vec![Timeframe::OneHour, Timeframe::OneDay];

        let tasks = build_sync_tasks(&config, None, None, None).unwrap();
        assert_eq!(tasks.len(), 6);
        assert!(tasks.contains(&SeriesKey::new("MSFT", AssetType::Stock, Timeframe::OneDay)));

        let crypto_only = build_sync_tasks(
            &config,
            Some(&[AssetType::Crypto]),
            None,
            Some(&[Timeframe::OneDay]),
        )
        .unwrap();
        assert_eq!(
            crypto_only,
            vec![SeriesKey::new("BTCUSDT", AssetType::Crypto, Timeframe::OneDay)]
        );
    }

    #[test]
    fn test_explicit_symbols_override_config() {
        let mut config = Config::default();
        config.universe.symbols.forex = vec!["EURUSD".to_string()];

        let symbols = vec!["GBPUSD".to_string(), "GBPUSD".to_string()];
        let tasks = build_sync_tasks(
            &config,
            Some(&[AssetType::Forex]),
            Some(&symbols),
            Some(&[Timeframe::OneHour]),
        )
        .unwrap();
        assert_eq!(
            tasks,
            vec![SeriesKey::new("GBPUSD", AssetType::Forex, Timeframe::OneHour)]
        );
    }
}
