/// Configuration loading from TOML file
use std::path::Path;
use crate::error::{Result, SyncError};
use crate::types::{AssetType, Config};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SyncError::ConfigError(format!("Failed to read config file: {}", e)))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| SyncError::ConfigError(format!("Failed to parse config: {}", e)))?;

    // Validate config
    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    let sync = &config.sync;

    if sync.max_concurrency == 0 {
        return Err(SyncError::ConfigError("sync.max_concurrency must be >= 1".to_string()));
    }

    if sync.requests_per_second == 0 {
        return Err(SyncError::ConfigError("sync.requests_per_second must be >= 1".to_string()));
    }

    if sync.max_attempts == 0 {
        return Err(SyncError::ConfigError("sync.max_attempts must be >= 1".to_string()));
    }

    // A zero overlap would let a half-written last bar survive forever
    if sync.overlap_bars == 0 {
        return Err(SyncError::ConfigError("sync.overlap_bars must be >= 1".to_string()));
    }

    if sync.fetch_timeout_sec == 0 {
        return Err(SyncError::ConfigError("sync.fetch_timeout_sec must be > 0".to_string()));
    }

    if sync.backoff_cap_ms < sync.backoff_base_ms {
        return Err(SyncError::ConfigError(
            "sync.backoff_cap_ms must be >= sync.backoff_base_ms".to_string(),
        ));
    }

    for asset in AssetType::all() {
        let windows = config.signal.get(asset);
        if windows.fast == 0 || windows.fast >= windows.slow {
            return Err(SyncError::ConfigError(format!(
                "signal.{}: fast window ({}) must be >= 1 and < slow window ({})",
                asset.as_str().to_lowercase(),
                windows.fast,
                windows.slow
            )));
        }

        if config.schedule.interval_minutes.get(asset) == &Some(0) {
            return Err(SyncError::ConfigError(format!(
                "schedule.interval_minutes.{} must be >= 1",
                asset.as_str().to_lowercase()
            )));
        }

        let thresholds = config.liquidity.for_asset(asset);
        if !(thresholds.max_relative_range > 0.0) {
            return Err(SyncError::ConfigError(format!(
                "liquidity.{}: max_relative_range must be > 0",
                asset.as_str().to_lowercase()
            )));
        }
        if thresholds.min_volume_per_day < 0.0 || thresholds.min_volume.values().any(|v| *v < 0.0) {
            return Err(SyncError::ConfigError(format!(
                "liquidity.{}: volume thresholds must be >= 0",
                asset.as_str().to_lowercase()
            )));
        }
    }

    if config.providers.binance.page_limit == 0 || config.providers.binance.page_limit > 1000 {
        return Err(SyncError::ConfigError(
            "providers.binance.page_limit must be within 1..=1000".to_string(),
        ));
    }

    Ok(())
}
