/// Core type definitions for bar synchronization and signals
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::SyncError;

/// Asset class a series belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetType {
    #[serde(alias = "stock", alias = "stocks", alias = "STOCKS")]
    Stock,
    #[serde(alias = "forex")]
    Forex,
    #[serde(alias = "commodity", alias = "commodities", alias = "COMMODITIES")]
    Commodity,
    #[serde(alias = "crypto")]
    Crypto,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Stock => "STOCK",
            AssetType::Forex => "FOREX",
            AssetType::Commodity => "COMMODITY",
            AssetType::Crypto => "CRYPTO",
        }
    }

    pub fn all() -> Vec<AssetType> {
        vec![
            AssetType::Stock,
            AssetType::Forex,
            AssetType::Commodity,
            AssetType::Crypto,
        ]
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STOCK" | "STOCKS" => Ok(AssetType::Stock),
            "FOREX" | "FX" => Ok(AssetType::Forex),
            "COMMODITY" | "COMMODITIES" => Ok(AssetType::Commodity),
            "CRYPTO" => Ok(AssetType::Crypto),
            other => Err(SyncError::InvalidParameter(format!(
                "unknown asset type: {}",
                other
            ))),
        }
    }
}

/// Bar period. Bars live on a UTC grid: epoch-aligned for intraday and daily
/// periods, Monday 00:00 UTC for weekly ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinute,
    #[serde(rename = "15m")]
    FifteenMinute,
    #[serde(rename = "30m")]
    ThirtyMinute,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

/// 1970-01-01 was a Thursday; the first Monday is four days later.
const WEEK_ANCHOR_SECS: i64 = 4 * 86_400;

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinute => "5m",
            Timeframe::FifteenMinute => "15m",
            Timeframe::ThirtyMinute => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
        }
    }

    pub fn duration_minutes(&self) -> i64 {
        match self {
            Timeframe::OneMinute => 1,
            Timeframe::FiveMinute => 5,
            Timeframe::FifteenMinute => 15,
            Timeframe::ThirtyMinute => 30,
            Timeframe::OneHour => 60,
            Timeframe::FourHour => 240,
            Timeframe::OneDay => 1_440,
            Timeframe::OneWeek => 10_080,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes())
    }

    fn seconds(&self) -> i64 {
        self.duration_minutes() * 60
    }

    fn anchor(&self) -> i64 {
        match self {
            Timeframe::OneWeek => WEEK_ANCHOR_SECS,
            _ => 0,
        }
    }

    /// Start of the period containing `timestamp`
    pub fn align(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.seconds();
        let anchor = self.anchor();
        let aligned = (timestamp.timestamp() - anchor).div_euclid(period) * period + anchor;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(timestamp)
    }

    /// First period start at or after `timestamp`
    pub fn align_up(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.align(timestamp);
        if floor == timestamp {
            floor
        } else {
            floor + self.duration()
        }
    }

    pub fn is_aligned(&self, timestamp: DateTime<Utc>) -> bool {
        self.align(timestamp) == timestamp
    }

    /// Every period start in `[start, end]`
    pub fn periods(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> {
        let step = self.duration();
        let first = self.align_up(start);
        std::iter::successors(Some(first), move |t| Some(*t + step)).take_while(move |t| *t <= end)
    }

    pub fn all() -> Vec<Timeframe> {
        vec![
            Timeframe::OneMinute,
            Timeframe::FiveMinute,
            Timeframe::FifteenMinute,
            Timeframe::ThirtyMinute,
            Timeframe::OneHour,
            Timeframe::FourHour,
            Timeframe::OneDay,
            Timeframe::OneWeek,
        ]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Timeframe::all()
            .into_iter()
            .find(|tf| tf.as_str() == normalized)
            .ok_or_else(|| SyncError::InvalidParameter(format!("unknown timeframe: {}", s)))
    }
}

/// Identity of one bar series: (symbol, asset type, timeframe)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub asset_type: AssetType,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, asset_type: AssetType, timeframe: Timeframe) -> Self {
        SeriesKey {
            symbol: symbol.into(),
            asset_type,
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.asset_type, self.symbol, self.timeframe)
    }
}

/// OHLCV Bar data structure. `timestamp` is the period start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub asset_type: AssetType,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.asset_type, self.timeframe)
    }

    pub fn belongs_to(&self, key: &SeriesKey) -> bool {
        self.symbol == key.symbol && self.asset_type == key.asset_type && self.timeframe == key.timeframe
    }

    /// Same OHLCV payload; rewriting such a bar is a no-op
    pub fn same_values(&self, other: &Bar) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }
}

/// Status of an expected period that has no bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapStatus {
    /// Provider confirmed the market was closed
    Closed,
    /// Not confirmed yet; retried on the next sync
    Pending,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Closed => "closed",
            GapStatus::Pending => "pending",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(GapStatus::Closed),
            "pending" => Some(GapStatus::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    pub timestamp: DateTime<Utc>,
    pub status: GapStatus,
    pub attempts: u32,
}

/// Per asset class values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct PerAsset<T> {
    #[serde(default)]
    pub stocks: T,
    #[serde(default)]
    pub forex: T,
    #[serde(default)]
    pub commodities: T,
    #[serde(default)]
    pub crypto: T,
}

impl<T> PerAsset<T> {
    pub fn get(&self, asset_type: AssetType) -> &T {
        match asset_type {
            AssetType::Stock => &self.stocks,
            AssetType::Forex => &self.forex,
            AssetType::Commodity => &self.commodities,
            AssetType::Crypto => &self.crypto,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Configuration for bar sync and signals
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Storage
    pub database_path: PathBuf,
    pub database_pool_size: u32,
    pub report_dir: PathBuf,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    pub sync: SyncSettings,
    pub schedule: ScheduleSettings,
    pub universe: UniverseSettings,
    pub providers: ProviderSettings,
    pub calendar: CalendarSettings,
    pub signal: PerAsset<MaWindows>,
    pub liquidity: LiquiditySettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("data/market_assets.db"),
            database_pool_size: 4,
            report_dir: PathBuf::from("data/reports"),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            sync: SyncSettings::default(),
            schedule: ScheduleSettings::default(),
            universe: UniverseSettings::default(),
            providers: ProviderSettings::default(),
            calendar: CalendarSettings::default(),
            signal: PerAsset::default(),
            liquidity: LiquiditySettings::default(),
        }
    }
}

pub const DEFAULT_DAYS_BACK: u32 = 365;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    // Concurrency
    pub max_concurrency: usize,
    pub requests_per_second: u32,

    // Fetch retry
    pub fetch_timeout_sec: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    // Window
    pub overlap_bars: u32,
    pub days_back: PerAsset<Option<u32>>,
    pub max_days_back: HashMap<Timeframe, u32>,

    // Gaps
    pub max_gap_attempts: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let max_days_back = HashMap::from([
            (Timeframe::OneMinute, 7),
            (Timeframe::FiveMinute, 30),
            (Timeframe::FifteenMinute, 60),
            (Timeframe::ThirtyMinute, 90),
            (Timeframe::OneHour, 365),
            (Timeframe::FourHour, 730),
        ]);

        SyncSettings {
            max_concurrency: 4,
            requests_per_second: 5,
            fetch_timeout_sec: 30,
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_cap_ms: 10_000,
            overlap_bars: 2,
            days_back: PerAsset::default(),
            max_days_back,
            max_gap_attempts: 5,
        }
    }
}

impl SyncSettings {
    /// History depth: where an empty series starts and the furthest back any
    /// sync window reaches. An explicit override wins; otherwise the asset
    /// default is capped per timeframe.
    pub fn days_back_for(&self, key: &SeriesKey, override_days: Option<u32>) -> u32 {
        if let Some(days) = override_days {
            return days;
        }
        let days = self.days_back.get(key.asset_type).unwrap_or(DEFAULT_DAYS_BACK);
        match self.max_days_back.get(&key.timeframe) {
            Some(cap) => days.min(*cap),
            None => days,
        }
    }
}

/// How often `watch` re-syncs each asset class
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub interval_minutes: PerAsset<Option<u64>>,
}

impl ScheduleSettings {
    /// Crypto trades around the clock and is polled every 5 minutes; the
    /// other classes hourly unless configured
    pub fn interval_for(&self, asset_type: AssetType) -> std::time::Duration {
        let minutes = self.interval_minutes.get(asset_type).unwrap_or(match asset_type {
            AssetType::Crypto => 5,
            _ => 60,
        });
        std::time::Duration::from_secs(minutes * 60)
    }
}

/// Symbols and timeframes considered "all known"
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UniverseSettings {
    pub timeframes: Vec<Timeframe>,
    pub symbols: PerAsset<Vec<String>>,
    pub symbol_files: PerAsset<Option<PathBuf>>,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        UniverseSettings {
            timeframes: vec![Timeframe::OneHour, Timeframe::OneDay],
            symbols: PerAsset::default(),
            symbol_files: PerAsset::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub binance: BinanceSettings,
    pub csv_feed: CsvFeedSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinanceSettings {
    pub enabled: bool,
    pub base_url: String,
    pub page_limit: usize,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        BinanceSettings {
            enabled: true,
            base_url: "https://api.binance.com".to_string(),
            page_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CsvFeedSettings {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalendarSettings {
    /// Exchange holidays (New York dates) closing stocks and commodities
    pub holidays: Vec<NaiveDate>,
}

/// Moving average window lengths, in bars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaWindows {
    pub fast: usize,
    pub slow: usize,
}

impl Default for MaWindows {
    fn default() -> Self {
        MaWindows { fast: 20, slow: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityThresholds {
    /// Minimum volume over one day, scaled to the bar period
    pub min_volume_per_day: f64,
    /// Explicit per-timeframe minimum volume, overriding the scaled value
    pub min_volume: HashMap<Timeframe, f64>,
    /// Maximum (high - low) / close
    pub max_relative_range: f64,
}

impl Default for LiquidityThresholds {
    fn default() -> Self {
        LiquidityThresholds {
            min_volume_per_day: 0.0,
            min_volume: HashMap::new(),
            max_relative_range: 0.10,
        }
    }
}

impl LiquidityThresholds {
    fn with(min_volume_per_day: f64, max_relative_range: f64) -> Self {
        LiquidityThresholds {
            min_volume_per_day,
            min_volume: HashMap::new(),
            max_relative_range,
        }
    }

    pub fn stocks() -> Self {
        Self::with(100_000.0, 0.10)
    }

    pub fn forex() -> Self {
        Self::with(1_000.0, 0.03)
    }

    pub fn commodities() -> Self {
        Self::with(10_000.0, 0.08)
    }

    pub fn crypto() -> Self {
        Self::with(100.0, 0.20)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiquiditySettings {
    #[serde(default = "LiquidityThresholds::stocks")]
    pub stocks: LiquidityThresholds,
    #[serde(default = "LiquidityThresholds::forex")]
    pub forex: LiquidityThresholds,
    #[serde(default = "LiquidityThresholds::commodities")]
    pub commodities: LiquidityThresholds,
    #[serde(default = "LiquidityThresholds::crypto")]
    pub crypto: LiquidityThresholds,
}

impl Default for LiquiditySettings {
    fn default() -> Self {
        LiquiditySettings {
            stocks: LiquidityThresholds::stocks(),
            forex: LiquidityThresholds::forex(),
            commodities: LiquidityThresholds::commodities(),
            crypto: LiquidityThresholds::crypto(),
        }
    }
}

impl LiquiditySettings {
    pub fn for_asset(&self, asset_type: AssetType) -> &LiquidityThresholds {
        match asset_type {
            AssetType::Stock => &self.stocks,
            AssetType::Forex => &self.forex,
            AssetType::Commodity => &self.commodities,
            AssetType::Crypto => &self.crypto,
        }
    }
}
