/// Binance spot klines REST client (crypto bars)
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{BarFetcher, FetchRequest};
use crate::error::{FetchError, Result, SyncError};
use crate::types::{Bar, BinanceSettings, SeriesKey};
use crate::utils::RateLimiter;

const KLINES_PATH: &str = "/api/v3/klines";

/// One klines response: parsed bars plus what pagination needs from the raw rows
struct KlinePage {
    bars: Vec<Bar>,
    rows: usize,
    last_open: Option<DateTime<Utc>>,
}

pub struct BinanceFetcher {
    client: Client,
    base_url: String,
    page_limit: usize,
    limiter: Option<Arc<RateLimiter>>,
}

impl BinanceFetcher {
    pub fn new(settings: &BinanceSettings, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(BinanceFetcher {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            page_limit: settings.page_limit,
            limiter: None,
        })
    }

    /// Pace every page after the first through `limiter`. The caller paces
    /// the first request of each fetch.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        start: DateTime<Utc>,
    ) -> std::result::Result<KlinePage, FetchError> {
        let symbol = exchange_symbol(&request.key.symbol);
        let limit = self.page_limit.to_string();
        let start_ms = start.timestamp_millis().to_string();
        let end_ms = request.end.timestamp_millis().to_string();

        debug!(series = %request.key, "Fetching klines {} from {}", symbol, start);

        let response = self
            .client
            .get(format!("{}{}", self.base_url, KLINES_PATH))
            .query(&[
                ("symbol", symbol.as_str()),
                ("interval", request.key.timeframe.as_str()),
                ("startTime", start_ms.as_str()),
                ("endTime", end_ms.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let rows: Vec<Vec<Value>> = serde_json::from_str(&body)
            .map_err(|e| FetchError::Transient(format!("Malformed klines response: {}", e)))?;
        let bars = parse_klines(&request.key, &rows);
        let last_open = rows
            .last()
            .and_then(|row| row.first())
            .and_then(Value::as_i64)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .or_else(|| bars.last().map(|b| b.timestamp));

        Ok(KlinePage {
            rows: rows.len(),
            bars,
            last_open,
        })
    }
}

impl BarFetcher for BinanceFetcher {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<Vec<Bar>, FetchError> {
        let step = request.key.timeframe.duration();
        let mut bars = Vec::new();
        let mut cursor = request.start;
        let mut pages = 0;

        while cursor <= request.end {
            if pages > 0 {
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
            }
            let page = self.fetch_page(request, cursor).await?;
            pages += 1;
            let Some(last_open) = page.last_open else {
                break;
            };
            bars.extend(page.bars);

            if page.rows < self.page_limit {
                break;
            }
            cursor = last_open + step;
        }

        debug!(series = %request.key, "Fetched {} klines in {} pages", bars.len(), pages);
        Ok(bars)
    }
}

/// Binance quotes against USDT; `BTCUSD` style symbols are mapped onto it
pub fn exchange_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    match upper.strip_suffix("USD") {
        Some(base) if !base.is_empty() => format!("{}USDT", base),
        _ => upper,
    }
}

/// 429/418 and server errors are worth retrying; other client errors are not
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let message = format!("Binance returned {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 418
        || status.is_server_error()
    {
        FetchError::Transient(message)
    } else if status.is_client_error() {
        FetchError::Permanent(message)
    } else {
        FetchError::Transient(message)
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Kline rows: [open_time_ms, open, high, low, close, volume, close_time, ...]
/// Rows that do not parse are logged and skipped.
pub fn parse_klines(key: &SeriesKey, rows: &[Vec<Value>]) -> Vec<Bar> {
    rows.iter()
        .filter_map(|row| {
            let parsed = (|| {
                if row.len() < 6 {
                    return None;
                }
                let open_ms = row[0].as_i64()?;
                let timestamp = Utc.timestamp_millis_opt(open_ms).single()?;
                Some(Bar {
                    symbol: key.symbol.clone(),
                    asset_type: key.asset_type,
                    timeframe: key.timeframe,
                    timestamp,
                    open: number(&row[1])?,
                    high: number(&row[2])?,
                    low: number(&row[3])?,
                    close: number(&row[4])?,
                    volume: number(&row[5])?,
                })
            })();
            if parsed.is_none() {
                warn!(series = %key, "⚠️  Skipping malformed kline row: {:?}", row);
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetType, Timeframe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_symbol_normalisation() {
        assert_eq!(exchange_symbol("BTCUSD"), "BTCUSDT");
        assert_eq!(exchange_symbol("ethusdt"), "ETHUSDT");
        assert_eq!(exchange_symbol("USD"), "USD");
        assert_eq!(exchange_symbol("ETHBTC"), "ETHBTC");
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::from_u16(418).unwrap(), "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        let invalid = classify_status(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
        );
        assert!(!invalid.is_transient());
        assert!(invalid.message().contains("Invalid symbol"));
    }

    #[test]
    fn test_parse_klines() {
        let key = SeriesKey::new("BTCUSD", AssetType::Crypto, Timeframe::OneHour);
        let rows: Vec<Vec<Value>> = serde_json::from_str(
            r#"[
                [1741564800000, "80000.10", "80500.00", "79800.00", "80250.50", "123.45", 1741568399999, "0", 10, "0", "0", "0"],
                [1741568400000, "80250.50", "80300.00", "80100.00", "80200.00", "98.10", 1741571999999, "0", 8, "0", "0", "0"]
            ]"#,
        )
        .unwrap();

        let bars = parse_klines(&key, &rows);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].symbol, "BTCUSD");
        assert_eq!(bars[0].timestamp, Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
        assert_eq!(bars[1].close, 80200.0);
        assert!(Timeframe::OneHour.is_aligned(bars[1].timestamp));
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let key = SeriesKey::new("BTCUSDT", AssetType::Crypto, Timeframe::OneHour);
        let rows: Vec<Vec<Value>> = serde_json::from_str(
            r#"[
                [1741564800000, "x"],
                [1741568400000, "1", "2", "0.5", "oops", "3"],
                [1741572000000, "1", "2", "0.5", "1.5", "3"]
            ]"#,
        )
        .unwrap();

        let bars = parse_klines(&key, &rows);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].timestamp, Utc.with_ymd_and_hms(2025, 3, 10, 2, 0, 0).unwrap());
    }

    fn kline(open_ms: i64) -> String {
        format!(r#"[{}, "1", "2", "0.5", "1.5", "3", {}, "0", 1, "0", "0", "0"]"#, open_ms, open_ms + 3_599_999)
    }

    /// Answers each request with the next canned body, then `[]`
    async fn serve_pages(pages: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let body = pages.get(n).cloned().unwrap_or_else(|| "[]".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    #[tokio::test]
    async fn test_follow_up_pages_are_rate_limited() {
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let ms = start.timestamp_millis();
        let pages = (0..3)
            .map(|i| format!("[{}]", kline(ms + i * 3_600_000)))
            .collect();
        let (base_url, hits) = serve_pages(pages).await;

        let settings = BinanceSettings {
            enabled: true,
            base_url,
            page_limit: 1,
        };
        let limiter = Arc::new(RateLimiter::new(10));
        while limiter.try_acquire().await {}

        let fetcher = BinanceFetcher::new(&settings, Duration::from_secs(5))
            .unwrap()
            .with_rate_limiter(Arc::clone(&limiter));
        let request = FetchRequest {
            key: SeriesKey::new("BTCUSDT", AssetType::Crypto, Timeframe::OneHour),
            start,
            end: start + chrono::Duration::hours(5),
        };

        let started = std::time::Instant::now();
        let bars = fetcher.fetch(&request).await.unwrap();
        assert_eq!(bars.len(), 3);
        // three full pages then an empty one
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        // pages 2..=4 each waited ~100ms for a token
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
