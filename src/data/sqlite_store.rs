/// SQLite bar store (pooled connections, WAL journal)
use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::data::bar_store::BarStore;
use crate::error::{Result, SyncError};
use crate::types::{AssetType, Bar, GapRecord, GapStatus, SeriesKey, Timeframe};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS market_bar (
        symbol TEXT NOT NULL,
        asset_type TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        ts INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        PRIMARY KEY (symbol, asset_type, timeframe, ts)
    );
    CREATE TABLE IF NOT EXISTS series_gap (
        symbol TEXT NOT NULL,
        asset_type TEXT NOT NULL,
        timeframe TEXT NOT NULL,
        ts INTEGER NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('closed', 'pending')),
        attempts INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (symbol, asset_type, timeframe, ts)
    );
    CREATE INDEX IF NOT EXISTS idx_series_gap_status
        ON series_gap(symbol, asset_type, timeframe, status);";

const UPSERT_BAR: &str = "
    INSERT INTO market_bar (symbol, asset_type, timeframe, ts, open, high, low, close, volume)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT (symbol, asset_type, timeframe, ts) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume
    WHERE market_bar.open IS NOT excluded.open
       OR market_bar.high IS NOT excluded.high
       OR market_bar.low IS NOT excluded.low
       OR market_bar.close IS NOT excluded.close
       OR market_bar.volume IS NOT excluded.volume";

const UPSERT_GAP: &str = "
    INSERT INTO series_gap (symbol, asset_type, timeframe, ts, status, attempts)
    SELECT ?1, ?2, ?3, ?4, ?5, ?6
    WHERE NOT EXISTS (
        SELECT 1 FROM market_bar
        WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3 AND ts = ?4
    )
    ON CONFLICT (symbol, asset_type, timeframe, ts) DO UPDATE SET
        status = excluded.status,
        attempts = excluded.attempts";

/// Durable bar store backed by a single SQLite file
pub struct SqliteBarStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteBarStore {
    /// Open (creating if needed) the database file and bootstrap the schema
    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
        });

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(POOL_TIMEOUT)
            .build(manager)?;

        let store = SqliteBarStore { pool };
        store.initialize_schema()?;
        info!("Opened bar store at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database; a single pooled connection so every
    /// caller sees the same data
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = SqliteBarStore { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            work(&mut conn)
        })
        .await
        .map_err(|e| SyncError::InternalError(format!("Store task failed: {}", e)))?
    }
}

fn to_datetime(secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(0, secs))
}

fn parse_column<T: std::str::FromStr>(value: String, column: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl BarStore for SqliteBarStore {
    async fn upsert(&self, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        let bars = bars.to_vec();
        let total = bars.len();

        let written = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                {
                    let mut upsert = tx.prepare_cached(UPSERT_BAR)?;
                    let mut clear_gap = tx.prepare_cached(
                        "DELETE FROM series_gap
                         WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3 AND ts = ?4",
                    )?;
                    for bar in &bars {
                        let ts = bar.timestamp.timestamp();
                        written += upsert.execute(params![
                            bar.symbol,
                            bar.asset_type.as_str(),
                            bar.timeframe.as_str(),
                            ts,
                            bar.open,
                            bar.high,
                            bar.low,
                            bar.close,
                            bar.volume
                        ])?;
                        clear_gap.execute(params![
                            bar.symbol,
                            bar.asset_type.as_str(),
                            bar.timeframe.as_str(),
                            ts
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await?;

        debug!("SQLite upsert: {} of {} bars written", written, total);
        Ok(written)
    }

    async fn latest_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let latest: Option<i64> = conn.query_row(
                "SELECT MAX(ts) FROM market_bar
                 WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3",
                params![key.symbol, key.asset_type.as_str(), key.timeframe.as_str()],
                |row| row.get(0),
            )?;
            Ok(latest.map(to_datetime).transpose()?)
        })
        .await
    }

    async fn earliest_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let earliest: Option<i64> = conn.query_row(
                "SELECT MIN(ts) FROM market_bar
                 WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3",
                params![key.symbol, key.asset_type.as_str(), key.timeframe.as_str()],
                |row| row.get(0),
            )?;
            Ok(earliest.map(to_datetime).transpose()?)
        })
        .await
    }

    async fn read_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ts, open, high, low, close, volume FROM market_bar
                 WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3
                   AND ts >= ?4 AND ts <= ?5
                 ORDER BY ts ASC",
            )?;
            let rows = stmt.query_map(
                params![
                    key.symbol,
                    key.asset_type.as_str(),
                    key.timeframe.as_str(),
                    start.timestamp(),
                    end.timestamp()
                ],
                |row| {
                    Ok(Bar {
                        symbol: key.symbol.clone(),
                        asset_type: key.asset_type,
                        timeframe: key.timeframe,
                        timestamp: to_datetime(row.get(0)?)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                    })
                },
            )?;

            let mut bars = Vec::new();
            for row in rows {
                bars.push(row?);
            }
            Ok(bars)
        })
        .await
    }

    async fn record_gaps(&self, key: &SeriesKey, gaps: &[GapRecord]) -> Result<()> {
        if gaps.is_empty() {
            return Ok(());
        }
        let key = key.clone();
        let gaps = gaps.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT_GAP)?;
                for gap in &gaps {
                    stmt.execute(params![
                        key.symbol,
                        key.asset_type.as_str(),
                        key.timeframe.as_str(),
                        gap.timestamp.timestamp(),
                        gap.status.as_str(),
                        gap.attempts
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn gaps_in_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<GapRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT ts, status, attempts FROM series_gap
                 WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3
                   AND ts >= ?4 AND ts <= ?5
                 ORDER BY ts ASC",
            )?;
            let rows = stmt.query_map(
                params![
                    key.symbol,
                    key.asset_type.as_str(),
                    key.timeframe.as_str(),
                    start.timestamp(),
                    end.timestamp()
                ],
                |row| {
                    let status: String = row.get(1)?;
                    Ok(GapRecord {
                        timestamp: to_datetime(row.get(0)?)?,
                        status: GapStatus::from_str(&status).unwrap_or(GapStatus::Pending),
                        attempts: row.get(2)?,
                    })
                },
            )?;

            let mut gaps = Vec::new();
            for row in rows {
                gaps.push(row?);
            }
            Ok(gaps)
        })
        .await
    }

    async fn earliest_pending_gap(
        &self,
        key: &SeriesKey,
        max_attempts: u32,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let earliest: Option<i64> = conn
                .query_row(
                    "SELECT MIN(ts) FROM series_gap
                     WHERE symbol = ?1 AND asset_type = ?2 AND timeframe = ?3
                       AND status = 'pending' AND attempts < ?4",
                    params![
                        key.symbol,
                        key.asset_type.as_str(),
                        key.timeframe.as_str(),
                        max_attempts
                    ],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(earliest.map(to_datetime).transpose()?)
        })
        .await
    }

    async fn list_series(&self) -> Result<Vec<SeriesKey>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT symbol, asset_type, timeframe FROM market_bar
                 ORDER BY asset_type, symbol, timeframe",
            )?;
            let rows = stmt.query_map([], |row| {
                let asset_type: AssetType = parse_column(row.get(1)?, 1)?;
                let timeframe: Timeframe = parse_column(row.get(2)?, 2)?;
                Ok(SeriesKey::new(row.get::<_, String>(0)?, asset_type, timeframe))
            })?;

            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::bar_store::test_support::*;

    fn temp_store() -> (tempfile::TempDir, SqliteBarStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteBarStore::open(dir.path().join("bars.db"), 4).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_upsert_counts_only_changes() {
        let (_dir, store) = temp_store();
        let key = btc_hourly();
        let mut bars = bars_from_closes(&key, &[100.0, 101.0, 102.0]);

        assert_eq!(store.upsert(&bars).await.unwrap(), 3);
        assert_eq!(store.upsert(&bars).await.unwrap(), 0);

        bars[2].volume = 42.0;
        assert_eq!(store.upsert(&bars).await.unwrap(), 1);

        let stored = store.read_range(&key, t0(), t0() + hours(2)).await.unwrap();
        assert_eq!(stored, bars);
        assert_eq!(store.latest_timestamp(&key).await.unwrap(), Some(t0() + hours(2)));
        assert_eq!(store.earliest_timestamp(&key).await.unwrap(), Some(t0()));
    }

    #[tokio::test]
    async fn test_gap_bookkeeping() {
        let (_dir, store) = temp_store();
        let key = btc_hourly();
        store.upsert(&bars_from_closes(&key, &[1.0])).await.unwrap();

        let gaps = vec![
            // already has a bar: ignored
            GapRecord {
                timestamp: t0(),
                status: GapStatus::Pending,
                attempts: 1,
            },
            GapRecord {
                timestamp: t0() + hours(1),
                status: GapStatus::Closed,
                attempts: 1,
            },
            GapRecord {
                timestamp: t0() + hours(2),
                status: GapStatus::Pending,
                attempts: 3,
            },
        ];
        store.record_gaps(&key, &gaps).await.unwrap();

        let stored = store.gaps_in_range(&key, t0(), t0() + hours(5)).await.unwrap();
        assert_eq!(stored, gaps[1..].to_vec());
        assert_eq!(
            store.earliest_pending_gap(&key, 5).await.unwrap(),
            Some(t0() + hours(2))
        );
        assert_eq!(store.earliest_pending_gap(&key, 3).await.unwrap(), None);

        // the late bar arrives and clears its gap
        let late = bar_at(&key, t0() + hours(2), 5.0);
        store.upsert(&[late]).await.unwrap();
        assert_eq!(store.gaps_in_range(&key, t0(), t0() + hours(5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_series_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bars.db");
        let key = btc_hourly();
        {
            let store = SqliteBarStore::open(&path, 2).unwrap();
            store.upsert(&bars_from_closes(&key, &[1.0, 2.0])).await.unwrap();
        }

        let reopened = SqliteBarStore::open(&path, 2).unwrap();
        assert_eq!(reopened.list_series().await.unwrap(), vec![key.clone()]);
        assert_eq!(reopened.read_range(&key, t0(), t0() + hours(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = SqliteBarStore::in_memory().unwrap();
        let key = btc_hourly();
        assert_eq!(store.latest_timestamp(&key).await.unwrap(), None);
        assert_eq!(store.earliest_pending_gap(&key, 5).await.unwrap(), None);
        store.upsert(&bars_from_closes(&key, &[1.0])).await.unwrap();
        assert_eq!(store.latest_timestamp(&key).await.unwrap(), Some(t0()));
    }
}
