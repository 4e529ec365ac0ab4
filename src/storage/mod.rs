//! Persistence Layer (§4.C3).
//!
//! A bounded connection pool degrades to a single `rusqlite::Connection`
//! behind `Arc<parking_lot::Mutex<Connection>>` (grounded on
//! `backtest_v2/oracle/storage.rs`'s `OracleRoundStorage`): SQLite
//! serializes writers regardless of pool size, so the pool knobs are kept
//! for interface fidelity and validated, but only ever back one handle.
//! Continuous aggregates are plain SQL `VIEW`s computed at read time.

use crate::types::{
    BackfillTask, Gap, GlobalIndicator, Liquidation, Market, MarketSignal, MarketType,
    MetricPoint, OhlcvBar, Side, TaskStatus, Timeframe, Trade, WhaleTransaction,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS exchanges (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS blockchains (
    name TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS whale_addresses (
    blockchain TEXT NOT NULL,
    address TEXT NOT NULL,
    label TEXT,
    PRIMARY KEY (blockchain, address)
);

-- Operator-maintained mapping consulted by `get_or_create_market` before it
-- falls back to the exchange-family heuristic (§4.C3).
CREATE TABLE IF NOT EXISTS symbol_registry (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    market_type TEXT NOT NULL,
    PRIMARY KEY (exchange, symbol)
);

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    market_type TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(exchange, symbol)
);

CREATE TABLE IF NOT EXISTS ohlcv (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    timeframe TEXT NOT NULL,
    bucket_start_time INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    PRIMARY KEY (market_id, timeframe, bucket_start_time)
);
CREATE INDEX IF NOT EXISTS idx_ohlcv_latest ON ohlcv(market_id, timeframe, bucket_start_time DESC);

CREATE TABLE IF NOT EXISTS market_metrics (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    time INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    metadata TEXT,
    PRIMARY KEY (market_id, time, name)
);

CREATE TABLE IF NOT EXISTS global_indicators (
    time INTEGER NOT NULL,
    category TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    classification TEXT,
    metadata TEXT,
    PRIMARY KEY (time, category, name)
);

CREATE TABLE IF NOT EXISTS whale_transactions (
    blockchain TEXT NOT NULL,
    tx_hash TEXT NOT NULL,
    time INTEGER NOT NULL,
    amount TEXT NOT NULL,
    amount_usd TEXT,
    direction TEXT NOT NULL,
    is_whale INTEGER NOT NULL DEFAULT 0,
    is_anomaly INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (blockchain, time, tx_hash)
);

CREATE TABLE IF NOT EXISTS liquidations (
    time INTEGER NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity TEXT NOT NULL,
    value_usd TEXT NOT NULL,
    PRIMARY KEY (time, exchange, symbol, side, price)
);

CREATE TABLE IF NOT EXISTS market_signals (
    time INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    signal_type TEXT NOT NULL,
    side TEXT NOT NULL,
    severity TEXT NOT NULL,
    price_at_signal TEXT,
    message TEXT NOT NULL,
    metadata TEXT,
    PRIMARY KEY (time, symbol, signal_type)
);

CREATE TABLE IF NOT EXISTS trades (
    market_id INTEGER NOT NULL REFERENCES markets(id),
    time INTEGER NOT NULL,
    trade_id TEXT NOT NULL,
    price TEXT NOT NULL,
    amount TEXT NOT NULL,
    side TEXT NOT NULL,
    PRIMARY KEY (market_id, time, trade_id)
);

CREATE TABLE IF NOT EXISTS backfill_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    data_type TEXT NOT NULL,
    timeframe TEXT,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    expected_records INTEGER,
    actual_records INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_backfill_pending
    ON backfill_tasks(status, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS system_log (
    time INTEGER NOT NULL,
    module TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    value TEXT,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS data_quality_summary (
    time INTEGER NOT NULL,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    timeframe TEXT NOT NULL,
    quality_score REAL NOT NULL,
    missing_rate REAL NOT NULL,
    missing_count INTEGER NOT NULL,
    expected_count INTEGER NOT NULL,
    actual_count INTEGER NOT NULL,
    status TEXT NOT NULL,
    issues TEXT,
    backfill_task_created INTEGER NOT NULL DEFAULT 0
);

CREATE VIEW IF NOT EXISTS ohlcv_5m AS
SELECT market_id, (bucket_start_time / 300) * 300 AS bucket_start_time,
       (SELECT open FROM ohlcv o2 WHERE o2.market_id = o.market_id AND o2.timeframe = '1m'
            AND (o2.bucket_start_time / 300) * 300 = (o.bucket_start_time / 300) * 300
            ORDER BY o2.bucket_start_time ASC LIMIT 1) AS open,
       MAX(high) AS high, MIN(low) AS low,
       (SELECT close FROM ohlcv o2 WHERE o2.market_id = o.market_id AND o2.timeframe = '1m'
            AND (o2.bucket_start_time / 300) * 300 = (o.bucket_start_time / 300) * 300
            ORDER BY o2.bucket_start_time DESC LIMIT 1) AS close,
       SUM(CAST(volume AS REAL)) AS volume
FROM ohlcv o WHERE timeframe = '1m' GROUP BY market_id, (bucket_start_time / 300);

CREATE VIEW IF NOT EXISTS ohlcv_15m AS
SELECT market_id, (bucket_start_time / 900) * 900 AS bucket_start_time,
       MAX(high) AS high, MIN(low) AS low, SUM(CAST(volume AS REAL)) AS volume
FROM ohlcv WHERE timeframe = '1m' GROUP BY market_id, (bucket_start_time / 900);

CREATE VIEW IF NOT EXISTS ohlcv_1h AS
SELECT market_id, (bucket_start_time / 3600) * 3600 AS bucket_start_time,
       MAX(high) AS high, MIN(low) AS low, SUM(CAST(volume AS REAL)) AS volume
FROM ohlcv WHERE timeframe = '1m' GROUP BY market_id, (bucket_start_time / 3600);

CREATE VIEW IF NOT EXISTS ohlcv_1d AS
SELECT market_id, (bucket_start_time / 86400) * 86400 AS bucket_start_time,
       MAX(high) AS high, MIN(low) AS low, SUM(CAST(volume AS REAL)) AS volume
FROM ohlcv WHERE timeframe = '1m' GROUP BY market_id, (bucket_start_time / 86400);
"#;

/// Pool sizing knobs, retained for interface fidelity with a pooled
/// backend (§4.C3) even though this implementation serializes on one
/// connection.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceConfig {
    pub min_connections: u32,
    pub max_connections: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be positive");
        }
        if self.max_connections < self.min_connections {
            bail!("max_connections must be >= min_connections");
        }
        Ok(())
    }
}

/// `get_or_create_market`'s fallback when `symbol_registry` has no entry
/// for the pair: perpetual-swap exchanges default to `linear_perpetual`,
/// everything else defaults to `spot` (§4.C3).
fn heuristic_market_type(exchange: &str) -> MarketType {
    match exchange {
        "binance" | "bybit" | "okx" => MarketType::LinearPerpetual,
        _ => MarketType::Spot,
    }
}

pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(path: &Path, config: PersistenceConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("opening database at {path:?}"))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Self::record_pool_metrics();
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Self::record_pool_metrics();
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn record_pool_metrics() {
        metrics::gauge!("collector_db_pool_connections", "state" => "active").set(1.0);
        metrics::gauge!("collector_db_pool_connections", "state" => "idle").set(0.0);
        metrics::gauge!("collector_db_pool_usage_rate").set(1.0);
        metrics::gauge!("collector_db_pool_total_connections").set(1.0);
    }

    /// Looks up `market_type` from `symbol_registry` first; falls back to
    /// the exchange-family heuristic (perpetual-swap exchanges default to
    /// `linear_perpetual`, else `spot`) when the registry has no entry
    /// (§4.C3).
    pub fn get_or_create_market(&self, exchange: &str, symbol: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let registered: Option<String> = conn
            .query_row(
                "SELECT market_type FROM symbol_registry WHERE exchange = ?1 AND symbol = ?2",
                params![exchange, symbol],
                |row| row.get(0),
            )
            .optional()?;
        let market_type = match registered.and_then(|s| MarketType::parse(&s)) {
            Some(mt) => mt,
            None => heuristic_market_type(exchange),
        };
        conn.execute(
            "INSERT INTO markets (exchange, symbol, market_type) VALUES (?1, ?2, ?3)
             ON CONFLICT(exchange, symbol) DO NOTHING",
            params![exchange, symbol, market_type.to_string()],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM markets WHERE exchange = ?1 AND symbol = ?2",
            params![exchange, symbol],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Idempotent upsert on (market, timeframe, bucket_start_time). One bad
    /// row is logged and skipped; the batch is never aborted (§4.C3).
    pub fn upsert_ohlcv_batch(
        &self,
        market_id: i64,
        timeframe: Timeframe,
        rows: &[OhlcvBar],
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ohlcv (market_id, timeframe, bucket_start_time, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(market_id, timeframe, bucket_start_time) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume",
            )?;
            for bar in rows {
                let result = stmt.execute(params![
                    market_id,
                    timeframe.as_str(),
                    bar.bucket_start_time.timestamp(),
                    bar.open.to_string(),
                    bar.high.to_string(),
                    bar.low.to_string(),
                    bar.close.to_string(),
                    bar.volume.to_string(),
                ]);
                match result {
                    Ok(_) => count += 1,
                    Err(e) => warn!(market_id, %e, "skipping bad ohlcv row"),
                }
            }
        }
        tx.commit()?;
        crate::metrics::record_db_write("ohlcv", "ok", count as u64);
        Ok(count)
    }

    /// Idempotent on (market, time, name). `value` is mandatory on
    /// `MetricPoint`; callers are expected to have already dropped rows
    /// whose upstream value was absent (§4.C3).
    pub fn upsert_metric_batch(
        &self,
        market_id: i64,
        name: &str,
        rows: &[MetricPoint],
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO market_metrics (market_id, time, name, value, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(market_id, time, name) DO UPDATE SET
                    value = excluded.value, metadata = excluded.metadata",
            )?;
            for point in rows {
                let result = stmt.execute(params![
                    market_id,
                    point.time.timestamp(),
                    name,
                    point.value.to_string(),
                    point.metadata.to_string(),
                ]);
                match result {
                    Ok(_) => count += 1,
                    Err(e) => warn!(market_id, name, %e, "skipping bad metric row"),
                }
            }
        }
        tx.commit()?;
        crate::metrics::record_db_write("market_metrics", "ok", count as u64);
        Ok(count)
    }

    pub fn upsert_global_indicator_batch(&self, rows: &[GlobalIndicator]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO global_indicators (time, category, name, value, classification, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(time, category, name) DO UPDATE SET
                    value = excluded.value, classification = excluded.classification,
                    metadata = excluded.metadata",
            )?;
            for row in rows {
                let result = stmt.execute(params![
                    row.time.timestamp(),
                    row.category.to_string(),
                    row.name,
                    row.value.to_string(),
                    row.classification,
                    row.metadata.to_string(),
                ]);
                match result {
                    Ok(_) => count += 1,
                    Err(e) => warn!(%e, "skipping bad global indicator row"),
                }
            }
        }
        tx.commit()?;
        crate::metrics::record_db_write("global_indicators", "ok", count as u64);
        Ok(count)
    }

    /// Per-row, best-effort: logs and continues on error (§4.C3).
    pub fn upsert_whale_transactions(&self, rows: &[WhaleTransaction]) -> Result<usize> {
        let conn = self.conn.lock();
        let mut count = 0;
        for tx in rows {
            let result = conn.execute(
                "INSERT INTO whale_transactions
                    (blockchain, tx_hash, time, amount, amount_usd, direction, is_whale, is_anomaly)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(blockchain, time, tx_hash) DO UPDATE SET
                    amount_usd = excluded.amount_usd, is_whale = excluded.is_whale, is_anomaly = excluded.is_anomaly",
                params![
                    tx.blockchain,
                    tx.tx_hash,
                    tx.time.timestamp(),
                    tx.amount.to_string(),
                    tx.amount_usd.map(|v| v.to_string()),
                    tx.direction.to_string(),
                    tx.is_whale,
                    tx.is_anomaly,
                ],
            );
            match result {
                Ok(_) => count += 1,
                Err(e) => error!(tx_hash = %tx.tx_hash, %e, "failed to store whale transaction"),
            }
        }
        crate::metrics::record_db_write("whale_transactions", "ok", count as u64);
        Ok(count)
    }

    pub fn insert_liquidations_batch(&self, rows: &[Liquidation]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO liquidations (time, exchange, symbol, side, price, quantity, value_usd)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(time, exchange, symbol, side, price) DO NOTHING",
            )?;
            for row in rows {
                let result = stmt.execute(params![
                    row.time.timestamp(),
                    row.exchange,
                    row.symbol,
                    row.side.to_string(),
                    row.price.to_string(),
                    row.quantity.to_string(),
                    row.value_usd.to_string(),
                ]);
                match result {
                    Ok(n) => count += n,
                    Err(e) => warn!(%e, "skipping bad liquidation row"),
                }
            }
        }
        tx.commit()?;
        crate::metrics::record_db_write("liquidations", "ok", count as u64);
        Ok(count)
    }

    pub fn insert_market_signals(&self, rows: &[MarketSignal]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO market_signals (time, symbol, signal_type, side, severity, price_at_signal, message, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(time, symbol, signal_type) DO UPDATE SET
                    side = excluded.side, severity = excluded.severity,
                    price_at_signal = excluded.price_at_signal, message = excluded.message,
                    metadata = excluded.metadata",
            )?;
            for row in rows {
                let result = stmt.execute(params![
                    row.time.timestamp(),
                    row.symbol,
                    row.signal_type.to_string(),
                    row.side.to_string(),
                    row.severity.to_string(),
                    row.price_at_signal.map(|p| p.to_string()),
                    row.message,
                    row.metadata.to_string(),
                ]);
                match result {
                    Ok(_) => count += 1,
                    Err(e) => warn!(%e, "skipping bad market signal row"),
                }
            }
        }
        tx.commit()?;
        crate::metrics::record_db_write("market_signals", "ok", count as u64);
        Ok(count)
    }

    /// Append-only, `DO NOTHING` on conflict (supplemented from
    /// `insert_trades_batch` in the original loader, §3).
    pub fn insert_trades_batch(&self, market_id: i64, rows: &[Trade]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO trades (market_id, time, trade_id, price, amount, side)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(market_id, time, trade_id) DO NOTHING",
            )?;
            for row in rows {
                let result = stmt.execute(params![
                    market_id,
                    row.time.timestamp(),
                    row.trade_id,
                    row.price.to_string(),
                    row.amount.to_string(),
                    row.side.to_string(),
                ]);
                match result {
                    Ok(n) => count += n,
                    Err(e) => warn!(%e, "skipping bad trade row"),
                }
            }
        }
        tx.commit()?;
        crate::metrics::record_db_write("trades", "ok", count as u64);
        Ok(count)
    }

    /// Reads stored bars in `[start, end)`, ascending by bucket_start_time.
    /// Supplements §4.C3's operation list: `run_quality_check` (§4.C7) needs
    /// a concrete bar sequence to re-validate, and no other read operation
    /// in the named list returns full rows.
    pub fn get_ohlcv_range(
        &self,
        market_id: i64,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OhlcvBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT bucket_start_time, open, high, low, close, volume FROM ohlcv
             WHERE market_id = ?1 AND timeframe = ?2
             AND bucket_start_time >= ?3 AND bucket_start_time < ?4
             ORDER BY bucket_start_time ASC",
        )?;
        let rows = stmt
            .query_map(
                params![market_id, timeframe.as_str(), start.timestamp(), end.timestamp()],
                |row| {
                    let ts: i64 = row.get(0)?;
                    let open: String = row.get(1)?;
                    let high: String = row.get(2)?;
                    let low: String = row.get(3)?;
                    let close: String = row.get(4)?;
                    let volume: String = row.get(5)?;
                    Ok((ts, open, high, low, close, volume))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut bars = Vec::with_capacity(rows.len());
        for (ts, open, high, low, close, volume) in rows {
            bars.push(OhlcvBar {
                bucket_start_time: Utc.timestamp_opt(ts, 0).unwrap(),
                open: open.parse().context("parsing stored open")?,
                high: high.parse().context("parsing stored high")?,
                low: low.parse().context("parsing stored low")?,
                close: close.parse().context("parsing stored close")?,
                volume: volume.parse().context("parsing stored volume")?,
            });
        }
        Ok(bars)
    }

    pub fn latest_ohlcv_time(
        &self,
        market_id: i64,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ts: Option<i64> = conn
            .query_row(
                "SELECT MAX(bucket_start_time) FROM ohlcv WHERE market_id = ?1 AND timeframe = ?2",
                params![market_id, timeframe.as_str()],
                |row| row.get(0),
            )
            .optional_null()?;
        Ok(ts.map(|t| Utc.timestamp_opt(t, 0).unwrap()))
    }

    /// Active markets up to `limit`, ordered by id (§4.C9's "configured
    /// universe of high-liquidity markets" reads this, capped by the
    /// caller at TOP_SYMBOLS_LIMIT).
    pub fn list_active_markets(&self, limit: u32) -> Result<Vec<Market>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, exchange, symbol, market_type, is_active FROM markets
             WHERE is_active = 1 ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let market_type: String = row.get(3)?;
                let is_active: i64 = row.get(4)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    market_type,
                    is_active,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut markets = Vec::with_capacity(rows.len());
        for (id, exchange, symbol, market_type, is_active) in rows {
            markets.push(Market {
                id,
                exchange,
                symbol,
                market_type: MarketType::parse(&market_type)
                    .ok_or_else(|| anyhow::anyhow!("unknown stored market_type {market_type}"))?,
                is_active: is_active != 0,
            });
        }
        Ok(markets)
    }

    /// Up to `limit` most recent `market_metrics` rows for
    /// `(market_id, name)`, descending by time (§4.C9's funding/OI/OBI
    /// detectors each need the last one or two samples).
    pub fn recent_metrics(
        &self,
        market_id: i64,
        name: &str,
        limit: u32,
    ) -> Result<Vec<(DateTime<Utc>, rust_decimal::Decimal)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, value FROM market_metrics WHERE market_id = ?1 AND name = ?2
             ORDER BY time DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![market_id, name, limit], |row| {
                let ts: i64 = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((ts, value))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (ts, value) in rows {
            out.push((
                Utc.timestamp_opt(ts, 0).unwrap(),
                value.parse().context("parsing stored metric value")?,
            ));
        }
        Ok(out)
    }

    /// `market_metrics` rows for `(market_id, name)` in `[start, end)`,
    /// ascending by time (§4.C9's CVD divergence detector, which needs a
    /// bar-aligned window rather than a most-recent-N slice).
    pub fn metrics_range(
        &self,
        market_id: i64,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, rust_decimal::Decimal)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, value FROM market_metrics WHERE market_id = ?1 AND name = ?2
             AND time >= ?3 AND time < ?4 ORDER BY time ASC",
        )?;
        let rows = stmt
            .query_map(
                params![market_id, name, start.timestamp(), end.timestamp()],
                |row| {
                    let ts: i64 = row.get(0)?;
                    let value: String = row.get(1)?;
                    Ok((ts, value))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (ts, value) in rows {
            out.push((
                Utc.timestamp_opt(ts, 0).unwrap(),
                value.parse().context("parsing stored metric value")?,
            ));
        }
        Ok(out)
    }

    /// Liquidations at or after `since`, ascending by time (§4.C9's whale
    /// liquidation and liquidation-cluster detectors).
    pub fn liquidations_since(&self, since: DateTime<Utc>) -> Result<Vec<Liquidation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, exchange, symbol, side, price, quantity, value_usd FROM liquidations
             WHERE time >= ?1 ORDER BY time ASC",
        )?;
        let rows = stmt
            .query_map(params![since.timestamp()], |row| {
                let ts: i64 = row.get(0)?;
                let exchange: String = row.get(1)?;
                let symbol: String = row.get(2)?;
                let side: String = row.get(3)?;
                let price: String = row.get(4)?;
                let quantity: String = row.get(5)?;
                let value_usd: String = row.get(6)?;
                Ok((ts, exchange, symbol, side, price, quantity, value_usd))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (ts, exchange, symbol, side, price, quantity, value_usd) in rows {
            out.push(Liquidation {
                time: Utc.timestamp_opt(ts, 0).unwrap(),
                exchange,
                symbol,
                side: if side == "buy" { Side::Buy } else { Side::Sell },
                price: price.parse().context("parsing stored liquidation price")?,
                quantity: quantity
                    .parse()
                    .context("parsing stored liquidation quantity")?,
                value_usd: value_usd
                    .parse()
                    .context("parsing stored liquidation value_usd")?,
            });
        }
        Ok(out)
    }

    /// Most recent `name`-category global indicator row (§4.C8's
    /// `etf_freshness_check`, which needs the last-written ETF flow time
    /// per asset to compute staleness).
    pub fn latest_global_indicator(
        &self,
        category: &str,
        name: &str,
    ) -> Result<Option<GlobalIndicator>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT time, value, classification, metadata FROM global_indicators
                 WHERE category = ?1 AND name = ?2 ORDER BY time DESC LIMIT 1",
                params![category, name],
                |row| {
                    let ts: i64 = row.get(0)?;
                    let value: String = row.get(1)?;
                    let classification: Option<String> = row.get(2)?;
                    let metadata: Option<String> = row.get(3)?;
                    Ok((ts, value, classification, metadata))
                },
            )
            .optional()?;
        let Some((ts, value, classification, metadata)) = row else {
            return Ok(None);
        };
        Ok(Some(GlobalIndicator {
            time: Utc.timestamp_opt(ts, 0).unwrap(),
            category: match category {
                "etf" => crate::types::IndicatorCategory::Etf,
                "macro" => crate::types::IndicatorCategory::Macro,
                _ => crate::types::IndicatorCategory::Sentiment,
            },
            name: name.to_string(),
            value: value.parse().context("parsing stored indicator value")?,
            classification,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        }))
    }

    /// Most recent `limit` trades for a market, descending (§4.C8's
    /// `cvd_calibration`, which derives `cvd_delta` from buy/sell trade
    /// flow rather than a venue-provided CVD feed).
    pub fn recent_trades(&self, market_id: i64, limit: u32) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, trade_id, price, amount, side FROM trades
             WHERE market_id = ?1 ORDER BY time DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![market_id, limit], |row| {
                let ts: i64 = row.get(0)?;
                let trade_id: String = row.get(1)?;
                let price: String = row.get(2)?;
                let amount: String = row.get(3)?;
                let side: String = row.get(4)?;
                Ok((ts, trade_id, price, amount, side))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (ts, trade_id, price, amount, side) in rows {
            out.push(Trade {
                time: Utc.timestamp_opt(ts, 0).unwrap(),
                trade_id,
                price: price.parse().context("parsing stored trade price")?,
                amount: amount.parse().context("parsing stored trade amount")?,
                side: if side == "buy" { Side::Buy } else { Side::Sell },
            });
        }
        Ok(out)
    }

    /// Scans expected buckets in `[start, end)` and collapses missing ones
    /// into contiguous runs (§4.C3, and §4.C6's "collapse adjacent missing
    /// runs separated by <= 1 bucket").
    pub fn count_missing_buckets(
        &self,
        market_id: i64,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Gap>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT bucket_start_time FROM ohlcv WHERE market_id = ?1 AND timeframe = ?2
             AND bucket_start_time >= ?3 AND bucket_start_time < ?4",
        )?;
        let existing: std::collections::HashSet<i64> = stmt
            .query_map(
                params![market_id, timeframe.as_str(), start.timestamp(), end.timestamp()],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<_>>()?;

        let step = timeframe.duration().num_seconds();
        let mut gaps = Vec::new();
        let mut run_start: Option<i64> = None;
        let mut run_count: i64 = 0;
        let mut t = start.timestamp();
        while t < end.timestamp() {
            if existing.contains(&t) {
                if let Some(rs) = run_start.take() {
                    gaps.push(Gap {
                        start_time: Utc.timestamp_opt(rs, 0).unwrap(),
                        end_time: Utc.timestamp_opt(t, 0).unwrap(),
                        missing_count: run_count,
                    });
                    run_count = 0;
                }
            } else {
                if run_start.is_none() {
                    run_start = Some(t);
                }
                run_count += 1;
            }
            t += step;
        }
        if let Some(rs) = run_start {
            gaps.push(Gap {
                start_time: Utc.timestamp_opt(rs, 0).unwrap(),
                end_time: Utc.timestamp_opt(t, 0).unwrap(),
                missing_count: run_count,
            });
        }
        Ok(gaps)
    }

    pub fn insert_system_log(
        &self,
        module: &str,
        level: &str,
        message: &str,
        value: Option<f64>,
        metadata: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_log (time, module, level, message, value, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![Utc::now().timestamp(), module, level, message, value, metadata],
        )?;
        debug!(module, level, message, "system log recorded");
        Ok(())
    }

    /// Feeds the `data_quality_summary` logical table and the
    /// quality-score/missing-rate gauges (§6); supplemented from
    /// `insert_quality_metrics` in the original loader.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_quality_summary(
        &self,
        market_id: i64,
        timeframe: Timeframe,
        quality_score: f64,
        missing_rate: f64,
        missing_count: i64,
        expected_count: i64,
        actual_count: i64,
        status: &str,
        issues: Option<&str>,
        backfill_task_created: bool,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO data_quality_summary
                (time, market_id, timeframe, quality_score, missing_rate, missing_count,
                 expected_count, actual_count, status, issues, backfill_task_created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                Utc::now().timestamp(),
                market_id,
                timeframe.as_str(),
                quality_score,
                missing_rate,
                missing_count,
                expected_count,
                actual_count,
                status,
                issues,
                backfill_task_created,
            ],
        )?;
        Ok(())
    }

    // --- backfill task operations (§4.C6), kept alongside C3 since they
    // share the one connection handle. ---

    pub fn create_backfill_task(&self, task: &BackfillTask) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backfill_tasks
                (market_id, data_type, timeframe, start_time, end_time, priority,
                 retry_count, max_retries, expected_records, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.market_id,
                task.data_type.as_str(),
                task.timeframe.map(|t| t.as_str()),
                task.start_time.timestamp(),
                task.end_time.timestamp(),
                task.priority,
                task.retry_count,
                task.max_retries,
                task.expected_records,
                task.status.as_str(),
                task.created_at.timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_pending_tasks(&self, limit: u32) -> Result<Vec<BackfillTaskRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, market_id, data_type, timeframe, start_time, end_time, priority,
                    retry_count, max_retries
             FROM backfill_tasks WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(BackfillTaskRow {
                    id: row.get(0)?,
                    market_id: row.get(1)?,
                    data_type: row.get(2)?,
                    timeframe: row.get(3)?,
                    start_time: row.get(4)?,
                    end_time: row.get(5)?,
                    priority: row.get(6)?,
                    retry_count: row.get(7)?,
                    max_retries: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    /// Marks a task running inside the same mutex-guarded step that
    /// selected it — sufficient given the single-connection backend
    /// (§4.C6's note on `SELECT … FOR UPDATE SKIP LOCKED` equivalence).
    pub fn mark_task_running(&self, task_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backfill_tasks SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![task_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn mark_task_completed(&self, task_id: i64, actual_records: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backfill_tasks SET status = 'completed', actual_records = ?2, completed_at = ?3 WHERE id = ?1",
            params![task_id, actual_records, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn mark_task_failed(&self, task_id: i64, error_message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backfill_tasks SET status = 'failed', error_message = ?2, retry_count = retry_count + 1 WHERE id = ?1",
            params![task_id, error_message],
        )?;
        Ok(())
    }

    pub fn retry_failed_tasks(&self, limit: u32) -> Result<usize> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "UPDATE backfill_tasks SET status = 'pending'
             WHERE id IN (
                SELECT id FROM backfill_tasks
                WHERE status = 'failed' AND retry_count < max_retries
                LIMIT ?1
             )",
            params![limit],
        )?;
        Ok(count)
    }

    /// Removes completed tasks older than `older_than_days` (default 7),
    /// supplemented from `cleanup_old_completed_tasks` (§4.C6).
    pub fn cleanup_old_completed_tasks(&self, older_than_days: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = Utc::now().timestamp() - older_than_days * 86_400;
        let count = conn.execute(
            "DELETE FROM backfill_tasks WHERE status = 'completed' AND completed_at < ?1",
            params![cutoff],
        )?;
        Ok(count)
    }

    pub fn task_status(&self, task_id: i64) -> Result<Option<TaskStatus>> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM backfill_tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional_null()?;
        Ok(status.and_then(|s| TaskStatus::parse(&s)))
    }
}

/// Row projection for the backfill queue (§4.C6); kept separate from the
/// full `BackfillTask` type since the executor only needs these fields to
/// drive a fetch cursor.
#[derive(Debug, Clone)]
pub struct BackfillTaskRow {
    pub id: i64,
    pub market_id: i64,
    pub data_type: String,
    pub timeframe: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
}

trait OptionalNull<T> {
    fn optional_null(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalNull<T> for rusqlite::Result<T> {
    fn optional_null(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(minute: i64) -> OhlcvBar {
        OhlcvBar {
            bucket_start_time: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(12.3),
        }
    }

    #[test]
    fn upserts_are_idempotent() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        let n1 = storage
            .upsert_ohlcv_batch(market, Timeframe::OneMinute, &[bar(0), bar(1)])
            .unwrap();
        assert_eq!(n1, 2);
        let mut updated = bar(0);
        updated.close = dec!(999);
        let n2 = storage
            .upsert_ohlcv_batch(market, Timeframe::OneMinute, &[updated])
            .unwrap();
        assert_eq!(n2, 1);

        let latest = storage
            .latest_ohlcv_time(market, Timeframe::OneMinute)
            .unwrap()
            .unwrap();
        assert_eq!(latest, bar(1).bucket_start_time);
    }

    #[test]
    fn get_or_create_market_is_idempotent() {
        let storage = Storage::open_memory().unwrap();
        let a = storage
            .get_or_create_market("binance", "ETHUSDT")
            .unwrap();
        let b = storage
            .get_or_create_market("binance", "ETHUSDT")
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_buckets_reports_gaps() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        storage
            .upsert_ohlcv_batch(market, Timeframe::OneMinute, &[bar(0), bar(2)])
            .unwrap();
        let gaps = storage
            .count_missing_buckets(
                market,
                Timeframe::OneMinute,
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(180, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start_time, bar(1).bucket_start_time);
        assert_eq!(gaps[0].missing_count, 1);
    }

    #[test]
    fn backfill_task_lifecycle() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        let task = BackfillTask {
            id: 0,
            market_id: market,
            data_type: crate::types::BackfillDataType::Ohlcv,
            timeframe: Some(Timeframe::OneMinute),
            start_time: Utc.timestamp_opt(0, 0).unwrap(),
            end_time: Utc.timestamp_opt(3600, 0).unwrap(),
            priority: 5,
            retry_count: 0,
            max_retries: 3,
            expected_records: Some(60),
            actual_records: None,
            status: TaskStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = storage.create_backfill_task(&task).unwrap();
        let pending = storage.get_pending_tasks(10).unwrap();
        assert_eq!(pending.len(), 1);

        storage.mark_task_running(id).unwrap();
        assert_eq!(storage.task_status(id).unwrap(), Some(TaskStatus::Running));

        storage.mark_task_completed(id, 60).unwrap();
        assert_eq!(storage.task_status(id).unwrap(), Some(TaskStatus::Completed));
    }

    #[test]
    fn rejects_invalid_pool_config() {
        let bad = PersistenceConfig {
            min_connections: 5,
            max_connections: 2,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn latest_global_indicator_returns_most_recent_row() {
        let storage = Storage::open_memory().unwrap();
        let older = GlobalIndicator {
            time: Utc.timestamp_opt(0, 0).unwrap(),
            category: crate::types::IndicatorCategory::Sentiment,
            name: "fear_greed".to_string(),
            value: dec!(20),
            classification: Some("fear".to_string()),
            metadata: serde_json::json!({}),
        };
        let newer = GlobalIndicator {
            time: Utc.timestamp_opt(3600, 0).unwrap(),
            value: dec!(65),
            classification: Some("greed".to_string()),
            ..older.clone()
        };
        storage
            .upsert_global_indicator_batch(&[older, newer.clone()])
            .unwrap();

        let latest = storage
            .latest_global_indicator("sentiment", "fear_greed")
            .unwrap()
            .expect("row present");
        assert_eq!(latest.value, newer.value);
        assert_eq!(latest.classification, newer.classification);

        assert!(storage
            .latest_global_indicator("sentiment", "nonexistent")
            .unwrap()
            .is_none());
    }

    #[test]
    fn recent_trades_orders_newest_first_and_respects_limit() {
        let storage = Storage::open_memory().unwrap();
        let market = storage
            .get_or_create_market("binance", "BTCUSDT")
            .unwrap();
        let trades: Vec<Trade> = (0..5)
            .map(|i| Trade {
                time: Utc.timestamp_opt(i * 60, 0).unwrap(),
                trade_id: format!("t{i}"),
                price: dec!(100),
                amount: dec!(1),
                side: Side::Buy,
            })
            .collect();
        storage.insert_trades_batch(market, &trades).unwrap();

        let recent = storage.recent_trades(market, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].trade_id, "t4");
        assert_eq!(recent[1].trade_id, "t3");
    }
}
