use std::sync::Arc;

use anyhow::Result;
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use pixeltrace_core::record::TrackingRecord;

use crate::schema::init_sql;

/// The main analytics store.
///
/// DuckDB is single-writer: concurrent reads are fine, but concurrent
/// writes cause contention. The connection is wrapped in
/// `Arc<tokio::sync::Mutex<_>>` so the async runtime serialises all writes
/// through the bulk-writer and ETL tasks while the struct stays cheap to
/// clone and share. The forge process owns this file exclusively.
pub struct StoreBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl StoreBackend {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(path, memory_limit, "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the store read-only. Used by the edge for geo-cache pre-warm;
    /// fails when the forge holds the writer lock, which callers treat as
    /// non-fatal.
    pub fn open_read_only(path: &str) -> Result<Self> {
        let cfg = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(path, cfg)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Top-N most-hit IPs from the IP dimension, most active first. Feeds
    /// the geo cache pre-warm at edge startup.
    pub async fn top_hot_ips(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT ip FROM ips ORDER BY hit_count DESC LIMIT ?1")?;
        let ips = stmt
            .query_map(duckdb::params![limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ips)
    }

    /// Open an **in-memory** store. Intended for tests only — data is
    /// discarded when the struct is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("256MB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bulk-insert one batch of records into `raw_hits` in a single
    /// transaction (one fsync instead of N). Row order within the batch
    /// matches input order; ids come from the raw sequence and are
    /// monotonic.
    ///
    /// Returns the number of rows written. An error rolls the whole batch
    /// back — the caller owns retry.
    pub async fn insert_raw_batch(&self, records: &[TrackingRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"INSERT INTO raw_hits (
                    company_id, pixel_id, ip, request_path, query_string,
                    headers_json, user_agent, referer, received_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            )?;
            for rec in records {
                stmt.execute(duckdb::params![
                    rec.company_id,
                    rec.pixl_id,
                    rec.ip_address,
                    rec.request_path,
                    rec.query_string,
                    rec.headers_json,
                    rec.user_agent,
                    rec.referer,
                    rec.received_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Run a closure against the raw connection. Escape hatch for
    /// integration tests and one-off queries; production paths go through
    /// the typed methods.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// `SELECT 1` liveness check. Errors if the connection is unavailable
    /// (file locked, disk full, etc.).
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Highest raw id currently committed, 0 when the table is empty.
    pub async fn max_raw_id(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let max: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM raw_hits", [], |row| {
                row.get(0)
            })?;
        Ok(max)
    }

    /// Seed a consumer row. Test-fixture helper for the identity resolver;
    /// the consumers table is externally owned in production.
    pub async fn seed_consumer(
        &self,
        id: i64,
        uid: Option<&str>,
        email: Option<&str>,
        ip: Option<&str>,
        lat: Option<f64>,
        lon: Option<f64>,
        individual_key: &str,
        address_key: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO consumers
               (id, uid, email, ip, lat, lon, lat_bucket, lon_bucket, individual_key, address_key)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                       CAST(FLOOR(COALESCE(?5, 0) * 100) AS INTEGER),
                       CAST(FLOOR(COALESCE(?6, 0) * 100) AS INTEGER),
                       ?7, ?8)"#,
            duckdb::params![id, uid, email, ip, lat, lon, individual_key, address_key],
        )?;
        Ok(())
    }
}
