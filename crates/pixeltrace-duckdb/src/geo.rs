use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use pixeltrace_core::geo::GeoResult;

use crate::schema::GEO_INIT_SQL;

const SYNC_PROCESS: &str = "geo_sync";

/// The edge-owned geolocation database: a range-indexed `ip_geo` serving
/// table plus a `geo_sync` staging table the daily refresh drains by
/// watermark. Separate file from the main store so the two processes never
/// contend for a writer lock.
pub struct GeoStore {
    conn: Arc<Mutex<Connection>>,
}

impl GeoStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(GEO_INIT_SQL)?;
        info!(path, "geo store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory geo store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(GEO_INIT_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Range-index seek: the row whose [ip_from, ip_to] covers the address.
    ///
    /// Only IPv4 is represented in the range table; v6 addresses return
    /// `None` and are covered by the MaxMind secondary enrichment.
    pub async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>> {
        let Some(ip_num) = v4_to_num(ip) else {
            return Ok(None);
        };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT country_code, region, city, postal, lat, lon, timezone,
                      isp, org, is_proxy, is_mobile,
                      STRFTIME(refreshed_at, '%Y-%m-%dT%H:%M:%SZ')
               FROM ip_geo
               WHERE ip_from <= ?1 AND ip_to >= ?1
               ORDER BY ip_from DESC
               LIMIT 1"#,
        )?;
        let found = stmt
            .query_row(duckdb::params![ip_num], |row| {
                Ok(GeoResult {
                    country_code: row.get(0)?,
                    region: row.get(1)?,
                    city: row.get(2)?,
                    postal: row.get(3)?,
                    lat: row.get(4)?,
                    lon: row.get(5)?,
                    timezone: row.get(6)?,
                    isp: row.get(7)?,
                    org: row.get(8)?,
                    is_proxy: row.get::<_, Option<bool>>(9)?.unwrap_or(false),
                    is_mobile: row.get::<_, Option<bool>>(10)?.unwrap_or(false),
                    refreshed_at: row
                        .get::<_, String>(11)
                        .map(|s| parse_ts(&s))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map(Some)
            .or_else(|e| match e {
                duckdb::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(found)
    }

    /// Drain upstream `geo_sync` rows past the sync watermark into the
    /// serving table, advancing the watermark in the same transaction.
    /// Returns the number of ranges applied.
    pub async fn sync_from_upstream(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO geo_watermarks (process_name) VALUES (?1)
             ON CONFLICT (process_name) DO NOTHING",
            duckdb::params![SYNC_PROCESS],
        )?;
        let watermark: i64 = tx.query_row(
            "SELECT last_processed_id FROM geo_watermarks WHERE process_name = ?1",
            duckdb::params![SYNC_PROCESS],
            |row| row.get(0),
        )?;
        let applied = tx.execute(
            r#"INSERT OR REPLACE INTO ip_geo
               (ip_from, ip_to, country_code, region, city, postal, lat, lon,
                timezone, isp, org, is_proxy, is_mobile, refreshed_at)
               SELECT ip_from, ip_to, country_code, region, city, postal, lat,
                      lon, timezone, isp, org, is_proxy, is_mobile,
                      CURRENT_TIMESTAMP
               FROM geo_sync WHERE id > ?1"#,
            duckdb::params![watermark],
        )?;
        tx.execute(
            r#"UPDATE geo_watermarks
               SET last_processed_id = (SELECT COALESCE(MAX(id), last_processed_id) FROM geo_sync),
                   last_run_at = CURRENT_TIMESTAMP
               WHERE process_name = ?1"#,
            duckdb::params![SYNC_PROCESS],
        )?;
        tx.commit()?;
        if applied > 0 {
            info!(ranges = applied, "geo sync applied");
        }
        Ok(applied)
    }

    /// Seed one range row directly into the serving table. Test fixture.
    pub async fn seed_range(
        &self,
        ip_from: i64,
        ip_to: i64,
        country_code: &str,
        city: &str,
        timezone: &str,
        isp: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO ip_geo
               (ip_from, ip_to, country_code, region, city, postal, lat, lon,
                timezone, isp, org, is_proxy, is_mobile, refreshed_at)
               VALUES (?1, ?2, ?3, NULL, ?4, NULL, NULL, NULL, ?5, ?6, NULL,
                       FALSE, FALSE, CURRENT_TIMESTAMP)"#,
            duckdb::params![ip_from, ip_to, country_code, city, timezone, isp],
        )?;
        Ok(())
    }
}

/// Numeric form of a printable IPv4 address, as used by the range index.
pub fn v4_to_num(ip: &str) -> Option<i64> {
    let v4: std::net::Ipv4Addr = ip.trim().parse().ok()?;
    Some(u32::from(v4) as i64)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_to_num_maps_octets() {
        assert_eq!(v4_to_num("0.0.0.1"), Some(1));
        assert_eq!(v4_to_num("1.0.0.0"), Some(16_777_216));
        assert_eq!(v4_to_num("2001:db8::1"), None);
        assert_eq!(v4_to_num("garbage"), None);
    }

    #[tokio::test]
    async fn lookup_hits_covering_range() {
        let store = GeoStore::open_in_memory().unwrap();
        let from = v4_to_num("8.8.8.0").unwrap();
        let to = v4_to_num("8.8.8.255").unwrap();
        store
            .seed_range(from, to, "US", "Mountain View", "America/Los_Angeles", "Example ISP")
            .await
            .unwrap();

        let hit = store.lookup("8.8.8.8").await.unwrap();
        let geo = hit.unwrap();
        assert_eq!(geo.country_code.as_deref(), Some("US"));
        assert_eq!(geo.timezone.as_deref(), Some("America/Los_Angeles"));

        assert!(store.lookup("9.9.9.9").await.unwrap().is_none());
        assert!(store.lookup("2001:db8::1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_applies_only_new_rows() {
        let store = GeoStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().await;
            conn.execute_batch(
                r#"INSERT INTO geo_sync (id, ip_from, ip_to, country_code, loaded_at)
                   VALUES (1, 100, 200, 'DE', CURRENT_TIMESTAMP)"#,
            )
            .unwrap();
        }
        assert_eq!(store.sync_from_upstream().await.unwrap(), 1);
        // Second run with no new upstream rows is a no-op.
        assert_eq!(store.sync_from_upstream().await.unwrap(), 0);
    }
}
