use anyhow::Result;
use duckdb::Transaction;
use tracing::info;

use crate::backend::StoreBackend;
use crate::watermark::{advance_watermark, read_watermark};

const PROCESS_NAME: &str = "identity_resolver";

/// Positive geo match requires the consumer address centroid within this
/// many meters of the visit's IP-derived coordinates.
const GEO_MATCH_METERS: f64 = 692.0;

/// Outcome of one identity-resolution run.
#[derive(Debug, Default)]
pub struct IdentityOutcome {
    pub visits_examined: usize,
    pub visits_matched: usize,
}

/// A resolved identity for one visit.
struct Resolved {
    match_type: &'static str,
    match_key: String,
    individual_key: Option<String>,
    address_key: Option<String>,
    confidence: f64,
}

struct VisitRow {
    id: i64,
    company_id: i64,
    pixel_id: i64,
    received_at: String,
    match_email: Option<String>,
    client_params_json: Option<String>,
    ip: String,
    ip_class: Option<String>,
    is_datacenter: Option<bool>,
    lat: Option<f64>,
    lon: Option<f64>,
}

impl StoreBackend {
    /// Resolve identities for visits past the matcher watermark. Strategy
    /// priority per visit: direct unique identifier from `_cp_` (email or
    /// hashed id), geo proximity via integer-bucket prefilter + centroid
    /// distance, cookie-correlated uid, and finally direct IP for
    /// residential addresses only. The first strategy that produces a
    /// consumer wins.
    pub async fn run_identity_batch(&self, limit: usize) -> Result<IdentityOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let watermark = read_watermark(&tx, PROCESS_NAME)?;
        let visits = load_visits(&tx, watermark, limit)?;
        if visits.is_empty() {
            tx.commit()?;
            return Ok(IdentityOutcome::default());
        }

        let mut matched = 0usize;
        for visit in &visits {
            if let Some(resolved) = resolve(&tx, visit)? {
                upsert_match(&tx, visit, &resolved)?;
                matched += 1;
            }
        }

        let new_watermark = visits.iter().map(|v| v.id).max().unwrap_or(watermark);
        advance_watermark(
            &tx,
            PROCESS_NAME,
            new_watermark,
            visits.len() as i64,
            matched as i64,
        )?;
        tx.commit()?;
        info!(
            examined = visits.len(),
            matched,
            watermark = new_watermark,
            "identity batch committed"
        );
        Ok(IdentityOutcome {
            visits_examined: visits.len(),
            visits_matched: matched,
        })
    }
}

fn load_visits(tx: &Transaction<'_>, watermark: i64, limit: usize) -> Result<Vec<VisitRow>> {
    let mut stmt = tx.prepare(
        r#"SELECT v.id, v.company_id, v.pixel_id,
                  STRFTIME(v.received_at, '%Y-%m-%d %H:%M:%S.%g'),
                  v.match_email, v.client_params_json,
                  p.ip, p.srv_ip_class, i.is_datacenter,
                  COALESCE(p.srv_mm_lat, i.mm_lat), COALESCE(p.srv_mm_lon, i.mm_lon)
           FROM visits v
           JOIN parsed_hits p ON p.id = v.id
           LEFT JOIN ips i ON i.id = v.ip_id
           WHERE v.id > ?1
           ORDER BY v.id
           LIMIT ?2"#,
    )?;
    let rows = stmt
        .query_map(duckdb::params![watermark, limit as i64], |row| {
            Ok(VisitRow {
                id: row.get(0)?,
                company_id: row.get(1)?,
                pixel_id: row.get(2)?,
                received_at: row.get(3)?,
                match_email: row.get(4)?,
                client_params_json: row.get(5)?,
                ip: row.get(6)?,
                ip_class: row.get(7)?,
                is_datacenter: row.get(8)?,
                lat: row.get(9)?,
                lon: row.get(10)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn client_param(visit: &VisitRow, key: &str) -> Option<String> {
    let raw = visit.client_params_json.as_deref()?;
    let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
    parsed
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

fn resolve(tx: &Transaction<'_>, visit: &VisitRow) -> Result<Option<Resolved>> {
    // 1. Direct unique identifier carried in _cp_: email, then hashed id.
    if let Some(email) = &visit.match_email {
        if let Some((ind, addr)) = consumer_by(tx, "LOWER(email) = LOWER(?1)", email)? {
            return Ok(Some(Resolved {
                match_type: "email",
                match_key: email.clone(),
                individual_key: ind,
                address_key: addr,
                confidence: 0.95,
            }));
        }
    }
    if let Some(hid) = client_param(visit, "hid") {
        if let Some((ind, addr)) = consumer_by(tx, "uid = ?1", &hid)? {
            return Ok(Some(Resolved {
                match_type: "email",
                match_key: hid,
                individual_key: ind,
                address_key: addr,
                confidence: 1.0,
            }));
        }
    }

    // 2. Geo proximity: integer-bucket coarse filter then centroid
    //    distance refinement.
    if let (Some(lat), Some(lon)) = (visit.lat, visit.lon) {
        if let Some(resolved) = resolve_geo(tx, lat, lon)? {
            return Ok(Some(resolved));
        }
    }

    // 3. Cookie-correlated uid.
    if let Some(cid) = client_param(visit, "cid") {
        if let Some((ind, addr)) = consumer_by(tx, "uid = ?1", &cid)? {
            return Ok(Some(Resolved {
                match_type: "email",
                match_key: cid,
                individual_key: ind,
                address_key: addr,
                confidence: 0.7,
            }));
        }
    }

    // 4. Direct IP — residential addresses only. Datacenter and
    //    non-public classes never identity-match by address.
    let residential = visit.ip_class.as_deref() == Some("public")
        && !visit.is_datacenter.unwrap_or(false);
    if residential {
        if let Some((ind, addr)) = consumer_by(tx, "ip = ?1", &visit.ip)? {
            return Ok(Some(Resolved {
                match_type: "ip",
                match_key: visit.ip.clone(),
                individual_key: ind,
                address_key: addr,
                confidence: 0.5,
            }));
        }
    }

    Ok(None)
}

type ConsumerKeys = (Option<String>, Option<String>);

fn consumer_by(tx: &Transaction<'_>, predicate: &str, value: &str) -> Result<Option<ConsumerKeys>> {
    let sql =
        format!("SELECT individual_key, address_key FROM consumers WHERE {predicate} LIMIT 1");
    let mut stmt = tx.prepare_cached(&sql)?;
    let found = stmt
        .query_row(duckdb::params![value], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map(Some)
        .or_else(|e| match e {
            duckdb::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(found)
}

fn resolve_geo(tx: &Transaction<'_>, lat: f64, lon: f64) -> Result<Option<Resolved>> {
    let lat_bucket = (lat * 100.0).floor() as i32;
    let lon_bucket = (lon * 100.0).floor() as i32;
    let mut stmt = tx.prepare_cached(
        r#"SELECT lat, lon, individual_key, address_key
           FROM consumers
           WHERE lat_bucket BETWEEN ?1 - 1 AND ?1 + 1
             AND lon_bucket BETWEEN ?2 - 1 AND ?2 + 1
             AND lat IS NOT NULL AND lon IS NOT NULL"#,
    )?;
    let candidates: Vec<(f64, f64, Option<String>, Option<String>)> = stmt
        .query_map(duckdb::params![lat_bucket, lon_bucket], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut best: Option<(f64, Option<String>, Option<String>)> = None;
    for (clat, clon, ind, addr) in candidates {
        let d = haversine_meters(lat, lon, clat, clon);
        if d <= GEO_MATCH_METERS && best.as_ref().map(|(bd, _, _)| d < *bd).unwrap_or(true) {
            best = Some((d, ind, addr));
        }
    }

    Ok(best.map(|(_, ind, addr)| Resolved {
        match_type: "geo",
        match_key: format!("{lat_bucket},{lon_bucket}"),
        individual_key: ind,
        address_key: addr,
        confidence: 0.8,
    }))
}

fn upsert_match(tx: &Transaction<'_>, visit: &VisitRow, resolved: &Resolved) -> Result<()> {
    tx.prepare_cached(
        r#"INSERT INTO matches (
               company_id, pixel_id, match_type, match_key,
               first_visit_id, latest_visit_id, first_seen, last_seen,
               hit_count, individual_key, address_key, confidence
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?6, 1, ?7, ?8, ?9)
           ON CONFLICT (company_id, pixel_id, match_type, match_key) DO UPDATE SET
               latest_visit_id = excluded.latest_visit_id,
               last_seen = excluded.last_seen,
               hit_count = matches.hit_count + 1,
               individual_key = COALESCE(excluded.individual_key, matches.individual_key),
               address_key = COALESCE(excluded.address_key, matches.address_key),
               confidence = GREATEST(matches.confidence, excluded.confidence)"#,
    )?
    .execute(duckdb::params![
        visit.company_id,
        visit.pixel_id,
        resolved.match_type,
        resolved.match_key,
        visit.id,
        visit.received_at,
        resolved.individual_key,
        resolved.address_key,
        resolved.confidence,
    ])?;
    Ok(())
}

/// Great-circle distance between two coordinates, in meters.
fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_same_point() {
        assert!(haversine_meters(40.0, -74.0, 40.0, -74.0) < 0.001);
    }

    #[test]
    fn haversine_known_distance() {
        // One degree of latitude is about 111.2 km.
        let d = haversine_meters(40.0, -74.0, 41.0, -74.0);
        assert!((d - 111_195.0).abs() < 200.0, "got {d}");
    }

    #[test]
    fn haversine_within_match_threshold() {
        // ~0.005 degrees latitude ≈ 556 m: inside the 692 m gate.
        let d = haversine_meters(40.0, -74.0, 40.005, -74.0);
        assert!(d < GEO_MATCH_METERS, "got {d}");
        // ~0.007 degrees ≈ 778 m: outside.
        let d = haversine_meters(40.0, -74.0, 40.007, -74.0);
        assert!(d > GEO_MATCH_METERS, "got {d}");
    }
}
