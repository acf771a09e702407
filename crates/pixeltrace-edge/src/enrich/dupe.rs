use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use pixeltrace_core::record::TrackingRecord;

use super::EnrichContext;

/// Window for the exact-quadruple duplicate check.
const DUPE_WINDOW: Duration = Duration::from_millis(1000);
/// Eviction sweep threshold; the map holds at most a second of traffic
/// plus whatever accumulated since the last sweep.
const SWEEP_LEN: usize = 100_000;

type QuadMap = HashMap<(String, String, String, String), Instant>;

fn quads() -> &'static Mutex<QuadMap> {
    static QUADS: OnceLock<Mutex<QuadMap>> = OnceLock::new();
    QUADS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Sub-second duplicate: `_srv_subSecDupe=1` when the exact
/// (company, pixel, ip, fingerprint) quadruple was seen within the last
/// second.
pub fn apply(rec: &mut TrackingRecord, ctx: &EnrichContext) -> anyhow::Result<()> {
    let key = (
        rec.company_id.clone(),
        rec.pixl_id.clone(),
        rec.ip_address.clone(),
        ctx.fingerprint.clone(),
    );
    let now = Instant::now();

    let mut map = quads()
        .lock()
        .map_err(|_| anyhow::anyhow!("dupe map poisoned"))?;
    let dupe = map
        .insert(key, now)
        .map(|prev| now.duration_since(prev) <= DUPE_WINDOW)
        .unwrap_or(false);
    if map.len() > SWEEP_LEN {
        map.retain(|_, at| now.duration_since(*at) <= DUPE_WINDOW);
    }
    drop(map);

    if dupe {
        rec.append_srv("subSecDupe", "1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(company: &str) -> TrackingRecord {
        TrackingRecord {
            received_at: Utc::now(),
            company_id: company.to_string(),
            pixl_id: "1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            request_path: "/1/1_SMART.GIF".to_string(),
            query_string: String::new(),
            headers_json: "{}".to_string(),
            user_agent: "UA".to_string(),
            referer: String::new(),
        }
    }

    fn ctx(fp: &str) -> EnrichContext {
        EnrichContext {
            fingerprint: fp.to_string(),
            browser_tz: None,
            ch_ua: None,
            ch_platform: None,
            ch_mobile: None,
            ch_model: None,
        }
    }

    #[test]
    fn same_quadruple_within_a_second_is_a_dupe() {
        let c = ctx("dupe-fp-1");
        let mut first = record("dupe-co-1");
        apply(&mut first, &c).unwrap();
        assert!(!first.query_string.contains("_srv_subSecDupe"));

        let mut second = record("dupe-co-1");
        apply(&mut second, &c).unwrap();
        assert!(second.query_string.contains("_srv_subSecDupe=1"));
    }

    #[test]
    fn different_company_is_not_a_dupe() {
        let c = ctx("dupe-fp-2");
        let mut first = record("dupe-co-2");
        apply(&mut first, &c).unwrap();
        let mut second = record("dupe-co-3");
        apply(&mut second, &c).unwrap();
        assert!(!second.query_string.contains("_srv_subSecDupe"));
    }
}
