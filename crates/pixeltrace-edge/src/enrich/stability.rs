use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use pixeltrace_core::record::TrackingRecord;

use super::EnrichContext;

/// Rolling window for the per-IP fingerprint histogram.
const WINDOW: Duration = Duration::from_secs(600);
/// Samples kept per IP.
const MAX_SAMPLES: usize = 32;
const SHARDS: usize = 32;

struct Sample {
    at: Instant,
    fingerprint: String,
}

type StabilityMap = HashMap<String, VecDeque<Sample>>;
type StabilityShards = [Mutex<StabilityMap>; SHARDS];

fn shards() -> &'static StabilityShards {
    static SHARDS_CELL: OnceLock<StabilityShards> = OnceLock::new();
    SHARDS_CELL.get_or_init(|| std::array::from_fn(|_| Mutex::new(HashMap::new())))
}

fn shard_index(ip: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

/// Fingerprint stability: a per-IP histogram of fingerprint hashes over a
/// rolling window. Publishes `_srv_fpStability` — 0 means one fingerprint
/// seen from the address (stable); higher values mean the address is
/// cycling fingerprints.
pub fn apply(rec: &mut TrackingRecord, ctx: &EnrichContext) -> anyhow::Result<()> {
    let now = Instant::now();
    let shard = &shards()[shard_index(&rec.ip_address)];
    let mut map = shard
        .lock()
        .map_err(|_| anyhow::anyhow!("stability shard poisoned"))?;
    let window = map.entry(rec.ip_address.clone()).or_default();

    while let Some(front) = window.front() {
        if now.duration_since(front.at) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
    window.push_back(Sample {
        at: now,
        fingerprint: ctx.fingerprint.clone(),
    });
    while window.len() > MAX_SAMPLES {
        window.pop_front();
    }

    let mut distinct: Vec<&str> = Vec::new();
    for sample in window.iter() {
        if !distinct.contains(&sample.fingerprint.as_str()) {
            distinct.push(&sample.fingerprint);
        }
    }
    let score = distinct.len().saturating_sub(1);
    drop(map);

    rec.append_srv("fpStability", &score.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(ip: &str) -> TrackingRecord {
        TrackingRecord {
            received_at: Utc::now(),
            company_id: "1".to_string(),
            pixl_id: "1".to_string(),
            ip_address: ip.to_string(),
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
    fn single_fingerprint_scores_zero() {
        let mut rec = record("10.50.1.1");
        apply(&mut rec, &ctx("fp-a")).unwrap();
        assert!(rec.query_string.contains("_srv_fpStability=0"));
        let mut rec = record("10.50.1.1");
        apply(&mut rec, &ctx("fp-a")).unwrap();
        assert!(rec.query_string.contains("_srv_fpStability=0"));
    }

    #[test]
    fn cycling_fingerprints_raise_the_score() {
        for fp in ["fp-1", "fp-2", "fp-3"] {
            let mut rec = record("10.50.2.2");
            apply(&mut rec, &ctx(fp)).unwrap();
        }
        let mut rec = record("10.50.2.2");
        apply(&mut rec, &ctx("fp-4")).unwrap();
        assert!(rec.query_string.contains("_srv_fpStability=3"));
    }
}
