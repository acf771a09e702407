use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use pixeltrace_core::record::TrackingRecord;

use super::EnrichContext;

/// Gap below which a hit counts as rapid-fire.
const RAPID_FIRE_MS: u128 = 300;
const SHARDS: usize = 32;
/// Cap per shard so a fingerprint flood cannot grow memory unbounded.
const MAX_PER_SHARD: usize = 50_000;

type LastSeenMap = HashMap<String, Instant>;
type LastSeenShards = [Mutex<LastSeenMap>; SHARDS];

fn shards() -> &'static LastSeenShards {
    static SHARDS_CELL: OnceLock<LastSeenShards> = OnceLock::new();
    SHARDS_CELL.get_or_init(|| std::array::from_fn(|_| Mutex::new(HashMap::new())))
}

fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

/// Rapid-fire: per-fingerprint last-seen gap. Publishes `_srv_lastGapMs`
/// when a previous hit exists and flags `_srv_rapidFire=1` below the
/// threshold.
pub fn apply(rec: &mut TrackingRecord, ctx: &EnrichContext) -> anyhow::Result<()> {
    let now = Instant::now();
    let shard = &shards()[shard_index(&ctx.fingerprint)];
    let mut map = shard
        .lock()
        .map_err(|_| anyhow::anyhow!("rapid-fire shard poisoned"))?;

    let previous = map.insert(ctx.fingerprint.clone(), now);
    if map.len() > MAX_PER_SHARD {
        map.clear();
    }
    drop(map);

    if let Some(previous) = previous {
        let gap_ms = now.duration_since(previous).as_millis();
        rec.append_srv("lastGapMs", &gap_ms.to_string());
        if gap_ms < RAPID_FIRE_MS {
            rec.append_srv("rapidFire", "1");
        }
    }
    Ok(())
}
