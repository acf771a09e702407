use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, OnceLock};

use sha2::{Digest, Sha256};

use crate::signals::SignalSnapshot;

/// Paths shorter than this carry too little signal to own a digest.
const MIN_POINTS: usize = 3;
/// Spatial quantization grid, pixels.
const GRID_PX: i64 = 10;
/// Temporal quantization, milliseconds.
const GRID_MS: i64 = 100;
const SHARDS: usize = 32;

struct Owner {
    fingerprint: String,
    replay_count: u64,
}

type ReplayMap = HashMap<String, Owner>;
type ReplayShards = [Mutex<ReplayMap>; SHARDS];

fn shards() -> &'static ReplayShards {
    static SHARDS_CELL: OnceLock<ReplayShards> = OnceLock::new();
    SHARDS_CELL.get_or_init(|| std::array::from_fn(|_| Mutex::new(HashMap::new())))
}

fn shard_index(digest: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    digest.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

pub struct ReplayInfo {
    pub detected: bool,
    pub match_fingerprint: Option<String>,
    pub replay_count: u64,
}

/// Behavioral replay detection. The first fingerprint to present a
/// quantized path digest owns it; the same digest under a different
/// fingerprint is a replayed recording. Symmetric in digest, asymmetric in
/// fingerprint.
pub fn check(snap: &SignalSnapshot) -> anyhow::Result<Option<ReplayInfo>> {
    let Some(path) = snap.mouse_path.as_deref() else {
        return Ok(None);
    };
    let Some(digest) = path_digest(path) else {
        return Ok(None);
    };

    let shard = &shards()[shard_index(&digest)];
    let mut map = shard
        .lock()
        .map_err(|_| anyhow::anyhow!("replay shard poisoned"))?;

    match map.get_mut(&digest) {
        None => {
            map.insert(
                digest,
                Owner {
                    fingerprint: snap.fingerprint.clone(),
                    replay_count: 0,
                },
            );
            Ok(Some(ReplayInfo {
                detected: false,
                match_fingerprint: None,
                replay_count: 0,
            }))
        }
        Some(owner) if owner.fingerprint == snap.fingerprint => Ok(Some(ReplayInfo {
            detected: false,
            match_fingerprint: None,
            replay_count: owner.replay_count,
        })),
        Some(owner) => {
            owner.replay_count += 1;
            Ok(Some(ReplayInfo {
                detected: true,
                match_fingerprint: Some(owner.fingerprint.clone()),
                replay_count: owner.replay_count,
            }))
        }
    }
}

/// Quantize the `x,y,t|x,y,t|...` path onto a 10 px / 100 ms grid and
/// digest it. `None` for malformed or too-short paths.
pub fn path_digest(path: &str) -> Option<String> {
    let mut quantized = String::new();
    let mut points = 0usize;
    for triple in path.split('|') {
        let mut parts = triple.split(',');
        let x: i64 = parts.next()?.trim().parse().ok()?;
        let y: i64 = parts.next()?.trim().parse().ok()?;
        let t: i64 = parts.next()?.trim().parse().ok()?;
        quantized.push_str(&format!(
            "{},{},{};",
            x / GRID_PX,
            y / GRID_PX,
            t / GRID_MS
        ));
        points += 1;
    }
    if points < MIN_POINTS {
        return None;
    }
    Some(hex::encode(Sha256::digest(quantized.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_record;

    const PATH: &str = "100,200,0|150,250,100|200,300,200";

    fn snap(fp_seed: &str, path: &str) -> SignalSnapshot {
        SignalSnapshot::from_record(&test_record(
            "1",
            "10.0.0.1",
            &format!("cv={fp_seed}&mp={}", path.replace('|', "%7C").replace(',', "%2C")),
        ))
    }

    #[test]
    fn short_paths_are_ignored() {
        assert!(path_digest("100,200,0|150,250,100").is_none());
        let info = check(&snap("rp-short", "100,200,0")).unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn first_presentation_owns_the_digest() {
        let info = check(&snap("rp-owner-1", PATH)).unwrap().unwrap();
        assert!(!info.detected);
        assert_eq!(info.replay_count, 0);
    }

    #[test]
    fn same_path_different_fingerprint_is_a_replay() {
        let unique = "10,20,0|30,40,100|50,60,200|70,80,300|90,100,400";
        check(&snap("rp-alice", unique)).unwrap();
        let info = check(&snap("rp-mallory", unique)).unwrap().unwrap();
        assert!(info.detected);
        assert_eq!(info.replay_count, 1);
        // The match fingerprint is the original owner's.
        let alice = snap("rp-alice", unique).fingerprint;
        assert_eq!(info.match_fingerprint.as_deref(), Some(alice.as_str()));
    }

    #[test]
    fn same_fingerprint_replaying_itself_is_clean() {
        let unique = "11,21,0|31,41,100|51,61,200|71,81,300|91,101,400";
        check(&snap("rp-self", unique)).unwrap();
        let info = check(&snap("rp-self", unique)).unwrap().unwrap();
        assert!(!info.detected);
    }

    #[test]
    fn quantization_collapses_nearby_paths() {
        // Shifted by less than the grid size: same digest.
        let a = path_digest("100,200,0|150,250,100|200,300,200|250,350,300|300,400,400");
        let b = path_digest("103,202,40|151,254,130|205,306,240|252,355,310|307,403,430");
        assert_eq!(a, b);
        // Shifted past the grid: different digest.
        let c = path_digest("120,220,0|170,270,100|220,320,200|270,370,300|320,420,400");
        assert_ne!(a, c);
    }
}
