use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::signals::SignalSnapshot;

/// Idle gap beyond which a fingerprint starts a new session.
const SESSION_WINDOW: Duration = Duration::from_secs(30 * 60);
const SHARDS: usize = 32;

/// Per-fingerprint session state. Hits with the same fingerprint inside
/// the idle window share a session id; a longer gap begins a fresh UUID.
pub struct SessionState {
    pub session_id: String,
    pub started: Instant,
    pub last_hit: Instant,
    pub hit_count: u32,
    pages: HashSet<String>,
}

type SessionMap = HashMap<String, SessionState>;
type SessionShards = [Mutex<SessionMap>; SHARDS];

fn shards() -> &'static SessionShards {
    static SHARDS_CELL: OnceLock<SessionShards> = OnceLock::new();
    SHARDS_CELL.get_or_init(|| std::array::from_fn(|_| Mutex::new(HashMap::new())))
}

fn shard_index(fp: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    fp.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

/// Session output for one hit.
pub struct SessionInfo {
    pub session_id: String,
    pub hit_number: u32,
    pub page_count: usize,
}

/// Stitch the hit into its session. Revisited pages do not grow the page
/// count; every hit grows the hit number.
pub fn stitch(snap: &SignalSnapshot) -> anyhow::Result<SessionInfo> {
    let now = Instant::now();
    let page = snap
        .page_url
        .as_deref()
        .map(normalize_page)
        .unwrap_or_else(|| "/".to_string());

    let shard = &shards()[shard_index(&snap.fingerprint)];
    let mut map = shard
        .lock()
        .map_err(|_| anyhow::anyhow!("session shard poisoned"))?;

    let state = map
        .entry(snap.fingerprint.clone())
        .and_modify(|state| {
            if now.duration_since(state.last_hit) > SESSION_WINDOW {
                *state = fresh_session(now);
            }
        })
        .or_insert_with(|| fresh_session(now));

    state.last_hit = now;
    state.hit_count += 1;
    state.pages.insert(page);

    Ok(SessionInfo {
        session_id: state.session_id.clone(),
        hit_number: state.hit_count,
        page_count: state.pages.len(),
    })
}

fn fresh_session(now: Instant) -> SessionState {
    SessionState {
        session_id: Uuid::new_v4().to_string(),
        started: now,
        last_hit: now,
        hit_count: 0,
        pages: HashSet::new(),
    }
}

/// Path component of the page URL, lowercased, query and fragment shed.
fn normalize_page(url: &str) -> String {
    let no_fragment = url.split('#').next().unwrap_or(url);
    let no_query = no_fragment.split('?').next().unwrap_or(no_fragment);
    let path = match no_query.find("://") {
        Some(idx) => {
            let rest = &no_query[idx + 3..];
            rest.find('/').map(|p| &rest[p..]).unwrap_or("/")
        }
        None => no_query,
    };
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_record;

    fn snap(fp_seed: &str, url: &str) -> SignalSnapshot {
        let query = format!("cv={fp_seed}&url={url}");
        SignalSnapshot::from_record(&test_record("1", "10.0.0.1", &query))
    }

    #[test]
    fn same_fingerprint_shares_a_session() {
        let first = stitch(&snap("sess-a", "https://x.com/home")).unwrap();
        let second = stitch(&snap("sess-a", "https://x.com/pricing")).unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.hit_number, 1);
        assert_eq!(second.hit_number, 2);
        assert_eq!(second.page_count, 2);
    }

    #[test]
    fn revisited_page_does_not_double_count() {
        stitch(&snap("sess-b", "https://x.com/home")).unwrap();
        stitch(&snap("sess-b", "https://x.com/home?utm_source=mail")).unwrap();
        let third = stitch(&snap("sess-b", "https://x.com/home#section")).unwrap();
        assert_eq!(third.hit_number, 3);
        assert_eq!(third.page_count, 1);
    }

    #[test]
    fn different_fingerprints_get_different_sessions() {
        let a = stitch(&snap("sess-c", "https://x.com/")).unwrap();
        let b = stitch(&snap("sess-d", "https://x.com/")).unwrap();
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn session_ids_are_uuids() {
        let info = stitch(&snap("sess-e", "https://x.com/")).unwrap();
        assert!(uuid::Uuid::parse_str(&info.session_id).is_ok());
    }
}
