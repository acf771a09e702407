use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::signals::SignalSnapshot;

/// Sliding window for the cross-customer count.
const WINDOW: Duration = Duration::from_secs(5 * 60);
/// Distinct-company count that raises the scraper alert.
const ALERT_COMPANIES: usize = 3;
const SHARDS: usize = 32;

type Key = (String, String);
type Visits = VecDeque<(Instant, String)>;
type IntelMap = HashMap<Key, Visits>;
type IntelShards = [Mutex<IntelMap>; SHARDS];

fn shards() -> &'static IntelShards {
    static SHARDS_CELL: OnceLock<IntelShards> = OnceLock::new();
    SHARDS_CELL.get_or_init(|| std::array::from_fn(|_| Mutex::new(HashMap::new())))
}

fn shard_index(key: &Key) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

pub struct IntelInfo {
    pub distinct_companies: usize,
    pub alert: bool,
}

/// Cross-customer intel: one (ip, fingerprint) actor visiting several
/// customers inside the window is scraping, not browsing.
pub fn observe(snap: &SignalSnapshot) -> anyhow::Result<IntelInfo> {
    let key = (snap.ip.clone(), snap.fingerprint.clone());
    let now = Instant::now();

    let shard = &shards()[shard_index(&key)];
    let mut map = shard
        .lock()
        .map_err(|_| anyhow::anyhow!("intel shard poisoned"))?;
    let visits = map.entry(key).or_default();

    while let Some((at, _)) = visits.front() {
        if now.duration_since(*at) > WINDOW {
            visits.pop_front();
        } else {
            break;
        }
    }
    visits.push_back((now, snap.company_id.clone()));

    let mut distinct: Vec<&str> = Vec::new();
    for (_, company) in visits.iter() {
        if !distinct.contains(&company.as_str()) {
            distinct.push(company);
        }
    }

    Ok(IntelInfo {
        distinct_companies: distinct.len(),
        alert: distinct.len() >= ALERT_COMPANIES,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_record;

    fn snap(company: &str, fp_seed: &str) -> SignalSnapshot {
        SignalSnapshot::from_record(&test_record(
            company,
            "10.9.0.1",
            &format!("cv={fp_seed}"),
        ))
    }

    #[test]
    fn one_company_is_quiet() {
        let info = observe(&snap("100", "intel-a")).unwrap();
        assert_eq!(info.distinct_companies, 1);
        assert!(!info.alert);
    }

    #[test]
    fn three_companies_raise_the_alert() {
        observe(&snap("200", "intel-b")).unwrap();
        observe(&snap("201", "intel-b")).unwrap();
        let info = observe(&snap("202", "intel-b")).unwrap();
        assert_eq!(info.distinct_companies, 3);
        assert!(info.alert);
    }

    #[test]
    fn repeat_visits_to_one_company_do_not_alert() {
        for _ in 0..5 {
            let info = observe(&snap("300", "intel-c")).unwrap();
            assert!(!info.alert);
        }
    }
}
