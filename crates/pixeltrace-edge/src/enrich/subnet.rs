use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use pixeltrace_core::record::TrackingRecord;

use super::EnrichContext;

/// Ring capacity per /24.
const RING_CAPACITY: usize = 256;
/// Velocity window.
const WINDOW: Duration = Duration::from_secs(15);
const SHARDS: usize = 32;

struct Sample {
    at: Instant,
    ip: String,
}

type SubnetMap = HashMap<String, VecDeque<Sample>>;
type SubnetShards = [Mutex<SubnetMap>; SHARDS];

fn shards() -> &'static SubnetShards {
    static SHARDS_CELL: OnceLock<SubnetShards> = OnceLock::new();
    SHARDS_CELL.get_or_init(|| std::array::from_fn(|_| Mutex::new(HashMap::new())))
}

fn shard_index(subnet: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    subnet.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}

/// Subnet velocity: a sliding ring of the last hits per /24. Publishes the
/// ring depth, the distinct-IP count in the window, the in-window hit
/// count, and fires the alert when more than `alert_threshold` distinct
/// addresses from the same /24 land inside the window.
pub fn apply(
    rec: &mut TrackingRecord,
    _ctx: &EnrichContext,
    alert_threshold: usize,
) -> anyhow::Result<()> {
    let Some(subnet) = subnet_of(&rec.ip_address) else {
        // v6 and unparsable addresses have no /24; nothing to track.
        return Ok(());
    };
    let now = Instant::now();

    let shard = &shards()[shard_index(&subnet)];
    let mut map = shard
        .lock()
        .map_err(|_| anyhow::anyhow!("subnet shard poisoned"))?;
    let ring = map.entry(subnet).or_default();

    ring.push_back(Sample {
        at: now,
        ip: rec.ip_address.clone(),
    });
    while ring.len() > RING_CAPACITY {
        ring.pop_front();
    }

    let in_window: Vec<&Sample> = ring
        .iter()
        .filter(|s| now.duration_since(s.at) <= WINDOW)
        .collect();
    let hits_in_window = in_window.len();
    let mut distinct: Vec<&str> = Vec::new();
    for sample in &in_window {
        if !distinct.contains(&sample.ip.as_str()) {
            distinct.push(&sample.ip);
        }
    }

    rec.append_srv("subnetHits", &ring.len().to_string());
    rec.append_srv("subnetIps", &distinct.len().to_string());
    rec.append_srv("hitsIn15s", &hits_in_window.to_string());
    if distinct.len() > alert_threshold {
        rec.append_srv("subnetAlert", "1");
    }
    Ok(())
}

fn subnet_of(ip: &str) -> Option<String> {
    let v4: std::net::Ipv4Addr = ip.trim().parse().ok()?;
    let [a, b, c, _] = v4.octets();
    Some(format!("{a}.{b}.{c}.0/24"))
}
