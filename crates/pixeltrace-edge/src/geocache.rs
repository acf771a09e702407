use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pixeltrace_core::geo::GeoResult;
use pixeltrace_duckdb::GeoStore;

/// Sliding TTL for warm-tier entries.
const WARM_TTL: Duration = Duration::from_secs(3600);
/// Warm-tier capacity.
const WARM_CAPACITY: usize = 65_536;
/// Pending-fill queue bound. Misses beyond this are dropped; the next hit
/// for the same IP re-queues it.
const FILL_QUEUE: usize = 4_096;

/// Two-tier geolocation cache over the range-indexed geo store.
///
/// **Hot** is a read-mostly map refilled by the single background fill
/// task; **warm** is a sized LRU with a sliding TTL. `get` never blocks on
/// a lookup: a miss enqueues the IP for the fill task and returns `None`,
/// so the request path never waits on the store.
pub struct GeoCache {
    hot: RwLock<HashMap<String, GeoResult>>,
    warm: Mutex<LruCache<String, (GeoResult, Instant)>>,
    fill_tx: mpsc::Sender<String>,
}

impl GeoCache {
    /// Create the cache and spawn its background fill task against `store`.
    pub fn new(store: Arc<GeoStore>) -> Arc<Self> {
        let (fill_tx, fill_rx) = mpsc::channel(FILL_QUEUE);
        let cache = Arc::new(Self {
            hot: RwLock::new(HashMap::new()),
            warm: Mutex::new(LruCache::new(
                NonZeroUsize::new(WARM_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            fill_tx,
        });
        tokio::spawn(run_fill_loop(Arc::clone(&cache), store, fill_rx));
        cache
    }

    /// Hot/warm lookup. On miss, schedules a background fill and returns
    /// `None` immediately.
    pub fn get(&self, ip: &str) -> Option<GeoResult> {
        if let Ok(hot) = self.hot.read() {
            if let Some(geo) = hot.get(ip) {
                return Some(geo.clone());
            }
        }

        if let Ok(mut warm) = self.warm.lock() {
            if let Some((geo, touched)) = warm.get_mut(ip) {
                if touched.elapsed() < WARM_TTL {
                    *touched = Instant::now();
                    return Some(geo.clone());
                }
                warm.pop(ip);
            }
        }

        // Best-effort enqueue; a full queue just means the next hit retries.
        let _ = self.fill_tx.try_send(ip.to_string());
        None
    }

    /// Insert into both tiers. Called by the fill task and pre-warm.
    pub fn insert(&self, ip: String, geo: GeoResult) {
        if let Ok(mut warm) = self.warm.lock() {
            warm.put(ip.clone(), (geo.clone(), Instant::now()));
        }
        if let Ok(mut hot) = self.hot.write() {
            hot.insert(ip, geo);
        }
    }

    /// Clear the hot tier (daily refresh and the control endpoint). Warm
    /// entries are left to decay through their TTL.
    pub fn clear_hot(&self) {
        if let Ok(mut hot) = self.hot.write() {
            hot.clear();
        }
    }

    /// Clear both tiers (control endpoint).
    pub fn clear_all(&self) {
        self.clear_hot();
        if let Ok(mut warm) = self.warm.lock() {
            warm.clear();
        }
    }

    pub fn hot_len(&self) -> usize {
        self.hot.read().map(|h| h.len()).unwrap_or(0)
    }
}

/// Single-consumer fill loop: seek the geo store for each queued miss and
/// populate both tiers. Lookup failures are logged and skipped — the cache
/// simply stays cold for that address.
async fn run_fill_loop(
    cache: Arc<GeoCache>,
    store: Arc<GeoStore>,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(ip) = rx.recv().await {
        // Another queued request may have filled it already.
        if cache.hot.read().map(|h| h.contains_key(&ip)).unwrap_or(false) {
            continue;
        }
        match store.lookup(&ip).await {
            Ok(Some(geo)) => {
                debug!(ip = %ip, "geo cache fill");
                cache.insert(ip, geo);
            }
            Ok(None) => {}
            Err(e) => warn!(ip = %ip, error = %e, "geo lookup failed"),
        }
    }
}
