use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

use tokio::sync::mpsc;

use pixeltrace_core::config::Config;
use pixeltrace_core::record::TrackingRecord;
use pixeltrace_duckdb::StoreBackend;

/// Shared forge state: the store handle, the bulk-writer queue, and the
/// process counters.
pub struct ForgeState {
    pub config: Arc<Config>,
    pub store: Arc<StoreBackend>,
    /// Bounded hand-off into the bulk writer. `send().await` is the
    /// backpressure point — nothing is ever dropped past the listener.
    pub bulk_tx: mpsc::Sender<TrackingRecord>,
    pub records_received: AtomicU64,
    pub malformed_lines: AtomicU64,
    pub enrich_failures: AtomicU64,
    /// Raised after repeated bulk-writer failures; the process keeps
    /// running best-effort.
    pub degraded: AtomicBool,
}

impl ForgeState {
    pub fn new(config: Config, store: Arc<StoreBackend>, bulk_tx: mpsc::Sender<TrackingRecord>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            bulk_tx,
            records_received: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            enrich_failures: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    /// In-memory state with a drained bulk channel, for unit tests.
    #[doc(hidden)]
    pub async fn for_tests() -> Arc<Self> {
        #[allow(clippy::unwrap_used)]
        let store = Arc::new(StoreBackend::open_in_memory().unwrap());
        let (bulk_tx, mut bulk_rx) = mpsc::channel(64);
        tokio::spawn(async move { while bulk_rx.recv().await.is_some() {} });
        #[allow(clippy::unwrap_used)]
        let config = Config::from_env().unwrap();
        Arc::new(Self::new(config, store, bulk_tx))
    }
}
