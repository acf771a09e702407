use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tracing::debug;

use pixeltrace_core::qs::get_query_param;
use pixeltrace_core::record::TrackingRecord;

use crate::state::AppState;

pub mod bots;
pub mod datacenter;
pub mod dupe;
pub mod geo;
pub mod hints;
pub mod maxmind;
pub mod rapidfire;
pub mod rdns;
pub mod stability;
pub mod subnet;
pub mod ua;
pub mod whois;

/// Fast-tier enrichment names, in execution order. Indexes into
/// [`EnrichCounters`].
pub const ENRICHMENT_NAMES: [&str; 12] = [
    "subnet_velocity",
    "rapid_fire",
    "subsec_dupe",
    "datacenter",
    "ip_class",
    "geo",
    "fp_stability",
    "known_bot",
    "ua_parse",
    "reverse_dns",
    "maxmind",
    "whois",
];

/// Per-enrichment failure counters. An enrichment that errors is skipped —
/// its `_srv_` key is simply omitted — and the counter ticks. The pipeline
/// never fails a hit because of an enrichment.
#[derive(Default)]
pub struct EnrichCounters {
    failures: [AtomicU64; 12],
}

impl EnrichCounters {
    fn bump(&self, idx: usize) {
        self.failures[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        ENRICHMENT_NAMES
            .iter()
            .zip(self.failures.iter())
            .map(|(name, counter)| (*name, counter.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.failures
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

/// Values the enrichments read repeatedly, extracted once per hit.
pub struct EnrichContext {
    /// Stable fingerprint: hash of the browser-derived field set when any
    /// of it is present, else a hash of (ip, user-agent).
    pub fingerprint: String,
    /// Browser-reported IANA timezone string, when the script sent one.
    pub browser_tz: Option<String>,
    pub ch_ua: Option<String>,
    pub ch_platform: Option<String>,
    pub ch_mobile: Option<String>,
    pub ch_model: Option<String>,
}

impl EnrichContext {
    pub fn from_record(rec: &TrackingRecord, headers: &serde_json::Value) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        Self {
            fingerprint: fingerprint_of(rec),
            browser_tz: get_query_param(&rec.query_string, "tz"),
            ch_ua: header("sec-ch-ua"),
            ch_platform: header("sec-ch-ua-platform"),
            ch_mobile: header("sec-ch-ua-mobile"),
            ch_model: header("sec-ch-ua-model"),
        }
    }
}

/// Compute the stable per-device fingerprint for in-process state keys.
///
/// Hash of the five browser fingerprint components when at least one is
/// present; otherwise a hash of (ip, user-agent) so fingerprint-keyed
/// enrichments still work for legacy hits. 16 hex chars.
pub fn fingerprint_of(rec: &TrackingRecord) -> String {
    let q = |key: &str| get_query_param(&rec.query_string, key);
    let parts = [q("cv"), q("wgl"), q("au"), q("fonts"), q("gr")];
    let input = if parts.iter().any(Option::is_some) {
        parts
            .iter()
            .map(|p| p.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("|")
    } else {
        format!("{}|{}", rec.ip_address, rec.user_agent)
    };
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

/// Run the twelve fast enrichments in their fixed order. Total wall time is
/// CPU-bound single-digit milliseconds: the DNS, WHOIS, and geo steps are
/// cache reads that schedule background fills on miss rather than waiting.
pub fn apply_fast(state: &AppState, rec: &mut TrackingRecord, ctx: &EnrichContext) {
    let counters = &state.enrich_counters;
    let mut run = |idx: usize, result: anyhow::Result<()>| {
        if let Err(e) = result {
            counters.bump(idx);
            debug!(enrichment = ENRICHMENT_NAMES[idx], error = %e, "enrichment skipped");
        }
    };

    run(0, subnet::apply(rec, ctx, state.config.subnet_alert_ips));
    run(1, rapidfire::apply(rec, ctx));
    run(2, dupe::apply(rec, ctx));
    run(3, datacenter::apply(state, rec));
    let classification = pixeltrace_core::ipclass::classify(&rec.ip_address);
    run(4, geo::apply_class(rec, classification));
    run(5, geo::apply_lookup(state, rec, ctx, classification));
    run(6, stability::apply(rec, ctx));
    run(7, bots::apply(rec));
    run(8, ua::apply(rec));
    run(9, rdns::apply(state, rec));
    run(10, maxmind::apply(state, rec));
    run(11, whois::apply(state, rec));
    // Client-hint capture rides along with the UA tier; failures fold into
    // its counter.
    run(8, hints::apply(rec, ctx));
}
