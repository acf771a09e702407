use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use pixeltrace_core::record::TrackingRecord;

use crate::state::AppState;

/// PTR lookup budget. The lookup itself runs in a background task; this
/// bounds that task, never the request path.
const LOOKUP_TIMEOUT: Duration = Duration::from_millis(250);
const MAX_CACHE: usize = 100_000;

/// Hostname substrings that mark a cloud/datacenter reverse name.
const CLOUD_PATTERNS: &[&str] = &[
    "amazonaws.com",
    "googleusercontent.com",
    "cloud.google",
    "azure",
    "digitalocean",
    "linode",
    "vultr",
    "hetzner",
    "ovh.",
    "contabo",
];

enum Entry {
    Pending,
    Done(Option<String>),
}

fn cache() -> &'static Mutex<HashMap<String, Entry>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn resolver() -> &'static TokioAsyncResolver {
    static RESOLVER: OnceLock<TokioAsyncResolver> = OnceLock::new();
    RESOLVER.get_or_init(|| {
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

/// Reverse DNS: publishes `_srv_rdns` (and `_srv_rdnsCloud=1` when the
/// hostname matches a cloud pattern) from the in-process cache. The first
/// hit from an address schedules the PTR lookup in the background and
/// publishes nothing.
pub fn apply(_state: &AppState, rec: &mut TrackingRecord) -> anyhow::Result<()> {
    let ip: IpAddr = rec.ip_address.trim().parse()?;
    let key = rec.ip_address.clone();

    let cached = {
        let mut map = cache()
            .lock()
            .map_err(|_| anyhow::anyhow!("rdns cache poisoned"))?;
        match map.get(&key) {
            Some(Entry::Done(host)) => Some(host.clone()),
            Some(Entry::Pending) => return Ok(()),
            None => {
                if map.len() > MAX_CACHE {
                    map.clear();
                }
                map.insert(key.clone(), Entry::Pending);
                None
            }
        }
    };

    match cached {
        Some(Some(host)) => {
            rec.append_srv("rdns", &host);
            if is_cloud_hostname(&host) {
                rec.append_srv("rdnsCloud", "1");
            }
        }
        Some(None) => {}
        None => {
            tokio::spawn(async move {
                let outcome =
                    tokio::time::timeout(LOOKUP_TIMEOUT, resolver().reverse_lookup(ip)).await;
                let host = match outcome {
                    Ok(Ok(names)) => names
                        .iter()
                        .next()
                        .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
                    Ok(Err(_)) | Err(_) => None,
                };
                debug!(ip = %key, host = ?host, "rdns fill");
                if let Ok(mut map) = cache().lock() {
                    map.insert(key, Entry::Done(host));
                }
            });
        }
    }
    Ok(())
}

pub fn is_cloud_hostname(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    CLOUD_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_patterns_match() {
        assert!(is_cloud_hostname(
            "ec2-3-8-1-2.eu-west-2.compute.amazonaws.com"
        ));
        assert!(is_cloud_hostname("static.96.12.108.65.clients.your-server.hetzner.de"));
        assert!(!is_cloud_hostname("cpe-76-180-1-1.buffalo.res.rr.com"));
    }
}
