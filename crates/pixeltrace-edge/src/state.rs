use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::warn;

use pixeltrace_core::config::Config;

use crate::dispatch::Dispatcher;
use crate::enrich::datacenter::DatacenterSet;
use crate::enrich::EnrichCounters;
use crate::geocache::GeoCache;

/// Shared edge state injected into every handler via
/// [`axum::extract::State`]. Heavy resources are `Arc`-wrapped so the
/// struct clones cheaply.
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub geo_cache: Arc<GeoCache>,
    pub datacenters: DatacenterSet,
    /// CIDRs whose X-Forwarded-For is trusted (beyond loopback).
    pub trusted_proxies: Vec<IpNet>,
    /// Control-endpoint allow-list (loopback is always allowed).
    pub control_allow: Vec<IpAddr>,
    pub enrich_counters: EnrichCounters,
    /// Browser script template with the pixel URL placeholder.
    pub script_template: String,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>, geo_cache: Arc<GeoCache>) -> Self {
        let datacenters = DatacenterSet::load(&config.datacenter_cidr_path);
        let trusted_proxies = parse_cidrs(&config.trusted_proxies);
        let control_allow = parse_ips(&config.dashboard_allowed_ips);
        let script_template = load_script_template(&config.script_template_path);
        Self {
            config: Arc::new(config),
            dispatcher,
            geo_cache,
            datacenters,
            trusted_proxies,
            control_allow,
            enrich_counters: EnrichCounters::default(),
            script_template,
        }
    }

    /// Control endpoints answer only loopback and allow-listed callers.
    pub fn control_authorized(&self, peer: Option<IpAddr>) -> bool {
        match peer {
            Some(ip) => ip.is_loopback() || self.control_allow.contains(&ip),
            None => false,
        }
    }
}

fn parse_cidrs(raw: &[String]) -> Vec<IpNet> {
    raw.iter()
        .filter_map(|entry| match entry.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                warn!(entry = %entry, "ignoring unparsable trusted proxy CIDR");
                None
            }
        })
        .collect()
}

fn parse_ips(raw: &[String]) -> Vec<IpAddr> {
    raw.iter()
        .filter_map(|entry| match entry.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(entry = %entry, "ignoring unparsable allow-list IP");
                None
            }
        })
        .collect()
}

/// Default loader body served when no script template file is configured.
/// The real browser script is an external artifact; this stub keeps the
/// endpoint serving something coherent in development.
const FALLBACK_SCRIPT: &str = "(function(){var i=new Image(1,1);i.src='{{PIXEL_URL}}?'+\
new Date().getTime();})();\n";

fn load_script_template(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(template) => template,
        Err(_) => {
            warn!(path, "script template not found; serving fallback loader");
            FALLBACK_SCRIPT.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_auth_allows_loopback_only_by_default() {
        let cfg = Config::from_env().unwrap();
        let state = AppState::new(
            cfg,
            Arc::new(Dispatcher::new(16)),
            GeoCache::new(Arc::new(
                pixeltrace_duckdb::GeoStore::open_in_memory().unwrap(),
            )),
        );
        assert!(state.control_authorized(Some("127.0.0.1".parse().unwrap())));
        assert!(state.control_authorized(Some("::1".parse().unwrap())));
        assert!(!state.control_authorized(Some("203.0.113.9".parse().unwrap())));
        assert!(!state.control_authorized(None));
    }
}
