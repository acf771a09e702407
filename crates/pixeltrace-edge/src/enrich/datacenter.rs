use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use tracing::{info, warn};

use pixeltrace_core::record::TrackingRecord;

use crate::state::AppState;

/// CIDR set built from provider publications. One `cidr provider` pair per
/// line; `#` starts a comment.
pub struct DatacenterSet {
    nets: Vec<(IpNet, String)>,
}

impl DatacenterSet {
    /// Load from the configured publication file. An absent file yields an
    /// empty set — datacenter classification is disabled, not fatal.
    pub fn load(path: &str) -> Self {
        if !Path::new(path).exists() {
            warn!(path, "datacenter CIDR file not found; classification disabled");
            return Self { nets: Vec::new() };
        }
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path, error = %e, "datacenter CIDR file unreadable");
                return Self { nets: Vec::new() };
            }
        };
        let set = Self::parse(&raw);
        info!(path, ranges = set.nets.len(), "datacenter CIDR set loaded");
        set
    }

    pub fn parse(raw: &str) -> Self {
        let nets = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let cidr = parts.next()?.parse::<IpNet>().ok()?;
                let name = parts.next().unwrap_or("unknown").to_string();
                Some((cidr, name))
            })
            .collect();
        Self { nets }
    }

    pub fn provider_of(&self, ip: IpAddr) -> Option<&str> {
        self.nets
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, name)| name.as_str())
    }
}

/// Datacenter classification: publishes `_srv_dcName` when the client IP
/// falls inside a known provider range.
pub fn apply(state: &AppState, rec: &mut TrackingRecord) -> anyhow::Result<()> {
    let ip: IpAddr = rec.ip_address.trim().parse()?;
    if let Some(provider) = state.datacenters.provider_of(ip) {
        let provider = provider.to_string();
        rec.append_srv("dcName", &provider);
    }
    Ok(())
}
