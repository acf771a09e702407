use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use pixeltrace_core::record::TrackingRecord;

use crate::state::AppState;

/// Whole-chase budget, referral hop included.
const WHOIS_TIMEOUT: Duration = Duration::from_secs(2);
const IANA_HOST: &str = "whois.iana.org";
const MAX_CACHE: usize = 100_000;

#[derive(Clone)]
pub struct WhoisInfo {
    pub asn: Option<String>,
    pub org: Option<String>,
}

enum Entry {
    Pending,
    Done(Option<WhoisInfo>),
}

fn cache() -> &'static Mutex<HashMap<String, Entry>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// WHOIS ASN: IANA-style chase (query IANA, follow the `refer:` server),
/// cached per address. Publishes `_srv_whoisASN` / `_srv_whoisOrg` on a
/// cache hit; a miss schedules the chase in the background under a 2 s
/// budget and publishes nothing.
pub fn apply(_state: &AppState, rec: &mut TrackingRecord) -> anyhow::Result<()> {
    let key = rec.ip_address.clone();

    let cached = {
        let mut map = cache()
            .lock()
            .map_err(|_| anyhow::anyhow!("whois cache poisoned"))?;
        match map.get(&key) {
            Some(Entry::Done(info)) => Some(info.clone()),
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
        Some(Some(info)) => {
            if let Some(asn) = &info.asn {
                rec.append_srv("whoisASN", asn);
            }
            if let Some(org) = &info.org {
                rec.append_srv("whoisOrg", org);
            }
        }
        Some(None) => {}
        None => {
            tokio::spawn(async move {
                let info = tokio::time::timeout(WHOIS_TIMEOUT, chase(&key))
                    .await
                    .ok()
                    .flatten();
                debug!(ip = %key, found = info.is_some(), "whois fill");
                if let Ok(mut map) = cache().lock() {
                    map.insert(key, Entry::Done(info));
                }
            });
        }
    }
    Ok(())
}

/// Query IANA for the authoritative registry, follow one referral, and
/// parse ASN / organization lines out of the registry's answer.
async fn chase(ip: &str) -> Option<WhoisInfo> {
    let iana = query(IANA_HOST, ip).await?;
    let registry = parse_field(&iana, &["refer:"])?;
    let answer = query(&registry, ip).await?;
    let info = parse_registry_answer(&answer);
    if info.asn.is_none() && info.org.is_none() {
        None
    } else {
        Some(info)
    }
}

async fn query(host: &str, ip: &str) -> Option<String> {
    let mut stream = TcpStream::connect((host, 43)).await.ok()?;
    stream.write_all(format!("{ip}\r\n").as_bytes()).await.ok()?;
    let mut response = Vec::with_capacity(4096);
    stream.read_to_end(&mut response).await.ok()?;
    Some(String::from_utf8_lossy(&response).into_owned())
}

fn parse_field(response: &str, names: &[&str]) -> Option<String> {
    for line in response.lines() {
        let lower = line.to_ascii_lowercase();
        for name in names {
            if let Some(rest) = lower.strip_prefix(name) {
                let value = line[line.len() - rest.len()..].trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

pub fn parse_registry_answer(response: &str) -> WhoisInfo {
    let asn = parse_field(response, &["originas:", "origin:", "aut-num:"])
        .map(|v| v.trim_start_matches("AS").to_string())
        .filter(|v| !v.is_empty());
    let org = parse_field(response, &["orgname:", "org-name:", "owner:", "netname:"]);
    WhoisInfo { asn, org }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arin_style_answer() {
        let answer = "NetRange: 8.8.8.0 - 8.8.8.255\n\
                      NetName: GOGL\n\
                      OriginAS: AS15169\n\
                      OrgName: Google LLC\n";
        let info = parse_registry_answer(answer);
        assert_eq!(info.asn.as_deref(), Some("15169"));
        assert_eq!(info.org.as_deref(), Some("Google LLC"));
    }

    #[test]
    fn parses_ripe_style_answer() {
        let answer = "inetnum: 193.0.0.0 - 193.0.7.255\n\
                      netname: RIPE-NCC\n\
                      org-name: RIPE Network Coordination Centre\n\
                      origin: AS3333\n";
        let info = parse_registry_answer(answer);
        assert_eq!(info.asn.as_deref(), Some("3333"));
        assert!(info.org.is_some());
    }

    #[test]
    fn refer_line_extracted() {
        let iana = "% IANA WHOIS server\nrefer: whois.arin.net\n";
        assert_eq!(
            parse_field(iana, &["refer:"]).as_deref(),
            Some("whois.arin.net")
        );
    }

    #[test]
    fn empty_answer_yields_no_info() {
        let info = parse_registry_answer("% no entries found\n");
        assert!(info.asn.is_none());
        assert!(info.org.is_none());
    }
}
