use serde_json::{Map, Value};

use crate::record::{CP_PREFIX, SRV_PREFIX};

/// Look up one query-string parameter by exact key.
///
/// Returns the URL-decoded value of the first occurrence, or `None` when the
/// key is absent. A leading `?` is tolerated. This is the single decode path
/// used by the ETL parser for every typed column extraction.
pub fn get_query_param(query_string: &str, key: &str) -> Option<String> {
    let qs = query_string.strip_prefix('?').unwrap_or(query_string);
    url::form_urlencoded::parse(qs.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Decode the full query string into (key, value) pairs, preserving order.
pub fn parse_pairs(query_string: &str) -> Vec<(String, String)> {
    let qs = query_string.strip_prefix('?').unwrap_or(query_string);
    url::form_urlencoded::parse(qs.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Collect all client-supplied `_cp_*` parameters into a JSON object, with
/// the prefix stripped (`_cp_email=a%40b` → `{"email":"a@b"}`).
///
/// First occurrence wins on duplicate keys. Unknown names pass through
/// opaquely; the only consumer that interprets a key is identity resolution
/// (`email`, `hid`).
pub fn extract_client_params(query_string: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in parse_pairs(query_string) {
        if let Some(name) = key.strip_prefix(CP_PREFIX) {
            if !name.is_empty() && !out.contains_key(name) {
                out.insert(name.to_string(), Value::String(value));
            }
        }
    }
    out
}

/// Collect all `_srv_*` parameters with the prefix stripped. Used by the
/// forge tiers to read the edge's enrichment output without re-deriving it.
pub fn extract_srv_params(query_string: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in parse_pairs(query_string) {
        if let Some(name) = key.strip_prefix(SRV_PREFIX) {
            if !name.is_empty() && !out.contains_key(name) {
                out.insert(name.to_string(), Value::String(value));
            }
        }
    }
    out
}
