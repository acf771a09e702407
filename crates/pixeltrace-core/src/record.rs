use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum accepted query string, in bytes. Longer requests are rejected
/// with 400 at the edge.
pub const MAX_QUERY_STRING_BYTES: usize = 16_384;
/// Maximum accepted request URL, in bytes.
pub const MAX_URL_BYTES: usize = 8_192;
/// User-Agent and Referer are stored truncated to this many characters.
pub const MAX_HEADER_FIELD_CHARS: usize = 2_000;

/// Prefix for server-generated enrichment parameters appended to the
/// query string. Readers must treat unknown `_srv_*` names as opaque.
pub const SRV_PREFIX: &str = "_srv_";
/// Prefix for client-supplied custom parameters.
pub const CP_PREFIX: &str = "_cp_";

/// The record captured for one pixel hit.
///
/// This is both the wire payload on the edge→forge stream (one JSON object
/// per line) and the row shape of the raw store table. Wire keys are fixed
/// and must stay stable across versions, hence the explicit renames.
///
/// Created by edge capture; mutated only by enrichments, which append
/// `_srv_*` key=value pairs to `query_string`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRecord {
    #[serde(rename = "ReceivedAt", with = "iso_utc_ms")]
    pub received_at: DateTime<Utc>,
    #[serde(rename = "CompanyID")]
    pub company_id: String,
    #[serde(rename = "PiXLID")]
    pub pixl_id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "RequestPath")]
    pub request_path: String,
    #[serde(rename = "QueryString")]
    pub query_string: String,
    #[serde(rename = "HeadersJson")]
    pub headers_json: String,
    #[serde(rename = "UserAgent")]
    pub user_agent: String,
    #[serde(rename = "Referer")]
    pub referer: String,
}

impl TrackingRecord {
    /// Append one server enrichment parameter (`_srv_<key>=<value>`) to the
    /// query string. The value is percent-encoded; the key is trusted (all
    /// `_srv_` keys are compile-time literals).
    pub fn append_srv(&mut self, key: &str, value: &str) {
        if !self.query_string.is_empty() {
            self.query_string.push('&');
        }
        self.query_string.push_str(SRV_PREFIX);
        self.query_string.push_str(key);
        self.query_string.push('=');
        for chunk in url::form_urlencoded::byte_serialize(value.as_bytes()) {
            self.query_string.push_str(chunk);
        }
    }

    /// Truncate a header-derived field to the stored character limit.
    pub fn clamp_header_field(value: &str) -> String {
        if value.chars().count() <= MAX_HEADER_FIELD_CHARS {
            value.to_string()
        } else {
            value.chars().take(MAX_HEADER_FIELD_CHARS).collect()
        }
    }

    /// Serialize as one line of the edge→forge stream (no trailing newline).
    pub fn to_wire_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Fixed-precision UTC timestamps on the wire: ISO-8601 with milliseconds
/// (`2026-08-01T12:34:56.789Z`). Deserialization accepts any RFC 3339 string.
mod iso_utc_ms {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
