use chrono::{DateTime, Utc};

/// One IP geolocation result, as served by the geo cache.
///
/// Two independent geo enrichments exist in the pipeline: this (the primary,
/// backed by the range-indexed geo table) and the MaxMind secondary. They
/// are stored in parallel and never reconciled.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoResult {
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub postal: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timezone: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    pub is_proxy: bool,
    pub is_mobile: bool,
    pub refreshed_at: DateTime<Utc>,
}
