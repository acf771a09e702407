use std::collections::HashMap;

use sha2::{Digest, Sha256};

use pixeltrace_core::qs::parse_pairs;
use pixeltrace_core::record::TrackingRecord;

/// Every signal the heavy tiers read, parsed out of the query string once
/// per record. Client keys and the edge's `_srv_` keys land in the same
/// snapshot so no enrichment re-scans the raw string.
#[derive(Debug, Default, Clone)]
pub struct SignalSnapshot {
    pub company_id: String,
    pub pixel_id: String,
    pub ip: String,
    pub fingerprint: String,

    // Client hardware / environment.
    pub platform: Option<String>,
    pub cores: Option<i32>,
    pub memory_gb: Option<f64>,
    pub touch_points: Option<i32>,
    pub screen_w: Option<i32>,
    pub screen_h: Option<i32>,
    pub gpu_renderer: Option<String>,
    pub canvas_hash: Option<String>,
    pub webgl_hash: Option<String>,
    pub audio_hash: Option<String>,
    pub fonts: Vec<String>,
    pub webdriver: bool,
    pub battery_level: Option<f64>,
    pub voice_count: Option<i32>,
    pub hover: Option<String>,
    pub touch_support: Option<bool>,

    // Locale.
    pub language: Option<String>,
    pub timezone: Option<String>,
    pub number_format: Option<String>,
    pub calendar: Option<String>,

    // Behavior.
    pub mouse_moves: Option<i32>,
    pub mouse_entropy: Option<f64>,
    pub mouse_path: Option<String>,
    pub page_url: Option<String>,

    // Edge enrichment output.
    pub ip_class: Option<String>,
    pub datacenter: bool,
    pub known_bot: bool,
    pub geo_cc: Option<String>,
    pub geo_tz: Option<String>,
    pub geo_tz_mismatch: bool,
    pub fp_stability: Option<i32>,
    pub browser: Option<String>,
    pub browser_ver: Option<String>,
    pub os: Option<String>,
    pub os_ver: Option<String>,
    pub device_type: Option<String>,
}

impl SignalSnapshot {
    pub fn from_record(rec: &TrackingRecord) -> Self {
        let mut map: HashMap<String, String> = HashMap::new();
        for (key, value) in parse_pairs(&rec.query_string) {
            map.entry(key).or_insert(value);
        }
        let s = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
        let i = |key: &str| s(key).and_then(|v| v.trim().parse::<i32>().ok());
        let f = |key: &str| s(key).and_then(|v| v.trim().parse::<f64>().ok());
        let b = |key: &str| {
            map.get(key)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let fonts: Vec<String> = s("fonts")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            company_id: rec.company_id.clone(),
            pixel_id: rec.pixl_id.clone(),
            ip: rec.ip_address.clone(),
            fingerprint: fingerprint_of(rec, &map),

            platform: s("plat"),
            cores: i("cores"),
            memory_gb: f("mem"),
            touch_points: i("mtp"),
            screen_w: i("sw"),
            screen_h: i("sh"),
            gpu_renderer: s("gr"),
            canvas_hash: s("cv"),
            webgl_hash: s("wgl"),
            audio_hash: s("au"),
            fonts,
            webdriver: b("wd").unwrap_or(false),
            battery_level: f("batl"),
            voice_count: i("vc"),
            hover: s("hover"),
            touch_support: b("touch"),

            language: s("lang"),
            timezone: s("tz"),
            number_format: s("nfmt"),
            calendar: s("cal"),

            mouse_moves: i("mm"),
            mouse_entropy: f("me"),
            mouse_path: s("mp"),
            page_url: s("url"),

            ip_class: s("_srv_ipClass"),
            datacenter: map.contains_key("_srv_dcName"),
            known_bot: b("_srv_knownBot").unwrap_or(false),
            geo_cc: s("_srv_geoCC"),
            geo_tz: s("_srv_geoTz"),
            geo_tz_mismatch: b("_srv_geoTzMismatch").unwrap_or(false),
            fp_stability: i("_srv_fpStability"),
            browser: s("_srv_browser"),
            browser_ver: s("_srv_browserVer"),
            os: s("_srv_os"),
            os_ver: s("_srv_osVer"),
            device_type: s("_srv_deviceType"),
        }
    }

    /// Residential for scoring purposes: a public, non-datacenter address.
    pub fn residential(&self) -> bool {
        self.ip_class.as_deref() == Some("public") && !self.datacenter
    }
}

/// Same derivation the edge uses for its in-process state keys: hash of
/// the fingerprint components, ip+ua fallback. Computing it identically on
/// both sides keeps session and replay state consistent with the fast
/// tier's rapid-fire and stability keys.
fn fingerprint_of(rec: &TrackingRecord, map: &HashMap<String, String>) -> String {
    let part = |key: &str| map.get(key).map(String::as_str).unwrap_or("");
    let any = ["cv", "wgl", "au", "fonts", "gr"]
        .iter()
        .any(|k| map.contains_key(*k));
    let input = if any {
        format!(
            "{}|{}|{}|{}|{}",
            part("cv"),
            part("wgl"),
            part("au"),
            part("fonts"),
            part("gr")
        )
    } else {
        format!("{}|{}", rec.ip_address, rec.user_agent)
    };
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

#[cfg(test)]
pub(crate) fn test_record(company: &str, ip: &str, query: &str) -> TrackingRecord {
    TrackingRecord {
        received_at: chrono::Utc::now(),
        company_id: company.to_string(),
        pixl_id: "1".to_string(),
        ip_address: ip.to_string(),
        request_path: format!("/{company}/1_SMART.GIF"),
        query_string: query.to_string(),
        headers_json: "{}".to_string(),
        user_agent: "Mozilla/5.0".to_string(),
        referer: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_client_and_srv_keys() {
        let rec = test_record(
            "12800",
            "203.0.113.9",
            "plat=Win32&cores=8&mem=16&sw=1920&sh=1080&fonts=Arial%2CVerdana%2CGeorgia\
             &_srv_ipClass=public&_srv_geoCC=US&_srv_browser=Chrome&_srv_knownBot=1",
        );
        let snap = SignalSnapshot::from_record(&rec);
        assert_eq!(snap.platform.as_deref(), Some("Win32"));
        assert_eq!(snap.cores, Some(8));
        assert_eq!(snap.fonts.len(), 3);
        assert_eq!(snap.geo_cc.as_deref(), Some("US"));
        assert!(snap.known_bot);
        assert!(snap.residential());
    }

    #[test]
    fn datacenter_flag_defeats_residential() {
        let rec = test_record("1", "3.5.1.2", "_srv_ipClass=public&_srv_dcName=aws");
        let snap = SignalSnapshot::from_record(&rec);
        assert!(snap.datacenter);
        assert!(!snap.residential());
    }

    #[test]
    fn fingerprint_matches_across_ips_with_same_components() {
        let a = SignalSnapshot::from_record(&test_record("1", "1.1.1.1", "cv=x&wgl=y"));
        let b = SignalSnapshot::from_record(&test_record("1", "2.2.2.2", "cv=x&wgl=y"));
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}
