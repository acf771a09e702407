use std::net::IpAddr;
use std::str::FromStr;
use std::sync::OnceLock;

use pixeltrace_core::record::TrackingRecord;

use crate::state::AppState;

type MmReader = maxminddb::Reader<Vec<u8>>;

fn city_reader(path: &str) -> Option<&'static MmReader> {
    static READER: OnceLock<Option<MmReader>> = OnceLock::new();
    READER
        .get_or_init(|| {
            let bytes = std::fs::read(path).ok()?;
            maxminddb::Reader::from_source(bytes).ok()
        })
        .as_ref()
}

fn asn_reader(path: &str) -> Option<&'static MmReader> {
    static READER: OnceLock<Option<MmReader>> = OnceLock::new();
    READER
        .get_or_init(|| {
            let bytes = std::fs::read(path).ok()?;
            maxminddb::Reader::from_source(bytes).ok()
        })
        .as_ref()
}

/// MaxMind secondary geo: an independent enrichment stored alongside the
/// primary geo-cache result, never reconciled with it. Absent database
/// files are tolerated — the keys are simply omitted.
pub fn apply(state: &AppState, rec: &mut TrackingRecord) -> anyhow::Result<()> {
    let ip = IpAddr::from_str(rec.ip_address.trim())?;

    if let Some(reader) = city_reader(&state.config.maxmind_path) {
        if let Ok(lookup) = reader.lookup(ip) {
            if let Ok(Some(city)) = lookup.decode::<maxminddb::geoip2::City>() {
                if let Some(cc) = city.country.iso_code {
                    rec.append_srv("mmCC", cc);
                }
                if let Some(region) = city
                    .subdivisions
                    .first()
                    .and_then(|sub| sub.names.english)
                {
                    let region = region.to_string();
                    rec.append_srv("mmReg", &region);
                }
                if let Some(name) = city.city.names.english {
                    let name = name.to_string();
                    rec.append_srv("mmCity", &name);
                }
                if let Some(lat) = city.location.latitude {
                    rec.append_srv("mmLat", &format!("{lat:.4}"));
                }
                if let Some(lon) = city.location.longitude {
                    rec.append_srv("mmLon", &format!("{lon:.4}"));
                }
            }
        }
    }

    if let Some(reader) = asn_reader(&state.config.maxmind_asn_path) {
        if let Ok(lookup) = reader.lookup(ip) {
            if let Ok(Some(asn)) = lookup.decode::<maxminddb::geoip2::Asn>() {
                if let Some(number) = asn.autonomous_system_number {
                    rec.append_srv("mmASN", &number.to_string());
                }
                if let Some(org) = asn.autonomous_system_organization {
                    rec.append_srv("mmASNOrg", org);
                }
            }
        }
    }
    Ok(())
}
