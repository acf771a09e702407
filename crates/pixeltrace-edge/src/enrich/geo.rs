use pixeltrace_core::ipclass::Classification;
use pixeltrace_core::record::TrackingRecord;

use crate::state::AppState;

use super::EnrichContext;

/// IP classification: publishes `_srv_ipClass` for every hit. The
/// classification also gates the geo lookup that follows.
pub fn apply_class(rec: &mut TrackingRecord, classification: Classification) -> anyhow::Result<()> {
    rec.append_srv("ipClass", classification.class.label());
    Ok(())
}

/// Primary geo lookup through the two-tier cache. Publishes the geo keys on
/// a cache hit and `_srv_geoTzMismatch=1` when the browser-reported
/// timezone differs from the IP-derived one. A cache miss publishes
/// nothing — the fill happens in the background and later hits benefit.
pub fn apply_lookup(
    state: &AppState,
    rec: &mut TrackingRecord,
    ctx: &EnrichContext,
    classification: Classification,
) -> anyhow::Result<()> {
    if !classification.should_geolocate {
        return Ok(());
    }
    let Some(geo) = state.geo_cache.get(&rec.ip_address) else {
        return Ok(());
    };

    if let Some(cc) = &geo.country_code {
        rec.append_srv("geoCC", cc);
    }
    if let Some(region) = &geo.region {
        rec.append_srv("geoReg", region);
    }
    if let Some(city) = &geo.city {
        rec.append_srv("geoCity", city);
    }
    if let Some(tz) = &geo.timezone {
        rec.append_srv("geoTz", tz);
        if let Some(browser_tz) = &ctx.browser_tz {
            // Only compare when the browser string is a real IANA zone;
            // garbage input must not manufacture a mismatch signal.
            let valid = browser_tz.parse::<chrono_tz::Tz>().is_ok();
            if valid && browser_tz != tz {
                rec.append_srv("geoTzMismatch", "1");
            }
        }
    }
    if let Some(isp) = &geo.isp {
        rec.append_srv("geoISP", isp);
    }
    Ok(())
}
