use pixeltrace_core::record::TrackingRecord;

use super::EnrichContext;

/// Client-hint parse: structured `Sec-CH-UA-*` headers into `_srv_ch*`
/// keys. Values arrive quoted (`"Windows"`) and the mobile hint is the
/// `?1`/`?0` boolean form.
pub fn apply(rec: &mut TrackingRecord, ctx: &EnrichContext) -> anyhow::Result<()> {
    if let Some(platform) = ctx.ch_platform.as_deref().map(unquote) {
        if !platform.is_empty() {
            rec.append_srv("chPlatform", platform);
        }
    }
    if let Some(mobile) = ctx.ch_mobile.as_deref() {
        match mobile.trim() {
            "?1" => rec.append_srv("chMobile", "1"),
            "?0" => rec.append_srv("chMobile", "0"),
            _ => {}
        }
    }
    if let Some(model) = ctx.ch_model.as_deref().map(unquote) {
        if !model.is_empty() {
            rec.append_srv("chModel", model);
        }
    }
    Ok(())
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}
