use pixeltrace_core::record::TrackingRecord;

/// Known automation signatures: lowercase UA substring → published name.
/// Compiled once; matched against the lowercased user agent.
const SIGNATURES: &[(&str, &str)] = &[
    ("googlebot", "googlebot"),
    ("bingbot", "bingbot"),
    ("duckduckbot", "duckduckbot"),
    ("yandexbot", "yandexbot"),
    ("baiduspider", "baiduspider"),
    ("ahrefsbot", "ahrefsbot"),
    ("semrushbot", "semrushbot"),
    ("mj12bot", "mj12bot"),
    ("dotbot", "dotbot"),
    ("petalbot", "petalbot"),
    ("bytespider", "bytespider"),
    ("gptbot", "gptbot"),
    ("headlesschrome", "headless-chrome"),
    ("phantomjs", "phantomjs"),
    ("selenium", "selenium"),
    ("playwright", "playwright"),
    ("puppeteer", "puppeteer"),
    ("python-requests", "python-requests"),
    ("python-urllib", "python-urllib"),
    ("go-http-client", "go-http-client"),
    ("curl/", "curl"),
    ("wget/", "wget"),
    ("libwww-perl", "libwww-perl"),
    ("httpclient", "httpclient"),
    ("okhttp", "okhttp"),
    ("scrapy", "scrapy"),
    ("crawler", "crawler"),
    ("spider", "spider"),
    ("bot/", "generic-bot"),
];

/// Known-bot match: `_srv_knownBot=1` plus `_srv_botName` on the first
/// matching signature.
pub fn apply(rec: &mut TrackingRecord) -> anyhow::Result<()> {
    let ua = rec.user_agent.to_ascii_lowercase();
    if let Some((_, name)) = SIGNATURES.iter().find(|(sig, _)| ua.contains(sig)) {
        rec.append_srv("knownBot", "1");
        rec.append_srv("botName", name);
    }
    Ok(())
}
