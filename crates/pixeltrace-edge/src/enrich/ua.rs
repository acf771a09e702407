use pixeltrace_core::record::TrackingRecord;

/// UA parse via woothee. Publishes browser, version, OS, OS version, and a
/// device-type mapping; model and brand come from substring heuristics since
/// the parser does not carry a model database.
pub fn apply(rec: &mut TrackingRecord) -> anyhow::Result<()> {
    if rec.user_agent.is_empty() {
        return Ok(());
    }
    let Some(result) = woothee::parser::Parser::new().parse(&rec.user_agent) else {
        return Ok(());
    };

    // woothee categories map to our device-type convention:
    //   "pc" → desktop, "smartphone"/"mobilephone" → mobile,
    //   "tablet" → tablet, anything else → desktop.
    let device_type = match result.category {
        "smartphone" | "mobilephone" => "mobile",
        "tablet" => "tablet",
        _ => "desktop",
    };

    let browser = result.name.to_string();
    let version = result.version.to_string();
    let os = result.os.to_string();
    let os_version = result.os_version.to_string();
    rec.append_srv("browser", &browser);
    if !version.is_empty() {
        rec.append_srv("browserVer", &version);
    }
    rec.append_srv("os", &os);
    if !os_version.is_empty() {
        rec.append_srv("osVer", &os_version);
    }
    rec.append_srv("deviceType", device_type);

    if let Some((brand, model)) = brand_and_model(&rec.user_agent) {
        let model = model.map(|m| m.to_string());
        rec.append_srv("deviceBrand", brand);
        if let Some(model) = model {
            rec.append_srv("deviceModel", &model);
        }
    }
    Ok(())
}

/// Brand (and model, when the UA carries one) from well-known UA markers.
fn brand_and_model(ua: &str) -> Option<(&'static str, Option<&str>)> {
    if ua.contains("iPhone") {
        return Some(("Apple", Some("iPhone")));
    }
    if ua.contains("iPad") {
        return Some(("Apple", Some("iPad")));
    }
    if ua.contains("Macintosh") {
        return Some(("Apple", None));
    }
    // Samsung model tokens look like "SM-G991B".
    if let Some(idx) = ua.find("SM-") {
        let model = ua[idx..]
            .split(|c: char| c == ';' || c == ')' || c.is_whitespace())
            .next();
        return Some(("Samsung", model));
    }
    if ua.contains("Pixel") {
        let model = ua
            .split(|c: char| c == ';' || c == ')')
            .map(str::trim)
            .find(|part| part.starts_with("Pixel"));
        return Some(("Google", model));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(ua: &str) -> TrackingRecord {
        TrackingRecord {
            received_at: Utc::now(),
            company_id: "1".to_string(),
            pixl_id: "1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            request_path: "/1/1_SMART.GIF".to_string(),
            query_string: String::new(),
            headers_json: "{}".to_string(),
            user_agent: ua.to_string(),
            referer: String::new(),
        }
    }

    #[test]
    fn chrome_on_windows() {
        let mut rec = record(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        );
        apply(&mut rec).unwrap();
        assert!(rec.query_string.contains("_srv_browser=Chrome"));
        assert!(rec.query_string.contains("_srv_os=Windows+10"));
        assert!(rec.query_string.contains("_srv_deviceType=desktop"));
    }

    #[test]
    fn iphone_is_mobile_apple() {
        let mut rec = record(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
        );
        apply(&mut rec).unwrap();
        assert!(rec.query_string.contains("_srv_deviceType=mobile"));
        assert!(rec.query_string.contains("_srv_deviceBrand=Apple"));
        assert!(rec.query_string.contains("_srv_deviceModel=iPhone"));
    }

    #[test]
    fn empty_ua_publishes_nothing() {
        let mut rec = record("");
        apply(&mut rec).unwrap();
        assert!(rec.query_string.is_empty());
    }

    #[test]
    fn samsung_model_token_extracted() {
        assert_eq!(
            brand_and_model("Mozilla/5.0 (Linux; Android 13; SM-G991B) Chrome/120"),
            Some(("Samsung", Some("SM-G991B")))
        );
    }
}
