use crate::signals::SignalSnapshot;

/// Country → plausible IANA timezone prefixes.
const TZ_EXPECTATIONS: &[(&str, &[&str])] = &[
    ("US", &["America/", "Pacific/Honolulu"]),
    ("CA", &["America/"]),
    ("MX", &["America/"]),
    ("BR", &["America/"]),
    ("AR", &["America/"]),
    ("GB", &["Europe/London"]),
    ("IE", &["Europe/Dublin"]),
    ("DE", &["Europe/"]),
    ("FR", &["Europe/"]),
    ("ES", &["Europe/", "Atlantic/Canary"]),
    ("IT", &["Europe/"]),
    ("NL", &["Europe/"]),
    ("PL", &["Europe/"]),
    ("RU", &["Europe/", "Asia/"]),
    ("IN", &["Asia/Kolkata", "Asia/Calcutta"]),
    ("CN", &["Asia/Shanghai", "Asia/Urumqi"]),
    ("JP", &["Asia/Tokyo"]),
    ("KR", &["Asia/Seoul"]),
    ("SG", &["Asia/Singapore"]),
    ("AU", &["Australia/"]),
    ("NZ", &["Pacific/Auckland"]),
    ("ZA", &["Africa/"]),
    ("NG", &["Africa/"]),
];

/// Primary language subtag → countries where it is the everyday language.
/// English is deliberately absent: it is consistent with any country.
const LANG_EXPECTATIONS: &[(&str, &[&str])] = &[
    ("de", &["DE", "AT", "CH", "LI", "LU"]),
    ("fr", &["FR", "BE", "CH", "CA", "LU", "MC"]),
    ("es", &["ES", "MX", "AR", "CO", "CL", "PE", "VE", "EC", "UY", "US"]),
    ("pt", &["PT", "BR", "AO", "MZ"]),
    ("it", &["IT", "CH", "SM"]),
    ("nl", &["NL", "BE", "SR"]),
    ("ja", &["JP"]),
    ("ko", &["KR"]),
    ("zh", &["CN", "TW", "HK", "MO", "SG"]),
    ("ru", &["RU", "BY", "KZ", "KG"]),
    ("pl", &["PL"]),
    ("tr", &["TR", "CY"]),
    ("ar", &["SA", "AE", "EG", "IQ", "JO", "KW", "LB", "MA", "DZ", "TN", "QA", "BH", "OM"]),
    ("hi", &["IN"]),
];

/// Countries where CJK font families are native.
const CJK_COUNTRIES: &[&str] = &["CN", "TW", "HK", "MO", "JP", "KR", "SG"];

/// CJK font family markers.
const CJK_FONTS: &[&str] = &[
    "simsun", "simhei", "ms gothic", "ms mincho", "ms pgothic", "meiryo", "yu gothic",
    "malgun gothic", "pingfang", "hiragino", "noto sans cjk", "batang", "gulim",
];

/// Countries writing decimals with a comma (1.234,56).
const DECIMAL_COMMA: &[&str] = &[
    "DE", "FR", "ES", "IT", "NL", "PL", "PT", "BR", "AR", "RU", "TR", "AT", "BE", "CZ", "DK",
    "FI", "GR", "HU", "NO", "SE",
];

/// Geographic/cultural arbitrage score: starts at 100, subtracts a penalty
/// for every signal pair that tells a different story about where the
/// visitor is. English language is always consistent with any country.
pub fn score(snap: &SignalSnapshot) -> i32 {
    let mut score = 100;
    let country = snap.geo_cc.as_deref();

    // Timezone ↔ country.
    if let (Some(cc), Some(tz)) = (country, snap.timezone.as_deref()) {
        if let Some((_, prefixes)) = TZ_EXPECTATIONS.iter().find(|(c, _)| *c == cc) {
            if !prefixes.iter().any(|p| tz.starts_with(p)) {
                score -= 25;
            }
        }
    }

    // Language ↔ country. English never penalizes.
    if let (Some(cc), Some(lang)) = (country, snap.language.as_deref()) {
        let primary = lang
            .split(['-', '_'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if primary != "en" {
            if let Some((_, countries)) = LANG_EXPECTATIONS.iter().find(|(l, _)| *l == primary) {
                if !countries.contains(&cc) {
                    score -= 20;
                }
            }
        }
    }

    // Font stack ↔ platform.
    if let Some(platform) = snap.platform.as_deref() {
        let lower = platform.to_ascii_lowercase();
        if !snap.fonts.is_empty() {
            let has = |needle: &str| {
                snap.fonts
                    .iter()
                    .any(|f| f.to_ascii_lowercase().contains(needle))
            };
            if lower.contains("win") && !has("segoe") && !has("calibri") && !has("tahoma") {
                score -= 15;
            }
            if lower.contains("mac") && !has("helvetica") && !has("menlo") && !has("sf pro") {
                score -= 15;
            }
        }
    }

    // CJK fonts outside CJK countries.
    if let Some(cc) = country {
        if !CJK_COUNTRIES.contains(&cc) {
            let cjk = snap.fonts.iter().any(|f| {
                let lower = f.to_ascii_lowercase();
                CJK_FONTS.iter().any(|marker| lower.contains(marker))
            });
            if cjk {
                score -= 15;
            }
        }
    }

    // Number format ↔ country.
    if let (Some(cc), Some(nfmt)) = (country, snap.number_format.as_deref()) {
        let comma_decimal = nfmt.contains(",")
            && nfmt.rfind(',') > nfmt.rfind('.').or(Some(0));
        let expects_comma = DECIMAL_COMMA.contains(&cc);
        if comma_decimal != expects_comma {
            score -= 10;
        }
    }

    // Calendar ↔ country: everything in the tables above runs Gregorian.
    if let (Some(cc), Some(cal)) = (country, snap.calendar.as_deref()) {
        let western = TZ_EXPECTATIONS.iter().any(|(c, _)| *c == cc);
        if western && !cal.eq_ignore_ascii_case("gregory") {
            score -= 10;
        }
    }

    // Zero speech-synthesis voices on a desktop is a stripped headless
    // profile.
    if snap.device_type.as_deref() == Some("desktop") && snap.voice_count == Some(0) {
        score -= 10;
    }

    score.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_record;

    fn snap(query: &str) -> SignalSnapshot {
        SignalSnapshot::from_record(&test_record("1", "10.0.0.1", query))
    }

    #[test]
    fn consistent_visitor_scores_100() {
        let s = snap(
            "tz=America%2FDenver&lang=en-US&nfmt=1%2C234.56&cal=gregory\
             &_srv_geoCC=US&_srv_deviceType=desktop&vc=3",
        );
        assert_eq!(score(&s), 100);
    }

    #[test]
    fn empty_snapshot_scores_100() {
        // No signals, no contradictions to penalize.
        assert_eq!(score(&snap("")), 100);
    }

    #[test]
    fn timezone_country_mismatch_penalized() {
        let s = snap("tz=Asia%2FShanghai&_srv_geoCC=US");
        assert_eq!(score(&s), 75);
    }

    #[test]
    fn english_is_consistent_anywhere() {
        let s = snap("lang=en-GB&_srv_geoCC=JP");
        assert_eq!(score(&s), 100);
    }

    #[test]
    fn german_in_japan_is_penalized() {
        let s = snap("lang=de-DE&_srv_geoCC=JP");
        assert_eq!(score(&s), 80);
    }

    #[test]
    fn cjk_fonts_in_germany_penalized() {
        let s = snap("fonts=Arial%2CSimSun&_srv_geoCC=DE");
        assert_eq!(score(&s), 85);
    }

    #[test]
    fn zero_voices_on_desktop_penalized() {
        let s = snap("_srv_deviceType=desktop&vc=0");
        assert_eq!(score(&s), 90);
    }

    #[test]
    fn penalties_stack_and_clamp() {
        let s = snap(
            "tz=Asia%2FShanghai&lang=de-DE&nfmt=1.234%2C56&cal=buddhist\
             &fonts=SimSun&plat=Win32&_srv_geoCC=US&_srv_deviceType=desktop&vc=0",
        );
        let total = score(&s);
        assert!(total < 30, "got {total}");
        assert!(total >= 0);
    }
}
