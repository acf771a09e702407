use chrono::{Datelike, Utc};

use crate::signals::SignalSnapshot;

/// GPU family → release year, first match wins.
const GPU_YEARS: &[(&str, i32)] = &[
    ("rtx 50", 2025),
    ("rtx 40", 2022),
    ("rtx 30", 2020),
    ("rtx 20", 2018),
    ("gtx 16", 2019),
    ("gtx 10", 2016),
    ("gtx 9", 2014),
    ("gtx 7", 2013),
    ("radeon rx 7", 2022),
    ("radeon rx 6", 2020),
    ("radeon rx 5", 2019),
    ("radeon rx 4", 2016),
    ("apple m4", 2024),
    ("apple m3", 2023),
    ("apple m2", 2022),
    ("apple m1", 2020),
    ("iris xe", 2020),
    ("uhd graphics 7", 2021),
    ("uhd graphics 6", 2017),
    ("hd graphics 5", 2015),
    ("hd graphics 4", 2012),
    ("adreno 7", 2021),
    ("adreno 6", 2018),
    ("adreno 5", 2015),
    ("mali-g7", 2019),
    ("mali-g5", 2017),
];

/// OS token → release year.
const OS_YEARS: &[(&str, i32)] = &[
    ("windows 11", 2021),
    ("windows 10", 2015),
    ("windows 8.1", 2013),
    ("windows 8", 2012),
    ("windows 7", 2009),
    ("windows xp", 2001),
];

/// Virtual renderer markers shared with the contradiction matrix.
const VIRTUAL_GPUS: &[&str] = &["swiftshader", "llvmpipe", "virtualbox", "vmware", "parallels"];

pub struct DeviceAgeInfo {
    pub age_years: i32,
    pub anomaly: bool,
}

/// Estimate device age from the *oldest* of the GPU, OS, and browser
/// release-year signals, and flag the combinations that only automation
/// farms produce:
/// - an old device on a datacenter address with zero mouse activity,
/// - a GPU/OS age gap over five years on a datacenter address,
/// - a virtual GPU on a datacenter address with zero mouse activity.
pub fn estimate(snap: &SignalSnapshot) -> Option<DeviceAgeInfo> {
    let current_year = Utc::now().year();
    let gpu_year = snap.gpu_renderer.as_deref().and_then(gpu_release_year);
    let os_year = os_release_year(snap.os.as_deref(), snap.os_ver.as_deref());
    let browser_year = browser_release_year(snap.browser.as_deref(), snap.browser_ver.as_deref());

    let oldest = [gpu_year, os_year, browser_year]
        .into_iter()
        .flatten()
        .min()?;
    let age_years = (current_year - oldest).max(0);

    let zero_mouse = snap.mouse_moves.unwrap_or(0) == 0;
    let virtual_gpu = snap
        .gpu_renderer
        .as_deref()
        .map(|gpu| {
            let lower = gpu.to_ascii_lowercase();
            VIRTUAL_GPUS.iter().any(|marker| lower.contains(marker))
        })
        .unwrap_or(false);
    let age_gap = match (gpu_year, os_year) {
        (Some(gpu), Some(os)) => (gpu - os).abs(),
        _ => 0,
    };

    let anomaly = (age_years >= 8 && snap.datacenter && zero_mouse)
        || (age_gap > 5 && snap.datacenter)
        || (virtual_gpu && snap.datacenter && zero_mouse);

    Some(DeviceAgeInfo { age_years, anomaly })
}

fn gpu_release_year(renderer: &str) -> Option<i32> {
    let lower = renderer.to_ascii_lowercase();
    GPU_YEARS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, year)| *year)
}

fn os_release_year(os: Option<&str>, os_ver: Option<&str>) -> Option<i32> {
    let os = os?.to_ascii_lowercase();
    if let Some((_, year)) = OS_YEARS.iter().find(|(marker, _)| os.contains(marker)) {
        return Some(*year);
    }
    if os.contains("mac") {
        // Darwin majors track yearly releases: 10.15 → 2019, 11 → 2020...
        let ver = os_ver?;
        let major: i32 = ver.split(['.', '_']).next()?.parse().ok()?;
        if major >= 11 {
            return Some(2009 + major);
        }
        let minor: i32 = ver.split(['.', '_']).nth(1)?.parse().ok()?;
        return Some(2004 + minor);
    }
    if os.contains("android") {
        let major: i32 = os_ver?.split('.').next()?.parse().ok()?;
        return Some(2008 + major);
    }
    None
}

fn browser_release_year(browser: Option<&str>, version: Option<&str>) -> Option<i32> {
    let browser = browser?.to_ascii_lowercase();
    let major: i32 = version?.split('.').next()?.parse().ok()?;
    let year = if browser.contains("chrome") || browser.contains("edge") {
        // Six-week cadence through v70 (2018), then faster.
        if major <= 70 {
            2008 + major / 7
        } else {
            2018 + (major - 70) / 9
        }
    } else if browser.contains("firefox") {
        if major <= 4 {
            2004 + major
        } else {
            2011 + (major - 4) / 10
        }
    } else if browser.contains("safari") {
        2006 + major
    } else {
        return None;
    };
    Some(year.min(Utc::now().year()))
}
