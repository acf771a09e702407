use crate::signals::SignalSnapshot;

/// How badly a contradiction breaks the story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Impossible,
    Improbable,
    Suspicious,
}

pub struct Contradiction {
    pub name: &'static str,
    pub severity: Severity,
}

pub struct ContradictionReport {
    pub flags: Vec<Contradiction>,
}

impl ContradictionReport {
    pub fn count(&self) -> usize {
        self.flags.len()
    }

    pub fn joined_names(&self) -> String {
        self.flags
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn gpu_is_virtual(gpu: &str) -> bool {
    let lower = gpu.to_ascii_lowercase();
    ["swiftshader", "llvmpipe", "virtualbox", "vmware", "mesa offscreen", "parallels"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn os_is(snap: &SignalSnapshot, name: &str) -> bool {
    snap.os
        .as_deref()
        .map(|os| os.to_ascii_lowercase().contains(name))
        .unwrap_or(false)
}

fn browser_is(snap: &SignalSnapshot, name: &str) -> bool {
    snap.browser
        .as_deref()
        .map(|b| b.eq_ignore_ascii_case(name))
        .unwrap_or(false)
}

fn device_is(snap: &SignalSnapshot, kind: &str) -> bool {
    snap.device_type.as_deref() == Some(kind)
}

/// Evaluate the fixed contradiction matrix. Every predicate guards on the
/// presence of the signals it reads, so an all-null snapshot produces an
/// empty report.
pub fn evaluate(snap: &SignalSnapshot) -> ContradictionReport {
    use Severity::*;
    let mut flags = Vec::new();
    let mut hit = |name: &'static str, severity: Severity| {
        flags.push(Contradiction { name, severity });
    };

    let gpu = snap.gpu_renderer.as_deref().unwrap_or("");
    let gpu_lower = gpu.to_ascii_lowercase();

    // Safari does not ship on Windows anymore.
    if browser_is(snap, "Safari") && os_is(snap, "windows") {
        hit("WindowsSafari", Impossible);
    }
    // Direct3D renderer strings cannot come from macOS.
    if os_is(snap, "mac") && (gpu_lower.contains("direct3d") || gpu_lower.contains("d3d11")) {
        hit("MacOSDirectX", Impossible);
    }
    // Safari has no battery API; a battery level from Safari is scripted.
    if browser_is(snap, "Safari") && snap.battery_level.is_some() {
        hit("SafariBattery", Impossible);
    }
    // Touch points reported but the touch probe denies support.
    if let (Some(points), Some(false)) = (snap.touch_points, snap.touch_support) {
        if points > 0 {
            hit("TouchMismatch", Improbable);
        }
    }
    // Apple system fonts do not ship on Linux.
    if os_is(snap, "linux")
        && snap.fonts.iter().any(|f| {
            let f = f.to_ascii_lowercase();
            f.contains("helvetica neue") || f.starts_with("sf pro") || f.contains("apple sd")
        })
    {
        hit("LinuxAppleFonts", Improbable);
    }
    // Apple GPUs exist only behind Apple platforms.
    if gpu_lower.contains("apple") && !os_is(snap, "mac") && !os_is(snap, "iphone")
        && !os_is(snap, "ipad") && !os_is(snap, "ios")
    {
        hit("AppleGPUNonMac", Impossible);
    }
    // A phone with a desktop-monitor resolution.
    if device_is(snap, "mobile") {
        if let Some(w) = snap.screen_w {
            if w >= 2560 {
                hit("MobileHighRes", Improbable);
            }
        }
    }
    // A desktop on a sub-VGA panel.
    if device_is(snap, "desktop") {
        if let (Some(w), Some(h)) = (snap.screen_w, snap.screen_h) {
            if w <= 640 && h <= 480 {
                hit("DesktopTinyScreen", Suspicious);
            }
        }
    }
    // Many cores exposed through a software renderer.
    if let Some(cores) = snap.cores {
        if cores >= 16 && !gpu.is_empty() && gpu_is_virtual(gpu) {
            hit("HighCoresVirtualGPU", Improbable);
        }
    }
    // webdriver=true with organic-looking mouse entropy is a replay rig.
    if snap.webdriver {
        if let Some(entropy) = snap.mouse_entropy {
            if entropy > 2.0 {
                hit("WebDriverEntropy", Suspicious);
            }
        }
    }
    // Phones are portrait devices; a hugely wide aspect is a stretched VM.
    if device_is(snap, "mobile") {
        if let (Some(w), Some(h)) = (snap.screen_w, snap.screen_h) {
            if h > 0 && (w as f64) / (h as f64) > 2.5 {
                hit("PhoneWideScreen", Improbable);
            }
        }
    }
    // Server-class core counts next to bottom-tier memory.
    if let (Some(mem), Some(cores)) = (snap.memory_gb, snap.cores) {
        if mem <= 2.0 && cores >= 12 {
            hit("LowMemHighCores", Improbable);
        }
    }
    // A mobile device that claims zero touch points and fine hover.
    if device_is(snap, "mobile") {
        if let (Some(points), Some(hover)) = (snap.touch_points, snap.hover.as_deref()) {
            if points == 0 && hover == "hover" {
                hit("MobileTouchHover", Improbable);
            }
        }
    }

    ContradictionReport { flags }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_record;

    fn snap(query: &str) -> SignalSnapshot {
        SignalSnapshot::from_record(&test_record("1", "10.0.0.1", query))
    }

    #[test]
    fn all_null_snapshot_yields_empty_report() {
        let report = evaluate(&snap(""));
        assert_eq!(report.count(), 0);
        assert_eq!(report.joined_names(), "");
    }

    #[test]
    fn windows_safari_is_impossible() {
        let report = evaluate(&snap("_srv_browser=Safari&_srv_os=Windows+10"));
        assert_eq!(report.count(), 1);
        assert_eq!(report.flags[0].name, "WindowsSafari");
        assert_eq!(report.flags[0].severity, Severity::Impossible);
    }

    #[test]
    fn safari_battery_fires_only_with_battery_signal() {
        let clean = evaluate(&snap("_srv_browser=Safari&_srv_os=Mac+OSX"));
        assert_eq!(clean.count(), 0);
        let scripted = evaluate(&snap("_srv_browser=Safari&_srv_os=Mac+OSX&batl=0.8"));
        assert_eq!(scripted.joined_names(), "SafariBattery");
    }

    #[test]
    fn virtual_gpu_with_many_cores() {
        let report = evaluate(&snap("cores=32&gr=Google+SwiftShader"));
        assert_eq!(report.joined_names(), "HighCoresVirtualGPU");
    }

    #[test]
    fn multiple_contradictions_accumulate() {
        let report = evaluate(&snap(
            "_srv_browser=Safari&_srv_os=Windows+10&batl=0.5&cores=16&mem=1&gr=llvmpipe",
        ));
        assert!(report.count() >= 3, "got {}", report.joined_names());
        assert!(report.joined_names().contains("WindowsSafari"));
        assert!(report.joined_names().contains("SafariBattery"));
        assert!(report.joined_names().contains("LowMemHighCores"));
    }

    #[test]
    fn mobile_touch_hover_mismatch() {
        let report = evaluate(&snap("_srv_deviceType=mobile&mtp=0&hover=hover"));
        assert_eq!(report.joined_names(), "MobileTouchHover");
    }
}
