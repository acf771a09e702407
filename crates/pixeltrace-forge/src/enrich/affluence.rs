use crate::signals::SignalSnapshot;

/// GPU tier from the renderer string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuTier {
    Low,
    Mid,
    High,
}

impl GpuTier {
    pub fn label(self) -> &'static str {
        match self {
            GpuTier::Low => "LOW",
            GpuTier::Mid => "MID",
            GpuTier::High => "HIGH",
        }
    }
}

/// Renderer substring → tier. First match wins; order puts the newest
/// flagship families before their mid-range siblings.
const GPU_TIERS: &[(&str, GpuTier)] = &[
    ("rtx 40", GpuTier::High),
    ("rtx 50", GpuTier::High),
    ("rtx 30", GpuTier::High),
    ("radeon rx 7", GpuTier::High),
    ("radeon rx 6", GpuTier::High),
    ("apple m3", GpuTier::High),
    ("apple m2", GpuTier::High),
    ("apple m1", GpuTier::Mid),
    ("rtx 20", GpuTier::Mid),
    ("gtx 16", GpuTier::Mid),
    ("gtx 10", GpuTier::Mid),
    ("radeon rx 5", GpuTier::Mid),
    ("radeon pro", GpuTier::Mid),
    ("iris", GpuTier::Mid),
    ("adreno 7", GpuTier::Mid),
    ("mali-g7", GpuTier::Mid),
    ("uhd graphics", GpuTier::Low),
    ("hd graphics", GpuTier::Low),
    ("swiftshader", GpuTier::Low),
    ("llvmpipe", GpuTier::Low),
    ("mesa", GpuTier::Low),
    ("adreno", GpuTier::Low),
    ("mali", GpuTier::Low),
];

pub fn gpu_tier(renderer: &str) -> GpuTier {
    let lower = renderer.to_ascii_lowercase();
    GPU_TIERS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, tier)| *tier)
        .unwrap_or(GpuTier::Low)
}

pub struct AffluenceInfo {
    pub score: i32,
    pub tier: &'static str,
    pub gpu_tier: Option<GpuTier>,
}

/// Affluence classification, 0..100: GPU tier, core count, memory, screen
/// class, and platform bonuses. Thresholds at 30 and 60 map the score to
/// LOW / MID / HIGH.
pub fn classify(snap: &SignalSnapshot) -> AffluenceInfo {
    let mut score = 0;
    let gpu = snap.gpu_renderer.as_deref().map(gpu_tier);

    score += match gpu {
        Some(GpuTier::High) => 35,
        Some(GpuTier::Mid) => 20,
        Some(GpuTier::Low) => 5,
        None => 0,
    };
    score += match snap.cores {
        Some(c) if c >= 12 => 20,
        Some(c) if c >= 8 => 15,
        Some(c) if c >= 4 => 8,
        Some(_) => 2,
        None => 0,
    };
    score += match snap.memory_gb {
        Some(m) if m >= 16.0 => 15,
        Some(m) if m >= 8.0 => 10,
        Some(m) if m >= 4.0 => 5,
        Some(_) => 1,
        None => 0,
    };
    // Screen class: effective pixel count.
    if let (Some(w), Some(h)) = (snap.screen_w, snap.screen_h) {
        let pixels = i64::from(w) * i64::from(h);
        score += if pixels >= 3_686_400 {
            // 2560x1440 and up.
            15
        } else if pixels >= 2_073_600 {
            // 1920x1080.
            10
        } else {
            3
        };
    }
    // Platform bonuses: Apple hardware and high-end Android skews.
    if let Some(platform) = snap.platform.as_deref() {
        let lower = platform.to_ascii_lowercase();
        if lower.contains("mac") || lower.contains("iphone") || lower.contains("ipad") {
            score += 15;
        }
    }

    let score = score.clamp(0, 100);
    let tier = if score >= 60 {
        "HIGH"
    } else if score >= 30 {
        "MID"
    } else {
        "LOW"
    };
    AffluenceInfo {
        score,
        tier,
        gpu_tier: gpu,
    }
}
