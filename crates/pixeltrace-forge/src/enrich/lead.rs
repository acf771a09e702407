use crate::signals::SignalSnapshot;

/// Inputs to the lead score beyond the snapshot itself.
pub struct LeadSignals<'a> {
    pub snap: &'a SignalSnapshot,
    pub session_hit_number: u32,
    pub contradiction_count: usize,
}

/// Lead quality score, 0..100, from the fixed additive table:
/// residential IP +15, consistent fingerprint +12, mouse entropy > 2 +12,
/// three or more detected fonts +10, clean canvas +8, timezone matching
/// geo +8, second-or-later session hit +10, not a known bot +15, zero
/// contradictions +10.
pub fn score(signals: &LeadSignals<'_>) -> i32 {
    let snap = signals.snap;
    let mut score = 0;

    if snap.residential() {
        score += 15;
    }
    if snap.fp_stability == Some(0) {
        score += 12;
    }
    if snap.mouse_entropy.map(|e| e > 2.0).unwrap_or(false) {
        score += 12;
    }
    if snap.fonts.len() >= 3 {
        score += 10;
    }
    if snap
        .canvas_hash
        .as_deref()
        .map(|cv| !cv.is_empty())
        .unwrap_or(false)
    {
        score += 8;
    }
    if snap.geo_tz.is_some() && !snap.geo_tz_mismatch {
        score += 8;
    }
    if signals.session_hit_number >= 2 {
        score += 10;
    }
    if !snap.known_bot {
        score += 15;
    }
    if signals.contradiction_count == 0 {
        score += 10;
    }

    score.clamp(0, 100)
}
