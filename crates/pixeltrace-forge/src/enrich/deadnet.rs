use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

/// Hits required before the index reports a non-zero value.
const MIN_HITS: u64 = 5;
/// Counter decay point: halve everything so the stats stay rolling.
const DECAY_AT: u64 = 10_000;
/// Fingerprint set cap per company.
const MAX_FINGERPRINTS: usize = 4_096;

/// Per-company rolling automation stats.
#[derive(Default)]
struct CompanyStats {
    hits: u64,
    bot: u64,
    no_mouse: u64,
    datacenter: u64,
    contradicted: u64,
    replayed: u64,
    fingerprints: HashSet<String>,
}

fn stats() -> &'static Mutex<HashMap<String, CompanyStats>> {
    static STATS: OnceLock<Mutex<HashMap<String, CompanyStats>>> = OnceLock::new();
    STATS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// One hit's automation flags, distilled from the earlier tiers.
pub struct HitFlags<'a> {
    pub fingerprint: &'a str,
    pub known_bot: bool,
    pub no_mouse: bool,
    pub datacenter: bool,
    pub contradictions: usize,
    pub replayed: bool,
}

/// Dead-internet index, 0..100: the weighted automated fraction of a
/// company's recent traffic, amplified when fingerprint diversity is low
/// (few distinct devices producing many hits). Zero until the company has
/// seen [`MIN_HITS`] hits.
pub fn observe(company_id: &str, flags: &HitFlags<'_>) -> anyhow::Result<i32> {
    let mut map = stats()
        .lock()
        .map_err(|_| anyhow::anyhow!("deadnet stats poisoned"))?;
    let entry = map.entry(company_id.to_string()).or_default();

    entry.hits += 1;
    if flags.known_bot {
        entry.bot += 1;
    }
    if flags.no_mouse {
        entry.no_mouse += 1;
    }
    if flags.datacenter {
        entry.datacenter += 1;
    }
    if flags.contradictions > 0 {
        entry.contradicted += 1;
    }
    if flags.replayed {
        entry.replayed += 1;
    }
    if entry.fingerprints.len() < MAX_FINGERPRINTS {
        entry.fingerprints.insert(flags.fingerprint.to_string());
    }

    if entry.hits >= DECAY_AT {
        entry.hits /= 2;
        entry.bot /= 2;
        entry.no_mouse /= 2;
        entry.datacenter /= 2;
        entry.contradicted /= 2;
        entry.replayed /= 2;
    }

    if entry.hits < MIN_HITS {
        return Ok(0);
    }

    let hits = entry.hits as f64;
    let automated = 0.30 * (entry.bot as f64 / hits)
        + 0.15 * (entry.no_mouse as f64 / hits)
        + 0.20 * (entry.datacenter as f64 / hits)
        + 0.20 * (entry.contradicted as f64 / hits)
        + 0.15 * (entry.replayed as f64 / hits);

    // Diversity 1.0 = every hit a distinct fingerprint. Low diversity
    // scales the index up to 1.5x.
    let diversity = (entry.fingerprints.len() as f64 / hits).min(1.0);
    let weighted = automated * 100.0 * (1.5 - 0.5 * diversity);

    Ok((weighted.round() as i32).clamp(0, 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human(fp: &str) -> HitFlags<'_> {
        HitFlags {
            fingerprint: fp,
            known_bot: false,
            no_mouse: false,
            datacenter: false,
            contradictions: 0,
            replayed: false,
        }
    }

    fn bot(fp: &str) -> HitFlags<'_> {
        HitFlags {
            fingerprint: fp,
            known_bot: true,
            no_mouse: true,
            datacenter: true,
            contradictions: 2,
            replayed: false,
        }
    }

    #[test]
    fn index_stays_zero_below_minimum_hits() {
        for i in 0..4 {
            let idx = observe("dn-min", &bot(&format!("fp{i}"))).unwrap();
            assert_eq!(idx, 0, "hit {i}");
        }
        let idx = observe("dn-min", &bot("fp4")).unwrap();
        assert!(idx > 0, "fifth hit must produce a value");
    }

    #[test]
    fn human_traffic_scores_near_zero() {
        for i in 0..10 {
            observe("dn-human", &human(&format!("fp{i}"))).unwrap();
        }
        let idx = observe("dn-human", &human("fp-next")).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn automated_monoculture_scores_high() {
        // One fingerprint, all bot signals: low diversity amplifies.
        for _ in 0..20 {
            observe("dn-farm", &bot("same-fp")).unwrap();
        }
        let idx = observe("dn-farm", &bot("same-fp")).unwrap();
        assert!(idx >= 80, "got {idx}");
        assert!(idx <= 100);
    }
}
