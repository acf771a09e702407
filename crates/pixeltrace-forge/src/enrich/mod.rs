use tracing::debug;

use pixeltrace_core::record::TrackingRecord;

use crate::signals::SignalSnapshot;
use crate::state::ForgeState;

pub mod affluence;
pub mod contradictions;
pub mod crosscustomer;
pub mod cultural;
pub mod deadnet;
pub mod device_age;
pub mod lead;
pub mod replay;
pub mod session;

/// Run the tier-2/3 enrichments over one decoded record, appending their
/// `_srv_` keys before the record reaches the bulk writer.
///
/// The snapshot is parsed once; dependency order differs from the listing
/// order only where a later score consumes an earlier output (lead needs
/// the contradiction count and session hit number).
pub fn apply_heavy(state: &ForgeState, rec: &mut TrackingRecord) {
    let snap = SignalSnapshot::from_record(rec);
    let mut fail = |stage: &str, e: anyhow::Error| {
        state.enrich_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(stage, error = %e, "heavy enrichment skipped");
    };

    // Session stitching.
    let session_hit = match session::stitch(&snap) {
        Ok(info) => {
            rec.append_srv("sessionId", &info.session_id);
            rec.append_srv("sessionHit", &info.hit_number.to_string());
            info.hit_number
        }
        Err(e) => {
            fail("session", e);
            0
        }
    };

    // Cross-customer intel.
    match crosscustomer::observe(&snap) {
        Ok(info) => {
            rec.append_srv("companies5m", &info.distinct_companies.to_string());
            if info.alert {
                rec.append_srv("scraperAlert", "1");
            }
        }
        Err(e) => fail("cross_customer", e),
    }

    // Contradiction matrix.
    let report = contradictions::evaluate(&snap);
    rec.append_srv("contradictions", &report.count().to_string());
    if report.count() > 0 {
        rec.append_srv("contradictionFlags", &report.joined_names());
    }

    // Behavioral replay.
    let mut replayed = false;
    match replay::check(&snap) {
        Ok(Some(info)) if info.detected => {
            replayed = true;
            rec.append_srv("replayDetected", "1");
            if let Some(fp) = &info.match_fingerprint {
                rec.append_srv("replayFp", fp);
            }
            rec.append_srv("replayCount", &info.replay_count.to_string());
        }
        Ok(_) => {}
        Err(e) => fail("replay", e),
    }

    // Affluence.
    let info = affluence::classify(&snap);
    rec.append_srv("affluenceScore", &info.score.to_string());
    rec.append_srv("affluenceTier", info.tier);
    if let Some(gpu) = info.gpu_tier {
        rec.append_srv("gpuTier", gpu.label());
    }

    // Device age.
    if let Some(age) = device_age::estimate(&snap) {
        rec.append_srv("deviceAgeYears", &age.age_years.to_string());
        if age.anomaly {
            rec.append_srv("deviceAgeAnomaly", "1");
        }
    }

    // Lead quality.
    let lead_score = lead::score(&lead::LeadSignals {
        snap: &snap,
        session_hit_number: session_hit,
        contradiction_count: report.count(),
    });
    rec.append_srv("leadScore", &lead_score.to_string());

    // Cultural arbitrage.
    rec.append_srv("culturalScore", &cultural::score(&snap).to_string());

    // Dead-internet index.
    let no_mouse = snap.mouse_moves.unwrap_or(0) == 0;
    match deadnet::observe(
        &snap.company_id,
        &deadnet::HitFlags {
            fingerprint: &snap.fingerprint,
            known_bot: snap.known_bot,
            no_mouse,
            datacenter: snap.datacenter,
            contradictions: report.count(),
            replayed,
        },
    ) {
        Ok(index) => rec.append_srv("deadNetIndex", &index.to_string()),
        Err(e) => fail("deadnet", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_record;
    use crate::state::ForgeState;

    #[tokio::test]
    async fn full_pipeline_appends_the_heavy_keys() {
        let state = ForgeState::for_tests().await;
        let mut rec = test_record(
            "901",
            "203.0.113.40",
            "cv=pipeline-test&sw=1920&sh=1080&cores=8&mem=16&gr=RTX+3070\
             &url=https%3A%2F%2Fshop.example%2Fpricing&_srv_ipClass=public",
        );
        apply_heavy(&state, &mut rec);

        for key in [
            "_srv_sessionId=",
            "_srv_sessionHit=1",
            "_srv_companies5m=1",
            "_srv_contradictions=0",
            "_srv_affluenceScore=",
            "_srv_affluenceTier=",
            "_srv_leadScore=",
            "_srv_culturalScore=100",
            "_srv_deadNetIndex=0",
        ] {
            assert!(
                rec.query_string.contains(key),
                "missing {key} in {}",
                rec.query_string
            );
        }
        // Clean snapshot: no contradiction flags, no replay, no scraper.
        assert!(!rec.query_string.contains("_srv_contradictionFlags"));
        assert!(!rec.query_string.contains("_srv_replayDetected"));
        assert!(!rec.query_string.contains("_srv_scraperAlert"));
    }
}
