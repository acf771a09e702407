use anyhow::Result;
use duckdb::Transaction;
use tracing::info;

use crate::backend::StoreBackend;
use crate::watermark::{advance_watermark, read_watermark};

const PROCESS_NAME: &str = "visit_scoring";

/// Outcome of one scoring run.
#[derive(Debug, Default)]
pub struct ScoringOutcome {
    pub visits_scored: usize,
    pub periods_recomputed: usize,
}

impl StoreBackend {
    /// Materialize the derived per-visit scores for visits past the scoring
    /// watermark, then recompute the customer summary rows for every period
    /// that received newly-scored visits. One transaction; the watermark
    /// advances with the work it gates.
    pub async fn run_scoring_batch(&self, limit: usize) -> Result<ScoringOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let watermark = read_watermark(&tx, PROCESS_NAME)?;
        let high: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM visits WHERE id > ?1",
            duckdb::params![watermark],
            |row| row.get(0),
        )?;
        if high == 0 {
            tx.commit()?;
            return Ok(ScoringOutcome::default());
        }

        // Bound the range to the batch limit.
        let upper: i64 = tx.query_row(
            r#"SELECT COALESCE(MAX(id), ?1) FROM (
                   SELECT id FROM visits WHERE id > ?1 ORDER BY id LIMIT ?2
               )"#,
            duckdb::params![watermark, limit as i64],
            |row| row.get(0),
        )?;

        let scored = score_visits(&tx, watermark, upper)?;
        let periods = recompute_summaries(&tx, watermark, upper)?;

        advance_watermark(&tx, PROCESS_NAME, upper, scored as i64, 0)?;
        tx.commit()?;
        info!(scored, periods, watermark = upper, "scoring batch committed");
        Ok(ScoringOutcome {
            visits_scored: scored,
            periods_recomputed: periods,
        })
    }
}

/// The per-visit score materialization. All three derived scores are
/// computed in one sweep over the visit/parsed join:
///
/// - mouse authenticity: entropy (≤30) + timing CV (≤20) + speed CV (≤15)
///   + move-count bucket (≤15) + not-replayed (10) + no scroll
///   contradiction (10); zero when the move-count bucket is absent.
/// - session quality: page count (≤40) + duration seconds (≤40) +
///   multi-page bonus (20).
/// - composite: 0.25·inverted-bot + 0.20·mouse + 0.15·session +
///   0.15·lead + 0.10·cultural + 0.10·contradiction-free +
///   affluence bonus (5 high / 3 mid).
///
/// Every component clamps into [0, 100].
fn score_visits(tx: &Transaction<'_>, watermark: i64, upper: i64) -> Result<usize> {
    let scored = tx.execute(
        r#"UPDATE visits SET
               mouse_score = scores.mouse_score,
               session_quality = scores.session_quality,
               composite_score = scores.composite_score,
               scored_at = CURRENT_TIMESTAMP
           FROM (
               SELECT
                   v.id AS vid,
                   CASE WHEN p.mouse_moves IS NULL THEN 0 ELSE
                       LEAST(100, GREATEST(0, CAST(
                           LEAST(COALESCE(p.mouse_entropy, 0) * 10, 30)
                         + CASE
                               WHEN p.mouse_timing_cv IS NULL THEN 0
                               WHEN p.mouse_timing_cv BETWEEN 0.2 AND 2.0 THEN 20
                               WHEN p.mouse_timing_cv > 0 THEN 10
                               ELSE 0
                           END
                         + CASE
                               WHEN p.mouse_speed_cv IS NULL THEN 0
                               WHEN p.mouse_speed_cv BETWEEN 0.2 AND 2.0 THEN 15
                               WHEN p.mouse_speed_cv > 0 THEN 7
                               ELSE 0
                           END
                         + CASE
                               WHEN p.mouse_moves >= 100 THEN 15
                               WHEN p.mouse_moves >= 50 THEN 12
                               WHEN p.mouse_moves >= 20 THEN 9
                               WHEN p.mouse_moves >= 5 THEN 5
                               WHEN p.mouse_moves > 0 THEN 2
                               ELSE 0
                           END
                         + CASE WHEN COALESCE(p.replay_detected, FALSE) THEN 0 ELSE 10 END
                         + CASE
                               WHEN COALESCE(p.scroll_depth, 0) > 0 AND p.mouse_moves = 0 THEN 0
                               ELSE 10
                           END AS INTEGER)))
                   END AS mouse_score,
                   LEAST(100, GREATEST(0, CAST(
                       LEAST(COALESCE(v.session_hit, 0) * 8, 40)
                     + LEAST(COALESCE(p.dwell_ms, 0) / 1000.0, 40)
                     + CASE WHEN COALESCE(v.session_hit, 0) >= 2 THEN 20 ELSE 0 END
                   AS INTEGER))) AS session_quality,
                   LEAST(100, GREATEST(0, CAST(
                       0.25 * (100 - COALESCE(v.bot_score, 0))
                     + 0.20 * (CASE WHEN p.mouse_moves IS NULL THEN 0 ELSE
                           LEAST(100, GREATEST(0,
                               LEAST(COALESCE(p.mouse_entropy, 0) * 10, 30)
                             + CASE
                                   WHEN p.mouse_timing_cv IS NULL THEN 0
                                   WHEN p.mouse_timing_cv BETWEEN 0.2 AND 2.0 THEN 20
                                   WHEN p.mouse_timing_cv > 0 THEN 10
                                   ELSE 0
                               END
                             + CASE
                                   WHEN p.mouse_speed_cv IS NULL THEN 0
                                   WHEN p.mouse_speed_cv BETWEEN 0.2 AND 2.0 THEN 15
                                   WHEN p.mouse_speed_cv > 0 THEN 7
                                   ELSE 0
                               END
                             + CASE
                                   WHEN p.mouse_moves >= 100 THEN 15
                                   WHEN p.mouse_moves >= 50 THEN 12
                                   WHEN p.mouse_moves >= 20 THEN 9
                                   WHEN p.mouse_moves >= 5 THEN 5
                                   WHEN p.mouse_moves > 0 THEN 2
                                   ELSE 0
                               END
                             + CASE WHEN COALESCE(p.replay_detected, FALSE) THEN 0 ELSE 10 END
                             + CASE
                                   WHEN COALESCE(p.scroll_depth, 0) > 0 AND p.mouse_moves = 0 THEN 0
                                   ELSE 10
                               END)) END)
                     + 0.15 * LEAST(100,
                           LEAST(COALESCE(v.session_hit, 0) * 8, 40)
                         + LEAST(COALESCE(p.dwell_ms, 0) / 1000.0, 40)
                         + CASE WHEN COALESCE(v.session_hit, 0) >= 2 THEN 20 ELSE 0 END)
                     + 0.15 * COALESCE(v.lead_score, 0)
                     + 0.10 * COALESCE(p.cultural_score, 0)
                     + 0.10 * CASE WHEN COALESCE(p.contradiction_count, 0) = 0 THEN 100 ELSE 0 END
                     + CASE
                           WHEN p.affluence_tier = 'HIGH' THEN 5
                           WHEN p.affluence_tier = 'MID' THEN 3
                           ELSE 0
                       END
                   AS INTEGER))) AS composite_score
               FROM visits v
               JOIN parsed_hits p ON p.id = v.id
               WHERE v.id > ?1 AND v.id <= ?2
           ) AS scores
           WHERE visits.id = scores.vid"#,
        duckdb::params![watermark, upper],
    )?;
    Ok(scored)
}

/// Recompute customer summaries for the periods touched by the scored
/// range. Daily rows are rebuilt from visits; weekly and monthly rows are
/// rebuilt from the daily rows of the same period.
fn recompute_summaries(tx: &Transaction<'_>, watermark: i64, upper: i64) -> Result<usize> {
    // Affected (company, day) pairs.
    let affected: Vec<(i64, String)> = {
        let mut stmt = tx.prepare(
            r#"SELECT DISTINCT company_id, STRFTIME(CAST(received_at AS DATE), '%Y-%m-%d')
               FROM visits WHERE id > ?1 AND id <= ?2"#,
        )?;
        let rows = stmt
            .query_map(duckdb::params![watermark, upper], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    for (company, day) in &affected {
        tx.execute(
            r#"INSERT OR REPLACE INTO customer_summary
               (company_id, period_type, period_start, visits, unique_devices,
                unique_ips, avg_composite, avg_bot, avg_lead, matched_visits,
                computed_at)
               SELECT v.company_id, 'day', CAST(?2 AS DATE),
                      COUNT(*),
                      COUNT(DISTINCT v.device_id),
                      COUNT(DISTINCT v.ip_id),
                      AVG(v.composite_score),
                      AVG(v.bot_score),
                      AVG(v.lead_score),
                      COUNT(*) FILTER (WHERE v.match_email IS NOT NULL),
                      CURRENT_TIMESTAMP
               FROM visits v
               WHERE v.company_id = ?1 AND CAST(v.received_at AS DATE) = CAST(?2 AS DATE)
               GROUP BY v.company_id"#,
            duckdb::params![company, day],
        )?;

        // Weekly and monthly rows are full recomputes from the dailies of
        // the containing period.
        for (period_type, trunc) in [("week", "week"), ("month", "month")] {
            tx.execute(
                &format!(
                    r#"INSERT OR REPLACE INTO customer_summary
                       (company_id, period_type, period_start, visits,
                        unique_devices, unique_ips, avg_composite, avg_bot,
                        avg_lead, matched_visits, computed_at)
                       SELECT company_id, '{period_type}',
                              DATE_TRUNC('{trunc}', CAST(?2 AS DATE)),
                              SUM(visits), SUM(unique_devices), SUM(unique_ips),
                              SUM(avg_composite * visits) / NULLIF(SUM(visits), 0),
                              SUM(avg_bot * visits) / NULLIF(SUM(visits), 0),
                              SUM(avg_lead * visits) / NULLIF(SUM(visits), 0),
                              SUM(matched_visits), CURRENT_TIMESTAMP
                       FROM customer_summary
                       WHERE company_id = ?1 AND period_type = 'day'
                         AND DATE_TRUNC('{trunc}', period_start)
                             = DATE_TRUNC('{trunc}', CAST(?2 AS DATE))
                       GROUP BY company_id"#
                ),
                duckdb::params![company, day],
            )?;
        }
    }
    Ok(affected.len())
}
