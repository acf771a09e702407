use anyhow::Result;
use tracing::info;

use crate::backend::StoreBackend;

impl StoreBackend {
    /// Refresh the subnet reputation aggregate from the IP dimension and
    /// scored visits. Full recompute per touched /24 — the table is small
    /// relative to the fact tables and the run is periodic.
    pub async fn refresh_subnet_reputation(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            r#"INSERT OR REPLACE INTO subnet_reputation
               (subnet24, unique_ips, unique_devices, total_hits,
                avg_bot_score, p95_bot_score, proxy_ratio, datacenter_ratio,
                refreshed_at)
               SELECT i.subnet24,
                      COUNT(DISTINCT i.ip),
                      COUNT(DISTINCT v.device_id),
                      COALESCE(SUM(i.hit_count), 0),
                      AVG(v.bot_score),
                      QUANTILE_CONT(v.bot_score, 0.95),
                      AVG(CASE WHEN i.ip_class = 'cgnat' THEN 1.0 ELSE 0.0 END),
                      AVG(CASE WHEN COALESCE(i.is_datacenter, FALSE) THEN 1.0 ELSE 0.0 END),
                      CURRENT_TIMESTAMP
               FROM ips i
               LEFT JOIN visits v ON v.ip_id = i.id
               WHERE i.subnet24 IS NOT NULL
               GROUP BY i.subnet24"#,
            [],
        )?;
        info!(subnets = updated, "subnet reputation refreshed");
        Ok(updated)
    }
}
