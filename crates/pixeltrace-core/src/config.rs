use std::time::Duration;

/// Process configuration, loaded once at startup from environment variables.
///
/// Both processes read the same struct; each uses the subset it needs. Every
/// recognized option maps 1:1 to a `PIXELTRACE_*` env var.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public ingest port (edge).
    pub port: u16,
    /// Loopback control port (edge): /internal/health and friends.
    pub internal_port: u16,
    /// Dispatcher queue size (QueueCapacity).
    pub queue_capacity: usize,
    /// Bulk insert batch size (BatchSize).
    pub batch_size: usize,
    /// Graceful shutdown window in seconds (ShutdownTimeoutSeconds).
    pub shutdown_timeout_seconds: u64,
    /// Per-batch insert timeout in seconds (BulkCopyTimeoutSeconds).
    pub bulk_copy_timeout_seconds: u64,
    /// Cross-process stream path (PipeName). A unix socket path on this
    /// platform.
    pub pipe_name: String,
    /// Durable failover directory (FailoverDirectory).
    pub failover_dir: String,
    /// Main store path (ConnectionString). Owned by the forge process.
    pub db_path: String,
    /// Store memory limit string (`"512MB"`, `"1GB"`, ...). The store's
    /// default of 80% of system RAM is never acceptable for a server
    /// process.
    pub store_memory_limit: String,
    /// Geo lookup database path. Owned by the edge process.
    pub geo_db_path: String,
    /// MaxMind City database path for the secondary geo enrichment.
    /// Absent file is tolerated; the enrichment is skipped.
    pub maxmind_path: String,
    /// MaxMind ASN database path. Same tolerance as the City file.
    pub maxmind_asn_path: String,
    /// Base URL baked into served pixel snippets and scripts.
    pub public_url: String,
    /// Control-endpoint allow-list (DashboardAllowedIPs), comma-separated
    /// printable IPs. Loopback is always allowed.
    pub dashboard_allowed_ips: Vec<String>,
    /// Daily geo refresh hour, UTC (IpApiSyncHourUtc).
    pub ipapi_sync_hour_utc: u32,
    /// CIDRs whose X-Forwarded-For header is trusted, beyond loopback.
    pub trusted_proxies: Vec<String>,
    /// Extra header names captured into HeadersJson beyond the built-in set.
    pub capture_headers: Vec<String>,
    /// Path to the datacenter CIDR publication file (one `cidr name` per
    /// line). Absent file disables datacenter classification.
    pub datacenter_cidr_path: String,
    /// Path to the browser script template served at /js/.
    pub script_template_path: String,
    /// Distinct-IP count per /24 in the velocity window above which the
    /// subnet alert fires.
    pub subnet_alert_ips: usize,
    /// Seconds between ETL parser runs (forge).
    pub etl_interval_seconds: u64,
    /// Maximum raw rows per ETL run.
    pub etl_batch_rows: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            port: env_or("PIXELTRACE_PORT", "8080")
                .parse()
                .map_err(|e| format!("invalid PIXELTRACE_PORT: {e}"))?,
            internal_port: env_or("PIXELTRACE_INTERNAL_PORT", "8081")
                .parse()
                .map_err(|e| format!("invalid PIXELTRACE_INTERNAL_PORT: {e}"))?,
            queue_capacity: env_parse("PIXELTRACE_QUEUE_CAPACITY", 10_000),
            batch_size: env_parse("PIXELTRACE_BATCH_SIZE", 500),
            shutdown_timeout_seconds: env_parse("PIXELTRACE_SHUTDOWN_TIMEOUT_SECONDS", 5),
            bulk_copy_timeout_seconds: env_parse("PIXELTRACE_BULK_COPY_TIMEOUT_SECONDS", 30),
            pipe_name: env_or("PIXELTRACE_PIPE_NAME", "/tmp/pixeltrace.sock"),
            failover_dir: env_or("PIXELTRACE_FAILOVER_DIR", "./failover"),
            db_path: env_or("PIXELTRACE_DB_PATH", "./data/pixeltrace.db"),
            store_memory_limit: env_or("PIXELTRACE_STORE_MEMORY", "1GB"),
            geo_db_path: env_or("PIXELTRACE_GEO_DB_PATH", "./data/geo.db"),
            maxmind_path: env_or("PIXELTRACE_MAXMIND_PATH", "./GeoLite2-City.mmdb"),
            maxmind_asn_path: env_or("PIXELTRACE_MAXMIND_ASN_PATH", "./GeoLite2-ASN.mmdb"),
            public_url: env_or("PIXELTRACE_PUBLIC_URL", "http://localhost:8080"),
            dashboard_allowed_ips: env_list("PIXELTRACE_DASHBOARD_ALLOWED_IPS"),
            ipapi_sync_hour_utc: env_parse::<u32>("PIXELTRACE_IPAPI_SYNC_HOUR_UTC", 3).min(23),
            trusted_proxies: env_list("PIXELTRACE_TRUSTED_PROXIES"),
            capture_headers: env_list("PIXELTRACE_CAPTURE_HEADERS"),
            datacenter_cidr_path: env_or("PIXELTRACE_DATACENTER_CIDR_PATH", "./datacenters.txt"),
            script_template_path: env_or("PIXELTRACE_SCRIPT_TEMPLATE_PATH", "./pixel.js.tmpl"),
            subnet_alert_ips: env_parse("PIXELTRACE_SUBNET_ALERT_IPS", 10),
            etl_interval_seconds: env_parse("PIXELTRACE_ETL_INTERVAL_SECONDS", 15),
            etl_batch_rows: env_parse("PIXELTRACE_ETL_BATCH_ROWS", 10_000),
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn bulk_copy_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_copy_timeout_seconds)
    }

    pub fn etl_interval(&self) -> Duration {
        Duration::from_secs(self.etl_interval_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // from_env with a clean environment falls through to defaults.
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.queue_capacity, 10_000);
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.shutdown_timeout_seconds, 5);
        assert!(cfg.ipapi_sync_hour_utc <= 23);
        assert!(cfg.pipe_name.ends_with(".sock"));
    }
}
