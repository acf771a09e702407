/// Main-store initialization SQL.
///
/// Executed once at open time via `Connection::execute_batch`. All
/// statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup (idempotent). The forge process is the only writer of this
/// database; the edge opens it read-only at startup for geo-cache pre-warm
/// and tolerates failure.
///
/// An explicit memory limit is always set — the DuckDB default (80% of
/// system RAM) is not acceptable for a long-running server process.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

CREATE SEQUENCE IF NOT EXISTS seq_raw_hits START 1;
CREATE SEQUENCE IF NOT EXISTS seq_devices START 1;
CREATE SEQUENCE IF NOT EXISTS seq_ips START 1;
CREATE SEQUENCE IF NOT EXISTS seq_matches START 1;

-- ===========================================
-- RAW (bulk-insert target; no constraints besides the PK)
-- ===========================================
CREATE TABLE IF NOT EXISTS raw_hits (
    id              BIGINT PRIMARY KEY DEFAULT nextval('seq_raw_hits'),
    company_id      VARCHAR NOT NULL,
    pixel_id        VARCHAR NOT NULL,
    ip              VARCHAR NOT NULL,
    request_path    VARCHAR NOT NULL,
    query_string    VARCHAR NOT NULL,
    headers_json    VARCHAR NOT NULL,
    user_agent      VARCHAR NOT NULL,
    referer         VARCHAR NOT NULL,
    received_at     TIMESTAMP NOT NULL
);

-- ===========================================
-- PARSED (wide typed warehouse table; the ETL proc is the only writer)
-- ===========================================
-- id equals the raw_hits id (single identity chain).
-- Columns are grouped the way the ETL update sweeps are partitioned.
CREATE TABLE IF NOT EXISTS parsed_hits (
    -- identity
    id                      BIGINT PRIMARY KEY,
    company_id              BIGINT,
    pixel_id                BIGINT,
    received_at             TIMESTAMP NOT NULL,
    ip                      VARCHAR NOT NULL,
    hit_type                VARCHAR NOT NULL,

    -- screen / window
    screen_width            INTEGER,
    screen_height           INTEGER,
    avail_width             INTEGER,
    avail_height            INTEGER,
    color_depth             INTEGER,
    pixel_ratio             DOUBLE,
    inner_width             INTEGER,
    inner_height            INTEGER,
    outer_width             INTEGER,
    outer_height            INTEGER,
    screen_x                INTEGER,
    screen_y                INTEGER,
    orientation             VARCHAR,
    orientation_angle       INTEGER,

    -- locale / time
    timezone                VARCHAR,
    tz_offset_min           INTEGER,
    language                VARCHAR,
    languages               VARCHAR,
    number_format           VARCHAR,
    date_format             VARCHAR,
    calendar                VARCHAR,
    week_start              INTEGER,

    -- hardware
    platform                VARCHAR,
    cpu_cores               INTEGER,
    device_memory_gb        DOUBLE,
    max_touch_points        INTEGER,
    gpu_vendor              VARCHAR,
    gpu_renderer            VARCHAR,
    battery_level           DOUBLE,
    battery_charging        BOOLEAN,
    pixel_depth             INTEGER,
    arch_hint               VARCHAR,

    -- fingerprints
    canvas_hash             VARCHAR,
    canvas_winding          BOOLEAN,
    canvas_text_hash        VARCHAR,
    canvas_geometry_hash    VARCHAR,
    webgl_hash              VARCHAR,
    webgl_vendor            VARCHAR,
    webgl_extensions_hash   VARCHAR,
    webgl_params_hash       VARCHAR,
    audio_hash              VARCHAR,
    audio_sample_rate       INTEGER,
    audio_channels          INTEGER,
    fonts_detected          VARCHAR,
    font_count              INTEGER,
    plugins_hash            VARCHAR,
    plugin_count            INTEGER,
    math_fingerprint        VARCHAR,
    speech_voices_hash      VARCHAR,
    voice_count             INTEGER,
    keyboard_layout_hash    VARCHAR,
    css_media_hash          VARCHAR,

    -- behavior
    mouse_moves             INTEGER,
    mouse_entropy           DOUBLE,
    mouse_path              VARCHAR,
    mouse_speed_cv          DOUBLE,
    mouse_timing_cv         DOUBLE,
    click_count             INTEGER,
    key_count               INTEGER,
    scroll_depth            INTEGER,
    scroll_max              INTEGER,
    dwell_ms                INTEGER,
    focus_changes           INTEGER,
    visibility_state        VARCHAR,

    -- features / storage
    cookies_enabled         BOOLEAN,
    local_storage           BOOLEAN,
    session_storage         BOOLEAN,
    indexed_db              BOOLEAN,
    open_database           BOOLEAN,
    webdriver               BOOLEAN,
    do_not_track            VARCHAR,
    pdf_viewer              BOOLEAN,
    java_enabled            BOOLEAN,
    touch_support           BOOLEAN,
    hover_support           VARCHAR,
    pointer_type            VARCHAR,
    media_devices           INTEGER,
    permissions_hash        VARCHAR,

    -- environment probes
    color_gamut             VARCHAR,
    hdr_support             BOOLEAN,
    inverted_colors         BOOLEAN,
    forced_colors           BOOLEAN,
    prefers_contrast        VARCHAR,
    prefers_reduced_motion  BOOLEAN,
    device_orientation_support BOOLEAN,
    accelerometer_support   BOOLEAN,
    gyroscope_support       BOOLEAN,
    ambient_light_support   BOOLEAN,
    bluetooth_support       BOOLEAN,
    usb_support             BOOLEAN,
    serial_support          BOOLEAN,
    hid_support             BOOLEAN,
    midi_support            BOOLEAN,
    nfc_support             BOOLEAN,
    gamepad_support         BOOLEAN,
    vr_support              BOOLEAN,
    speech_synthesis        BOOLEAN,
    vibration_support       BOOLEAN,
    notification_permission VARCHAR,
    geolocation_permission  VARCHAR,
    camera_permission       VARCHAR,
    microphone_permission   VARCHAR,
    clipboard_permission    VARCHAR,
    storage_quota_mb        BIGINT,

    -- network / client hints
    connection_type         VARCHAR,
    downlink_mbps           DOUBLE,
    rtt_ms                  INTEGER,
    save_data               BOOLEAN,
    ch_ua                   VARCHAR,
    ch_platform             VARCHAR,
    ch_platform_version     VARCHAR,
    ch_mobile               BOOLEAN,
    ch_model                VARCHAR,
    ch_arch                 VARCHAR,

    -- page context
    page_url                VARCHAR,
    page_title              VARCHAR,
    referrer                VARCHAR,
    page_load_ms            INTEGER,
    history_length          INTEGER,
    in_iframe               BOOLEAN,

    -- edge enrichments (_srv_*, fast tier)
    srv_subnet_hits         INTEGER,
    srv_subnet_ips          INTEGER,
    srv_hits_15s            INTEGER,
    srv_subnet_alert        BOOLEAN,
    srv_last_gap_ms         BIGINT,
    srv_rapid_fire          BOOLEAN,
    srv_subsec_dupe         BOOLEAN,
    srv_dc_name             VARCHAR,
    srv_ip_class            VARCHAR,
    srv_geo_cc              VARCHAR,
    srv_geo_region          VARCHAR,
    srv_geo_city            VARCHAR,
    srv_geo_tz              VARCHAR,
    srv_geo_isp             VARCHAR,
    srv_geo_tz_mismatch     BOOLEAN,
    srv_fp_stability        INTEGER,
    srv_known_bot           BOOLEAN,
    srv_bot_name            VARCHAR,
    srv_browser             VARCHAR,
    srv_browser_ver         VARCHAR,
    srv_os                  VARCHAR,
    srv_os_ver              VARCHAR,
    srv_device_type         VARCHAR,
    srv_device_model        VARCHAR,
    srv_device_brand        VARCHAR,
    srv_rdns                VARCHAR,
    srv_rdns_cloud          BOOLEAN,
    srv_mm_cc               VARCHAR,
    srv_mm_region           VARCHAR,
    srv_mm_city             VARCHAR,
    srv_mm_lat              DOUBLE,
    srv_mm_lon              DOUBLE,
    srv_mm_asn              INTEGER,
    srv_mm_asn_org          VARCHAR,
    srv_whois_asn           VARCHAR,
    srv_whois_org           VARCHAR,
    srv_ch_platform         VARCHAR,
    srv_ch_mobile           BOOLEAN,
    srv_ch_model            VARCHAR,

    -- forge enrichments (_srv_*, heavy tiers)
    session_id              VARCHAR,
    session_hit             INTEGER,
    companies_5min          INTEGER,
    scraper_alert           BOOLEAN,
    lead_score              INTEGER,
    affluence_score         INTEGER,
    affluence_tier          VARCHAR,
    gpu_tier                VARCHAR,
    device_age_years        INTEGER,
    device_age_anomaly      BOOLEAN,
    contradiction_count     INTEGER,
    contradiction_flags     VARCHAR,
    replay_detected         BOOLEAN,
    replay_fp               VARCHAR,
    replay_count            INTEGER,
    cultural_score          INTEGER,
    deadnet_index           INTEGER,

    -- materialized batch output
    device_hash             VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_parsed_company_time ON parsed_hits(company_id, received_at);
CREATE INDEX IF NOT EXISTS idx_parsed_device_hash  ON parsed_hits(device_hash);

-- ===========================================
-- DEVICE DIMENSION (natural key: device_hash)
-- ===========================================
CREATE TABLE IF NOT EXISTS devices (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('seq_devices'),
    device_hash         VARCHAR NOT NULL UNIQUE,
    first_seen          TIMESTAMP NOT NULL,
    last_seen           TIMESTAMP NOT NULL,
    hit_count           BIGINT NOT NULL DEFAULT 1,
    affluence_tier      VARCHAR,
    gpu_tier            VARCHAR,
    device_age_years    INTEGER,
    primary_browser     VARCHAR,
    primary_os          VARCHAR,
    feature_bits        BIGINT,
    distinct_companies  INTEGER,
    -- fixed-dimensionality similarity vectors, little-endian f32 blobs
    fingerprint_vec     BLOB,
    behavior_vec        BLOB
);

-- ===========================================
-- IP DIMENSION (natural key: printable ip)
-- ===========================================
-- Two geo enrichments are stored in parallel (primary geo cache + MaxMind
-- secondary); they are independent and never reconciled.
CREATE TABLE IF NOT EXISTS ips (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('seq_ips'),
    ip                  VARCHAR NOT NULL UNIQUE,
    ip_class            VARCHAR,
    is_datacenter       BOOLEAN,
    datacenter_provider VARCHAR,
    geo_cc              VARCHAR,
    geo_region          VARCHAR,
    geo_city            VARCHAR,
    geo_tz              VARCHAR,
    geo_isp             VARCHAR,
    mm_cc               VARCHAR,
    mm_region           VARCHAR,
    mm_city             VARCHAR,
    mm_lat              DOUBLE,
    mm_lon              DOUBLE,
    mm_asn              INTEGER,
    mm_asn_org          VARCHAR,
    rdns_hostname       VARCHAR,
    rdns_cloud          BOOLEAN,
    subnet24            VARCHAR,
    first_seen          TIMESTAMP NOT NULL,
    last_seen           TIMESTAMP NOT NULL,
    hit_count           BIGINT NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_ips_subnet ON ips(subnet24);

-- ===========================================
-- VISIT FACT (id = raw/parsed id)
-- ===========================================
-- match_email is denormalized out of client_params_json ($.email) so it can
-- carry a plain filtered index instead of a JSON path index.
CREATE TABLE IF NOT EXISTS visits (
    id                  BIGINT PRIMARY KEY,
    company_id          BIGINT NOT NULL,
    pixel_id            BIGINT NOT NULL,
    device_id           BIGINT,
    ip_id               BIGINT,
    received_at         TIMESTAMP NOT NULL,
    hit_type            VARCHAR NOT NULL,
    client_params_json  VARCHAR,
    match_email         VARCHAR,
    bot_score           INTEGER,
    anomaly_score       INTEGER,
    lead_score          INTEGER,
    mouse_score         INTEGER,
    session_quality     INTEGER,
    composite_score     INTEGER,
    session_id          VARCHAR,
    session_hit         INTEGER,
    scored_at           TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_visits_company_time ON visits(company_id, received_at);
CREATE INDEX IF NOT EXISTS idx_visits_match_email  ON visits(match_email);

-- ===========================================
-- MATCHES (identity resolution output)
-- ===========================================
CREATE TABLE IF NOT EXISTS matches (
    id              BIGINT PRIMARY KEY DEFAULT nextval('seq_matches'),
    company_id      BIGINT NOT NULL,
    pixel_id        BIGINT NOT NULL,
    match_type      VARCHAR NOT NULL,       -- 'email' | 'ip' | 'geo'
    match_key       VARCHAR NOT NULL,
    first_visit_id  BIGINT NOT NULL,
    latest_visit_id BIGINT NOT NULL,
    first_seen      TIMESTAMP NOT NULL,
    last_seen       TIMESTAMP NOT NULL,
    hit_count       BIGINT NOT NULL DEFAULT 1,
    individual_key  VARCHAR,
    address_key     VARCHAR,
    confidence      DOUBLE NOT NULL,
    UNIQUE (company_id, pixel_id, match_type, match_key)
);

-- ===========================================
-- CONSUMERS (external identity table; read-only to this system)
-- ===========================================
CREATE TABLE IF NOT EXISTS consumers (
    id              BIGINT PRIMARY KEY,
    uid             VARCHAR,
    email           VARCHAR,
    ip              VARCHAR,
    lat             DOUBLE,
    lon             DOUBLE,
    lat_bucket      INTEGER,                -- floor(lat * 100)
    lon_bucket      INTEGER,                -- floor(lon * 100)
    individual_key  VARCHAR,
    address_key     VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_consumers_email  ON consumers(email);
CREATE INDEX IF NOT EXISTS idx_consumers_ip     ON consumers(ip);
CREATE INDEX IF NOT EXISTS idx_consumers_bucket ON consumers(lat_bucket, lon_bucket);

-- ===========================================
-- SUBNET REPUTATION (refreshed by the aggregation task)
-- ===========================================
CREATE TABLE IF NOT EXISTS subnet_reputation (
    subnet24            VARCHAR PRIMARY KEY,
    unique_ips          BIGINT NOT NULL,
    unique_devices      BIGINT NOT NULL,
    total_hits          BIGINT NOT NULL,
    avg_bot_score       DOUBLE,
    p95_bot_score       DOUBLE,
    proxy_ratio         DOUBLE,
    datacenter_ratio    DOUBLE,
    refreshed_at        TIMESTAMP NOT NULL
);

-- ===========================================
-- WATERMARKS (one row per batch process)
-- ===========================================
-- last_processed_id is monotonic and advances only inside the transaction
-- that commits the gated work.
CREATE TABLE IF NOT EXISTS watermarks (
    process_name      VARCHAR PRIMARY KEY,
    last_processed_id BIGINT NOT NULL DEFAULT 0,
    last_run_at       TIMESTAMP,
    rows_processed    BIGINT NOT NULL DEFAULT 0,
    rows_matched      BIGINT NOT NULL DEFAULT 0
);

-- ===========================================
-- CUSTOMER SUMMARY (daily rows recomputed per affected period;
-- weekly/monthly recomputed from the dailies of the same period)
-- ===========================================
CREATE TABLE IF NOT EXISTS customer_summary (
    company_id      BIGINT NOT NULL,
    period_type     VARCHAR NOT NULL,       -- 'day' | 'week' | 'month'
    period_start    DATE NOT NULL,
    visits          BIGINT NOT NULL,
    unique_devices  BIGINT NOT NULL,
    unique_ips      BIGINT NOT NULL,
    avg_composite   DOUBLE,
    avg_bot         DOUBLE,
    avg_lead        DOUBLE,
    matched_visits  BIGINT NOT NULL,
    computed_at     TIMESTAMP NOT NULL,
    PRIMARY KEY (company_id, period_type, period_start)
);
"#
    )
}

/// Geo-database initialization SQL (the edge-owned lookup file).
///
/// `ip_geo` is the serving table, range-seekable on the numeric v4 address;
/// `geo_sync` is the upstream staging table the daily sync drains by
/// watermark. IPv6 addresses are not represented here — the MaxMind
/// secondary covers them.
pub const GEO_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ip_geo (
    ip_from         BIGINT PRIMARY KEY,
    ip_to           BIGINT NOT NULL,
    country_code    VARCHAR,
    region          VARCHAR,
    city            VARCHAR,
    postal          VARCHAR,
    lat             DOUBLE,
    lon             DOUBLE,
    timezone        VARCHAR,
    isp             VARCHAR,
    org             VARCHAR,
    is_proxy        BOOLEAN,
    is_mobile       BOOLEAN,
    refreshed_at    TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS geo_sync (
    id              BIGINT PRIMARY KEY,
    ip_from         BIGINT NOT NULL,
    ip_to           BIGINT NOT NULL,
    country_code    VARCHAR,
    region          VARCHAR,
    city            VARCHAR,
    postal          VARCHAR,
    lat             DOUBLE,
    lon             DOUBLE,
    timezone        VARCHAR,
    isp             VARCHAR,
    org             VARCHAR,
    is_proxy        BOOLEAN,
    is_mobile       BOOLEAN,
    loaded_at       TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS geo_watermarks (
    process_name      VARCHAR PRIMARY KEY,
    last_processed_id BIGINT NOT NULL DEFAULT 0,
    last_run_at       TIMESTAMP
);
"#;
