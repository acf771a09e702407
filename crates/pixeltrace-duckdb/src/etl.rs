use std::collections::HashMap;

use anyhow::Result;
use duckdb::Transaction;
use tracing::{debug, info};

use pixeltrace_core::device::device_hash;
use pixeltrace_core::qs::{extract_client_params, get_query_param};

use crate::backend::StoreBackend;
use crate::watermark::{advance_watermark, read_watermark};

const PROCESS_NAME: &str = "etl_parser";

/// Outcome of one ETL run.
#[derive(Debug, Default)]
pub struct EtlOutcome {
    pub rows_parsed: usize,
    pub visits_inserted: usize,
    pub new_watermark: i64,
}

/// One raw row pulled into the batch.
struct RawRow {
    id: i64,
    company_id: String,
    pixel_id: String,
    ip: String,
    query_string: String,
    received_at: String,
}

impl RawRow {
    fn s(&self, key: &str) -> Option<String> {
        get_query_param(&self.query_string, key).filter(|v| !v.is_empty())
    }
    fn i(&self, key: &str) -> Option<i64> {
        self.s(key).and_then(|v| v.trim().parse().ok())
    }
    fn i32c(&self, key: &str) -> Option<i32> {
        self.s(key).and_then(|v| v.trim().parse().ok())
    }
    fn f(&self, key: &str) -> Option<f64> {
        self.s(key).and_then(|v| v.trim().parse().ok())
    }
    fn b(&self, key: &str) -> Option<bool> {
        self.s(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
    fn srv_s(&self, key: &str) -> Option<String> {
        self.s(&format!("_srv_{key}"))
    }
    fn srv_i(&self, key: &str) -> Option<i64> {
        self.srv_s(key).and_then(|v| v.trim().parse().ok())
    }
    fn srv_i32(&self, key: &str) -> Option<i32> {
        self.srv_s(key).and_then(|v| v.trim().parse().ok())
    }
    fn srv_f(&self, key: &str) -> Option<f64> {
        self.srv_s(key).and_then(|v| v.trim().parse().ok())
    }
    fn srv_b(&self, key: &str) -> Option<bool> {
        self.srv_s(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
    fn numeric_company(&self) -> Option<i64> {
        self.company_id.trim().parse().ok()
    }
    fn numeric_pixel(&self) -> Option<i64> {
        self.pixel_id.trim().parse().ok()
    }
}

impl StoreBackend {
    /// Run one watermarked ETL batch: parse raw rows past the watermark into
    /// the wide typed table, materialize device hashes, merge the device and
    /// IP dimensions, and insert visit facts. Everything — including the
    /// watermark advance — happens in one transaction; any failure rolls the
    /// whole run back and the next run reprocesses the same range.
    pub async fn run_etl_batch(&self, limit: usize) -> Result<EtlOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        // Phase 1 — self-heal: a partial prior commit can leave parsed rows
        // beyond the recorded watermark. Trust the table.
        let mut watermark = read_watermark(&tx, PROCESS_NAME)?;
        let parsed_max: i64 =
            tx.query_row("SELECT COALESCE(MAX(id), 0) FROM parsed_hits", [], |row| {
                row.get(0)
            })?;
        if parsed_max > watermark {
            debug!(watermark, parsed_max, "self-heal: adopting parsed max");
            watermark = parsed_max;
        }

        let rows = load_raw_rows(&tx, watermark, limit)?;
        if rows.is_empty() {
            tx.commit()?;
            return Ok(EtlOutcome {
                new_watermark: watermark,
                ..EtlOutcome::default()
            });
        }

        // Phase 2 — insert the core parsed row for every raw row in range.
        for row in &rows {
            insert_core_row(&tx, row)?;
        }

        // Phase 3 — column-group update sweeps for the remaining columns.
        // Partitioned so each statement stays narrow.
        for row in &rows {
            sweep_screen(&tx, row)?;
            sweep_locale(&tx, row)?;
            sweep_hardware(&tx, row)?;
            sweep_fingerprints(&tx, row)?;
            sweep_behavior(&tx, row)?;
            sweep_features(&tx, row)?;
            sweep_environment(&tx, row)?;
            sweep_network(&tx, row)?;
            sweep_page(&tx, row)?;
            sweep_srv_fast(&tx, row)?;
            sweep_srv_forge(&tx, row)?;
        }

        // Phase 4 — materialize the device hash per row.
        let mut hashes: HashMap<i64, Option<String>> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let hash = device_hash(
                row.s("cv").as_deref(),
                row.s("fonts").as_deref(),
                row.s("gr").as_deref(),
                row.s("wgl").as_deref(),
                row.s("au").as_deref(),
            );
            tx.execute(
                "UPDATE parsed_hits SET device_hash = ?2 WHERE id = ?1",
                duckdb::params![row.id, hash],
            )?;
            hashes.insert(row.id, hash);
        }

        // Phase 5 — device dimension merge; resolve surrogate ids back into
        // a per-batch buffer. Rows with a null hash are excluded.
        let device_ids = merge_devices(&tx, &rows, &hashes)?;

        // Phase 6 — IP dimension merge keyed on the printable address.
        let ip_ids = merge_ips(&tx, &rows)?;

        // Phases 7+8 — client-parameter JSON, match email, visit facts.
        let mut visits_inserted = 0usize;
        for row in &rows {
            let (Some(company), Some(pixel)) = (row.numeric_company(), row.numeric_pixel())
            else {
                continue;
            };
            let cp = extract_client_params(&row.query_string);
            let client_json = if cp.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&cp)?)
            };
            let match_email = cp
                .get("email")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty());

            let device_id = hashes
                .get(&row.id)
                .and_then(|h| h.as_ref())
                .and_then(|h| device_ids.get(h))
                .copied();
            let ip_id = ip_ids.get(&row.ip).copied();

            let inserted = tx.execute(
                r#"INSERT INTO visits (
                       id, company_id, pixel_id, device_id, ip_id, received_at,
                       hit_type, client_params_json, match_email,
                       bot_score, anomaly_score, lead_score,
                       session_id, session_hit
                   ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                   ON CONFLICT (id) DO NOTHING"#,
                duckdb::params![
                    row.id,
                    company,
                    pixel,
                    device_id,
                    ip_id,
                    row.received_at,
                    row.srv_s("hitType").unwrap_or_else(|| {
                        if row.query_string.is_empty() { "legacy" } else { "modern" }.to_string()
                    }),
                    client_json,
                    match_email,
                    bot_score(row),
                    anomaly_score(row),
                    row.srv_i32("leadScore"),
                    row.srv_s("sessionId"),
                    row.srv_i32("sessionHit"),
                ],
            )?;
            visits_inserted += inserted;
        }

        // Phase 9 — advance the watermark with the committed work.
        let new_watermark = rows.iter().map(|r| r.id).max().unwrap_or(watermark);
        advance_watermark(&tx, PROCESS_NAME, new_watermark, rows.len() as i64, 0)?;

        tx.commit()?;
        info!(
            rows = rows.len(),
            visits = visits_inserted,
            watermark = new_watermark,
            "etl batch committed"
        );
        Ok(EtlOutcome {
            rows_parsed: rows.len(),
            visits_inserted,
            new_watermark,
        })
    }
}

fn load_raw_rows(tx: &Transaction<'_>, watermark: i64, limit: usize) -> Result<Vec<RawRow>> {
    let mut stmt = tx.prepare(
        r#"SELECT id, company_id, pixel_id, ip, query_string,
                  STRFTIME(received_at, '%Y-%m-%d %H:%M:%S.%g')
           FROM raw_hits WHERE id > ?1 ORDER BY id LIMIT ?2"#,
    )?;
    let rows = stmt
        .query_map(duckdb::params![watermark, limit as i64], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                company_id: row.get(1)?,
                pixel_id: row.get(2)?,
                ip: row.get(3)?,
                query_string: row.get(4)?,
                received_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert_core_row(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"INSERT INTO parsed_hits (
               id, company_id, pixel_id, received_at, ip, hit_type,
               screen_width, screen_height, color_depth, pixel_ratio,
               timezone, language, platform, cpu_cores, device_memory_gb,
               max_touch_points, canvas_hash, webgl_hash, audio_hash,
               fonts_detected, gpu_renderer, page_url, referrer,
               mouse_moves, mouse_entropy, mouse_path
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                     ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                     ?25, ?26)"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.numeric_company(),
        row.numeric_pixel(),
        row.received_at,
        row.ip,
        row.srv_s("hitType").unwrap_or_else(|| {
            if row.query_string.is_empty() { "legacy" } else { "modern" }.to_string()
        }),
        row.i32c("sw"),
        row.i32c("sh"),
        row.i32c("cd"),
        row.f("pr"),
        row.s("tz"),
        row.s("lang"),
        row.s("plat"),
        row.i32c("cores"),
        row.f("mem"),
        row.i32c("mtp"),
        row.s("cv"),
        row.s("wgl"),
        row.s("au"),
        row.s("fonts"),
        row.s("gr"),
        row.s("url"),
        row.s("ref"),
        row.i32c("mm"),
        row.f("me"),
        row.s("mp"),
    ])?;
    Ok(())
}

fn sweep_screen(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               avail_width = ?2, avail_height = ?3, inner_width = ?4,
               inner_height = ?5, outer_width = ?6, outer_height = ?7,
               screen_x = ?8, screen_y = ?9, orientation = ?10,
               orientation_angle = ?11
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.i32c("aw"),
        row.i32c("ah"),
        row.i32c("iw"),
        row.i32c("ih"),
        row.i32c("ow"),
        row.i32c("oh"),
        row.i32c("sx"),
        row.i32c("sy"),
        row.s("orient"),
        row.i32c("orienta"),
    ])?;
    Ok(())
}

fn sweep_locale(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               tz_offset_min = ?2, languages = ?3, number_format = ?4,
               date_format = ?5, calendar = ?6, week_start = ?7
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.i32c("tzo"),
        row.s("langs"),
        row.s("nfmt"),
        row.s("dfmt"),
        row.s("cal"),
        row.i32c("wks"),
    ])?;
    Ok(())
}

fn sweep_hardware(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               gpu_vendor = ?2, battery_level = ?3, battery_charging = ?4,
               pixel_depth = ?5, arch_hint = ?6
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.s("gv"),
        row.f("batl"),
        row.b("batc"),
        row.i32c("pd"),
        row.s("arch"),
    ])?;
    Ok(())
}

fn sweep_fingerprints(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               canvas_winding = ?2, canvas_text_hash = ?3,
               canvas_geometry_hash = ?4, webgl_vendor = ?5,
               webgl_extensions_hash = ?6, webgl_params_hash = ?7,
               audio_sample_rate = ?8, audio_channels = ?9, font_count = ?10,
               plugins_hash = ?11, plugin_count = ?12, math_fingerprint = ?13,
               speech_voices_hash = ?14, voice_count = ?15,
               keyboard_layout_hash = ?16, css_media_hash = ?17
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.b("cvw"),
        row.s("cvt"),
        row.s("cvg"),
        row.s("wglv"),
        row.s("wglx"),
        row.s("wglp"),
        row.i32c("asr"),
        row.i32c("ach"),
        row.i32c("fc"),
        row.s("ph"),
        row.i32c("pc"),
        row.s("mathfp"),
        row.s("svh"),
        row.i32c("vc"),
        row.s("kbd"),
        row.s("cssm"),
    ])?;
    Ok(())
}

fn sweep_behavior(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               mouse_speed_cv = ?2, mouse_timing_cv = ?3, click_count = ?4,
               key_count = ?5, scroll_depth = ?6, scroll_max = ?7,
               dwell_ms = ?8, focus_changes = ?9, visibility_state = ?10
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.f("mscv"),
        row.f("mtcv"),
        row.i32c("cc"),
        row.i32c("kc"),
        row.i32c("sd"),
        row.i32c("sm"),
        row.i32c("dw"),
        row.i32c("fchg"),
        row.s("vis"),
    ])?;
    Ok(())
}

fn sweep_features(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               cookies_enabled = ?2, local_storage = ?3, session_storage = ?4,
               indexed_db = ?5, open_database = ?6, webdriver = ?7,
               do_not_track = ?8, pdf_viewer = ?9, java_enabled = ?10,
               touch_support = ?11, hover_support = ?12, pointer_type = ?13,
               media_devices = ?14, permissions_hash = ?15
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.b("ck"),
        row.b("ls"),
        row.b("ss"),
        row.b("idb"),
        row.b("odb"),
        row.b("wd"),
        row.s("dnt"),
        row.b("pdf"),
        row.b("java"),
        row.b("touch"),
        row.s("hover"),
        row.s("ptr"),
        row.i32c("mdev"),
        row.s("perm"),
    ])?;
    Ok(())
}

fn sweep_environment(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               color_gamut = ?2, hdr_support = ?3, inverted_colors = ?4,
               forced_colors = ?5, prefers_contrast = ?6,
               prefers_reduced_motion = ?7, device_orientation_support = ?8,
               accelerometer_support = ?9, gyroscope_support = ?10,
               ambient_light_support = ?11, bluetooth_support = ?12,
               usb_support = ?13, serial_support = ?14, hid_support = ?15,
               midi_support = ?16, nfc_support = ?17, gamepad_support = ?18,
               vr_support = ?19, speech_synthesis = ?20,
               vibration_support = ?21, notification_permission = ?22,
               geolocation_permission = ?23, camera_permission = ?24,
               microphone_permission = ?25, clipboard_permission = ?26,
               storage_quota_mb = ?27
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.s("gamut"),
        row.b("hdr"),
        row.b("inv"),
        row.b("fcol"),
        row.s("pcon"),
        row.b("prm"),
        row.b("dor"),
        row.b("accel"),
        row.b("gyro"),
        row.b("amb"),
        row.b("bt"),
        row.b("usb"),
        row.b("serial"),
        row.b("hid"),
        row.b("midi"),
        row.b("nfc"),
        row.b("gamepad"),
        row.b("vr"),
        row.b("synth"),
        row.b("vib"),
        row.s("nperm"),
        row.s("gperm"),
        row.s("camperm"),
        row.s("micperm"),
        row.s("clipperm"),
        row.i("quota"),
    ])?;
    Ok(())
}

fn sweep_network(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               connection_type = ?2, downlink_mbps = ?3, rtt_ms = ?4,
               save_data = ?5, ch_ua = ?6, ch_platform = ?7,
               ch_platform_version = ?8, ch_mobile = ?9, ch_model = ?10,
               ch_arch = ?11
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.s("conn"),
        row.f("dl"),
        row.i32c("rtt"),
        row.b("sdata"),
        row.s("chua"),
        row.s("chplat"),
        row.s("chpv"),
        row.b("chmob"),
        row.s("chmod"),
        row.s("charch"),
    ])?;
    Ok(())
}

fn sweep_page(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               page_title = ?2, page_load_ms = ?3, history_length = ?4,
               in_iframe = ?5
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.s("title"),
        row.i32c("plt"),
        row.i32c("hl"),
        row.b("ifr"),
    ])?;
    Ok(())
}

fn sweep_srv_fast(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               srv_subnet_hits = ?2, srv_subnet_ips = ?3, srv_hits_15s = ?4,
               srv_subnet_alert = ?5, srv_last_gap_ms = ?6,
               srv_rapid_fire = ?7, srv_subsec_dupe = ?8, srv_dc_name = ?9,
               srv_ip_class = ?10, srv_geo_cc = ?11, srv_geo_region = ?12,
               srv_geo_city = ?13, srv_geo_tz = ?14, srv_geo_isp = ?15,
               srv_geo_tz_mismatch = ?16, srv_fp_stability = ?17,
               srv_known_bot = ?18, srv_bot_name = ?19, srv_browser = ?20,
               srv_browser_ver = ?21, srv_os = ?22, srv_os_ver = ?23,
               srv_device_type = ?24, srv_device_model = ?25,
               srv_device_brand = ?26, srv_rdns = ?27, srv_rdns_cloud = ?28,
               srv_mm_cc = ?29, srv_mm_region = ?30, srv_mm_city = ?31,
               srv_mm_lat = ?32, srv_mm_lon = ?33, srv_mm_asn = ?34,
               srv_mm_asn_org = ?35, srv_whois_asn = ?36, srv_whois_org = ?37,
               srv_ch_platform = ?38, srv_ch_mobile = ?39, srv_ch_model = ?40
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.srv_i32("subnetHits"),
        row.srv_i32("subnetIps"),
        row.srv_i32("hitsIn15s"),
        row.srv_b("subnetAlert"),
        row.srv_i("lastGapMs"),
        row.srv_b("rapidFire"),
        row.srv_b("subSecDupe"),
        row.srv_s("dcName"),
        row.srv_s("ipClass"),
        row.srv_s("geoCC"),
        row.srv_s("geoReg"),
        row.srv_s("geoCity"),
        row.srv_s("geoTz"),
        row.srv_s("geoISP"),
        row.srv_b("geoTzMismatch"),
        row.srv_i32("fpStability"),
        row.srv_b("knownBot"),
        row.srv_s("botName"),
        row.srv_s("browser"),
        row.srv_s("browserVer"),
        row.srv_s("os"),
        row.srv_s("osVer"),
        row.srv_s("deviceType"),
        row.srv_s("deviceModel"),
        row.srv_s("deviceBrand"),
        row.srv_s("rdns"),
        row.srv_b("rdnsCloud"),
        row.srv_s("mmCC"),
        row.srv_s("mmReg"),
        row.srv_s("mmCity"),
        row.srv_f("mmLat"),
        row.srv_f("mmLon"),
        row.srv_i32("mmASN"),
        row.srv_s("mmASNOrg"),
        row.srv_s("whoisASN"),
        row.srv_s("whoisOrg"),
        row.srv_s("chPlatform"),
        row.srv_b("chMobile"),
        row.srv_s("chModel"),
    ])?;
    Ok(())
}

fn sweep_srv_forge(tx: &Transaction<'_>, row: &RawRow) -> Result<()> {
    tx.prepare_cached(
        r#"UPDATE parsed_hits SET
               session_id = ?2, session_hit = ?3, companies_5min = ?4,
               scraper_alert = ?5, lead_score = ?6, affluence_score = ?7,
               affluence_tier = ?8, gpu_tier = ?9, device_age_years = ?10,
               device_age_anomaly = ?11, contradiction_count = ?12,
               contradiction_flags = ?13, replay_detected = ?14,
               replay_fp = ?15, replay_count = ?16, cultural_score = ?17,
               deadnet_index = ?18
           WHERE id = ?1"#,
    )?
    .execute(duckdb::params![
        row.id,
        row.srv_s("sessionId"),
        row.srv_i32("sessionHit"),
        row.srv_i32("companies5m"),
        row.srv_b("scraperAlert"),
        row.srv_i32("leadScore"),
        row.srv_i32("affluenceScore"),
        row.srv_s("affluenceTier"),
        row.srv_s("gpuTier"),
        row.srv_i32("deviceAgeYears"),
        row.srv_b("deviceAgeAnomaly"),
        row.srv_i32("contradictions"),
        row.srv_s("contradictionFlags"),
        row.srv_b("replayDetected"),
        row.srv_s("replayFp"),
        row.srv_i32("replayCount"),
        row.srv_i32("culturalScore"),
        row.srv_i32("deadNetIndex"),
    ])?;
    Ok(())
}

/// Merge the device dimension for every distinct hash in the batch and
/// return hash → surrogate id. Enrichment columns take the latest non-null
/// value seen in the batch.
fn merge_devices(
    tx: &Transaction<'_>,
    rows: &[RawRow],
    hashes: &HashMap<i64, Option<String>>,
) -> Result<HashMap<String, i64>> {
    // Aggregate per hash: count, latest timestamp, latest enrichment values.
    struct Agg<'a> {
        count: i64,
        first: &'a str,
        last: &'a str,
        tier: Option<String>,
        gpu_tier: Option<String>,
        age: Option<i32>,
        browser: Option<String>,
        os: Option<String>,
    }
    let mut by_hash: HashMap<&str, Agg<'_>> = HashMap::new();
    for row in rows {
        let Some(Some(hash)) = hashes.get(&row.id) else {
            continue;
        };
        let entry = by_hash.entry(hash.as_str()).or_insert(Agg {
            count: 0,
            first: &row.received_at,
            last: &row.received_at,
            tier: None,
            gpu_tier: None,
            age: None,
            browser: None,
            os: None,
        });
        entry.count += 1;
        if row.received_at.as_str() < entry.first {
            entry.first = &row.received_at;
        }
        if row.received_at.as_str() > entry.last {
            entry.last = &row.received_at;
        }
        entry.tier = row.srv_s("affluenceTier").or(entry.tier.take());
        entry.gpu_tier = row.srv_s("gpuTier").or(entry.gpu_tier.take());
        entry.age = row.srv_i32("deviceAgeYears").or(entry.age.take());
        entry.browser = row.srv_s("browser").or(entry.browser.take());
        entry.os = row.srv_s("os").or(entry.os.take());
    }

    let mut resolved = HashMap::with_capacity(by_hash.len());
    for (hash, agg) in by_hash {
        tx.prepare_cached(
            r#"INSERT INTO devices (
                   device_hash, first_seen, last_seen, hit_count,
                   affluence_tier, gpu_tier, device_age_years,
                   primary_browser, primary_os
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT (device_hash) DO UPDATE SET
                   last_seen = excluded.last_seen,
                   hit_count = devices.hit_count + excluded.hit_count,
                   affluence_tier = COALESCE(excluded.affluence_tier, devices.affluence_tier),
                   gpu_tier = COALESCE(excluded.gpu_tier, devices.gpu_tier),
                   device_age_years = COALESCE(excluded.device_age_years, devices.device_age_years),
                   primary_browser = COALESCE(excluded.primary_browser, devices.primary_browser),
                   primary_os = COALESCE(excluded.primary_os, devices.primary_os)"#,
        )?
        .execute(duckdb::params![
            hash, agg.first, agg.last, agg.count, agg.tier, agg.gpu_tier, agg.age, agg.browser,
            agg.os,
        ])?;
        let id: i64 = tx.query_row(
            "SELECT id FROM devices WHERE device_hash = ?1",
            duckdb::params![hash],
            |row| row.get(0),
        )?;
        resolved.insert(hash.to_string(), id);
    }
    Ok(resolved)
}

/// Merge the IP dimension for every distinct address in the batch and
/// return ip → surrogate id.
fn merge_ips(tx: &Transaction<'_>, rows: &[RawRow]) -> Result<HashMap<String, i64>> {
    let mut seen: HashMap<&str, &RawRow> = HashMap::new();
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for row in rows {
        // Last row wins for enrichment values; counts accumulate.
        seen.insert(row.ip.as_str(), row);
        *counts.entry(row.ip.as_str()).or_insert(0) += 1;
    }

    let mut resolved = HashMap::with_capacity(seen.len());
    for (ip, row) in seen {
        let subnet24 = subnet_of(ip);
        tx.prepare_cached(
            r#"INSERT INTO ips (
                   ip, ip_class, is_datacenter, datacenter_provider,
                   geo_cc, geo_region, geo_city, geo_tz, geo_isp,
                   mm_cc, mm_region, mm_city, mm_lat, mm_lon, mm_asn, mm_asn_org,
                   rdns_hostname, rdns_cloud, subnet24,
                   first_seen, last_seen, hit_count
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
               ON CONFLICT (ip) DO UPDATE SET
                   last_seen = excluded.last_seen,
                   hit_count = ips.hit_count + excluded.hit_count,
                   ip_class = COALESCE(excluded.ip_class, ips.ip_class),
                   is_datacenter = COALESCE(excluded.is_datacenter, ips.is_datacenter),
                   datacenter_provider = COALESCE(excluded.datacenter_provider, ips.datacenter_provider),
                   geo_cc = COALESCE(excluded.geo_cc, ips.geo_cc),
                   geo_region = COALESCE(excluded.geo_region, ips.geo_region),
                   geo_city = COALESCE(excluded.geo_city, ips.geo_city),
                   geo_tz = COALESCE(excluded.geo_tz, ips.geo_tz),
                   geo_isp = COALESCE(excluded.geo_isp, ips.geo_isp),
                   mm_cc = COALESCE(excluded.mm_cc, ips.mm_cc),
                   mm_region = COALESCE(excluded.mm_region, ips.mm_region),
                   mm_city = COALESCE(excluded.mm_city, ips.mm_city),
                   mm_lat = COALESCE(excluded.mm_lat, ips.mm_lat),
                   mm_lon = COALESCE(excluded.mm_lon, ips.mm_lon),
                   mm_asn = COALESCE(excluded.mm_asn, ips.mm_asn),
                   mm_asn_org = COALESCE(excluded.mm_asn_org, ips.mm_asn_org),
                   rdns_hostname = COALESCE(excluded.rdns_hostname, ips.rdns_hostname),
                   rdns_cloud = COALESCE(excluded.rdns_cloud, ips.rdns_cloud)"#,
        )?
        .execute(duckdb::params![
            ip,
            row.srv_s("ipClass"),
            row.srv_s("dcName").map(|_| true),
            row.srv_s("dcName"),
            row.srv_s("geoCC"),
            row.srv_s("geoReg"),
            row.srv_s("geoCity"),
            row.srv_s("geoTz"),
            row.srv_s("geoISP"),
            row.srv_s("mmCC"),
            row.srv_s("mmReg"),
            row.srv_s("mmCity"),
            row.srv_f("mmLat"),
            row.srv_f("mmLon"),
            row.srv_i32("mmASN"),
            row.srv_s("mmASNOrg"),
            row.srv_s("rdns"),
            row.srv_b("rdnsCloud"),
            subnet24,
            row.received_at,
            row.received_at,
            counts[ip],
        ])?;
        let id: i64 = tx.query_row(
            "SELECT id FROM ips WHERE ip = ?1",
            duckdb::params![ip],
            |row| row.get(0),
        )?;
        resolved.insert(ip.to_string(), id);
    }
    Ok(resolved)
}

/// The /24 annotation for a v4 address (`203.0.113.9` → `203.0.113.0/24`);
/// v6 and unparsable addresses have no subnet key.
pub(crate) fn subnet_of(ip: &str) -> Option<String> {
    let v4: std::net::Ipv4Addr = ip.trim().parse().ok()?;
    let [a, b, c, _] = v4.octets();
    Some(format!("{a}.{b}.{c}.0/24"))
}

/// Denormalized bot score for the visit fact: an additive roll-up of the
/// edge and forge signals, clamped to 0..100.
fn bot_score(row: &RawRow) -> i32 {
    let mut score = 0;
    if row.srv_b("knownBot").unwrap_or(false) {
        score += 90;
    }
    if row.srv_s("dcName").is_some() {
        score += 30;
    }
    if row.srv_b("replayDetected").unwrap_or(false) {
        score += 40;
    }
    if row.srv_b("rapidFire").unwrap_or(false) {
        score += 15;
    }
    if row.srv_b("subSecDupe").unwrap_or(false) {
        score += 15;
    }
    if row.b("wd").unwrap_or(false) {
        score += 40;
    }
    if row.srv_b("subnetAlert").unwrap_or(false) {
        score += 20;
    }
    score += (row.srv_i32("contradictions").unwrap_or(0) * 10).min(30);
    score.clamp(0, 100)
}

/// Denormalized anomaly score: signal inconsistency rather than automation.
fn anomaly_score(row: &RawRow) -> i32 {
    let mut score = 0;
    if row.srv_b("deviceAgeAnomaly").unwrap_or(false) {
        score += 50;
    }
    score += (row.srv_i32("contradictions").unwrap_or(0) * 10).min(30);
    if row.srv_i32("fpStability").unwrap_or(0) >= 5 {
        score += 20;
    }
    if row.srv_b("geoTzMismatch").unwrap_or(false) {
        score += 10;
    }
    score.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_of_v4() {
        assert_eq!(subnet_of("203.0.113.9").as_deref(), Some("203.0.113.0/24"));
        assert_eq!(subnet_of("10.1.2.3").as_deref(), Some("10.1.2.0/24"));
    }

    #[test]
    fn subnet_of_rejects_v6_and_garbage() {
        assert_eq!(subnet_of("2001:db8::1"), None);
        assert_eq!(subnet_of("nope"), None);
    }
}
