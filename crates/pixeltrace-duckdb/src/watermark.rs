use anyhow::Result;
use duckdb::Transaction;

/// Read a process watermark inside the caller's transaction, creating the
/// row at 0 on first use.
pub(crate) fn read_watermark(tx: &Transaction<'_>, process: &str) -> Result<i64> {
    tx.execute(
        "INSERT INTO watermarks (process_name) VALUES (?1) ON CONFLICT (process_name) DO NOTHING",
        duckdb::params![process],
    )?;
    let id: i64 = tx.query_row(
        "SELECT last_processed_id FROM watermarks WHERE process_name = ?1",
        duckdb::params![process],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Advance a watermark inside the caller's transaction. Must only be called
/// in the same transaction that commits the gated work, so a failed batch
/// never advances it. `new_id` below the current value is a caller bug and
/// is clamped by the GREATEST to keep the watermark monotonic.
pub(crate) fn advance_watermark(
    tx: &Transaction<'_>,
    process: &str,
    new_id: i64,
    rows_processed: i64,
    rows_matched: i64,
) -> Result<()> {
    tx.execute(
        r#"UPDATE watermarks
           SET last_processed_id = GREATEST(last_processed_id, ?2),
               last_run_at = CURRENT_TIMESTAMP,
               rows_processed = rows_processed + ?3,
               rows_matched = rows_matched + ?4
           WHERE process_name = ?1"#,
        duckdb::params![process, new_id, rows_processed, rows_matched],
    )?;
    Ok(())
}
