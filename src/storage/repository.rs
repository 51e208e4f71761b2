use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

// ── Samples ────────────────────────────────────────────────────────

/// Upsert one derived sample, keyed on (external_id, category).
/// The external identifier is stable across re-fetches, so replaying a sync
/// over an overlapping date range replaces the row instead of duplicating it.
pub fn upsert_sample(
    conn: &Connection,
    external_id: &str,
    category: &str,
    value: f64,
    unit: &str,
    recorded_at: &str,
    source: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO samples (external_id, category, value, unit, recorded_at, source, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
         ON CONFLICT(external_id, category) DO UPDATE SET
            value=excluded.value, unit=excluded.unit, recorded_at=excluded.recorded_at,
            source=excluded.source, synced_at=excluded.synced_at",
        params![external_id, category, value, unit, recorded_at, source],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleRow {
    pub external_id: String,
    pub category: String,
    pub value: f64,
    pub unit: String,
    pub recorded_at: String,
    pub source: Option<String>,
}

/// Most recent samples, newest first.
pub fn recent_samples(conn: &Connection, limit: u32) -> Result<Vec<SampleRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT external_id, category, value, unit, recorded_at, source
         FROM samples ORDER BY recorded_at DESC, category ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SampleRow {
            external_id: row.get(0)?,
            category: row.get(1)?,
            value: row.get(2)?,
            unit: row.get(3)?,
            recorded_at: row.get(4)?,
            source: row.get(5)?,
        })
    })?;
    rows.collect()
}

/// Sample counts per category, for `status`.
pub fn sample_counts(conn: &Connection) -> Result<Vec<(String, i64)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM samples GROUP BY category ORDER BY category",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sharing authorization ──────────────────────────────────────────

/// Whether writes to the given category are authorized.
/// A category with no row is treated as denied.
pub fn authorization_status(conn: &Connection, category: &str) -> Result<bool, rusqlite::Error> {
    let authorized: Option<i64> = conn
        .query_row(
            "SELECT authorized FROM sharing_authorization WHERE category = ?1",
            params![category],
            |row| row.get(0),
        )
        .optional()?;
    Ok(authorized == Some(1))
}

pub fn set_authorization(
    conn: &Connection,
    category: &str,
    authorized: bool,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO sharing_authorization (category, authorized, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![category, authorized as i64],
    )?;
    Ok(())
}

pub fn list_authorizations(conn: &Connection) -> Result<Vec<(String, bool)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT category, authorized FROM sharing_authorization ORDER BY category",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? == 1))
    })?;
    rows.collect()
}

// ── App config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync jobs ──────────────────────────────────────────────────────

pub fn insert_sync_job(
    conn: &Connection,
    kind: &str,
    range_start: &str,
    range_end: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_jobs (kind, status, started_at, sync_range_start, sync_range_end)
         VALUES (?1, 'running', datetime('now'), ?2, ?3)",
        params![kind, range_start, range_end],
    )?;
    Ok(conn.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
pub fn update_sync_job(
    conn: &Connection,
    job_id: i64,
    status: &str,
    requests_issued: u64,
    requests_succeeded: u64,
    records_received: u64,
    samples_saved: u64,
    samples_skipped: u64,
    samples_errored: u64,
    error: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET
            status = ?2, completed_at = datetime('now'),
            requests_issued = ?3, requests_succeeded = ?4, records_received = ?5,
            samples_saved = ?6, samples_skipped = ?7, samples_errored = ?8, error = ?9
         WHERE job_id = ?1",
        params![
            job_id,
            status,
            requests_issued as i64,
            requests_succeeded as i64,
            records_received as i64,
            samples_saved as i64,
            samples_skipped as i64,
            samples_errored as i64,
            error,
        ],
    )?;
    Ok(())
}

/// Completion time of the most recent successful sync job, for `status`.
pub fn last_completed_sync(conn: &Connection) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT MAX(completed_at) FROM sync_jobs WHERE status = 'completed'",
        [],
        |row| row.get(0),
    )
    .optional()
    .map(|v| v.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "last_sync_date", "2018-10-31")?;
                let val = get_config(conn, "last_sync_date")?;
                assert_eq!(val, Some("2018-10-31".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_sample_is_idempotent() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_sample(conn, "1539272693000", "body_mass", 176.7, "lb",
                    "2018-10-11T15:44:53", Some("Aria"))?;
                // Same dedup key, newer value: replaces, never duplicates.
                upsert_sample(conn, "1539272693000", "body_mass", 176.9, "lb",
                    "2018-10-11T15:44:53", Some("Aria"))?;

                let (count, value): (i64, f64) = conn.query_row(
                    "SELECT COUNT(*), MAX(value) FROM samples
                     WHERE external_id = '1539272693000' AND category = 'body_mass'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                assert_eq!(count, 1);
                assert!((value - 176.9).abs() < f64::EPSILON);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_authorization_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                assert!(authorization_status(conn, "body_mass")?);
                set_authorization(conn, "body_mass", false)?;
                assert!(!authorization_status(conn, "body_mass")?);
                // Unknown categories are denied, not errors.
                assert!(!authorization_status(conn, "heart_rate")?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_job_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let job_id = insert_sync_job(conn, "weight", "2018-09-01", "2018-10-31")?;
                update_sync_job(conn, job_id, "completed", 2, 2, 5, 18, 2, 0, None)?;

                let (status, saved): (String, i64) = conn.query_row(
                    "SELECT status, samples_saved FROM sync_jobs WHERE job_id = ?1",
                    params![job_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                assert_eq!(status, "completed");
                assert_eq!(saved, 18);

                assert!(last_completed_sync(conn)?.is_some());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recent_samples_ordering() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                upsert_sample(conn, "1", "body_mass", 176.7, "lb", "2018-10-11T15:44:53", None)?;
                upsert_sample(conn, "2", "body_mass", 179.7, "lb", "2018-10-12T16:49:17", None)?;

                let rows = recent_samples(conn, 10)?;
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].external_id, "2");

                let counts = sample_counts(conn)?;
                assert_eq!(counts, vec![("body_mass".to_string(), 2)]);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
