//! Process-wide sync preferences and last-sync bookkeeping.
//!
//! All reads and writes go through one `SettingsStore` handle backed by the
//! `app_config` table, so concurrent access serializes on the database
//! writer channel. Observers subscribe for change events; a change observed
//! at the storage layer while this store is mid-write is an echo of our own
//! write and is not re-broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::storage::{repository, Database};

/// The stored sync log is truncated to this many trailing bytes on write.
pub const LOG_LIMIT: usize = 8 * 1024;

const KEY_INCLUDE_LEAN_MASS: &str = "include_lean_mass";
const KEY_RESTRICT_SOURCE: &str = "restrict_to_primary_source";
const KEY_ACCESS_WARNINGS: &str = "access_warnings";
const KEY_LAST_SYNC_DATE: &str = "last_sync_date";
const KEY_LAST_SYNC_STATUS: &str = "last_sync_status";
const KEY_SYNC_LOG: &str = "sync_log";

/// Which setting changed, for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    IncludeLeanMass,
    RestrictToPrimarySource,
    AccessWarnings,
    LastSync,
    Log,
}

/// Preferences the writer consults for every record. Read once per sync.
#[derive(Debug, Clone, Copy)]
pub struct SyncPreferences {
    pub include_lean_mass: bool,
    pub restrict_to_primary_source: bool,
    pub access_warnings: bool,
}

impl Default for SyncPreferences {
    fn default() -> Self {
        Self {
            include_lean_mass: true,
            restrict_to_primary_source: true,
            access_warnings: true,
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
    notify: broadcast::Sender<SettingsChange>,
    ignore_echo: Arc<AtomicBool>,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            db,
            notify,
            ignore_echo: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Write defaults for any preference key not yet present.
    pub async fn deploy_defaults(&self) -> Result<()> {
        self.db
            .writer()
            .call(|conn| {
                for (key, value) in [
                    (KEY_INCLUDE_LEAN_MASS, "true"),
                    (KEY_RESTRICT_SOURCE, "true"),
                    (KEY_ACCESS_WARNINGS, "true"),
                ] {
                    if repository::get_config(conn, key)?.is_none() {
                        repository::set_config(conn, key, value)?;
                    }
                }
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Subscribe to settings-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.notify.subscribe()
    }

    /// Forward a change observed at the storage layer to subscribers,
    /// unless it is the echo of a write this store is making itself.
    pub fn observe_underlying_change(&self, change: SettingsChange) {
        if self.ignore_echo.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.notify.send(change);
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn preferences(&self) -> Result<SyncPreferences> {
        let values = self
            .db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    repository::get_config(conn, KEY_INCLUDE_LEAN_MASS)?,
                    repository::get_config(conn, KEY_RESTRICT_SOURCE)?,
                    repository::get_config(conn, KEY_ACCESS_WARNINGS)?,
                ))
            })
            .await?;
        let defaults = SyncPreferences::default();
        Ok(SyncPreferences {
            include_lean_mass: parse_bool(values.0, defaults.include_lean_mass),
            restrict_to_primary_source: parse_bool(values.1, defaults.restrict_to_primary_source),
            access_warnings: parse_bool(values.2, defaults.access_warnings),
        })
    }

    pub async fn last_sync_date(&self) -> Result<Option<NaiveDate>> {
        let raw = self.get(KEY_LAST_SYNC_DATE).await?;
        Ok(raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    pub async fn last_sync_status(&self) -> Result<String> {
        Ok(self.get(KEY_LAST_SYNC_STATUS).await?.unwrap_or_default())
    }

    pub async fn sync_log(&self) -> Result<String> {
        Ok(self.get(KEY_SYNC_LOG).await?.unwrap_or_default())
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub async fn set_include_lean_mass(&self, value: bool) -> Result<()> {
        self.set_bool(KEY_INCLUDE_LEAN_MASS, value, SettingsChange::IncludeLeanMass)
            .await
    }

    pub async fn set_restrict_to_primary_source(&self, value: bool) -> Result<()> {
        self.set_bool(
            KEY_RESTRICT_SOURCE,
            value,
            SettingsChange::RestrictToPrimarySource,
        )
        .await
    }

    pub async fn set_access_warnings(&self, value: bool) -> Result<()> {
        self.set_bool(KEY_ACCESS_WARNINGS, value, SettingsChange::AccessWarnings)
            .await
    }

    /// Record a successful sync: the timestamp advances to the end of the
    /// last requested window, and the status line is replaced.
    pub async fn set_last_sync(&self, date: NaiveDate, status: &str) -> Result<()> {
        let date = date.format("%Y-%m-%d").to_string();
        let status = status.to_string();
        self.write(SettingsChange::LastSync, move |conn| {
            repository::set_config(conn, KEY_LAST_SYNC_DATE, &date)?;
            repository::set_config(conn, KEY_LAST_SYNC_STATUS, &status)?;
            Ok(())
        })
        .await
    }

    /// Replace the status line without advancing the timestamp.
    pub async fn set_last_sync_status(&self, status: &str) -> Result<()> {
        let status = status.to_string();
        self.write(SettingsChange::LastSync, move |conn| {
            repository::set_config(conn, KEY_LAST_SYNC_STATUS, &status)
        })
        .await
    }

    /// Append a line to the sync log, keeping only the trailing
    /// `LOG_LIMIT` bytes.
    pub async fn append_log(&self, line: &str) -> Result<()> {
        let line = line.to_string();
        self.write(SettingsChange::Log, move |conn| {
            let mut log = repository::get_config(conn, KEY_SYNC_LOG)?.unwrap_or_default();
            log.push_str(&line);
            if !line.ends_with('\n') {
                log.push('\n');
            }
            repository::set_config(conn, KEY_SYNC_LOG, truncate_to_tail(&log, LOG_LIMIT))
        })
        .await
    }

    pub async fn clear_log(&self) -> Result<()> {
        self.write(SettingsChange::Log, move |conn| {
            repository::set_config(conn, KEY_SYNC_LOG, "")
        })
        .await
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn get(&self, key: &'static str) -> Result<Option<String>> {
        let value = self
            .db
            .reader()
            .call(move |conn| repository::get_config(conn, key))
            .await?;
        Ok(value)
    }

    async fn set_bool(&self, key: &'static str, value: bool, change: SettingsChange) -> Result<()> {
        let raw = if value { "true" } else { "false" };
        self.write(change, move |conn| repository::set_config(conn, key, raw))
            .await
    }

    /// Perform one serialized write, then notify subscribers exactly once.
    /// The echo guard is up for the duration of the write so a storage-level
    /// observer does not double-report it.
    async fn write<F>(&self, change: SettingsChange, f: F) -> Result<()>
    where
        F: FnOnce(&rusqlite::Connection) -> std::result::Result<(), rusqlite::Error>
            + Send
            + 'static,
    {
        self.ignore_echo.store(true, Ordering::SeqCst);
        let result = self.db.writer().call(move |conn| f(conn)).await;
        self.ignore_echo.store(false, Ordering::SeqCst);
        result?;
        let _ = self.notify.send(change);
        Ok(())
    }
}

/// Interpret a stored config value as a bool, falling back to `default`
/// for a missing or unrecognized value. Mirrors the `"true"`/`"false"`
/// strings written by `set_bool` and `deploy_defaults`.
fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref() {
        Some("true") => true,
        Some("false") => false,
        _ => default,
    }
}

/// The trailing `limit` bytes of `s`, starting on a char boundary.
fn truncate_to_tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut cut = s.len() - limit;
    while !s.is_char_boundary(cut) {
        cut += 1;
    }
    &s[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SettingsStore {
        let db = Database::open_memory().await.unwrap();
        let store = SettingsStore::new(db);
        store.deploy_defaults().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_defaults() {
        let store = store().await;
        let prefs = store.preferences().await.unwrap();
        assert!(prefs.include_lean_mass);
        assert!(prefs.restrict_to_primary_source);
        assert!(prefs.access_warnings);
        assert_eq!(store.last_sync_date().await.unwrap(), None);
        assert_eq!(store.last_sync_status().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_set_and_notify_once() {
        let store = store().await;
        let mut rx = store.subscribe();

        store.set_include_lean_mass(false).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), SettingsChange::IncludeLeanMass);
        // Exactly one event per write: no echo double-fire.
        assert!(rx.try_recv().is_err());

        let prefs = store.preferences().await.unwrap();
        assert!(!prefs.include_lean_mass);
    }

    #[tokio::test]
    async fn test_last_sync_round_trip() {
        let store = store().await;
        let date = NaiveDate::from_ymd_opt(2018, 10, 31).unwrap();
        store.set_last_sync(date, "2 records added").await.unwrap();

        assert_eq!(store.last_sync_date().await.unwrap(), Some(date));
        assert_eq!(store.last_sync_status().await.unwrap(), "2 records added");
    }

    #[tokio::test]
    async fn test_append_log_truncates_to_tail() {
        let store = store().await;
        let long_line = "x".repeat(LOG_LIMIT);
        store.append_log(&long_line).await.unwrap();
        store.append_log("marker line").await.unwrap();

        let log = store.sync_log().await.unwrap();
        assert!(log.len() <= LOG_LIMIT);
        assert!(log.ends_with("marker line\n"));

        store.clear_log().await.unwrap();
        assert_eq!(store.sync_log().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_underlying_change_forwarded_when_idle() {
        let store = store().await;
        let mut rx = store.subscribe();
        store.observe_underlying_change(SettingsChange::Log);
        assert_eq!(rx.recv().await.unwrap(), SettingsChange::Log);
    }

    #[test]
    fn test_truncate_to_tail_char_boundary() {
        // Multibyte char straddling the cut point is dropped whole.
        let s = format!("é{}", "a".repeat(10));
        let tail = truncate_to_tail(&s, 10);
        assert_eq!(tail, "a".repeat(10));
    }
}
