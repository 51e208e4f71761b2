pub mod api;
pub mod date_util;
pub mod error;
pub mod settings;
pub mod storage;
pub mod sync;

pub use api::{FitbitClient, MeasurementKind};
pub use error::{Error, Result};
pub use settings::{SettingsChange, SettingsStore, SyncPreferences};
pub use storage::Database;
pub use sync::partition::DateRange;
pub use sync::{NoopProgress, SyncOptions, SyncProgress, SyncReport, SyncStatus};

use chrono::{Duration, NaiveDate};
use sync::syncer;

/// Lookback for a first sync, when no previous successful sync exists.
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Main entry point for the Aria health-data warehouse.
pub struct AriaDW {
    db: Database,
    client: FitbitClient,
    settings: SettingsStore,
}

impl AriaDW {
    pub fn new(db: Database, client: FitbitClient) -> Self {
        let settings = SettingsStore::new(db.clone());
        Self {
            db,
            client,
            settings,
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn client(&self) -> &FitbitClient {
        &self.client
    }

    /// The process-wide settings handle. All preference reads and writes go
    /// through here.
    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Resolve the effective start date for a sync: an explicit option wins,
    /// then the day after the last successful sync, then a default lookback.
    async fn resolve_start(&self, options: &SyncOptions) -> Result<NaiveDate> {
        if let Some(start) = options.start_date() {
            return Ok(start);
        }
        let today = chrono::Local::now().date_naive();
        Ok(match self.settings.last_sync_date().await? {
            Some(last) => (last + Duration::days(1)).min(today),
            None => today - Duration::days(DEFAULT_LOOKBACK_DAYS),
        })
    }

    /// Run one sync to completion and return its report. The report is
    /// produced exactly once, after every request window and every sample
    /// write has finished.
    pub async fn sync(
        &self,
        kind: MeasurementKind,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncReport> {
        self.settings.deploy_defaults().await?;
        let start = self.resolve_start(options).await?;
        syncer::sync_measurements(
            &self.db,
            &self.client,
            &self.settings,
            kind,
            start,
            options.end,
            progress,
        )
        .await
    }
}
