pub mod partition;
pub mod syncer;
pub mod writer;

use chrono::NaiveDate;
use serde::Serialize;

use crate::sync::partition::DateRange;

/// Options controlling a sync operation.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub days: Option<u32>,
}

impl SyncOptions {
    /// The explicitly requested start date, if any: `start` wins over `days`.
    /// `None` means the caller wants the default (resume after the last
    /// successful sync).
    pub fn start_date(&self) -> Option<NaiveDate> {
        if let Some(d) = self.start {
            Some(d)
        } else {
            self.days
                .map(|days| chrono::Local::now().date_naive() - chrono::Duration::days(days as i64))
        }
    }
}

/// Counters accumulated by one sync invocation. Owned exclusively by that
/// invocation; completion callbacks serialize their increments through a
/// mutex because fetches and writes finish concurrently.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub requests_issued: u64,
    pub requests_succeeded: u64,
    pub records_received: u64,
    pub writes_succeeded: u64,
    pub writes_skipped: u64,
    pub writes_errored: u64,
    /// At least one structurally valid response arrived. This alone decides
    /// overall success: an empty-but-valid response is a successful sync,
    /// while zero valid responses is a failure regardless of write counts.
    pub any_request_succeeded: bool,
}

/// Report returned after a sync operation completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub kind: String,
    pub status: SyncStatus,
    pub requests_issued: u64,
    pub requests_succeeded: u64,
    pub records_received: u64,
    pub samples_saved: u64,
    pub samples_skipped: u64,
    pub samples_errored: u64,
    pub error: Option<String>,
}

impl SyncReport {
    /// Derive the report from one invocation's counters.
    pub fn from_outcome(kind: String, outcome: &SyncOutcome) -> Self {
        let clean = outcome.requests_succeeded == outcome.requests_issued
            && outcome.writes_errored == 0;
        let status = if !outcome.any_request_succeeded {
            SyncStatus::Failed
        } else if clean {
            SyncStatus::Success
        } else {
            SyncStatus::PartialFailure
        };
        let error = match status {
            SyncStatus::Failed => Some("no valid responses from API".to_string()),
            SyncStatus::PartialFailure => Some(format!(
                "{} of {} requests failed, {} sample writes errored",
                outcome.requests_issued - outcome.requests_succeeded,
                outcome.requests_issued,
                outcome.writes_errored
            )),
            SyncStatus::Success => None,
        };
        Self {
            kind,
            status,
            requests_issued: outcome.requests_issued,
            requests_succeeded: outcome.requests_succeeded,
            records_received: outcome.records_received,
            samples_saved: outcome.writes_succeeded,
            samples_skipped: outcome.writes_skipped,
            samples_errored: outcome.writes_errored,
            error,
        }
    }

    /// Overall success per the aggregation policy: at least one valid
    /// response, even if every individual sample write failed.
    pub fn succeeded(&self) -> bool {
        self.status != SyncStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

/// Progress callbacks for long-running syncs. All methods default to no-ops.
pub trait SyncProgress: Sync {
    fn on_windows_planned(&self, _kind: &str, _count: usize) {}
    fn on_window_complete(&self, _range: &DateRange, _records: usize) {}
    fn on_window_failed(&self, _range: &DateRange, _error: &str) {}
    fn on_sync_complete(&self, _report: &SyncReport) {}
}

/// Progress reporter that does nothing.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(issued: u64, succeeded: u64, errored: u64, any: bool) -> SyncOutcome {
        SyncOutcome {
            requests_issued: issued,
            requests_succeeded: succeeded,
            writes_errored: errored,
            any_request_succeeded: any,
            ..Default::default()
        }
    }

    #[test]
    fn test_report_success() {
        let report = SyncReport::from_outcome("weight".into(), &outcome(2, 2, 0, true));
        assert_eq!(report.status, SyncStatus::Success);
        assert!(report.succeeded());
        assert!(report.error.is_none());
    }

    #[test]
    fn test_report_partial_failure_on_failed_request() {
        let report = SyncReport::from_outcome("weight".into(), &outcome(2, 1, 0, true));
        assert_eq!(report.status, SyncStatus::PartialFailure);
        assert!(report.succeeded());
    }

    #[test]
    fn test_report_partial_failure_on_write_errors() {
        let report = SyncReport::from_outcome("weight".into(), &outcome(1, 1, 3, true));
        assert_eq!(report.status, SyncStatus::PartialFailure);
        // Write failures never flip overall success.
        assert!(report.succeeded());
    }

    #[test]
    fn test_report_failed_without_any_valid_response() {
        let report = SyncReport::from_outcome("weight".into(), &outcome(2, 0, 0, false));
        assert_eq!(report.status, SyncStatus::Failed);
        assert!(!report.succeeded());
        assert_eq!(report.error.as_deref(), Some("no valid responses from API"));
    }

    #[test]
    fn test_options_start_date_precedence() {
        let explicit = NaiveDate::from_ymd_opt(2018, 10, 1).unwrap();
        let opts = SyncOptions {
            start: Some(explicit),
            days: Some(7),
            ..Default::default()
        };
        assert_eq!(opts.start_date(), Some(explicit));

        let opts = SyncOptions {
            days: Some(7),
            ..Default::default()
        };
        let expected = chrono::Local::now().date_naive() - chrono::Duration::days(7);
        assert_eq!(opts.start_date(), Some(expected));

        assert_eq!(SyncOptions::default().start_date(), None);
    }
}
