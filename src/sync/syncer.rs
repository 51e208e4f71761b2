use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::NaiveDate;
use futures_util::future::join_all;

use crate::api::{records, FitbitClient, MeasurementKind};
use crate::error::{Error, Result};
use crate::settings::SettingsStore;
use crate::storage::{repository, Database};
use crate::sync::writer::{self, WriteOutcome};
use crate::sync::{SyncOutcome, SyncProgress, SyncReport, SyncStatus};

/// Run one sync: partition the requested span into month windows, fetch
/// every window concurrently, parse, fan out per-record sample writes, and
/// join everything before producing a single report.
///
/// Per-window failures (HTTP errors, malformed bodies, auth rejections) are
/// counted and isolated; the sync succeeds iff at least one window produced
/// a structurally valid response. The returned future resolves exactly once,
/// after all fetches and all writes spawned by them have completed.
pub async fn sync_measurements(
    db: &Database,
    client: &FitbitClient,
    settings: &SettingsStore,
    kind: MeasurementKind,
    start: NaiveDate,
    end: Option<NaiveDate>,
    progress: &dyn SyncProgress,
) -> Result<SyncReport> {
    // A token exchange mid-flight means this sync cannot decorate its
    // requests consistently; abort our own issuance, not the exchange.
    if client.authorization_in_progress() {
        log::error!("authorization in progress; aborting sync");
        return Err(Error::Auth("authorization in progress".into()));
    }

    // Pre-flight range check: fail before any side effects.
    if let Some(end) = end {
        if start >= end {
            log::error!("start date {start} is not before end date {end}");
            return Err(Error::InvalidRange(format!(
                "start {start} must precede end {end}"
            )));
        }
    }

    let ranges = crate::sync::partition::partition(start, end)?;
    let span_end = ranges.last().expect("partition returns at least one range").end;

    let begin_line = match end {
        Some(end) => format!(
            "Beginning sync from {} till {}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ),
        None => format!("Beginning sync from {}", start.format("%Y-%m-%d")),
    };
    settings.append_log(&begin_line).await?;
    progress.on_windows_planned(kind.as_str(), ranges.len());
    log::debug!("date windows: {:?}", ranges.iter().map(ToString::to_string).collect::<Vec<_>>());

    let job_id = db
        .writer()
        .call({
            let kind = kind.to_string();
            let range_start = start.format("%Y-%m-%d").to_string();
            let range_end = span_end.format("%Y-%m-%d").to_string();
            move |conn| repository::insert_sync_job(conn, &kind, &range_start, &range_end)
        })
        .await?;

    // Preferences and authorization are read once per sync; the outcome
    // accumulator is owned by this invocation alone.
    let prefs = settings.preferences().await?;
    let authorized = writer::authorized_categories(db).await?;
    let outcome = Mutex::new(SyncOutcome {
        requests_issued: ranges.len() as u64,
        ..Default::default()
    });
    let invalidated = AtomicBool::new(false);

    // Fan out one fetch per window; each successful fetch fans out further
    // into per-record writes. Everything meets at this one join barrier.
    let windows = ranges.iter().map(|range| {
        let url = client.window_url(kind, range);
        let outcome = &outcome;
        let invalidated = &invalidated;
        let prefs = &prefs;
        let authorized = &authorized;
        async move {
            match client.fetch(&url).await {
                Ok(body) => match records::parse_records(&body) {
                    Ok(records) => {
                        {
                            let mut o = outcome.lock().unwrap();
                            o.requests_succeeded += 1;
                            o.any_request_succeeded = true;
                            o.records_received += records.len() as u64;
                        }
                        let saves = records
                            .iter()
                            .map(|record| writer::save_record(db, record, prefs, authorized));
                        let results = join_all(saves).await;

                        let mut o = outcome.lock().unwrap();
                        for record_outcomes in &results {
                            for (_, write) in record_outcomes {
                                match write {
                                    WriteOutcome::Saved => o.writes_succeeded += 1,
                                    WriteOutcome::Skipped(_) => o.writes_skipped += 1,
                                    WriteOutcome::Failed(_) => o.writes_errored += 1,
                                }
                            }
                        }
                        drop(o);
                        progress.on_window_complete(range, records.len());
                    }
                    Err(e) => {
                        log::error!("parsing response for window {range} failed: {e}");
                        progress.on_window_failed(range, &e.to_string());
                    }
                },
                Err(Error::Auth(msg)) => {
                    // One credential invalidation per sync, no matter how
                    // many windows hit the auth wall.
                    if !invalidated.swap(true, Ordering::SeqCst) {
                        client.invalidate_token();
                    }
                    log::error!("auth failure fetching window {range}: {msg}");
                    progress.on_window_failed(range, &msg);
                }
                Err(e) => {
                    log::error!("error on API request for window {range}: {e}");
                    progress.on_window_failed(range, &e.to_string());
                }
            }
        }
    });
    join_all(windows).await;

    let outcome = outcome.into_inner().unwrap();
    let report = SyncReport::from_outcome(kind.to_string(), &outcome);

    if report.succeeded() {
        let saved = report.samples_saved;
        let noun = if saved == 1 { "sample" } else { "samples" };
        settings
            .set_last_sync(span_end, &format!("{saved} {noun} added"))
            .await?;
        settings
            .append_log(&format!(
                "Sync complete with\n    {} saved, {} skipped, and {} errors",
                report.samples_saved, report.samples_skipped, report.samples_errored
            ))
            .await?;
        log::info!(
            "successful sync: received {}, saved {}",
            report.records_received,
            report.samples_saved
        );
    } else {
        settings
            .append_log("Sync failed with no valid responses from API")
            .await?;
        log::error!("sync failed with no valid responses from API");
    }

    let job_status = match report.status {
        SyncStatus::Success => "completed",
        SyncStatus::PartialFailure => "partial_failure",
        SyncStatus::Failed => "failed",
    };
    db.writer()
        .call({
            let status = job_status.to_string();
            let error = report.error.clone();
            let o = outcome.clone();
            move |conn| {
                repository::update_sync_job(
                    conn,
                    job_id,
                    &status,
                    o.requests_issued,
                    o.requests_succeeded,
                    o.records_received,
                    o.writes_succeeded,
                    o.writes_skipped,
                    o.writes_errored,
                    error.as_deref(),
                )
            }
        })
        .await?;

    progress.on_sync_complete(&report);
    Ok(report)
}
