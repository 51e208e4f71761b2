//! Wire types and parsing for the Fitbit weight-log response.
//!
//! The body-fat percentage field is occasionally missing and is not part of
//! the documented weight-log schema, but the API includes it; a record
//! without it is still valid.

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::{Error, Result};

/// The API reports body fat as a 0-100 percentage; samples store a fraction.
const PERCENT_SCALE: f64 = 100.0;

/// One entry of the `weight` array as the API returns it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeightEntry {
    bmi: f64,
    date: String,
    time: String,
    fat: Option<f64>,
    log_id: i64,
    weight: f64,
    source: Option<String>,
}

/// Top-level response object.
#[derive(Debug, Deserialize)]
struct WeightLog {
    weight: Vec<WeightEntry>,
}

/// A parsed body-measurement record. Constructed once per API entry and
/// read-only afterwards; `external_id` is stable across re-fetches and is
/// the store's dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub external_id: String,
    pub recorded_at: NaiveDateTime,
    pub weight: f64,
    pub body_mass_index: f64,
    pub body_fat_fraction: Option<f64>,
    pub source_label: Option<String>,
}

/// Decode a raw response body into measurement records.
///
/// A body that does not match the schema at all (bad JSON, missing required
/// field, unparseable date) fails the whole response with
/// `Error::MalformedResponse`. A decodable response with zero records is a
/// valid empty result, not an error.
pub fn parse_records(body: &[u8]) -> Result<Vec<MeasurementRecord>> {
    let log: WeightLog =
        serde_json::from_slice(body).map_err(|e| Error::MalformedResponse(e.to_string()))?;

    log.weight.into_iter().map(record_from_entry).collect()
}

fn record_from_entry(entry: WeightEntry) -> Result<MeasurementRecord> {
    let stamp = format!("{}T{}", entry.date, entry.time);
    let recorded_at = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| Error::MalformedResponse(format!("bad timestamp {stamp:?}: {e}")))?;

    Ok(MeasurementRecord {
        external_id: entry.log_id.to_string(),
        recorded_at,
        weight: entry.weight,
        body_mass_index: entry.bmi,
        body_fat_fraction: fraction_from_percent(entry.fat),
        source_label: entry.source,
    })
}

/// Convert an optional 0-100 percentage into a 0.0-1.0 fraction.
/// Non-finite input is treated as absent rather than poisoning the record.
fn fraction_from_percent(percent: Option<f64>) -> Option<f64> {
    percent.filter(|p| p.is_finite()).map(|p| p / PERCENT_SCALE)
}
