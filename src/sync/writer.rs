//! Derives per-category samples from one measurement record and writes them
//! to the health store.
//!
//! Each category write is its own async store call: a failed write is
//! reported for that category alone and never aborts its siblings.

use std::collections::HashSet;
use std::fmt;

use futures_util::future::join_all;

use crate::api::records::MeasurementRecord;
use crate::error::Result;
use crate::settings::SyncPreferences;
use crate::storage::{repository, Database};

/// Source label of the Aria scale, the designated primary source.
pub const PRIMARY_SOURCE: &str = "Aria";

/// The four quantities derived from one weight record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    BodyMass,
    BodyMassIndex,
    BodyFatPercentage,
    LeanBodyMass,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::BodyMass,
        Category::BodyMassIndex,
        Category::BodyFatPercentage,
        Category::LeanBodyMass,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Category::BodyMass => "body_mass",
            Category::BodyMassIndex => "body_mass_index",
            Category::BodyFatPercentage => "body_fat_percentage",
            Category::LeanBodyMass => "lean_body_mass",
        }
    }

    pub fn from_key(key: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.key() == key)
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Category::BodyMass | Category::LeanBodyMass => "lb",
            Category::BodyMassIndex => "count",
            Category::BodyFatPercentage => "fraction",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Result of one category write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Saved,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The store denies sharing for this category.
    Unauthorized,
    /// The record carries no body-fat fraction.
    NoData,
    /// Lean mass is turned off in preferences.
    Disabled,
    /// The record is not from the primary source.
    SourceFiltered,
}

/// The categories the store currently authorizes writes for.
pub async fn authorized_categories(db: &Database) -> Result<HashSet<Category>> {
    let rows = db
        .reader()
        .call(|conn| repository::list_authorizations(conn))
        .await?;
    Ok(rows
        .into_iter()
        .filter(|(_, authorized)| *authorized)
        .filter_map(|(key, _)| Category::from_key(&key))
        .collect())
}

/// Write one record's derived samples, reporting an outcome per category.
///
/// Every sample carries the record's external identifier as its dedup key,
/// so re-running a sync over an overlapping date range upserts instead of
/// duplicating.
pub async fn save_record(
    db: &Database,
    record: &MeasurementRecord,
    prefs: &SyncPreferences,
    authorized: &HashSet<Category>,
) -> Vec<(Category, WriteOutcome)> {
    // The primary-source filter skips the whole record before any store call.
    if prefs.restrict_to_primary_source && record.source_label.as_deref() != Some(PRIMARY_SOURCE) {
        log::debug!(
            "skipping record {} from source {:?}",
            record.external_id,
            record.source_label
        );
        return Category::ALL
            .iter()
            .map(|&c| (c, WriteOutcome::Skipped(SkipReason::SourceFiltered)))
            .collect();
    }

    let writes = Category::ALL.iter().map(|&category| async move {
        let outcome = write_category(db, record, prefs, authorized, category).await;
        (category, outcome)
    });
    join_all(writes).await
}

async fn write_category(
    db: &Database,
    record: &MeasurementRecord,
    prefs: &SyncPreferences,
    authorized: &HashSet<Category>,
    category: Category,
) -> WriteOutcome {
    let value = match category {
        Category::BodyMass => record.weight,
        Category::BodyMassIndex => record.body_mass_index,
        Category::BodyFatPercentage => match record.body_fat_fraction {
            Some(fraction) => fraction,
            None => {
                log::debug!("body fat percentage not found for {}", record.external_id);
                return WriteOutcome::Skipped(SkipReason::NoData);
            }
        },
        Category::LeanBodyMass => match record.body_fat_fraction {
            Some(fraction) => {
                if !prefs.include_lean_mass {
                    return WriteOutcome::Skipped(SkipReason::Disabled);
                }
                record.weight * (1.0 - fraction)
            }
            None => {
                log::debug!("lean body mass not derivable for {}", record.external_id);
                return WriteOutcome::Skipped(SkipReason::NoData);
            }
        },
    };

    if !authorized.contains(&category) {
        if prefs.access_warnings {
            log::info!("{category} not authorized");
        }
        return WriteOutcome::Skipped(SkipReason::Unauthorized);
    }

    let external_id = record.external_id.clone();
    let recorded_at = record.recorded_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    let source = record.source_label.clone();
    let result = db
        .writer()
        .call(move |conn| {
            repository::upsert_sample(
                conn,
                &external_id,
                category.key(),
                value,
                category.unit(),
                &recorded_at,
                source.as_deref(),
            )
        })
        .await;

    match result {
        Ok(()) => WriteOutcome::Saved,
        Err(e) => {
            log::error!("error saving {category} sample for {}: {e}", record.external_id);
            WriteOutcome::Failed(e.to_string())
        }
    }
}
