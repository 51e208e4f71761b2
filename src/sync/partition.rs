use std::fmt;

use chrono::{Datelike, Duration, NaiveDate};

use crate::date_util::last_day_of_month;
use crate::error::{Error, Result};

/// A date range [start, end] inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// Split [start, end] into month-aligned request windows.
///
/// The Fitbit body-log endpoint caps one request at roughly a month of data,
/// so each window stays inside a single calendar month: the first window runs
/// from `start` to the end of its month, the last from the first of its month
/// to `end`, and a span inside one month (or a single day) yields exactly one
/// window. `end` defaults to today when not given. The result is an ordered
/// cover of the span with no gaps and no overlaps.
pub fn partition(start: NaiveDate, end: Option<NaiveDate>) -> Result<Vec<DateRange>> {
    let resolved_end = end.unwrap_or_else(|| chrono::Local::now().date_naive());

    if resolved_end < start {
        return Err(Error::InvalidRange(format!(
            "end {} precedes start {}",
            resolved_end.format("%Y-%m-%d"),
            start.format("%Y-%m-%d")
        )));
    }

    let mut windows = Vec::new();
    let mut cursor = start;

    while cursor <= resolved_end {
        let month_end = last_day_of_month(cursor.year(), cursor.month());
        let window_end = month_end.min(resolved_end);

        windows.push(DateRange {
            start: cursor,
            end: window_end,
        });

        cursor = window_end + Duration::days(1);
    }

    Ok(windows)
}
