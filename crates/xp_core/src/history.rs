use chrono::{Days, NaiveDate};
use serde::Serialize;

use crate::aggregate::{DaySummary, XpAggregator};

pub const DEFAULT_WINDOW_DAYS: u32 = 30;
/// Ten years of rows; longer windows are truncated.
pub const MAX_WINDOW_DAYS: u32 = 3660;

/// One row per day for the `window` days ending at `end` inclusive, oldest first.
pub fn report(aggregator: &XpAggregator<'_>, end: NaiveDate, window: u32) -> Vec<DaySummary> {
    (0..window.min(MAX_WINDOW_DAYS))
        .rev()
        .filter_map(|offset| end.checked_sub_days(Days::new(u64::from(offset))))
        .map(|date| aggregator.summary(date))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryTotals {
    pub days: usize,
    pub active_days: usize,
    pub count: usize,
    pub xp: u64,
}

pub fn totals(rows: &[DaySummary]) -> HistoryTotals {
    rows.iter().fold(HistoryTotals::default(), |mut acc, row| {
        acc.days += 1;
        if row.count > 0 {
            acc.active_days += 1;
        }
        acc.count += row.count;
        acc.xp += row.xp;
        acc
    })
}
