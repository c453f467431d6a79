//! Interval scheduler: nearest free calendar slot.
//!
//! Walks qualifying days from today (UTC), lays out back-to-back candidate
//! slots inside the daily window and returns the first one that overlaps no
//! busy interval. Deterministic: depends only on its inputs and `now`.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use leadflow_core::BusySlot;

/// Working-hours window the search runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingWindow {
    /// First bookable weekday, 0 = Monday.
    pub start_weekday: u32,
    /// Last bookable weekday, inclusive.
    pub end_weekday: u32,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub duration: Duration,
    /// Calendar days examined, counting today.
    pub horizon_days: u32,
}

impl WorkingWindow {
    /// Monday–Friday, 08:00–17:00, one-hour slots, two weeks ahead.
    pub fn office_hours() -> Self {
        Self {
            start_weekday: 0,
            end_weekday: 4,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            duration: Duration::minutes(60),
            horizon_days: 14,
        }
    }

    fn accepts_weekday(&self, weekday: u32) -> bool {
        self.start_weekday <= weekday && weekday <= self.end_weekday
    }
}

/// Earliest available slot start, or `None` when the horizon is exhausted.
pub fn find_nearest_slot(
    busy: &[BusySlot],
    window: &WorkingWindow,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if window.duration <= Duration::zero() {
        return None;
    }

    for offset in 0..window.horizon_days {
        let day = now.date_naive() + Duration::days(i64::from(offset));
        if !window.accepts_weekday(day.weekday().num_days_from_monday()) {
            continue;
        }

        let mut start = day.and_time(window.start_time).and_utc();
        let end = day.and_time(window.end_time).and_utc();
        while start < end {
            let slot_end = start + window.duration;
            if start >= now && busy.iter().all(|b| !b.overlaps(start, slot_end)) {
                return Some(start);
            }
            start = slot_end;
        }
    }

    tracing::debug!(
        "📭 No free slot in {} days ({} busy intervals)",
        window.horizon_days,
        busy.len()
    );
    None
}
