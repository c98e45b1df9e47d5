//! Summaries over logged sessions.
//!
//! A session counts for the day its `end_time` falls on (UTC). Tombstoned
//! records are ignored, so any record sequence can be passed in, but
//! [`crate::LocalStore::list_active`] is the usual source.

use crate::types::{Timestamp, MILLIS_PER_DAY};
use crate::workout::WorkoutRecord;
use std::collections::HashSet;
use std::time::Duration;

/// Longest streak reported by [`completion_streak`].
pub const MAX_STREAK_DAYS: u32 = 30;

/// Totals and averages over a set of sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkoutStats {
    /// Number of sessions.
    pub total_sessions: u32,
    /// Sum of session durations.
    pub total_duration: Duration,
    /// Mean session duration, truncated to whole milliseconds.
    pub average_duration: Duration,
    /// Sum of recorded calories.
    pub total_calories: u64,
    /// Mean calories per session (sessions without a value count as 0).
    pub average_calories: u32,
}

fn active(
    records: impl IntoIterator<Item = WorkoutRecord>,
) -> impl Iterator<Item = WorkoutRecord> {
    records.into_iter().filter(|r| !r.deleted)
}

fn window_start(now: Timestamp, days: u32) -> Timestamp {
    Timestamp::from_millis(now.as_millis().saturating_sub(i64::from(days) * MILLIS_PER_DAY))
}

/// Sessions that ended within the last `days` days before `now`.
pub fn sessions_since(
    records: impl IntoIterator<Item = WorkoutRecord>,
    now: Timestamp,
    days: u32,
) -> Vec<WorkoutRecord> {
    let from = window_start(now, days);
    active(records).filter(|r| r.end_time > from).collect()
}

/// Sessions that ended on UTC day `day` (see [`Timestamp::day`]).
pub fn sessions_on_day(
    records: impl IntoIterator<Item = WorkoutRecord>,
    day: i64,
) -> Vec<WorkoutRecord> {
    active(records).filter(|r| r.end_time.day() == day).collect()
}

/// Consecutive days with at least one session, counting back from `today`.
///
/// Stops at the first day without a session and never exceeds
/// [`MAX_STREAK_DAYS`].
pub fn completion_streak(
    records: impl IntoIterator<Item = WorkoutRecord>,
    today: Timestamp,
) -> u32 {
    let days: HashSet<i64> = active(records).map(|r| r.end_time.day()).collect();
    let today = today.day();
    (0..MAX_STREAK_DAYS)
        .take_while(|back| days.contains(&(today - i64::from(*back))))
        .count() as u32
}

/// Totals and averages over sessions that ended within the last `days`
/// days before `now`.
pub fn stats_since(
    records: impl IntoIterator<Item = WorkoutRecord>,
    now: Timestamp,
    days: u32,
) -> WorkoutStats {
    summarize(sessions_since(records, now, days))
}

/// Totals and averages over every given (non-tombstoned) session.
pub fn summarize(records: impl IntoIterator<Item = WorkoutRecord>) -> WorkoutStats {
    let mut stats = WorkoutStats::default();
    for record in active(records) {
        stats.total_sessions += 1;
        stats.total_duration += record.duration();
        stats.total_calories += u64::from(record.calories_burned.unwrap_or(0));
    }
    if stats.total_sessions > 0 {
        let sessions = u64::from(stats.total_sessions);
        let total_millis = u64::try_from(stats.total_duration.as_millis()).unwrap_or(u64::MAX);
        stats.average_duration = Duration::from_millis(total_millis / sessions);
        stats.average_calories =
            u32::try_from(stats.total_calories / sessions).unwrap_or(u32::MAX);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn ending_at(end: i64, minutes: i64) -> WorkoutRecord {
        WorkoutRecord::new(
            Timestamp::from_millis(end - minutes * 60_000),
            Timestamp::from_millis(end),
        )
    }

    fn day(n: i64) -> i64 {
        n * MILLIS_PER_DAY
    }

    #[test]
    fn sessions_since_uses_end_time() {
        let now = Timestamp::from_millis(day(10));
        let inside = ending_at(day(9) + HOUR, 30);
        let outside = ending_at(day(2), 30);
        let found = sessions_since(vec![inside.clone(), outside], now, 7);
        assert_eq!(found, vec![inside]);
    }

    #[test]
    fn sessions_on_day_ignores_tombstones() {
        let a = ending_at(day(5) + HOUR, 20);
        let mut b = ending_at(day(5) + 2 * HOUR, 20);
        b.deleted = true;
        let c = ending_at(day(6) + HOUR, 20);
        let found = sessions_on_day(vec![a.clone(), b, c], 5);
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn streak_stops_at_first_gap() {
        let today = Timestamp::from_millis(day(20) + 5 * HOUR);
        let records = vec![
            ending_at(day(20) + HOUR, 30),
            ending_at(day(19) + HOUR, 30),
            ending_at(day(19) + 3 * HOUR, 30),
            ending_at(day(18) + HOUR, 30),
            ending_at(day(16) + HOUR, 30),
        ];
        assert_eq!(completion_streak(records, today), 3);
    }

    #[test]
    fn streak_is_zero_without_session_today() {
        let today = Timestamp::from_millis(day(20));
        let records = vec![ending_at(day(19) + HOUR, 30)];
        assert_eq!(completion_streak(records, today), 0);
    }

    #[test]
    fn streak_is_capped() {
        let today = Timestamp::from_millis(day(100));
        let records: Vec<_> = (0..60).map(|n| ending_at(day(100 - n) + 1, 0)).collect();
        assert_eq!(completion_streak(records, today), MAX_STREAK_DAYS);
    }

    #[test]
    fn averages_are_truncated() {
        let now = Timestamp::from_millis(day(3));
        let records = vec![
            ending_at(day(2), 30).calories(200),
            ending_at(day(2) + HOUR, 45).calories(301),
            ending_at(day(2) + 2 * HOUR, 60),
        ];
        let stats = stats_since(records, now, 7);
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.total_duration, Duration::from_secs(135 * 60));
        assert_eq!(stats.average_duration, Duration::from_secs(45 * 60));
        assert_eq!(stats.total_calories, 501);
        assert_eq!(stats.average_calories, 167);
    }

    #[test]
    fn empty_stats() {
        assert_eq!(summarize(Vec::new()), WorkoutStats::default());
    }
}
