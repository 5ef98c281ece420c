//! Polling window planning across runs.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackPolicy {
    /// Used when there is no previous check time (first run or lost state).
    pub default_lookback: Duration,
    /// Upper bound on catch-up after a long outage.
    pub max_lookback: Duration,
}

impl Default for LookbackPolicy {
    fn default() -> Self {
        Self {
            default_lookback: Duration::hours(6),
            max_lookback: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Computes the `[start, end]` range to query this run.
///
/// Starting exactly at the previous check time closes gaps left by scheduler
/// jitter; the overlap this produces is absorbed by the deduplicator.
pub fn plan_window(
    last_check_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &LookbackPolicy,
) -> TimeWindow {
    let start = match last_check_time {
        None => now - policy.default_lookback,
        Some(last) => last.max(now - policy.max_lookback),
    };
    // A check time in the future (clock skew, hand-edited state) must not invert the window.
    TimeWindow {
        start: start.min(now),
        end: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    #[test]
    fn first_run_uses_default_lookback() {
        let policy = LookbackPolicy::default();
        let now = at(1_760_000_000);
        let window = plan_window(None, now, &policy);
        assert_eq!(window.start, now - Duration::hours(6));
        assert_eq!(window.end, now);
    }

    #[test]
    fn recent_check_time_is_used_as_start() {
        let policy = LookbackPolicy::default();
        let now = at(1_760_000_000);
        for gap in [0, 60, 30 * 60, 24 * 60 * 60] {
            let last = now - Duration::seconds(gap);
            let window = plan_window(Some(last), now, &policy);
            assert_eq!(window.start, last, "gap {gap}");
        }
    }

    #[test]
    fn long_outage_is_capped_at_max_lookback() {
        let policy = LookbackPolicy::default();
        let now = at(1_760_000_000);
        let window = plan_window(Some(now - Duration::days(5)), now, &policy);
        assert_eq!(window.start, now - Duration::hours(24));
    }

    #[test]
    fn future_check_time_never_inverts_window() {
        let policy = LookbackPolicy::default();
        let now = at(1_760_000_000);
        let window = plan_window(Some(now + Duration::minutes(10)), now, &policy);
        assert!(window.start <= window.end);
        assert_eq!(window.start, now);
        assert!(window.contains(now));
    }
}
