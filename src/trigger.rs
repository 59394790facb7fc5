//! Re-arming policies that compute when an event should next fire.
//!
//! A trigger is a pure function of its internal counter state plus the
//! current time; it performs no I/O. `next` advances the counter and returns
//! the next absolute fire timestamp, or `None` once exhausted.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle of a trigger.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Never asked for a fire time.
    #[default]
    Pending,
    /// Produced at least one fire time; more may follow.
    Fired,
    /// No further occurrences.
    Exhausted,
    /// Explicitly cancelled; `next` returns `None` from here on.
    Cancelled,
}

/// Repeat policy for interval triggers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    /// Fire exactly this many times.
    Times(u32),
    /// Fire until cancelled.
    Forever,
}

/// Re-arming policy for a recurring or delayed event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at an absolute time.
    Once {
        fire_at: DateTime<Utc>,
        #[serde(default)]
        status: TriggerStatus,
    },
    /// Fire every `period`, anchored at `start_at` (or the first `next` call).
    Interval {
        period: Duration,
        start_at: Option<DateTime<Utc>>,
        repeat: Repeat,
        #[serde(default)]
        fired: u32,
        #[serde(default)]
        anchor: Option<DateTime<Utc>>,
        #[serde(default)]
        status: TriggerStatus,
    },
    /// Fire on a cron schedule. The expression is validated at construction
    /// and re-parsed on each `next` call.
    Cron {
        expression: String,
        #[serde(default)]
        fired: u32,
        #[serde(default)]
        status: TriggerStatus,
    },
}

impl Trigger {
    /// One-shot trigger at an absolute time.
    pub fn once(fire_at: DateTime<Utc>) -> Self {
        Self::Once {
            fire_at,
            status: TriggerStatus::Pending,
        }
    }

    /// One-shot trigger after a delay from now.
    pub fn once_in(delay: Duration) -> Self {
        Self::once(Utc::now() + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero()))
    }

    /// Interval trigger anchored at the first `next` call, repeating forever.
    pub fn interval(period: Duration) -> Self {
        Self::interval_with(period, None, Repeat::Forever)
    }

    /// Interval trigger with explicit anchor and repeat policy.
    pub fn interval_with(
        period: Duration,
        start_at: Option<DateTime<Utc>>,
        repeat: Repeat,
    ) -> Self {
        Self::Interval {
            period,
            start_at,
            repeat,
            fired: 0,
            anchor: None,
            status: TriggerStatus::Pending,
        }
    }

    /// Cron trigger. Fails fast on an invalid expression.
    pub fn cron(expression: impl Into<String>) -> Result<Self, TriggerError> {
        let expression = expression.into();
        CronSchedule::from_str(&expression)?;
        Ok(Self::Cron {
            expression,
            fired: 0,
            status: TriggerStatus::Pending,
        })
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TriggerStatus {
        match self {
            Self::Once { status, .. }
            | Self::Interval { status, .. }
            | Self::Cron { status, .. } => *status,
        }
    }

    /// Cancel the trigger; subsequent `next` calls return `None`.
    pub fn cancel(&mut self) {
        match self {
            Self::Once { status, .. }
            | Self::Interval { status, .. }
            | Self::Cron { status, .. } => *status = TriggerStatus::Cancelled,
        }
    }

    /// Advance to the next occurrence.
    ///
    /// Returns the absolute fire timestamp, or `None` when exhausted or
    /// cancelled. A returned timestamp in the past means "fire immediately".
    pub fn next(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if matches!(
            self.status(),
            TriggerStatus::Exhausted | TriggerStatus::Cancelled
        ) {
            return None;
        }

        match self {
            Self::Once { fire_at, status } => {
                if *status == TriggerStatus::Pending {
                    *status = TriggerStatus::Fired;
                    Some(*fire_at)
                } else {
                    *status = TriggerStatus::Exhausted;
                    None
                }
            }
            Self::Interval {
                period,
                start_at,
                repeat,
                fired,
                anchor,
                status,
            } => {
                if let Repeat::Times(max) = repeat {
                    if *fired >= *max {
                        *status = TriggerStatus::Exhausted;
                        return None;
                    }
                }
                let base = *anchor.get_or_insert_with(|| start_at.unwrap_or(now));
                let step = ChronoDuration::from_std(*period).unwrap_or(ChronoDuration::zero());
                let fire_at = base + step * (*fired as i32);
                *fired += 1;
                *status = TriggerStatus::Fired;
                Some(fire_at)
            }
            Self::Cron {
                expression,
                fired,
                status,
            } => {
                // Validated at construction; a parse failure here means the
                // record was built outside the constructor.
                let Ok(schedule) = CronSchedule::from_str(expression) else {
                    *status = TriggerStatus::Exhausted;
                    return None;
                };
                match schedule.after(&now).next() {
                    Some(fire_at) => {
                        *fired += 1;
                        *status = TriggerStatus::Fired;
                        Some(fire_at)
                    }
                    None => {
                        *status = TriggerStatus::Exhausted;
                        None
                    }
                }
            }
        }
    }
}

/// Trigger construction failures.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid cron expression: {0}")]
    InvalidCron(#[from] cron::error::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let mut trigger = Trigger::once(at(5));
        assert_eq!(trigger.status(), TriggerStatus::Pending);

        assert_eq!(trigger.next(at(0)), Some(at(5)));
        assert_eq!(trigger.status(), TriggerStatus::Fired);

        assert_eq!(trigger.next(at(10)), None);
        assert_eq!(trigger.status(), TriggerStatus::Exhausted);

        // Exhausted stays exhausted.
        assert_eq!(trigger.next(at(20)), None);
    }

    #[test]
    fn test_interval_anchored_at_first_call() {
        let mut trigger = Trigger::interval(Duration::from_secs(10));
        assert_eq!(trigger.next(at(0)), Some(at(0)));
        assert_eq!(trigger.next(at(1)), Some(at(10)));
        assert_eq!(trigger.next(at(11)), Some(at(20)));
        assert_eq!(trigger.status(), TriggerStatus::Fired);
    }

    #[test]
    fn test_interval_with_explicit_start() {
        let mut trigger =
            Trigger::interval_with(Duration::from_secs(60), Some(at(100)), Repeat::Forever);
        assert_eq!(trigger.next(at(0)), Some(at(100)));
        assert_eq!(trigger.next(at(100)), Some(at(160)));
    }

    #[test]
    fn test_interval_repeat_count_exhausts() {
        let mut trigger =
            Trigger::interval_with(Duration::from_secs(1), None, Repeat::Times(3));
        assert!(trigger.next(at(0)).is_some());
        assert!(trigger.next(at(1)).is_some());
        assert!(trigger.next(at(2)).is_some());
        assert_eq!(trigger.next(at(3)), None);
        assert_eq!(trigger.status(), TriggerStatus::Exhausted);
    }

    #[test]
    fn test_cancel_stops_pending_trigger() {
        let mut trigger = Trigger::interval(Duration::from_secs(1));
        trigger.cancel();
        assert_eq!(trigger.status(), TriggerStatus::Cancelled);
        assert_eq!(trigger.next(at(0)), None);
    }

    #[test]
    fn test_cron_rejects_invalid_expression() {
        assert!(Trigger::cron("not a cron expr").is_err());
    }

    #[test]
    fn test_cron_produces_future_fire_times() {
        // Every minute at second 0.
        let mut trigger = Trigger::cron("0 * * * * *").unwrap();
        let now = at(0);
        let first = trigger.next(now).unwrap();
        assert!(first > now);
        let second = trigger.next(first).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_counter_state_survives_clone() {
        let mut trigger = Trigger::interval_with(Duration::from_secs(1), None, Repeat::Times(2));
        assert!(trigger.next(at(0)).is_some());

        let mut copy = trigger.clone();
        assert!(copy.next(at(1)).is_some());
        assert_eq!(copy.next(at(2)), None);
    }
}
