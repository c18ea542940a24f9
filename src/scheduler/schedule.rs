use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{CronError, Result};

/// Evaluates recurrence rules.
pub trait RecurrenceEvaluator: Send + Sync {
    /// First occurrence of `rule` strictly after `after`, or `None` if there is
    /// none before the optional `before` bound (inclusive).
    fn next_occurrence(
        &self,
        rule: &str,
        after: DateTime<Utc>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>>;
}

/// Cron expressions with a seconds field, as understood by the `cron` crate
/// (`sec min hour day-of-month month day-of-week [year]`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CronEvaluator;

impl RecurrenceEvaluator for CronEvaluator {
    fn next_occurrence(
        &self,
        rule: &str,
        after: DateTime<Utc>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let schedule = Schedule::from_str(rule)
            .map_err(|e| CronError::Recurrence(format!("invalid rule '{}': {}", rule, e)))?;
        Ok(schedule
            .after(&after)
            .next()
            .filter(|t| before.map_or(true, |bound| *t <= bound)))
    }
}

/// Computes when a recurring job runs next.
#[derive(Clone)]
pub struct ScheduleCalculator {
    evaluator: Arc<dyn RecurrenceEvaluator>,
}

impl Default for ScheduleCalculator {
    fn default() -> Self {
        Self::new(Arc::new(CronEvaluator))
    }
}

impl ScheduleCalculator {
    pub fn new(evaluator: Arc<dyn RecurrenceEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Next run strictly after `reference + min_gap` and no later than
    /// `repeat_until`.
    ///
    /// Returns `None` for one-shot jobs (no rule), for expired recurrences and
    /// for malformed rules.
    pub fn next_run(
        &self,
        reference: DateTime<Utc>,
        rule: Option<&str>,
        repeat_until: Option<DateTime<Utc>>,
        min_gap: Duration,
    ) -> Option<DateTime<Utc>> {
        let rule = rule?;
        let gap = match chrono::Duration::from_std(min_gap) {
            Ok(gap) => gap,
            Err(e) => {
                tracing::warn!(error = %e, "Reprocess delay out of range, treating job as expired");
                return None;
            }
        };
        let anchor = reference.checked_add_signed(gap)?;
        if repeat_until.is_some_and(|bound| bound <= anchor) {
            return None;
        }

        let mut after = anchor;
        // An evaluator may hand back the anchor itself; step past it once.
        for _ in 0..2 {
            match self.evaluator.next_occurrence(rule, after, repeat_until) {
                Ok(Some(next)) if next > anchor => {
                    return repeat_until.map_or(true, |bound| next <= bound).then_some(next);
                }
                Ok(Some(next)) => after = next,
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(rule, error = %e, "Malformed recurrence rule, treating job as expired");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h, m, s).unwrap()
    }

    /// Returns `after` itself whenever it falls on a whole minute.
    struct InclusiveMinutes;

    impl RecurrenceEvaluator for InclusiveMinutes {
        fn next_occurrence(
            &self,
            _rule: &str,
            after: DateTime<Utc>,
            _before: Option<DateTime<Utc>>,
        ) -> Result<Option<DateTime<Utc>>> {
            let floor = after - chrono::Duration::seconds(after.timestamp().rem_euclid(60));
            if floor == after {
                Ok(Some(after))
            } else {
                Ok(Some(floor + chrono::Duration::minutes(1)))
            }
        }
    }

    #[test]
    fn one_shot_has_no_next_run() {
        let calc = ScheduleCalculator::default();
        assert_eq!(calc.next_run(at(12, 0, 0), None, None, Duration::ZERO), None);
    }

    #[test]
    fn reference_on_an_occurrence_is_skipped() {
        let calc = ScheduleCalculator::default();
        let next = calc.next_run(at(12, 0, 0), Some("0 * * * * *"), None, Duration::ZERO);
        assert_eq!(next, Some(at(12, 1, 0)));
    }

    #[test]
    fn inclusive_evaluator_still_makes_progress() {
        let calc = ScheduleCalculator::new(Arc::new(InclusiveMinutes));
        let next = calc.next_run(at(12, 0, 0), Some("minutely"), None, Duration::ZERO);
        assert_eq!(next, Some(at(12, 1, 0)));
    }

    #[test]
    fn gap_pushes_the_anchor_forward() {
        let calc = ScheduleCalculator::default();
        let next = calc.next_run(
            at(12, 0, 0),
            Some("* * * * * *"),
            None,
            Duration::from_secs(5),
        );
        assert_eq!(next, Some(at(12, 0, 6)));
    }

    #[test]
    fn never_runs_past_repeat_until() {
        let calc = ScheduleCalculator::default();
        let bound = at(12, 0, 3);
        let mut reference = at(12, 0, 0);
        let mut runs = Vec::new();
        while let Some(next) =
            calc.next_run(reference, Some("* * * * * *"), Some(bound), Duration::ZERO)
        {
            assert!(next <= bound);
            runs.push(next);
            reference = next;
        }
        assert_eq!(runs, vec![at(12, 0, 1), at(12, 0, 2), at(12, 0, 3)]);
    }

    #[test]
    fn expired_window_yields_none() {
        let calc = ScheduleCalculator::default();
        let next = calc.next_run(
            at(12, 0, 0),
            Some("* * * * * *"),
            Some(at(11, 0, 0)),
            Duration::ZERO,
        );
        assert_eq!(next, None);
    }

    #[test]
    fn malformed_rule_fails_closed() {
        let calc = ScheduleCalculator::default();
        assert_eq!(
            calc.next_run(at(12, 0, 0), Some("not a rule"), None, Duration::ZERO),
            None
        );
    }
}
