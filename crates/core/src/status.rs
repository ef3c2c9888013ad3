//! Job lifecycle: status derivation from timestamps and the transition rules.
//!
//! A job's status is never stored. It is derived from five nullable
//! timestamps with a fixed precedence:
//!
//! | set timestamp (highest wins) | status          |
//! |------------------------------|-----------------|
//! | cancel                       | `Cancelled`     |
//! | fail                         | `Failed`        |
//! | finish                       | `Finished`      |
//! | start                        | `Started`       |
//! | queue                        | `Queued`        |
//! | none                         | `Indeterminate` |
//!
//! A transition only ever fills the one empty timestamp implied by the target
//! status; timestamps already set are never touched again.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::progress::ProgressPercent;

/// Derived status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Indeterminate,
    Queued,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Indeterminate,
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Finished, failed and cancelled jobs are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position in the lifecycle; the three terminal states share a rank.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Indeterminate => 0,
            JobStatus::Queued => 1,
            JobStatus::Started => 2,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled => 3,
        }
    }

    /// Whether a job currently in `self` may move to `target`.
    ///
    /// Moves must go strictly forward. `Started` is only reachable from
    /// `Queued` and `Finished` only from `Started`; failing or cancelling is
    /// possible from any non-terminal status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        if target.rank() <= self.rank() {
            return false;
        }

        match target {
            JobStatus::Indeterminate => false,
            JobStatus::Queued => *self == JobStatus::Indeterminate,
            JobStatus::Started => *self == JobStatus::Queued,
            JobStatus::Finished => *self == JobStatus::Started,
            JobStatus::Failed | JobStatus::Cancelled => true,
        }
    }

    /// Progress a job is given as it enters this status, if any.
    pub fn progress_on_entry(&self) -> Option<ProgressPercent> {
        match self {
            JobStatus::Started => Some(ProgressPercent::ZERO),
            JobStatus::Finished => Some(ProgressPercent::COMPLETE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Indeterminate => "INDETERMINATE",
            JobStatus::Queued => "QUEUED",
            JobStatus::Started => "STARTED",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| JobError::validation(format!("unknown job status [{s}]")))
    }
}

/// The five lifecycle timestamps of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub queue: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    pub fail: Option<DateTime<Utc>>,
    pub cancel: Option<DateTime<Utc>>,
}

impl JobTimestamps {
    /// Timestamps of a freshly queued job.
    pub fn queued_at(at: DateTime<Utc>) -> Self {
        Self {
            queue: Some(at),
            ..Self::default()
        }
    }

    /// Derive the status by timestamp precedence.
    pub fn status(&self) -> JobStatus {
        if self.cancel.is_some() {
            JobStatus::Cancelled
        } else if self.fail.is_some() {
            JobStatus::Failed
        } else if self.finish.is_some() {
            JobStatus::Finished
        } else if self.start.is_some() {
            JobStatus::Started
        } else if self.queue.is_some() {
            JobStatus::Queued
        } else {
            JobStatus::Indeterminate
        }
    }

    /// True once any terminal timestamp is set.
    pub fn is_finished(&self) -> bool {
        self.finish.is_some() || self.fail.is_some() || self.cancel.is_some()
    }

    /// Decide whether moving to `target` changes anything.
    ///
    /// Returns `Ok(None)` when the job already has the target status,
    /// `Ok(Some(target))` when exactly one timestamp must be set, and an error
    /// for moves the lifecycle forbids.
    pub fn plan_transition(&self, target: JobStatus) -> Result<Option<JobStatus>, JobError> {
        let current = self.status();

        if current == target {
            return Ok(None);
        }

        if !current.can_transition_to(target) {
            return Err(JobError::Transition {
                from: current,
                to: target,
            });
        }

        if self.slot(target).is_some() {
            return Err(JobError::illegal_state(format!(
                "timestamp for {target} is already set while status is {current}"
            )));
        }

        Ok(Some(target))
    }

    /// Apply a transition in memory, returning whether a timestamp was set.
    pub fn apply(&mut self, target: JobStatus, now: DateTime<Utc>) -> Result<bool, JobError> {
        match self.plan_transition(target)? {
            None => Ok(false),
            Some(JobStatus::Queued) => Ok(self.queue.replace(now).is_none()),
            Some(JobStatus::Started) => Ok(self.start.replace(now).is_none()),
            Some(JobStatus::Finished) => Ok(self.finish.replace(now).is_none()),
            Some(JobStatus::Failed) => Ok(self.fail.replace(now).is_none()),
            Some(JobStatus::Cancelled) => Ok(self.cancel.replace(now).is_none()),
            Some(JobStatus::Indeterminate) => Err(JobError::illegal_state(
                "a job cannot be moved back to INDETERMINATE",
            )),
        }
    }

    fn slot(&self, status: JobStatus) -> Option<DateTime<Utc>> {
        match status {
            JobStatus::Indeterminate => None,
            JobStatus::Queued => self.queue,
            JobStatus::Started => self.start,
            JobStatus::Finished => self.finish,
            JobStatus::Failed => self.fail,
            JobStatus::Cancelled => self.cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn set_count(ts: &JobTimestamps) -> usize {
        [ts.queue, ts.start, ts.finish, ts.fail, ts.cancel]
            .iter()
            .filter(|v| v.is_some())
            .count()
    }

    #[test]
    fn precedence_prefers_cancel_over_everything() {
        let ts = JobTimestamps {
            queue: Some(t(0)),
            start: Some(t(1)),
            finish: Some(t(2)),
            fail: Some(t(3)),
            cancel: Some(t(4)),
        };
        assert_eq!(ts.status(), JobStatus::Cancelled);

        let ts = JobTimestamps {
            cancel: None,
            ..ts
        };
        assert_eq!(ts.status(), JobStatus::Failed);
        assert_eq!(JobTimestamps::default().status(), JobStatus::Indeterminate);
    }

    #[test]
    fn legal_sequences_set_exactly_one_timestamp_each() {
        for terminal in [JobStatus::Finished, JobStatus::Failed, JobStatus::Cancelled] {
            let mut ts = JobTimestamps::default();
            let mut previous = ts;

            for (step, target) in [JobStatus::Queued, JobStatus::Started, terminal]
                .into_iter()
                .enumerate()
            {
                assert!(ts.apply(target, t(step as i64)).unwrap());
                assert_eq!(ts.status(), target);
                assert_eq!(set_count(&ts), set_count(&previous) + 1);

                // earlier timestamps are untouched
                if previous.queue.is_some() {
                    assert_eq!(ts.queue, previous.queue);
                }
                if previous.start.is_some() {
                    assert_eq!(ts.start, previous.start);
                }
                previous = ts;
            }
        }
    }

    #[test]
    fn same_status_is_a_no_op() {
        let mut ts = JobTimestamps::queued_at(t(0));
        assert!(!ts.apply(JobStatus::Queued, t(10)).unwrap());
        assert_eq!(ts.queue, Some(t(0)));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut queued = JobTimestamps::queued_at(t(0));
        assert_eq!(
            queued.apply(JobStatus::Finished, t(1)),
            Err(JobError::Transition {
                from: JobStatus::Queued,
                to: JobStatus::Finished
            })
        );

        let mut finished = queued;
        finished.apply(JobStatus::Started, t(1)).unwrap();
        finished.apply(JobStatus::Finished, t(2)).unwrap();

        for target in [JobStatus::Queued, JobStatus::Started, JobStatus::Failed, JobStatus::Cancelled] {
            let before = finished;
            assert!(finished.apply(target, t(3)).is_err());
            assert_eq!(finished, before);
        }
    }

    #[test]
    fn queued_job_can_be_cancelled_or_failed() {
        let mut ts = JobTimestamps::queued_at(t(0));
        assert!(ts.apply(JobStatus::Cancelled, t(1)).unwrap());
        assert_eq!(ts.status(), JobStatus::Cancelled);
        assert!(ts.start.is_none());
        assert!(ts.is_finished());
    }

    #[test]
    fn progress_is_reset_on_start_and_completed_on_finish() {
        assert_eq!(JobStatus::Started.progress_on_entry(), Some(ProgressPercent::ZERO));
        assert_eq!(JobStatus::Finished.progress_on_entry(), Some(ProgressPercent::COMPLETE));
        assert_eq!(JobStatus::Failed.progress_on_entry(), None);
    }

    #[test]
    fn status_names_parse_case_insensitively() {
        assert_eq!("started".parse::<JobStatus>().unwrap(), JobStatus::Started);
        assert_eq!("CANCELLED".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("running".parse::<JobStatus>().is_err());
    }

    fn arb_timestamp() -> impl Strategy<Value = Option<DateTime<Utc>>> {
        prop::option::of((0i64..10_000).prop_map(|s| t(0) + Duration::seconds(s)))
    }

    fn arb_status() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: finished-ness agrees with the derived status for any
        /// combination of timestamps.
        #[test]
        fn derived_status_is_terminal_iff_finished(
            queue in arb_timestamp(),
            start in arb_timestamp(),
            finish in arb_timestamp(),
            fail in arb_timestamp(),
            cancel in arb_timestamp(),
        ) {
            let ts = JobTimestamps { queue, start, finish, fail, cancel };
            prop_assert_eq!(ts.status().is_terminal(), ts.is_finished());
        }

        /// Property: whatever sequence of targets is applied, a set timestamp
        /// is never cleared or changed and each change sets exactly one.
        #[test]
        fn timestamps_are_write_once(targets in prop::collection::vec(arb_status(), 0..12)) {
            let mut ts = JobTimestamps::default();

            for (i, target) in targets.into_iter().enumerate() {
                let before = ts;
                let changed = ts.apply(target, t(i as i64 + 1)).unwrap_or(false);

                let pairs = [
                    (before.queue, ts.queue),
                    (before.start, ts.start),
                    (before.finish, ts.finish),
                    (before.fail, ts.fail),
                    (before.cancel, ts.cancel),
                ];
                for (b, a) in pairs {
                    if b.is_some() {
                        prop_assert_eq!(b, a);
                    }
                }

                let expected = set_count(&before) + usize::from(changed);
                prop_assert_eq!(set_count(&ts), expected);
            }
        }
    }
}
