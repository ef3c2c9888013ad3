//! Coalescing policy for job submission.

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::status::JobStatus;

/// Which existing jobs of the same type a submission may reuse.
///
/// Only the four nested sets below are meaningful; anything else is rejected
/// when converting from a list of statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalesceSet {
    /// Always create a new job.
    #[default]
    None,
    Queued,
    QueuedOrStarted,
    QueuedStartedOrFinished,
}

impl CoalesceSet {
    pub fn statuses(&self) -> &'static [JobStatus] {
        match self {
            CoalesceSet::None => &[],
            CoalesceSet::Queued => &[JobStatus::Queued],
            CoalesceSet::QueuedOrStarted => &[JobStatus::Queued, JobStatus::Started],
            CoalesceSet::QueuedStartedOrFinished => {
                &[JobStatus::Queued, JobStatus::Started, JobStatus::Finished]
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == CoalesceSet::None
    }

    pub fn contains(&self, status: JobStatus) -> bool {
        self.statuses().contains(&status)
    }
}

impl TryFrom<&[JobStatus]> for CoalesceSet {
    type Error = JobError;

    fn try_from(statuses: &[JobStatus]) -> Result<Self, Self::Error> {
        let has = |s: JobStatus| statuses.contains(&s);
        let unexpected = statuses.iter().find(|s| {
            !matches!(
                s,
                JobStatus::Queued | JobStatus::Started | JobStatus::Finished
            )
        });

        if let Some(status) = unexpected {
            return Err(JobError::validation(format!(
                "cannot coalesce onto {status} jobs"
            )));
        }

        match (has(JobStatus::Queued), has(JobStatus::Started), has(JobStatus::Finished)) {
            (false, false, false) => Ok(CoalesceSet::None),
            (true, false, false) => Ok(CoalesceSet::Queued),
            (true, true, false) => Ok(CoalesceSet::QueuedOrStarted),
            (true, true, true) => Ok(CoalesceSet::QueuedStartedOrFinished),
            _ => Err(JobError::validation(format!(
                "malformed coalesce set {statuses:?}"
            ))),
        }
    }
}
