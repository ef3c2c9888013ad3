//! Job progress value object.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Percentage of a job's work done, always within `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct ProgressPercent(u8);

impl ProgressPercent {
    pub const ZERO: ProgressPercent = ProgressPercent(0);
    pub const COMPLETE: ProgressPercent = ProgressPercent(100);

    /// Clamp any value into range.
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i32> for ProgressPercent {
    type Error = JobError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if (0..=100).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(JobError::validation(format!(
                "progress percent must be between 0 and 100; [{value}]"
            )))
        }
    }
}

impl From<ProgressPercent> for i32 {
    fn from(value: ProgressPercent) -> Self {
        i32::from(value.0)
    }
}
