use serde::{Deserialize, Serialize};

use crate::domain::JobStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub accepted: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Accepted => self.accepted += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.accepted + self.processing + self.completed + self.failed + self.cancelled
    }
}
