//! Core identifiers shared across the dispatch system

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};

/// Index of one task in `[0, num_tasks)`
pub type TaskIndex = u32;

/// Process rank in `[0, size)`, stable for the job's lifetime
pub type WorkerId = u32;

/// Task indices handed to one worker; empty only as the terminal batch
pub type Batch = Vec<TaskIndex>;

/// Half-open sub-interval `[start, end)` of the task space that is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRange {
    start: TaskIndex,
    end: TaskIndex,
}

impl JobRange {
    /// Create a range, checking `0 <= start < end <= num_tasks`
    pub fn new(start: usize, end: usize, num_tasks: usize) -> Result<Self> {
        if num_tasks == 0 {
            return Err(DispatchError::config("Job has no tasks"));
        }
        if num_tasks > TaskIndex::MAX as usize {
            return Err(DispatchError::config(format!(
                "Job has {} tasks, more than the {} addressable",
                num_tasks,
                TaskIndex::MAX
            )));
        }
        if end > num_tasks {
            return Err(DispatchError::config(format!(
                "End index {} is beyond the {} tasks in this job",
                end, num_tasks
            )));
        }
        if start >= end {
            return Err(DispatchError::config(format!(
                "Start index {} must be below end index {}",
                start, end
            )));
        }

        Ok(Self {
            start: start as TaskIndex,
            end: end as TaskIndex,
        })
    }

    /// The whole task space `[0, num_tasks)`
    pub fn full(num_tasks: usize) -> Result<Self> {
        Self::new(0, num_tasks, num_tasks)
    }

    pub fn start(&self) -> TaskIndex {
        self.start
    }

    pub fn end(&self) -> TaskIndex {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Always false for a constructed range
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: TaskIndex) -> bool {
        index >= self.start && index < self.end
    }

    pub fn iter(&self) -> std::ops::Range<TaskIndex> {
        self.start..self.end
    }
}

impl std::fmt::Display for JobRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
