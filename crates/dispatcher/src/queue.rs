//! Remaining task indices for one job

use batchdispatch_common::{Batch, JobRange, TaskIndex};
use rand::seq::SliceRandom;
use rand::Rng;

/// Stack of task indices that have not been dispatched yet
///
/// Built once in ascending order (optionally shuffled), then only ever popped
/// from the top. Once empty it stays empty.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    stack: Vec<TaskIndex>,
}

impl TaskQueue {
    /// Queue covering `range`; pops yield `end-1, end-2, ..., start`
    pub fn ordered(range: JobRange) -> Self {
        Self {
            stack: range.iter().collect(),
        }
    }

    /// Queue covering `range` permuted once with `rng`
    pub fn shuffled<R: Rng + ?Sized>(range: JobRange, rng: &mut R) -> Self {
        let mut queue = Self::ordered(range);
        queue.stack.shuffle(rng);
        queue
    }

    /// Pop up to `n` indices off the top of the stack
    pub fn pop_batch(&mut self, n: usize) -> Batch {
        let n = n.min(self.stack.len());
        let split = self.stack.len() - n;
        let mut batch = self.stack.split_off(split);
        batch.reverse();
        batch
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}
