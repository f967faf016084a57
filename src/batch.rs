use std::collections::VecDeque;

use serde::Serialize;

use crate::transform::Fragment;

pub const DEFAULT_BATCH_CAPACITY: usize = 10_000;

/// An ordered run of fragments handed to the sink as one unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    fragments: Vec<Fragment>,
}

impl Batch {
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn into_fragments(self) -> Vec<Fragment> {
        self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

impl From<Vec<Fragment>> for Batch {
    fn from(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }
}

/// FIFO queue of fragments with a capacity-driven flush policy.
#[derive(Debug)]
pub struct BatchAccumulator {
    queue: VecDeque<Fragment>,
    capacity: usize,
}

impl BatchAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.saturating_add(1)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, fragments: impl IntoIterator<Item = Fragment>) {
        self.queue.extend(fragments);
    }

    /// True once the queue holds strictly more than `capacity` fragments.
    pub fn ready(&self) -> bool {
        self.queue.len() > self.capacity
    }

    /// Size of a non-final flush: one less than capacity, so each steady-state
    /// flush leaves a residue in the queue.
    pub fn steady_flush_size(&self) -> usize {
        self.capacity.saturating_sub(1)
    }

    /// Remove up to `batch_size` fragments from the head of the queue.
    pub fn flush(&mut self, batch_size: usize) -> Batch {
        let n = batch_size.min(self.queue.len());
        Batch::from(self.queue.drain(..n).collect::<Vec<_>>())
    }

    /// Drain everything, including the empty case.
    pub fn flush_all(&mut self) -> Batch {
        Batch::from(self.queue.drain(..).collect::<Vec<_>>())
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_CAPACITY)
    }
}
