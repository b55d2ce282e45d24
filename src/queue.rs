//! Per-device FIFO of decoded samples.
//!
//! Drivers produce samples at their native cadence (one network packet may carry
//! several records) and push them here; [`Device::sample`](crate::device::Device::sample)
//! drains exactly the number the caller asked for.

use crate::error::{AppResult, EegError};
use std::collections::VecDeque;

/// One multi-channel reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Driver-assigned sequence number. Advisory only, never used for ordering.
    pub seq: u32,
    /// Calibrated values, one per channel.
    pub values: Vec<f32>,
}

impl Sample {
    /// Create a sample.
    pub fn new(seq: u32, values: Vec<f32>) -> Self {
        Self { seq, values }
    }
}

/// FIFO buffer of [`Sample`]s.
#[derive(Debug, Default)]
pub struct SampleQueue {
    samples: VecDeque<Sample>,
}

impl SampleQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample at the tail.
    pub fn enqueue(&mut self, sample: Sample) {
        self.samples.push_back(sample);
    }

    /// Remove and return the first `n` samples in arrival order.
    ///
    /// Fails without removing anything if fewer than `n` are queued.
    pub fn drain(&mut self, n: usize) -> AppResult<Vec<Sample>> {
        if n > self.samples.len() {
            return Err(EegError::InsufficientSamples {
                requested: n,
                available: self.samples.len(),
            });
        }
        Ok(self.samples.drain(..n).collect())
    }

    /// Drop every queued sample, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.samples.len();
        self.samples.clear();
        discarded
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Extend<Sample> for SampleQueue {
    fn extend<I: IntoIterator<Item = Sample>>(&mut self, iter: I) {
        self.samples.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u32) -> Sample {
        Sample::new(seq, vec![seq as f32; 2])
    }

    #[test]
    fn drains_in_arrival_order() {
        let mut queue = SampleQueue::new();
        // Sequence numbers are advisory and must not reorder
        for seq in [5, 3, 9] {
            queue.enqueue(sample(seq));
        }

        let drained = queue.drain(2).unwrap();
        assert_eq!(drained.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![5, 3]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(1).unwrap()[0].seq, 9);
        assert!(queue.is_empty());
    }

    #[test]
    fn underflow_leaves_queue_untouched() {
        let mut queue = SampleQueue::new();
        queue.enqueue(sample(1));

        let err = queue.drain(2).unwrap_err();
        assert!(matches!(
            err,
            EegError::InsufficientSamples {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_zero_is_empty() {
        let mut queue = SampleQueue::new();
        assert!(queue.drain(0).unwrap().is_empty());
    }

    #[test]
    fn clear_reports_discarded() {
        let mut queue = SampleQueue::new();
        queue.extend((0..4).map(sample));
        assert_eq!(queue.clear(), 4);
        assert_eq!(queue.clear(), 0);
        assert!(queue.is_empty());
    }
}
