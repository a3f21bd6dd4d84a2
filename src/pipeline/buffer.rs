// Lock-free per-sensor sample buffer.
//
// Producers push decoded samples without taking a lock; the batcher drains
// them in FIFO order. When full, the configured overflow strategy decides
// whether the oldest or the newest sample is sacrificed, and every loss is
// counted.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use serde::Serialize;

use crate::types::{RawSample, SensorKind};

/// What to do when a push finds the buffer full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// Evict the oldest sample to make room. Keeps the stream current.
    DropOldest,
    /// Reject the incoming sample. Keeps history intact.
    DropNewest,
}

/// Point-in-time buffer counters.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub kind: SensorKind,
    pub capacity: usize,
    pub depth: usize,
    pub pushed: u64,
    pub dropped: u64,
}

pub struct SampleBuffer {
    kind: SensorKind,
    queue: ArrayQueue<RawSample>,
    strategy: OverflowStrategy,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl SampleBuffer {
    pub fn new(kind: SensorKind, capacity: usize, strategy: OverflowStrategy) -> Self {
        Self {
            kind,
            queue: ArrayQueue::new(capacity.max(1)),
            strategy,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Push one sample, applying the overflow strategy when full.
    pub fn push(&self, sample: RawSample) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        match self.queue.push(sample) {
            Ok(()) => {}
            Err(rejected) => match self.strategy {
                OverflowStrategy::DropOldest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    let _ = self.queue.pop();
                    // A concurrent drain may have already made room; a second
                    // rejection here only loses the one sample.
                    if self.queue.push(rejected).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                OverflowStrategy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }

    /// Remove up to `max` samples in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<RawSample> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop() {
                Some(sample) => out.push(sample),
                None => break,
            }
        }
        out
    }

    /// Remove everything currently buffered.
    pub fn drain_all(&self) -> Vec<RawSample> {
        self.drain(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            kind: self.kind,
            capacity: self.queue.capacity(),
            depth: self.queue.len(),
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
