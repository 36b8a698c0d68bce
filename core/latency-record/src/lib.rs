//! Latency Record
//!
//! Append-only, in-memory store of per-request samples. Start times are
//! delta-encoded against the previous sample so a sample fits in a few
//! machine words; replay rebuilds absolute times with a running sum.

use serde::Serialize;
use std::iter::FusedIterator;
use thiserror::Error;

pub mod summary;

pub use summary::{LatencySummary, RunSummary};

/// Samples per chunk
pub const DEFAULT_CHUNK_CAPACITY: usize = 500_000;

/// How far (µs) a start may precede the previous start before it is rejected
pub const START_SLACK_US: i64 = 500_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("start {start_us}us precedes previous start {previous_us}us by more than {slack_us}us")]
    OutOfOrder {
        start_us: i64,
        previous_us: i64,
        slack_us: i64,
    },
    #[error("end {end_us}us is before start {start_us}us")]
    NegativeLatency { start_us: i64, end_us: i64 },
    #[error("offset from previous start {previous_us}us to {start_us}us does not fit in 32 bits")]
    OffsetOverflow { start_us: i64, previous_us: i64 },
    #[error("latency from {start_us}us to {end_us}us does not fit in 32 bits")]
    LatencyOverflow { start_us: i64, end_us: i64 },
}

/// Stored sample (start is an offset from the previous sample's start)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub kind: u32,
    pub start_offset_us: i32,
    pub latency_us: u32,
    pub worker_id: u32,
    pub phase_id: u32,
}

/// Replayed sample with an absolute start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordedSample {
    pub kind: u32,
    pub start_us: i64,
    pub latency_us: u32,
    pub worker_id: u32,
    pub phase_id: u32,
}

impl RecordedSample {
    pub fn end_us(&self) -> i64 {
        self.start_us + i64::from(self.latency_us)
    }
}

/// Chunked latency store. Single writer.
#[derive(Debug, Clone)]
pub struct LatencyRecorder {
    chunks: Vec<Vec<Sample>>,
    chunk_capacity: usize,
    start_us: i64,
    last_start_us: i64,
    len: usize,
}

impl LatencyRecorder {
    /// New recorder whose replay is seeded at `start_us`.
    pub fn new(start_us: i64) -> Self {
        Self::with_chunk_capacity(start_us, DEFAULT_CHUNK_CAPACITY)
    }

    pub fn with_chunk_capacity(start_us: i64, chunk_capacity: usize) -> Self {
        Self {
            chunks: Vec::new(),
            chunk_capacity: chunk_capacity.max(1),
            start_us,
            last_start_us: start_us,
            len: 0,
        }
    }

    /// Record one request that ran from `start_us` to `end_us`.
    ///
    /// Starts must arrive in chronological order, give or take
    /// [`START_SLACK_US`]. A rejected sample leaves the recorder unchanged.
    pub fn record(
        &mut self,
        kind: u32,
        start_us: i64,
        end_us: i64,
        worker_id: u32,
        phase_id: u32,
    ) -> Result<(), RecordError> {
        if start_us < self.last_start_us.saturating_sub(START_SLACK_US) {
            return Err(RecordError::OutOfOrder {
                start_us,
                previous_us: self.last_start_us,
                slack_us: START_SLACK_US,
            });
        }
        if end_us < start_us {
            return Err(RecordError::NegativeLatency { start_us, end_us });
        }

        let start_offset_us = start_us
            .checked_sub(self.last_start_us)
            .and_then(|offset| i32::try_from(offset).ok())
            .ok_or(RecordError::OffsetOverflow {
                start_us,
                previous_us: self.last_start_us,
            })?;
        let latency_us = end_us
            .checked_sub(start_us)
            .and_then(|latency| u32::try_from(latency).ok())
            .ok_or(RecordError::LatencyOverflow { start_us, end_us })?;

        let sample = Sample {
            kind,
            start_offset_us,
            latency_us,
            worker_id,
            phase_id,
        };
        self.active_chunk().push(sample);
        self.last_start_us = start_us;
        self.len += 1;
        Ok(())
    }

    /// Chunk with room for one more sample, allocating when the last is full.
    fn active_chunk(&mut self) -> &mut Vec<Sample> {
        let full = self
            .chunks
            .last()
            .map_or(true, |chunk| chunk.len() == self.chunk_capacity);
        if full {
            self.chunks.push(Vec::with_capacity(self.chunk_capacity));
        }
        let last = self.chunks.len() - 1;
        &mut self.chunks[last]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Time the replay is seeded with
    pub fn start_us(&self) -> i64 {
        self.start_us
    }

    /// Replay in insertion order with absolute start times.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            chunks: &self.chunks,
            chunk: 0,
            index: 0,
            last_start_us: self.start_us,
            remaining: self.len,
        }
    }

    /// Raw encoded samples, insertion order
    pub fn raw_samples(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.chunks.iter().flatten()
    }
}

impl<'a> IntoIterator for &'a LatencyRecorder {
    type Item = RecordedSample;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Replay iterator over a [`LatencyRecorder`]
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    chunks: &'a [Vec<Sample>],
    chunk: usize,
    index: usize,
    last_start_us: i64,
    remaining: usize,
}

impl Iterator for Iter<'_> {
    type Item = RecordedSample;

    fn next(&mut self) -> Option<RecordedSample> {
        let sample = loop {
            let chunk = self.chunks.get(self.chunk)?;
            if let Some(sample) = chunk.get(self.index) {
                self.index += 1;
                break *sample;
            }
            self.chunk += 1;
            self.index = 0;
        };

        self.last_start_us += i64::from(sample.start_offset_us);
        self.remaining -= 1;

        Some(RecordedSample {
            kind: sample.kind,
            start_us: self.last_start_us,
            latency_us: sample.latency_us,
            worker_id: sample.worker_id,
            phase_id: sample.phase_id,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl FusedIterator for Iter<'_> {}
