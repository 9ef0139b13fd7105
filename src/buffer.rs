//! # Ring Buffer Module
//!
//! Fixed-capacity store of recent records shared by the ingestion path, the
//! recorder and any visualization.
//!
//! ## Index tracking
//! - `write_index`: number of appends ever made (reset only by `clear`)
//! - `base_index`: logical index of the oldest record still retained
//! - `write_index - base_index == len() <= capacity()`
//!
//! Readers that consume incrementally keep their own index and call
//! `get_since`. When that index has fallen behind `base_index` the buffer says
//! so (`data_lost`) and replays everything it still holds, which downstream
//! consumers treat as a re-sync signal.
//!
//! ## Locking
//! One mutex per buffer guards all state. Every operation holds it only for
//! the O(1) update or the copy of the requested slice.

use crate::record::Record;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Default capacity: ~40 s at 25 Hz
pub const DEFAULT_CAPACITY: usize = 1000;

/// Live statistics updated on every append
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferStats {
    pub fill_level: usize,
    /// Reciprocal of the last inter-arrival interval (not smoothed)
    pub sample_rate_hz: f64,
}

/// Result of `RingBuffer::get_since`
#[derive(Debug, Clone, PartialEq)]
pub struct SinceRead {
    pub records: Vec<Record>,
    /// Index to pass to the next `get_since` call
    pub next_index: u64,
    /// The caller's index had fallen behind the eviction horizon
    pub data_lost: bool,
}

struct RingState {
    records: VecDeque<Record>,
    write_index: u64,
    base_index: u64,
    stats: BufferStats,
    last_append: Option<Instant>,
}

pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` records (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(RingState {
                records: VecDeque::with_capacity(capacity),
                write_index: 0,
                base_index: 0,
                stats: BufferStats::default(),
                last_append: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        // A panicking holder cannot leave the indices half-updated, so the
        // state stays usable after poisoning.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record, evicting the oldest one when full
    pub fn append(&self, record: Record) {
        let now = Instant::now();
        let mut state = self.lock();

        if state.records.len() == self.capacity {
            state.records.pop_front();
            state.base_index += 1;
        }
        state.records.push_back(record);
        state.write_index += 1;

        state.stats.fill_level = state.records.len();
        if let Some(previous) = state.last_append {
            let interval = now.duration_since(previous).as_secs_f64();
            if interval > 0.0 {
                state.stats.sample_rate_hz = 1.0 / interval;
            }
        }
        state.last_append = Some(now);
    }

    /// Up to the last `count` records, oldest first
    pub fn get_recent(&self, count: usize) -> Vec<Record> {
        let state = self.lock();
        let skip = state.records.len().saturating_sub(count);
        state.records.iter().skip(skip).copied().collect()
    }

    /// Everything currently retained, oldest first
    pub fn get_all(&self) -> Vec<Record> {
        self.lock().records.iter().copied().collect()
    }

    /// Everything currently retained plus the index to continue from.
    ///
    /// Both come from one lock acquisition, so a reader starting here cannot
    /// observe an eviction between picking its start index and its first read.
    pub fn snapshot(&self) -> SinceRead {
        let state = self.lock();
        SinceRead {
            records: state.records.iter().copied().collect(),
            next_index: state.write_index,
            data_lost: false,
        }
    }

    /// Records appended since `last_index`.
    ///
    /// If `last_index` is older than the oldest retained record, the whole
    /// buffer is returned with `data_lost = true`.
    pub fn get_since(&self, last_index: u64) -> SinceRead {
        let state = self.lock();

        if last_index < state.base_index {
            return SinceRead {
                records: state.records.iter().copied().collect(),
                next_index: state.write_index,
                data_lost: true,
            };
        }

        let offset = (last_index - state.base_index) as usize;
        let records = if offset >= state.records.len() {
            Vec::new()
        } else {
            state.records.iter().skip(offset).copied().collect()
        };

        SinceRead {
            records,
            next_index: state.write_index,
            data_lost: false,
        }
    }

    /// Empty the buffer and reset both indices.
    ///
    /// Indices handed out before the call are meaningless afterwards.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.write_index = 0;
        state.base_index = 0;
        state.stats.fill_level = 0;
        state.last_append = None;
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total appends since creation or the last `clear`
    pub fn write_index(&self) -> u64 {
        self.lock().write_index
    }

    /// Logical index of the oldest retained record
    pub fn base_index(&self) -> u64 {
        self.lock().base_index
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
