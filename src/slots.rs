//! The slot ring: a fixed-size array of label-chunk buffers with per-slot
//! states, shared between the segmenter manager (producer) and the
//! extraction workers (consumers).
//!
//! Each slot cycles `Empty -> Filled -> Claimed -> Empty`. This is the sole
//! backpressure mechanism between the two stages: the producer blocks when
//! no slot is `Empty`, consumers block when none is `Filled`. Transitions
//! are compare-and-claim under one mutex with a condition variable; each
//! slot has exactly one producer and one logical consumer role at a time,
//! so no further locking is needed.

use std::sync::{Condvar, Mutex};

use crate::model::LabelChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Filled,
    Claimed,
}

struct RingInner {
    states: Vec<SlotState>,
    chunks: Vec<Option<LabelChunk>>,
    /// Set when the producer is done (or the run is tearing down); wakes
    /// all waiters so they can wind down.
    closed: bool,
}

pub struct SlotRing {
    inner: Mutex<RingInner>,
    cond: Condvar,
}

impl SlotRing {
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            inner: Mutex::new(RingInner {
                states: vec![SlotState::Empty; slot_count],
                chunks: (0..slot_count).map(|_| None).collect(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .len()
    }

    /// Producer side: wait for an `Empty` slot, move `chunk` in, mark it
    /// `Filled`. Returns `false` when the ring was closed while waiting
    /// (the producer should stop).
    pub fn publish(&self, chunk: LabelChunk) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if inner.closed {
                return false;
            }
            if let Some(slot) = inner.states.iter().position(|&s| s == SlotState::Empty) {
                inner.states[slot] = SlotState::Filled;
                inner.chunks[slot] = Some(chunk);
                self.cond.notify_all();
                return true;
            }
            inner = self.cond.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Consumer side: wait for a `Filled` slot, mark it `Claimed`, and take
    /// its chunk. Returns `None` once the ring is closed and no filled
    /// slots remain.
    pub fn claim(&self) -> Option<(usize, LabelChunk)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(slot) = inner.states.iter().position(|&s| s == SlotState::Filled) {
                inner.states[slot] = SlotState::Claimed;
                let chunk = inner.chunks[slot].take()?;
                return Some((slot, chunk));
            }
            if inner.closed {
                return None;
            }
            inner = self.cond.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Consumer side: hand a `Claimed` slot back to the producer.
    pub fn release(&self, slot: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert_eq!(inner.states[slot], SlotState::Claimed);
        inner.states[slot] = SlotState::Empty;
        self.cond.notify_all();
    }

    /// No more chunks will be published. Idempotent; also used by the
    /// supervisor to tear the pipeline down after a stage error.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn state_snapshot(&self) -> Vec<SlotState> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .clone()
    }
}
