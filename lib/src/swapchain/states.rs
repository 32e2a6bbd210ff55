use super::BufferId;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Ownership state of a buffer of a `BufferQueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// The buffer is held by the queue and can be acquired by the client.
    Free,
    /// The client is rendering into the buffer.
    ClientOwned,
    /// The client has finished rendering and the buffer waits for the
    /// compositor.
    Submitted,
    /// The compositor is displaying the buffer.
    Compositing,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BufferState::Free => "free",
            BufferState::ClientOwned => "client-owned",
            BufferState::Submitted => "submitted",
            BufferState::Compositing => "compositing",
        };
        f.write_str(s)
    }
}

/// State of a slot as tracked by the queue. The backing handle lives in the
/// slot only while the queue holds the buffer; otherwise it has been moved
/// into the buffer object returned to the client or compositor.
pub(super) enum SlotState<H> {
    Free(H),
    ClientOwned,
    Submitted { handle: H, frame: u64 },
    Compositing,
}

impl<H> SlotState<H> {
    pub(super) fn state(&self) -> BufferState {
        match self {
            SlotState::Free(_) => BufferState::Free,
            SlotState::ClientOwned => BufferState::ClientOwned,
            SlotState::Submitted { .. } => BufferState::Submitted,
            SlotState::Compositing => BufferState::Compositing,
        }
    }

    /// If the slot is free, switch it to `next` and return its handle.
    pub(super) fn take_free(&mut self, next: SlotState<H>) -> Option<H> {
        if !matches!(self, SlotState::Free(_)) {
            return None;
        }

        match std::mem::replace(self, next) {
            SlotState::Free(handle) => Some(handle),
            _ => None,
        }
    }

    /// If the slot is submitted, switch it to `next` and return its handle and
    /// frame number.
    pub(super) fn take_submitted(&mut self, next: SlotState<H>) -> Option<(H, u64)> {
        if !matches!(self, SlotState::Submitted { .. }) {
            return None;
        }

        match std::mem::replace(self, next) {
            SlotState::Submitted { handle, frame } => Some((handle, frame)),
            _ => None,
        }
    }
}

pub(super) struct Slot<H> {
    pub(super) id: BufferId,
    pub(super) state: SlotState<H>,
}

/// Number of buffers of a queue in each state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateCounts {
    pub free: usize,
    pub client_owned: usize,
    pub submitted: usize,
    pub compositing: usize,
}

impl StateCounts {
    pub(super) fn from_slots<'a, H: 'a, I: IntoIterator<Item = &'a Slot<H>>>(slots: I) -> Self {
        let mut counts = StateCounts::default();
        for slot in slots {
            match slot.state.state() {
                BufferState::Free => counts.free += 1,
                BufferState::ClientOwned => counts.client_owned += 1,
                BufferState::Submitted => counts.submitted += 1,
                BufferState::Compositing => counts.compositing += 1,
            }
        }

        counts
    }

    /// Total number of buffers.
    pub fn total(&self) -> usize {
        self.free + self.client_owned + self.submitted + self.compositing
    }

    /// Number of buffers the queue does not currently hold.
    pub fn busy(&self) -> usize {
        self.total() - self.free
    }
}

/// Frame counters of a queue. Can be read at any time without taking the
/// queue's lock.
#[derive(Debug, Default)]
pub struct BufferStats {
    submitted: AtomicU64,
    composited: AtomicU64,
    dropped: AtomicU64,
}

impl BufferStats {
    pub fn new() -> Self {
        Default::default()
    }

    /// Frames submitted by the client.
    pub fn num_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Frames picked up by the compositor.
    pub fn num_composited(&self) -> u64 {
        self.composited.load(Ordering::Relaxed)
    }

    /// Frames replaced by a newer one before the compositor could pick them
    /// up.
    pub fn num_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(super) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_composited(&self) {
        self.composited.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
