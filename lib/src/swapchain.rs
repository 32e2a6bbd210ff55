//! Bounded pool of buffers exchanged between a client and the compositor.
//!
//! A `BufferQueue` owns 2 or 3 buffers, each in one of four states: `Free`
//! (held by the queue), `ClientOwned` (being rendered into), `Submitted`
//! (waiting for the compositor) and `Compositing` (being displayed). The
//! client side acquires free buffers, renders into them and submits them; the
//! compositor side picks up the most recently submitted buffer and releases
//! it once it is done displaying it.
//!
//! At most one buffer is pending for the compositor: submitting a new frame
//! while an older one has not been picked up yet recycles the older one
//! immediately (framedropping), so the compositor always displays the newest
//! frame.
//!
//! Buffers are handed out as `ClientBuffer` and `CompositorBuffer` objects
//! that own the buffer's backing handle. Dropping one of them gives the buffer
//! back to the queue.
mod allocator;
mod buffer;
mod config;
mod states;

pub use allocator::*;
pub use buffer::*;
pub use config::*;
pub use states::{BufferState, BufferStats, StateCounts};

use states::{Slot, SlotState};

use crate::{
    report::{self, Report},
    BufferProperties,
};

use log::{debug, trace, warn};
use std::{
    fmt::{self, Debug},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use thiserror::Error;

/// Identifier of a buffer, unique within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u32);

impl BufferId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Violation of the buffer ownership rules of a queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidState {
    #[error("the client already owns a buffer")]
    ClientAlreadyOwnsBuffer,
    #[error("the compositor already owns a buffer")]
    CompositorAlreadyOwnsBuffer,
    #[error("buffer {0} does not belong to this queue")]
    ForeignBuffer(BufferId),
    #[error("buffer {buffer} is {found}, expected {expected}")]
    UnexpectedState {
        buffer: BufferId,
        found: BufferState,
        expected: BufferState,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferQueueError {
    #[error("invalid buffer state: {0}")]
    InvalidState(#[from] InvalidState),
    #[error("no buffer available")]
    Exhausted,
    #[error("buffer queue has been shut down")]
    Shutdown,
}

/// Error that can occur when submitting a buffer. It wraps a regular error and
/// also returns the buffer back to the caller.
#[derive(Error)]
#[error("{}", self.error)]
pub struct SubmitError<A: BufferAllocator> {
    pub error: BufferQueueError,
    pub buffer: ClientBuffer<A>,
}

impl<A: BufferAllocator> Debug for SubmitError<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.error, f)
    }
}

/// Error that can occur when releasing a buffer. It wraps a regular error and
/// also returns the buffer back to the caller.
#[derive(Error)]
#[error("{}", self.error)]
pub struct ReleaseError<A: BufferAllocator> {
    pub error: BufferQueueError,
    pub buffer: CompositorBuffer<A>,
}

impl<A: BufferAllocator> Debug for ReleaseError<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.error, f)
    }
}

#[derive(Debug, Error)]
pub enum CreateQueueError {
    #[error("failed to allocate buffer: {0:#}")]
    Allocation(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SetDepthError {
    #[error("buffer queue has been shut down")]
    Shutdown,
    #[error("failed to allocate buffer: {0:#}")]
    Allocation(anyhow::Error),
}

struct QueueState<A: BufferAllocator> {
    allocator: A,
    slots: Vec<Slot<A::Handle>>,
    depth: SwapDepth,
    next_id: u32,
    next_frame: u64,
    shut_down: bool,
}

impl<A: BufferAllocator> QueueState<A> {
    fn counts(&self) -> StateCounts {
        StateCounts::from_slots(&self.slots)
    }

    fn find(&self, id: BufferId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    fn any_in(&self, state: BufferState) -> bool {
        self.slots.iter().any(|slot| slot.state.state() == state)
    }

    /// Returns the index of buffer `id`, provided it is in `expected` state.
    fn find_in(&self, id: BufferId, expected: BufferState) -> Result<usize, InvalidState> {
        let index = self.find(id).ok_or(InvalidState::ForeignBuffer(id))?;
        let found = self.slots[index].state.state();
        if found != expected {
            return Err(InvalidState::UnexpectedState {
                buffer: id,
                found,
                expected,
            });
        }

        Ok(index)
    }

    fn alloc_slot(&mut self, properties: &BufferProperties) -> anyhow::Result<()> {
        let handle = self.allocator.alloc_buffer(properties)?;
        let id = BufferId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.slots.push(Slot {
            id,
            state: SlotState::Free(handle),
        });
        debug!("Allocated buffer {} ({})", id, properties.size);

        Ok(())
    }

    /// A new buffer can be handed to the client if one is free, and the client
    /// would not get more than one frame ahead of the compositor.
    fn can_client_acquire(&self) -> bool {
        let counts = self.counts();
        counts.free > 0 && counts.busy() < self.depth.num_buffers() - 1
    }

    fn take_free(&mut self) -> Option<(BufferId, A::Handle)> {
        self.slots.iter_mut().find_map(|slot| {
            slot.state
                .take_free(SlotState::ClientOwned)
                .map(|handle| (slot.id, handle))
        })
    }

    /// Returns the newest submitted buffer to the compositor.
    fn take_newest_submitted(&mut self) -> Option<(BufferId, A::Handle, u64)> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|slot| slot.state.state() == BufferState::Submitted)
            .max_by_key(|slot| match slot.state {
                SlotState::Submitted { frame, .. } => frame,
                _ => 0,
            })?;

        slot.state
            .take_submitted(SlotState::Compositing)
            .map(|(handle, frame)| (slot.id, handle, frame))
    }

    /// Recycle the frame still waiting for the compositor, if any.
    fn drop_pending_frame(&mut self) -> Option<(BufferId, u64)> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.state.state() == BufferState::Submitted)?;
        let id = self.slots[index].id;
        let (handle, frame) = self.slots[index]
            .state
            .take_submitted(SlotState::ClientOwned)?;
        self.recycle(index, handle);

        Some((id, frame))
    }

    /// Puts `handle` back into slot `index` as a free buffer. If the queue has
    /// more buffers than its depth, the slot is evicted instead.
    ///
    /// Invalidates the indices of the slots.
    fn recycle(&mut self, index: usize, handle: A::Handle) {
        if self.slots.len() > self.depth.num_buffers() {
            let slot = self.slots.remove(index);
            debug!("Evicted buffer {}", slot.id);
        } else {
            self.slots[index].state = SlotState::Free(handle);
        }
    }

    /// Evict free buffers until we have no more buffers than our depth.
    fn evict_free(&mut self) {
        while self.slots.len() > self.depth.num_buffers() {
            match self
                .slots
                .iter()
                .position(|slot| slot.state.state() == BufferState::Free)
            {
                Some(index) => {
                    let slot = self.slots.remove(index);
                    debug!("Evicted buffer {}", slot.id);
                }
                // The remaining buffers will be evicted when they come back.
                None => break,
            }
        }
    }
}

struct Shared<A: BufferAllocator> {
    state: Mutex<QueueState<A>>,
    /// Signaled every time a buffer returns to the queue, and on shutdown.
    buffer_freed: Condvar,
    properties: BufferProperties,
    stats: BufferStats,
    report: Arc<dyn Report>,
}

impl<A: BufferAllocator> Shared<A> {
    fn lock_state(&self) -> MutexGuard<'_, QueueState<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid(&self, error: InvalidState) -> BufferQueueError {
        let error = BufferQueueError::InvalidState(error);
        self.report.invalid_state(&error);
        error
    }

    /// Return a buffer whose buffer object has been dropped to the free pool.
    fn return_buffer(&self, id: BufferId, owned_state: BufferState, handle: A::Handle) {
        let mut state = self.lock_state();
        if state.shut_down {
            return;
        }

        match state.find_in(id, owned_state) {
            Ok(index) => {
                state.recycle(index, handle);
                drop(state);
                trace!("Buffer {} returned while {}", id, owned_state);
                self.buffer_freed.notify_all();
            }
            Err(e) => {
                drop(state);
                warn!("Cannot return buffer {} to its queue: {}", id, e);
                self.invalid(e);
            }
        }
    }
}

/// A pool of 2 or 3 buffers shared between one client and the compositor.
///
/// The client side (`client_acquire()`, `client_submit()`) may be called from
/// any thread and may block. The compositor side (`compositor_acquire()`,
/// `compositor_release()`) never blocks. Share the queue between threads by
/// wrapping it into an `Arc`.
///
/// Dropping the queue shuts it down.
pub struct BufferQueue<A: BufferAllocator> {
    shared: Arc<Shared<A>>,
}

impl<A: BufferAllocator> BufferQueue<A> {
    /// Create a new queue and allocate its buffers using `allocator`.
    pub fn new(config: QueueConfig, allocator: A) -> Result<Self, CreateQueueError> {
        let QueueConfig {
            properties,
            depth,
            report: custom_report,
        } = config;

        let mut state = QueueState {
            allocator,
            slots: Vec::with_capacity(depth.num_buffers()),
            depth,
            next_id: 0,
            next_frame: 0,
            shut_down: false,
        };
        for _ in 0..depth.num_buffers() {
            state
                .alloc_slot(&properties)
                .map_err(CreateQueueError::Allocation)?;
        }
        debug!(
            "Created buffer queue of {} buffers of {} {}",
            depth.num_buffers(),
            properties.size,
            properties.format
        );

        Ok(BufferQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                buffer_freed: Condvar::new(),
                properties,
                stats: BufferStats::new(),
                report: custom_report.unwrap_or_else(report::default_report),
            }),
        })
    }

    fn owns<R: Role>(&self, buffer: &SwapBuffer<R, A>) -> bool {
        std::ptr::eq(buffer.queue.as_ptr(), Arc::as_ptr(&self.shared))
    }

    /// Obtain a free buffer to render into.
    ///
    /// When the client is already as far ahead of the compositor as the
    /// queue's depth allows, waits until the compositor releases a buffer.
    /// With a `timeout`, gives up with `Exhausted` once it expires. Returns
    /// `Shutdown` as soon as the queue is shut down, including while waiting.
    ///
    /// Acquiring while the client still owns a buffer is an `InvalidState`
    /// error.
    pub fn client_acquire(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ClientBuffer<A>, BufferQueueError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock_state();

        loop {
            if state.shut_down {
                return Err(BufferQueueError::Shutdown);
            }
            if state.any_in(BufferState::ClientOwned) {
                return Err(self.shared.invalid(InvalidState::ClientAlreadyOwnsBuffer));
            }
            if state.can_client_acquire() {
                if let Some((id, handle)) = state.take_free() {
                    drop(state);
                    trace!("Buffer {} acquired by client", id);
                    return Ok(ClientBuffer::new(&self.shared, id, handle, 0));
                }
            }

            state = match deadline {
                None => self
                    .shared
                    .buffer_freed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BufferQueueError::Exhausted);
                    }
                    self.shared
                        .buffer_freed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Non-blocking version of `client_acquire()`. Returns `Exhausted` if no
    /// buffer can be handed out right now.
    pub fn try_client_acquire(&self) -> Result<ClientBuffer<A>, BufferQueueError> {
        self.client_acquire(Some(Duration::ZERO))
    }

    /// Submit a rendered buffer for composition. Never blocks.
    ///
    /// A previously submitted buffer that the compositor has not picked up
    /// yet is dropped and returns to the free pool.
    pub fn client_submit(&self, mut buffer: ClientBuffer<A>) -> Result<(), SubmitError<A>> {
        if !self.owns(&buffer) {
            let error = self.shared.invalid(InvalidState::ForeignBuffer(buffer.id()));
            return Err(SubmitError { error, buffer });
        }

        let id = buffer.id();
        let mut state = self.shared.lock_state();
        if state.shut_down {
            drop(state);
            return Err(SubmitError {
                error: BufferQueueError::Shutdown,
                buffer,
            });
        }
        if let Err(e) = state.find_in(id, BufferState::ClientOwned) {
            let error = self.shared.invalid(e);
            drop(state);
            return Err(SubmitError { error, buffer });
        }

        let dropped = state.drop_pending_frame();
        // Recycling may have removed a slot, so look our buffer up again.
        let index = match state.find_in(id, BufferState::ClientOwned) {
            Ok(index) => index,
            Err(e) => {
                let error = self.shared.invalid(e);
                drop(state);
                return Err(SubmitError { error, buffer });
            }
        };
        let frame = state.next_frame;
        state.next_frame += 1;
        state.slots[index].state = SlotState::Submitted {
            handle: buffer.take_handle(),
            frame,
        };
        drop(state);

        self.shared.stats.record_submitted();
        trace!("Buffer {} submitted with frame {}", id, frame);
        if let Some((dropped_id, dropped_frame)) = dropped {
            self.shared.stats.record_dropped();
            debug!(
                "Frame {} in buffer {} replaced by frame {}",
                dropped_frame, dropped_id, frame
            );
            self.shared.report.frame_dropped(dropped_id, dropped_frame);
            self.shared.buffer_freed.notify_all();
        }

        Ok(())
    }

    /// Obtain the most recently submitted buffer for composition. Never
    /// blocks.
    ///
    /// Returns `None` if nothing has been submitted since the last call, in
    /// which case the compositor should keep displaying its previous frame,
    /// which it may still be holding. If a new frame is available while the
    /// compositor still owns a buffer, this is an `InvalidState` error: use
    /// `compositor_swap()` to trade the held buffer for the new frame.
    pub fn compositor_acquire(&self) -> Result<Option<CompositorBuffer<A>>, BufferQueueError> {
        let mut state = self.shared.lock_state();
        if state.shut_down {
            return Err(BufferQueueError::Shutdown);
        }
        if !state.any_in(BufferState::Submitted) {
            return Ok(None);
        }
        if state.any_in(BufferState::Compositing) {
            return Err(self
                .shared
                .invalid(InvalidState::CompositorAlreadyOwnsBuffer));
        }

        let (id, handle, frame) = match state.take_newest_submitted() {
            Some(submitted) => submitted,
            None => return Ok(None),
        };
        drop(state);

        self.shared.stats.record_composited();
        trace!("Buffer {} acquired by compositor with frame {}", id, frame);

        Ok(Some(CompositorBuffer::new(&self.shared, id, handle, frame)))
    }

    /// Trade `held`, the buffer the compositor is currently displaying, for the
    /// most recently submitted one. Never blocks.
    ///
    /// If nothing new has been submitted, `held` is given back untouched and
    /// remains owned by the compositor. Otherwise `held` returns to the free
    /// pool in the same transition that hands out the new frame, so the
    /// compositor never owns more than one buffer.
    pub fn compositor_swap(
        &self,
        mut held: CompositorBuffer<A>,
    ) -> Result<CompositorBuffer<A>, ReleaseError<A>> {
        if !self.owns(&held) {
            let error = self.shared.invalid(InvalidState::ForeignBuffer(held.id()));
            return Err(ReleaseError { error, buffer: held });
        }

        let held_id = held.id();
        let mut state = self.shared.lock_state();
        if state.shut_down {
            drop(state);
            return Err(ReleaseError {
                error: BufferQueueError::Shutdown,
                buffer: held,
            });
        }
        let index = match state.find_in(held_id, BufferState::Compositing) {
            Ok(index) => index,
            Err(e) => {
                let error = self.shared.invalid(e);
                drop(state);
                return Err(ReleaseError { error, buffer: held });
            }
        };

        let (id, handle, frame) = match state.take_newest_submitted() {
            Some(submitted) => submitted,
            None => {
                drop(state);
                return Ok(held);
            }
        };
        // Taking the submitted buffer does not move slots around, so `index`
        // is still valid.
        state.recycle(index, held.take_handle());
        drop(state);

        self.shared.stats.record_composited();
        trace!(
            "Buffer {} swapped for buffer {} with frame {}",
            held_id,
            id,
            frame
        );
        self.shared.buffer_freed.notify_all();

        Ok(CompositorBuffer::new(&self.shared, id, handle, frame))
    }

    /// Give a buffer the compositor is done with back to the queue, unblocking
    /// a waiting `client_acquire()`. Never blocks.
    ///
    /// Releasing after the queue has been shut down just releases the
    /// buffer's handle.
    pub fn compositor_release(
        &self,
        mut buffer: CompositorBuffer<A>,
    ) -> Result<(), ReleaseError<A>> {
        if !self.owns(&buffer) {
            let error = self.shared.invalid(InvalidState::ForeignBuffer(buffer.id()));
            return Err(ReleaseError { error, buffer });
        }

        let id = buffer.id();
        let mut state = self.shared.lock_state();
        if state.shut_down {
            drop(state);
            drop(buffer.take_handle());
            return Ok(());
        }
        let index = match state.find_in(id, BufferState::Compositing) {
            Ok(index) => index,
            Err(e) => {
                let error = self.shared.invalid(e);
                drop(state);
                return Err(ReleaseError { error, buffer });
            }
        };
        state.recycle(index, buffer.take_handle());
        drop(state);

        trace!("Buffer {} released by compositor", id);
        self.shared.buffer_freed.notify_all();

        Ok(())
    }

    /// Change the number of buffers of the queue.
    ///
    /// New buffers are allocated immediately. When shrinking, free buffers are
    /// evicted immediately and the others once they return to the queue.
    pub fn set_depth(&self, depth: SwapDepth) -> Result<(), SetDepthError> {
        let mut state = self.shared.lock_state();
        if state.shut_down {
            return Err(SetDepthError::Shutdown);
        }

        let previous = state.depth;
        state.depth = depth;
        while state.slots.len() < depth.num_buffers() {
            if let Err(e) = state.alloc_slot(&self.shared.properties) {
                state.depth = previous;
                state.evict_free();
                return Err(SetDepthError::Allocation(e));
            }
        }
        state.evict_free();
        drop(state);

        debug!(
            "Queue depth changed from {} to {} buffers",
            previous.num_buffers(),
            depth.num_buffers()
        );
        // Shrinking may block the client, growing may unblock it.
        self.shared.buffer_freed.notify_all();

        Ok(())
    }

    /// Shut the queue down: waiting and future calls to `client_acquire()`
    /// return `Shutdown`, and the buffers currently held by the queue are
    /// released. Buffers owned by the client or compositor release their
    /// handle when dropped.
    pub fn shutdown(&self) {
        let slots = {
            let mut state = self.shared.lock_state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.slots)
        };
        self.shared.buffer_freed.notify_all();

        debug!("Buffer queue shut down, releasing {} buffers", slots.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_state().shut_down
    }

    pub fn depth(&self) -> SwapDepth {
        self.shared.lock_state().depth
    }

    /// Number of buffers currently managed by the queue. Can exceed the depth
    /// until buffers evicted by `set_depth()` come back.
    pub fn num_buffers(&self) -> usize {
        self.shared.lock_state().slots.len()
    }

    pub fn num_free_buffers(&self) -> usize {
        self.state_counts().free
    }

    pub fn state_counts(&self) -> StateCounts {
        self.shared.lock_state().counts()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.shared.stats
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.shared.properties
    }
}

impl<A: BufferAllocator> Drop for BufferQueue<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
