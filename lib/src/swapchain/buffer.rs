//! Buffer objects handed out by a `BufferQueue`.
use super::{BufferAllocator, BufferId, BufferState, Shared};
use crate::BufferProperties;

use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

/// Which side of the queue a buffer has been handed to. The role limits the
/// operations that are possible on the buffer.
pub trait Role: Debug + Send + 'static {
    /// State the buffer's slot is in while the buffer object is alive.
    const OWNED_STATE: BufferState;
}

/// Buffers acquired by the client, which can write into them.
#[derive(Debug)]
pub struct Client;
impl Role for Client {
    const OWNED_STATE: BufferState = BufferState::ClientOwned;
}

/// Buffers acquired by the compositor, which can only read them.
#[derive(Debug)]
pub struct Compositor;
impl Role for Compositor {
    const OWNED_STATE: BufferState = BufferState::Compositing;
}

/// A buffer temporarily owned by one side of a `BufferQueue`, together with
/// its backing handle.
///
/// The buffer goes back to its queue when passed to `client_submit()` or
/// `compositor_release()`. If it is dropped instead, it returns to the free
/// buffers of the queue, or simply releases its handle if the queue is gone
/// or has been shut down.
pub struct SwapBuffer<R: Role, A: BufferAllocator> {
    id: BufferId,
    // Use of Option is necessary here because of Drop implementation, but the
    // Option will always be Some() until the buffer is handed back.
    handle: Option<A::Handle>,
    properties: BufferProperties,
    frame: u64,
    pub(super) queue: Weak<Shared<A>>,
    _r: PhantomData<R>,
}

pub type ClientBuffer<A> = SwapBuffer<Client, A>;
pub type CompositorBuffer<A> = SwapBuffer<Compositor, A>;

impl<R: Role, A: BufferAllocator> SwapBuffer<R, A> {
    pub(super) fn new(
        queue: &Arc<Shared<A>>,
        id: BufferId,
        handle: A::Handle,
        frame: u64,
    ) -> Self {
        SwapBuffer {
            id,
            handle: Some(handle),
            properties: queue.properties,
            frame,
            queue: Arc::downgrade(queue),
            _r: PhantomData,
        }
    }

    /// Identifier of this buffer, unique within its queue.
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.properties
    }

    pub fn handle(&self) -> &A::Handle {
        self.handle.as_ref().unwrap()
    }

    /// Take the backing handle out of this buffer, so it can be moved back
    /// into the queue. The buffer will not return to its queue when dropped.
    pub(super) fn take_handle(&mut self) -> A::Handle {
        self.handle.take().unwrap()
    }
}

impl<A: BufferAllocator> SwapBuffer<Client, A> {
    /// Backing handle of the buffer, for rendering.
    pub fn handle_mut(&mut self) -> &mut A::Handle {
        self.handle.as_mut().unwrap()
    }
}

impl<A: BufferAllocator> SwapBuffer<Compositor, A> {
    /// Sequence number of the frame contained in this buffer, in submission
    /// order. Frames dropped by the queue leave gaps in the sequence.
    pub fn frame_number(&self) -> u64 {
        self.frame
    }
}

impl<R: Role, A: BufferAllocator> Debug for SwapBuffer<R, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapBuffer")
            .field("role", &R::OWNED_STATE)
            .field("id", &self.id)
            .field("frame", &self.frame)
            .finish()
    }
}

impl<R: Role, A: BufferAllocator> Drop for SwapBuffer<R, A> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(queue) = self.queue.upgrade() {
                queue.return_buffer(self.id, R::OWNED_STATE, handle);
            }
        }
    }
}
