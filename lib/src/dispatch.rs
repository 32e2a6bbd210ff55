//! Descriptor-based event sources and the reactor that drives them.
//!
//! Any object exposing one pollable descriptor and a handler can implement
//! `Dispatchable` and be registered into a `Multiplexer`. The multiplexer waits
//! until at least one of its registered descriptors is ready, and calls the
//! handler of each ready source in turn, from the thread running the loop.
//!
//! `ActionQueue` is a `Dispatchable` that lets any thread schedule closures to
//! run on that thread, and `DispatchableFd` adapts a plain descriptor and a
//! callback.

macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { nix::libc::$f($($args, )*) } {
            err if err < 0 => Err(std::io::Error::last_os_error()),
            res => Ok(res)
        }
    }};
}

mod action_queue;
mod fd_source;
mod multiplexer;
mod waker;

pub use action_queue::*;
pub use fd_source::*;
pub use multiplexer::*;
pub use waker::*;

use bitflags::bitflags;
use nix::libc;
use std::os::fd::BorrowedFd;

bitflags! {
    /// Set of conditions a descriptor can be ready for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FdEvents: u32 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        /// The remote end of the descriptor has been closed.
        const REMOTE_CLOSED = 0b0100;
        /// The descriptor is in an error state. Always reported, whether it
        /// has been requested or not.
        const ERROR = 0b1000;
    }
}

impl FdEvents {
    /// Returns the epoll flags to request in order to be notified of these
    /// events.
    pub(crate) fn to_epoll(self) -> u32 {
        let mut flags = 0u32;

        if self.contains(FdEvents::READABLE) {
            flags |= libc::EPOLLIN as u32;
        }
        if self.contains(FdEvents::WRITABLE) {
            flags |= libc::EPOLLOUT as u32;
        }
        if self.contains(FdEvents::REMOTE_CLOSED) {
            flags |= libc::EPOLLRDHUP as u32;
        }
        // EPOLLERR and EPOLLHUP are always reported by epoll.

        flags
    }

    /// Converts the flags reported by epoll into our own events.
    pub(crate) fn from_epoll(flags: u32) -> Self {
        let mut events = FdEvents::empty();

        if flags & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
            events |= FdEvents::READABLE;
        }
        if flags & libc::EPOLLOUT as u32 != 0 {
            events |= FdEvents::WRITABLE;
        }
        if flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            events |= FdEvents::REMOTE_CLOSED;
        }
        if flags & libc::EPOLLERR as u32 != 0 {
            events |= FdEvents::ERROR;
        }

        events
    }
}

/// An event source that can be watched by a `Multiplexer`.
///
/// The multiplexer never owns the descriptor: it only keeps a reference to
/// the `Dispatchable` for as long as it is registered. The descriptor must
/// remain open until the source is deregistered.
pub trait Dispatchable: Send + Sync {
    /// Descriptor to watch.
    fn watch_fd(&self) -> BorrowedFd<'_>;

    /// Events this source wants to be notified of. `FdEvents::ERROR` is
    /// implied.
    fn relevant_events(&self) -> FdEvents;

    /// Handle the ready `events` of this source. Returning `false` removes the
    /// source from the multiplexer: it will not be dispatched again.
    ///
    /// If `events` contains `FdEvents::ERROR`, the source is removed after
    /// this call whatever it returns.
    fn dispatch(&self, events: FdEvents) -> bool;
}
