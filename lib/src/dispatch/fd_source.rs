use std::{
    fmt,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::{Mutex, PoisonError},
};

use super::{Dispatchable, FdEvents};

type Callback = Box<dyn FnMut() + Send>;

/// Adapter turning a descriptor and a callback into a `Dispatchable`.
///
/// The callback is invoked every time the descriptor becomes readable. It is
/// responsible for consuming whatever made the descriptor readable, otherwise
/// it will be called again on the next wait. An error condition on the
/// descriptor removes it from the multiplexer, and so does a hangup once the
/// callback has had a chance to read what was left.
pub struct DispatchableFd {
    fd: OwnedFd,
    callback: Mutex<Callback>,
}

impl DispatchableFd {
    pub fn new<F>(fd: OwnedFd, callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        DispatchableFd {
            fd,
            callback: Mutex::new(Box::new(callback)),
        }
    }
}

impl fmt::Debug for DispatchableFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchableFd")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl Dispatchable for DispatchableFd {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        if events.contains(FdEvents::ERROR) {
            return false;
        }

        if events.contains(FdEvents::READABLE) {
            let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
            (*callback)();
        }

        // A closed descriptor stays readable forever.
        !events.contains(FdEvents::REMOTE_CLOSED)
    }
}
