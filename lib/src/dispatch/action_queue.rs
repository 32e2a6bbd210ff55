use std::{
    collections::VecDeque,
    io,
    os::fd::{AsFd, BorrowedFd},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::anyhow;
use log::{trace, warn};

use super::{Dispatchable, FdEvents, Waker};
use crate::report::{self, Report};

type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A `Dispatchable` running closures pushed from any thread on the thread
/// dispatching it.
///
/// The queue's descriptor is readable exactly when actions are pending. Each
/// `dispatch` runs the actions that were queued when it started, in the order
/// they were pushed; actions pushed while dispatching run on the next
/// dispatch.
pub struct ActionQueue {
    actions: Mutex<VecDeque<Action>>,
    waker: Waker,
    report: Arc<dyn Report>,
}

impl ActionQueue {
    pub fn new() -> io::Result<Self> {
        Self::with_report(report::default_report())
    }

    /// Create a queue reporting failing actions to `report`.
    pub fn with_report(report: Arc<dyn Report>) -> io::Result<Self> {
        Ok(ActionQueue {
            actions: Mutex::new(VecDeque::new()),
            waker: Waker::new()?,
            report,
        })
    }

    fn lock_actions(&self) -> MutexGuard<'_, VecDeque<Action>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `action` to run on the dispatching thread. Never waits for the
    /// dispatching thread.
    pub fn enqueue<F>(&self, action: F) -> io::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut actions = self.lock_actions();
        actions.push_back(Box::new(action));
        // Wake while holding the lock, so the descriptor cannot be reset by a
        // concurrent dispatch between the push and the wake.
        if let Err(e) = self.waker.wake() {
            actions.pop_back();
            return Err(e);
        }

        Ok(())
    }

    /// Returns the number of actions waiting to be run.
    pub fn len(&self) -> usize {
        self.lock_actions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run(&self, action: Action) {
        let error = match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".into());
                anyhow!("action panicked: {}", message)
            }
        };

        self.report.action_failed(&error);
    }
}

impl Dispatchable for ActionQueue {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.waker.as_fd()
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE
    }

    fn dispatch(&self, events: FdEvents) -> bool {
        if events.contains(FdEvents::ERROR) {
            return false;
        }

        // Take a snapshot of the pending actions and make our descriptor idle
        // again. Pushes from now on will wake it up for the next dispatch.
        let actions = {
            let mut actions = self.lock_actions();
            if let Err(e) = self.waker.reset() {
                warn!("Failed to reset action queue waker: {}", e);
            }
            std::mem::take(&mut *actions)
        };

        trace!("Running {} queued actions", actions.len());
        for action in actions {
            self.run(action);
        }

        true
    }
}
