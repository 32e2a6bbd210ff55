//! Diagnostics collaborator that every subsystem reports its errors and
//! notable events to.
//!
//! Nothing in this crate swallows an error silently: failures that cannot be
//! returned to a caller (a queued action failing on the reactor thread, a
//! source being dropped after an I/O error, a frame being dropped) are passed
//! to a `Report`. The default method implementations do nothing, so a report
//! only needs to implement what it is interested in.

use std::{env, os::fd::RawFd, sync::Arc};

use log::{debug, error, warn};

use crate::{
    dispatch::FdEvents,
    swapchain::{BufferId, BufferQueueError},
};

/// Name of the environment variable used by `from_env()`.
pub const REPORT_ENV: &str = "SWAPR_REPORT";

/// Reports can be called with internal locks held, and must not call back
/// into the object reporting to them.
pub trait Report: Send + Sync {
    /// A registered descriptor reported an error condition and is going to be
    /// deregistered.
    fn io_error(&self, _fd: RawFd, _events: FdEvents) {}

    /// A source has been removed from the multiplexer after asking for it or
    /// because of an error.
    fn source_deregistered(&self, _fd: RawFd) {}

    /// A deferred action returned an error or panicked.
    fn action_failed(&self, _error: &anyhow::Error) {}

    /// A submitted frame has been replaced by a newer one before the
    /// compositor could pick it up.
    fn frame_dropped(&self, _buffer: BufferId, _frame: u64) {}

    /// A buffer ownership contract has been violated.
    fn invalid_state(&self, _error: &BufferQueueError) {}

    /// An input source failed to produce events.
    fn input_error(&self, _fd: RawFd, _error: &anyhow::Error) {}
}

/// Report that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReport;

impl Report for NullReport {}

/// Report forwarding everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReport;

impl Report for LogReport {
    fn io_error(&self, fd: RawFd, events: FdEvents) {
        warn!("I/O error on descriptor {} (events: {:?})", fd, events);
    }

    fn source_deregistered(&self, fd: RawFd) {
        debug!("Descriptor {} deregistered", fd);
    }

    fn action_failed(&self, error: &anyhow::Error) {
        error!("Deferred action failed: {:#}", error);
    }

    fn frame_dropped(&self, buffer: BufferId, frame: u64) {
        debug!("Frame {} in buffer {} dropped", frame, buffer);
    }

    fn invalid_state(&self, error: &BufferQueueError) {
        error!("Buffer queue misuse: {}", error);
    }

    fn input_error(&self, fd: RawFd, error: &anyhow::Error) {
        warn!("Input source on descriptor {} failed: {:#}", fd, error);
    }
}

/// Pick a report according to the `SWAPR_REPORT` environment variable:
/// `log` selects `LogReport`, anything else `NullReport`.
pub fn from_env() -> Arc<dyn Report> {
    select(env::var(REPORT_ENV).ok().as_deref())
}

fn select(target: Option<&str>) -> Arc<dyn Report> {
    match target {
        Some("log") => Arc::new(LogReport),
        _ => Arc::new(NullReport),
    }
}

/// Report used when the caller does not provide one.
pub(crate) fn default_report() -> Arc<dyn Report> {
    Arc::new(LogReport)
}
