//! A level-triggered reactor built on top of epoll.
//!
//! The `Multiplexer` keeps track of registered `Dispatchable` sources and
//! invokes their `dispatch` method when their descriptor becomes ready. All
//! dispatches happen sequentially on the thread calling `dispatch_once()`,
//! usually a `ReactorThread`.
//!
//! Each registration is identified by a token passed to epoll, so a source
//! deregistered while events for it are pending in the current wake is never
//! dispatched again, even if its descriptor number gets reused right away.

use std::{
    collections::BTreeMap,
    fs::File,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, trace, warn};
use nix::libc;
use thiserror::Error;

use super::{Dispatchable, FdEvents, Waker};
use crate::report::{self, Report};

/// Maximum number of ready descriptors processed per wake. Further ready
/// descriptors are reported by the next wait since we are level-triggered.
const MAX_EVENTS: usize = 32;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),
    #[error("error while adding descriptor to epoll: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DeregisterError {
    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),
}

struct Registration {
    fd: RawFd,
    source: Arc<dyn Dispatchable>,
}

#[derive(Default)]
struct Registrations {
    by_token: BTreeMap<u64, Registration>,
    by_fd: BTreeMap<RawFd, u64>,
    next_token: u64,
}

pub struct Multiplexer {
    epoll: File,
    registrations: Mutex<Registrations>,
    // Held for the duration of a wait and dispatch cycle.
    dispatching: Mutex<()>,
    report: Arc<dyn Report>,
    // If set, incremented every time we wake up from a wait.
    wakeups_counter: Mutex<Option<Arc<AtomicUsize>>>,
}

impl Multiplexer {
    pub fn new() -> io::Result<Self> {
        Self::with_report(report::default_report())
    }

    /// Create a multiplexer reporting I/O errors of its sources to `report`.
    pub fn with_report(report: Arc<dyn Report>) -> io::Result<Self> {
        let epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))
            // Safe because we just created this descriptor.
            .map(|fd| unsafe { File::from_raw_fd(fd) })?;

        Ok(Multiplexer {
            epoll,
            registrations: Mutex::new(Default::default()),
            dispatching: Mutex::new(()),
            report,
            wakeups_counter: Mutex::new(None),
        })
    }

    fn lock_registrations(&self) -> MutexGuard<'_, Registrations> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching `source`. Can be called from any thread, including from
    /// within a `dispatch` callback, in which case the source will be
    /// considered from the next wait on.
    pub fn register(&self, source: Arc<dyn Dispatchable>) -> Result<(), RegisterError> {
        let fd = source.watch_fd().as_raw_fd();
        let mut registrations = self.lock_registrations();

        if registrations.by_fd.contains_key(&fd) {
            return Err(RegisterError::AlreadyRegistered(fd));
        }

        let token = registrations.next_token;
        syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut libc::epoll_event {
                events: source.relevant_events().to_epoll(),
                u64: token,
            }
        ))?;

        registrations.next_token += 1;
        registrations.by_fd.insert(fd, token);
        registrations
            .by_token
            .insert(token, Registration { fd, source });
        debug!("Registered descriptor {} (token {})", fd, token);

        Ok(())
    }

    /// Stop watching the source registered for `fd` and return it. Safe to call
    /// from within a `dispatch` callback: the removed source will not be
    /// dispatched anymore, even if it is ready in the current wake.
    pub fn deregister(&self, fd: RawFd) -> Result<Arc<dyn Dispatchable>, DeregisterError> {
        let mut registrations = self.lock_registrations();
        let token = registrations
            .by_fd
            .get(&fd)
            .copied()
            .ok_or(DeregisterError::NotRegistered(fd))?;

        self.remove_registration(&mut registrations, token)
            .ok_or(DeregisterError::NotRegistered(fd))
    }

    fn remove_registration(
        &self,
        registrations: &mut Registrations,
        token: u64,
    ) -> Option<Arc<dyn Dispatchable>> {
        let registration = registrations.by_token.remove(&token)?;
        registrations.by_fd.remove(&registration.fd);

        if let Err(e) = syscall!(epoll_ctl(
            self.epoll.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            registration.fd,
            std::ptr::null_mut()
        )) {
            // The owner may have closed the descriptor already, in which case
            // epoll has forgotten about it on its own.
            if e.raw_os_error() != Some(libc::EBADF) && e.raw_os_error() != Some(libc::ENOENT) {
                warn!(
                    "Error while removing descriptor {} from epoll: {}",
                    registration.fd, e
                );
            }
        }
        self.report.source_deregistered(registration.fd);
        debug!(
            "Deregistered descriptor {} (token {})",
            registration.fd, token
        );

        Some(registration.source)
    }

    /// Returns the number of currently registered sources.
    pub fn num_sources(&self) -> usize {
        self.lock_registrations().by_token.len()
    }

    /// Returns whether a source is registered for `fd`.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.lock_registrations().by_fd.contains_key(&fd)
    }

    pub fn set_wakeup_counter(&self, counter: Arc<AtomicUsize>) {
        *self
            .wakeups_counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(counter);
    }

    /// Wait until at least one source is ready or `timeout` expires, then
    /// dispatch every ready source once. Returns the number of sources that
    /// have been dispatched or removed because of an error.
    ///
    /// Only one thread can run this method at a time: calling it while another
    /// call is in progress (including recursively from a `dispatch` callback)
    /// fails with `ErrorKind::WouldBlock`.
    pub fn dispatch_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let _dispatching = match self.dispatching.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "multiplexer is already being dispatched",
                ))
            }
        };

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let timeout: i32 = match timeout {
            None => -1,
            // Round up so short timeouts don't turn into busy loops.
            Some(d) => ((d.as_nanos() + 999_999) / 1_000_000).min(i32::MAX as u128) as i32,
        };

        let nb_events = match syscall!(epoll_wait(
            self.epoll.as_raw_fd(),
            events.as_mut_ptr(),
            events.len() as i32,
            timeout
        )) {
            Ok(nb_events) => nb_events as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        if let Some(counter) = &*self
            .wakeups_counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            counter.fetch_add(1, Ordering::SeqCst);
        }

        let mut dispatched = 0;
        for event in &events[0..nb_events] {
            // Copy the fields out, epoll_event may be packed.
            let (token, flags) = (event.u64, event.events);
            if self.dispatch_token(token, FdEvents::from_epoll(flags)) {
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// Dispatch `events` to the source registered with `token`, if it is still
    /// registered. Returns whether the source has been processed.
    fn dispatch_token(&self, token: u64, events: FdEvents) -> bool {
        // Do not keep the lock while dispatching so sources can register and
        // deregister from their handler.
        let (fd, source) = match self.lock_registrations().by_token.get(&token) {
            Some(registration) => (registration.fd, Arc::clone(&registration.source)),
            None => {
                trace!("Skipping events for removed token {}", token);
                return false;
            }
        };

        let keep = if events.contains(FdEvents::ERROR) {
            self.report.io_error(fd, events);
            // Only give the source a chance to look at the error if something
            // else it asked for happened at the same time.
            if events.intersects(source.relevant_events() - FdEvents::ERROR) {
                source.dispatch(events);
            }
            false
        } else {
            trace!("Dispatching {:?} to descriptor {}", events, fd);
            source.dispatch(events)
        };

        if !keep {
            let mut registrations = self.lock_registrations();
            // The handler may have removed the source itself already.
            self.remove_registration(&mut registrations, token);
        }

        true
    }
}

impl AsFd for Multiplexer {
    /// The epoll descriptor itself, which is readable whenever one of the
    /// registered sources is ready. This allows a multiplexer to be nested
    /// inside another loop.
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.epoll.as_fd()
    }
}

/// Internal source used to interrupt the loop of a `ReactorThread`.
struct StopSource {
    waker: Waker,
    stopping: AtomicBool,
}

impl Dispatchable for StopSource {
    fn watch_fd(&self) -> BorrowedFd<'_> {
        self.waker.as_fd()
    }

    fn relevant_events(&self) -> FdEvents {
        FdEvents::READABLE
    }

    fn dispatch(&self, _events: FdEvents) -> bool {
        if let Err(e) = self.waker.reset() {
            warn!("Failed to reset stop waker: {}", e);
        }
        true
    }
}

/// Dedicated thread running the loop of a `Multiplexer` until stopped.
pub struct ReactorThread {
    multiplexer: Arc<Multiplexer>,
    stop: Arc<StopSource>,
    handle: Option<JoinHandle<()>>,
}

impl ReactorThread {
    pub fn spawn(multiplexer: Arc<Multiplexer>) -> Result<Self, RegisterError> {
        let stop = Arc::new(StopSource {
            waker: Waker::new()?,
            stopping: AtomicBool::new(false),
        });
        multiplexer.register(Arc::clone(&stop) as Arc<dyn Dispatchable>)?;

        let thread_multiplexer = Arc::clone(&multiplexer);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("swapr-reactor".into())
            .spawn(move || {
                debug!("Reactor thread started");
                while !thread_stop.stopping.load(Ordering::Acquire) {
                    if let Err(e) = thread_multiplexer.dispatch_once(None) {
                        error!("Polling failure, exiting reactor thread: {}", e);
                        break;
                    }
                }
                debug!("Reactor thread exiting");
            })?;

        Ok(ReactorThread {
            multiplexer,
            stop,
            handle: Some(handle),
        })
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    /// Interrupt the loop and wait for the thread to finish. Sources that are
    /// still registered remain so.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };

        self.stop.stopping.store(true, Ordering::Release);
        if let Err(e) = self.stop.waker.wake() {
            error!("Failed to wake reactor thread up: {}", e);
        }
        if handle.join().is_err() {
            error!("Reactor thread panicked");
        }

        if let Err(e) = self
            .multiplexer
            .deregister(self.stop.waker.as_fd().as_raw_fd())
        {
            warn!("Failed to remove reactor stop source: {}", e);
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::RecordingReport;

    use std::{
        io::Write,
        os::{fd::OwnedFd, unix::net::UnixStream},
        sync::mpsc,
    };

    /// Source counting its dispatches and returning `keep` from them.
    struct CountingSource {
        stream: UnixStream,
        events: FdEvents,
        keep: AtomicBool,
        count: AtomicUsize,
        last_events: Mutex<Option<FdEvents>>,
    }

    impl CountingSource {
        fn new(stream: UnixStream, keep: bool) -> Arc<Self> {
            Arc::new(CountingSource {
                stream,
                events: FdEvents::READABLE,
                keep: AtomicBool::new(keep),
                count: AtomicUsize::new(0),
                last_events: Mutex::new(None),
            })
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Dispatchable for CountingSource {
        fn watch_fd(&self) -> BorrowedFd<'_> {
            self.stream.as_fd()
        }

        fn relevant_events(&self) -> FdEvents {
            self.events
        }

        fn dispatch(&self, events: FdEvents) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last_events.lock().unwrap() = Some(events);
            self.keep.load(Ordering::SeqCst)
        }
    }

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn test_dispatch_ready_source() {
        let multiplexer = Multiplexer::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let source = CountingSource::new(a, true);
        multiplexer.register(source.clone()).unwrap();
        assert_eq!(multiplexer.num_sources(), 1);

        // Nothing ready yet.
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 0);
        assert_eq!(source.count(), 0);

        b.write_all(b"x").unwrap();
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        assert_eq!(source.count(), 1);
        assert_eq!(
            *source.last_events.lock().unwrap(),
            Some(FdEvents::READABLE)
        );

        // Level-triggered: the data has not been read, so we are still ready.
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        assert_eq!(source.count(), 2);
    }

    #[test]
    fn test_register_twice() {
        let multiplexer = Multiplexer::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let source = CountingSource::new(a, true);
        let fd = source.watch_fd().as_raw_fd();

        multiplexer.register(source.clone()).unwrap();
        assert!(matches!(
            multiplexer.register(source.clone()),
            Err(RegisterError::AlreadyRegistered(f)) if f == fd
        ));

        multiplexer.deregister(fd).unwrap();
        assert!(!multiplexer.is_registered(fd));
        assert!(matches!(
            multiplexer.deregister(fd),
            Err(DeregisterError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_source_returning_false_is_removed() {
        let report = Arc::new(RecordingReport::default());
        let multiplexer = Multiplexer::with_report(report.clone()).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let source = CountingSource::new(a, false);
        let fd = source.watch_fd().as_raw_fd();
        multiplexer.register(source.clone()).unwrap();

        b.write_all(b"x").unwrap();
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        assert_eq!(source.count(), 1);
        assert!(!multiplexer.is_registered(fd));
        assert_eq!(*report.deregistered.lock().unwrap(), vec![fd]);

        // Still readable, but never dispatched again.
        b.write_all(b"y").unwrap();
        for _ in 0..3 {
            assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 0);
        }
        assert_eq!(source.count(), 1);
    }

    #[test]
    fn test_only_ready_sources_are_dispatched() {
        let multiplexer = Multiplexer::new().unwrap();
        let (a1, mut b1) = UnixStream::pair().unwrap();
        let (a2, _b2) = UnixStream::pair().unwrap();
        let (a3, mut b3) = UnixStream::pair().unwrap();
        let sources = [
            CountingSource::new(a1, true),
            CountingSource::new(a2, true),
            CountingSource::new(a3, true),
        ];
        for source in &sources {
            multiplexer.register(source.clone()).unwrap();
        }

        b1.write_all(b"x").unwrap();
        b3.write_all(b"x").unwrap();
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 2);
        assert_eq!(sources[0].count(), 1);
        assert_eq!(sources[1].count(), 0);
        assert_eq!(sources[2].count(), 1);
    }

    /// Source removing another source from its handler.
    struct Remover {
        stream: UnixStream,
        multiplexer: Arc<Multiplexer>,
        victim: RawFd,
    }

    impl Dispatchable for Remover {
        fn watch_fd(&self) -> BorrowedFd<'_> {
            self.stream.as_fd()
        }

        fn relevant_events(&self) -> FdEvents {
            FdEvents::READABLE
        }

        fn dispatch(&self, _events: FdEvents) -> bool {
            let _ = self.multiplexer.deregister(self.victim);
            true
        }
    }

    #[test]
    fn test_deregister_from_handler() {
        let multiplexer = Arc::new(Multiplexer::new().unwrap());
        let (a1, mut b1) = UnixStream::pair().unwrap();
        let (a2, mut b2) = UnixStream::pair().unwrap();
        let victim = CountingSource::new(a2, true);
        let victim_fd = victim.watch_fd().as_raw_fd();
        let remover = Arc::new(Remover {
            stream: a1,
            multiplexer: Arc::clone(&multiplexer),
            victim: victim_fd,
        });
        multiplexer.register(remover).unwrap();
        multiplexer.register(victim.clone()).unwrap();

        // Both are ready in the same wake. The victim may or may not have been
        // dispatched before the remover, but never after.
        b1.write_all(b"x").unwrap();
        b2.write_all(b"x").unwrap();
        multiplexer.dispatch_once(SHORT).unwrap();
        assert!(!multiplexer.is_registered(victim_fd));
        let count = victim.count();
        assert!(count <= 1);

        multiplexer.dispatch_once(SHORT).unwrap();
        assert_eq!(victim.count(), count);
    }

    /// Source registering another one from its handler.
    struct Registerer {
        stream: UnixStream,
        multiplexer: Arc<Multiplexer>,
        new_source: Mutex<Option<Arc<CountingSource>>>,
    }

    impl Dispatchable for Registerer {
        fn watch_fd(&self) -> BorrowedFd<'_> {
            self.stream.as_fd()
        }

        fn relevant_events(&self) -> FdEvents {
            FdEvents::READABLE
        }

        fn dispatch(&self, _events: FdEvents) -> bool {
            if let Some(source) = self.new_source.lock().unwrap().take() {
                self.multiplexer.register(source).unwrap();
            }
            false
        }
    }

    #[test]
    fn test_register_from_handler() {
        let multiplexer = Arc::new(Multiplexer::new().unwrap());
        let (a1, mut b1) = UnixStream::pair().unwrap();
        let (a2, mut b2) = UnixStream::pair().unwrap();
        let new_source = CountingSource::new(a2, true);
        b2.write_all(b"x").unwrap();

        multiplexer
            .register(Arc::new(Registerer {
                stream: a1,
                multiplexer: Arc::clone(&multiplexer),
                new_source: Mutex::new(Some(new_source.clone())),
            }))
            .unwrap();

        b1.write_all(b"x").unwrap();
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        assert_eq!(new_source.count(), 0);
        assert_eq!(multiplexer.num_sources(), 1);

        // The new source is picked up by the next wait.
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        assert_eq!(new_source.count(), 1);
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK)).unwrap();
        // Safe because we just created these descriptors.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    struct PipeWriter {
        fd: OwnedFd,
        events: FdEvents,
        count: AtomicUsize,
    }

    impl Dispatchable for PipeWriter {
        fn watch_fd(&self) -> BorrowedFd<'_> {
            self.fd.as_fd()
        }

        fn relevant_events(&self) -> FdEvents {
            self.events
        }

        fn dispatch(&self, _events: FdEvents) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_error_only_source_is_removed_without_dispatch() {
        let report = Arc::new(RecordingReport::default());
        let multiplexer = Multiplexer::with_report(report.clone()).unwrap();
        let (read_end, write_end) = pipe();
        // A write end is never readable, so only the error can be reported.
        let writer = Arc::new(PipeWriter {
            fd: write_end,
            events: FdEvents::READABLE,
            count: AtomicUsize::new(0),
        });
        let fd = writer.watch_fd().as_raw_fd();
        multiplexer.register(writer.clone()).unwrap();

        // A healthy source keeps being served.
        let (a, mut b) = UnixStream::pair().unwrap();
        let healthy = CountingSource::new(a, true);
        multiplexer.register(healthy.clone()).unwrap();
        b.write_all(b"x").unwrap();

        // Closing the read end puts the write end in error.
        drop(read_end);
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 2);
        assert_eq!(writer.count.load(Ordering::SeqCst), 0);
        assert!(!multiplexer.is_registered(fd));
        assert_eq!(*report.io_errors.lock().unwrap(), vec![fd]);
        assert_eq!(healthy.count(), 1);

        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        assert_eq!(healthy.count(), 2);
    }

    #[test]
    fn test_error_with_requested_event_is_dispatched_then_removed() {
        let report = Arc::new(RecordingReport::default());
        let multiplexer = Multiplexer::with_report(report.clone()).unwrap();
        let (read_end, write_end) = pipe();
        let writer = Arc::new(PipeWriter {
            fd: write_end,
            events: FdEvents::WRITABLE,
            count: AtomicUsize::new(0),
        });
        let fd = writer.watch_fd().as_raw_fd();
        multiplexer.register(writer.clone()).unwrap();

        drop(read_end);
        assert_eq!(multiplexer.dispatch_once(SHORT).unwrap(), 1);
        // The handler returned true, but the error still removes it.
        assert_eq!(writer.count.load(Ordering::SeqCst), 1);
        assert!(!multiplexer.is_registered(fd));
        assert_eq!(*report.io_errors.lock().unwrap(), vec![fd]);
    }

    #[test]
    fn test_wakeup_counter() {
        let multiplexer = Multiplexer::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        multiplexer.set_wakeup_counter(Arc::clone(&counter));

        multiplexer.dispatch_once(Some(Duration::ZERO)).unwrap();
        multiplexer.dispatch_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reactor_thread() {
        let multiplexer = Arc::new(Multiplexer::new().unwrap());
        let reactor = ReactorThread::spawn(Arc::clone(&multiplexer)).unwrap();

        let (tx, rx) = mpsc::channel();
        let (a, mut b) = UnixStream::pair().unwrap();
        let source = Arc::new(crate::dispatch::DispatchableFd::new(
            OwnedFd::from(a),
            move || {
                let _ = tx.send(());
            },
        ));
        multiplexer.register(source.clone()).unwrap();

        b.write_all(b"x").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        reactor.stop();
        // Only the stop source has been removed.
        assert_eq!(multiplexer.num_sources(), 1);
        assert!(multiplexer.is_registered(source.watch_fd().as_raw_fd()));
    }
}
