use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsFd, BorrowedFd, FromRawFd},
};

use nix::libc;

/// Self-signalling descriptor that becomes readable when `wake()` is called,
/// and remains so until `reset()` is called.
///
/// Useful to interrupt a `Multiplexer` from another thread: register a
/// `Dispatchable` watching the waker, and call `wake()` from anywhere.
#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(Waker {
            // Safe because we just created this descriptor and nobody else
            // owns it.
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Make the waker readable. Can be called from any thread, never blocks.
    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        // Files support concurrent access at the OS level. The implementation
        // of Write for &File lets us call the write mutable method even on a
        // non-mutable File instance.
        (&self.fd).write(&buf).map(|_| ())
    }

    /// Perform a read on this waker in order to reset its counter to 0. This
    /// means the waker will not be reported as readable until `wake()` is
    /// called again.
    pub fn reset(&self) -> io::Result<()> {
        let mut buf = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf).map(|_| ()) {
            Ok(_) => Ok(()),
            // If the counter was already zero, it is already reset so this is
            // not an error.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::AsRawFd;

    fn is_readable(waker: &Waker) -> bool {
        let mut pollfd = libc::pollfd {
            fd: waker.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let res = syscall!(poll(&mut pollfd, 1, 0)).unwrap();
        res == 1 && pollfd.revents & libc::POLLIN != 0
    }

    #[test]
    fn test_waker() {
        let waker = Waker::new().unwrap();
        assert!(!is_readable(&waker));

        waker.wake().unwrap();
        assert!(is_readable(&waker));
        // Several wakes are coalesced.
        waker.wake().unwrap();
        assert!(is_readable(&waker));

        waker.reset().unwrap();
        assert!(!is_readable(&waker));
        // Resetting an idle waker is fine.
        waker.reset().unwrap();
        assert!(!is_readable(&waker));
    }
}
