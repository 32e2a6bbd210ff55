//! Allocator backing buffers with anonymous shared memory files.
use std::{
    fs::File,
    io,
    os::{
        fd::{AsFd, BorrowedFd, FromRawFd},
        unix::fs::FileExt,
    },
};

use anyhow::{anyhow, Context};
use log::debug;
use nix::libc;
use swapr::{swapchain::BufferAllocator, BufferProperties};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmAccessError {
    #[error("frame of {len} bytes does not fit into buffer of {size} bytes")]
    FrameTooLarge { len: usize, size: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A shared memory buffer. The descriptor can be passed to another process.
#[derive(Debug)]
pub struct ShmBuffer {
    file: File,
    size: usize,
}

impl ShmBuffer {
    pub fn size(&self) -> usize {
        self.size
    }

    /// Write `frame` at the beginning of the buffer.
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), ShmAccessError> {
        if frame.len() > self.size {
            return Err(ShmAccessError::FrameTooLarge {
                len: frame.len(),
                size: self.size,
            });
        }

        Ok(self.file.write_all_at(frame, 0)?)
    }

    /// Read the beginning of the buffer into `frame`.
    pub fn read_frame(&self, frame: &mut [u8]) -> Result<(), ShmAccessError> {
        if frame.len() > self.size {
            return Err(ShmAccessError::FrameTooLarge {
                len: frame.len(),
                size: self.size,
            });
        }

        Ok(self.file.read_exact_at(frame, 0)?)
    }
}

impl AsFd for ShmBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Allocator returning memfd-backed buffers.
#[derive(Debug, Default)]
pub struct ShmAllocator {
    num_allocated: usize,
}

impl ShmAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn num_allocated(&self) -> usize {
        self.num_allocated
    }
}

impl BufferAllocator for ShmAllocator {
    type Handle = ShmBuffer;

    fn alloc_buffer(&mut self, properties: &BufferProperties) -> anyhow::Result<ShmBuffer> {
        let size = properties
            .frame_size()
            .filter(|size| *size > 0)
            .ok_or_else(|| anyhow!("cannot allocate a buffer for {:?}", properties))?;

        let name = b"swapr-shm\0";
        // Safe because `name` is a valid NUL-terminated string.
        let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("memfd_create failed");
        }
        // Safe because we just created this descriptor and nobody else owns it.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)
            .context("failed to size shared memory buffer")?;

        self.num_allocated += 1;
        debug!("Allocated {} bytes shared memory buffer", size);

        Ok(ShmBuffer { file, size })
    }
}
