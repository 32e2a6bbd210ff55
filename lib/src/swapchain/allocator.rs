use crate::BufferProperties;

/// Source of the backing memory of the buffers of a `BufferQueue`.
///
/// The queue never looks into the handles it is given: they are moved to the
/// client or compositor along with the buffer they back, and dropped when the
/// queue evicts the buffer or is shut down.
pub trait BufferAllocator: Send + 'static {
    type Handle: Send + 'static;

    fn alloc_buffer(&mut self, properties: &BufferProperties) -> anyhow::Result<Self::Handle>;
}

/// Allocator returning plain heap memory. Useful for software rendering and
/// tests.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    num_allocated: usize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of buffers allocated so far.
    pub fn num_allocated(&self) -> usize {
        self.num_allocated
    }
}

impl BufferAllocator for HeapAllocator {
    type Handle = Vec<u8>;

    fn alloc_buffer(&mut self, properties: &BufferProperties) -> anyhow::Result<Vec<u8>> {
        let size = match properties.frame_size() {
            Some(0) | None => {
                anyhow::bail!("cannot allocate a buffer for {:?}", properties)
            }
            Some(size) => size,
        };

        self.num_allocated += 1;
        Ok(vec![0u8; size])
    }
}
