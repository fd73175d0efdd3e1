//! Device-Backed Ring Buffer
//!
//! Provides the fixed-size pool of frame buffers that a capture device fills
//! in rotation. The device owns the memory; this crate only tracks opaque
//! handles and keeps allocation, sequence registration and release paired.

mod buffer;

pub use buffer::RingBufferPool;

use thiserror::Error;

/// Opaque reference to one block of device-owned frame memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: u32,
    len: usize,
}

impl BufferHandle {
    /// Wrap a device memory id together with its size in bytes
    pub fn new(id: u32, len: usize) -> Self {
        Self { id, len }
    }

    /// Device-assigned memory id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Size of the block in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the block holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Memory operations a device must offer for its capture sequence
pub trait SequenceMemory {
    /// Error reported by the device
    type Error: std::error::Error + 'static;

    /// Allocate one block of device memory of `len` bytes
    fn allocate_buffer(&mut self, len: usize) -> Result<BufferHandle, Self::Error>;

    /// Release a block previously returned by `allocate_buffer`
    fn free_buffer(&mut self, handle: BufferHandle) -> Result<(), Self::Error>;

    /// Append a block to the capture sequence
    fn add_to_sequence(&mut self, handle: &BufferHandle) -> Result<(), Self::Error>;

    /// Remove every block from the capture sequence
    fn clear_sequence(&mut self) -> Result<(), Self::Error>;
}

/// Ring buffer pool errors
#[derive(Debug, Error)]
pub enum PoolError<E: std::error::Error + 'static> {
    /// Requested pool has no slots or zero-sized frames
    #[error("invalid pool layout: {buffers} buffers of {frame_bytes} bytes")]
    InvalidLayout { buffers: usize, frame_bytes: usize },

    /// Device rejected a buffer; everything allocated so far was rolled back
    #[error("buffer allocation failed at slot {slot}: {source}")]
    Allocation {
        slot: usize,
        #[source]
        source: E,
    },

    /// Device rejected a sequence or free command
    #[error("capture sequence command failed: {0}")]
    Sequence(#[source] E),
}
