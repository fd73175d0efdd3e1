//! Ring Buffer Pool Implementation

use crate::{BufferHandle, PoolError, SequenceMemory};
use tracing::{debug, info, warn};

/// Fixed-size ring of device buffers registered with a capture sequence
#[derive(Debug, Default)]
pub struct RingBufferPool {
    /// Registered buffers in sequence order
    slots: Vec<BufferHandle>,
    /// Bytes reserved per frame
    frame_bytes: usize,
}

impl RingBufferPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` buffers of `frame_bytes` each and register them in order.
    ///
    /// Any existing buffers are released first. If the device rejects a
    /// buffer, the sequence is cleared and every buffer allocated so far is
    /// freed before the error is returned.
    pub fn allocate<M: SequenceMemory>(
        &mut self,
        memory: &mut M,
        count: usize,
        frame_bytes: usize,
    ) -> Result<usize, PoolError<M::Error>> {
        self.deallocate(memory)?;

        if count == 0 || frame_bytes == 0 {
            return Err(PoolError::InvalidLayout {
                buffers: count,
                frame_bytes,
            });
        }

        let mut slots = Vec::with_capacity(count);
        for slot in 0..count {
            let registered = memory.allocate_buffer(frame_bytes).and_then(|handle| {
                slots.push(handle);
                memory.add_to_sequence(&handle)
            });

            if let Err(source) = registered {
                warn!("Buffer {} of {} rejected by device, rolling back", slot, count);
                Self::release(memory, &mut slots);
                return Err(PoolError::Allocation { slot, source });
            }
        }

        info!("Allocated ring buffer: {} x {} bytes", count, frame_bytes);
        self.slots = slots;
        self.frame_bytes = frame_bytes;
        Ok(count)
    }

    /// Clear the capture sequence and free every buffer.
    ///
    /// Calling this on an empty pool does nothing. All buffers are freed even
    /// if one of the device commands fails; the first failure is returned.
    pub fn deallocate<M: SequenceMemory>(
        &mut self,
        memory: &mut M,
    ) -> Result<(), PoolError<M::Error>> {
        if self.slots.is_empty() {
            return Ok(());
        }

        debug!("Releasing {} ring buffers", self.slots.len());
        let first_error = Self::release(memory, &mut self.slots);
        self.frame_bytes = 0;

        match first_error {
            Some(err) => Err(PoolError::Sequence(err)),
            None => Ok(()),
        }
    }

    fn release<M: SequenceMemory>(
        memory: &mut M,
        slots: &mut Vec<BufferHandle>,
    ) -> Option<M::Error> {
        let mut first_error = memory.clear_sequence().err();

        for handle in slots.drain(..) {
            if let Err(err) = memory.free_buffer(handle) {
                warn!("Failed to free buffer {}: {}", handle.id(), err);
                first_error.get_or_insert(err);
            }
        }

        first_error
    }

    /// Buffer backing frame `index`, wrapping around the ring
    pub fn slot(&self, index: u64) -> Option<&BufferHandle> {
        if self.slots.is_empty() {
            return None;
        }
        let position = (index % self.slots.len() as u64) as usize;
        self.slots.get(position)
    }

    /// Number of buffers in the ring
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no buffers are allocated
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes reserved per frame (0 when empty)
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Iterate over buffers in sequence order
    pub fn iter(&self) -> impl Iterator<Item = &BufferHandle> {
        self.slots.iter()
    }
}

impl Drop for RingBufferPool {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            warn!(
                "Ring buffer pool dropped with {} buffers still registered",
                self.slots.len()
            );
        }
    }
}
