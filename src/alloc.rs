//! Buffer allocation with back-pressure.
//!
//! Data-owner tasks hold their payload bytes in `Buffer`s drawn from a
//! capacity-capped allocator. Under pressure, `allocate_safe` yields to the
//! scheduler instead of failing, so in-flight tasks can complete and return
//! memory.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Result type for allocation.
pub type Result<T> = std::result::Result<T, AllocError>;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("Out of buffer memory: requested {requested}, in use {in_use} of {capacity}")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        capacity: usize,
    },
}

/// An owned byte buffer; returns its bytes to the allocator on drop.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    used: Arc<AtomicUsize>,
}

impl Buffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.used.fetch_sub(self.data.len(), Ordering::AcqRel);
    }
}

/// Allocates task data buffers against an optional capacity cap.
pub struct BufferAllocator {
    capacity: Option<usize>,
    used: Arc<AtomicUsize>,
}

impl BufferAllocator {
    /// An allocator capped at `capacity` bytes in use.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// An uncapped allocator.
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bytes currently held by live buffers.
    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Allocate a zeroed buffer, failing if the cap would be exceeded.
    pub fn allocate(&self, size: usize) -> Result<Buffer> {
        if let Some(capacity) = self.capacity {
            // Optimistic reserve; undo on overshoot.
            let prior = self.used.fetch_add(size, Ordering::AcqRel);
            if prior + size > capacity {
                self.used.fetch_sub(size, Ordering::AcqRel);
                return Err(AllocError::OutOfMemory {
                    requested: size,
                    in_use: prior,
                    capacity,
                });
            }
        } else {
            self.used.fetch_add(size, Ordering::AcqRel);
        }
        Ok(Buffer {
            data: vec![0u8; size],
            used: Arc::clone(&self.used),
        })
    }

    /// Allocate, yielding to the scheduler while memory is exhausted.
    ///
    /// Callers inside the runtime use this so waiting for memory never
    /// wedges a worker; the tasks holding buffers keep draining meanwhile.
    pub async fn allocate_safe(&self, size: usize) -> Buffer {
        let mut warned = false;
        loop {
            match self.allocate(size) {
                Ok(buf) => return buf,
                Err(err) => {
                    if !warned {
                        warn!(error = %err, "Buffer allocation stalled; yielding");
                        warned = true;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn allocate_from(&self, bytes: &[u8]) -> Result<Buffer> {
        let mut buf = self.allocate(bytes.len())?;
        buf.copy_from_slice(bytes);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_enforced() {
        let alloc = BufferAllocator::with_capacity(16);
        let a = alloc.allocate(10).unwrap();
        assert_eq!(alloc.in_use(), 10);

        let err = alloc.allocate(10).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { requested: 10, .. }));

        drop(a);
        assert_eq!(alloc.in_use(), 0);
        alloc.allocate(16).unwrap();
    }

    #[test]
    fn test_allocate_from_copies() {
        let alloc = BufferAllocator::unbounded();
        let buf = alloc.allocate_from(b"abc").unwrap();
        assert_eq!(&*buf, b"abc");
        assert_eq!(alloc.in_use(), 3);
    }

    #[tokio::test]
    async fn test_allocate_safe_waits_for_release() {
        let alloc = Arc::new(BufferAllocator::with_capacity(8));
        let held = alloc.allocate(8).unwrap();

        let contender = Arc::clone(&alloc);
        let handle = tokio::spawn(async move { contender.allocate_safe(8).await.len() });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        drop(held);
        assert_eq!(handle.await.unwrap(), 8);
    }
}
