//! Thread-safe command buffer pool
//!
//! Keeps the raw command buffers of one queue kind available for reuse. The
//! list is behind a `parking_lot::Mutex`, which spins briefly before parking,
//! so threads that only allocate and free never serialize on recording.

use parking_lot::Mutex;

use crate::render::api::{QueueKind, RawCommandBuffer};
use crate::render::RenderResult;

#[derive(Debug, Default)]
struct PoolState {
    available: Vec<RawCommandBuffer>,
    allocated: usize,
}

/// Recyclable raw command buffers for one queue kind
#[derive(Debug)]
pub struct SharedCommandPool {
    queue: QueueKind,
    state: Mutex<PoolState>,
}

impl SharedCommandPool {
    /// Create an empty pool for `queue`
    pub fn new(queue: QueueKind) -> Self {
        Self {
            queue,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Queue kind served by this pool
    pub const fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Take a recycled buffer, or make a new one with `allocate`
    ///
    /// `allocate` runs without the lock held.
    pub fn acquire(
        &self,
        allocate: impl FnOnce(QueueKind) -> RenderResult<RawCommandBuffer>,
    ) -> RenderResult<RawCommandBuffer> {
        if let Some(buffer) = self.state.lock().available.pop() {
            return Ok(buffer);
        }
        let buffer = allocate(self.queue)?;
        self.state.lock().allocated += 1;
        Ok(buffer)
    }

    /// Hand a buffer back for reuse
    pub fn release(&self, buffer: RawCommandBuffer) {
        self.state.lock().available.push(buffer);
    }

    /// Buffers waiting for reuse
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Buffers ever allocated through this pool and not yet drained
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Remove every available buffer so the caller can free them
    pub fn drain(&self) -> Vec<RawCommandBuffer> {
        let mut state = self.state.lock();
        let drained = std::mem::take(&mut state.available);
        state.allocated = state.allocated.saturating_sub(drained.len());
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_released_buffers_are_reused() {
        let pool = SharedCommandPool::new(QueueKind::Graphics);
        let first = pool.acquire(|_| Ok(RawCommandBuffer(7))).unwrap();
        pool.release(first);

        let again = pool.acquire(|_| panic!("should reuse")).unwrap();
        assert_eq!(again, first);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_concurrent_acquire_and_release() {
        let pool = Arc::new(SharedCommandPool::new(QueueKind::Transfer));
        let next = Arc::new(AtomicU64::new(1));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let next = Arc::clone(&next);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buffer = pool
                            .acquire(|_| Ok(RawCommandBuffer(next.fetch_add(1, Ordering::Relaxed))))
                            .unwrap();
                        pool.release(buffer);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(pool.allocated() <= 4);
        assert_eq!(pool.available(), pool.allocated());
        let drained = pool.drain();
        assert_eq!(drained.len(), drained.iter().collect::<std::collections::HashSet<_>>().len());
        assert_eq!(pool.allocated(), 0);
    }
}
