//! Fixed pool of pinned, page-sized log I/O buffers.
//!
//! Every physical log-page write stages through one of these buffers. The
//! pool is deliberately small (log writes are sequential and short-lived);
//! exhaustion blocks the borrower until another I/O returns its buffer —
//! backpressure, not failure.

use lfs_types::LOGPSIZE;
use std::sync::{Condvar, Mutex};

/// Fixed set of `LOGPSIZE` buffers with blocking acquire.
#[derive(Debug)]
pub struct LogBufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
    capacity: usize,
}

impl LogBufferPool {
    /// Pool with `count` buffers (at least one).
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count >= 1, "log buffer pool needs at least one buffer");
        Self {
            free: Mutex::new((0..count).map(|_| vec![0_u8; LOGPSIZE]).collect()),
            available: Condvar::new(),
            capacity: count,
        }
    }

    /// Borrow a buffer, blocking while none are free.
    #[must_use]
    pub fn acquire(&self) -> Vec<u8> {
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(buf) = free.pop() {
                return buf;
            }
            tracing::debug!(
                target: "lfs::log",
                capacity = self.capacity,
                "log_buffer_pool_wait"
            );
            free = self
                .available
                .wait(free)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Return a buffer after its I/O completes.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(LOGPSIZE, 0);
        let mut free = self
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        free.push(buf);
        drop(free);
        self.available.notify_one();
    }

    /// Buffers currently free (for tests).
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
