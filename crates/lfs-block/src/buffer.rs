//! Pinned metadata buffer pool.
//!
//! The transaction and allocator layers do not read device blocks directly;
//! they borrow fixed-size buffers from this pool:
//!
//! 1. [`MetaBufferPool::get`] pins the page and hands back an owned copy.
//! 2. The caller mutates its copy and publishes it with
//!    [`MetaBufferPool::mark_dirty`].
//! 3. [`MetaBufferPool::release`] unpins; dirty pages reach the device on
//!    [`MetaBufferPool::flush_all`] (checkpoint) or on eviction.
//!
//! The pool holds at most `capacity` resident pages. When every resident
//! page is pinned and a new address is requested, the caller blocks on a
//! condition variable until some other thread releases a page — buffer
//! exhaustion is a suspension point, not an error.

use crate::BlockDevice;
use lfs_error::{LfsError, Result};
use lfs_types::BlockAddr;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Configuration for the metadata buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPoolConfig {
    /// Maximum number of resident pages. Default: 64.
    pub capacity: usize,
}

impl Default for MetaPoolConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// A pinned metadata page: the address plus an owned copy of its bytes.
///
/// Holding a `MetaBuf` does not by itself keep the frame pinned — the pin
/// taken by [`MetaBufferPool::get`] lasts until [`MetaBufferPool::release`].
#[derive(Debug, Clone)]
pub struct MetaBuf {
    addr: BlockAddr,
    bytes: Vec<u8>,
}

impl MetaBuf {
    #[must_use]
    pub fn addr(&self) -> BlockAddr {
        self.addr
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[derive(Debug)]
struct Frame {
    bytes: Vec<u8>,
    pins: u32,
    dirty: bool,
}

#[derive(Debug)]
struct PoolState {
    frames: HashMap<BlockAddr, Frame>,
}

/// Fixed-capacity pool of pinned metadata buffers over a [`BlockDevice`].
pub struct MetaBufferPool {
    dev: Arc<dyn BlockDevice>,
    config: MetaPoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl std::fmt::Debug for MetaBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaBufferPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MetaBufferPool {
    #[must_use]
    pub fn new(dev: Arc<dyn BlockDevice>, config: MetaPoolConfig) -> Self {
        Self {
            dev,
            config,
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
            }),
            available: Condvar::new(),
        }
    }

    /// Pin `addr` and return a copy of its current contents.
    ///
    /// Blocks while the pool is full of pinned pages.
    pub fn get(&self, addr: BlockAddr) -> Result<MetaBuf> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(frame) = state.frames.get_mut(&addr) {
                frame.pins += 1;
                return Ok(MetaBuf {
                    addr,
                    bytes: frame.bytes.clone(),
                });
            }

            if state.frames.len() < self.config.capacity {
                break;
            }

            // Evict an unpinned frame, writing it back first if dirty.
            let victim = state
                .frames
                .iter()
                .find(|(_, frame)| frame.pins == 0)
                .map(|(addr, _)| *addr);
            match victim {
                Some(vaddr) => {
                    let frame = state
                        .frames
                        .remove(&vaddr)
                        .expect("victim frame is resident");
                    if frame.dirty {
                        self.dev.write_block(vaddr, &frame.bytes)?;
                    }
                    tracing::trace!(
                        target: "lfs::buffer",
                        evicted = vaddr.0,
                        wanted = addr.0,
                        "meta_pool_evict"
                    );
                    break;
                }
                None => {
                    tracing::debug!(
                        target: "lfs::buffer",
                        wanted = addr.0,
                        capacity = self.config.capacity,
                        "meta_pool_wait"
                    );
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            }
        }

        let buf = self.dev.read_block(addr)?;
        let bytes = buf.into_inner();
        state.frames.insert(
            addr,
            Frame {
                bytes: bytes.clone(),
                pins: 1,
                dirty: false,
            },
        );
        Ok(MetaBuf { addr, bytes })
    }

    /// Publish the caller's modified copy of a pinned page.
    pub fn mark_dirty(&self, buf: &MetaBuf) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let frame = state
            .frames
            .get_mut(&buf.addr)
            .ok_or_else(|| LfsError::Format(format!("mark_dirty on non-resident page {}", buf.addr.0)))?;
        if frame.pins == 0 {
            return Err(LfsError::Format(format!(
                "mark_dirty on unpinned page {}",
                buf.addr.0
            )));
        }
        frame.bytes.clone_from(&buf.bytes);
        frame.dirty = true;
        Ok(())
    }

    /// Unpin a page previously pinned with [`get`](Self::get).
    pub fn release(&self, addr: BlockAddr) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(frame) = state.frames.get_mut(&addr) {
            frame.pins = frame.pins.saturating_sub(1);
            if frame.pins == 0 {
                self.available.notify_all();
            }
        }
    }

    /// Drop a page without writing it back (transaction abort path).
    ///
    /// The next `get` re-reads the on-device contents.
    pub fn discard(&self, addr: BlockAddr) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.frames.remove(&addr).is_some() {
            tracing::debug!(target: "lfs::buffer", page = addr.0, "meta_pool_discard");
            self.available.notify_all();
        }
    }

    /// Write every dirty page to the device and sync it.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut flushed = 0_usize;
        for (addr, frame) in &mut state.frames {
            if frame.dirty {
                self.dev.write_block(*addr, &frame.bytes)?;
                frame.dirty = false;
                flushed += 1;
            }
        }
        drop(state);
        self.dev.sync()?;
        tracing::debug!(target: "lfs::buffer", flushed, "meta_pool_flush_all");
        Ok(())
    }

    /// Number of resident pages (for tests and introspection).
    #[must_use]
    pub fn resident(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .frames
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteBlockDevice, MemByteDevice};
    use std::sync::Barrier;
    use std::time::Duration;

    fn pool(capacity: usize, blocks: usize) -> (Arc<MetaBufferPool>, Arc<ByteBlockDevice<MemByteDevice>>) {
        let dev = Arc::new(
            ByteBlockDevice::new(MemByteDevice::new(blocks * 4096), 4096).expect("device"),
        );
        let pool = Arc::new(MetaBufferPool::new(
            Arc::clone(&dev) as Arc<dyn BlockDevice>,
            MetaPoolConfig { capacity },
        ));
        (pool, dev)
    }

    #[test]
    fn get_mark_dirty_flush_round_trip() {
        let (pool, dev) = pool(4, 8);

        let mut buf = pool.get(BlockAddr(3)).expect("get");
        buf.as_mut_slice()[0] = 0xEE;
        pool.mark_dirty(&buf).expect("dirty");
        pool.release(BlockAddr(3));

        // Device unchanged until flush.
        assert_eq!(dev.read_block(BlockAddr(3)).expect("read").as_slice()[0], 0);
        pool.flush_all().expect("flush");
        assert_eq!(
            dev.read_block(BlockAddr(3)).expect("read").as_slice()[0],
            0xEE
        );
    }

    #[test]
    fn mark_dirty_requires_pin() {
        let (pool, _dev) = pool(4, 8);
        let buf = pool.get(BlockAddr(1)).expect("get");
        pool.release(BlockAddr(1));
        assert!(pool.mark_dirty(&buf).is_err());
    }

    #[test]
    fn discard_drops_uncommitted_bytes() {
        let (pool, _dev) = pool(4, 8);
        let mut buf = pool.get(BlockAddr(2)).expect("get");
        buf.as_mut_slice()[7] = 0x99;
        pool.mark_dirty(&buf).expect("dirty");
        pool.discard(BlockAddr(2));

        let again = pool.get(BlockAddr(2)).expect("re-read");
        assert_eq!(again.as_slice()[7], 0);
        pool.release(BlockAddr(2));
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (pool, dev) = pool(1, 8);

        let mut buf = pool.get(BlockAddr(0)).expect("get");
        buf.as_mut_slice()[1] = 0x42;
        pool.mark_dirty(&buf).expect("dirty");
        pool.release(BlockAddr(0));

        // Capacity 1: getting another page evicts (and persists) page 0.
        let _other = pool.get(BlockAddr(5)).expect("get other");
        assert_eq!(
            dev.read_block(BlockAddr(0)).expect("read").as_slice()[1],
            0x42
        );
        pool.release(BlockAddr(5));
    }

    #[test]
    fn exhausted_pool_blocks_until_release() {
        let (pool, _dev) = pool(1, 8);
        let barrier = Arc::new(Barrier::new(2));

        let _held = pool.get(BlockAddr(0)).expect("pin only frame");

        let pool2 = Arc::clone(&pool);
        let barrier2 = Arc::clone(&barrier);
        let waiter = std::thread::spawn(move || {
            barrier2.wait();
            // Blocks until the main thread releases page 0.
            let buf = pool2.get(BlockAddr(1)).expect("get after release");
            pool2.release(buf.addr());
        });

        barrier.wait();
        // Give the waiter time to actually block.
        std::thread::sleep(Duration::from_millis(50));
        pool.release(BlockAddr(0));
        waiter.join().expect("no panic");
    }
}
