#![forbid(unsafe_code)]
//! Circular write-ahead log with group commit.
//!
//! The log is a ring of `LOGPSIZE` pages on a byte device: slot 0 holds the
//! superblock, slot 1 is reserved, and data pages wrap over the remaining
//! slots. Page sequence numbers are monotonic for the life of the instance;
//! the on-device slot is `seq % data_slots`, so a stale page from a previous
//! lap is recognizable by its sequence number (and a torn write by its
//! header/trailer mismatch).
//!
//! # Group commit
//!
//! [`LogManager::append`] packs records into the current open page without
//! any I/O (unless the page fills and is sealed). Durability happens in
//! [`LogManager::force`]: the first transaction to need it becomes the
//! *leader* — it snapshots the open page under the lock, writes that one
//! page image, syncs, and advances the durable watermark past every record
//! the snapshot contained. Transactions that appended onto the same page
//! merely wait on the condition variable and observe the watermark — one
//! physical write commits them all. A still-open page may be rewritten in
//! place by several successive forces as it fills; only a full page is
//! sealed and never touched again.
//!
//! # Failure policy
//!
//! A failed page write or sync permanently taints the instance: the failed
//! reason is latched, every co-resident and subsequent commit observes
//! [`LfsError::LogFailed`], and no retry is attempted.

pub mod pool;

pub use pool::LogBufferPool;

use lfs_block::ByteDevice;
use lfs_error::{LfsError, Result};
use lfs_ondisk::{LogPage, LogRecord, LogSuperblock};
use lfs_types::{
    LOG_DATA_SLOT, LOGPDATASIZE, LOGPHDRSIZE, LOGPSIZE, Lsn, TxId,
};
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex};

/// Number of staging buffers in the log I/O pool.
const LOG_POOL_BUFFERS: usize = 4;

/// Unflushed-volume fraction of the log that raises the sync barrier.
const SYNC_BARRIER_DIVISOR: u64 = 4;

/// Observable log counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    /// Records appended.
    pub appends: u64,
    /// Full pages sealed and pushed out.
    pub page_seals: u64,
    /// Durability requests served (leader or follower).
    pub forces: u64,
    /// Physical page writes issued by group-commit leaders.
    pub group_commit_writes: u64,
    /// Sync points written.
    pub syncpts: u64,
    /// Current durable watermark.
    pub durable_lsn: Lsn,
    /// Record bytes appended since the last sync point.
    pub bytes_since_syncpt: u64,
}

#[derive(Debug)]
struct LogState {
    sb: LogSuperblock,
    page: LogPage,
    durable_lsn: Lsn,
    flushing: bool,
    failed: Option<String>,
    bytes_since_syncpt: u64,
    stats: LogStats,
}

/// The write-ahead log manager.
pub struct LogManager {
    dev: Arc<dyn ByteDevice>,
    pool: LogBufferPool,
    state: Mutex<LogState>,
    flush_done: Condvar,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager").finish_non_exhaustive()
    }
}

impl LogManager {
    /// Initialize a fresh log across the whole device.
    ///
    /// The device length fixes the log size; it must be page-aligned and at
    /// least four pages (superblock, reserved, and two data slots).
    pub fn format(dev: &dyn ByteDevice, bsize: u32) -> Result<()> {
        let len = dev.len_bytes();
        if len % LOGPSIZE as u64 != 0 {
            return Err(LfsError::InvalidGeometry(format!(
                "log device length {len} is not page-aligned"
            )));
        }
        let size_pages = len / LOGPSIZE as u64;
        if size_pages < 4 {
            return Err(LfsError::InvalidGeometry(format!(
                "log needs at least 4 pages, device holds {size_pages}"
            )));
        }
        let sb = LogSuperblock::new(
            u32::try_from(size_pages)
                .map_err(|_| LfsError::InvalidGeometry("log size exceeds u32 pages".into()))?,
            bsize,
        );
        dev.write_all_at(0, &sb.encode())?;
        dev.sync()?;
        tracing::info!(target: "lfs::log", size_pages, bsize, "log_format");
        Ok(())
    }

    /// Open an existing log: validate the superblock, bump its serial, and
    /// resume appending on the page after the recorded sync point.
    pub fn open(dev: Arc<dyn ByteDevice>) -> Result<Self> {
        let mut raw = vec![0_u8; LOGPSIZE];
        dev.read_exact_at(0, &mut raw)?;
        let mut sb = LogSuperblock::decode(&raw).map_err(|e| LfsError::Format(e.to_string()))?;
        if u64::from(sb.size_pages) != dev.len_bytes() / LOGPSIZE as u64 {
            return Err(LfsError::InvalidGeometry(format!(
                "superblock says {} pages, device holds {}",
                sb.size_pages,
                dev.len_bytes() / LOGPSIZE as u64
            )));
        }
        sb.serial = sb.serial.wrapping_add(1);
        dev.write_all_at(0, &sb.encode())?;
        dev.sync()?;

        let start_seq = sb.syncpt.page_seq() + 1;
        let start_seq32 = u32::try_from(start_seq)
            .map_err(|_| LfsError::Format("log page sequence overflow".into()))?;
        let page = LogPage::new(start_seq32);
        let durable_lsn = Lsn::compose(start_seq, LOGPHDRSIZE);

        tracing::info!(
            target: "lfs::log",
            serial = sb.serial,
            size_pages = sb.size_pages,
            start_seq,
            "log_open"
        );

        Ok(Self {
            dev,
            pool: LogBufferPool::new(LOG_POOL_BUFFERS),
            state: Mutex::new(LogState {
                sb,
                page,
                durable_lsn,
                flushing: false,
                failed: None,
                bytes_since_syncpt: 0,
                stats: LogStats::default(),
            }),
            flush_done: Condvar::new(),
        })
    }

    fn data_slots(sb: &LogSuperblock) -> u64 {
        u64::from(sb.size_pages) - LOG_DATA_SLOT
    }

    fn slot_offset(sb: &LogSuperblock, page_seq: u64) -> u64 {
        debug_assert!(page_seq >= 1);
        let slot = LOG_DATA_SLOT + (page_seq - 1) % Self::data_slots(sb);
        slot * LOGPSIZE as u64
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn failed_err(state: &LogState) -> LfsError {
        LfsError::LogFailed {
            lsn: state.durable_lsn.0,
            detail: state
                .failed
                .clone()
                .unwrap_or_else(|| "log failed".to_owned()),
        }
    }

    /// Append one record for `tid`, returning its LSN.
    ///
    /// No durability is implied; pair with [`force`](Self::force). Sealing a
    /// full page pushes it to the device (unsynced) in the caller's context.
    pub fn append(&self, tid: TxId, record: &LogRecord) -> Result<Lsn> {
        let bytes = record
            .encode(tid)
            .map_err(|e| LfsError::Parse(e.to_string()))?;

        let mut state = self.lock_state();
        loop {
            if state.failed.is_some() {
                return Err(Self::failed_err(&state));
            }
            if bytes.len() <= state.page.remaining() {
                break;
            }
            if state.flushing {
                // The open page is being written by a group-commit leader;
                // it cannot be sealed out from under that write.
                state = self
                    .flush_done
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }
            self.seal_locked(&mut state)?;
        }

        let lsn = state.page.push(&bytes);
        state.bytes_since_syncpt += bytes.len() as u64;
        state.stats.appends += 1;
        state.stats.bytes_since_syncpt = state.bytes_since_syncpt;

        tracing::trace!(
            target: "lfs::log",
            tid = tid.0,
            lsn = lsn.0,
            len = bytes.len(),
            page_seq = state.page.page_seq,
            "log_append"
        );
        Ok(lsn)
    }

    /// Seal the current page: write its final image and open the successor.
    fn seal_locked(&self, state: &mut LogState) -> Result<()> {
        let image = state.page.encode();
        let seq = u64::from(state.page.page_seq);
        let offset = Self::slot_offset(&state.sb, seq);

        let mut buf = self.pool.acquire();
        buf.copy_from_slice(&image);
        let res = self.dev.write_all_at(offset, &buf);
        self.pool.release(buf);

        if let Err(e) = res {
            let msg = format!("sealing page {seq}: {e}");
            tracing::error!(target: "lfs::log", page_seq = seq, error = %e, "log_seal_failed");
            state.failed = Some(msg);
            return Err(Self::failed_err(state));
        }

        state.stats.page_seals += 1;
        tracing::debug!(
            target: "lfs::log",
            page_seq = seq,
            eor = state.page.eor,
            "log_page_sealed"
        );

        let next = u32::try_from(seq + 1)
            .map_err(|_| LfsError::Format("log page sequence overflow".into()))?;
        state.page = LogPage::new(next);
        Ok(())
    }

    /// Block until everything through `lsn` is durable.
    ///
    /// The first caller to find work becomes the group-commit leader and
    /// performs the single page write + sync on behalf of every transaction
    /// whose records the snapshot contains.
    pub fn force(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.lock_state();
        state.stats.forces += 1;
        loop {
            if state.durable_lsn > lsn {
                return Ok(());
            }
            if state.failed.is_some() {
                return Err(Self::failed_err(&state));
            }
            if state.flushing {
                // Follower: wait for the in-flight leader, then re-check.
                state = self
                    .flush_done
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }

            // Leader: snapshot the open page and flush it.
            state.flushing = true;
            let seq = u64::from(state.page.page_seq);
            let eor = usize::from(state.page.eor);
            let target = Lsn::compose(seq, eor);
            let page_empty = eor == LOGPHDRSIZE;
            let image = state.page.encode();
            let offset = Self::slot_offset(&state.sb, seq);
            drop(state);

            let res = if page_empty {
                // Everything pending is on sealed (already written) pages;
                // only the sync is needed.
                self.dev.sync()
            } else {
                let mut buf = self.pool.acquire();
                buf.copy_from_slice(&image);
                let res = self.dev.write_all_at(offset, &buf).and_then(|()| self.dev.sync());
                self.pool.release(buf);
                res
            };

            state = self.lock_state();
            state.flushing = false;
            match res {
                Ok(()) => {
                    if target > state.durable_lsn {
                        state.durable_lsn = target;
                        state.stats.durable_lsn = target;
                    }
                    if !page_empty {
                        state.stats.group_commit_writes += 1;
                    }
                    tracing::debug!(
                        target: "lfs::log",
                        durable_lsn = state.durable_lsn.0,
                        page_seq = seq,
                        "group_commit_flush"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        target: "lfs::log",
                        page_seq = seq,
                        error = %e,
                        "group_commit_flush_failed"
                    );
                    state.failed = Some(format!("flushing page {seq}: {e}"));
                }
            }
            self.flush_done.notify_all();
        }
    }

    /// LSN one past the last appended byte.
    #[must_use]
    pub fn current_end(&self) -> Lsn {
        let state = self.lock_state();
        Lsn::compose(u64::from(state.page.page_seq), usize::from(state.page.eor))
    }

    /// The durable watermark.
    #[must_use]
    pub fn durable_lsn(&self) -> Lsn {
        self.lock_state().durable_lsn
    }

    /// Whether unflushed log volume since the last sync point exceeds the
    /// barrier threshold (1/`SYNC_BARRIER_DIVISOR` of usable log space).
    #[must_use]
    pub fn pressure(&self) -> bool {
        let state = self.lock_state();
        let usable = Self::data_slots(&state.sb) * LOGPDATASIZE as u64;
        state.bytes_since_syncpt > usable / SYNC_BARRIER_DIVISOR
    }

    /// Record a sync point: everything below `sync` is in its home location.
    ///
    /// Appends a SYNCPT record, forces it, persists the new sync point in
    /// the superblock, and resets the barrier accounting.
    pub fn write_syncpt(&self, sync: Lsn) -> Result<Lsn> {
        let lsn = self.append(TxId(0), &LogRecord::SyncPt { sync })?;
        self.force(lsn)?;

        let mut state = self.lock_state();
        state.sb.syncpt = sync;
        let image = state.sb.encode();
        self.dev.write_all_at(0, &image)?;
        self.dev.sync()?;
        state.bytes_since_syncpt = 0;
        state.stats.bytes_since_syncpt = 0;
        state.stats.syncpts += 1;
        tracing::info!(target: "lfs::log", sync = sync.0, "log_syncpt");
        Ok(lsn)
    }

    /// Register a filesystem UUID in the superblock's active table.
    pub fn add_active(&self, uuid: [u8; 16]) -> Result<()> {
        let mut state = self.lock_state();
        state
            .sb
            .add_active(uuid)
            .map_err(|e| LfsError::Format(e.to_string()))?;
        let image = state.sb.encode();
        self.dev.write_all_at(0, &image)?;
        self.dev.sync()?;
        Ok(())
    }

    /// Deregister a filesystem UUID; returns whether it was present.
    pub fn remove_active(&self, uuid: [u8; 16]) -> Result<bool> {
        let mut state = self.lock_state();
        let present = state.sb.remove_active(uuid);
        if present {
            let image = state.sb.encode();
            self.dev.write_all_at(0, &image)?;
            self.dev.sync()?;
        }
        Ok(present)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> LogStats {
        self.lock_state().stats
    }

    /// The device this log writes to.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_block::MemByteDevice;
    use lfs_ondisk::MapRecordOp;
    use lfs_types::{BlockAddr, InodeNumber};
    use std::sync::Barrier;

    fn update_map_record(addr: u64, nblocks: u64) -> LogRecord {
        LogRecord::UpdateMap {
            inode: InodeNumber(2),
            op: MapRecordOp::Alloc,
            addr: BlockAddr(addr),
            nblocks,
        }
    }

    fn fresh_log(pages: usize) -> (Arc<MemByteDevice>, LogManager) {
        let dev = Arc::new(MemByteDevice::new(pages * LOGPSIZE));
        LogManager::format(dev.as_ref(), 4096).expect("format");
        let log = LogManager::open(Arc::clone(&dev) as Arc<dyn ByteDevice>).expect("open");
        (dev, log)
    }

    #[test]
    fn format_validates_geometry() {
        let dev = MemByteDevice::new(3 * LOGPSIZE);
        assert!(LogManager::format(&dev, 4096).is_err());

        let dev = MemByteDevice::new(4 * LOGPSIZE + 100);
        assert!(LogManager::format(&dev, 4096).is_err());
    }

    #[test]
    fn open_bumps_serial() {
        let dev = Arc::new(MemByteDevice::new(8 * LOGPSIZE));
        LogManager::format(dev.as_ref(), 4096).expect("format");

        let _log = LogManager::open(Arc::clone(&dev) as Arc<dyn ByteDevice>).expect("open 1");
        let mut raw = vec![0_u8; LOGPSIZE];
        dev.read_exact_at(0, &mut raw).expect("read sb");
        assert_eq!(LogSuperblock::decode(&raw).expect("decode").serial, 1);

        let _log = LogManager::open(Arc::clone(&dev) as Arc<dyn ByteDevice>).expect("open 2");
        dev.read_exact_at(0, &mut raw).expect("read sb");
        assert_eq!(LogSuperblock::decode(&raw).expect("decode").serial, 2);
    }

    #[test]
    fn append_then_force_is_durable() {
        let (_dev, log) = fresh_log(8);
        let lsn = log.append(TxId(1), &update_map_record(0, 8)).expect("append");
        assert!(log.durable_lsn() <= lsn);
        log.force(lsn).expect("force");
        assert!(log.durable_lsn() > lsn);
    }

    #[test]
    fn group_commit_coalesces_into_one_write() {
        let (dev, log) = fresh_log(8);
        let writes_before = dev.write_count();

        // Three transactions land records on the same open page.
        let l1 = log.append(TxId(1), &update_map_record(0, 8)).expect("t1");
        let l2 = log.append(TxId(2), &update_map_record(8, 8)).expect("t2");
        let l3 = log.append(TxId(3), &update_map_record(16, 8)).expect("t3");

        log.force(l3).expect("leader");
        log.force(l1).expect("follower 1");
        log.force(l2).expect("follower 2");

        assert_eq!(dev.write_count() - writes_before, 1);
        assert_eq!(log.stats().group_commit_writes, 1);
        assert_eq!(log.stats().forces, 3);
    }

    #[test]
    fn concurrent_forces_all_become_durable() {
        let (_dev, log) = fresh_log(16);
        let log = Arc::new(log);
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();

        for t in 0..4_u32 {
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                for i in 0..50_u64 {
                    let lsn = log
                        .append(TxId(t), &update_map_record(u64::from(t) * 1000 + i, 1))
                        .expect("append");
                    log.force(lsn).expect("force");
                    assert!(log.durable_lsn() > lsn);
                }
            }));
        }
        for h in handles {
            h.join().expect("no panic");
        }
        assert_eq!(log.stats().appends, 200);
    }

    #[test]
    fn full_page_is_sealed_and_recoverable_from_device() {
        let (dev, log) = fresh_log(8);

        // Update-map records are 37 bytes; fill past one page to force a seal.
        let mut lsns = Vec::new();
        for i in 0..200_u64 {
            lsns.push(log.append(TxId(1), &update_map_record(i, 1)).expect("append"));
        }
        assert!(log.stats().page_seals >= 1);
        log.force(*lsns.last().expect("nonempty")).expect("force");

        // The first data slot holds sealed page_seq 1 with intact records.
        let mut raw = vec![0_u8; LOGPSIZE];
        dev.read_exact_at(LOG_DATA_SLOT * LOGPSIZE as u64, &mut raw)
            .expect("read page");
        let page = LogPage::decode(&raw).expect("sealed page decodes");
        assert_eq!(page.page_seq, 1);
        let records = LogRecord::decode_page(&page).expect("records decode");
        assert!(!records.is_empty());
        assert!(records.iter().all(|(_, tid)| *tid == TxId(1)));
    }

    #[test]
    fn page_sequences_wrap_over_data_slots() {
        let (_dev, log) = fresh_log(4); // 2 data slots
        {
            let state = log.lock_state();
            assert_eq!(LogManager::slot_offset(&state.sb, 1), 2 * LOGPSIZE as u64);
            assert_eq!(LogManager::slot_offset(&state.sb, 2), 3 * LOGPSIZE as u64);
            assert_eq!(LogManager::slot_offset(&state.sb, 3), 2 * LOGPSIZE as u64);
        }
    }

    #[test]
    fn write_failure_taints_the_log() {
        let (dev, log) = fresh_log(8);
        let lsn = log.append(TxId(1), &update_map_record(0, 1)).expect("append");

        dev.fail_writes(true);
        let err = log.force(lsn).expect_err("force fails");
        assert!(matches!(err, LfsError::LogFailed { .. }));

        // Clearing the injection does not untaint the instance.
        dev.fail_writes(false);
        assert!(matches!(
            log.append(TxId(2), &update_map_record(8, 1)),
            Err(LfsError::LogFailed { .. })
        ));
        assert!(matches!(log.force(lsn), Err(LfsError::LogFailed { .. })));
    }

    #[test]
    fn syncpt_resets_pressure() {
        let (_dev, log) = fresh_log(4); // 2 data slots: tiny usable space

        // Fill more than a quarter of the usable space.
        let mut last = Lsn::ZERO;
        for i in 0..60_u64 {
            last = log.append(TxId(1), &update_map_record(i, 1)).expect("append");
        }
        assert!(log.pressure());

        log.force(last).expect("force");
        log.write_syncpt(log.current_end()).expect("syncpt");
        assert!(!log.pressure());
        assert_eq!(log.stats().syncpts, 1);
    }

    #[test]
    fn active_table_round_trips_through_superblock() {
        let (dev, log) = fresh_log(8);
        let uuid = [0x5A_u8; 16];
        log.add_active(uuid).expect("add");

        let mut raw = vec![0_u8; LOGPSIZE];
        dev.read_exact_at(0, &mut raw).expect("read sb");
        let sb = LogSuperblock::decode(&raw).expect("decode");
        assert!(sb.is_active(uuid));

        assert!(log.remove_active(uuid).expect("remove"));
        assert!(!log.remove_active(uuid).expect("absent"));
        dev.read_exact_at(0, &mut raw).expect("read sb");
        let sb = LogSuperblock::decode(&raw).expect("decode");
        assert!(!sb.is_active(uuid));
    }

    #[test]
    fn force_of_already_durable_lsn_is_free() {
        let (dev, log) = fresh_log(8);
        let lsn = log.append(TxId(1), &update_map_record(0, 1)).expect("append");
        log.force(lsn).expect("first force");
        let writes = dev.write_count();
        log.force(lsn).expect("second force");
        assert_eq!(dev.write_count(), writes);
    }
}
