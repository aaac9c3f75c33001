#![forbid(unsafe_code)]
//! Transaction and lock manager.
//!
//! Every mutation of persistent metadata runs inside a transaction:
//!
//! 1. [`TxnManager::begin`] draws a tblock from the arena (blocking on the
//!    sync barrier, the tlock high-water mark, or arena exhaustion).
//! 2. [`TxnManager::lock_page`] takes single-writer ownership of an
//!    (inode, page) pair — a second transaction wanting the same page blocks
//!    until the owner reaches [`TxnManager::end`]. Byte-range deltas
//!    ([`TxnManager::add_line_range`]) and allocator deltas
//!    ([`TxnManager::add_map_delta`]) accumulate on the page's tlock.
//! 3. [`TxnManager::commit`] walks the tlocks in canonical inode order,
//!    emits redo-page / update-map records followed by a commit record, and
//!    rides the log's group commit. `Sync` mode blocks for durability and
//!    applies persistent-map deltas inline; `Lazy` hands the tail of the
//!    pipeline to the background committer.
//! 4. [`TxnManager::end`] releases ownership and returns the arena slots.
//!
//! The working/persistent two-phase discipline lives in [`MapDelta`]: the
//! allocator updates its working view synchronously and queues a
//! persistent-view delta here; the delta reaches the [`MapSink`] exactly
//! once, strictly after its log records are durable.
//!
//! Waiting is per-reason: distinct condition variables for a free
//! transaction slot, free lock slots / lock pressure, page release, barrier
//! clearance, and checkpoint quiescence.

use lfs_block::MetaBufferPool;
use lfs_error::{LfsError, Result};
use lfs_log::LogManager;
use lfs_ondisk::{LogRecord, MapRecordOp, RedoRange};
use lfs_types::{BlockAddr, InodeNumber, Lsn, TxId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};

// ---------------------------------------------------------------------------
// Map deltas and the sink seam
// ---------------------------------------------------------------------------

/// Which map view(s) a delta targets when it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MapView {
    /// Persistent bitmap only (normal allocation commit).
    Persistent,
    /// Working bitmap only (abort undo).
    Working,
    /// Both bitmaps (frees, which defer every bitmap touch to commit).
    Both,
}

/// One allocator delta queued on a maplock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapDelta {
    /// Alloc or free.
    pub op: MapRecordOp,
    /// Target view(s) at apply time.
    pub view: MapView,
    /// First block of the range.
    pub addr: BlockAddr,
    /// Range length in blocks.
    pub nblocks: u64,
}

/// Consumer of committed (or aborted) map deltas.
///
/// Implemented by the block allocation map; the commit pipeline calls
/// [`apply_delta`](Self::apply_delta) once per delta, strictly after the
/// transaction's log records are durable (or, for abort undo, never having
/// logged anything). [`flush_home`](Self::flush_home) pushes all dirty map
/// pages to their home locations for a checkpoint.
pub trait MapSink: Send + Sync {
    fn apply_delta(&self, delta: &MapDelta) -> Result<()>;
    fn flush_home(&self) -> Result<()>;
}

/// Sink for instances without an allocation map (tests, log-only setups).
#[derive(Debug, Default)]
pub struct NullMapSink;

impl MapSink for NullMapSink {
    fn apply_delta(&self, _delta: &MapDelta) -> Result<()> {
        Ok(())
    }

    fn flush_home(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Arena records
// ---------------------------------------------------------------------------

/// A changed byte range on a linelocked page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub offset: u16,
    pub len: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TxLockKind {
    /// Ownership taken, no deltas yet.
    Unset,
    Line(Vec<LineRange>),
    Map(Vec<MapDelta>),
}

#[derive(Debug, Clone)]
struct TxLock {
    tid: TxId,
    inode: InodeNumber,
    page: BlockAddr,
    kind: TxLockKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Free,
    Active,
    Committing,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct TxBlock {
    state: TxState,
    /// Owned tlocks in acquisition order (arena indices).
    locks: Vec<u32>,
    commit_lsn: Lsn,
    lazy: bool,
    /// Lazy handshake: the committer finished the pipeline.
    lazy_done: bool,
    /// Lazy handshake: the caller already called `end`.
    end_requested: bool,
}

impl TxBlock {
    fn reset(&mut self) {
        self.state = TxState::Free;
        self.locks.clear();
        self.commit_lsn = Lsn::ZERO;
        self.lazy = false;
        self.lazy_done = false;
        self.end_requested = false;
    }
}

// ---------------------------------------------------------------------------
// Configuration and stats
// ---------------------------------------------------------------------------

/// Transaction manager sizing and backpressure thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxnConfig {
    /// Tblock arena size. Default: 64.
    pub max_transactions: usize,
    /// Tlock arena size. Default: 1024.
    pub max_locks: usize,
    /// In-use tlock count above which `begin` blocks. Default: 768.
    pub lock_high_water: usize,
    /// Largest redo-record payload before linelocks chain into another
    /// record. Default: 2048.
    pub redo_payload_cap: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_transactions: 64,
            max_locks: 1024,
            lock_high_water: 768,
            redo_payload_cap: 2048,
        }
    }
}

/// Observable transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxnStats {
    pub begins: u64,
    pub commits: u64,
    pub lazy_commits: u64,
    pub aborts: u64,
    /// Times a `lock_page` had to wait for another owner.
    pub page_waits: u64,
    pub checkpoints: u64,
}

/// Commit durability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until the commit record is durable and the persistent map is
    /// updated (the FORCE/SYNC flavor).
    Sync,
    /// Hand durability wait and map update to the background committer.
    Lazy,
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TxnState {
    tblocks: Vec<TxBlock>,
    tb_free: Vec<u32>,
    locks: Vec<Option<TxLock>>,
    lk_free: Vec<u32>,
    locks_in_use: usize,
    page_owner: HashMap<(InodeNumber, BlockAddr), TxId>,
    /// Transactions begun and not yet fully released.
    active: u32,
    barrier: bool,
    stats: TxnStats,
}

struct TxnCore {
    config: TxnConfig,
    log: Arc<LogManager>,
    cache: Arc<MetaBufferPool>,
    sink: Arc<dyn MapSink>,
    state: Mutex<TxnState>,
    slot_free: Condvar,
    lock_free: Condvar,
    page_released: Condvar,
    barrier_clear: Condvar,
    quiesced: Condvar,
}

impl std::fmt::Debug for TxnCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnCore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type Guard<'a> = std::sync::MutexGuard<'a, TxnState>;

impl TxnCore {
    fn lock_state(&self) -> Guard<'_> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn slot(&self, state: &Guard<'_>, tid: TxId, expect: &[TxState]) -> Result<usize> {
        let idx = tid.0 as usize;
        let block = state
            .tblocks
            .get(idx)
            .ok_or_else(|| LfsError::Format(format!("unknown transaction {}", tid.0)))?;
        if !expect.contains(&block.state) {
            return Err(LfsError::Format(format!(
                "transaction {} in state {:?}, expected one of {expect:?}",
                tid.0, block.state
            )));
        }
        Ok(idx)
    }

    // ── begin ───────────────────────────────────────────────────────────────

    fn begin(&self) -> Result<TxId> {
        let mut state = self.lock_state();
        loop {
            if state.barrier {
                tracing::debug!(target: "lfs::txn", "begin_wait_barrier");
                state = self
                    .barrier_clear
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }
            if state.locks_in_use > self.config.lock_high_water {
                tracing::debug!(
                    target: "lfs::txn",
                    locks_in_use = state.locks_in_use,
                    high_water = self.config.lock_high_water,
                    "begin_wait_lock_pressure"
                );
                state = self
                    .lock_free
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                continue;
            }
            if let Some(slot) = state.tb_free.pop() {
                let block = &mut state.tblocks[slot as usize];
                block.reset();
                block.state = TxState::Active;
                state.active += 1;
                state.stats.begins += 1;
                tracing::trace!(target: "lfs::txn", tid = slot, "tx_begin");
                return Ok(TxId(slot));
            }
            tracing::debug!(target: "lfs::txn", "begin_wait_slot");
            state = self
                .slot_free
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    // ── lock acquisition ────────────────────────────────────────────────────

    /// Acquire single-writer ownership of `(inode, page)` for `tid`,
    /// creating (or finding) the page's tlock. Blocks while another live
    /// transaction owns the page.
    fn lock_page(&self, tid: TxId, inode: InodeNumber, page: BlockAddr) -> Result<u32> {
        let key = (inode, page);
        let mut state = self.lock_state();
        loop {
            self.slot(&state, tid, &[TxState::Active])?;
            match state.page_owner.get(&key).copied() {
                Some(owner) if owner == tid => {
                    let lock_id = state.tblocks[tid.0 as usize]
                        .locks
                        .iter()
                        .copied()
                        .find(|&id| {
                            state.locks[id as usize]
                                .as_ref()
                                .is_some_and(|l| l.inode == inode && l.page == page)
                        })
                        .ok_or_else(|| {
                            LfsError::Format("page owner without matching tlock".into())
                        })?;
                    return Ok(lock_id);
                }
                Some(owner) => {
                    state.stats.page_waits += 1;
                    tracing::debug!(
                        target: "lfs::txn",
                        tid = tid.0,
                        owner = owner.0,
                        inode = inode.0,
                        page = page.0,
                        "lock_page_wait"
                    );
                    state = self
                        .page_released
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                None => {
                    // Allocate a tlock, waiting out arena exhaustion. The
                    // wait drops the state mutex, so ownership must be
                    // re-checked from the top afterwards.
                    let Some(lock_id) = state.lk_free.pop() else {
                        tracing::debug!(target: "lfs::txn", tid = tid.0, "tlock_wait_slot");
                        state = self
                            .lock_free
                            .wait(state)
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        continue;
                    };
                    state.locks[lock_id as usize] = Some(TxLock {
                        tid,
                        inode,
                        page,
                        kind: TxLockKind::Unset,
                    });
                    state.locks_in_use += 1;
                    state.page_owner.insert(key, tid);
                    state.tblocks[tid.0 as usize].locks.push(lock_id);
                    tracing::trace!(
                        target: "lfs::txn",
                        tid = tid.0,
                        inode = inode.0,
                        page = page.0,
                        lock_id,
                        "tx_lock"
                    );
                    return Ok(lock_id);
                }
            }
        }
    }

    fn add_line_range(
        &self,
        tid: TxId,
        inode: InodeNumber,
        page: BlockAddr,
        offset: u16,
        len: u16,
    ) -> Result<()> {
        let lock_id = self.lock_page(tid, inode, page)?;
        let mut state = self.lock_state();
        let lock = state.locks[lock_id as usize]
            .as_mut()
            .ok_or_else(|| LfsError::Format("tlock vanished".into()))?;
        match &mut lock.kind {
            TxLockKind::Unset => {
                lock.kind = TxLockKind::Line(vec![LineRange { offset, len }]);
            }
            TxLockKind::Line(ranges) => {
                merge_line_range(ranges, LineRange { offset, len });
            }
            TxLockKind::Map(_) => {
                return Err(LfsError::Format(
                    "page already carries a maplock; linelock refused".into(),
                ));
            }
        }
        Ok(())
    }

    fn add_map_delta(
        &self,
        tid: TxId,
        inode: InodeNumber,
        page: BlockAddr,
        delta: MapDelta,
    ) -> Result<()> {
        let lock_id = self.lock_page(tid, inode, page)?;
        let mut state = self.lock_state();
        let lock = state.locks[lock_id as usize]
            .as_mut()
            .ok_or_else(|| LfsError::Format("tlock vanished".into()))?;
        match &mut lock.kind {
            TxLockKind::Unset => {
                lock.kind = TxLockKind::Map(vec![delta]);
            }
            TxLockKind::Map(deltas) => deltas.push(delta),
            TxLockKind::Line(_) => {
                return Err(LfsError::Format(
                    "page already carries a linelock; maplock refused".into(),
                ));
            }
        }
        Ok(())
    }

    // ── commit pipeline ─────────────────────────────────────────────────────

    fn commit(&self, tid: TxId, mode: CommitMode) -> Result<Lsn> {
        // Snapshot the tlock plan in canonical inode order; record building
        // reads pages through the cache, which must not happen under the
        // state mutex.
        let plan: Vec<TxLock> = {
            let mut state = self.lock_state();
            let idx = self.slot(&state, tid, &[TxState::Active])?;
            state.tblocks[idx].state = TxState::Committing;
            let mut plan: Vec<TxLock> = state.tblocks[idx]
                .locks
                .iter()
                .filter_map(|&id| state.locks[id as usize].clone())
                .collect();
            plan.sort_by_key(|l| (l.inode, l.page));
            plan
        };

        match self.write_records(tid, &plan) {
            Ok(commit_lsn) => {
                let mut state = self.lock_state();
                let idx = tid.0 as usize;
                state.tblocks[idx].commit_lsn = commit_lsn;
                match mode {
                    CommitMode::Sync => {
                        state.stats.commits += 1;
                        drop(state);
                        if let Err(e) = self.log.force(commit_lsn) {
                            // Records reached the log buffer but will never
                            // be durable; back the working view out.
                            self.undo_working(&plan);
                            let mut state = self.lock_state();
                            state.tblocks[idx].state = TxState::Aborted;
                            return Err(e);
                        }
                        let map_result = self.update_map(&plan);
                        let mut state = self.lock_state();
                        state.tblocks[idx].state = TxState::Committed;
                        drop(state);
                        map_result?;
                        tracing::debug!(
                            target: "lfs::txn",
                            tid = tid.0,
                            lsn = commit_lsn.0,
                            "tx_commit_sync"
                        );
                    }
                    CommitMode::Lazy => {
                        state.tblocks[idx].state = TxState::Committed;
                        state.tblocks[idx].lazy = true;
                        state.stats.commits += 1;
                        state.stats.lazy_commits += 1;
                        tracing::debug!(
                            target: "lfs::txn",
                            tid = tid.0,
                            lsn = commit_lsn.0,
                            "tx_commit_lazy"
                        );
                    }
                }
                Ok(commit_lsn)
            }
            Err(e) => {
                // Log append failed: back out as an abort so the working
                // view does not advertise blocks the log never recorded.
                tracing::error!(
                    target: "lfs::txn",
                    tid = tid.0,
                    error = %e,
                    "tx_commit_log_failure"
                );
                self.undo_working(&plan);
                let mut state = self.lock_state();
                state.tblocks[tid.0 as usize].state = TxState::Aborted;
                Err(e)
            }
        }
    }

    /// Emit redo-page and update-map records for the plan, then the commit
    /// record. Returns the commit record's LSN.
    fn write_records(&self, tid: TxId, plan: &[TxLock]) -> Result<Lsn> {
        for lock in plan {
            match &lock.kind {
                TxLockKind::Unset => {}
                TxLockKind::Line(ranges) => {
                    let buf = self.cache.get(lock.page)?;
                    let bytes = buf.as_slice();
                    for chunk in chunk_ranges(ranges, self.config.redo_payload_cap) {
                        let mut redo = Vec::with_capacity(chunk.len());
                        for r in chunk {
                            let start = usize::from(r.offset);
                            let end = start + usize::from(r.len);
                            if end > bytes.len() {
                                self.cache.release(lock.page);
                                return Err(LfsError::Format(format!(
                                    "linelock range {}+{} exceeds page size",
                                    r.offset, r.len
                                )));
                            }
                            redo.push(RedoRange {
                                offset: r.offset,
                                bytes: bytes[start..end].to_vec(),
                            });
                        }
                        let record = LogRecord::RedoPage {
                            inode: lock.inode,
                            page: lock.page,
                            ranges: redo,
                        };
                        if let Err(e) = self.log.append(tid, &record) {
                            self.cache.release(lock.page);
                            return Err(e);
                        }
                    }
                    self.cache.release(lock.page);
                }
                TxLockKind::Map(deltas) => {
                    for delta in deltas {
                        let record = LogRecord::UpdateMap {
                            inode: lock.inode,
                            op: delta.op,
                            addr: delta.addr,
                            nblocks: delta.nblocks,
                        };
                        self.log.append(tid, &record)?;
                    }
                }
            }
        }
        self.log.append(tid, &LogRecord::Commit)
    }

    /// Apply every queued map delta to the sink (post-durability).
    fn update_map(&self, plan: &[TxLock]) -> Result<()> {
        for lock in plan {
            if let TxLockKind::Map(deltas) = &lock.kind {
                for delta in deltas {
                    self.sink.apply_delta(delta)?;
                }
            }
        }
        Ok(())
    }

    /// Undo working-view effects of not-yet-committed deltas (abort path).
    fn undo_working(&self, plan: &[TxLock]) {
        for lock in plan {
            match &lock.kind {
                TxLockKind::Map(deltas) => {
                    // Allocations touched the working map at alloc time;
                    // reverse them. Frees touched nothing yet — drop them.
                    for delta in deltas.iter().rev() {
                        if delta.op == MapRecordOp::Alloc {
                            let undo = MapDelta {
                                op: MapRecordOp::Free,
                                view: MapView::Working,
                                addr: delta.addr,
                                nblocks: delta.nblocks,
                            };
                            if let Err(e) = self.sink.apply_delta(&undo) {
                                tracing::error!(
                                    target: "lfs::txn",
                                    addr = delta.addr.0,
                                    nblocks = delta.nblocks,
                                    error = %e,
                                    "abort_undo_failed"
                                );
                            }
                        }
                    }
                }
                TxLockKind::Line(_) => {
                    // The owning component re-reads the page; throw away the
                    // dirtied buffer.
                    self.cache.discard(lock.page);
                }
                TxLockKind::Unset => {}
            }
        }
    }

    fn abort(&self, tid: TxId) -> Result<()> {
        let plan: Vec<TxLock> = {
            let mut state = self.lock_state();
            let idx = self.slot(&state, tid, &[TxState::Active])?;
            state.tblocks[idx].state = TxState::Aborted;
            state.stats.aborts += 1;
            state.tblocks[idx]
                .locks
                .iter()
                .filter_map(|&id| state.locks[id as usize].clone())
                .collect()
        };
        self.undo_working(&plan);
        tracing::debug!(target: "lfs::txn", tid = tid.0, "tx_abort");
        Ok(())
    }

    // ── end / release ───────────────────────────────────────────────────────

    fn end(&self, tid: TxId) -> Result<()> {
        let mut state = self.lock_state();
        let idx = self.slot(
            &state,
            tid,
            &[TxState::Committed, TxState::Aborted, TxState::Active],
        )?;

        if state.tblocks[idx].lazy && !state.tblocks[idx].lazy_done {
            // Committer still owns the tail of the pipeline; it will release
            // on completion.
            state.tblocks[idx].end_requested = true;
            tracing::trace!(target: "lfs::txn", tid = tid.0, "tx_end_deferred");
            return Ok(());
        }
        self.release_locked(&mut state, tid);
        Ok(())
    }

    /// Return every resource of `tid` and wake all wait reasons.
    fn release_locked(&self, state: &mut Guard<'_>, tid: TxId) {
        let idx = tid.0 as usize;
        let lock_ids = std::mem::take(&mut state.tblocks[idx].locks);
        for id in lock_ids {
            if let Some(lock) = state.locks[id as usize].take() {
                state.page_owner.remove(&(lock.inode, lock.page));
                state.locks_in_use -= 1;
            }
            state.lk_free.push(id);
        }
        state.tblocks[idx].reset();
        state.tb_free.push(tid.0);
        state.active -= 1;

        self.page_released.notify_all();
        self.lock_free.notify_all();
        self.slot_free.notify_all();
        if state.barrier && state.active == 0 {
            self.quiesced.notify_all();
        }
        tracing::trace!(target: "lfs::txn", tid = tid.0, "tx_end");
    }

    /// Lazy-commit tail: wait for durability, apply map deltas, release.
    fn finish_lazy(&self, tid: TxId) {
        let (plan, commit_lsn) = {
            let state = self.lock_state();
            let idx = tid.0 as usize;
            let plan: Vec<TxLock> = state.tblocks[idx]
                .locks
                .iter()
                .filter_map(|&id| state.locks[id as usize].clone())
                .collect();
            (plan, state.tblocks[idx].commit_lsn)
        };

        match self.log.force(commit_lsn) {
            Ok(()) => {
                if let Err(e) = self.update_map(&plan) {
                    tracing::error!(
                        target: "lfs::txn",
                        tid = tid.0,
                        error = %e,
                        "lazy_update_map_failed"
                    );
                }
            }
            Err(e) => {
                // The log is tainted; the instance is headed for an offline
                // check. Resources are still released below.
                tracing::error!(
                    target: "lfs::txn",
                    tid = tid.0,
                    error = %e,
                    "lazy_force_failed"
                );
            }
        }

        let mut state = self.lock_state();
        let idx = tid.0 as usize;
        state.tblocks[idx].lazy_done = true;
        if state.tblocks[idx].end_requested {
            self.release_locked(&mut state, tid);
        }
    }

    // ── checkpoint / sync barrier ───────────────────────────────────────────

    /// Quiesce, flush every home location, and write a sync point.
    ///
    /// New transactions block on the barrier from the moment it is raised
    /// until the sync point is durable.
    fn checkpoint(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.barrier {
                // Another thread is already checkpointing.
                return Ok(());
            }
            state.barrier = true;
            while state.active > 0 {
                state = self
                    .quiesced
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        }

        let result = (|| {
            self.sink.flush_home()?;
            self.cache.flush_all()?;
            let sync = self.log.current_end();
            self.log.write_syncpt(sync)?;
            Ok(())
        })();

        let mut state = self.lock_state();
        state.barrier = false;
        state.stats.checkpoints += 1;
        self.barrier_clear.notify_all();
        drop(state);

        if result.is_ok() {
            tracing::info!(target: "lfs::txn", "checkpoint_complete");
        }
        result
    }
}

/// Insert `range` keeping the list sorted, merging overlap and adjacency.
fn merge_line_range(ranges: &mut Vec<LineRange>, range: LineRange) {
    ranges.push(range);
    ranges.sort_by_key(|r| r.offset);
    let mut merged: Vec<LineRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if u32::from(last.offset) + u32::from(last.len) >= u32::from(r.offset) => {
                let end = (u32::from(r.offset) + u32::from(r.len))
                    .max(u32::from(last.offset) + u32::from(last.len));
                last.len = u16::try_from(end - u32::from(last.offset))
                    .expect("ranges live within one page");
            }
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}

/// Split a linelock list into chunks whose payloads stay under `cap` bytes,
/// so oversized delta sets chain into multiple redo records.
fn chunk_ranges(ranges: &[LineRange], cap: usize) -> Vec<&[LineRange]> {
    let mut chunks = Vec::new();
    let mut start = 0_usize;
    let mut payload = 0_usize;
    for (i, r) in ranges.iter().enumerate() {
        let cost = 4 + usize::from(r.len);
        if i > start && payload + cost > cap {
            chunks.push(&ranges[start..i]);
            start = i;
            payload = 0;
        }
        payload += cost;
    }
    if start < ranges.len() {
        chunks.push(&ranges[start..]);
    }
    chunks
}

// ---------------------------------------------------------------------------
// Background committer
// ---------------------------------------------------------------------------

enum CommitterMsg {
    Finish(TxId),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Public manager
// ---------------------------------------------------------------------------

/// The transaction manager. One per mounted instance.
pub struct TxnManager {
    core: Arc<TxnCore>,
    committer_tx: Mutex<Sender<CommitterMsg>>,
    committer: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for TxnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl TxnManager {
    /// Build a manager over a log, a metadata cache, and a map sink.
    #[must_use]
    pub fn new(
        log: Arc<LogManager>,
        cache: Arc<MetaBufferPool>,
        sink: Arc<dyn MapSink>,
        config: TxnConfig,
    ) -> Self {
        let tblocks = (0..config.max_transactions)
            .map(|_| TxBlock {
                state: TxState::Free,
                locks: Vec::new(),
                commit_lsn: Lsn::ZERO,
                lazy: false,
                lazy_done: false,
                end_requested: false,
            })
            .collect();
        let tb_free = (0..config.max_transactions)
            .rev()
            .map(|i| u32::try_from(i).expect("arena index fits u32"))
            .collect();
        let locks = (0..config.max_locks).map(|_| None).collect();
        let lk_free = (0..config.max_locks)
            .rev()
            .map(|i| u32::try_from(i).expect("arena index fits u32"))
            .collect();

        let core = Arc::new(TxnCore {
            config,
            log,
            cache,
            sink,
            state: Mutex::new(TxnState {
                tblocks,
                tb_free,
                locks,
                lk_free,
                locks_in_use: 0,
                page_owner: HashMap::new(),
                active: 0,
                barrier: false,
                stats: TxnStats::default(),
            }),
            slot_free: Condvar::new(),
            lock_free: Condvar::new(),
            page_released: Condvar::new(),
            barrier_clear: Condvar::new(),
            quiesced: Condvar::new(),
        });

        let (committer_tx, committer_rx) = channel();
        let committer = Some(Self::spawn_committer(Arc::clone(&core), committer_rx));

        Self {
            core,
            committer_tx: Mutex::new(committer_tx),
            committer,
        }
    }

    fn spawn_committer(
        core: Arc<TxnCore>,
        rx: Receiver<CommitterMsg>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("lfs-committer".to_owned())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        CommitterMsg::Finish(tid) => {
                            core.finish_lazy(tid);
                            // Lazy traffic is the natural checkpoint driver.
                            if core.log.pressure() {
                                if let Err(e) = core.checkpoint() {
                                    tracing::error!(
                                        target: "lfs::txn",
                                        error = %e,
                                        "background_checkpoint_failed"
                                    );
                                }
                            }
                        }
                        CommitterMsg::Shutdown => break,
                    }
                }
            })
            .expect("spawn committer thread")
    }

    /// Start a transaction. Suspension points: sync barrier, tlock pressure,
    /// tblock arena exhaustion.
    pub fn begin(&self) -> Result<TxId> {
        self.core.begin()
    }

    /// Take single-writer ownership of `(inode, page)`.
    pub fn lock_page(&self, tid: TxId, inode: InodeNumber, page: BlockAddr) -> Result<()> {
        self.core.lock_page(tid, inode, page).map(|_| ())
    }

    /// Record a changed byte range on a linelocked page.
    pub fn add_line_range(
        &self,
        tid: TxId,
        inode: InodeNumber,
        page: BlockAddr,
        offset: u16,
        len: u16,
    ) -> Result<()> {
        self.core.add_line_range(tid, inode, page, offset, len)
    }

    /// Queue an allocator delta on a maplocked page.
    pub fn add_map_delta(
        &self,
        tid: TxId,
        inode: InodeNumber,
        page: BlockAddr,
        delta: MapDelta,
    ) -> Result<()> {
        self.core.add_map_delta(tid, inode, page, delta)
    }

    /// Commit: emit log records, ride group commit, apply map deltas.
    ///
    /// In `Lazy` mode the durability wait and map update happen on the
    /// background committer; locks release once both it and [`end`](Self::end)
    /// have run.
    pub fn commit(&self, tid: TxId, mode: CommitMode) -> Result<Lsn> {
        let lsn = self.core.commit(tid, mode)?;
        if mode == CommitMode::Lazy {
            self.committer_tx
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .send(CommitterMsg::Finish(tid))
                .map_err(|_| LfsError::Format("committer thread gone".into()))?;
        }
        Ok(lsn)
    }

    /// Abort: release nothing yet, but undo working-view allocations and
    /// discard dirtied buffers. Follow with [`end`](Self::end).
    pub fn abort(&self, tid: TxId) -> Result<()> {
        self.core.abort(tid)
    }

    /// Release ownership and arena resources (the wake-up point every page
    /// waiter observes).
    pub fn end(&self, tid: TxId) -> Result<()> {
        self.core.end(tid)?;
        if self.core.log.pressure() {
            self.core.checkpoint()?;
        }
        Ok(())
    }

    /// Force a checkpoint: quiesce, flush home locations, write a sync point.
    pub fn checkpoint(&self) -> Result<()> {
        self.core.checkpoint()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TxnStats {
        self.core.lock_state().stats
    }

    /// The log this manager commits through.
    #[must_use]
    pub fn log(&self) -> &Arc<LogManager> {
        &self.core.log
    }

    /// The metadata cache linelocked pages are read from.
    #[must_use]
    pub fn cache(&self) -> &Arc<MetaBufferPool> {
        &self.core.cache
    }
}

impl Drop for TxnManager {
    fn drop(&mut self) {
        let _ = self
            .committer_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .send(CommitterMsg::Shutdown);
        if let Some(handle) = self.committer.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_block::{BlockDevice, ByteBlockDevice, ByteDevice, MemByteDevice, MetaPoolConfig};
    use lfs_types::LOGPSIZE;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    const INO: InodeNumber = InodeNumber(7);

    #[derive(Debug, Default)]
    struct RecordingSink {
        applied: Mutex<Vec<MapDelta>>,
        flushes: AtomicU64,
    }

    impl MapSink for RecordingSink {
        fn apply_delta(&self, delta: &MapDelta) -> Result<()> {
            self.applied
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(*delta);
            Ok(())
        }

        fn flush_home(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    struct Fixture {
        txn: TxnManager,
        sink: Arc<RecordingSink>,
        log_dev: Arc<MemByteDevice>,
    }

    fn fixture(log_pages: usize) -> Fixture {
        let log_dev = Arc::new(MemByteDevice::new(log_pages * LOGPSIZE));
        LogManager::format(log_dev.as_ref(), 4096).expect("format log");
        let log = Arc::new(
            LogManager::open(Arc::clone(&log_dev) as Arc<dyn lfs_block::ByteDevice>)
                .expect("open log"),
        );

        let meta_dev: Arc<dyn BlockDevice> = Arc::new(
            ByteBlockDevice::new(MemByteDevice::new(64 * 4096), 4096).expect("meta device"),
        );
        let cache = Arc::new(MetaBufferPool::new(meta_dev, MetaPoolConfig::default()));

        let sink = Arc::new(RecordingSink::default());
        let txn = TxnManager::new(
            log,
            cache,
            Arc::clone(&sink) as Arc<dyn MapSink>,
            TxnConfig::default(),
        );
        Fixture { txn, sink, log_dev }
    }

    fn alloc_delta(addr: u64, nblocks: u64) -> MapDelta {
        MapDelta {
            op: MapRecordOp::Alloc,
            view: MapView::Persistent,
            addr: BlockAddr(addr),
            nblocks,
        }
    }

    // -- merge/chunk helpers --

    #[test]
    fn line_ranges_merge_adjacent_and_overlapping() {
        let mut ranges = Vec::new();
        merge_line_range(&mut ranges, LineRange { offset: 10, len: 10 });
        merge_line_range(&mut ranges, LineRange { offset: 40, len: 4 });
        merge_line_range(&mut ranges, LineRange { offset: 20, len: 5 }); // adjacent to first
        merge_line_range(&mut ranges, LineRange { offset: 12, len: 2 }); // inside first
        assert_eq!(
            ranges,
            vec![
                LineRange { offset: 10, len: 15 },
                LineRange { offset: 40, len: 4 }
            ]
        );
    }

    #[test]
    fn oversized_linelock_sets_chain_into_chunks() {
        let ranges: Vec<LineRange> = (0..10)
            .map(|i| LineRange {
                offset: i * 100,
                len: 90,
            })
            .collect();
        let chunks = chunk_ranges(&ranges, 200);
        // Each range costs 94 bytes; two fit per 200-byte chunk.
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() == 2));

        // A single range larger than the cap still goes out alone.
        let big = vec![LineRange { offset: 0, len: 500 }];
        assert_eq!(chunk_ranges(&big, 200).len(), 1);
    }

    // -- lifecycle --

    #[test]
    fn sync_commit_applies_deltas_after_durability() {
        let fx = fixture(16);
        let tid = fx.txn.begin().expect("begin");
        fx.txn
            .add_map_delta(tid, INO, BlockAddr(1), alloc_delta(64, 8))
            .expect("delta");
        let lsn = fx.txn.commit(tid, CommitMode::Sync).expect("commit");
        fx.txn.end(tid).expect("end");

        assert!(fx.txn.log().durable_lsn() > lsn);
        let applied = fx
            .sink
            .applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(applied, vec![alloc_delta(64, 8)]);
        assert_eq!(fx.txn.stats().commits, 1);
    }

    #[test]
    fn lazy_commit_applies_deltas_on_committer() {
        let fx = fixture(16);
        let tid = fx.txn.begin().expect("begin");
        fx.txn
            .add_map_delta(tid, INO, BlockAddr(1), alloc_delta(0, 4))
            .expect("delta");
        fx.txn.commit(tid, CommitMode::Lazy).expect("commit");
        fx.txn.end(tid).expect("end");

        // The committer owns the tail; poll until it lands.
        for _ in 0..100 {
            let done = !fx
                .sink
                .applied
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty();
            if done {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let applied = fx
            .sink
            .applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert_eq!(applied, vec![alloc_delta(0, 4)]);
        assert_eq!(fx.txn.stats().lazy_commits, 1);
    }

    #[test]
    fn abort_undoes_working_allocations_only() {
        let fx = fixture(16);
        let tid = fx.txn.begin().expect("begin");
        fx.txn
            .add_map_delta(tid, INO, BlockAddr(1), alloc_delta(32, 16))
            .expect("alloc delta");
        fx.txn
            .add_map_delta(
                tid,
                INO,
                BlockAddr(1),
                MapDelta {
                    op: MapRecordOp::Free,
                    view: MapView::Both,
                    addr: BlockAddr(90),
                    nblocks: 2,
                },
            )
            .expect("free delta");
        fx.txn.abort(tid).expect("abort");
        fx.txn.end(tid).expect("end");

        let applied = fx
            .sink
            .applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        // Only the alloc is reversed, against the working view; the free
        // never touched anything and is dropped.
        assert_eq!(
            applied,
            vec![MapDelta {
                op: MapRecordOp::Free,
                view: MapView::Working,
                addr: BlockAddr(32),
                nblocks: 16,
            }]
        );
        assert_eq!(fx.txn.stats().aborts, 1);
    }

    #[test]
    fn second_locker_blocks_until_end() {
        let fx = Arc::new(fixture(16));
        let page = BlockAddr(5);

        let t1 = fx.txn.begin().expect("begin t1");
        fx.txn.lock_page(t1, INO, page).expect("t1 owns page");

        let fx2 = Arc::clone(&fx);
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = Arc::clone(&barrier);
        let order = Arc::new(AtomicU64::new(0));
        let order2 = Arc::clone(&order);

        let waiter = std::thread::spawn(move || {
            let t2 = fx2.txn.begin().expect("begin t2");
            barrier2.wait();
            // Blocks here until t1 ends.
            fx2.txn.lock_page(t2, INO, page).expect("t2 gets page");
            order2.store(2, Ordering::Release);
            fx2.txn.abort(t2).expect("abort t2");
            fx2.txn.end(t2).expect("end t2");
        });

        barrier.wait();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(order.load(Ordering::Acquire), 0, "t2 must still be blocked");
        order.store(1, Ordering::Release);

        fx.txn.abort(t1).expect("abort t1");
        fx.txn.end(t1).expect("end t1");
        waiter.join().expect("no panic");
        assert_eq!(order.load(Ordering::Acquire), 2);
        assert!(fx.txn.stats().page_waits >= 1);
    }

    #[test]
    fn relocking_owned_page_does_not_block() {
        let fx = fixture(16);
        let tid = fx.txn.begin().expect("begin");
        fx.txn.lock_page(tid, INO, BlockAddr(3)).expect("first");
        fx.txn.lock_page(tid, INO, BlockAddr(3)).expect("again");
        fx.txn.abort(tid).expect("abort");
        fx.txn.end(tid).expect("end");
    }

    #[test]
    fn mixing_line_and_map_locks_on_one_page_is_refused() {
        let fx = fixture(16);
        let tid = fx.txn.begin().expect("begin");
        fx.txn
            .add_line_range(tid, INO, BlockAddr(2), 0, 8)
            .expect("linelock");
        assert!(
            fx.txn
                .add_map_delta(tid, INO, BlockAddr(2), alloc_delta(0, 1))
                .is_err()
        );
        fx.txn.abort(tid).expect("abort");
        fx.txn.end(tid).expect("end");
    }

    #[test]
    fn redo_page_records_carry_page_bytes() {
        let fx = fixture(16);
        let page = BlockAddr(3);

        // Dirty a metadata page the way a btree caller would.
        let mut buf = fx.txn.cache().get(page).expect("pin");
        buf.as_mut_slice()[10..14].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        fx.txn.cache().mark_dirty(&buf).expect("dirty");
        fx.txn.cache().release(page);

        let tid = fx.txn.begin().expect("begin");
        fx.txn
            .add_line_range(tid, INO, page, 10, 4)
            .expect("linelock");
        fx.txn.commit(tid, CommitMode::Sync).expect("commit");
        fx.txn.end(tid).expect("end");

        // The redo record on the first log page carries the new bytes.
        let mut raw = vec![0_u8; LOGPSIZE];
        fx.log_dev
            .read_exact_at(lfs_types::LOG_DATA_SLOT * LOGPSIZE as u64, &mut raw)
            .expect("read log page");
        let decoded = lfs_ondisk::LogPage::decode(&raw).expect("page decodes");
        let records = LogRecord::decode_page(&decoded).expect("records decode");

        let redo = records
            .iter()
            .find_map(|(r, _)| match r {
                LogRecord::RedoPage {
                    inode,
                    page: p,
                    ranges,
                } if *inode == INO && *p == page => Some(ranges.clone()),
                _ => None,
            })
            .expect("redo-page record present");
        assert_eq!(redo.len(), 1);
        assert_eq!(redo[0].offset, 10);
        assert_eq!(redo[0].bytes, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(
            records
                .iter()
                .any(|(r, t)| matches!(r, LogRecord::Commit) && *t == tid)
        );
    }

    #[test]
    fn tblock_arena_exhaustion_blocks_begin() {
        let log_dev = Arc::new(MemByteDevice::new(16 * LOGPSIZE));
        LogManager::format(log_dev.as_ref(), 4096).expect("format log");
        let log = Arc::new(
            LogManager::open(Arc::clone(&log_dev) as Arc<dyn lfs_block::ByteDevice>)
                .expect("open log"),
        );
        let meta_dev: Arc<dyn BlockDevice> = Arc::new(
            ByteBlockDevice::new(MemByteDevice::new(16 * 4096), 4096).expect("meta device"),
        );
        let cache = Arc::new(MetaBufferPool::new(meta_dev, MetaPoolConfig::default()));
        let txn = Arc::new(TxnManager::new(
            log,
            cache,
            Arc::new(NullMapSink),
            TxnConfig {
                max_transactions: 1,
                ..TxnConfig::default()
            },
        ));

        let t1 = txn.begin().expect("only slot");
        let txn2 = Arc::clone(&txn);
        let waiter = std::thread::spawn(move || {
            let t2 = txn2.begin().expect("after release");
            txn2.abort(t2).expect("abort");
            txn2.end(t2).expect("end");
        });

        std::thread::sleep(Duration::from_millis(50));
        txn.abort(t1).expect("abort");
        txn.end(t1).expect("end");
        waiter.join().expect("no panic");
    }

    #[test]
    fn commit_failure_taints_and_aborts() {
        let fx = fixture(16);
        let tid = fx.txn.begin().expect("begin");
        fx.txn
            .add_map_delta(tid, INO, BlockAddr(1), alloc_delta(16, 4))
            .expect("delta");

        fx.log_dev.fail_writes(true);
        let err = fx.txn.commit(tid, CommitMode::Sync).expect_err("fails");
        assert!(matches!(err, LfsError::LogFailed { .. } | LfsError::Io(_)));
        fx.txn.end(tid).expect("end");

        // The undo reversed the working allocation; nothing persistent.
        let applied = fx
            .sink
            .applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        assert!(applied.iter().all(|d| d.view == MapView::Working));
    }

    #[test]
    fn checkpoint_flushes_and_clears_pressure() {
        let fx = fixture(4); // tiny log: pressure arrives quickly
        for i in 0..60_u64 {
            let tid = fx.txn.begin().expect("begin");
            fx.txn
                .add_map_delta(tid, INO, BlockAddr(1), alloc_delta(i * 8, 8))
                .expect("delta");
            fx.txn.commit(tid, CommitMode::Sync).expect("commit");
            fx.txn.end(tid).expect("end");
        }
        // end() runs checkpoints whenever the log crosses the threshold.
        assert!(fx.txn.stats().checkpoints >= 1);
        assert!(fx.sink.flushes.load(Ordering::Acquire) >= 1);
        assert!(!fx.txn.log().pressure());
    }
}
