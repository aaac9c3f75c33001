#![forbid(unsafe_code)]
//! Hierarchical buddy block allocation map.
//!
//! The map describes a volume of `total_blocks` in its own page region:
//! block 0 a control page, then the dmapctl stack (highest level first),
//! then one dmap per `BPERDMAP` volume blocks. Layout:
//!
//! ```text
//! [ control | ctl Lmax .. ctl L0 | dmap 0 | dmap 1 | ... ]
//! ```
//!
//! Allocation is tree-guided: fast paths (`alloc_next`/`alloc_near`) serve
//! sequential hints inside one dmap; otherwise the request descends the
//! dmapctl summary trees to a dmap, then to a bitmap word, honoring
//! allocation-group affinity on the way. Mutations flip working-map bits
//! immediately (split/join keeping the summary trees exact) and queue
//! persistent-map deltas through the transaction manager; the deltas come
//! back via [`MapSink`] once their log records are durable.
//!
//! Locking: a transaction must own a dmap's page (via
//! [`TxnManager::lock_page`]) before that dmap is mutated — the
//! single-writer-per-page discipline. Below that, one mutex per allocation
//! group serializes localized search and one map mutex guards whole-map
//! state. Lock order: transaction page locks, then AG mutex, then map
//! mutex. Candidate selection runs under the map mutex, the page lock is
//! taken without it, and the mutation re-validates — a candidate stolen in
//! between is simply re-selected.
//!
//! Any disagreement between a summary tree and its bitmap is fatal: the map
//! latches a poisoned flag, the failing call returns
//! [`LfsError::Corruption`], and every later call refuses service. The
//! volume is left for an offline check; nothing is repaired in place.

mod dmap_ops;

use dmap_ops::{BitsError, alloc_bits, find_bits, free_bits, update_pmap};
use lfs_block::BlockDevice;
use lfs_error::{LfsError, Result};
use lfs_ondisk::dmap::word_mask;
use lfs_ondisk::{BmapControlPage, DmapCtlPage, DmapPage, SummaryTree, TreeError};
use lfs_txn::{MapDelta, MapSink, MapView, TxnManager};
use lfs_types::{
    AgNumber, BPERDMAP, BlockAddr, InodeNumber, L2BPERDMAP, L2DBWORD, L2LPERCTL, LPERCTL, MAXAG,
    NOFREE, PSIZE, TxId, ceil_log2,
};
use lfs_ondisk::MapRecordOp;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Inode number the allocation map logs its deltas under.
pub const BMAP_INODE: InodeNumber = InodeNumber(2);

/// Re-selection attempts before an allocation strategy gives up its slot in
/// the search order (contention, not corruption).
const ALLOC_RETRIES: usize = 8;

/// Largest volume a three-level control stack can describe.
const MAX_MAP_BLOCKS: u64 = 1 << 43;

const BUDMIN_DMAP: i8 = L2DBWORD as i8;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Page-region geometry derived from `total_blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MapGeometry {
    total_blocks: u64,
    ndmaps: u64,
    maxlevel: u32,
    nctl: [u64; 3],
}

impl MapGeometry {
    fn derive(total_blocks: u64) -> Result<Self> {
        if total_blocks == 0 {
            return Err(LfsError::InvalidGeometry("map of zero blocks".into()));
        }
        if total_blocks > MAX_MAP_BLOCKS {
            return Err(LfsError::InvalidGeometry(format!(
                "map of {total_blocks} blocks exceeds the control-tree reach"
            )));
        }
        let ndmaps = total_blocks.div_ceil(BPERDMAP);
        let per = LPERCTL as u64;
        let nctl0 = ndmaps.div_ceil(per);
        let nctl1 = nctl0.div_ceil(per);
        let (maxlevel, nctl) = if nctl0 == 1 {
            (0, [1, 0, 0])
        } else if nctl1 == 1 {
            (1, [nctl0, 1, 0])
        } else {
            (2, [nctl0, nctl1, 1])
        };
        Ok(Self {
            total_blocks,
            ndmaps,
            maxlevel,
            nctl,
        })
    }

    /// Total map-region pages (control + ctls + dmaps).
    fn region_pages(&self) -> u64 {
        1 + self.nctl.iter().sum::<u64>() + self.ndmaps
    }

    /// Region page index of a dmapctl page.
    fn ctl_page_index(&self, level: u32, idx: u64) -> u64 {
        // Levels are laid out highest first.
        let mut base = 1;
        let mut lv = self.maxlevel;
        while lv > level {
            base += self.nctl[lv as usize];
            lv -= 1;
        }
        base + idx
    }

    /// Region page index of a dmap.
    fn dmap_page_index(&self, di: u64) -> u64 {
        1 + self.nctl.iter().sum::<u64>() + di
    }

    /// Blocks described by dmap `di` (the last may be short).
    fn dmap_blocks(&self, di: u64) -> u32 {
        let start = di * BPERDMAP;
        u32::try_from((self.total_blocks - start).min(BPERDMAP)).expect("fits BPERDMAP")
    }
}

/// Allocation-group geometry: how AG index ranges map onto control-tree
/// subtrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct AgGeometry {
    agl2size: u32,
    agsize: u64,
    num_ag: usize,
    /// Control level whose subtrees map onto AGs.
    aglevel: u32,
    /// log2 leaves per AG at that level.
    l2nl: u32,
    /// Tree levels descended inside an AG subtree.
    agheight: u32,
    /// Subtrees per AG at that depth.
    agwidth: u32,
    /// Index of the first tree node at the AG depth.
    agstart: u32,
}

impl AgGeometry {
    fn derive(total_blocks: u64) -> Self {
        let agl2size = ceil_log2(total_blocks.div_ceil(MAXAG as u64)).max(L2BPERDMAP);
        let agsize = 1_u64 << agl2size;
        let num_ag = usize::try_from(total_blocks.div_ceil(agsize)).expect("at most MAXAG");

        let above = agl2size - L2BPERDMAP;
        let aglevel = above / L2LPERCTL;
        let l2nl = above % L2LPERCTL;
        let agheight = l2nl >> 1;
        let agwidth = 1_u32 << (l2nl - (agheight << 1));
        let mut agstart = 0_u32;
        let mut n = 1_u32;
        for _ in 0..(5 - agheight) {
            agstart += n;
            n <<= 2;
        }
        Self {
            agl2size,
            agsize,
            num_ag,
            aglevel,
            l2nl,
            agheight,
            agwidth,
            agstart,
        }
    }

    fn ag_of(&self, addr: u64) -> usize {
        usize::try_from(addr >> self.agl2size).expect("AG index fits usize")
    }
}

// ---------------------------------------------------------------------------
// Page store
// ---------------------------------------------------------------------------

/// Read-through, write-back store for decoded map pages.
struct PageStore {
    dev: Arc<dyn BlockDevice>,
    geo: MapGeometry,
    dmaps: HashMap<u64, DmapPage>,
    dirty_dmaps: HashSet<u64>,
    ctls: HashMap<(u32, u64), DmapCtlPage>,
    dirty_ctls: HashSet<(u32, u64)>,
}

impl PageStore {
    fn dmap_mut(&mut self, di: u64) -> Result<&mut DmapPage> {
        if !self.dmaps.contains_key(&di) {
            let page_addr = BlockAddr(self.geo.dmap_page_index(di));
            let raw = self.dev.read_block(page_addr)?;
            let page = DmapPage::decode(raw.as_slice()).map_err(|e| LfsError::Corruption {
                block: page_addr.0,
                detail: format!("dmap {di}: {e}"),
            })?;
            self.dmaps.insert(di, page);
        }
        Ok(self.dmaps.get_mut(&di).expect("inserted above"))
    }

    fn ctl_mut(&mut self, level: u32, idx: u64) -> Result<&mut DmapCtlPage> {
        if !self.ctls.contains_key(&(level, idx)) {
            let page_addr = BlockAddr(self.geo.ctl_page_index(level, idx));
            let raw = self.dev.read_block(page_addr)?;
            let page = DmapCtlPage::decode(raw.as_slice()).map_err(|e| LfsError::Corruption {
                block: page_addr.0,
                detail: format!("dmapctl level {level} page {idx}: {e}"),
            })?;
            if page.level != level {
                return Err(LfsError::Corruption {
                    block: page_addr.0,
                    detail: format!("dmapctl claims level {}, expected {level}", page.level),
                });
            }
            self.ctls.insert((level, idx), page);
        }
        Ok(self.ctls.get_mut(&(level, idx)).expect("inserted above"))
    }

    fn flush(&mut self, control: &BmapControlPage) -> Result<()> {
        self.dev
            .write_block(BlockAddr(0), &control.encode())?;
        let dirty_ctls: Vec<(u32, u64)> = self.dirty_ctls.drain().collect();
        for (level, idx) in dirty_ctls {
            let page = self.ctls.get(&(level, idx)).expect("dirty page is resident");
            self.dev
                .write_block(BlockAddr(self.geo.ctl_page_index(level, idx)), &page.encode())?;
        }
        let dirty_dmaps: Vec<u64> = self.dirty_dmaps.drain().collect();
        for di in dirty_dmaps {
            let page = self.dmaps.get(&di).expect("dirty page is resident");
            self.dev
                .write_block(BlockAddr(self.geo.dmap_page_index(di)), &page.encode())?;
        }
        self.dev.sync()
    }
}

// ---------------------------------------------------------------------------
// Map state
// ---------------------------------------------------------------------------

struct BmapInner {
    ctl: BmapControlPage,
    store: PageStore,
    poisoned: Option<String>,
}

/// Observable allocator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BmapStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub num_ag: u32,
    pub agsize: u64,
    pub preferred_ag: u32,
}

/// A candidate chosen by a search pass, to be re-validated under the page
/// lock before mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Allocate inside this dmap (request smaller than a dmap).
    Dmap { di: u64 },
    /// Allocate a whole-dmap run starting here.
    Run { start_di: u64, count: u64 },
}

/// The block allocation map.
pub struct BlockMap {
    geo: MapGeometry,
    ag: AgGeometry,
    inner: Mutex<BmapInner>,
    ag_locks: Vec<Mutex<()>>,
    ag_active: Vec<AtomicU32>,
}

impl std::fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMap")
            .field("total_blocks", &self.geo.total_blocks)
            .field("num_ag", &self.ag.num_ag)
            .finish_non_exhaustive()
    }
}

/// RAII marker of an active writer in an allocation group; `next_ag` skips
/// groups with live writers to spread contention.
pub struct ActiveAg<'a> {
    map: &'a BlockMap,
    ag: usize,
}

impl Drop for ActiveAg<'_> {
    fn drop(&mut self) {
        self.map.ag_active[self.ag].fetch_sub(1, Ordering::AcqRel);
    }
}

impl BlockMap {
    // ── format / open ───────────────────────────────────────────────────────

    /// Map-region pages needed on the backing device for `total_blocks`.
    pub fn required_device_blocks(total_blocks: u64) -> Result<u64> {
        Ok(MapGeometry::derive(total_blocks)?.region_pages())
    }

    /// Write a fresh, fully-free map for `total_blocks` onto `dev`.
    pub fn format(dev: &dyn BlockDevice, total_blocks: u64) -> Result<()> {
        let geo = MapGeometry::derive(total_blocks)?;
        let ag = AgGeometry::derive(total_blocks);
        if u64::from(dev.block_size()) != PSIZE as u64 {
            return Err(LfsError::InvalidGeometry(format!(
                "map device block size {} != {PSIZE}",
                dev.block_size()
            )));
        }
        if dev.block_count() < geo.region_pages() {
            return Err(LfsError::InvalidGeometry(format!(
                "map needs {} pages, device holds {}",
                geo.region_pages(),
                dev.block_count()
            )));
        }

        // Dmaps first, collecting their roots for the control stack.
        let mut child_values: Vec<i8> = Vec::with_capacity(
            usize::try_from(geo.ndmaps).expect("dmap count fits usize"),
        );
        for di in 0..geo.ndmaps {
            let page = DmapPage::format(BlockAddr(di * BPERDMAP), geo.dmap_blocks(di));
            child_values.push(page.tree.root());
            dev.write_block(BlockAddr(geo.dmap_page_index(di)), &page.encode())?;
        }

        // Control levels bottom-up, merging fully-free children into larger
        // buddies exactly as the incremental join would.
        for level in 0..=geo.maxlevel {
            let mut next_values = Vec::new();
            for idx in 0..geo.nctl[level as usize] {
                let mut page = DmapCtlPage::format(level);
                let mut leaves = vec![NOFREE; LPERCTL];
                let base = usize::try_from(idx).expect("ctl index fits usize") * LPERCTL;
                for (slot, value) in leaves.iter_mut().zip(child_values.iter().skip(base)) {
                    *slot = *value;
                }
                SummaryTree::merge_buddies(&mut leaves, page.tree.budmin());
                page.tree.rebuild(&leaves);
                next_values.push(page.tree.root());
                dev.write_block(BlockAddr(geo.ctl_page_index(level, idx)), &page.encode())?;
            }
            child_values = next_values;
        }

        // Control page: everything free, spread over the AGs.
        let mut ag_free = [0_u64; MAXAG];
        for (k, slot) in ag_free.iter_mut().enumerate().take(ag.num_ag) {
            let start = k as u64 * ag.agsize;
            *slot = (total_blocks - start).min(ag.agsize);
        }
        let control = BmapControlPage {
            total_blocks,
            free_blocks: total_blocks,
            agsize: ag.agsize,
            agl2size: ag.agl2size,
            num_ag: u32::try_from(ag.num_ag).expect("at most MAXAG"),
            maxlevel: geo.maxlevel,
            agpref: 0,
            aglevel: ag.aglevel,
            agheight: ag.agheight,
            agwidth: ag.agwidth,
            agstart: ag.agstart,
            ag_free,
        };
        dev.write_block(BlockAddr(0), &control.encode())?;
        dev.sync()?;

        tracing::info!(
            target: "lfs::bmap",
            total_blocks,
            ndmaps = geo.ndmaps,
            maxlevel = geo.maxlevel,
            num_ag = ag.num_ag,
            agsize = ag.agsize,
            "bmap_format"
        );
        Ok(())
    }

    /// Open an existing map, validating its control page against the device
    /// and the derived geometry.
    pub fn open(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        if u64::from(dev.block_size()) != PSIZE as u64 {
            return Err(LfsError::InvalidGeometry(format!(
                "map device block size {} != {PSIZE}",
                dev.block_size()
            )));
        }
        let raw = dev.read_block(BlockAddr(0))?;
        let ctl = BmapControlPage::decode(raw.as_slice())
            .map_err(|e| LfsError::Format(format!("bmap control page: {e}")))?;

        let geo = MapGeometry::derive(ctl.total_blocks)?;
        let ag = AgGeometry::derive(ctl.total_blocks);
        if ctl.agsize != ag.agsize
            || ctl.maxlevel != geo.maxlevel
            || usize::try_from(ctl.num_ag).expect("validated") != ag.num_ag
            || ctl.aglevel != ag.aglevel
            || ctl.agheight != ag.agheight
            || ctl.agwidth != ag.agwidth
            || ctl.agstart != ag.agstart
        {
            return Err(LfsError::Format(
                "bmap control page geometry does not match derived geometry".into(),
            ));
        }
        if dev.block_count() < geo.region_pages() {
            return Err(LfsError::InvalidGeometry(format!(
                "map needs {} pages, device holds {}",
                geo.region_pages(),
                dev.block_count()
            )));
        }

        let num_ag = ag.num_ag;
        Ok(Self {
            geo,
            ag,
            inner: Mutex::new(BmapInner {
                ctl,
                store: PageStore {
                    dev,
                    geo,
                    dmaps: HashMap::new(),
                    dirty_dmaps: HashSet::new(),
                    ctls: HashMap::new(),
                    dirty_ctls: HashSet::new(),
                },
                poisoned: None,
            }),
            ag_locks: (0..num_ag).map(|_| Mutex::new(())).collect(),
            ag_active: (0..num_ag).map(|_| AtomicU32::new(0)).collect(),
        })
    }

    // ── observability ───────────────────────────────────────────────────────

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.geo.total_blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.inner.lock().ctl.free_blocks
    }

    #[must_use]
    pub fn ag_free(&self, ag: AgNumber) -> u64 {
        self.inner.lock().ctl.ag_free[ag.0 as usize]
    }

    #[must_use]
    pub fn stats(&self) -> BmapStats {
        let inner = self.inner.lock();
        BmapStats {
            total_blocks: inner.ctl.total_blocks,
            free_blocks: inner.ctl.free_blocks,
            num_ag: inner.ctl.num_ag,
            agsize: inner.ctl.agsize,
            preferred_ag: inner.ctl.agpref,
        }
    }

    /// Allocation group of a block address.
    #[must_use]
    pub fn ag_of(&self, addr: BlockAddr) -> AgNumber {
        AgNumber(u32::try_from(self.ag.ag_of(addr.0)).expect("at most MAXAG"))
    }

    /// Mark an AG as hosting an active writer until the guard drops.
    #[must_use]
    pub fn start_writer(&self, ag: AgNumber) -> ActiveAg<'_> {
        let idx = ag.0 as usize;
        self.ag_active[idx].fetch_add(1, Ordering::AcqRel);
        ActiveAg { map: self, ag: idx }
    }

    /// Verify a dmap's incrementally-maintained tree against a from-scratch
    /// rebuild off its bitmap (scrub / test hook).
    pub fn check_dmap(&self, di: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let dp = inner.store.dmap_mut(di)?;
        Ok(dp.recompute_tree() == dp.tree)
    }

    // ── error latching ──────────────────────────────────────────────────────

    fn check_ok(inner: &BmapInner) -> Result<()> {
        if let Some(detail) = &inner.poisoned {
            return Err(LfsError::Corruption {
                block: 0,
                detail: format!("allocation map poisoned: {detail}"),
            });
        }
        Ok(())
    }

    /// Latch corruption: after the first inconsistency the map refuses all
    /// further service until an offline check.
    fn latch<T>(inner: &mut BmapInner, res: Result<T>) -> Result<T> {
        if let Err(LfsError::Corruption { detail, .. }) = &res {
            if inner.poisoned.is_none() {
                tracing::error!(target: "lfs::bmap", detail = %detail, "bmap_poisoned");
                inner.poisoned = Some(detail.clone());
            }
        }
        res
    }

    fn bits_err(&self, di: u64, e: &BitsError) -> LfsError {
        LfsError::Corruption {
            block: self.geo.dmap_page_index(di),
            detail: e.to_string(),
        }
    }

    fn tree_err(&self, level: u32, idx: u64, e: &TreeError) -> LfsError {
        LfsError::Corruption {
            block: self.geo.ctl_page_index(level, idx),
            detail: e.to_string(),
        }
    }

    // ── counters ────────────────────────────────────────────────────────────

    fn debit(&self, inner: &mut BmapInner, addr: u64, nblocks: u64) {
        inner.ctl.free_blocks -= nblocks;
        self.walk_ag_spans(addr, nblocks, |ag, n| {
            inner.ctl.ag_free[ag] -= n;
        });
    }

    fn credit(&self, inner: &mut BmapInner, addr: u64, nblocks: u64) {
        inner.ctl.free_blocks += nblocks;
        self.walk_ag_spans(addr, nblocks, |ag, n| {
            inner.ctl.ag_free[ag] += n;
        });
    }

    fn walk_ag_spans(&self, addr: u64, nblocks: u64, mut f: impl FnMut(usize, u64)) {
        let mut cur = addr;
        let end = addr + nblocks;
        while cur < end {
            let ag = self.ag.ag_of(cur);
            let ag_end = (cur | (self.ag.agsize - 1)) + 1;
            let n = end.min(ag_end) - cur;
            f(ag, n);
            cur += n;
        }
    }

    // ── control-tree propagation ────────────────────────────────────────────

    /// Propagate a changed child root up the dmapctl stack. `child` is the
    /// child index at `level` (dmap index for level 0).
    fn adjust_ctl(
        &self,
        inner: &mut BmapInner,
        mut child: u64,
        mut level: u32,
        mut newval: i8,
        alloc: bool,
    ) -> Result<()> {
        loop {
            let page_idx = child / LPERCTL as u64;
            let leafno = usize::try_from(child % LPERCTL as u64).expect("leaf fits usize");
            let page = inner.store.ctl_mut(level, page_idx)?;
            let oldroot = page.tree.root();

            if alloc {
                if page.tree.leaf(leafno) == NOFREE {
                    page.tree
                        .back_split(leafno)
                        .map_err(|e| self.tree_err(level, page_idx, &e))?;
                }
                let budmin = page.tree.budmin();
                page.tree.split(leafno, budmin, newval);
            } else {
                page.tree
                    .join(leafno, newval)
                    .map_err(|e| self.tree_err(level, page_idx, &e))?;
            }
            let newroot = page.tree.root();
            inner.store.dirty_ctls.insert((level, page_idx));

            if newroot == oldroot || level == self.geo.maxlevel {
                return Ok(());
            }
            child = page_idx;
            newval = newroot;
            level += 1;
        }
    }

    // ── dmap mutation wrappers ──────────────────────────────────────────────

    /// Allocate bits in one dmap and propagate the root change. The caller
    /// owns the dmap's page.
    fn alloc_dmap(&self, inner: &mut BmapInner, di: u64, addr: u64, nblocks: u64) -> Result<()> {
        let (oldroot, newroot) = {
            let dp = inner.store.dmap_mut(di)?;
            let oldroot = dp.tree.root();
            alloc_bits(dp, addr, nblocks).map_err(|e| self.bits_err(di, &e))?;
            (oldroot, dp.tree.root())
        };
        inner.store.dirty_dmaps.insert(di);
        if newroot != oldroot {
            self.adjust_ctl(inner, di, 0, newroot, true)?;
        }
        self.debit(inner, addr, nblocks);
        Ok(())
    }

    /// Free bits in one dmap and propagate the root change.
    fn free_dmap(&self, inner: &mut BmapInner, di: u64, addr: u64, nblocks: u64) -> Result<()> {
        let (oldroot, newroot) = {
            let dp = inner.store.dmap_mut(di)?;
            let oldroot = dp.tree.root();
            free_bits(dp, addr, nblocks).map_err(|e| self.bits_err(di, &e))?;
            (oldroot, dp.tree.root())
        };
        inner.store.dirty_dmaps.insert(di);
        if newroot != oldroot {
            self.adjust_ctl(inner, di, 0, newroot, false)?;
        }
        self.credit(inner, addr, nblocks);
        Ok(())
    }

    // ── search ──────────────────────────────────────────────────────────────

    /// Walk control levels `level..=0` from the page covering `blkno`,
    /// picking at each the leftmost child of order >= `l2nb`. `promised`
    /// marks descents whose entry level was already vouched for by a parent
    /// (a miss there is corruption, not scarcity).
    fn find_ctl(
        &self,
        inner: &mut BmapInner,
        l2nb: i8,
        level: u32,
        mut blkno: u64,
        mut promised: bool,
    ) -> Result<Option<u64>> {
        let mut lv = i64::from(level);
        while lv >= 0 {
            let level = u32::try_from(lv).expect("level in 0..=2");
            let child_span = L2BPERDMAP + level * L2LPERCTL;
            let page_idx = blkno >> (child_span + L2LPERCTL);
            let page = inner.store.ctl_mut(level, page_idx)?;
            match page
                .tree
                .find_leaf(l2nb)
                .map_err(|e| self.tree_err(level, page_idx, &e))?
            {
                Some(leafno) => {
                    blkno = (page_idx * LPERCTL as u64 + leafno as u64) << child_span;
                }
                None if promised => {
                    return Err(LfsError::Corruption {
                        block: self.geo.ctl_page_index(level, page_idx),
                        detail: format!(
                            "parent promised order {l2nb} but level {level} page {page_idx} denies it"
                        ),
                    });
                }
                None => return Ok(None),
            }
            promised = true;
            lv -= 1;
        }
        Ok(Some(blkno))
    }

    fn target_for(&self, blkno: u64, nblocks: u64, l2nb: i8) -> Target {
        let di = blkno >> L2BPERDMAP;
        if l2nb >= L2BPERDMAP as i8 {
            Target::Run {
                start_di: di,
                count: nblocks.div_ceil(BPERDMAP),
            }
        } else {
            Target::Dmap { di }
        }
    }

    /// Select a target anywhere in the map.
    fn select_any(&self, inner: &mut BmapInner, nblocks: u64, l2nb: i8) -> Result<Option<Target>> {
        match self.find_ctl(inner, l2nb, self.geo.maxlevel, 0, false)? {
            Some(blkno) => Ok(Some(self.target_for(blkno, nblocks, l2nb))),
            None => Ok(None),
        }
    }

    /// Select a target inside one allocation group, via the AG's subtree
    /// roots in the level-`aglevel` dmapctl.
    fn select_in_ag(
        &self,
        inner: &mut BmapInner,
        agno: usize,
        nblocks: u64,
        l2nb: i8,
    ) -> Result<Option<Target>> {
        if inner.ctl.ag_free[agno] < nblocks {
            return Ok(None);
        }

        let ag = &self.ag;
        let ags_per_page = LPERCTL >> ag.l2nl;
        let page_idx = (agno / ags_per_page) as u64;
        let ti0 = ag.agstart as usize + ag.agwidth as usize * (agno % ags_per_page);

        for w in 0..ag.agwidth as usize {
            let page = inner.store.ctl_mut(ag.aglevel, page_idx)?;
            let found = page
                .tree
                .find_leaf_from(ti0 + w, l2nb)
                .map_err(|e| self.tree_err(ag.aglevel, page_idx, &e))?;
            let Some(leafno) = found else { continue };

            let child = page_idx * LPERCTL as u64 + leafno as u64;
            let child_span = L2BPERDMAP + ag.aglevel * L2LPERCTL;
            let blkno = child << child_span;
            let resolved = if ag.aglevel == 0 {
                Some(blkno)
            } else {
                // Descend the lower control levels inside the chosen child.
                self.find_ctl(inner, l2nb, ag.aglevel - 1, blkno, true)?
            };
            if let Some(blkno) = resolved {
                return Ok(Some(self.target_for(blkno, nblocks, l2nb)));
            }
        }
        Ok(None)
    }

    // ── mutation under a locked target ──────────────────────────────────────

    /// Allocate inside a locked dmap via its summary tree. `None` means the
    /// dmap no longer has a fitting buddy (candidate went stale).
    fn commit_dmap_target(
        &self,
        inner: &mut BmapInner,
        di: u64,
        nblocks: u64,
        l2nb: i8,
    ) -> Result<Option<u64>> {
        let addr = {
            let dp = inner.store.dmap_mut(di)?;
            let found = dp
                .tree
                .find_leaf(l2nb)
                .map_err(|e| self.bits_err(di, &BitsError::Tree(e)))?;
            let Some(leafno) = found else {
                return Ok(None);
            };
            let mut off = (leafno as u64) << L2DBWORD;
            if dp.tree.leaf(leafno) < BUDMIN_DMAP {
                let bit = find_bits(
                    dp.wmap[leafno],
                    u32::from(u8::try_from(l2nb.max(0)).expect("small order")),
                )
                .ok_or_else(|| LfsError::Corruption {
                    block: self.geo.dmap_page_index(di),
                    detail: format!("leaf {leafno} promises order {l2nb} but word denies it"),
                })?;
                off += u64::from(bit);
            }
            dp.start.0 + off
        };
        self.alloc_dmap(inner, di, addr, nblocks)?;
        Ok(Some(addr))
    }

    /// Allocate a whole-dmap run, backing out on mid-run failure.
    fn commit_run_target(
        &self,
        inner: &mut BmapInner,
        start_di: u64,
        count: u64,
        nblocks: u64,
    ) -> Result<Option<u64>> {
        // Re-validate the run is still fully free.
        for i in 0..count {
            let need = (nblocks - i * BPERDMAP).min(BPERDMAP);
            let dp = inner.store.dmap_mut(start_di + i)?;
            let whole = need == BPERDMAP;
            let ok = if whole {
                dp.tree.root() == L2BPERDMAP as i8
            } else {
                dp.nfree == dp.nblocks && u64::from(dp.nblocks) >= need
            };
            if !ok {
                return Ok(None);
            }
        }

        let start = start_di * BPERDMAP;
        for i in 0..count {
            let addr = start + i * BPERDMAP;
            let need = (nblocks - i * BPERDMAP).min(BPERDMAP);
            if let Err(e) = self.alloc_dmap(inner, start_di + i, addr, need) {
                // Unwind the dmaps already taken before surfacing the error.
                for j in 0..i {
                    let back = start + j * BPERDMAP;
                    let freed = (nblocks - j * BPERDMAP).min(BPERDMAP);
                    if let Err(undo) = self.free_dmap(inner, start_di + j, back, freed) {
                        tracing::error!(
                            target: "lfs::bmap",
                            di = start_di + j,
                            error = %undo,
                            "run_backout_failed"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(Some(start))
    }

    // ── target locking helpers ──────────────────────────────────────────────

    fn dmap_page_addr(&self, di: u64) -> BlockAddr {
        BlockAddr(self.geo.dmap_page_index(di))
    }

    fn lock_target(&self, txn: &TxnManager, tid: TxId, target: Target) -> Result<()> {
        match target {
            Target::Dmap { di } => txn.lock_page(tid, BMAP_INODE, self.dmap_page_addr(di)),
            Target::Run { start_di, count } => {
                for di in start_di..start_di + count {
                    txn.lock_page(tid, BMAP_INODE, self.dmap_page_addr(di))?;
                }
                Ok(())
            }
        }
    }

    fn register_alloc(
        &self,
        txn: &TxnManager,
        tid: TxId,
        addr: u64,
        nblocks: u64,
    ) -> Result<()> {
        // One delta per covered dmap, attached to that dmap's maplock.
        let mut cur = addr;
        let end = addr + nblocks;
        while cur < end {
            let di = cur >> L2BPERDMAP;
            let dmap_end = (di + 1) * BPERDMAP;
            let n = end.min(dmap_end) - cur;
            txn.add_map_delta(
                tid,
                BMAP_INODE,
                self.dmap_page_addr(di),
                MapDelta {
                    op: MapRecordOp::Alloc,
                    view: MapView::Persistent,
                    addr: BlockAddr(cur),
                    nblocks: n,
                },
            )?;
            cur += n;
        }
        Ok(())
    }

    // ── allocation strategies ───────────────────────────────────────────────

    /// Fast paths against the hint's dmap: the run immediately at the hint,
    /// a few leaves around it, then anywhere in that dmap.
    fn try_hint(
        &self,
        txn: &TxnManager,
        tid: TxId,
        hint: BlockAddr,
        nblocks: u64,
        l2nb: i8,
    ) -> Result<Option<u64>> {
        let di = hint.0 >> L2BPERDMAP;
        txn.lock_page(tid, BMAP_INODE, self.dmap_page_addr(di))?;

        let mut inner = self.inner.lock();
        Self::check_ok(&inner)?;
        let res = self.try_hint_locked(&mut inner, di, hint.0, nblocks, l2nb);
        Self::latch(&mut inner, res)
    }

    fn try_hint_locked(
        &self,
        inner: &mut BmapInner,
        di: u64,
        hint: u64,
        nblocks: u64,
        l2nb: i8,
    ) -> Result<Option<u64>> {
        // alloc_next: the exact run at the hint.
        if hint + nblocks <= (di + 1) * BPERDMAP
            && self.run_state_is(inner, di, hint, nblocks, false)?
        {
            self.alloc_dmap(inner, di, hint, nblocks)?;
            tracing::trace!(target: "lfs::bmap", hint, nblocks, "alloc_next");
            return Ok(Some(hint));
        }

        // alloc_near: scan a few leaves around the hint's word.
        if let Some(addr) = self.alloc_near(inner, di, hint, nblocks, l2nb)? {
            tracing::trace!(target: "lfs::bmap", hint, addr, nblocks, "alloc_near");
            return Ok(Some(addr));
        }

        // Anywhere in the hint's dmap.
        self.commit_dmap_target(inner, di, nblocks, l2nb)
    }

    /// Whether every working-map bit of the run matches `allocated`.
    fn run_state_is(
        &self,
        inner: &mut BmapInner,
        di: u64,
        addr: u64,
        nblocks: u64,
        allocated: bool,
    ) -> Result<bool> {
        let dp = inner.store.dmap_mut(di)?;
        let Some(off) = addr.checked_sub(dp.start.0) else {
            return Ok(false);
        };
        if off + nblocks > u64::from(dp.nblocks) {
            return Ok(false);
        }
        let mut bit = u32::try_from(off).expect("dmap offset");
        let mut rem = u32::try_from(nblocks).expect("single-dmap count");
        while rem > 0 {
            let word = (bit >> L2DBWORD) as usize;
            let wbit = bit & 31;
            let nb = rem.min(32 - wbit);
            let mask = word_mask(wbit, nb);
            let expect = if allocated { mask } else { 0 };
            if dp.wmap[word] & mask != expect {
                return Ok(false);
            }
            bit += nb;
            rem -= nb;
        }
        Ok(true)
    }

    fn alloc_near(
        &self,
        inner: &mut BmapInner,
        di: u64,
        hint: u64,
        nblocks: u64,
        l2nb: i8,
    ) -> Result<Option<u64>> {
        if l2nb >= L2BPERDMAP as i8 {
            return Ok(None);
        }
        let addr = {
            let dp = inner.store.dmap_mut(di)?;
            let word0 = ((hint - dp.start.0) >> L2DBWORD) as usize;
            let mut found = None;
            for leafno in word0..(word0 + 4).min(dp.tree.nleafs()) {
                if dp.tree.leaf(leafno) < l2nb {
                    continue;
                }
                let mut off = (leafno as u64) << L2DBWORD;
                if dp.tree.leaf(leafno) < BUDMIN_DMAP {
                    let Some(bit) = find_bits(
                        dp.wmap[leafno],
                        u32::from(u8::try_from(l2nb.max(0)).expect("small order")),
                    ) else {
                        return Err(LfsError::Corruption {
                            block: self.geo.dmap_page_index(di),
                            detail: format!(
                                "leaf {leafno} promises order {l2nb} but word denies it"
                            ),
                        });
                    };
                    off += u64::from(bit);
                }
                found = Some(dp.start.0 + off);
                break;
            }
            match found {
                Some(a) => a,
                None => return Ok(None),
            }
        };
        self.alloc_dmap(inner, di, addr, nblocks)?;
        Ok(Some(addr))
    }

    /// One optimistic pass of "select, lock, re-validate, mutate" for a
    /// given selector.
    fn alloc_via(
        &self,
        txn: &TxnManager,
        tid: TxId,
        nblocks: u64,
        l2nb: i8,
        mut select: impl FnMut(&mut BmapInner) -> Result<Option<Target>>,
    ) -> Result<Option<u64>> {
        for attempt in 0..ALLOC_RETRIES {
            let target = {
                let mut inner = self.inner.lock();
                Self::check_ok(&inner)?;
                let res = select(&mut inner);
                match Self::latch(&mut inner, res)? {
                    Some(t) => t,
                    None => return Ok(None),
                }
            };

            self.lock_target(txn, tid, target)?;

            let committed = {
                let mut inner = self.inner.lock();
                Self::check_ok(&inner)?;
                let res = match target {
                    Target::Dmap { di } => self.commit_dmap_target(&mut inner, di, nblocks, l2nb),
                    Target::Run { start_di, count } => {
                        self.commit_run_target(&mut inner, start_di, count, nblocks)
                    }
                };
                Self::latch(&mut inner, res)?
            };

            match committed {
                Some(addr) => {
                    self.register_alloc(txn, tid, addr, nblocks)?;
                    return Ok(Some(addr));
                }
                None => {
                    tracing::debug!(
                        target: "lfs::bmap",
                        attempt,
                        nblocks,
                        "alloc_candidate_stale"
                    );
                }
            }
        }
        tracing::warn!(
            target: "lfs::bmap",
            nblocks,
            retries = ALLOC_RETRIES,
            "alloc_retries_exhausted"
        );
        Ok(None)
    }

    /// Round-robin to a non-busy AG with above-average free space.
    fn next_ag(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = self.ag.num_ag;
        let avg = inner.ctl.free_blocks / n as u64;
        let pref = inner.ctl.agpref as usize;

        if self.ag_active[pref].load(Ordering::Acquire) == 0 && inner.ctl.ag_free[pref] >= avg {
            return pref;
        }

        let mut best: Option<(usize, u64)> = None;
        for i in 0..n {
            let ag = (pref + i) % n;
            if self.ag_active[ag].load(Ordering::Acquire) != 0 {
                continue;
            }
            let free = inner.ctl.ag_free[ag];
            if free >= avg {
                inner.ctl.agpref = u32::try_from(ag).expect("at most MAXAG");
                return ag;
            }
            if best.is_none_or(|(_, b)| free > b) {
                best = Some((ag, free));
            }
        }
        match best {
            Some((ag, _)) => {
                inner.ctl.agpref = u32::try_from(ag).expect("at most MAXAG");
                ag
            }
            None => pref,
        }
    }

    // ── public contract ─────────────────────────────────────────────────────

    /// Allocate `nblocks` contiguous blocks inside transaction `tid`.
    ///
    /// The working map is updated before return; the persistent map follows
    /// once the transaction commits durably. A failure at this size is
    /// final here — retrying smaller is the caller's decision, never an
    /// automatic downgrade.
    pub fn alloc(
        &self,
        txn: &TxnManager,
        tid: TxId,
        hint: Option<BlockAddr>,
        nblocks: u64,
    ) -> Result<BlockAddr> {
        if nblocks == 0 {
            return Err(LfsError::Format("cannot allocate 0 blocks".into()));
        }
        let l2nb = i8::try_from(ceil_log2(nblocks)).expect("order fits i8");

        // Fail fast when no free buddy anywhere can hold the request.
        {
            let mut inner = self.inner.lock();
            Self::check_ok(&inner)?;
            let top = inner.store.ctl_mut(self.geo.maxlevel, 0)?.tree.root();
            if top < l2nb {
                return Err(LfsError::NoSpace);
            }
        }

        // Hint fast paths, for requests that fit one dmap.
        if let Some(hint) = hint {
            if hint.0 + nblocks <= self.geo.total_blocks
                && nblocks <= BPERDMAP
                && self.ag_free(self.ag_of(hint)) >= nblocks
            {
                if let Some(addr) = self.try_hint(txn, tid, hint, nblocks, l2nb)? {
                    self.register_alloc(txn, tid, addr, nblocks)?;
                    tracing::debug!(target: "lfs::bmap", tid = tid.0, addr, nblocks, "alloc_hint");
                    return Ok(BlockAddr(addr));
                }
            }
        }

        // AG-affine paths for requests no larger than one AG.
        if nblocks <= self.ag.agsize {
            let ag0 = match hint {
                Some(h) if h.0 < self.geo.total_blocks => self.ag.ag_of(h.0),
                _ => self.inner.lock().ctl.agpref as usize,
            };
            let ag_order = {
                let ag1 = self.next_ag();
                if ag1 == ag0 { vec![ag0] } else { vec![ag0, ag1] }
            };
            for agno in ag_order {
                let _ag_guard = self.ag_locks[agno].lock();
                if let Some(addr) = self.alloc_via(txn, tid, nblocks, l2nb, |inner| {
                    self.select_in_ag(inner, agno, nblocks, l2nb)
                })? {
                    tracing::debug!(
                        target: "lfs::bmap",
                        tid = tid.0,
                        addr,
                        nblocks,
                        ag = agno,
                        "alloc_ag"
                    );
                    return Ok(BlockAddr(addr));
                }
            }
        }

        // Anywhere at all.
        if let Some(addr) = self.alloc_via(txn, tid, nblocks, l2nb, |inner| {
            self.select_any(inner, nblocks, l2nb)
        })? {
            tracing::debug!(target: "lfs::bmap", tid = tid.0, addr, nblocks, "alloc_any");
            return Ok(BlockAddr(addr));
        }
        Err(LfsError::NoSpace)
    }

    /// Free `nblocks` starting at `addr` inside transaction `tid`.
    ///
    /// No bitmap is touched here: the free is queued as deltas against both
    /// views and applied when the transaction's log records are durable, so
    /// the blocks stay unavailable until the free cannot be lost.
    pub fn free(&self, txn: &TxnManager, tid: TxId, addr: BlockAddr, nblocks: u64) -> Result<()> {
        if nblocks == 0 || addr.0 + nblocks > self.geo.total_blocks {
            return Err(LfsError::Format(format!(
                "free of {nblocks} blocks at {} is out of range",
                addr.0
            )));
        }

        let mut cur = addr.0;
        let end = addr.0 + nblocks;
        while cur < end {
            let di = cur >> L2BPERDMAP;
            let dmap_end = (di + 1) * BPERDMAP;
            let n = end.min(dmap_end) - cur;

            txn.lock_page(tid, BMAP_INODE, self.dmap_page_addr(di))?;
            {
                let mut inner = self.inner.lock();
                Self::check_ok(&inner)?;
                // The blocks must be allocated in the working view now; a
                // mismatch means a double free or cross-view confusion.
                let res = self
                    .run_state_is(&mut inner, di, cur, n, true)
                    .and_then(|allocated| {
                        if allocated {
                            Ok(())
                        } else {
                            Err(LfsError::Corruption {
                                block: self.geo.dmap_page_index(di),
                                detail: format!("freeing not-allocated blocks at {cur}+{n}"),
                            })
                        }
                    });
                Self::latch(&mut inner, res)?;
            }
            txn.add_map_delta(
                tid,
                BMAP_INODE,
                self.dmap_page_addr(di),
                MapDelta {
                    op: MapRecordOp::Free,
                    view: MapView::Both,
                    addr: BlockAddr(cur),
                    nblocks: n,
                },
            )?;
            cur += n;
        }
        tracing::debug!(target: "lfs::bmap", tid = tid.0, addr = addr.0, nblocks, "free_queued");
        Ok(())
    }

    /// Grow an extent in place: allocate `extra` blocks immediately after
    /// `addr + nblocks`. Fails with `NoSpace` when the following blocks are
    /// taken or the extension would cross a dmap boundary (the caller then
    /// reallocates elsewhere).
    pub fn extend(
        &self,
        txn: &TxnManager,
        tid: TxId,
        addr: BlockAddr,
        nblocks: u64,
        extra: u64,
    ) -> Result<()> {
        if extra == 0 {
            return Err(LfsError::Format("cannot extend by 0 blocks".into()));
        }
        let ext_start = addr.0 + nblocks;
        let di = ext_start >> L2BPERDMAP;
        if ext_start + extra > self.geo.total_blocks || ext_start + extra > (di + 1) * BPERDMAP {
            return Err(LfsError::NoSpace);
        }

        txn.lock_page(tid, BMAP_INODE, self.dmap_page_addr(di))?;
        {
            let mut inner = self.inner.lock();
            Self::check_ok(&inner)?;
            let res = self
                .run_state_is(&mut inner, di, ext_start, extra, false)
                .and_then(|free| {
                    if free {
                        self.alloc_dmap(&mut inner, di, ext_start, extra)
                    } else {
                        Err(LfsError::NoSpace)
                    }
                });
            Self::latch(&mut inner, res)?;
        }
        self.register_alloc(txn, tid, ext_start, extra)?;
        tracing::debug!(
            target: "lfs::bmap",
            tid = tid.0,
            addr = addr.0,
            nblocks,
            extra,
            "extend"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commit pipeline sink
// ---------------------------------------------------------------------------

impl MapSink for BlockMap {
    /// Apply one durable (or abort-undo) delta.
    ///
    /// Alloc deltas advance the persistent map; free deltas perform the
    /// deferred working-map free (join + counters) and clear the persistent
    /// map; abort undos free the working map only.
    fn apply_delta(&self, delta: &MapDelta) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_ok(&inner)?;

        let res = (|| {
            let mut cur = delta.addr.0;
            let end = delta.addr.0 + delta.nblocks;
            while cur < end {
                let di = cur >> L2BPERDMAP;
                let dmap_end = (di + 1) * BPERDMAP;
                let n = end.min(dmap_end) - cur;

                match (delta.op, delta.view) {
                    (MapRecordOp::Alloc, MapView::Persistent) => {
                        let dp = inner.store.dmap_mut(di)?;
                        update_pmap(dp, true, cur, n).map_err(|e| self.bits_err(di, &e))?;
                        inner.store.dirty_dmaps.insert(di);
                    }
                    (MapRecordOp::Free, MapView::Both) => {
                        self.free_dmap(&mut inner, di, cur, n)?;
                        let dp = inner.store.dmap_mut(di)?;
                        update_pmap(dp, false, cur, n).map_err(|e| self.bits_err(di, &e))?;
                        inner.store.dirty_dmaps.insert(di);
                    }
                    (MapRecordOp::Free, MapView::Working) => {
                        self.free_dmap(&mut inner, di, cur, n)?;
                    }
                    (op, view) => {
                        return Err(LfsError::Format(format!(
                            "unsupported map delta {op:?}/{view:?}"
                        )));
                    }
                }
                cur += n;
            }
            Ok(())
        })();
        Self::latch(&mut inner, res)
    }

    /// Push the control page and every dirty map page to the device
    /// (checkpoint support).
    fn flush_home(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_ok(&inner)?;
        let control = inner.ctl.clone();
        let res = inner.store.flush(&control);
        Self::latch(&mut inner, res)
    }
}
