//! Allocation-map pages: dmap leaves, dmapctl control pages, and the bmap
//! control page.
//!
//! A dmap page carries two bitmaps over the same `BPERDMAP` blocks:
//!
//! - `wmap` — the *working* map, reflecting in-memory (possibly uncommitted)
//!   allocation state. The embedded summary tree always describes `wmap`.
//! - `pmap` — the *persistent* map, advanced only after the corresponding
//!   log records are durable.
//!
//! Bit ordering: within a word, the most-significant bit is the
//! lowest-numbered block; a set bit is an allocated block.
//!
//! All pages are `PSIZE` bytes on disk, little-endian, with explicit
//! `encode()`/`decode()`. Page layouts are documented inline at each codec.

use crate::tree::{SummaryTree, max_bud_word};
use lfs_types::{
    BMAP_MAGIC, BMAP_VERSION, BPERDMAP, BlockAddr, DBWORD, LPERDMAP, MAXAG, PSIZE, ParseError,
    read_le_u32, read_le_u64,
};

/// All-ones bitmap word (fully allocated).
pub const ONES: u32 = u32::MAX;

/// Mask covering `nb` bits starting at bit `wbitno` of a word (MSB-first,
/// `1 <= nb <= 32 - wbitno`).
#[must_use]
pub fn word_mask(wbitno: u32, nb: u32) -> u32 {
    (ONES << (DBWORD - nb)) >> wbitno
}

// ── Dmap leaf page ──────────────────────────────────────────────────────────

/// One leaf page of the block allocation map, covering up to `BPERDMAP`
/// blocks starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmapPage {
    /// First block described by this page.
    pub start: BlockAddr,
    /// Blocks actually described (< `BPERDMAP` only in the last dmap).
    pub nblocks: u32,
    /// Free blocks in the working map.
    pub nfree: u32,
    /// Working bitmap.
    pub wmap: [u32; LPERDMAP],
    /// Persistent bitmap.
    pub pmap: [u32; LPERDMAP],
    /// Summary tree over `wmap`.
    pub tree: SummaryTree,
}

// Field offsets within the encoded page:
//   +0    u32 nblocks
//   +4    u32 nfree
//   +8    u64 start
//   +16   summary tree (17 + 341 bytes), padded to +376
//   +376  u32 wmap[256]
//   +1400 u32 pmap[256]
//   +2424 zero padding to PSIZE
const DMAP_TREE_OFF: usize = 16;
const DMAP_WMAP_OFF: usize = 376;
const DMAP_PMAP_OFF: usize = DMAP_WMAP_OFF + 4 * LPERDMAP;

impl DmapPage {
    /// Build a freshly formatted dmap: the first `nblocks` blocks free, the
    /// tail beyond `nblocks` (in a short last dmap) pinned as allocated in
    /// both maps so it can never be handed out.
    #[must_use]
    pub fn format(start: BlockAddr, nblocks: u32) -> Self {
        assert!(u64::from(nblocks) <= BPERDMAP, "dmap covers at most BPERDMAP blocks");

        let mut wmap = [0_u32; LPERDMAP];
        for (word, slot) in wmap.iter_mut().enumerate() {
            let bit0 = u32::try_from(word).expect("word index fits u32") * DBWORD;
            if bit0 >= nblocks {
                *slot = ONES;
            } else if nblocks - bit0 < DBWORD {
                *slot = !word_mask(0, nblocks - bit0);
            }
        }
        let pmap = wmap;

        let mut page = Self {
            start,
            nblocks,
            nfree: nblocks,
            wmap,
            pmap,
            tree: SummaryTree::new_dmap(),
        };
        page.tree = page.recompute_tree();
        page
    }

    /// Rebuild the summary tree from scratch off the working bitmap.
    ///
    /// The incremental split/join maintenance must always agree with this;
    /// the scrub path and the property tests compare the two.
    #[must_use]
    pub fn recompute_tree(&self) -> SummaryTree {
        let mut leaves: Vec<i8> = self.wmap.iter().map(|&w| max_bud_word(w)).collect();
        let mut tree = SummaryTree::new_dmap();
        SummaryTree::merge_buddies(&mut leaves, tree.budmin());
        tree.rebuild(&leaves);
        tree
    }

    /// Free blocks according to the persistent map (recovery consistency
    /// checks compare this against logged state).
    #[must_use]
    pub fn pmap_free(&self) -> u32 {
        let counted: u32 = self.pmap.iter().map(|w| w.count_zeros()).sum();
        // Words past nblocks are pinned allocated, so zeros only occur in
        // the described range.
        counted
    }

    /// Serialize to a full page image.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; PSIZE];
        out[0..4].copy_from_slice(&self.nblocks.to_le_bytes());
        out[4..8].copy_from_slice(&self.nfree.to_le_bytes());
        out[8..16].copy_from_slice(&self.start.0.to_le_bytes());
        self.tree.encode_into(&mut out, DMAP_TREE_OFF);
        for (i, w) in self.wmap.iter().enumerate() {
            out[DMAP_WMAP_OFF + 4 * i..DMAP_WMAP_OFF + 4 * i + 4]
                .copy_from_slice(&w.to_le_bytes());
        }
        for (i, w) in self.pmap.iter().enumerate() {
            out[DMAP_PMAP_OFF + 4 * i..DMAP_PMAP_OFF + 4 * i + 4]
                .copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Deserialize and validate a page image.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        lfs_types::ensure_slice(data, 0, PSIZE)?;
        let nblocks = read_le_u32(data, 0)?;
        let nfree = read_le_u32(data, 4)?;
        let start = BlockAddr(read_le_u64(data, 8)?);
        if u64::from(nblocks) > BPERDMAP {
            return Err(ParseError::InvalidField {
                field: "nblocks",
                reason: "exceeds BPERDMAP",
            });
        }
        if nfree > nblocks {
            return Err(ParseError::InvalidField {
                field: "nfree",
                reason: "exceeds nblocks",
            });
        }
        let tree = SummaryTree::decode_from(&SummaryTree::new_dmap(), data, DMAP_TREE_OFF)?;

        let mut wmap = [0_u32; LPERDMAP];
        for (i, slot) in wmap.iter_mut().enumerate() {
            *slot = read_le_u32(data, DMAP_WMAP_OFF + 4 * i)?;
        }
        let mut pmap = [0_u32; LPERDMAP];
        for (i, slot) in pmap.iter_mut().enumerate() {
            *slot = read_le_u32(data, DMAP_PMAP_OFF + 4 * i)?;
        }

        Ok(Self {
            start,
            nblocks,
            nfree,
            wmap,
            pmap,
            tree,
        })
    }
}

// ── Dmapctl control page ────────────────────────────────────────────────────

/// A control page: one summary-tree leaf per child dmap (level 0) or per
/// child dmapctl (levels 1–2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmapCtlPage {
    /// Stack level: 0 directly above the dmaps.
    pub level: u32,
    /// Summary tree over the children.
    pub tree: SummaryTree,
}

// Layout:
//   +0   u32 level
//   +4   summary tree (17 + 1365 bytes)
const CTL_TREE_OFF: usize = 4;

impl DmapCtlPage {
    /// Fresh control page with every child marked `NOFREE` (children are
    /// announced by upward propagation as they are formatted).
    #[must_use]
    pub fn format(level: u32) -> Self {
        Self {
            level,
            tree: SummaryTree::new_ctl(level),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; PSIZE];
        out[0..4].copy_from_slice(&self.level.to_le_bytes());
        self.tree.encode_into(&mut out, CTL_TREE_OFF);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        lfs_types::ensure_slice(data, 0, PSIZE)?;
        let level = read_le_u32(data, 0)?;
        if level >= 3 {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "dmapctl levels are 0..=2",
            });
        }
        let tree = SummaryTree::decode_from(&SummaryTree::new_ctl(level), data, CTL_TREE_OFF)?;
        Ok(Self { level, tree })
    }
}

// ── Bmap control page ───────────────────────────────────────────────────────

/// The allocation map's control page: totals, AG geometry, and per-AG free
/// counts. Block 0 of the map region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmapControlPage {
    /// Total blocks the map describes.
    pub total_blocks: u64,
    /// Free blocks (working view).
    pub free_blocks: u64,
    /// Blocks per allocation group (power-of-two multiple of `BPERDMAP`).
    pub agsize: u64,
    /// log2 of `agsize`.
    pub agl2size: u32,
    /// Number of allocation groups covering the volume.
    pub num_ag: u32,
    /// Highest dmapctl level in use (0..=2).
    pub maxlevel: u32,
    /// Preferred allocation group for the next unhinted allocation.
    pub agpref: u32,
    /// Dmapctl level whose subtrees map onto AGs.
    pub aglevel: u32,
    /// Tree levels descended inside an AG subtree.
    pub agheight: u32,
    /// Subtrees per AG at that depth.
    pub agwidth: u32,
    /// Index of the first tree node at the AG depth.
    pub agstart: u32,
    /// Per-AG free block counts (slots past `num_ag` are zero).
    pub ag_free: [u64; MAXAG],
}

// Layout:
//   +0   u32 magic
//   +4   u32 version
//   +8   u64 total_blocks
//   +16  u64 free_blocks
//   +24  u64 agsize
//   +32  u32 agl2size
//   +36  u32 num_ag
//   +40  u32 maxlevel
//   +44  u32 agpref
//   +48  u32 aglevel
//   +52  u32 agheight
//   +56  u32 agwidth
//   +60  u32 agstart
//   +64  u64 ag_free[128]
const BMAP_AGFREE_OFF: usize = 64;

impl BmapControlPage {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; PSIZE];
        out[0..4].copy_from_slice(&BMAP_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&BMAP_VERSION.to_le_bytes());
        out[8..16].copy_from_slice(&self.total_blocks.to_le_bytes());
        out[16..24].copy_from_slice(&self.free_blocks.to_le_bytes());
        out[24..32].copy_from_slice(&self.agsize.to_le_bytes());
        out[32..36].copy_from_slice(&self.agl2size.to_le_bytes());
        out[36..40].copy_from_slice(&self.num_ag.to_le_bytes());
        out[40..44].copy_from_slice(&self.maxlevel.to_le_bytes());
        out[44..48].copy_from_slice(&self.agpref.to_le_bytes());
        out[48..52].copy_from_slice(&self.aglevel.to_le_bytes());
        out[52..56].copy_from_slice(&self.agheight.to_le_bytes());
        out[56..60].copy_from_slice(&self.agwidth.to_le_bytes());
        out[60..64].copy_from_slice(&self.agstart.to_le_bytes());
        for (i, v) in self.ag_free.iter().enumerate() {
            out[BMAP_AGFREE_OFF + 8 * i..BMAP_AGFREE_OFF + 8 * i + 8]
                .copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        lfs_types::ensure_slice(data, 0, PSIZE)?;
        let magic = read_le_u32(data, 0)?;
        if magic != BMAP_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BMAP_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u32(data, 4)?;
        if version != BMAP_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported bmap version",
            });
        }

        let total_blocks = read_le_u64(data, 8)?;
        let free_blocks = read_le_u64(data, 16)?;
        let agsize = read_le_u64(data, 24)?;
        let agl2size = read_le_u32(data, 32)?;
        let num_ag = read_le_u32(data, 36)?;
        let maxlevel = read_le_u32(data, 40)?;
        let agpref = read_le_u32(data, 44)?;
        let aglevel = read_le_u32(data, 48)?;
        let agheight = read_le_u32(data, 52)?;
        let agwidth = read_le_u32(data, 56)?;
        let agstart = read_le_u32(data, 60)?;

        if free_blocks > total_blocks {
            return Err(ParseError::InvalidField {
                field: "free_blocks",
                reason: "exceeds total_blocks",
            });
        }
        if !agsize.is_power_of_two()
            || agsize < BPERDMAP
            || u64::from(agl2size) != u64::from(agsize.trailing_zeros())
        {
            return Err(ParseError::InvalidField {
                field: "agsize",
                reason: "must be a power-of-two multiple of BPERDMAP matching agl2size",
            });
        }
        if num_ag as usize > MAXAG || num_ag == 0 {
            return Err(ParseError::InvalidField {
                field: "num_ag",
                reason: "must be in 1..=MAXAG",
            });
        }
        if maxlevel >= 3 {
            return Err(ParseError::InvalidField {
                field: "maxlevel",
                reason: "dmapctl levels are 0..=2",
            });
        }
        if agpref >= num_ag {
            return Err(ParseError::InvalidField {
                field: "agpref",
                reason: "must address an existing allocation group",
            });
        }

        let mut ag_free = [0_u64; MAXAG];
        for (i, slot) in ag_free.iter_mut().enumerate() {
            *slot = read_le_u64(data, BMAP_AGFREE_OFF + 8 * i)?;
        }
        let sum: u64 = ag_free.iter().sum();
        if sum != free_blocks {
            return Err(ParseError::InvalidField {
                field: "ag_free",
                reason: "per-AG free counts do not sum to free_blocks",
            });
        }

        Ok(Self {
            total_blocks,
            free_blocks,
            agsize,
            agl2size,
            num_ag,
            maxlevel,
            agpref,
            aglevel,
            agheight,
            agwidth,
            agstart,
            ag_free,
        })
    }
}
