#![forbid(unsafe_code)]
//! Core identifier newtypes, on-disk geometry constants, and little-endian
//! parse helpers shared across the ledgerfs crates.
//!
//! This crate is intentionally leaf-level: it depends on nothing else in the
//! workspace so that every other crate (codecs, allocator, log, transactions)
//! can share the same vocabulary without cycles.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Metadata page geometry ──────────────────────────────────────────────────

/// Size of every metadata page (dmap, dmapctl, bmap control, log page).
pub const PSIZE: usize = 4096;

/// log2 of the number of bits in a bitmap word.
pub const L2DBWORD: u32 = 5;
/// Bits per bitmap word.
pub const DBWORD: u32 = 1 << L2DBWORD;

/// log2 of the number of bitmap words per dmap.
pub const L2LPERDMAP: u32 = 8;
/// Bitmap words (= summary-tree leaves) per dmap page.
pub const LPERDMAP: usize = 1 << L2LPERDMAP;

/// log2 of the number of blocks described by one dmap page.
pub const L2BPERDMAP: u32 = L2LPERDMAP + L2DBWORD;
/// Blocks described by one dmap page.
pub const BPERDMAP: u64 = 1 << L2BPERDMAP;

/// Nodes in a dmap summary tree (4-ary, levels 1+4+16+64+256).
pub const TREESIZE: usize = 1 + 4 + 16 + 64 + 256;
/// Array index of the first leaf in a dmap summary tree.
pub const LEAFIND: usize = TREESIZE - LPERDMAP;

/// log2 of the number of children per dmapctl page.
pub const L2LPERCTL: u32 = 10;
/// Children (= leaves) per dmapctl page.
pub const LPERCTL: usize = 1 << L2LPERCTL;

/// Nodes in a dmapctl summary tree (4-ary, levels 1+4+16+64+256+1024).
pub const CTLTREESIZE: usize = 1 + 4 + 16 + 64 + 256 + 1024;
/// Array index of the first leaf in a dmapctl summary tree.
pub const CTLLEAFIND: usize = CTLTREESIZE - LPERCTL;

/// Maximum number of dmapctl levels stacked above the dmap layer.
pub const MAXLEVEL: usize = 3;

/// Summary-tree sentinel: this node does not lead a power-of-two-aligned
/// free run; the true state lives in an ancestor or in the bitmap itself.
pub const NOFREE: i8 = -1;

/// Maximum number of allocation groups a volume is carved into.
pub const MAXAG: usize = 128;
/// log2 of [`MAXAG`].
pub const L2MAXAG: u32 = 7;

// ── Log geometry ────────────────────────────────────────────────────────────

/// Size of one log page.
pub const LOGPSIZE: usize = PSIZE;
/// Bytes of log-page header (page sequence + end-of-record offset).
pub const LOGPHDRSIZE: usize = 8;
/// Bytes of log-page trailer (redundant copy of the header).
pub const LOGPTLRSIZE: usize = 8;
/// Usable record bytes per log page.
pub const LOGPDATASIZE: usize = LOGPSIZE - LOGPHDRSIZE - LOGPTLRSIZE;

/// Magic number of the log superblock.
pub const LOG_MAGIC: u32 = 0x4C44_4C47; // "LDLG"
/// On-disk log format version.
pub const LOG_VERSION: u32 = 1;
/// Capacity of the log superblock's active-filesystem UUID table.
pub const LOG_MAX_ACTIVE: usize = 16;
/// Page slot of the log superblock on the log device.
pub const LOG_SUPER_SLOT: u64 = 0;
/// First page slot usable for log data (slot 1 is reserved).
pub const LOG_DATA_SLOT: u64 = 2;

/// Magic number of the bmap control page.
pub const BMAP_MAGIC: u32 = 0x4C44_424D; // "LDBM"
/// On-disk bmap format version.
pub const BMAP_VERSION: u32 = 1;

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Absolute disk block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u64);

impl BlockAddr {
    /// Address `count` blocks past `self`, `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// Inode number, used as the canonical ordering key at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Transaction identifier: an index into the tblock arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u32);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgNumber(pub u32);

/// Log sequence number: a logical byte position in the (unwrapped) log.
///
/// `Lsn = page_seq * LOGPSIZE + byte offset within the page`. Page sequence
/// numbers are monotonic across wraps, so LSNs totally order log records for
/// the lifetime of a log instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Self = Self(0);

    /// Compose an LSN from a page sequence number and a byte offset.
    #[must_use]
    pub fn compose(page_seq: u64, offset: usize) -> Self {
        Self(page_seq * LOGPSIZE as u64 + offset as u64)
    }

    /// The page sequence number this LSN falls on.
    #[must_use]
    pub fn page_seq(self) -> u64 {
        self.0 / LOGPSIZE as u64
    }

    /// The byte offset within the page.
    #[must_use]
    pub fn offset(self) -> usize {
        (self.0 % LOGPSIZE as u64) as usize
    }
}

// ── Parse errors and little-endian helpers ──────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// log2 of the smallest power of two >= `n` (n >= 1).
///
/// The allocator expresses request sizes as buddy orders via this.
#[must_use]
pub fn ceil_log2(n: u64) -> u32 {
    debug_assert!(n >= 1);
    64 - n.saturating_sub(1).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_geometry_is_self_consistent() {
        // 4-ary trees: each level is 4x the one above, leaves last.
        assert_eq!(TREESIZE, 341);
        assert_eq!(LEAFIND, 85);
        assert_eq!(CTLTREESIZE, 1365);
        assert_eq!(CTLLEAFIND, 341);
        assert_eq!(BPERDMAP, LPERDMAP as u64 * u64::from(DBWORD));
    }

    #[test]
    fn lsn_round_trips_page_and_offset() {
        let lsn = Lsn::compose(7, 123);
        assert_eq!(lsn.page_seq(), 7);
        assert_eq!(lsn.offset(), 123);
        assert_eq!(lsn.0, 7 * LOGPSIZE as u64 + 123);

        assert_eq!(Lsn::ZERO.page_seq(), 0);
        assert_eq!(Lsn::ZERO.offset(), 0);
    }

    #[test]
    fn lsn_orders_across_pages() {
        assert!(Lsn::compose(3, LOGPSIZE - 1) < Lsn::compose(4, 0));
    }

    #[test]
    fn ceil_log2_boundaries() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(BPERDMAP), u32::try_from(L2BPERDMAP).unwrap());
    }

    #[test]
    fn read_helpers_reject_truncated_input() {
        let data = [0x01_u8, 0x02, 0x03];
        assert_eq!(read_le_u16(&data, 0), Ok(0x0201));
        assert!(matches!(
            read_le_u32(&data, 0),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3
            })
        ));
        assert!(matches!(
            read_le_u16(&data, usize::MAX),
            Err(ParseError::InvalidField { .. })
        ));
    }

    #[test]
    fn block_addr_checked_add() {
        assert_eq!(BlockAddr(10).checked_add(5), Some(BlockAddr(15)));
        assert_eq!(BlockAddr(u64::MAX).checked_add(1), None);
    }
}
