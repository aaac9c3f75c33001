//! Write-ahead log on-disk formats: pages, packed records, and the log
//! superblock.
//!
//! A log page is `LOGPSIZE` bytes: an 8-byte header, `LOGPDATASIZE` bytes of
//! packed records, and an 8-byte trailer that repeats the header. Header and
//! trailer both carry the page sequence number and the end-of-record offset;
//! a mismatch between the two means the page write was torn by a crash.
//!
//! Records are packed back to back in the data area and never split across
//! pages. Each record is a 12-byte descriptor (type, transaction, payload
//! length, payload CRC32C) followed by the inline payload.

use lfs_types::{
    BlockAddr, InodeNumber, LOG_MAGIC, LOG_MAX_ACTIVE, LOG_VERSION, LOGPDATASIZE, LOGPHDRSIZE,
    LOGPSIZE, Lsn, ParseError, TxId, ensure_slice, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Byte offset of the first record in a log page.
pub const LOG_RECORD_BASE: usize = LOGPHDRSIZE;

// ── Log page ────────────────────────────────────────────────────────────────

/// In-core image of one log page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPage {
    /// Monotonic page sequence number (not the on-device slot).
    pub page_seq: u32,
    /// End-of-record offset: first unused byte, `LOGPHDRSIZE`-based.
    pub eor: u16,
    /// Packed record bytes.
    pub data: Vec<u8>,
}

impl LogPage {
    /// Fresh empty page for `page_seq`.
    #[must_use]
    pub fn new(page_seq: u32) -> Self {
        Self {
            page_seq,
            eor: u16::try_from(LOGPHDRSIZE).expect("header size fits u16"),
            data: vec![0_u8; LOGPDATASIZE],
        }
    }

    /// Bytes still available for records.
    #[must_use]
    pub fn remaining(&self) -> usize {
        LOGPHDRSIZE + LOGPDATASIZE - usize::from(self.eor)
    }

    /// Append `bytes` at the end-of-record offset. Caller checks
    /// [`remaining`](Self::remaining) first.
    pub fn push(&mut self, bytes: &[u8]) -> Lsn {
        assert!(bytes.len() <= self.remaining(), "record exceeds page space");
        let off = usize::from(self.eor) - LOGPHDRSIZE;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        let lsn = Lsn::compose(u64::from(self.page_seq), usize::from(self.eor));
        self.eor += u16::try_from(bytes.len()).expect("record length fits u16");
        lsn
    }

    /// Serialize with matching header and trailer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; LOGPSIZE];
        out[0..4].copy_from_slice(&self.page_seq.to_le_bytes());
        out[4..6].copy_from_slice(&self.eor.to_le_bytes());
        out[LOGPHDRSIZE..LOGPHDRSIZE + LOGPDATASIZE].copy_from_slice(&self.data);
        let tlr = LOGPSIZE - 8;
        out[tlr..tlr + 4].copy_from_slice(&self.page_seq.to_le_bytes());
        out[tlr + 4..tlr + 6].copy_from_slice(&self.eor.to_le_bytes());
        out
    }

    /// Deserialize, rejecting torn pages (header/trailer disagreement) and
    /// out-of-range end-of-record offsets.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, LOGPSIZE)?;
        let page_seq = read_le_u32(data, 0)?;
        let eor = read_le_u16(data, 4)?;
        let tlr = LOGPSIZE - 8;
        let t_seq = read_le_u32(data, tlr)?;
        let t_eor = read_le_u16(data, tlr + 4)?;
        if page_seq != t_seq || eor != t_eor {
            return Err(ParseError::InvalidField {
                field: "log_page_trailer",
                reason: "header/trailer mismatch (torn write)",
            });
        }
        if usize::from(eor) < LOGPHDRSIZE || usize::from(eor) > LOGPHDRSIZE + LOGPDATASIZE {
            return Err(ParseError::InvalidField {
                field: "eor",
                reason: "end-of-record offset out of range",
            });
        }
        Ok(Self {
            page_seq,
            eor,
            data: data[LOGPHDRSIZE..LOGPHDRSIZE + LOGPDATASIZE].to_vec(),
        })
    }
}

// ── Log records ─────────────────────────────────────────────────────────────

/// Which map a logged allocator delta targets is implied by the operation;
/// the record itself carries only alloc vs. free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapRecordOp {
    /// Blocks became allocated; redo sets persistent-map bits.
    Alloc,
    /// Blocks became free; redo clears persistent-map bits.
    Free,
}

/// One changed byte range of a redo-page record, with its bytes inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRange {
    /// Byte offset within the page.
    pub offset: u16,
    /// The new bytes.
    pub bytes: Vec<u8>,
}

/// A write-ahead log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// After-image byte ranges of a metadata page.
    RedoPage {
        inode: InodeNumber,
        page: BlockAddr,
        ranges: Vec<RedoRange>,
    },
    /// An allocator delta against the persistent map.
    UpdateMap {
        inode: InodeNumber,
        op: MapRecordOp,
        addr: BlockAddr,
        nblocks: u64,
    },
    /// Transaction commit marker.
    Commit,
    /// Sync point: everything below `sync` is reflected in home locations.
    SyncPt { sync: Lsn },
}

const REC_HDR: usize = 12;

const RT_REDOPAGE: u8 = 1;
const RT_UPDATEMAP: u8 = 2;
const RT_COMMIT: u8 = 3;
const RT_SYNCPT: u8 = 4;

impl LogRecord {
    /// Total encoded size (descriptor + payload).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        REC_HDR + self.payload_len()
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::RedoPage { ranges, .. } => {
                8 + 8 + 2 + ranges.iter().map(|r| 4 + r.bytes.len()).sum::<usize>()
            }
            Self::UpdateMap { .. } => 8 + 1 + 8 + 8,
            Self::Commit => 0,
            Self::SyncPt { .. } => 8,
        }
    }

    /// Serialize with the owning transaction in the descriptor.
    ///
    /// Fails (as a format error) if the payload cannot fit a single log
    /// page; the transaction layer chunks oversized linelock sets before
    /// reaching this point.
    pub fn encode(&self, tid: TxId) -> Result<Vec<u8>, ParseError> {
        let payload_len = self.payload_len();
        if REC_HDR + payload_len > LOGPDATASIZE {
            return Err(ParseError::InvalidField {
                field: "record",
                reason: "record exceeds log page capacity",
            });
        }

        let mut payload = Vec::with_capacity(payload_len);
        let rtype = match self {
            Self::RedoPage {
                inode,
                page,
                ranges,
            } => {
                payload.extend_from_slice(&inode.0.to_le_bytes());
                payload.extend_from_slice(&page.0.to_le_bytes());
                let n = u16::try_from(ranges.len()).map_err(|_| ParseError::InvalidField {
                    field: "ranges",
                    reason: "too many ranges in one record",
                })?;
                payload.extend_from_slice(&n.to_le_bytes());
                for r in ranges {
                    let len = u16::try_from(r.bytes.len()).map_err(|_| {
                        ParseError::InvalidField {
                            field: "range_len",
                            reason: "range longer than a page",
                        }
                    })?;
                    payload.extend_from_slice(&r.offset.to_le_bytes());
                    payload.extend_from_slice(&len.to_le_bytes());
                    payload.extend_from_slice(&r.bytes);
                }
                RT_REDOPAGE
            }
            Self::UpdateMap {
                inode,
                op,
                addr,
                nblocks,
            } => {
                payload.extend_from_slice(&inode.0.to_le_bytes());
                payload.push(match op {
                    MapRecordOp::Alloc => 1,
                    MapRecordOp::Free => 2,
                });
                payload.extend_from_slice(&addr.0.to_le_bytes());
                payload.extend_from_slice(&nblocks.to_le_bytes());
                RT_UPDATEMAP
            }
            Self::Commit => RT_COMMIT,
            Self::SyncPt { sync } => {
                payload.extend_from_slice(&sync.0.to_le_bytes());
                RT_SYNCPT
            }
        };
        debug_assert_eq!(payload.len(), payload_len);

        let mut out = Vec::with_capacity(REC_HDR + payload.len());
        out.push(rtype);
        out.push(0); // reserved
        out.extend_from_slice(&tid.0.to_le_bytes());
        out.extend_from_slice(
            &u16::try_from(payload.len())
                .map_err(|_| ParseError::IntegerConversion { field: "len" })?
                .to_le_bytes(),
        );
        out.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Deserialize one record at `offset`, returning the record, its owning
    /// transaction, and the total bytes consumed. Payload corruption is
    /// caught by the CRC before any field is interpreted.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, TxId, usize), ParseError> {
        let hdr = ensure_slice(data, offset, REC_HDR)?;
        let rtype = hdr[0];
        let tid = TxId(read_le_u32(hdr, 2)?);
        let len = usize::from(read_le_u16(hdr, 6)?);
        let crc = read_le_u32(hdr, 8)?;
        let payload = ensure_slice(data, offset + REC_HDR, len)?;
        if crc32c::crc32c(payload) != crc {
            return Err(ParseError::InvalidField {
                field: "record_crc",
                reason: "payload checksum mismatch",
            });
        }

        let record = match rtype {
            RT_REDOPAGE => {
                let inode = InodeNumber(read_le_u64(payload, 0)?);
                let page = BlockAddr(read_le_u64(payload, 8)?);
                let n = usize::from(read_le_u16(payload, 16)?);
                let mut ranges = Vec::with_capacity(n);
                let mut pos = 18;
                for _ in 0..n {
                    let off = read_le_u16(payload, pos)?;
                    let rlen = usize::from(read_le_u16(payload, pos + 2)?);
                    let bytes = ensure_slice(payload, pos + 4, rlen)?.to_vec();
                    ranges.push(RedoRange { offset: off, bytes });
                    pos += 4 + rlen;
                }
                Self::RedoPage {
                    inode,
                    page,
                    ranges,
                }
            }
            RT_UPDATEMAP => {
                let inode = InodeNumber(read_le_u64(payload, 0)?);
                let op = match ensure_slice(payload, 8, 1)?[0] {
                    1 => MapRecordOp::Alloc,
                    2 => MapRecordOp::Free,
                    _ => {
                        return Err(ParseError::InvalidField {
                            field: "map_op",
                            reason: "unknown update-map operation",
                        });
                    }
                };
                let addr = BlockAddr(read_le_u64(payload, 9)?);
                let nblocks = read_le_u64(payload, 17)?;
                Self::UpdateMap {
                    inode,
                    op,
                    addr,
                    nblocks,
                }
            }
            RT_COMMIT => Self::Commit,
            RT_SYNCPT => Self::SyncPt {
                sync: Lsn(read_le_u64(payload, 0)?),
            },
            _ => {
                return Err(ParseError::InvalidField {
                    field: "record_type",
                    reason: "unknown log record type",
                });
            }
        };
        Ok((record, tid, REC_HDR + len))
    }

    /// Decode every record packed in a page's data area up to `eor`.
    pub fn decode_page(page: &LogPage) -> Result<Vec<(Self, TxId)>, ParseError> {
        let end = usize::from(page.eor) - LOGPHDRSIZE;
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < end {
            let (record, tid, used) = Self::decode(&page.data[..end], pos)?;
            out.push((record, tid));
            pos += used;
        }
        Ok(out)
    }
}

// ── Log superblock ──────────────────────────────────────────────────────────

/// The log's superblock: identity, geometry, the current sync point, and the
/// table of filesystems actively sharing this log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSuperblock {
    /// Bumped once per log open.
    pub serial: u32,
    /// Total log size in pages, including the two reserved slots.
    pub size_pages: u32,
    /// Block size of the filesystems using this log.
    pub bsize: u32,
    /// Log offset below which all transactions are in their home locations.
    pub syncpt: Lsn,
    /// Active filesystem UUIDs (zero entry = empty slot).
    pub active: [[u8; 16]; LOG_MAX_ACTIVE],
}

// Layout:
//   +0   u32 magic
//   +4   u32 version
//   +8   u32 serial
//   +12  u32 size_pages
//   +16  u32 bsize
//   +24  u64 syncpt
//   +32  [u8;16] active[LOG_MAX_ACTIVE]
const SUPER_ACTIVE_OFF: usize = 32;

impl LogSuperblock {
    #[must_use]
    pub fn new(size_pages: u32, bsize: u32) -> Self {
        Self {
            serial: 0,
            size_pages,
            bsize,
            syncpt: Lsn::ZERO,
            active: [[0_u8; 16]; LOG_MAX_ACTIVE],
        }
    }

    /// Register a filesystem UUID. Fails when the table is full.
    pub fn add_active(&mut self, uuid: [u8; 16]) -> Result<(), ParseError> {
        if self.active.iter().any(|u| *u == uuid) {
            return Ok(());
        }
        for slot in &mut self.active {
            if *slot == [0_u8; 16] {
                *slot = uuid;
                return Ok(());
            }
        }
        Err(ParseError::InvalidField {
            field: "active",
            reason: "active filesystem table is full",
        })
    }

    /// Deregister a filesystem UUID; returns whether it was present.
    pub fn remove_active(&mut self, uuid: [u8; 16]) -> bool {
        for slot in &mut self.active {
            if *slot == uuid {
                *slot = [0_u8; 16];
                return true;
            }
        }
        false
    }

    #[must_use]
    pub fn is_active(&self, uuid: [u8; 16]) -> bool {
        uuid != [0_u8; 16] && self.active.iter().any(|u| *u == uuid)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; LOGPSIZE];
        out[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.serial.to_le_bytes());
        out[12..16].copy_from_slice(&self.size_pages.to_le_bytes());
        out[16..20].copy_from_slice(&self.bsize.to_le_bytes());
        out[24..32].copy_from_slice(&self.syncpt.0.to_le_bytes());
        for (i, uuid) in self.active.iter().enumerate() {
            out[SUPER_ACTIVE_OFF + 16 * i..SUPER_ACTIVE_OFF + 16 * (i + 1)]
                .copy_from_slice(uuid);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, LOGPSIZE)?;
        let magic = read_le_u32(data, 0)?;
        if magic != LOG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(LOG_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u32(data, 4)?;
        if version != LOG_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported log version",
            });
        }
        let serial = read_le_u32(data, 8)?;
        let size_pages = read_le_u32(data, 12)?;
        let bsize = read_le_u32(data, 16)?;
        let syncpt = Lsn(read_le_u64(data, 24)?);
        if size_pages < 4 {
            return Err(ParseError::InvalidField {
                field: "size_pages",
                reason: "log too small (minimum 4 pages)",
            });
        }
        if bsize == 0 || !bsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "bsize",
                reason: "block size must be a power of two",
            });
        }

        let mut active = [[0_u8; 16]; LOG_MAX_ACTIVE];
        for (i, slot) in active.iter_mut().enumerate() {
            slot.copy_from_slice(ensure_slice(data, SUPER_ACTIVE_OFF + 16 * i, 16)?);
        }

        Ok(Self {
            serial,
            size_pages,
            bsize,
            syncpt,
            active,
        })
    }
}
