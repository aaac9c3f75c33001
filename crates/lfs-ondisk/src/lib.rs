#![forbid(unsafe_code)]
//! On-disk structures for ledgerfs, as canonical in-memory types with
//! explicit `encode()`/`decode()` to the bit-exact little-endian layout.
//!
//! Call sites never manipulate raw page bytes: the allocator mutates
//! [`dmap::DmapPage`]/[`dmap::DmapCtlPage`] values and the codec produces the
//! disk image at flush time; the log manager works with [`log_format::LogPage`]
//! and [`log_format::LogRecord`] values the same way.
//!
//! Truncated input, bad magic, geometry mismatches, and torn log pages all
//! surface as `ParseError` rather than panics. See `tests/codec_corpus.rs`
//! for the adversarial corpus.

pub mod dmap;
pub mod log_format;
pub mod tree;

pub use dmap::{BmapControlPage, DmapCtlPage, DmapPage};
pub use log_format::{LogPage, LogRecord, LogSuperblock, MapRecordOp, RedoRange};
pub use tree::{SummaryTree, TreeError, max_bud_word};
