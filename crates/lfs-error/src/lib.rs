#![forbid(unsafe_code)]
//! Error types for ledgerfs.
//!
//! # Error Taxonomy
//!
//! ledgerfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `LfsError` | `lfs-error` (this crate) | User-facing errors for API consumers |
//!
//! `lfs-error` is intentionally independent of `lfs-types` to avoid cyclic
//! dependencies; the conversion from `ParseError` happens at the boundary of
//! whichever crate read the bytes:
//!
//! - During format/open-time validation (before the instance is live), a
//!   `ParseError` becomes [`LfsError::Format`] — the image is structurally
//!   wrong, not damaged.
//! - While reading live metadata (a dmap page, a log page), a `ParseError`
//!   becomes [`LfsError::Corruption`] with the block number for triage.
//!
//! # Recoverability
//!
//! | Variant | errno | Recoverable? |
//! |---------|-------|--------------|
//! | `NoSpace` | `ENOSPC` | yes — retry with a smaller request or another allocation group |
//! | `Io` | `EIO` | no — escalates to an instance-wide error state |
//! | `LogFailed` | `EIO` | no — the log is permanently tainted; remount required |
//! | `Corruption` | `EIO` | no — the volume is marked as needing an offline check |
//! | `Format` / `Parse` / `InvalidGeometry` | `EINVAL` | n/a — rejected at open/format time |
//! | `ReadOnly` | `EROFS` | n/a |
//!
//! The errno mapping is exhaustive (no wildcard arms) so adding a variant is
//! a compile error until its errno is assigned.

use thiserror::Error;

/// Unified error type for all ledgerfs operations.
///
/// This is the canonical error type returned by the allocator, transaction
/// manager, log manager, and block layer. Crate-internal errors (like
/// `ParseError` from `lfs-types`) convert into `LfsError` at their
/// respective crate boundaries.
#[derive(Debug, Error)]
pub enum LfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Used when live metadata reads or consistency checks produce invalid
    /// state: a summary-tree value disagreeing with its bitmap, a torn log
    /// page, an out-of-range field. The `block` field enables triage.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (wrong magic, unsupported version).
    ///
    /// Used during format/open-time validation when the image structure is
    /// fundamentally wrong rather than damaged.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string representation of a `ParseError` from `lfs-types`.
    /// Prefer `Corruption` or `Format` when the block number or validation
    /// context is known.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk geometry is invalid or out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free blocks of the requested size available.
    ///
    /// Recoverable: callers retry with a smaller request or a different
    /// allocation group. The allocator never silently downgrades a request.
    #[error("no space left on device")]
    NoSpace,

    /// A log page write failed; the log instance is permanently tainted.
    ///
    /// Every transaction whose records shared the failed page observes this
    /// error from its commit. There is no automatic retry.
    #[error("log write failed at lsn {lsn}: {detail}")]
    LogFailed { lsn: u64, detail: String },

    /// The instance is read-only and a mutation was attempted.
    #[error("read-only instance")]
    ReadOnly,
}

impl LfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm. Adding
    /// a new variant without updating this function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::LogFailed { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Whether the caller may retry the operation with different parameters.
    ///
    /// Only out-of-space is recoverable; everything else taints the instance.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

/// Result alias using `LfsError`.
pub type Result<T> = std::result::Result<T, LfsError>;
