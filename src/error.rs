//! Crate-wide error type.
//!
//! One variant per failure kind the FATX and XDBF engines distinguish, plus
//! an `Io` variant for the underlying device. Everything fallible in this
//! crate returns [`Result`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("partition does not carry a valid FATX magic")]
    NotFatx,

    #[error("name is empty, longer than 42 bytes, or contains a forbidden character")]
    InvalidName,

    #[error("cluster index out of range")]
    BadCluster,

    #[error("chain ended before the expected number of clusters were walked")]
    BadChain,

    #[error("not enough free clusters to satisfy the request")]
    NoSpace,

    #[error("XDBF entry table or free table is full")]
    NoFreeSlots,

    #[error("a dirent with that name already exists")]
    AlreadyExists,

    #[error("no such dirent")]
    NotFound,

    #[error("move target is the source directory itself or one of its descendants")]
    WouldCreateCycle,

    #[error("write attempted through a read-only facade")]
    ReadOnlyViolation,

    #[error("XDBF header magic mismatch")]
    InvalidXdbf,

    #[error("unknown open mode, or an operation unsupported by this stream")]
    UnsupportedMode,

    #[error("seek target lies beyond the end of the allocated cluster chain")]
    PositionPastAllocation,

    #[error("XDBF section update failed even after a rebuild")]
    UpdateFailed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
