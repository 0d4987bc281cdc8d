//! Reading and mutating Xbox 360 FATX storage volumes and XDBF fixed-size
//! container files.
//!
//! The crate is organised bottom-up, leaves first:
//!
//! - [`device`] — the byte-addressable seekable stream abstraction everything
//!   else is built on.
//! - [`chained`] — a virtual stream splicing several [`device::Device`]s end
//!   to end, for volumes split across numbered USB data files.
//! - [`fatx`] — the FATX partition engine: header/chain-map handling,
//!   directory entries, file streams, and device-level partition probing.
//! - [`xdbf`] — the XDBF fixed-file block allocator.

pub mod chained;
pub mod device;
pub mod error;
pub mod fatx;
pub mod xdbf;

pub use device::Device;
pub use error::{Error, Result};

/// Sector size assumed throughout the FATX layer; a cluster is always a
/// whole number of these.
pub const SECTOR_SIZE: u64 = 512;
