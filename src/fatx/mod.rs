//! The FATX partition engine (§4.1-§4.5): header/chain-map handling,
//! directory entries, file streams, and device-level partition probing.

pub mod dirent;
pub mod partition;
pub mod stream;
pub mod volume;

pub use dirent::{Attributes, Dirent};
pub use partition::{Partition, PartitionKind};
pub use stream::{DirentStream, OpenMode};
pub use volume::{DeviceKind, FatxDevice};
