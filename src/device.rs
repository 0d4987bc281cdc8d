//! Byte-addressable seekable device interface.
//!
//! Every engine in this crate (the FATX partition engine, dirent streams,
//! the XDBF allocator) is written against this trait rather than against
//! `std::fs::File` directly, so that a [`crate::chained::ChainedStream`] can
//! stand in wherever a single-file device would otherwise be required.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

/// A single, exclusively-owned, seekable byte stream.
///
/// Implementors are not required to be `Send`/`Sync`: per the concurrency
/// model, a device is owned by one thread at a time and callers serialize
/// their own access.
pub trait Device {
    /// Total length of the stream in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Move the read/write position to an absolute byte offset, returning
    /// the position actually reached.
    fn seek(&mut self, pos: u64) -> Result<u64>;

    /// Read into `buf`, returning the number of bytes read (short reads are
    /// possible, as with any `Read` impl).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at the current position, returning the number of bytes
    /// written.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush any buffering this device performs.
    fn flush(&mut self) -> Result<()>;

    /// Grow or shrink the stream to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Read `buf.len()` bytes starting at `offset`, failing on a short read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(offset)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all of `buf` starting at `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.seek(offset)?;
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            written += n;
        }
        Ok(())
    }
}

impl Device for File {
    fn len(&mut self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn seek(&mut self, pos: u64) -> Result<u64> {
        Ok(Seek::seek(self, SeekFrom::Start(pos))?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(Read::read(self, buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(Write::write(self, buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(Write::flush(self)?)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        Ok(File::set_len(self, len)?)
    }
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }
    fn seek(&mut self, pos: u64) -> Result<u64> {
        (**self).seek(pos)
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }
}

/// A scratch device backed by a temporary file that is removed on drop,
/// used for the "byte-buffer I/O wrapper" §5 describes for transient
/// in-memory buffers.
pub struct ScratchDevice {
    file: tempfile::NamedTempFile,
}

impl ScratchDevice {
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: tempfile::NamedTempFile::new()?,
        })
    }
}

impl Device for ScratchDevice {
    fn len(&mut self) -> Result<u64> {
        self.file.as_file_mut().len()
    }
    fn seek(&mut self, pos: u64) -> Result<u64> {
        self.file.as_file_mut().seek(pos)
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.as_file_mut().read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file.as_file_mut().write(buf)
    }
    fn flush(&mut self) -> Result<()> {
        self.file.as_file_mut().flush()
    }
    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.as_file_mut().set_len(len)
    }
}
