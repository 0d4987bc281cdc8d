//! A virtual stream splicing an ordered sequence of [`Device`]s end to end.
//!
//! Xbox 360 USB sticks split a single logical FATX volume into 4 GiB data
//! files; this composes the numbered files back into one seekable stream so
//! the partition engine above never has to know about the split.

use crate::device::Device;
use crate::error::{Error, Result};

/// Composes several sub-streams into one virtual stream of their summed
/// length. Position maps to a `(stream index, offset within stream)` pair;
/// reads and writes that straddle a boundary split across the pair of
/// streams they touch.
pub struct ChainedStream {
    streams: Vec<Box<dyn Device>>,
    lengths: Vec<u64>,
    offsets: Vec<u64>,
    total_len: u64,
    position: u64,
}

impl ChainedStream {
    /// Builds a chained stream over `streams`, in order. Each sub-stream's
    /// length is queried once, up front.
    pub fn new(mut streams: Vec<Box<dyn Device>>) -> Result<Self> {
        let mut lengths = Vec::with_capacity(streams.len());
        let mut offsets = Vec::with_capacity(streams.len());
        let mut total_len = 0u64;
        for s in streams.iter_mut() {
            offsets.push(total_len);
            let len = s.len()?;
            lengths.push(len);
            total_len += len;
        }
        Ok(Self {
            streams,
            lengths,
            offsets,
            total_len,
            position: 0,
        })
    }

    /// Finds the sub-stream index containing absolute offset `pos`, and the
    /// offset within that sub-stream. `pos == total_len` resolves to one
    /// past the last stream, offset 0 (a valid "at EOF" position).
    fn locate(&self, pos: u64) -> (usize, u64) {
        if self.streams.is_empty() {
            return (0, 0);
        }
        let mut base = 0u64;
        for (i, len) in self.lengths.iter().enumerate() {
            if pos < base + len {
                return (i, pos - base);
            }
            base += len;
        }
        (self.streams.len() - 1, self.lengths[self.streams.len() - 1])
    }
}

impl Device for ChainedStream {
    fn len(&mut self) -> Result<u64> {
        Ok(self.total_len)
    }

    fn seek(&mut self, pos: u64) -> Result<u64> {
        self.position = pos.min(self.total_len);
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.total_len {
            return Ok(0);
        }
        let (mut idx, mut off) = self.locate(self.position);
        let mut done = 0;
        while done < buf.len() && self.position < self.total_len {
            let stream = &mut self.streams[idx];
            stream.seek(self.offsets[idx] + off)?;
            let want = buf.len() - done;
            let n = stream.read(&mut buf[done..done + want])?;
            if n == 0 {
                break;
            }
            done += n;
            self.position += n as u64;
            off += n as u64;
            if off >= self.lengths[idx] && idx + 1 < self.streams.len() {
                idx += 1;
                off = 0;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.total_len {
            return Ok(0);
        }
        let (mut idx, mut off) = self.locate(self.position);
        let mut done = 0;
        while done < buf.len() && self.position < self.total_len {
            let stream = &mut self.streams[idx];
            stream.seek(self.offsets[idx] + off)?;
            let room = (self.lengths[idx] - off) as usize;
            let want = (buf.len() - done).min(room.max(1));
            let n = stream.write(&buf[done..done + want])?;
            if n == 0 {
                break;
            }
            done += n;
            self.position += n as u64;
            off += n as u64;
            if off >= self.lengths[idx] && idx + 1 < self.streams.len() {
                idx += 1;
                off = 0;
            }
        }
        Ok(done)
    }

    fn flush(&mut self) -> Result<()> {
        for s in self.streams.iter_mut() {
            s.flush()?;
        }
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(Error::UnsupportedMode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;

    fn stream(bytes: &[u8]) -> Box<dyn Device> {
        Box::new(MemDevice::new(bytes.to_vec()))
    }

    #[test]
    fn total_length_is_the_sum() {
        let mut s = ChainedStream::new(vec![
            stream(&[0u8; 10]),
            stream(&[0u8; 10]),
            stream(&[0u8; 10]),
        ])
        .unwrap();
        assert_eq!(s.len().unwrap(), 30);
    }

    #[test]
    fn write_spanning_two_sub_streams_reads_back_identical() {
        let mut s = ChainedStream::new(vec![
            stream(&[0u8; 10]),
            stream(&[0u8; 10]),
            stream(&[0u8; 10]),
        ])
        .unwrap();

        let payload: Vec<u8> = (1..=15).collect();
        s.seek(5).unwrap();
        let written = s.write(&payload).unwrap();
        assert_eq!(written, 15);

        let mut buf = vec![0u8; 15];
        s.seek(5).unwrap();
        let read = s.read(&mut buf).unwrap();
        assert_eq!(read, 15);
        assert_eq!(buf, payload);
    }

    #[test]
    fn set_len_is_unsupported() {
        let mut s = ChainedStream::new(vec![stream(&[0u8; 4])]).unwrap();
        assert!(matches!(s.set_len(8), Err(Error::UnsupportedMode)));
    }
}
