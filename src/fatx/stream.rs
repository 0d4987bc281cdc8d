//! A seekable byte stream backed by one dirent's cluster chain (§4.4).

use chrono::Utc;
use log::trace;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::fatx::dirent::{pack_time, Dirent};
use crate::fatx::partition::{Partition, END_OF_CHAIN};

/// File stream open modes (§9: enumerated explicitly rather than inherited
/// from a host `FileMode`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    Create,
    OpenOrCreate,
    Append,
    Truncate,
    CreateNew,
}

/// A seekable stream over a dirent's cluster chain. Owns neither the
/// partition nor the device: both are borrowed for the duration of each
/// call, consistent with the single-threaded, non-owning-handle model
/// described in §9.
pub struct DirentStream {
    dirent: Dirent,
    position: u64,
    clusters_in: u32,
    current_cluster: u32,
    cache: Option<Vec<u8>>,
    dirty: bool,
    file_modified: bool,
}

impl DirentStream {
    /// Opens (and if needed creates) the dirent named by `name` inside
    /// `parent_cluster`, per the six modes in §4.4.
    pub fn open(
        partition: &mut Partition,
        device: &mut dyn Device,
        parent_cluster: u32,
        name: &str,
        mode: OpenMode,
    ) -> Result<Self> {
        let existing = partition.lookup(device, parent_cluster, name, Some(false))?;

        let dirent = match mode {
            OpenMode::Open => existing.ok_or(Error::NotFound)?,
            OpenMode::CreateNew => {
                if existing.is_some() {
                    return Err(Error::AlreadyExists);
                }
                partition.create_dirent(device, parent_cluster, name, false)?
            }
            OpenMode::Create => match existing {
                Some(d) => d,
                None => partition.create_dirent(device, parent_cluster, name, false)?,
            },
            OpenMode::OpenOrCreate | OpenMode::Append => match existing {
                Some(d) => d,
                None => partition.create_dirent(device, parent_cluster, name, false)?,
            },
            OpenMode::Truncate => existing.ok_or(Error::NotFound)?,
        };

        let mut stream = Self {
            dirent,
            position: 0,
            clusters_in: 0,
            current_cluster: 0,
            cache: None,
            dirty: false,
            file_modified: false,
        };

        match mode {
            OpenMode::Create => {
                stream.set_length(partition, device, 0)?;
                let now = pack_time(Utc::now().naive_utc());
                stream.dirent.created = now;
                partition.update_dirent(device, &stream.dirent)?;
            }
            OpenMode::Truncate => {
                stream.set_length(partition, device, 0)?;
            }
            OpenMode::Append => {
                stream.position = stream.dirent.size as u64;
            }
            _ => {}
        }

        Ok(stream)
    }

    pub fn len(&self) -> u64 {
        self.dirent.size as u64
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn dirent(&self) -> &Dirent {
        &self.dirent
    }

    fn cluster_size(&self, partition: &Partition) -> u64 {
        partition.cluster_size as u64
    }

    /// Walks from the dirent's first cluster to the cluster that should
    /// hold `self.position`, for a stream that has no cache loaded yet
    /// (fresh open, or just grown from zero length by a write).
    fn locate_current(&mut self, partition: &Partition) -> Result<()> {
        let cluster_size = self.cluster_size(partition);
        let clusters_in = if cluster_size == 0 { 0 } else { (self.position / cluster_size) as u32 };
        let mut cur = self.dirent.first_cluster;
        for _ in 0..clusters_in {
            cur = partition.next_cluster_public(cur)?;
            if cur == END_OF_CHAIN {
                return Err(Error::PositionPastAllocation);
            }
        }
        self.current_cluster = cur;
        self.clusters_in = clusters_in;
        Ok(())
    }

    fn ensure_cache_loaded(&mut self, partition: &Partition, device: &mut dyn Device) -> Result<()> {
        if self.cache.is_none() {
            if self.current_cluster == 0 {
                self.locate_current(partition)?;
            }
            let mut buf = vec![0u8; partition.cluster_size as usize];
            partition.read_cluster(device, self.current_cluster, &mut buf)?;
            self.cache = Some(buf);
        }
        Ok(())
    }

    fn flush_cache(&mut self, partition: &Partition, device: &mut dyn Device) -> Result<()> {
        if self.dirty {
            if let Some(buf) = &self.cache {
                partition.write_cluster(device, self.current_cluster, buf)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Advances to the next cluster in the chain, flushing the dirty cache
    /// first, and loads the new cluster.
    fn advance_cluster(&mut self, partition: &mut Partition, device: &mut dyn Device) -> Result<()> {
        self.flush_cache(partition, device)?;
        let next = partition.next_cluster_public(self.current_cluster)?;
        if next == END_OF_CHAIN {
            return Err(Error::BadChain);
        }
        self.current_cluster = next;
        self.clusters_in += 1;
        let mut buf = vec![0u8; partition.cluster_size as usize];
        partition.read_cluster(device, self.current_cluster, &mut buf)?;
        self.cache = Some(buf);
        Ok(())
    }

    /// Moves position within `[0, length]`, reloading the cache cluster if
    /// the target falls outside the one currently cached (§4.4).
    pub fn seek(&mut self, partition: &mut Partition, device: &mut dyn Device, pos: u64) -> Result<u64> {
        let clusters_in_new = if self.cluster_size(partition) == 0 {
            0
        } else {
            (pos / self.cluster_size(partition)) as u32
        };

        if pos == self.position {
            return Ok(self.position);
        }

        if self.cache.is_some() && clusters_in_new == self.clusters_in {
            self.position = pos;
            return Ok(self.position);
        }

        self.flush_cache(partition, device)?;

        if self.dirent.first_cluster == END_OF_CHAIN {
            if pos != 0 {
                return Err(Error::PositionPastAllocation);
            }
            self.cache = None;
            self.clusters_in = 0;
            self.position = 0;
            return Ok(0);
        }

        let mut cur = self.dirent.first_cluster;
        for _ in 0..clusters_in_new {
            cur = partition.next_cluster_public(cur)?;
            if cur == END_OF_CHAIN {
                return Err(Error::PositionPastAllocation);
            }
        }
        self.current_cluster = cur;
        self.clusters_in = clusters_in_new;
        let mut buf = vec![0u8; partition.cluster_size as usize];
        partition.read_cluster(device, self.current_cluster, &mut buf)?;
        self.cache = Some(buf);
        self.position = pos;
        Ok(self.position)
    }

    /// Reads up to `buf.len()` bytes, clamped to the remaining file length
    /// (§4.4). Never mutates dirent metadata.
    pub fn read(&mut self, partition: &mut Partition, device: &mut dyn Device, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.dirent.size as u64 - self.position;
        let count = (buf.len() as u64).min(remaining) as usize;
        if count == 0 {
            return Ok(0);
        }

        self.ensure_cache_loaded(partition, device)?;

        let cluster_size = self.cluster_size(partition) as usize;
        let mut done = 0usize;
        while done < count {
            let offset_in_cluster = (self.position as usize) % cluster_size;
            let take = (cluster_size - offset_in_cluster).min(count - done);
            let cache = self.cache.as_ref().unwrap();
            buf[done..done + take].copy_from_slice(&cache[offset_in_cluster..offset_in_cluster + take]);
            done += take;
            self.position += take as u64;

            // Refresh the cache onto the next cluster whenever position lands
            // on a boundary with more file left, even if this call's own
            // count is satisfied — otherwise the next call sees a loaded
            // cache that still points at the cluster behind it (§4.4).
            if self.position % cluster_size as u64 == 0 && self.position < self.dirent.size as u64 {
                self.advance_cluster(partition, device)?;
            }
        }
        Ok(done)
    }

    /// Writes `buf` at the current position, extending the file as needed
    /// (§4.4).
    pub fn write(&mut self, partition: &mut Partition, device: &mut dyn Device, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.file_modified = true;

        if self.cache.is_none() && self.dirent.size == 0 {
            self.set_length(partition, device, buf.len() as u64)?;
            self.position = 0;
        } else if self.position + buf.len() as u64 > self.dirent.size as u64 {
            let new_len = self.position + buf.len() as u64;
            let pos = self.position;
            self.set_length(partition, device, new_len)?;
            self.position = pos;
        }

        self.ensure_cache_loaded(partition, device)?;

        let cluster_size = self.cluster_size(partition) as usize;
        let mut done = 0usize;
        while done < buf.len() {
            let offset_in_cluster = (self.position as usize) % cluster_size;
            let take = (cluster_size - offset_in_cluster).min(buf.len() - done);
            {
                let cache = self.cache.as_mut().unwrap();
                cache[offset_in_cluster..offset_in_cluster + take].copy_from_slice(&buf[done..done + take]);
            }
            self.dirty = true;
            done += take;
            self.position += take as u64;

            // Same boundary refresh as `read`: advance whenever position
            // lands exactly on a cluster edge with more allocated file left,
            // regardless of whether this call's own `buf` is exhausted.
            if self.position % cluster_size as u64 == 0 && self.position < self.dirent.size as u64 {
                self.advance_cluster(partition, device)?;
            }
        }
        Ok(done)
    }

    /// Grows or shrinks the backing chain to exactly `new_length` bytes
    /// (§4.4).
    pub fn set_length(&mut self, partition: &mut Partition, device: &mut dyn Device, new_length: u64) -> Result<()> {
        let old_length = self.dirent.size as u64;
        if new_length == old_length {
            return Ok(());
        }

        let cluster_size = self.cluster_size(partition);
        if new_length > old_length {
            let old_count = if old_length == 0 { 0 } else { div_ceil(old_length, cluster_size) };
            let new_count = div_ceil(new_length, cluster_size);
            let delta = new_count - old_count;
            if delta > partition.free_cluster_count() as u64 {
                return Err(Error::NoSpace);
            }

            let mut remaining = delta;
            if self.dirent.first_cluster == END_OF_CHAIN {
                let first = partition.allocate_cluster(device, false)?;
                self.dirent.first_cluster = first;
                remaining -= 1;
            }

            let mut last = self.dirent.first_cluster;
            while partition.next_cluster_public(last)? != END_OF_CHAIN {
                last = partition.next_cluster_public(last)?;
            }
            for _ in 0..remaining {
                let next = partition.allocate_cluster(device, false)?;
                partition.link_cluster(last, next)?;
                last = next;
            }
            partition.write_chain_map(device)?;
        } else {
            let new_count = if new_length == 0 { 0 } else { div_ceil(new_length, cluster_size) };
            if new_count == 0 {
                partition.free_chain(device, self.dirent.first_cluster, None, true, false)?;
                partition.clear_cluster_entry(self.dirent.first_cluster)?;
                self.dirent.first_cluster = END_OF_CHAIN;
            } else {
                let mut cur = self.dirent.first_cluster;
                for _ in 0..new_count - 1 {
                    cur = partition.next_cluster_public(cur)?;
                }
                partition.free_chain(device, cur, None, true, false)?;
            }
            partition.write_chain_map(device)?;
            self.cache = None;
            self.dirty = false;
        }

        trace!("dirent {:?} resized {old_length} -> {new_length}", self.dirent.name());

        self.dirent.size = new_length as u32;
        let now = pack_time(Utc::now().naive_utc());
        self.dirent.modified = now;
        partition.update_dirent(device, &self.dirent)?;
        Ok(())
    }

    /// Flushes the dirty cluster and, if the file was modified, bumps the
    /// modified time and persists the dirent (§4.4, §5).
    pub fn close(mut self, partition: &mut Partition, device: &mut dyn Device) -> Result<()> {
        self.flush_cache(partition, device)?;
        if self.file_modified {
            let now = pack_time(Utc::now().naive_utc());
            self.dirent.modified = now;
            partition.update_dirent(device, &self.dirent)?;
        }
        Ok(())
    }
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;
    use crate::fatx::partition::{PartitionKind, HEADER_SIZE, CHAIN_MAP_ALIGN, MAGIC};

    fn fresh_partition(cluster_count: u32, sectors_per_cluster: u32) -> (MemDevice, Partition) {
        let cluster_size = sectors_per_cluster * 512;
        let chain_map_size = ((cluster_count as u64 * 2 + CHAIN_MAP_ALIGN - 1) / CHAIN_MAP_ALIGN) * CHAIN_MAP_ALIGN;
        let file_area_offset = HEADER_SIZE + chain_map_size;
        let total = file_area_offset + cluster_count as u64 * cluster_size as u64;

        let mut bytes = vec![0u8; total as usize];
        bytes[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&sectors_per_cluster.to_be_bytes());
        bytes[12..16].copy_from_slice(&1u32.to_be_bytes());

        let map_off = HEADER_SIZE as usize;
        bytes[map_off..map_off + 2].copy_from_slice(&0xFFFFu16.to_be_bytes());

        let mut device = MemDevice::new(bytes);
        let partition = Partition::read(&mut device, 0, total, "test", PartitionKind::Regular).unwrap();
        (device, partition)
    }

    #[test]
    fn write_then_reopen_round_trips_for_several_sizes() {
        for n in [0usize, 1, 4095, 4096, 4097, 40960] {
            let (mut device, mut partition) = fresh_partition(64, 8);
            let root = partition.root_dir_first_cluster;
            let payload = vec![0xABu8; n];

            {
                let mut stream =
                    DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Create).unwrap();
                stream.write(&mut partition, &mut device, &payload).unwrap();
                stream.close(&mut partition, &mut device).unwrap();
            }

            let mut stream =
                DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Open).unwrap();
            let mut readback = vec![0u8; n];
            let read = stream.read(&mut partition, &mut device, &mut readback).unwrap();
            assert_eq!(read, n);
            assert_eq!(readback, payload, "size {n}");
        }
    }

    #[test]
    fn extend_then_truncate_back_restores_original_chain_length() {
        let (mut device, mut partition) = fresh_partition(64, 8);
        let root = partition.root_dir_first_cluster;
        let mut stream = DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Create).unwrap();
        stream.set_length(&mut partition, &mut device, 4096).unwrap();
        stream.set_length(&mut partition, &mut device, 4 * 4096).unwrap();
        stream.set_length(&mut partition, &mut device, 4096).unwrap();
        assert_eq!(stream.len(), 4096);

        let mut cur = stream.dirent().first_cluster;
        let mut len = 1;
        while partition.next_cluster_public(cur).unwrap() != END_OF_CHAIN {
            cur = partition.next_cluster_public(cur).unwrap();
            len += 1;
        }
        assert_eq!(len, 1);
    }

    #[test]
    fn read_in_chunks_across_a_cluster_boundary_does_not_return_stale_bytes() {
        let (mut device, mut partition) = fresh_partition(64, 8);
        let root = partition.root_dir_first_cluster;
        let cluster_size = partition.cluster_size as usize;
        let payload: Vec<u8> = (0..cluster_size * 2).map(|i| (i % 251) as u8).collect();

        {
            let mut stream =
                DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Create).unwrap();
            stream.write(&mut partition, &mut device, &payload).unwrap();
            stream.close(&mut partition, &mut device).unwrap();
        }

        let mut stream = DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Open).unwrap();
        // First chunk ends exactly on the cluster boundary; the stale-cache
        // bug left `current_cluster` pointing at cluster 0 afterwards, so the
        // following read would silently reread the first cluster's bytes.
        let mut first = vec![0u8; cluster_size];
        stream.read(&mut partition, &mut device, &mut first).unwrap();
        let mut second = vec![0u8; cluster_size];
        stream.read(&mut partition, &mut device, &mut second).unwrap();

        assert_eq!(first, payload[..cluster_size]);
        assert_eq!(second, payload[cluster_size..]);
    }

    #[test]
    fn write_in_chunks_across_a_cluster_boundary_does_not_corrupt_the_first_cluster() {
        let (mut device, mut partition) = fresh_partition(64, 8);
        let root = partition.root_dir_first_cluster;
        let cluster_size = partition.cluster_size as usize;

        let mut stream = DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Create).unwrap();
        stream.set_length(&mut partition, &mut device, (cluster_size * 2) as u64).unwrap();
        stream.seek(&mut partition, &mut device, 0).unwrap();

        let first_chunk = vec![0x11u8; cluster_size];
        let second_chunk = vec![0x22u8; cluster_size];
        stream.write(&mut partition, &mut device, &first_chunk).unwrap();
        stream.write(&mut partition, &mut device, &second_chunk).unwrap();
        stream.close(&mut partition, &mut device).unwrap();

        let mut readback = DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Open).unwrap();
        let mut buf = vec![0u8; cluster_size * 2];
        readback.read(&mut partition, &mut device, &mut buf).unwrap();
        assert_eq!(&buf[..cluster_size], &first_chunk[..]);
        assert_eq!(&buf[cluster_size..], &second_chunk[..]);
    }

    #[test]
    fn create_new_fails_on_existing_dirent() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::Create)
            .unwrap()
            .close(&mut partition, &mut device)
            .unwrap();
        let second = DirentStream::open(&mut partition, &mut device, root, "f", OpenMode::CreateNew);
        assert!(matches!(second, Err(Error::AlreadyExists)));
    }
}
