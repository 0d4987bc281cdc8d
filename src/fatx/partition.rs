//! The FATX partition engine: header, chain map, cluster I/O, and the
//! directory-entry operations built on top of them (§4.1, §4.2).

use chrono::Utc;
use log::{debug, trace, warn};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::fatx::dirent::{pack_time, Dirent, Slot, DIRENT_SIZE};

pub const MAGIC: u32 = 0x5854_4146;
pub const HEADER_SIZE: u64 = 0x1000;
pub const CHAIN_MAP_ALIGN: u64 = 4096;
pub const FREE_CLUSTER: u32 = 0;
pub const END_OF_CHAIN: u32 = 0xFFFF_FFFF;

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Regular and USB partitions derive the same cluster-count/chain-map-size
/// geometry from partition length and cluster size; USB additionally
/// re-verifies the chain-map entry size by peeking the map itself rather
/// than trusting the derived guess (§3, §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionKind {
    Regular,
    Usb,
}

/// One self-describing FATX volume living inside a byte range of a device.
pub struct Partition {
    pub offset: u64,
    pub length: u64,
    pub name: String,
    pub kind: PartitionKind,

    pub magic: u32,
    pub id: u32,
    pub sectors_per_cluster: u32,
    pub root_dir_first_cluster: u32,

    pub cluster_size: u32,
    pub cluster_count: u32,
    pub entry_size: u8,
    pub chain_map_offset: u64,
    pub chain_map_size: u64,
    pub file_area_offset: u64,
    pub dirents_per_cluster: u32,

    chain_map: Vec<u32>,
    free_clusters: u32,

    root_cache: Option<Vec<Dirent>>,
    last_cache: Option<(u32, Vec<Dirent>)>,
}

impl Partition {
    /// Reads the header and chain map for a partition occupying
    /// `[offset, offset+length)` of `device`. Returns [`Error::NotFatx`] if
    /// the magic doesn't match; callers enumerating a device's layout (see
    /// [`crate::fatx::volume`]) silently drop partitions that fail this way.
    pub fn read(device: &mut dyn Device, offset: u64, length: u64, name: &str, kind: PartitionKind) -> Result<Self> {
        let mut header = [0u8; 16];
        device.read_at(offset, &mut header)?;
        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            warn!("partition {name:?} at offset {offset:#x}: bad magic {magic:#010x}");
            return Err(Error::NotFatx);
        }
        let id = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let sectors_per_cluster = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let root_dir_first_cluster = u32::from_be_bytes(header[12..16].try_into().unwrap());

        let cluster_size = sectors_per_cluster * 512;

        // cluster_count needs chain_map_size which needs entry_size which needs
        // cluster_count: resolved by picking entry size from a first guess,
        // then refining. One pass is enough — chain map size rounds to 4096
        // and is tiny relative to partition length, so the approximation
        // never flips entry_size once refined.
        let approx_count = ((length - HEADER_SIZE) / cluster_size as u64) as u32;
        let mut entry_size: u8 = if approx_count < 0xFFF0 { 2 } else { 4 };
        let cluster_count = {
            let map_size = round_up(approx_count as u64 * entry_size as u64, CHAIN_MAP_ALIGN);
            ((length - HEADER_SIZE - map_size) / cluster_size as u64) as u32
        };
        let chain_map_size = round_up(cluster_count as u64 * entry_size as u64, CHAIN_MAP_ALIGN);
        let file_area_offset = offset + HEADER_SIZE + chain_map_size;
        let chain_map_offset = offset + HEADER_SIZE;

        if matches!(kind, PartitionKind::Usb) {
            // USB quirk (§3): peek the first two bytes of the chain map to
            // re-verify the entry size rather than trusting the derived
            // guess; 0xFFF8 means 16-bit entries, anything else means 32-bit.
            let mut probe = [0u8; 2];
            device.read_at(chain_map_offset, &mut probe)?;
            entry_size = if u16::from_be_bytes(probe) == 0xFFF8 { 2 } else { 4 };
        }

        let dirents_per_cluster = cluster_size / DIRENT_SIZE as u32;

        let mut partition = Self {
            offset,
            length,
            name: name.to_string(),
            kind,
            magic,
            id,
            sectors_per_cluster,
            root_dir_first_cluster,
            cluster_size,
            cluster_count,
            entry_size,
            chain_map_offset,
            chain_map_size,
            file_area_offset,
            dirents_per_cluster,
            chain_map: Vec::new(),
            free_clusters: 0,
            root_cache: None,
            last_cache: None,
        };
        partition.read_chain_map(device)?;
        debug!(
            "mounted partition {name:?}: {} clusters of {} bytes, {} free",
            partition.cluster_count, partition.cluster_size, partition.free_clusters
        );
        Ok(partition)
    }

    fn read_chain_map(&mut self, device: &mut dyn Device) -> Result<()> {
        let mut raw = vec![0u8; self.chain_map_size as usize];
        device.read_at(self.chain_map_offset, &mut raw)?;

        let mut map = Vec::with_capacity(self.cluster_count as usize + 1);
        map.push(0); // index 0 is never addressed; keeps entries 1-based.
        if self.entry_size == 2 {
            for chunk in raw.chunks_exact(2).take(self.cluster_count as usize) {
                let v = u16::from_be_bytes([chunk[0], chunk[1]]);
                map.push(widen_chain_entry(v));
            }
        } else {
            for chunk in raw.chunks_exact(4).take(self.cluster_count as usize) {
                map.push(u32::from_be_bytes(chunk.try_into().unwrap()));
            }
        }
        map.resize(self.cluster_count as usize + 1, FREE_CLUSTER);

        self.free_clusters = map[1..].iter().filter(|&&v| v == FREE_CLUSTER).count() as u32;
        self.chain_map = map;
        Ok(())
    }

    pub fn write_chain_map(&self, device: &mut dyn Device) -> Result<()> {
        let mut raw = vec![0u8; self.chain_map_size as usize];
        if self.entry_size == 2 {
            for (i, &v) in self.chain_map[1..].iter().enumerate() {
                let narrowed = if v == END_OF_CHAIN { 0xFFFF } else { v as u16 };
                raw[i * 2..i * 2 + 2].copy_from_slice(&narrowed.to_be_bytes());
            }
        } else {
            for (i, &v) in self.chain_map[1..].iter().enumerate() {
                raw[i * 4..i * 4 + 4].copy_from_slice(&v.to_be_bytes());
            }
        }
        device.write_at(self.chain_map_offset, &raw)?;
        Ok(())
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.file_area_offset + (cluster as u64 - 1) * self.cluster_size as u64
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster < 1 || cluster > self.cluster_count {
            return Err(Error::BadCluster);
        }
        Ok(())
    }

    pub fn read_cluster(&self, device: &mut dyn Device, cluster: u32, buf: &mut [u8]) -> Result<()> {
        self.check_cluster(cluster)?;
        device.read_at(self.cluster_offset(cluster), buf)
    }

    pub fn write_cluster(&self, device: &mut dyn Device, cluster: u32, buf: &[u8]) -> Result<()> {
        self.check_cluster(cluster)?;
        device.write_at(self.cluster_offset(cluster), buf)
    }

    fn next_cluster(&self, cluster: u32) -> Result<u32> {
        self.check_cluster(cluster)?;
        Ok(self.chain_map[cluster as usize])
    }

    /// Reads the chain-map successor of `cluster`, for callers outside this
    /// module (dirent streams walking a chain to seek or resize).
    pub fn next_cluster_public(&self, cluster: u32) -> Result<u32> {
        self.next_cluster(cluster)
    }

    fn set_next_cluster(&mut self, cluster: u32, next: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        self.chain_map[cluster as usize] = next;
        Ok(())
    }

    /// Links `cluster`'s chain-map entry to `next`, without persisting
    /// (callers batch a single terminal write, per §5's ordering rule for
    /// `SetLength`'s growth loop).
    pub fn link_cluster(&mut self, cluster: u32, next: u32) -> Result<()> {
        self.set_next_cluster(cluster, next)
    }

    /// Clears a single chain-map entry to free without touching the
    /// incremental free counter (used when [`Self::free_chain`] already
    /// accounted for it but the chain's last cluster itself also needs
    /// nulling, per §4.1's `SetLength` shrink-to-zero case).
    pub fn clear_cluster_entry(&mut self, cluster: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        if self.chain_map[cluster as usize] != FREE_CLUSTER {
            self.chain_map[cluster as usize] = FREE_CLUSTER;
            self.free_clusters += 1;
        }
        Ok(())
    }

    /// Linear scan for the first free cluster (§4.1). Marks it end-of-chain
    /// so it reads as "taken" even before being linked into a chain.
    pub fn allocate_cluster(&mut self, device: &mut dyn Device, persist: bool) -> Result<u32> {
        let found = self.chain_map[1..]
            .iter()
            .position(|&v| v == FREE_CLUSTER)
            .map(|i| i as u32 + 1);
        let cluster = match found {
            Some(c) => c,
            None => return Err(Error::NoSpace),
        };
        self.chain_map[cluster as usize] = END_OF_CHAIN;
        self.free_clusters -= 1;
        trace!("allocated cluster {cluster} ({} free remain)", self.free_clusters);
        if persist {
            self.write_chain_map(device)?;
        }
        Ok(cluster)
    }

    /// Walks the chain from `start`, freeing up to `count` clusters (§4.1).
    /// `count = None` means "walk to the natural end". When
    /// `mark_first_as_last`, the starting cluster becomes the new
    /// end-of-chain rather than being freed itself.
    pub fn free_chain(
        &mut self,
        device: &mut dyn Device,
        start: u32,
        count: Option<u64>,
        mark_first_as_last: bool,
        write_map: bool,
    ) -> Result<()> {
        let mut cur = start;
        let mut remaining = count;
        if mark_first_as_last {
            self.check_cluster(cur)?;
            let next = self.next_cluster(cur)?;
            self.chain_map[cur as usize] = END_OF_CHAIN;
            if next == END_OF_CHAIN {
                if write_map {
                    self.write_chain_map(device)?;
                }
                return Ok(());
            }
            cur = next;
        }
        loop {
            if let Some(0) = remaining {
                break;
            }
            let next = self.next_cluster(cur)?;
            self.chain_map[cur as usize] = FREE_CLUSTER;
            self.free_clusters += 1;
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
            if next == END_OF_CHAIN {
                break;
            }
            cur = next;
        }
        if write_map {
            self.write_chain_map(device)?;
        }
        Ok(())
    }

    /// Full linear recount, used as a cross-check against the incremental
    /// counter (§8's free-space invariant; §B's amortized counter).
    pub fn free_cluster_count_scan(&self) -> u32 {
        self.chain_map[1..].iter().filter(|&&v| v == FREE_CLUSTER).count() as u32
    }

    pub fn free_cluster_count(&self) -> u32 {
        self.free_clusters
    }

    pub fn free_space_bytes(&self) -> u64 {
        self.free_clusters as u64 * self.cluster_size as u64
    }

    fn invalidate_caches(&mut self, cluster: u32) {
        if self.root_cache.is_some() && cluster == self.root_dir_first_cluster {
            self.root_cache = None;
        }
        if let Some((c, _)) = &self.last_cache {
            if *c == cluster {
                self.last_cache = None;
            }
        }
    }

    /// Reads every dirent slot reachable from `cluster`'s chain, stopping
    /// at the first terminator slot encountered anywhere in the walk
    /// (§4.2). Soft-deleted entries are included.
    pub fn read_directory(&mut self, device: &mut dyn Device, cluster: u32) -> Result<Vec<Dirent>> {
        if cluster == self.root_dir_first_cluster {
            if let Some(cached) = &self.root_cache {
                return Ok(cached.clone());
            }
        } else if let Some((c, cached)) = &self.last_cache {
            if *c == cluster {
                return Ok(cached.clone());
            }
        }

        let mut entries = Vec::new();
        let mut cur = cluster;
        let mut buf = vec![0u8; self.cluster_size as usize];
        'walk: loop {
            self.read_cluster(device, cur, &mut buf)?;
            for slot in 0..self.dirents_per_cluster as usize {
                let raw = &buf[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE];
                match Dirent::from_bytes(raw, cur, slot) {
                    Slot::Terminator => break 'walk,
                    Slot::Entry(d) => entries.push(d),
                }
            }
            let next = self.next_cluster(cur)?;
            if next == END_OF_CHAIN {
                break;
            }
            cur = next;
        }

        if cluster == self.root_dir_first_cluster {
            self.root_cache = Some(entries.clone());
        } else {
            self.last_cache = Some((cluster, entries.clone()));
        }
        Ok(entries)
    }

    /// Creates a new dirent in `parent_cluster`'s directory (§4.2).
    pub fn create_dirent(
        &mut self,
        device: &mut dyn Device,
        parent_cluster: u32,
        name: &str,
        is_directory: bool,
    ) -> Result<Dirent> {
        self.invalidate_caches(parent_cluster);

        let now = pack_time(Utc::now().naive_utc());
        let mut cur = parent_cluster;
        let mut buf = vec![0u8; self.cluster_size as usize];
        loop {
            self.read_cluster(device, cur, &mut buf)?;
            for slot in 0..self.dirents_per_cluster as usize {
                let raw = &buf[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE];
                // A slot is reusable once it is no longer "live": empty
                // (0x00/0xFF) or soft-deleted (0xE5). Reusing soft-deleted
                // slots rather than always appending is what keeps a churned
                // directory from growing without bound (§8 scenario 2).
                if matches!(raw[0], 0x00 | 0xFF | 0xE5) {
                    let first_cluster = if is_directory {
                        let data_cluster = self.allocate_cluster(device, false)?;
                        let zero = vec![0u8; self.cluster_size as usize];
                        self.write_cluster(device, data_cluster, &zero)?;
                        self.write_chain_map(device)?;
                        data_cluster
                    } else {
                        END_OF_CHAIN
                    };
                    let dirent = Dirent::new(cur, slot, name, is_directory, first_cluster, now)?;
                    self.write_dirent_slot(device, &dirent)?;
                    self.invalidate_caches(parent_cluster);
                    return Ok(dirent);
                }
            }
            let next = self.next_cluster(cur)?;
            if next == END_OF_CHAIN {
                let fresh = self.allocate_cluster(device, false)?;
                self.set_next_cluster(cur, fresh)?;
                self.chain_map[fresh as usize] = END_OF_CHAIN;
                self.write_chain_map(device)?;
                let zero = vec![0u8; self.cluster_size as usize];
                self.write_cluster(device, fresh, &zero)?;
                cur = fresh;
                continue;
            }
            cur = next;
        }
    }

    fn write_dirent_slot(&self, device: &mut dyn Device, dirent: &Dirent) -> Result<()> {
        let offset =
            self.cluster_offset(dirent.parent_cluster) + (dirent.slot_index * DIRENT_SIZE) as u64;
        device.write_at(offset, &dirent.to_bytes())?;
        Ok(())
    }

    /// Rewrites a dirent's slot in place (§4.2).
    pub fn update_dirent(&mut self, device: &mut dyn Device, dirent: &Dirent) -> Result<()> {
        self.write_dirent_slot(device, dirent)?;
        self.invalidate_caches(dirent.parent_cluster);
        Ok(())
    }

    /// Frees the dirent's cluster chain (if any) and soft-deletes it.
    pub fn delete_dirent(&mut self, device: &mut dyn Device, dirent: &mut Dirent) -> Result<()> {
        if dirent.first_cluster != END_OF_CHAIN {
            self.free_chain(device, dirent.first_cluster, None, false, true)?;
        }
        dirent.name_len = 0xE5;
        self.update_dirent(device, dirent)
    }

    /// Renames a dirent in place, bumping its modified/accessed times.
    pub fn rename_dirent(&mut self, device: &mut dyn Device, dirent: &mut Dirent, new_name: &str) -> Result<()> {
        dirent.set_name(new_name)?;
        let now = pack_time(Utc::now().naive_utc());
        dirent.modified = now;
        dirent.accessed = now;
        self.update_dirent(device, dirent)
    }

    /// Moves `dirent` into `new_parent_cluster`, soft-deleting the source
    /// slot and clearing its `first_cluster` afterward (§4.2, §9).
    ///
    /// Rejects moving a directory into itself or one of its own descendants
    /// via [`Self::cluster_is_self_or_descendant`], the structural form of
    /// the [`Self::would_create_cycle`] guard callers working from paths use.
    pub fn move_dirent(
        &mut self,
        device: &mut dyn Device,
        new_parent_cluster: u32,
        dirent: &mut Dirent,
    ) -> Result<()> {
        if dirent.parent_cluster == new_parent_cluster {
            return Ok(());
        }

        if dirent.is_directory()
            && self.cluster_is_self_or_descendant(device, dirent.first_cluster, new_parent_cluster)?
        {
            return Err(Error::WouldCreateCycle);
        }

        let mut target = self.create_dirent(device, new_parent_cluster, &dirent.name(), dirent.is_directory())?;
        target.first_cluster = dirent.first_cluster;
        target.size = dirent.size;
        target.created = dirent.created;
        target.modified = dirent.modified;
        target.accessed = dirent.accessed;
        target.attributes = dirent.attributes;
        self.update_dirent(device, &target)?;

        // Source slot is soft-deleted and its chain pointer cleared so a
        // later undelete cannot re-claim a chain the target now owns.
        dirent.name_len = 0xE5;
        dirent.first_cluster = END_OF_CHAIN;
        self.update_dirent(device, dirent)?;

        *dirent = target;
        Ok(())
    }

    /// Resolves a `\`-separated path starting at `cluster`, skipping
    /// soft-deleted entries, optionally requiring the final component to be
    /// a directory or a file (§4.2).
    pub fn lookup(
        &mut self,
        device: &mut dyn Device,
        cluster: u32,
        path: &str,
        want_dir: Option<bool>,
    ) -> Result<Option<Dirent>> {
        let components = normalize_path(path);
        if components.is_empty() {
            return Ok(None);
        }
        let mut current_cluster = cluster;
        for (i, component) in components.iter().enumerate() {
            let entries = self.read_directory(device, current_cluster)?;
            let last = i == components.len() - 1;
            let found = entries.iter().find(|e| {
                !e.is_deleted() && e.name().eq_ignore_ascii_case(component)
            });
            match found {
                None => return Ok(None),
                Some(entry) => {
                    if !last && !entry.is_directory() {
                        return Ok(None);
                    }
                    if last {
                        if let Some(want) = want_dir {
                            if entry.is_directory() != want {
                                return Ok(None);
                            }
                        }
                        return Ok(Some(entry.clone()));
                    }
                    current_cluster = entry.first_cluster;
                }
            }
        }
        Ok(None)
    }

    /// Recursively soft-deletes a directory: children first, then the
    /// directory's own dirent (§4.2).
    pub fn delete_recursive(&mut self, device: &mut dyn Device, dirent: &mut Dirent) -> Result<()> {
        if dirent.is_directory() {
            let children = self.read_directory(device, dirent.first_cluster)?;
            for mut child in children {
                if child.is_deleted() {
                    continue;
                }
                self.delete_recursive(device, &mut child)?;
            }
        }
        self.delete_dirent(device, dirent)
    }

    /// True if `dst_path` names `src_path` itself or a descendant of it,
    /// case-insensitively — the guard a recursive copy/move must apply
    /// before calling [`Self::move_dirent`] (§9, §B).
    pub fn would_create_cycle(&self, src_path: &str, dst_path: &str) -> bool {
        let src = normalize_path(src_path).join("\\").to_ascii_lowercase();
        let dst = normalize_path(dst_path).join("\\").to_ascii_lowercase();
        if src.is_empty() {
            return true;
        }
        dst == src || dst.starts_with(&format!("{src}\\"))
    }

    /// True if `target_cluster` is `ancestor_cluster` itself or lies
    /// anywhere beneath it in the directory tree. [`Self::move_dirent`]'s
    /// cluster-number form of [`Self::would_create_cycle`]: it has no path
    /// strings to compare, only the cluster being moved and the cluster
    /// it's moving into, so it walks the tree instead.
    fn cluster_is_self_or_descendant(
        &mut self,
        device: &mut dyn Device,
        ancestor_cluster: u32,
        target_cluster: u32,
    ) -> Result<bool> {
        if ancestor_cluster == target_cluster {
            return Ok(true);
        }
        let entries = self.read_directory(device, ancestor_cluster)?;
        for entry in entries {
            if entry.is_deleted() || !entry.is_directory() {
                continue;
            }
            if self.cluster_is_self_or_descendant(device, entry.first_cluster, target_cluster)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Widens a 2-byte chain-map entry's end-of-chain sentinel: any value whose
/// top nibble is `0xFFF` becomes the canonical `0xFFFFFFFF` (§3, §4.1).
fn widen_chain_entry(v: u16) -> u32 {
    if v & 0xFFF0 == 0xFFF0 {
        END_OF_CHAIN
    } else {
        v as u32
    }
}

/// Splits a `\`-or-`/`-separated path into components, trimming a leading
/// or trailing separator; an empty path or a bare separator denotes root
/// (represented as an empty `Vec`, which callers treat as "no path").
pub fn normalize_path(path: &str) -> Vec<String> {
    let normalized = path.replace('/', "\\");
    let trimmed = normalized.trim_matches('\\');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('\\').map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;

    fn fresh_partition(cluster_count: u32, sectors_per_cluster: u32) -> (MemDevice, Partition) {
        let cluster_size = sectors_per_cluster * 512;
        let chain_map_size = round_up(cluster_count as u64 * 2, CHAIN_MAP_ALIGN);
        let file_area_offset = HEADER_SIZE + chain_map_size;
        let total = file_area_offset + cluster_count as u64 * cluster_size as u64;

        let mut bytes = vec![0u8; total as usize];
        bytes[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&sectors_per_cluster.to_be_bytes());
        bytes[12..16].copy_from_slice(&1u32.to_be_bytes()); // root at cluster 1

        // chain map: cluster 1 (root) is allocated end-of-chain.
        let map_off = HEADER_SIZE as usize;
        bytes[map_off..map_off + 2].copy_from_slice(&0xFFFFu16.to_be_bytes());

        let mut device = MemDevice::new(bytes);
        let partition = Partition::read(&mut device, 0, total, "test", PartitionKind::Regular).unwrap();
        (device, partition)
    }

    #[test]
    fn free_cluster_count_matches_full_scan() {
        let (_device, partition) = fresh_partition(16, 8);
        assert_eq!(partition.free_cluster_count(), partition.free_cluster_count_scan());
        assert_eq!(partition.free_cluster_count(), 15);
    }

    #[test]
    fn create_then_lookup_round_trips() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        partition.create_dirent(&mut device, root, "foo.txt", false).unwrap();

        let found = partition.lookup(&mut device, root, "\\foo.txt", None).unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().name(), "foo.txt");
    }

    #[test]
    fn soft_deleted_entries_are_invisible_to_lookup() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        let mut dirent = partition.create_dirent(&mut device, root, "foo.txt", false).unwrap();
        partition.delete_dirent(&mut device, &mut dirent).unwrap();

        let found = partition.lookup(&mut device, root, "\\foo.txt", None).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn deleting_middle_sibling_frees_its_slot_for_reuse() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        for i in 0..5 {
            partition
                .create_dirent(&mut device, root, &format!("f{i}.txt"), false)
                .unwrap();
        }
        let mut middle = partition.lookup(&mut device, root, "\\f2.txt", None).unwrap().unwrap();
        partition.delete_dirent(&mut device, &mut middle).unwrap();

        let fresh = partition.create_dirent(&mut device, root, "f5.txt", false).unwrap();
        assert_ne!(fresh.name_len, 0xE5);
        assert_eq!(fresh.slot_index, middle.slot_index);
    }

    #[test]
    fn rename_then_lookup_by_new_name_only() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        let mut dirent = partition.create_dirent(&mut device, root, "foo", false).unwrap();
        partition.rename_dirent(&mut device, &mut dirent, "bar").unwrap();

        assert!(partition.lookup(&mut device, root, "\\foo", None).unwrap().is_none());
        assert!(partition.lookup(&mut device, root, "\\bar", None).unwrap().is_some());
    }

    #[test]
    fn would_create_cycle_rejects_moving_into_own_descendant() {
        let (_device, partition) = fresh_partition(16, 8);
        assert!(partition.would_create_cycle("\\A", "\\A\\B"));
        assert!(partition.would_create_cycle("\\A", "\\a\\b"));
        assert!(!partition.would_create_cycle("\\A", "\\B"));
    }

    #[test]
    fn move_dirent_rejects_moving_a_directory_into_its_own_descendant() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        let mut a = partition.create_dirent(&mut device, root, "A", true).unwrap();
        let b = partition
            .create_dirent(&mut device, a.first_cluster, "B", true)
            .unwrap();

        let result = partition.move_dirent(&mut device, b.first_cluster, &mut a);
        assert!(matches!(result, Err(Error::WouldCreateCycle)));
    }

    #[test]
    fn move_dirent_relocates_into_an_unrelated_directory() {
        let (mut device, mut partition) = fresh_partition(16, 8);
        let root = partition.root_dir_first_cluster;
        let mut file = partition.create_dirent(&mut device, root, "f.txt", false).unwrap();
        let dest = partition.create_dirent(&mut device, root, "dest", true).unwrap();

        partition.move_dirent(&mut device, dest.first_cluster, &mut file).unwrap();

        assert!(partition.lookup(&mut device, root, "\\f.txt", None).unwrap().is_none());
        assert!(partition
            .lookup(&mut device, root, "\\dest\\f.txt", None)
            .unwrap()
            .is_some());
    }

    #[test]
    fn usb_partition_reads_same_geometry_as_regular_with_16_bit_chain_map() {
        let cluster_count = 16u32;
        let sectors_per_cluster = 8u32;
        let cluster_size = sectors_per_cluster * 512;
        let chain_map_size = round_up(cluster_count as u64 * 2, CHAIN_MAP_ALIGN);
        let file_area_offset = HEADER_SIZE + chain_map_size;
        let total = file_area_offset + cluster_count as u64 * cluster_size as u64;

        let mut bytes = vec![0u8; total as usize];
        bytes[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&sectors_per_cluster.to_be_bytes());
        bytes[12..16].copy_from_slice(&1u32.to_be_bytes());

        let map_off = HEADER_SIZE as usize;
        bytes[map_off..map_off + 2].copy_from_slice(&0xFFF8u16.to_be_bytes());

        let mut device = MemDevice::new(bytes);
        let partition =
            Partition::read(&mut device, 0, total, "Data", PartitionKind::Usb).unwrap();
        assert_eq!(partition.entry_size, 2);
        assert_eq!(partition.cluster_count, cluster_count);
        assert_eq!(partition.chain_map_size, chain_map_size);
    }

    #[test]
    fn usb_partition_entry_size_peek_overrides_derived_guess_to_32_bit() {
        let cluster_count = 16u32;
        let sectors_per_cluster = 8u32;
        let cluster_size = sectors_per_cluster * 512;
        // Derived guess from partition length picks a 2-byte entry size
        // (cluster_count is far below 0xFFF0); the chain map's own first
        // entry says otherwise, so the USB peek must win.
        let chain_map_size = round_up(cluster_count as u64 * 2, CHAIN_MAP_ALIGN);
        let file_area_offset = HEADER_SIZE + chain_map_size;
        let total = file_area_offset + cluster_count as u64 * cluster_size as u64;

        let mut bytes = vec![0u8; total as usize];
        bytes[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&sectors_per_cluster.to_be_bytes());
        bytes[12..16].copy_from_slice(&1u32.to_be_bytes());

        let map_off = HEADER_SIZE as usize;
        bytes[map_off..map_off + 2].copy_from_slice(&0x0001u16.to_be_bytes());

        let mut device = MemDevice::new(bytes);
        let partition =
            Partition::read(&mut device, 0, total, "Data", PartitionKind::Usb).unwrap();
        assert_eq!(partition.entry_size, 4);
    }
}
