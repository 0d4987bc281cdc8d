//! Fixed-file block allocator for XDBF container files (§4.6, §6.2).
//!
//! A single [`XdbfFile`] owns an allocated-section table, a free-section
//! table, and a data area; it performs best-fit allocation, splits and
//! coalesces free space, and can rebuild the whole file contiguously when
//! fragmentation defeats allocation.

use log::{debug, trace, warn};

use crate::device::Device;
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x5844_4246;
pub const VERSION: u32 = 0x0001_0000;
const HEADER_SIZE: u64 = 24;
const ENTRY_SIZE: u64 = 0x12;
const FREE_SIZE: u64 = 8;

/// XDBF entry namespaces (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i16)]
pub enum Namespace {
    Achievement = 1,
    Image = 2,
    Setting = 3,
    Title = 4,
    String = 5,
    AvatarAward = 6,
}

impl Namespace {
    fn from_i16(value: i16) -> Option<Self> {
        Some(match value {
            1 => Namespace::Achievement,
            2 => Namespace::Image,
            3 => Namespace::Setting,
            4 => Namespace::Title,
            5 => Namespace::String,
            6 => Namespace::AvatarAward,
            _ => return None,
        })
    }
}

/// A live allocation: `(namespace, id)` uniquely keys it (§8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatedSection {
    pub namespace: Namespace,
    pub id: u64,
    pub offset: u32,
    pub size: u32,
}

/// A hole in the data area available for future allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeSection {
    pub offset: u32,
    pub size: u32,
}

/// The allocator state for one XDBF file, plus its backing stream.
pub struct XdbfFile {
    version: u32,
    entry_max: u32,
    free_max: u32,
    allocated: Vec<AllocatedSection>,
    free: Vec<FreeSection>,
}

impl XdbfFile {
    fn section_start(&self) -> u64 {
        ((self.free_max as u64 + 3) * FREE_SIZE) + (self.entry_max as u64 * ENTRY_SIZE)
    }

    fn entry_table_offset(&self) -> u64 {
        HEADER_SIZE
    }

    fn free_table_offset(&self) -> u64 {
        HEADER_SIZE + self.entry_max as u64 * ENTRY_SIZE
    }

    /// Creates a brand-new, empty XDBF file with the given table capacities
    /// and writes its header (and empty tables) to `device`.
    pub fn create(device: &mut dyn Device, entry_max: u32, free_max: u32) -> Result<Self> {
        let mut file = Self {
            version: VERSION,
            entry_max,
            free_max,
            allocated: Vec::new(),
            free: Vec::new(),
        };
        let section_start = file.section_start();
        device.set_len(section_start)?;
        file.save(device)?;
        Ok(file)
    }

    /// Reads an existing XDBF file's header and both tables (§4.6 Read).
    pub fn read(device: &mut dyn Device) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        device.read_at(0, &mut header)?;
        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != MAGIC {
            warn!("xdbf magic mismatch: {magic:#010x}");
            return Err(Error::InvalidXdbf);
        }
        let version = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let entry_max = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let entry_current = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let free_max = u32::from_be_bytes(header[16..20].try_into().unwrap());
        let free_current = u32::from_be_bytes(header[20..24].try_into().unwrap());

        let mut allocated = Vec::with_capacity(entry_current as usize);
        let mut buf = [0u8; ENTRY_SIZE as usize];
        for i in 0..entry_current as u64 {
            device.read_at(HEADER_SIZE + i * ENTRY_SIZE, &mut buf)?;
            let namespace_raw = i16::from_be_bytes(buf[0..2].try_into().unwrap());
            let namespace = Namespace::from_i16(namespace_raw).ok_or(Error::InvalidXdbf)?;
            let id = u64::from_be_bytes(buf[2..10].try_into().unwrap());
            let offset = u32::from_be_bytes(buf[10..14].try_into().unwrap());
            let size = u32::from_be_bytes(buf[14..18].try_into().unwrap());
            allocated.push(AllocatedSection {
                namespace,
                id,
                offset,
                size,
            });
        }

        let free_table_offset = HEADER_SIZE + entry_max as u64 * ENTRY_SIZE;
        let mut free = Vec::with_capacity(free_current as usize);
        let mut fbuf = [0u8; FREE_SIZE as usize];
        for i in 0..free_current as u64 {
            device.read_at(free_table_offset + i * FREE_SIZE, &mut fbuf)?;
            let offset = u32::from_be_bytes(fbuf[0..4].try_into().unwrap());
            let size = u32::from_be_bytes(fbuf[4..8].try_into().unwrap());
            free.push(FreeSection { offset, size });
        }

        debug!(
            "xdbf opened: {} allocated / {} free sections, entryMax={entry_max}, freeMax={free_max}",
            allocated.len(),
            free.len()
        );

        Ok(Self {
            version,
            entry_max,
            free_max,
            allocated,
            free,
        })
    }

    /// Writes the header and both tables back (§4.6 Save). The data area
    /// itself is left untouched.
    pub fn save(&mut self, device: &mut dyn Device) -> Result<()> {
        self.sort();
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&self.version.to_be_bytes());
        header[8..12].copy_from_slice(&self.entry_max.to_be_bytes());
        header[12..16].copy_from_slice(&(self.allocated.len() as u32).to_be_bytes());
        header[16..20].copy_from_slice(&self.free_max.to_be_bytes());
        header[20..24].copy_from_slice(&(self.free.len() as u32).to_be_bytes());
        device.write_at(0, &header)?;

        for (i, entry) in self.allocated.iter().enumerate() {
            let mut buf = [0u8; ENTRY_SIZE as usize];
            buf[0..2].copy_from_slice(&(entry.namespace as i16).to_be_bytes());
            buf[2..10].copy_from_slice(&entry.id.to_be_bytes());
            buf[10..14].copy_from_slice(&entry.offset.to_be_bytes());
            buf[14..18].copy_from_slice(&entry.size.to_be_bytes());
            device.write_at(self.entry_table_offset() + i as u64 * ENTRY_SIZE, &buf)?;
        }

        let free_table_offset = self.free_table_offset();
        for (i, section) in self.free.iter().enumerate() {
            let mut buf = [0u8; FREE_SIZE as usize];
            buf[0..4].copy_from_slice(&section.offset.to_be_bytes());
            buf[4..8].copy_from_slice(&section.size.to_be_bytes());
            device.write_at(free_table_offset + i as u64 * FREE_SIZE, &buf)?;
        }
        device.flush()?;
        Ok(())
    }

    fn sort(&mut self) {
        self.allocated
            .sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.id.cmp(&b.id)));
        self.free.sort_by_key(|f| f.offset);
    }

    pub fn find(&self, namespace: Namespace, id: u64) -> Option<&AllocatedSection> {
        self.allocated
            .iter()
            .find(|a| a.namespace == namespace && a.id == id)
    }

    /// Best-fit allocation (§4.6 Allocate). Tries an exact-size free section
    /// first, then the lowest-offset section large enough; expands the file
    /// once and retries on total miss.
    pub fn allocate(
        &mut self,
        device: &mut dyn Device,
        size: u32,
        namespace: Namespace,
        id: u64,
    ) -> Result<AllocatedSection> {
        if let Some(section) = self.try_allocate(namespace, id, size)? {
            self.save(device)?;
            return Ok(section);
        }
        self.expand_file_size(device, size as u64)?;
        match self.try_allocate(namespace, id, size)? {
            Some(section) => {
                self.save(device)?;
                Ok(section)
            }
            None => Err(Error::NoSpace),
        }
    }

    fn try_allocate(
        &mut self,
        namespace: Namespace,
        id: u64,
        size: u32,
    ) -> Result<Option<AllocatedSection>> {
        if let Some(idx) = self.free.iter().position(|f| f.size == size) {
            let free = self.free.remove(idx);
            let section = AllocatedSection {
                namespace,
                id,
                offset: free.offset,
                size: free.size,
            };
            self.allocated.push(section);
            return Ok(Some(section));
        }

        let candidate = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, f)| f.size > size)
            .min_by_key(|(_, f)| f.offset)
            .map(|(idx, f)| (idx, *f));

        let Some((idx, free)) = candidate else {
            return Ok(None);
        };

        if self.allocated.len() as u32 >= self.entry_max {
            return Err(Error::NoFreeSlots);
        }

        self.free[idx] = FreeSection {
            offset: free.offset + size,
            size: free.size - size,
        };
        let section = AllocatedSection {
            namespace,
            id,
            offset: free.offset,
            size,
        };
        self.allocated.push(section);
        Ok(Some(section))
    }

    /// Grows the file by `amount` bytes (§4.6 ExpandFileSize): extends a
    /// trailing free region in place, or appends a new free section after a
    /// trailing allocated region.
    pub fn expand_file_size(&mut self, device: &mut dyn Device, amount: u64) -> Result<()> {
        let highest_free = self.free.iter().enumerate().max_by_key(|(_, f)| f.offset);
        let highest_alloc = self
            .allocated
            .iter()
            .enumerate()
            .max_by_key(|(_, a)| a.offset);

        let free_end = highest_free.map(|(_, f)| f.offset as u64 + f.size as u64);
        let alloc_end = highest_alloc.map(|(_, a)| a.offset as u64 + a.size as u64);

        let free_is_last = match (free_end, alloc_end) {
            (Some(fe), Some(ae)) => fe >= ae,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if free_is_last {
            if let Some((idx, f)) = highest_free {
                let new_size = f.size as u64 + amount;
                self.free[idx].size = new_size as u32;
            }
        } else {
            if self.free.len() as u32 >= self.free_max {
                return Err(Error::NoFreeSlots);
            }
            let (_, a) = highest_alloc.expect("alloc_end is Some only when an allocation exists");
            self.free.push(FreeSection {
                offset: a.offset + a.size,
                size: amount as u32,
            });
        }

        let section_start = self.section_start();
        let new_data_len = self.data_area_len();
        device.set_len(section_start + new_data_len)?;
        self.save(device)?;
        trace!("xdbf expanded by {amount} bytes");
        Ok(())
    }

    fn data_area_len(&self) -> u64 {
        let alloc_end = self
            .allocated
            .iter()
            .map(|a| a.offset as u64 + a.size as u64)
            .max()
            .unwrap_or(0);
        let free_end = self
            .free
            .iter()
            .map(|f| f.offset as u64 + f.size as u64)
            .max()
            .unwrap_or(0);
        alloc_end.max(free_end)
    }

    /// Releases an allocation back to the free list, zero-wiping its data
    /// area first (§4.6 Free).
    pub fn free(&mut self, device: &mut dyn Device, namespace: Namespace, id: u64) -> Result<()> {
        let idx = self
            .allocated
            .iter()
            .position(|a| a.namespace == namespace && a.id == id)
            .ok_or(Error::NotFound)?;
        let section = self.allocated.remove(idx);

        let zeros = vec![0u8; section.size as usize];
        let data_offset = self.section_start() + section.offset as u64;
        device.write_at(data_offset, &zeros)?;

        self.free.push(FreeSection {
            offset: section.offset,
            size: section.size,
        });
        self.save(device)
    }

    /// Writes (allocating or replacing as needed) the data for `(namespace,
    /// id)` (§4.6 UpdateSection).
    pub fn update_section(
        &mut self,
        device: &mut dyn Device,
        namespace: Namespace,
        id: u64,
        data: &[u8],
    ) -> Result<AllocatedSection> {
        let section = match self.find(namespace, id).copied() {
            None => self
                .allocate(device, data.len() as u32, namespace, id)
                .map_err(|_| Error::UpdateFailed)?,
            Some(existing) if existing.size as usize == data.len() => existing,
            Some(existing) => {
                self.free(device, namespace, id)?;
                match self.allocate(device, data.len() as u32, namespace, id) {
                    Ok(section) => section,
                    Err(_) => {
                        self.rebuild(device)?;
                        self.allocate(device, data.len() as u32, namespace, id)
                            .map_err(|_| Error::NoSpace)?
                    }
                }
            }
        };

        let data_offset = self.section_start() + section.offset as u64;
        device.write_at(data_offset, data)?;
        self.save(device)?;
        Ok(self.find(namespace, id).copied().unwrap_or(section))
    }

    /// Rewrites the file contiguously: allocations packed from offset 0,
    /// free space collapsed into one tail section (§4.6 Rebuild).
    pub fn rebuild(&mut self, device: &mut dyn Device) -> Result<()> {
        self.sort();

        let mut snapshots = Vec::with_capacity(self.allocated.len());
        let section_start = self.section_start();
        for section in &self.allocated {
            let mut buf = vec![0u8; section.size as usize];
            device.read_at(section_start + section.offset as u64, &mut buf)?;
            snapshots.push(buf);
        }

        if self.allocated.len() as u32 + 10 > self.entry_max {
            self.entry_max = self.allocated.len() as u32 + 10;
        }
        if self.free.len() as u32 + 10 > self.free_max {
            self.free_max = self.free.len() as u32 + 10;
        }

        let total_allocated: u64 = self.allocated.iter().map(|a| a.size as u64).sum();
        let total_free: u64 = self.free.iter().map(|f| f.size as u64).sum();

        let new_section_start = self.section_start();
        device.set_len(new_section_start + total_allocated + total_free)?;

        let mut cursor = 0u32;
        for (section, data) in self.allocated.iter_mut().zip(snapshots.iter()) {
            section.offset = cursor;
            device.write_at(new_section_start + cursor as u64, data)?;
            cursor += section.size;
        }

        self.free.clear();
        if total_free > 0 {
            self.free.push(FreeSection {
                offset: cursor,
                size: total_free as u32,
            });
        }

        self.save(device)?;
        debug!(
            "xdbf rebuilt: {} allocated sections, {} bytes free at tail",
            self.allocated.len(),
            total_free
        );
        Ok(())
    }

    /// Zero-wipes every free region's backing bytes, leaving the tables
    /// unchanged (§4.6 ClearAllFreeData).
    pub fn clear_all_free_data(&mut self, device: &mut dyn Device) -> Result<()> {
        let section_start = self.section_start();
        for section in &self.free {
            let zeros = vec![0u8; section.size as usize];
            device.write_at(section_start + section.offset as u64, &zeros)?;
        }
        Ok(())
    }
}
