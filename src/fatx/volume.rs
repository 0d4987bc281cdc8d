//! FATX device probing and partition layout (§4.5).
//!
//! A [`FatxDevice`] wraps a byte stream, figures out what kind of Xbox 360
//! storage device it is by peeking a handful of fixed offsets, lays out the
//! partitions that kind implies, and drops any that fail to read as valid
//! FATX.

use log::{debug, warn};

use crate::device::Device;
use crate::error::Result;
use crate::fatx::partition::{Partition, PartitionKind, MAGIC};

const MEMORY_CARD_SPLIT: u64 = 0x7FF000;
const HARD_DRIVE_PROBE: u64 = 0x80000;
// Devkit marker lives at offset 0, re-checked once a hard-drive-style
// partition has already been confirmed at HARD_DRIVE_PROBE.
const DEVKIT_MARKER_OFFSET: u64 = 0x0;
const TWENTY_GB_DRIVE_SIZE: u64 = 0x04AB_440C00;
const TWENTY_GB_LAST_PARTITION_SIZE: u64 = 0x377F_FC000;
const DEVKIT_SECTOR: u64 = 0x200;

/// Which physical Xbox 360 storage device this byte stream turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    MemoryCard,
    HardDrive,
    HardDriveDevkit,
    Usb,
    Unknown,
}

/// One named, offset-addressed region of the device that is expected to
/// hold a FATX partition.
struct LayoutEntry {
    name: &'static str,
    offset: u64,
    size: u64,
}

/// An opened Xbox 360 storage device: its kind, total length, and the FATX
/// partitions that validated during probing.
pub struct FatxDevice {
    pub kind: DeviceKind,
    pub length: u64,
    pub partitions: Vec<Partition>,
}

impl FatxDevice {
    /// Returns true once probing found at least one valid partition (§3:
    /// `kind != Unknown` implies at least one partition validated).
    pub fn is_valid(&self) -> bool {
        self.kind != DeviceKind::Unknown && !self.partitions.is_empty()
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn partition_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.partitions.iter_mut().find(|p| p.name == name)
    }

    /// Probes `device`'s kind, lays out its partitions, and reads each one,
    /// silently dropping any partition whose magic doesn't validate (§4.5).
    pub fn open(device: &mut dyn Device) -> Result<Self> {
        let length = device.len()?;
        let kind = probe_kind(device)?;
        debug!("probed device kind: {kind:?}");

        let layout = build_layout(device, kind, length)?;
        let mut partitions = Vec::with_capacity(layout.len());
        for entry in layout {
            let partition_kind = match kind {
                DeviceKind::Usb => PartitionKind::Usb,
                _ => PartitionKind::Regular,
            };
            match Partition::read(device, entry.offset, entry.size, entry.name, partition_kind) {
                Ok(partition) => partitions.push(partition),
                Err(err) => {
                    warn!("dropping partition {:?}: {err}", entry.name);
                }
            }
        }

        Ok(Self {
            kind,
            length,
            partitions,
        })
    }
}

fn read_be_u32(device: &mut dyn Device, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    device.read_at(offset, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_le_u32(device: &mut dyn Device, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    device.read_at(offset, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Probe order per §4.5: offset 0, then either the memory-card split offset
/// or the hard-drive probe offset, depending on what's found at offset 0.
fn probe_kind(device: &mut dyn Device) -> Result<DeviceKind> {
    if read_be_u32(device, 0)? == MAGIC {
        return Ok(if read_be_u32(device, MEMORY_CARD_SPLIT)? == MAGIC {
            DeviceKind::MemoryCard
        } else {
            DeviceKind::Usb
        });
    }

    if read_be_u32(device, HARD_DRIVE_PROBE)? == MAGIC {
        return Ok(if read_le_u32(device, DEVKIT_MARKER_OFFSET)? == 0x0002_0000 {
            DeviceKind::HardDriveDevkit
        } else {
            DeviceKind::HardDrive
        });
    }

    Ok(DeviceKind::Unknown)
}

fn build_layout(
    device: &mut dyn Device,
    kind: DeviceKind,
    drive_size: u64,
) -> Result<Vec<LayoutEntry>> {
    let mut layout = match kind {
        DeviceKind::MemoryCard => vec![
            LayoutEntry {
                name: "Cache",
                offset: 0x00,
                size: MEMORY_CARD_SPLIT,
            },
            LayoutEntry {
                name: "Data",
                offset: MEMORY_CARD_SPLIT,
                size: drive_size.saturating_sub(MEMORY_CARD_SPLIT),
            },
        ],
        DeviceKind::Usb => vec![LayoutEntry {
            name: "Data",
            offset: 0,
            size: drive_size,
        }],
        DeviceKind::HardDrive => hard_drive_layout(drive_size),
        DeviceKind::HardDriveDevkit => {
            let mut layout = hard_drive_layout(drive_size);
            layout.extend(devkit_extra_partitions(device)?);
            layout
        }
        DeviceKind::Unknown => Vec::new(),
    };

    if kind != DeviceKind::HardDriveDevkit {
        if let Some(last) = layout.last_mut() {
            if drive_size == TWENTY_GB_DRIVE_SIZE {
                last.size = TWENTY_GB_LAST_PARTITION_SIZE;
            } else {
                last.size = drive_size.saturating_sub(last.offset);
            }
        }
    }

    Ok(layout)
}

fn hard_drive_layout(drive_size: u64) -> Vec<LayoutEntry> {
    let dump = LayoutEntry {
        name: "Dump",
        offset: 0x80000,
        size: 0x80000000,
    };
    let windows = LayoutEntry {
        name: "Windows",
        offset: 0x80080000,
        size: 0xA0E30000,
    };
    let system = LayoutEntry {
        name: "System",
        offset: 0x120EB0000,
        size: 0x10000000,
    };
    let data = LayoutEntry {
        name: "Data",
        offset: 0x130EB0000,
        size: drive_size.saturating_sub(0x130EB0000),
    };
    vec![dump, windows, system, data]
}

/// The devkit-only variable-count sector table at device offset 8 (§4.5):
/// pairs of `(sectorIndex, sectorCount)` until a zero index terminates it.
fn devkit_extra_partitions(device: &mut dyn Device) -> Result<Vec<LayoutEntry>> {
    let mut entries = Vec::new();
    let mut offset = 8u64;
    loop {
        let sector_index = read_be_u32(device, offset)?;
        let sector_count = read_be_u32(device, offset + 4)?;
        if sector_index == 0 {
            break;
        }
        entries.push(LayoutEntry {
            name: "DevkitPartition",
            offset: sector_index as u64 * DEVKIT_SECTOR,
            size: sector_count as u64 * DEVKIT_SECTOR,
        });
        offset += 8;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;

    fn with_magic_at(mut bytes: Vec<u8>, offset: u64) -> Vec<u8> {
        let needed = offset as usize + 4;
        if bytes.len() < needed {
            bytes.resize(needed, 0);
        }
        bytes[offset as usize..offset as usize + 4].copy_from_slice(&MAGIC.to_be_bytes());
        bytes
    }

    #[test]
    fn probes_memory_card_when_both_magics_present() {
        let mut bytes = vec![0u8; MEMORY_CARD_SPLIT as usize + 16];
        bytes[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        bytes = with_magic_at(bytes, MEMORY_CARD_SPLIT);
        let mut dev = MemDevice::new(bytes);
        assert_eq!(probe_kind(&mut dev).unwrap(), DeviceKind::MemoryCard);
    }

    #[test]
    fn probes_usb_when_only_offset_zero_magic_present() {
        let mut bytes = vec![0u8; MEMORY_CARD_SPLIT as usize + 16];
        bytes[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        let mut dev = MemDevice::new(bytes);
        assert_eq!(probe_kind(&mut dev).unwrap(), DeviceKind::Usb);
    }

    #[test]
    fn probes_unknown_when_nothing_matches() {
        let mut dev = MemDevice::new(vec![0u8; HARD_DRIVE_PROBE as usize + 16]);
        assert_eq!(probe_kind(&mut dev).unwrap(), DeviceKind::Unknown);
    }

    #[test]
    fn probes_hard_drive_when_only_offset_0x80000_magic_present() {
        let mut bytes = vec![0u8; HARD_DRIVE_PROBE as usize + 16];
        bytes = with_magic_at(bytes, HARD_DRIVE_PROBE);
        let mut dev = MemDevice::new(bytes);
        assert_eq!(probe_kind(&mut dev).unwrap(), DeviceKind::HardDrive);
    }

    #[test]
    fn probes_hard_drive_devkit_when_offset_zero_carries_the_marker() {
        let mut bytes = vec![0u8; HARD_DRIVE_PROBE as usize + 16];
        bytes = with_magic_at(bytes, HARD_DRIVE_PROBE);
        bytes[0..4].copy_from_slice(&0x0002_0000u32.to_le_bytes());
        let mut dev = MemDevice::new(bytes);
        assert_eq!(probe_kind(&mut dev).unwrap(), DeviceKind::HardDriveDevkit);
    }

    #[test]
    fn twenty_gb_quirk_overrides_last_partition_size() {
        let layout = build_layout(
            &mut MemDevice::new(Vec::new()),
            DeviceKind::HardDrive,
            TWENTY_GB_DRIVE_SIZE,
        )
        .unwrap();
        assert_eq!(layout.last().unwrap().size, TWENTY_GB_LAST_PARTITION_SIZE);
    }
}
