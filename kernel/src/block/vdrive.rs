//! vDrive - unified storage layer
//!
//! One identity for every storage device regardless of backend (ATA,
//! SATA, RAM test disks). Enumerates backends at boot, assigns
//! contiguous vdrive ids, parses the MBR of 512-byte devices, routes
//! sector I/O and keeps per-drive statistics. Every present vDrive is
//! also wrapped as a block device handle for SQRM FS modules.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::memdisk::MemDisk;
use super::{BlockError, BlockFlags, BlockInfo, BlockOps, Handle, SectorDevice, INVALID_HANDLE};
use crate::drivers::{ata, sata};

/// Maximum number of virtual drives
pub const MAX_DRIVES: usize = 32;

/// Drive types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VdriveType {
    AtaHdd,
    AtaAtapi,
    SataHdd,
    SataOptical,
    MemDisk,
}

/// Which subsystem serves the drive
#[derive(Clone)]
enum VdriveBackend {
    Ata(u8),
    Sata(u8),
    Mem(Arc<MemDisk>),
}

/// vDrive I/O errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VdriveError {
    NotPresent,
    OutOfRange,
    ReadOnly,
    /// Device answered but is not ready (optical spin-up, no medium)
    NotReady,
    Io,
}

/// Public descriptor of one vDrive
#[derive(Clone, Debug)]
pub struct VdriveInfo {
    pub id: u8,
    pub vtype: VdriveType,
    pub model: String,
    pub serial: String,
    pub total_sectors: u64,
    pub sector_size: u32,
    pub capacity_mb: u64,
    pub read_only: bool,
    pub removable: bool,
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
}

struct Vdrive {
    id: u8,
    vtype: VdriveType,
    backend: VdriveBackend,
    model: String,
    serial: String,
    total_sectors: u64,
    sector_size: u32,
    read_only: bool,
    removable: bool,
    reads: u64,
    writes: u64,
    errors: u64,
}

static VDRIVES: Mutex<Vec<Vdrive>> = Mutex::new(Vec::new());
static HANDLES: Mutex<[Handle; MAX_DRIVES]> = Mutex::new([INVALID_HANDLE; MAX_DRIVES]);

/// Spin-up retry policy for removable (optical) devices
const SPINUP_RETRIES: u32 = 3;
const SPINUP_DELAY_MS: u64 = 100;

/// MBR partition entry (16 bytes at offset 446 + 16*i)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct MbrPartitionEntry {
    status: u8,
    first_chs: [u8; 3],
    partition_type: u8,
    last_chs: [u8; 3],
    first_lba: u32,
    sector_count: u32,
}

const MBR_PARTITION_TABLE_OFFSET: usize = 446;
const MBR_SIGNATURE_OFFSET: usize = 510;

/// A parsed MBR partition (1-based index)
#[derive(Clone, Copy, Debug)]
pub struct MbrPartition {
    pub index: u8,
    pub partition_type: u8,
    pub first_lba: u32,
    pub sectors: u32,
    pub bootable: bool,
}

/// Enumerate backends and build the vDrive table. ATA first, SATA
/// second; ids are contiguous in discovery order.
pub fn init() {
    let mut drives = Vec::new();

    for info in ata::drives() {
        let id = drives.len() as u8;
        let (vtype, sector_size, read_only, removable, total) = if info.atapi {
            (VdriveType::AtaAtapi, 2048u32, true, true, info.sector_count)
        } else {
            (VdriveType::AtaHdd, 512u32, false, false, info.sector_count)
        };
        drives.push(Vdrive {
            id,
            vtype,
            backend: VdriveBackend::Ata(info.index),
            model: info.model,
            serial: info.serial,
            total_sectors: total,
            sector_size,
            read_only,
            removable,
            reads: 0,
            writes: 0,
            errors: 0,
        });
    }

    for info in sata::devices() {
        if drives.len() >= MAX_DRIVES {
            break;
        }
        let id = drives.len() as u8;
        drives.push(Vdrive {
            id,
            vtype: if info.optical {
                VdriveType::SataOptical
            } else {
                VdriveType::SataHdd
            },
            backend: VdriveBackend::Sata(info.port),
            model: info.model,
            serial: info.serial,
            total_sectors: info.sector_count,
            sector_size: info.sector_size,
            read_only: info.optical,
            removable: info.optical,
            reads: 0,
            writes: 0,
            errors: 0,
        });
    }

    crate::log!("[VDRIVE] {} drive(s) enumerated", drives.len());
    for d in &drives {
        crate::log!(
            "[VDRIVE]   vDrive{}: {:?} \"{}\" {} sectors x {} B{}",
            d.id,
            d.vtype,
            d.model,
            d.total_sectors,
            d.sector_size,
            if d.read_only { " (ro)" } else { "" }
        );
    }
    *VDRIVES.lock() = drives;
}

/// Attach a RAM-backed disk as a vDrive (self tests, scratch volumes).
pub fn add_mem_disk(disk: Arc<MemDisk>) -> Option<u8> {
    let mut drives = VDRIVES.lock();
    if drives.len() >= MAX_DRIVES {
        return None;
    }
    let id = drives.len() as u8;
    drives.push(Vdrive {
        id,
        vtype: VdriveType::MemDisk,
        model: String::from(disk.model()),
        serial: String::from("MEM0"),
        total_sectors: disk.sector_count(),
        sector_size: disk.sector_size() as u32,
        read_only: disk.is_readonly(),
        removable: false,
        backend: VdriveBackend::Mem(disk),
        reads: 0,
        writes: 0,
        errors: 0,
    });
    Some(id)
}

/// Number of present vDrives
pub fn count() -> usize {
    VDRIVES.lock().len()
}

/// Is this drive present and usable?
pub fn is_ready(id: u8) -> bool {
    VDRIVES.lock().iter().any(|d| d.id == id)
}

/// Descriptor snapshot for one drive
pub fn get(id: u8) -> Option<VdriveInfo> {
    VDRIVES.lock().iter().find(|d| d.id == id).map(|d| VdriveInfo {
        id: d.id,
        vtype: d.vtype,
        model: d.model.clone(),
        serial: d.serial.clone(),
        total_sectors: d.total_sectors,
        sector_size: d.sector_size,
        capacity_mb: d.total_sectors * d.sector_size as u64 / (1024 * 1024),
        read_only: d.read_only,
        removable: d.removable,
        reads: d.reads,
        writes: d.writes,
        errors: d.errors,
    })
}

fn backend_read(
    backend: &VdriveBackend,
    lba: u64,
    count: u32,
    buf: &mut [u8],
) -> Result<(), VdriveError> {
    match backend {
        VdriveBackend::Ata(idx) => ata::read_sectors(*idx, lba, count, buf).map_err(|e| match e {
            ata::AtaError::NotReady => VdriveError::NotReady,
            ata::AtaError::NoDevice => VdriveError::NotPresent,
            _ => VdriveError::Io,
        }),
        VdriveBackend::Sata(port) => {
            sata::read_sectors(*port, lba, count, buf).map_err(|e| match e {
                sata::SataError::NotReady => VdriveError::NotReady,
                sata::SataError::NoDevice => VdriveError::NotPresent,
                _ => VdriveError::Io,
            })
        }
        VdriveBackend::Mem(disk) => {
            let ss = disk.sector_size();
            for i in 0..count as u64 {
                let off = i as usize * ss;
                disk.read_sector(lba + i, &mut buf[off..off + ss])
                    .map_err(|_| VdriveError::Io)?;
            }
            Ok(())
        }
    }
}

fn backend_write(
    backend: &VdriveBackend,
    lba: u64,
    count: u32,
    buf: &[u8],
) -> Result<(), VdriveError> {
    match backend {
        VdriveBackend::Ata(idx) => ata::write_sectors(*idx, lba, count, buf).map_err(|e| match e {
            ata::AtaError::NotReady => VdriveError::NotReady,
            ata::AtaError::NoDevice => VdriveError::NotPresent,
            _ => VdriveError::Io,
        }),
        VdriveBackend::Sata(port) => {
            sata::write_sectors(*port, lba, count, buf).map_err(|e| match e {
                sata::SataError::NotReady => VdriveError::NotReady,
                sata::SataError::NoDevice => VdriveError::NotPresent,
                _ => VdriveError::Io,
            })
        }
        VdriveBackend::Mem(disk) => {
            let ss = disk.sector_size();
            for i in 0..count as u64 {
                let off = i as usize * ss;
                disk.write_sector(lba + i, &buf[off..off + ss])
                    .map_err(|_| VdriveError::Io)?;
            }
            Ok(())
        }
    }
}

fn delay_ms(ms: u64) {
    // Calibration-free boot delay; good enough for spin-up retries
    for _ in 0..ms * 50_000 {
        core::hint::spin_loop();
    }
}

/// Read sectors from a vDrive. Removable devices get a short spin-up
/// retry on NotReady.
pub fn read(id: u8, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), VdriveError> {
    let (backend, removable, total, ss) = {
        let drives = VDRIVES.lock();
        let d = drives.iter().find(|d| d.id == id).ok_or(VdriveError::NotPresent)?;
        (d.backend.clone(), d.removable, d.total_sectors, d.sector_size)
    };
    if lba + count as u64 > total {
        return Err(VdriveError::OutOfRange);
    }
    if buf.len() < count as usize * ss as usize {
        return Err(VdriveError::OutOfRange);
    }

    let mut attempts = if removable { SPINUP_RETRIES } else { 1 };
    let result = loop {
        match backend_read(&backend, lba, count, buf) {
            Err(VdriveError::NotReady) if attempts > 1 => {
                attempts -= 1;
                delay_ms(SPINUP_DELAY_MS);
            }
            other => break other,
        }
    };

    let mut drives = VDRIVES.lock();
    if let Some(d) = drives.iter_mut().find(|d| d.id == id) {
        match &result {
            Ok(()) => d.reads += count as u64,
            Err(_) => d.errors += 1,
        }
    }
    result
}

/// Write sectors to a vDrive.
pub fn write(id: u8, lba: u64, count: u32, buf: &[u8]) -> Result<(), VdriveError> {
    let (backend, read_only, total, ss) = {
        let drives = VDRIVES.lock();
        let d = drives.iter().find(|d| d.id == id).ok_or(VdriveError::NotPresent)?;
        (d.backend.clone(), d.read_only, d.total_sectors, d.sector_size)
    };
    if read_only {
        return Err(VdriveError::ReadOnly);
    }
    if lba + count as u64 > total {
        return Err(VdriveError::OutOfRange);
    }
    if buf.len() < count as usize * ss as usize {
        return Err(VdriveError::OutOfRange);
    }

    let result = backend_write(&backend, lba, count, buf);

    let mut drives = VDRIVES.lock();
    if let Some(d) = drives.iter_mut().find(|d| d.id == id) {
        match &result {
            Ok(()) => d.writes += count as u64,
            Err(_) => d.errors += 1,
        }
    }
    result
}

/// Single-sector read helper
pub fn read_sector(id: u8, lba: u64, buf: &mut [u8]) -> Result<(), VdriveError> {
    read(id, lba, 1, buf)
}

/// Single-sector write helper
pub fn write_sector(id: u8, lba: u64, buf: &[u8]) -> Result<(), VdriveError> {
    write(id, lba, 1, buf)
}

/// Parse the MBR of a 512-byte-sector drive. Entries with type 0 or
/// first LBA 0 are skipped; optical devices are never partitioned.
pub fn partitions(id: u8) -> Vec<MbrPartition> {
    let mut result = Vec::new();
    let Some(info) = get(id) else { return result };
    if info.sector_size != 512 {
        return result;
    }

    let mut sector = [0u8; 512];
    if read_sector(id, 0, &mut sector).is_err() {
        return result;
    }
    if sector[MBR_SIGNATURE_OFFSET] != 0x55 || sector[MBR_SIGNATURE_OFFSET + 1] != 0xAA {
        return result;
    }

    for i in 0..4 {
        let off = MBR_PARTITION_TABLE_OFFSET + i * 16;
        let entry = unsafe {
            core::ptr::read_unaligned(sector[off..].as_ptr() as *const MbrPartitionEntry)
        };
        let first_lba = entry.first_lba;
        let sectors = entry.sector_count;
        if entry.partition_type == 0 || first_lba == 0 {
            continue;
        }
        result.push(MbrPartition {
            index: (i + 1) as u8,
            partition_type: entry.partition_type,
            first_lba,
            sectors,
            bootable: entry.status == 0x80,
        });
    }
    result
}

/// 1..4 if `partition_lba` matches an MBR entry's first LBA, else 0.
pub fn partition_index_for_lba(id: u8, partition_lba: u32) -> u8 {
    if partition_lba == 0 {
        return 0;
    }
    partitions(id)
        .iter()
        .find(|p| p.first_lba == partition_lba)
        .map(|p| p.index)
        .unwrap_or(0)
}

/// Update the MBR type byte of the entry starting at `start_lba`.
/// Used after formatting a partition in place.
pub fn mbr_set_type_for_lba(id: u8, start_lba: u32, new_type: u8) -> Result<(), VdriveError> {
    if start_lba == 0 || new_type == 0 {
        return Err(VdriveError::OutOfRange);
    }
    let info = get(id).ok_or(VdriveError::NotPresent)?;
    if info.read_only {
        return Err(VdriveError::ReadOnly);
    }
    if info.sector_size != 512 {
        return Err(VdriveError::OutOfRange);
    }

    let mut mbr = [0u8; 512];
    read_sector(id, 0, &mut mbr)?;
    if mbr[MBR_SIGNATURE_OFFSET] != 0x55 || mbr[MBR_SIGNATURE_OFFSET + 1] != 0xAA {
        return Err(VdriveError::Io);
    }

    let mut found = false;
    for i in 0..4 {
        let off = MBR_PARTITION_TABLE_OFFSET + i * 16;
        let ptype = mbr[off + 4];
        let first = u32::from_le_bytes([mbr[off + 8], mbr[off + 9], mbr[off + 10], mbr[off + 11]]);
        if ptype == 0 {
            continue;
        }
        if first == start_lba {
            mbr[off + 4] = new_type;
            found = true;
            break;
        }
    }
    if !found {
        return Err(VdriveError::OutOfRange);
    }

    write_sector(id, 0, &mbr)
}

// ============================================================================
// Blockdev + filesystem adapters
// ============================================================================

/// A vDrive viewed through the blockdev ops table
struct VdriveBlock {
    id: u8,
}

impl BlockOps for VdriveBlock {
    fn get_info(&self) -> Result<BlockInfo, BlockError> {
        let d = get(self.id).ok_or(BlockError::InvalidHandle)?;
        let mut flags = BlockFlags::empty();
        if d.read_only {
            flags |= BlockFlags::READONLY;
        }
        if d.removable {
            flags |= BlockFlags::REMOVABLE;
        }
        Ok(BlockInfo {
            sector_size: d.sector_size,
            sector_count: d.total_sectors,
            flags,
            model: d.model,
        })
    }

    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        read(self.id, lba, count, buf).map_err(|e| match e {
            VdriveError::NotReady => BlockError::DeviceNotReady,
            VdriveError::ReadOnly => BlockError::ReadOnly,
            VdriveError::OutOfRange => BlockError::OutOfRange,
            _ => BlockError::Io,
        })
    }

    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
        write(self.id, lba, count, buf).map_err(|e| match e {
            VdriveError::NotReady => BlockError::DeviceNotReady,
            VdriveError::ReadOnly => BlockError::ReadOnly,
            VdriveError::OutOfRange => BlockError::OutOfRange,
            _ => BlockError::Io,
        })
    }
}

/// Register every present vDrive as a block device handle.
pub fn register_blockdevs() {
    let ids: Vec<u8> = VDRIVES.lock().iter().map(|d| d.id).collect();
    let mut handles = HANDLES.lock();
    for id in ids {
        let h = super::register(Arc::new(VdriveBlock { id }));
        handles[id as usize] = h;
        crate::log_debug!("[VDRIVE] vDrive{} -> blockdev handle {}", id, h);
    }
}

/// Blockdev handle for a vDrive, or INVALID_HANDLE
pub fn handle_for(id: u8) -> Handle {
    if (id as usize) < MAX_DRIVES {
        HANDLES.lock()[id as usize]
    } else {
        INVALID_HANDLE
    }
}

/// A window of a vDrive (whole disk or one partition) as a
/// `SectorDevice` for the filesystem drivers.
pub struct VdrivePartition {
    id: u8,
    base_lba: u64,
    sector_size: usize,
    sectors: u64,
}

impl VdrivePartition {
    pub fn new(id: u8, base_lba: u64) -> Option<Self> {
        let info = get(id)?;
        Some(Self {
            id,
            base_lba,
            sector_size: info.sector_size as usize,
            sectors: info.total_sectors.saturating_sub(base_lba),
        })
    }
}

impl SectorDevice for VdrivePartition {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        read(self.id, self.base_lba + sector, 1, buf).map_err(|e| match e {
            VdriveError::NotReady => BlockError::DeviceNotReady,
            VdriveError::OutOfRange => BlockError::OutOfRange,
            _ => BlockError::Io,
        })
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        write(self.id, self.base_lba + sector, 1, buf).map_err(|e| match e {
            VdriveError::NotReady => BlockError::DeviceNotReady,
            VdriveError::ReadOnly => BlockError::ReadOnly,
            VdriveError::OutOfRange => BlockError::OutOfRange,
            _ => BlockError::Io,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an MBR sector with one entry
    fn mbr_with_entry(index: usize, ptype: u8, first_lba: u32, sectors: u32) -> [u8; 512] {
        let mut s = [0u8; 512];
        let off = MBR_PARTITION_TABLE_OFFSET + index * 16;
        s[off + 4] = ptype;
        s[off + 8..off + 12].copy_from_slice(&first_lba.to_le_bytes());
        s[off + 12..off + 16].copy_from_slice(&sectors.to_le_bytes());
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn test_mbr_parse_skips_empty_entries() {
        let disk = Arc::new(MemDisk::new(4096, 512, "mbr-test"));
        let mbr = mbr_with_entry(1, 0x0C, 2048, 1024);
        disk.write_sector(0, &mbr).unwrap();
        let id = add_mem_disk(disk).unwrap();

        let parts = partitions(id);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].index, 2);
        assert_eq!(parts[0].partition_type, 0x0C);
        assert_eq!(parts[0].first_lba, 2048);
        assert_eq!(parts[0].sectors, 1024);
        assert_eq!(partition_index_for_lba(id, 2048), 2);
        assert_eq!(partition_index_for_lba(id, 4), 0);
    }

    #[test]
    fn test_mbr_retype() {
        let disk = Arc::new(MemDisk::new(4096, 512, "retype-test"));
        let mbr = mbr_with_entry(0, 0x83, 64, 512);
        disk.write_sector(0, &mbr).unwrap();
        let id = add_mem_disk(disk.clone()).unwrap();

        mbr_set_type_for_lba(id, 64, 0x0C).unwrap();
        let parts = partitions(id);
        assert_eq!(parts[0].partition_type, 0x0C);
    }

    #[test]
    fn test_bad_signature_yields_no_partitions() {
        let disk = Arc::new(MemDisk::new(64, 512, "nosig"));
        let id = add_mem_disk(disk).unwrap();
        assert!(partitions(id).is_empty());
    }
}
