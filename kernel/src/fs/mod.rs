//! Filesystem core: the kernel mount table
//!
//! Up to 26 mount slots. Slot 0 is the boot filesystem and is never
//! implicitly unmounted. Mounting probes FAT32 first, then MDFS, then
//! any external drivers registered by SQRM FS modules. Paths reach this
//! layer already routed (see `path`); the descriptor table sits on top
//! (see `fd`).

pub mod devfs;
pub mod fat32;
pub mod fd;
pub mod mdfs;
pub mod path;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ffi::c_void;
use spin::Mutex;

use crate::block::vdrive::{self, VdrivePartition};
use crate::block::SectorDevice;

/// Mount slots (A..Z)
pub const MAX_MOUNTS: usize = 26;

/// Filesystem errors (shared by every FS layer)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    ReadOnly,
    Exists,
    /// Checksum mismatch
    Corrupt,
    BadSignature,
    BadBpb,
    EndOfChain,
    Io,
    NoSpace,
    PathTooLong,
    InvalidPath,
    BadFd,
    TooManyOpenFiles,
    TooManyMounts,
    AlreadyMounted,
    DeviceNotReady,
    WouldBlock,
    NotSupported,
}

pub type FsResult<T> = Result<T, FsError>;

/// File metadata
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

/// One directory listing entry
#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

/// Directory iterator handle: owns its snapshot, yields one entry at a
/// time. Never borrows from sector buffers.
#[derive(Clone, Debug)]
pub struct DirHandle {
    entries: Vec<DirEntryInfo>,
    pos: usize,
}

impl DirHandle {
    pub fn new(entries: Vec<DirEntryInfo>) -> Self {
        Self { entries, pos: 0 }
    }

    pub fn next_entry(&mut self) -> Option<DirEntryInfo> {
        let e = self.entries.get(self.pos).cloned();
        if e.is_some() {
            self.pos += 1;
        }
        e
    }
}

/// Mount types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsType {
    Unknown,
    Fat32,
    Mdfs,
    Iso9660,
    External,
}

pub fn fs_type_name(t: FsType) -> &'static str {
    match t {
        FsType::Fat32 => "FAT32",
        FsType::Mdfs => "MDFS",
        FsType::Iso9660 => "ISO9660",
        FsType::External => "External",
        FsType::Unknown => "Unknown",
    }
}

// ----------------------------------------------------------------------
// External FS drivers (registered by SQRM modules)
// ----------------------------------------------------------------------

/// Operations table an external FS driver hands the kernel.
/// All members are nullable C function pointers except probe/mount.
#[repr(C)]
pub struct ExtDriverOps {
    /// 1 = filesystem recognized at (vdrive, lba)
    pub probe: Option<extern "C" fn(vdrive_id: i32, lba: u32) -> i32>,
    /// 0 = mounted; opaque context returned through `ctx_out`
    pub mount: Option<extern "C" fn(vdrive_id: i32, lba: u32, ctx_out: *mut *mut c_void) -> i32>,
    pub unmount: Option<extern "C" fn(ctx: *mut c_void) -> i32>,
    pub read_file: Option<
        extern "C" fn(
            ctx: *mut c_void,
            path: *const u8,
            buf: *mut u8,
            buf_size: usize,
            out_read: *mut usize,
        ) -> i32,
    >,
    pub write_file: Option<
        extern "C" fn(ctx: *mut c_void, path: *const u8, buf: *const u8, size: usize) -> i32,
    >,
    /// size/is_dir through out pointers; nonzero = not found
    pub stat: Option<
        extern "C" fn(
            ctx: *mut c_void,
            path: *const u8,
            out_size: *mut u64,
            out_is_dir: *mut i32,
        ) -> i32,
    >,
    pub mkfs: Option<extern "C" fn(vdrive_id: i32, lba: u32, sectors: u32) -> i32>,
}

const EXT_MAX_DRIVERS: usize = 16;

struct ExtDriver {
    name: String,
    ops: *const ExtDriverOps,
}

unsafe impl Send for ExtDriver {}

static EXT_DRIVERS: Mutex<Vec<ExtDriver>> = Mutex::new(Vec::new());

/// Register an external filesystem driver (SQRM capability API).
pub fn register_driver(name: &str, ops: *const ExtDriverOps) -> FsResult<()> {
    if name.is_empty() || ops.is_null() {
        return Err(FsError::InvalidPath);
    }
    let ops_ref = unsafe { &*ops };
    if ops_ref.probe.is_none() || ops_ref.mount.is_none() {
        return Err(FsError::NotSupported);
    }

    let mut drivers = EXT_DRIVERS.lock();
    if drivers.iter().any(|d| d.name == name) {
        return Err(FsError::Exists);
    }
    if drivers.len() >= EXT_MAX_DRIVERS {
        return Err(FsError::NoSpace);
    }
    drivers.push(ExtDriver {
        name: name.to_string(),
        ops,
    });
    crate::log!("[FS] Registered external FS driver: {}", name);
    Ok(())
}

/// An external mount: driver ops + opaque module context
pub struct ExtMount {
    pub name: String,
    ops: *const ExtDriverOps,
    ctx: *mut c_void,
}

unsafe impl Send for ExtMount {}
unsafe impl Sync for ExtMount {}

impl ExtMount {
    fn ops(&self) -> &ExtDriverOps {
        unsafe { &*self.ops }
    }

    fn c_path(path: &str) -> Vec<u8> {
        let mut v = Vec::with_capacity(path.len() + 1);
        v.extend_from_slice(path.as_bytes());
        v.push(0);
        v
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let stat = self.ops().stat.ok_or(FsError::NotSupported)?;
        let cpath = Self::c_path(path);
        let mut size = 0u64;
        let mut is_dir = 0i32;
        if stat(self.ctx, cpath.as_ptr(), &mut size, &mut is_dir) != 0 {
            return Err(FsError::NotFound);
        }
        Ok(FileInfo {
            name: path::basename(path).to_string(),
            size,
            is_directory: is_dir != 0,
        })
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let read = self.ops().read_file.ok_or(FsError::NotSupported)?;
        let info = self.stat(path)?;
        if info.is_directory {
            return Err(FsError::IsADirectory);
        }
        let cpath = Self::c_path(path);
        let mut buf = alloc::vec![0u8; info.size as usize];
        let mut got = 0usize;
        if read(self.ctx, cpath.as_ptr(), buf.as_mut_ptr(), buf.len(), &mut got) != 0 {
            return Err(FsError::Io);
        }
        buf.truncate(got);
        Ok(buf)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let write = self.ops().write_file.ok_or(FsError::ReadOnly)?;
        let cpath = Self::c_path(path);
        if write(self.ctx, cpath.as_ptr(), data.as_ptr(), data.len()) != 0 {
            return Err(FsError::Io);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Mount table
// ----------------------------------------------------------------------

enum MountFs {
    Fat32(Arc<fat32::Fat32Fs>),
    Mdfs(Arc<mdfs::MdfsFs>),
    External(ExtMount),
}

struct MountEntry {
    fs: MountFs,
    vdrive_id: u8,
    partition_lba: u32,
    /// 0 = whole disk, else 1..4 for MBR partitions
    partition_index: u8,
}

impl MountEntry {
    fn fs_type(&self) -> FsType {
        match self.fs {
            MountFs::Fat32(_) => FsType::Fat32,
            MountFs::Mdfs(_) => FsType::Mdfs,
            MountFs::External(_) => FsType::External,
        }
    }
}

const NONE_MOUNT: Option<MountEntry> = None;
static MOUNTS: Mutex<[Option<MountEntry>; MAX_MOUNTS]> = Mutex::new([NONE_MOUNT; MAX_MOUNTS]);

/// Initialize the mount table (idempotent).
pub fn init() {
    crate::log!("[FS] Mount table initialized ({} slots)", MAX_MOUNTS);
}

fn partition_device(vdrive_id: u8, lba: u32) -> FsResult<Arc<dyn SectorDevice>> {
    let dev = VdrivePartition::new(vdrive_id, lba as u64).ok_or(FsError::DeviceNotReady)?;
    Ok(Arc::new(dev))
}

/// Try every known filesystem at one location, in probe order:
/// FAT32, MDFS, then external drivers.
fn probe_at(vdrive_id: u8, lba: u32, want: FsType) -> FsResult<MountFs> {
    if matches!(want, FsType::Unknown | FsType::Fat32) {
        let dev = partition_device(vdrive_id, lba)?;
        match fat32::Fat32Fs::mount(dev) {
            Ok(fs) => return Ok(MountFs::Fat32(Arc::new(fs))),
            Err(e) => {
                if want == FsType::Fat32 {
                    return Err(e);
                }
            }
        }
    }

    if matches!(want, FsType::Unknown | FsType::Mdfs) {
        let dev = partition_device(vdrive_id, lba)?;
        match mdfs::MdfsFs::mount(dev) {
            Ok(fs) => return Ok(MountFs::Mdfs(Arc::new(fs))),
            Err(e) => {
                if want == FsType::Mdfs {
                    return Err(e);
                }
            }
        }
    }

    if want == FsType::Unknown {
        let drivers = EXT_DRIVERS.lock();
        for driver in drivers.iter() {
            let ops = unsafe { &*driver.ops };
            let (Some(probe), Some(mount)) = (ops.probe, ops.mount) else {
                continue;
            };
            if probe(vdrive_id as i32, lba) != 1 {
                continue;
            }
            let mut ctx: *mut c_void = core::ptr::null_mut();
            if mount(vdrive_id as i32, lba, &mut ctx) == 0 {
                crate::log!("[FS] External FS matched: {} (LBA {})", driver.name, lba);
                return Ok(MountFs::External(ExtMount {
                    name: driver.name.clone(),
                    ops: driver.ops,
                    ctx,
                }));
            }
        }
    }

    Err(FsError::NotFound)
}

/// Mount a drive. `partition_lba == 0` with Unknown type auto-detects
/// the whole disk first, then each MBR partition. Returns the slot.
pub fn mount_drive(vdrive_id: u8, partition_lba: u32, fs_type: FsType) -> FsResult<usize> {
    if !vdrive::is_ready(vdrive_id) {
        return Err(FsError::DeviceNotReady);
    }

    {
        let mounts = MOUNTS.lock();
        if mounts
            .iter()
            .flatten()
            .any(|m| m.vdrive_id == vdrive_id && m.partition_lba == partition_lba)
        {
            return Err(FsError::AlreadyMounted);
        }
        // Auto-detect on an already-mounted drive would race the
        // existing mount for the same partitions
        if partition_lba == 0
            && fs_type == FsType::Unknown
            && mounts.iter().flatten().any(|m| m.vdrive_id == vdrive_id)
        {
            return Err(FsError::AlreadyMounted);
        }
    }

    // Work out which LBAs to try
    let mut candidates: Vec<u32> = Vec::new();
    if partition_lba == 0 && fs_type == FsType::Unknown {
        candidates.push(0);
        for p in vdrive::partitions(vdrive_id) {
            candidates.push(p.first_lba);
        }
    } else {
        candidates.push(partition_lba);
    }

    let mut mounted: Option<(MountFs, u32)> = None;
    for lba in candidates {
        match probe_at(vdrive_id, lba, fs_type) {
            Ok(fs) => {
                mounted = Some((fs, lba));
                break;
            }
            Err(_) => continue,
        }
    }
    let (fs, lba) = mounted.ok_or(FsError::NotFound)?;

    let mut mounts = MOUNTS.lock();
    let slot = mounts
        .iter()
        .position(|m| m.is_none())
        .ok_or(FsError::TooManyMounts)?;

    let entry = MountEntry {
        partition_index: vdrive::partition_index_for_lba(vdrive_id, lba),
        fs,
        vdrive_id,
        partition_lba: lba,
    };
    crate::log!(
        "[FS] Mounted {} (vDrive{}{}) at LBA {} in slot {}",
        fs_type_name(entry.fs_type()),
        vdrive_id,
        if entry.partition_index > 0 { "-P" } else { "" },
        lba,
        slot
    );
    mounts[slot] = Some(entry);
    Ok(slot)
}

/// Unmount by slot. Slot 0 is the boot filesystem and is refused.
pub fn unmount_slot(slot: usize) -> FsResult<()> {
    if slot == 0 {
        return Err(FsError::ReadOnly);
    }
    let mut mounts = MOUNTS.lock();
    let entry = mounts
        .get_mut(slot)
        .ok_or(FsError::BadFd)?
        .take()
        .ok_or(FsError::NotFound)?;

    if let MountFs::External(ext) = &entry.fs {
        if let Some(unmount) = ext.ops().unmount {
            unmount(ext.ctx);
        }
    }
    crate::log!("[FS] Unmounted slot {}", slot);
    Ok(())
}

/// Is this slot an active mount?
pub fn slot_in_use(slot: usize) -> bool {
    MOUNTS
        .lock()
        .get(slot)
        .map(|m| m.is_some())
        .unwrap_or(false)
}

/// (vdrive_id, partition_lba, type) of a mount
pub fn mount_info(slot: usize) -> Option<(u8, u32, FsType)> {
    let mounts = MOUNTS.lock();
    mounts
        .get(slot)?
        .as_ref()
        .map(|m| (m.vdrive_id, m.partition_lba, m.fs_type()))
}

/// Partition index of a mount (0 = whole disk)
pub fn mount_partition_index(slot: usize) -> u8 {
    let mounts = MOUNTS.lock();
    mounts
        .get(slot)
        .and_then(|m| m.as_ref())
        .map(|m| m.partition_index)
        .unwrap_or(0)
}

/// Stable label: "vDriveN" or "vDriveN-Pk"
pub fn mount_label(slot: usize) -> Option<String> {
    let mounts = MOUNTS.lock();
    let m = mounts.get(slot)?.as_ref()?;
    let mut label = String::from("vDrive");
    label.push_str(&m.vdrive_id.to_string());
    if m.partition_index > 0 {
        label.push_str("-P");
        label.push_str(&m.partition_index.to_string());
    }
    Some(label)
}

/// Number of active mounts
pub fn mount_count() -> usize {
    MOUNTS.lock().iter().flatten().count()
}

/// All active slots with their labels and types (for `$/mnt` listings)
pub fn mount_slots() -> Vec<(usize, String, FsType)> {
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .enumerate()
        .filter_map(|(i, m)| {
            let m = m.as_ref()?;
            let mut label = String::from("vDrive");
            label.push_str(&m.vdrive_id.to_string());
            if m.partition_index > 0 {
                label.push_str("-P");
                label.push_str(&m.partition_index.to_string());
            }
            Some((i, label, m.fs_type()))
        })
        .collect()
}

/// Find the slot for a vDrive id (+ optional partition index, 0 = any)
pub fn find_slot(vdrive_id: u8, partition: u8) -> Option<usize> {
    let mounts = MOUNTS.lock();
    mounts.iter().enumerate().find_map(|(i, m)| {
        let m = m.as_ref()?;
        if m.vdrive_id != vdrive_id {
            return None;
        }
        if partition > 0 && m.partition_index != partition {
            return None;
        }
        Some(i)
    })
}

/// Find a slot whose vDrive's slugified model name matches (ASCII
/// case-insensitive)
pub fn find_slot_by_model(name: &str) -> Option<usize> {
    let candidates: Vec<(usize, u8)> = {
        let mounts = MOUNTS.lock();
        mounts
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i, m.vdrive_id)))
            .collect()
    };
    for (slot, id) in candidates {
        if let Some(info) = vdrive::get(id) {
            let slug = path::slugify_model(&info.model);
            if !slug.is_empty() && slug.eq_ignore_ascii_case(name) {
                return Some(slot);
            }
        }
    }
    None
}

// ----------------------------------------------------------------------
// Whole-tree operations on a mounted filesystem
// ----------------------------------------------------------------------

fn with_mount<R>(slot: usize, f: impl FnOnce(&MountEntry) -> FsResult<R>) -> FsResult<R> {
    let mounts = MOUNTS.lock();
    let entry = mounts
        .get(slot)
        .ok_or(FsError::BadFd)?
        .as_ref()
        .ok_or(FsError::NotFound)?;
    f(entry)
}

pub fn stat(slot: usize, p: &str) -> FsResult<FileInfo> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.stat(p),
        MountFs::Mdfs(fs) => fs.stat(p),
        MountFs::External(ext) => ext.stat(p),
    })
}

pub fn file_exists(slot: usize, p: &str) -> bool {
    matches!(stat(slot, p), Ok(info) if !info.is_directory)
}

pub fn directory_exists(slot: usize, p: &str) -> bool {
    matches!(stat(slot, p), Ok(info) if info.is_directory)
}

/// Read a whole file into memory.
pub fn read_file(slot: usize, p: &str) -> FsResult<Vec<u8>> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.read_file(p),
        MountFs::Mdfs(fs) => fs.read_file(p),
        MountFs::External(ext) => ext.read_file(p),
    })
}

/// Write a whole file (create or truncate).
pub fn write_file(slot: usize, p: &str, data: &[u8]) -> FsResult<()> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.write_file(p, data),
        MountFs::Mdfs(fs) => fs.write_file(p, data),
        MountFs::External(ext) => ext.write_file(p, data),
    })
}

pub fn read_dir(slot: usize, p: &str) -> FsResult<Vec<DirEntryInfo>> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.list_dir(p),
        MountFs::Mdfs(fs) => fs.read_dir(p),
        MountFs::External(_) => Err(FsError::NotSupported),
    })
}

pub fn opendir(slot: usize, p: &str) -> FsResult<DirHandle> {
    Ok(DirHandle::new(read_dir(slot, p)?))
}

pub fn mkdir(slot: usize, p: &str) -> FsResult<()> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.mkdir(p),
        MountFs::Mdfs(fs) => fs.mkdir(p),
        MountFs::External(_) => Err(FsError::NotSupported),
    })
}

pub fn rmdir(slot: usize, p: &str) -> FsResult<()> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.rmdir(p),
        MountFs::Mdfs(fs) => fs.rmdir(p),
        MountFs::External(_) => Err(FsError::NotSupported),
    })
}

pub fn unlink(slot: usize, p: &str) -> FsResult<()> {
    with_mount(slot, |m| match &m.fs {
        MountFs::Fat32(fs) => fs.unlink(p),
        MountFs::Mdfs(fs) => fs.unlink(p),
        MountFs::External(_) => Err(FsError::NotSupported),
    })
}

// ----------------------------------------------------------------------
// Formatting and rescanning
// ----------------------------------------------------------------------

/// Format a partition. The mounted check comes first; a freshly
/// formatted FAT32 partition that matches an MBR entry gets its type
/// byte set to 0x0C.
pub fn format(
    vdrive_id: u8,
    partition_lba: u32,
    fs_name: &str,
    volume_label: Option<&str>,
    sectors_per_cluster: u32,
) -> FsResult<()> {
    if !vdrive::is_ready(vdrive_id) {
        return Err(FsError::DeviceNotReady);
    }
    {
        let mounts = MOUNTS.lock();
        if mounts
            .iter()
            .flatten()
            .any(|m| m.vdrive_id == vdrive_id && m.partition_lba == partition_lba)
        {
            return Err(FsError::AlreadyMounted);
        }
    }

    match fs_name {
        "fat32" => {
            let dev = partition_device(vdrive_id, partition_lba)?;
            fat32::format(&dev, volume_label, sectors_per_cluster)?;
            if partition_lba != 0 {
                // Re-type the MBR entry for the freshly formatted volume
                if vdrive::mbr_set_type_for_lba(vdrive_id, partition_lba, 0x0C).is_err() {
                    crate::log_debug!("[FS] no MBR entry at LBA {} to re-type", partition_lba);
                }
            }
            Ok(())
        }
        "mdfs" => {
            let dev = partition_device(vdrive_id, partition_lba)?;
            mdfs::mkfs(dev, volume_label)
        }
        other => {
            // External drivers may bring their own mkfs
            let drivers = EXT_DRIVERS.lock();
            for d in drivers.iter() {
                if d.name == other {
                    let ops = unsafe { &*d.ops };
                    let mkfs = ops.mkfs.ok_or(FsError::NotSupported)?;
                    let sectors = VdrivePartition::new(vdrive_id, partition_lba as u64)
                        .map(|p| p.sector_count())
                        .unwrap_or(0);
                    return if mkfs(vdrive_id as i32, partition_lba, sectors as u32) == 0 {
                        Ok(())
                    } else {
                        Err(FsError::Io)
                    };
                }
            }
            Err(FsError::NotSupported)
        }
    }
}

/// Mount everything new: called after SQRM modules register their
/// drivers so late filesystems get picked up.
pub fn rescan_all() {
    crate::log!("[FS] Rescanning drives for new filesystems...");
    for id in 0..vdrive::count() as u8 {
        let already = {
            let mounts = MOUNTS.lock();
            mounts.iter().flatten().any(|m| m.vdrive_id == id)
        };
        if already {
            continue;
        }
        if let Ok(slot) = mount_drive(id, 0, FsType::Unknown) {
            crate::log!("[FS] Rescan mounted vDrive{} in slot {}", id, slot);
        }
    }
}

// ----------------------------------------------------------------------
// Path resolution against the mount table
// ----------------------------------------------------------------------

/// Fully resolved path target
pub enum Resolved {
    /// A mounted filesystem + a path inside it
    Mount { slot: usize, rel: String },
    /// A DEVFS pseudo-directory or device node
    DevVfs { kind: path::DevVfsKind, rel: String },
}

/// Resolve a user-supplied path against a working directory and the
/// caller's current mount slot.
pub fn resolve(path_str: &str, cwd: &str, current_slot: usize) -> FsResult<Resolved> {
    let absolute = path::absolutize(cwd, path_str);
    match path::parse(&absolute)? {
        path::RawRoute::Current { rel } => {
            if !slot_in_use(current_slot) {
                return Err(FsError::NotFound);
            }
            Ok(Resolved::Mount {
                slot: current_slot,
                rel,
            })
        }
        path::RawRoute::Mount { drive, rel } => {
            let slot = match drive {
                path::DriveSpec::ById {
                    vdrive_id,
                    partition,
                } => find_slot(vdrive_id, partition),
                path::DriveSpec::ByName(name) => find_slot_by_model(&name),
            }
            .ok_or(FsError::NotFound)?;
            Ok(Resolved::Mount { slot, rel })
        }
        path::RawRoute::DevVfs { kind, rel } => Ok(Resolved::DevVfs { kind, rel }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::memdisk::MemDisk;

    /// Boot scenario: 512-byte disk, MBR entry type 0x0C at LBA 2048,
    /// FAT32 volume there with /ModuOS/System64/mdsys.sqr
    #[test]
    fn test_boot_disk_mount_and_marker() {
        let disk = Arc::new(MemDisk::new(2048 + 16384, 512, "BOOT DISK"));

        // Partition table
        let mut mbr = [0u8; 512];
        mbr[446 + 4] = 0x0C;
        mbr[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&16384u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write_sector(0, &mbr).unwrap();

        let id = vdrive::add_mem_disk(disk).unwrap();

        // Format the partition and drop the marker file
        format(id, 2048, "fat32", Some("BOOT"), 1).unwrap();
        {
            let dev = partition_device(id, 2048).unwrap();
            let fs = fat32::Fat32Fs::mount(dev).unwrap();
            fs.mkdir("/ModuOS").unwrap();
            fs.mkdir("/ModuOS/System64").unwrap();
            fs.write_file("/ModuOS/System64/mdsys.sqr", b"moduos").unwrap();
        }

        let slot = mount_drive(id, 0, FsType::Unknown).unwrap();
        assert!(file_exists(slot, "/ModuOS/System64/mdsys.sqr"));
        assert_eq!(mount_partition_index(slot), 1);
        assert_eq!(mount_label(slot).unwrap(), {
            let mut s = String::from("vDrive");
            s.push_str(&id.to_string());
            s.push_str("-P1");
            s
        });

        // Second mount of the same partition is refused
        assert_eq!(
            mount_drive(id, 2048, FsType::Fat32).unwrap_err(),
            FsError::AlreadyMounted
        );
    }

    #[test]
    fn test_mdfs_volume_auto_probe() {
        let disk = Arc::new(MemDisk::new(8192, 512, "MDFS VOLUME"));
        let id = vdrive::add_mem_disk(disk).unwrap();

        format(id, 0, "mdfs", None, 0).unwrap();
        let slot = mount_drive(id, 0, FsType::Unknown).unwrap();

        let (_, _, t) = mount_info(slot).unwrap();
        assert_eq!(t, FsType::Mdfs);
        assert!(file_exists(slot, "/test.txt"));

        write_file(slot, "/cycle.txt", b"abc").unwrap();
        assert_eq!(read_file(slot, "/cycle.txt").unwrap(), b"abc");
        unlink(slot, "/cycle.txt").unwrap();
        assert!(!file_exists(slot, "/cycle.txt"));
    }

    #[test]
    fn test_dir_handle_iteration() {
        let mut dh = DirHandle::new(alloc::vec![
            DirEntryInfo {
                name: String::from("a"),
                size: 1,
                is_directory: false
            },
            DirEntryInfo {
                name: String::from("b"),
                size: 0,
                is_directory: true
            },
        ]);
        assert_eq!(dh.next_entry().unwrap().name, "a");
        assert_eq!(dh.next_entry().unwrap().name, "b");
        assert!(dh.next_entry().is_none());
    }

    #[test]
    fn test_unmount_refuses_boot_slot() {
        assert_eq!(unmount_slot(0).unwrap_err(), FsError::ReadOnly);
    }
}
