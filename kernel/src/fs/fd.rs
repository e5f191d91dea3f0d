//! File descriptor table
//!
//! A kernel-wide table of MAX_FDS descriptors; 0/1/2 are reserved as
//! stdin/stdout/stderr markers and never carry a backing file. Regular
//! files are opened through the HVFS read path: the entire file is
//! loaded into a per-descriptor cache and reads are served from it.
//! `dup` copies the cache so positions stay independent. Directory
//! descriptors hold an owned iterator; DEVFS descriptors route to the
//! device ops.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use super::devfs::DevfsDevice;
use super::{DirEntryInfo, DirHandle, FsError, FsResult, Resolved};

/// Maximum number of open descriptors
pub const MAX_FDS: usize = 256;

/// Reserved descriptors
pub const STDIN_FILENO: usize = 0;
pub const STDOUT_FILENO: usize = 1;
pub const STDERR_FILENO: usize = 2;

/// Open flags (POSIX-like numbering)
pub const O_RDONLY: u32 = 0x0000;
pub const O_WRONLY: u32 = 0x0001;
pub const O_RDWR: u32 = 0x0002;
pub const O_CREAT: u32 = 0x0040;
pub const O_TRUNC: u32 = 0x0200;
pub const O_APPEND: u32 = 0x0400;
pub const O_NONBLOCK: u32 = 0x0800;

bitflags! {
    /// Descriptor state flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        const READ     = 0x01;
        const WRITE    = 0x02;
        const APPEND   = 0x04;
        const CREATE   = 0x08;
        const NONBLOCK = 0x10;
    }
}

impl FdFlags {
    /// Derive from open(2)-style flags
    pub fn from_open_flags(flags: u32) -> Self {
        let mut f = FdFlags::empty();
        match flags & 0x3 {
            O_WRONLY => f |= FdFlags::WRITE,
            O_RDWR => f |= FdFlags::READ | FdFlags::WRITE,
            _ => f |= FdFlags::READ,
        }
        if flags & O_APPEND != 0 {
            f |= FdFlags::APPEND;
        }
        if flags & O_CREAT != 0 {
            f |= FdFlags::CREATE;
        }
        if flags & O_NONBLOCK != 0 {
            f |= FdFlags::NONBLOCK;
        }
        f
    }
}

/// What a descriptor is backed by
enum FdKind {
    /// Regular file with its HVFS read cache
    File { cache: Vec<u8> },
    /// Directory iterator (filesystem or DEVFS pseudo-directory)
    Dir(DirHandle),
    /// DEVFS character device
    Device(Arc<dyn DevfsDevice>),
}

/// One open descriptor
struct FileDescriptor {
    mount_slot: usize,
    path: String,
    position: usize,
    file_size: usize,
    flags: FdFlags,
    owner_pid: u32,
    kind: FdKind,
}

const NONE_FD: Option<Box<FileDescriptor>> = None;
static FD_TABLE: Mutex<[Option<Box<FileDescriptor>>; MAX_FDS]> = Mutex::new([NONE_FD; MAX_FDS]);

/// Initialize the descriptor table.
pub fn init() {
    crate::log!("[FD] Descriptor table ready ({} slots, 0-2 reserved)", MAX_FDS);
}

fn alloc_slot(table: &mut [Option<Box<FileDescriptor>>; MAX_FDS]) -> FsResult<usize> {
    for (i, slot) in table.iter_mut().enumerate().skip(3) {
        if slot.is_none() {
            return Ok(i);
        }
    }
    Err(FsError::TooManyOpenFiles)
}

/// Open a resolved path for a process. Regular files go through the
/// HVFS read: the whole file lands in a fresh cache.
pub fn open(resolved: &Resolved, open_flags: u32, pid: u32) -> FsResult<usize> {
    let flags = FdFlags::from_open_flags(open_flags);

    match resolved {
        Resolved::Mount { slot, rel } => open_file(*slot, rel, flags, open_flags, pid),
        Resolved::DevVfs { kind, rel } => {
            let dev = super::devfs::open(*kind, rel)?;
            let mut table = FD_TABLE.lock();
            let fd = alloc_slot(&mut table)?;
            table[fd] = Some(Box::new(FileDescriptor {
                mount_slot: usize::MAX,
                path: String::from(rel),
                position: 0,
                file_size: 0,
                flags,
                owner_pid: pid,
                kind: FdKind::Device(dev),
            }));
            Ok(fd)
        }
    }
}

fn open_file(slot: usize, path: &str, flags: FdFlags, open_flags: u32, pid: u32) -> FsResult<usize> {
    let info = match super::stat(slot, path) {
        Ok(info) => {
            if info.is_directory {
                return Err(FsError::IsADirectory);
            }
            Some(info)
        }
        Err(FsError::NotFound) if flags.contains(FdFlags::CREATE) => {
            super::write_file(slot, path, &[])?;
            None
        }
        Err(e) => return Err(e),
    };

    // HVFS read: bring the entire file into the cache
    let cache = match info {
        Some(_) if open_flags & O_TRUNC != 0 && flags.contains(FdFlags::WRITE) => {
            super::write_file(slot, path, &[])?;
            Vec::new()
        }
        Some(_) => super::read_file(slot, path)?,
        None => Vec::new(),
    };

    let file_size = cache.len();
    let position = if flags.contains(FdFlags::APPEND) {
        file_size
    } else {
        0
    };

    let mut table = FD_TABLE.lock();
    let fd = alloc_slot(&mut table)?;
    table[fd] = Some(Box::new(FileDescriptor {
        mount_slot: slot,
        path: String::from(path),
        position,
        file_size,
        flags,
        owner_pid: pid,
        kind: FdKind::File { cache },
    }));
    Ok(fd)
}

/// Open a directory iterator (filesystem directory or a DEVFS
/// pseudo-directory like `$/mnt`).
pub fn opendir(resolved: &Resolved, pid: u32) -> FsResult<usize> {
    let (handle, slot, path) = match resolved {
        Resolved::Mount { slot, rel } => {
            let info = super::stat(*slot, rel)?;
            if !info.is_directory {
                return Err(FsError::NotADirectory);
            }
            (super::opendir(*slot, rel)?, *slot, rel.clone())
        }
        Resolved::DevVfs { kind, rel } => {
            let rel_trim = rel.trim_start_matches('/');
            if !rel_trim.is_empty() {
                return Err(FsError::NotADirectory);
            }
            (
                DirHandle::new(super::devfs::list(*kind)),
                usize::MAX,
                rel.clone(),
            )
        }
    };

    let mut table = FD_TABLE.lock();
    let fd = alloc_slot(&mut table)?;
    table[fd] = Some(Box::new(FileDescriptor {
        mount_slot: slot,
        path,
        position: 0,
        file_size: 0,
        flags: FdFlags::READ,
        owner_pid: pid,
        kind: FdKind::Dir(handle),
    }));
    Ok(fd)
}

fn check_fd(fd: usize) -> FsResult<()> {
    if fd < 3 || fd >= MAX_FDS {
        return Err(FsError::BadFd);
    }
    Ok(())
}

/// Read from a descriptor. File reads come out of the cache; device
/// reads honor O_NONBLOCK.
pub fn read(fd: usize, buf: &mut [u8]) -> FsResult<usize> {
    check_fd(fd)?;

    // Device reads may block; do them outside the table lock
    let dev = {
        let mut table = FD_TABLE.lock();
        let desc = table[fd].as_mut().ok_or(FsError::BadFd)?;
        if !desc.flags.contains(FdFlags::READ) {
            return Err(FsError::BadFd);
        }
        match &mut desc.kind {
            FdKind::File { cache } => {
                let pos = desc.position.min(cache.len());
                let n = (cache.len() - pos).min(buf.len());
                buf[..n].copy_from_slice(&cache[pos..pos + n]);
                desc.position = pos + n;
                return Ok(n);
            }
            FdKind::Dir(_) => return Err(FsError::IsADirectory),
            FdKind::Device(dev) => (dev.clone(), desc.flags.contains(FdFlags::NONBLOCK)),
        }
    };

    let (dev, nonblock) = dev;
    dev.read(buf, nonblock)
}

/// Write to a descriptor. File writes update the cache and push the
/// whole file back synchronously.
pub fn write(fd: usize, buf: &[u8]) -> FsResult<usize> {
    check_fd(fd)?;

    let (dev, flush): (Option<Arc<dyn DevfsDevice>>, Option<(usize, String, Vec<u8>)>) = {
        let mut table = FD_TABLE.lock();
        let desc = table[fd].as_mut().ok_or(FsError::BadFd)?;
        if !desc.flags.contains(FdFlags::WRITE) {
            return Err(FsError::BadFd);
        }
        match &mut desc.kind {
            FdKind::File { cache } => {
                let pos = if desc.flags.contains(FdFlags::APPEND) {
                    cache.len()
                } else {
                    desc.position.min(cache.len())
                };
                if pos + buf.len() > cache.len() {
                    cache.resize(pos + buf.len(), 0);
                }
                cache[pos..pos + buf.len()].copy_from_slice(buf);
                desc.position = pos + buf.len();
                desc.file_size = cache.len();
                (
                    None,
                    Some((desc.mount_slot, desc.path.clone(), cache.clone())),
                )
            }
            FdKind::Dir(_) => return Err(FsError::IsADirectory),
            FdKind::Device(dev) => (Some(dev.clone()), None),
        }
    };

    if let Some(dev) = dev {
        return dev.write(buf);
    }
    if let Some((slot, path, data)) = flush {
        // Synchronous write-through to the filesystem
        super::write_file(slot, &path, &data)?;
    }
    Ok(buf.len())
}

/// Seek within a regular file; the position clamps to [0, size].
pub fn lseek(fd: usize, offset: i64, whence: u32) -> FsResult<u64> {
    check_fd(fd)?;
    let mut table = FD_TABLE.lock();
    let desc = table[fd].as_mut().ok_or(FsError::BadFd)?;

    let size = match &desc.kind {
        FdKind::File { cache } => cache.len() as i64,
        _ => return Err(FsError::BadFd),
    };

    let base = match whence {
        0 => 0,                       // SEEK_SET
        1 => desc.position as i64,    // SEEK_CUR
        2 => size,                    // SEEK_END
        _ => return Err(FsError::InvalidPath),
    };
    let target = base.saturating_add(offset).clamp(0, size);
    desc.position = target as usize;
    Ok(target as u64)
}

/// Current position
pub fn tell(fd: usize) -> FsResult<u64> {
    check_fd(fd)?;
    let table = FD_TABLE.lock();
    let desc = table[fd].as_ref().ok_or(FsError::BadFd)?;
    Ok(desc.position as u64)
}

/// Duplicate a descriptor. The cache is physically copied so the two
/// descriptors keep independent positions.
pub fn dup(fd: usize) -> FsResult<usize> {
    check_fd(fd)?;
    let mut table = FD_TABLE.lock();

    let copy = {
        let desc = table[fd].as_ref().ok_or(FsError::BadFd)?;
        let kind = match &desc.kind {
            FdKind::File { cache } => FdKind::File {
                cache: cache.clone(),
            },
            FdKind::Dir(handle) => FdKind::Dir(handle.clone()),
            FdKind::Device(dev) => FdKind::Device(dev.clone()),
        };
        Box::new(FileDescriptor {
            mount_slot: desc.mount_slot,
            path: desc.path.clone(),
            position: desc.position,
            file_size: desc.file_size,
            flags: desc.flags,
            owner_pid: desc.owner_pid,
            kind,
        })
    };

    let newfd = alloc_slot(&mut table)?;
    table[newfd] = Some(copy);
    Ok(newfd)
}

/// Next directory entry from a directory descriptor.
pub fn readdir(fd: usize) -> FsResult<Option<DirEntryInfo>> {
    check_fd(fd)?;
    let mut table = FD_TABLE.lock();
    let desc = table[fd].as_mut().ok_or(FsError::BadFd)?;
    match &mut desc.kind {
        FdKind::Dir(handle) => Ok(handle.next_entry()),
        _ => Err(FsError::NotADirectory),
    }
}

/// Close a descriptor, releasing its cache or iterator.
pub fn close(fd: usize) -> FsResult<()> {
    check_fd(fd)?;
    let mut table = FD_TABLE.lock();
    table[fd].take().ok_or(FsError::BadFd)?;
    Ok(())
}

/// Is this a directory descriptor?
pub fn is_directory_fd(fd: usize) -> bool {
    if fd < 3 || fd >= MAX_FDS {
        return false;
    }
    let table = FD_TABLE.lock();
    matches!(
        table[fd].as_ref().map(|d| &d.kind),
        Some(FdKind::Dir(_))
    )
}

/// Reclaim everything a process owns.
pub fn close_all(pid: u32) {
    let mut table = FD_TABLE.lock();
    for slot in table.iter_mut().skip(3) {
        if slot.as_ref().map(|d| d.owner_pid) == Some(pid) {
            *slot = None;
        }
    }
}

/// Open descriptors owned by a process (diagnostics)
pub fn count_for(pid: u32) -> usize {
    let table = FD_TABLE.lock();
    table
        .iter()
        .skip(3)
        .filter(|d| d.as_ref().map(|d| d.owner_pid) == Some(pid))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::memdisk::MemDisk;
    use crate::block::vdrive;
    use crate::fs::FsType;

    fn mounted_volume() -> usize {
        let disk = Arc::new(MemDisk::new(8192, 512, "FD TEST DISK"));
        let id = vdrive::add_mem_disk(disk).unwrap();
        super::super::format(id, 0, "mdfs", None, 0).unwrap();
        super::super::mount_drive(id, 0, FsType::Mdfs).unwrap()
    }

    fn mount_resolved(slot: usize, rel: &str) -> Resolved {
        Resolved::Mount {
            slot,
            rel: String::from(rel),
        }
    }

    #[test]
    fn test_open_read_cache_and_position() {
        let slot = mounted_volume();
        super::super::write_file(slot, "/data.txt", b"0123456789").unwrap();

        let fd = open(&mount_resolved(slot, "/data.txt"), O_RDONLY, 1).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(read(fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");
        assert_eq!(read(fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(read(fd, &mut buf).unwrap(), 0);
        close(fd).unwrap();
    }

    #[test]
    fn test_lseek_clamps() {
        let slot = mounted_volume();
        super::super::write_file(slot, "/seek.txt", b"abcdef").unwrap();

        let fd = open(&mount_resolved(slot, "/seek.txt"), O_RDONLY, 1).unwrap();
        assert_eq!(lseek(fd, 100, 0).unwrap(), 6); // clamp to size
        assert_eq!(lseek(fd, -100, 1).unwrap(), 0); // clamp to 0
        assert_eq!(lseek(fd, -2, 2).unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        close(fd).unwrap();
    }

    #[test]
    fn test_dup_copies_cache_and_position() {
        let slot = mounted_volume();
        super::super::write_file(slot, "/dup.txt", b"xyzw").unwrap();

        let fd = open(&mount_resolved(slot, "/dup.txt"), O_RDONLY, 1).unwrap();
        let mut buf = [0u8; 2];
        read(fd, &mut buf).unwrap();

        let fd2 = dup(fd).unwrap();
        // Independent positions from here on
        read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"zw");
        let mut buf2 = [0u8; 2];
        read(fd2, &mut buf2).unwrap();
        assert_eq!(&buf2, b"zw");

        close(fd).unwrap();
        close(fd2).unwrap();
    }

    #[test]
    fn test_write_through_and_reopen() {
        let slot = mounted_volume();
        let fd = open(
            &mount_resolved(slot, "/new.txt"),
            O_WRONLY | O_CREAT,
            1,
        )
        .unwrap();
        assert_eq!(write(fd, b"written").unwrap(), 7);
        close(fd).unwrap();

        assert_eq!(super::super::read_file(slot, "/new.txt").unwrap(), b"written");
    }

    #[test]
    fn test_opendir_and_readdir() {
        let slot = mounted_volume();
        super::super::mkdir(slot, "/sub").unwrap();
        super::super::write_file(slot, "/sub/one", b"1").unwrap();
        super::super::write_file(slot, "/sub/two", b"22").unwrap();

        let fd = opendir(&mount_resolved(slot, "/sub"), 1).unwrap();
        let mut names = alloc::vec::Vec::new();
        while let Some(e) = readdir(fd).unwrap() {
            names.push(e.name);
        }
        close(fd).unwrap();
        names.sort();
        assert_eq!(names, alloc::vec![String::from("one"), String::from("two")]);
    }

    #[test]
    fn test_close_all_reclaims_by_pid() {
        let slot = mounted_volume();
        super::super::write_file(slot, "/owned.txt", b"o").unwrap();

        let fd1 = open(&mount_resolved(slot, "/owned.txt"), O_RDONLY, 77).unwrap();
        let fd2 = open(&mount_resolved(slot, "/owned.txt"), O_RDONLY, 77).unwrap();
        let fd3 = open(&mount_resolved(slot, "/owned.txt"), O_RDONLY, 78).unwrap();
        assert_eq!(count_for(77), 2);

        close_all(77);
        assert_eq!(count_for(77), 0);
        let mut buf = [0u8; 1];
        assert_eq!(read(fd1, &mut buf).unwrap_err(), FsError::BadFd);
        assert_eq!(read(fd2, &mut buf).unwrap_err(), FsError::BadFd);
        assert_eq!(read(fd3, &mut buf).unwrap(), 1);
        close(fd3).unwrap();
    }

    #[test]
    fn test_reserved_fds_rejected() {
        let mut buf = [0u8; 1];
        assert_eq!(read(0, &mut buf).unwrap_err(), FsError::BadFd);
        assert_eq!(write(1, b"x").unwrap_err(), FsError::BadFd);
        assert_eq!(close(2).unwrap_err(), FsError::BadFd);
    }
}
