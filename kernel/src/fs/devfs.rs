//! DEVFS - the `$/dev` virtual namespace
//!
//! Character devices synthesized by the kernel: the input streams
//! (`input/kbd0`, `input/event0`) and the graphics info node
//! (`graphics/video0`). SQRM driver modules can register additional
//! nodes. `$/mnt` listings are synthesized from the mount table.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ffi::c_void;
use spin::Mutex;

use super::path::DevVfsKind;
use super::{DirEntryInfo, FsError, FsResult};
use crate::drivers::input;

/// A DEVFS character device
pub trait DevfsDevice: Send + Sync {
    /// Read; `nonblock` selects O_NONBLOCK semantics (0 instead of wait)
    fn read(&self, buf: &mut [u8], nonblock: bool) -> FsResult<usize>;
    fn write(&self, _buf: &[u8]) -> FsResult<usize> {
        Err(FsError::NotSupported)
    }
}

struct DevNode {
    /// Path under `$/dev`, e.g. "input/kbd0"
    name: String,
    dev: Arc<dyn DevfsDevice>,
}

static DEVICES: Mutex<Vec<DevNode>> = Mutex::new(Vec::new());

// ----------------------------------------------------------------------
// Built-in devices
// ----------------------------------------------------------------------

/// `$/dev/input/kbd0`: ASCII byte stream from the keyboard ring
struct Kbd0;

impl DevfsDevice for Kbd0 {
    fn read(&self, buf: &mut [u8], nonblock: bool) -> FsResult<usize> {
        Ok(input::read_kbd(buf, nonblock))
    }
}

/// `$/dev/input/event0`: 16-byte input Event records
struct Event0;

impl DevfsDevice for Event0 {
    fn read(&self, buf: &mut [u8], nonblock: bool) -> FsResult<usize> {
        Ok(input::read_events(buf, nonblock))
    }
}

/// `$/dev/graphics/video0`: returns the 24-byte packed framebuffer
/// description (little-endian):
/// u64 fb_addr; u32 width; u32 height; u32 pitch; u8 bpp; u8 mode;
/// u8 fmt; u8 reserved;
struct Video0;

pub const VIDEO0_INFO_LEN: usize = 24;

fn video0_info() -> [u8; VIDEO0_INFO_LEN] {
    let mut out = [0u8; VIDEO0_INFO_LEN];
    if let Some(fb) = crate::boot::config().framebuffer {
        out[0..8].copy_from_slice(&fb.addr.to_le_bytes());
        out[8..12].copy_from_slice(&fb.width.to_le_bytes());
        out[12..16].copy_from_slice(&fb.height.to_le_bytes());
        out[16..20].copy_from_slice(&fb.pitch.to_le_bytes());
        out[20] = fb.bpp;
        out[21] = 1; // mode: linear framebuffer active
        out[22] = 0; // fmt: RGB
    }
    out
}

impl DevfsDevice for Video0 {
    fn read(&self, buf: &mut [u8], _nonblock: bool) -> FsResult<usize> {
        let info = video0_info();
        let n = buf.len().min(info.len());
        buf[..n].copy_from_slice(&info[..n]);
        Ok(n)
    }
}

/// Sequential reader over a whole vDrive, exposed as a top-level
/// block-device node (`$/dev/vdrive0`, ...)
struct BlockNode {
    vdrive_id: u8,
    pos: Mutex<u64>,
}

impl DevfsDevice for BlockNode {
    fn read(&self, buf: &mut [u8], _nonblock: bool) -> FsResult<usize> {
        let info = crate::block::vdrive::get(self.vdrive_id).ok_or(FsError::DeviceNotReady)?;
        let sector_size = info.sector_size as u64;
        let total = info.total_sectors * sector_size;

        let mut pos = self.pos.lock();
        let mut done = 0usize;
        let mut sector_buf = alloc::vec![0u8; info.sector_size as usize];
        while done < buf.len() && *pos < total {
            let lba = *pos / sector_size;
            let within = (*pos % sector_size) as usize;
            crate::block::vdrive::read_sector(self.vdrive_id, lba, &mut sector_buf)
                .map_err(|_| FsError::Io)?;
            let take = (buf.len() - done).min(sector_buf.len() - within);
            buf[done..done + take].copy_from_slice(&sector_buf[within..within + take]);
            done += take;
            *pos += take as u64;
        }
        Ok(done)
    }
}

/// Register the built-in device nodes. Must run after the boot info is
/// captured (video0 reads the framebuffer tag) and after vDrive
/// enumeration (one block node per drive).
pub fn init() {
    let mut devices = DEVICES.lock();
    devices.push(DevNode {
        name: String::from("input/kbd0"),
        dev: Arc::new(Kbd0),
    });
    devices.push(DevNode {
        name: String::from("input/event0"),
        dev: Arc::new(Event0),
    });
    devices.push(DevNode {
        name: String::from("graphics/video0"),
        dev: Arc::new(Video0),
    });

    for id in 0..crate::block::vdrive::count() as u8 {
        let mut name = String::from("vdrive");
        name.push_str(&id.to_string());
        devices.push(DevNode {
            name,
            dev: Arc::new(BlockNode {
                vdrive_id: id,
                pos: Mutex::new(0),
            }),
        });
    }

    crate::log!("[DEVFS] {} device node(s) registered", devices.len());
}

/// Register a device node (kernel drivers and SQRM modules).
pub fn register(name: &str, dev: Arc<dyn DevfsDevice>) -> FsResult<()> {
    let mut devices = DEVICES.lock();
    if devices.iter().any(|d| d.name == name) {
        return Err(FsError::Exists);
    }
    devices.push(DevNode {
        name: name.to_string(),
        dev,
    });
    crate::log!("[DEVFS] Registered device: {}", name);
    Ok(())
}

/// External device backed by C function pointers (SQRM modules)
struct ExternDevice {
    read: Option<extern "C" fn(ctx: *mut c_void, buf: *mut u8, count: usize) -> isize>,
    write: Option<extern "C" fn(ctx: *mut c_void, buf: *const u8, count: usize) -> isize>,
    ctx: *mut c_void,
}

unsafe impl Send for ExternDevice {}
unsafe impl Sync for ExternDevice {}

impl DevfsDevice for ExternDevice {
    fn read(&self, buf: &mut [u8], _nonblock: bool) -> FsResult<usize> {
        let read = self.read.ok_or(FsError::NotSupported)?;
        let n = read(self.ctx, buf.as_mut_ptr(), buf.len());
        if n < 0 {
            Err(FsError::Io)
        } else {
            Ok(n as usize)
        }
    }

    fn write(&self, buf: &[u8]) -> FsResult<usize> {
        let write = self.write.ok_or(FsError::NotSupported)?;
        let n = write(self.ctx, buf.as_ptr(), buf.len());
        if n < 0 {
            Err(FsError::Io)
        } else {
            Ok(n as usize)
        }
    }
}

/// SQRM capability surface: register a node from C function pointers.
pub fn register_external(
    name: &str,
    read: Option<extern "C" fn(*mut c_void, *mut u8, usize) -> isize>,
    write: Option<extern "C" fn(*mut c_void, *const u8, usize) -> isize>,
    ctx: *mut c_void,
) -> FsResult<()> {
    register(name, Arc::new(ExternDevice { read, write, ctx }))
}

/// Look up a device by DEVFS kind + relative path.
pub fn open(kind: DevVfsKind, rel: &str) -> FsResult<Arc<dyn DevfsDevice>> {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return Err(FsError::IsADirectory);
    }
    let full = match kind {
        DevVfsKind::DevInput => {
            let mut s = String::from("input/");
            s.push_str(rel);
            s
        }
        DevVfsKind::DevGraphics => {
            let mut s = String::from("graphics/");
            s.push_str(rel);
            s
        }
        DevVfsKind::DevList => String::from(rel),
        _ => return Err(FsError::NotFound),
    };

    let devices = DEVICES.lock();
    devices
        .iter()
        .find(|d| d.name == full)
        .map(|d| d.dev.clone())
        .ok_or(FsError::NotFound)
}

/// Directory listing for the DEVFS pseudo-directories.
pub fn list(kind: DevVfsKind) -> Vec<DirEntryInfo> {
    let dir_entry = |name: &str| DirEntryInfo {
        name: name.to_string(),
        size: 0,
        is_directory: true,
    };
    let node_entry = |name: &str| DirEntryInfo {
        name: name.to_string(),
        size: 0,
        is_directory: false,
    };

    match kind {
        DevVfsKind::Root => alloc::vec![dir_entry("mnt"), dir_entry("dev")],
        DevVfsKind::MntList => super::mount_slots()
            .into_iter()
            .map(|(_, label, _)| dir_entry(&label))
            .collect(),
        DevVfsKind::DevList => {
            let mut out = alloc::vec![dir_entry("input"), dir_entry("graphics")];
            let devices = DEVICES.lock();
            for d in devices.iter() {
                if !d.name.contains('/') {
                    out.push(node_entry(&d.name));
                }
            }
            out
        }
        DevVfsKind::DevInput => {
            let devices = DEVICES.lock();
            devices
                .iter()
                .filter_map(|d| d.name.strip_prefix("input/"))
                .map(node_entry)
                .collect()
        }
        DevVfsKind::DevGraphics => {
            let devices = DEVICES.lock();
            devices
                .iter()
                .filter_map(|d| d.name.strip_prefix("graphics/"))
                .map(node_entry)
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl DevfsDevice for Echo {
        fn read(&self, buf: &mut [u8], _nonblock: bool) -> FsResult<usize> {
            let msg = b"echo";
            let n = buf.len().min(msg.len());
            buf[..n].copy_from_slice(&msg[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_register_and_open() {
        register("input/testdev0", Arc::new(Echo)).unwrap();
        let dev = open(DevVfsKind::DevInput, "/testdev0").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(dev.read(&mut buf, true).unwrap(), 4);
        assert_eq!(&buf[..4], b"echo");

        // duplicate names are refused
        assert_eq!(
            register("input/testdev0", Arc::new(Echo)).unwrap_err(),
            FsError::Exists
        );
    }

    #[test]
    fn test_open_missing_device() {
        assert_eq!(
            open(DevVfsKind::DevInput, "/nodev9").unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn test_video0_record_layout() {
        assert_eq!(VIDEO0_INFO_LEN, 24);
    }
}
