//! Block Device Layer
//!
//! A handle table over sector-addressable devices. Handle 0 is the
//! invalid sentinel. All bounds and buffer checks happen here, above the
//! device ops, so backends can assume validated requests. SQRM FS
//! modules talk to storage exclusively through these handles.

pub mod memdisk;
pub mod vdrive;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

/// Opaque block device handle; 0 is invalid
pub type Handle = u32;

/// The invalid sentinel handle
pub const INVALID_HANDLE: Handle = 0;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        const READONLY  = 1 << 0;
        const REMOVABLE = 1 << 1;
    }
}

/// Device description returned by `get_info`
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub sector_size: u32,
    pub sector_count: u64,
    pub flags: BlockFlags,
    pub model: String,
}

/// Block layer errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    InvalidHandle,
    /// Buffer smaller than count * sector_size
    BadBuffer,
    /// LBA range exceeds the device
    OutOfRange,
    /// Write to a READONLY device
    ReadOnly,
    DeviceNotReady,
    Io,
    Unsupported,
}

/// Stateless device operations behind a handle
pub trait BlockOps: Send + Sync {
    fn get_info(&self) -> Result<BlockInfo, BlockError>;
    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError>;
    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError>;
}

/// Sector-granular device view consumed by the filesystem drivers.
/// Implementations add any partition base offset themselves.
pub trait SectorDevice: Send + Sync {
    fn sector_size(&self) -> usize {
        512
    }
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError>;
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError>;
}

// Slot 0 stays empty so that handle 0 can never resolve
static DEVICES: Mutex<Vec<Option<Arc<dyn BlockOps>>>> = Mutex::new(Vec::new());

/// Register a block device and return its handle.
pub fn register(ops: Arc<dyn BlockOps>) -> Handle {
    let mut devices = DEVICES.lock();
    if devices.is_empty() {
        devices.push(None);
    }
    for (i, slot) in devices.iter_mut().enumerate().skip(1) {
        if slot.is_none() {
            *slot = Some(ops);
            return i as Handle;
        }
    }
    devices.push(Some(ops));
    (devices.len() - 1) as Handle
}

fn get(handle: Handle) -> Result<Arc<dyn BlockOps>, BlockError> {
    let devices = DEVICES.lock();
    devices
        .get(handle as usize)
        .and_then(|slot| slot.clone())
        .ok_or(BlockError::InvalidHandle)
}

/// Query device information.
pub fn get_info(handle: Handle) -> Result<BlockInfo, BlockError> {
    get(handle)?.get_info()
}

fn check_request(info: &BlockInfo, lba: u64, count: u32, buf_len: usize) -> Result<(), BlockError> {
    if info.sector_size == 0 {
        return Err(BlockError::Io);
    }
    let need = count as u64 * info.sector_size as u64;
    if (buf_len as u64) < need {
        return Err(BlockError::BadBuffer);
    }
    if lba >= info.sector_count || lba + count as u64 > info.sector_count {
        return Err(BlockError::OutOfRange);
    }
    Ok(())
}

/// Read `count` sectors starting at `lba`.
pub fn read(handle: Handle, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
    let dev = get(handle)?;
    let info = dev.get_info()?;
    if count == 0 {
        return Ok(());
    }
    check_request(&info, lba, count, buf.len())?;
    dev.read(lba, count, buf)
}

/// Write `count` sectors starting at `lba`. READONLY devices refuse.
pub fn write(handle: Handle, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
    let dev = get(handle)?;
    let info = dev.get_info()?;
    if info.flags.contains(BlockFlags::READONLY) {
        return Err(BlockError::ReadOnly);
    }
    if count == 0 {
        return Ok(());
    }
    check_request(&info, lba, count, buf.len())?;
    dev.write(lba, count, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::memdisk::MemDisk;

    #[test]
    fn test_handle_zero_is_invalid() {
        assert_eq!(get_info(INVALID_HANDLE).unwrap_err(), BlockError::InvalidHandle);
    }

    #[test]
    fn test_bounds_and_buffer_checks() {
        let disk = Arc::new(MemDisk::new(16, 512, "check-disk"));
        let h = register(disk);

        let mut buf = [0u8; 512];
        // short buffer
        assert_eq!(
            read(h, 0, 2, &mut buf).unwrap_err(),
            BlockError::BadBuffer
        );
        // out of range
        assert_eq!(
            read(h, 16, 1, &mut buf).unwrap_err(),
            BlockError::OutOfRange
        );
        assert_eq!(
            read(h, 15, 2, &mut buf).unwrap_err(),
            BlockError::OutOfRange
        );
        // count == 0 is a no-op
        assert!(read(h, 0, 0, &mut buf).is_ok());
        // valid read
        assert!(read(h, 15, 1, &mut buf).is_ok());
    }

    #[test]
    fn test_readonly_write_refused() {
        let disk = Arc::new(MemDisk::new_readonly(8, 512, "ro-disk"));
        let h = register(disk);
        let buf = [0u8; 512];
        assert_eq!(write(h, 0, 1, &buf).unwrap_err(), BlockError::ReadOnly);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let disk = Arc::new(MemDisk::new(8, 512, "rw-disk"));
        let h = register(disk);
        let mut data = [0u8; 512];
        data[0] = 0xAB;
        data[511] = 0xCD;
        write(h, 3, 1, &data).unwrap();
        let mut back = [0u8; 512];
        read(h, 3, 1, &mut back).unwrap();
        assert_eq!(&data[..], &back[..]);
    }
}
