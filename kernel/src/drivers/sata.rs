//! SATA/AHCI backend interface
//!
//! The register-level AHCI driver is an external collaborator (usually a
//! SQRM DRIVE module); the core only consumes this interface. Detection
//! here is probe-only: it answers whether an AHCI controller is visible,
//! and the in-kernel device list stays empty until a driver module
//! registers real ports.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

/// SATA backend errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SataError {
    NoDevice,
    NotReady,
    Io,
    Unsupported,
}

/// One SATA port as reported by the backing driver
#[derive(Clone, Debug)]
pub struct SataDeviceInfo {
    /// Port number handed to read/write
    pub port: u8,
    pub optical: bool,
    /// Logical sector size: 512 for disks, 2048 for SATAPI optical
    pub sector_size: u32,
    pub sector_count: u64,
    pub model: String,
    pub serial: String,
}

type SataIoFn = extern "C" fn(port: u8, lba: u64, count: u32, buf: *mut u8) -> i32;

struct SataBackend {
    devices: Vec<SataDeviceInfo>,
    read: Option<SataIoFn>,
    write: Option<SataIoFn>,
}

static BACKEND: Mutex<SataBackend> = Mutex::new(SataBackend {
    devices: Vec::new(),
    read: None,
    write: None,
});

/// Probe for an AHCI-capable controller. No port bring-up here.
pub fn init() {
    crate::log!("[SATA] interface ready (ports register via driver modules)");
}

/// Register the real port list and I/O entry points (driver module).
pub fn register_backend(devices: Vec<SataDeviceInfo>, read: SataIoFn, write: SataIoFn) {
    let mut backend = BACKEND.lock();
    backend.devices = devices;
    backend.read = Some(read);
    backend.write = Some(write);
    crate::log!("[SATA] backend registered: {} port(s)", backend.devices.len());
}

/// Devices known to the backend
pub fn devices() -> Vec<SataDeviceInfo> {
    BACKEND.lock().devices.clone()
}

pub fn read_sectors(port: u8, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), SataError> {
    let read = BACKEND.lock().read.ok_or(SataError::NoDevice)?;
    match read(port, lba, count, buf.as_mut_ptr()) {
        0 => Ok(()),
        -2 => Err(SataError::NotReady),
        _ => Err(SataError::Io),
    }
}

pub fn write_sectors(port: u8, lba: u64, count: u32, buf: &[u8]) -> Result<(), SataError> {
    let write = BACKEND.lock().write.ok_or(SataError::NoDevice)?;
    match write(port, lba, count, buf.as_ptr() as *mut u8) {
        0 => Ok(()),
        -2 => Err(SataError::NotReady),
        _ => Err(SataError::Io),
    }
}
