//! ATA/IDE backend (PIO)
//!
//! Legacy IDE storage access over the primary and secondary channels.
//! PIO only; this is the narrow read/write/identify surface the vDrive
//! layer consumes.

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// IDE channels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Primary,
    Secondary,
}

impl Channel {
    fn base(self) -> u16 {
        match self {
            Channel::Primary => 0x1F0,
            Channel::Secondary => 0x170,
        }
    }
}

/// Drive position on a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    Master,
    Slave,
}

/// ATA commands
mod cmd {
    pub const IDENTIFY: u8 = 0xEC;
    pub const IDENTIFY_PACKET: u8 = 0xA1;
    pub const READ_SECTORS: u8 = 0x20;
    pub const WRITE_SECTORS: u8 = 0x30;
    pub const CACHE_FLUSH: u8 = 0xE7;
}

/// Status register bits
mod status {
    pub const ERR: u8 = 1 << 0;
    pub const DRQ: u8 = 1 << 3;
    pub const DF: u8 = 1 << 5;
    pub const BSY: u8 = 1 << 7;
}

/// ATA backend errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtaError {
    NoDevice,
    Timeout,
    DriveFault,
    Io,
    /// Device present but not ready for media access (e.g. ATAPI
    /// without a loaded medium)
    NotReady,
    Unsupported,
}

/// One detected IDE drive
#[derive(Clone, Debug)]
pub struct AtaDriveInfo {
    /// Backend id handed to read/write (0..3)
    pub index: u8,
    pub channel: Channel,
    pub position: Position,
    pub atapi: bool,
    pub lba48: bool,
    pub sector_count: u64,
    pub model: String,
    pub serial: String,
}

static DRIVES: Mutex<Vec<AtaDriveInfo>> = Mutex::new(Vec::new());

fn wait_ready(base: u16) -> Result<(), AtaError> {
    let mut status_port = Port::<u8>::new(base + 7);
    for _ in 0..100_000 {
        let status = unsafe { status_port.read() };
        if status == 0xFF {
            return Err(AtaError::NoDevice);
        }
        if status & status::BSY == 0 {
            if status & status::ERR != 0 {
                return Err(AtaError::Io);
            }
            if status & status::DF != 0 {
                return Err(AtaError::DriveFault);
            }
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(AtaError::Timeout)
}

fn wait_drq(base: u16) -> Result<(), AtaError> {
    let mut status_port = Port::<u8>::new(base + 7);
    for _ in 0..100_000 {
        let status = unsafe { status_port.read() };
        if status & status::ERR != 0 {
            return Err(AtaError::Io);
        }
        if status & status::DF != 0 {
            return Err(AtaError::DriveFault);
        }
        if status & status::BSY == 0 && status & status::DRQ != 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(AtaError::Timeout)
}

fn select(base: u16, position: Position, lba: u32) {
    let select_bits: u8 = match position {
        Position::Master => 0xE0,
        Position::Slave => 0xF0,
    };
    unsafe {
        Port::<u8>::new(base + 6).write(select_bits | ((lba >> 24) & 0x0F) as u8);
    }
    // 400ns settle: four status reads
    let mut st = Port::<u8>::new(base + 7);
    for _ in 0..4 {
        let _: u8 = unsafe { st.read() };
    }
}

fn extract_string(identify: &[u16; 256], start: usize, words: usize) -> String {
    let mut s = String::new();
    for i in 0..words {
        let word = identify[start + i];
        s.push((word >> 8) as u8 as char);
        s.push((word & 0xFF) as u8 as char);
    }
    String::from(s.trim())
}

fn identify(channel: Channel, position: Position) -> Option<AtaDriveInfo> {
    let base = channel.base();

    select(base, position, 0);
    unsafe {
        Port::<u8>::new(base + 2).write(0u8);
        Port::<u8>::new(base + 3).write(0u8);
        Port::<u8>::new(base + 4).write(0u8);
        Port::<u8>::new(base + 5).write(0u8);
        Port::<u8>::new(base + 7).write(cmd::IDENTIFY);
    }

    let mut status_port = Port::<u8>::new(base + 7);
    let first: u8 = unsafe { status_port.read() };
    if first == 0 || first == 0xFF {
        return None;
    }

    // ATAPI devices abort IDENTIFY with the 0x14/0xEB signature
    let lba_mid: u8 = unsafe { Port::new(base + 4).read() };
    let lba_hi: u8 = unsafe { Port::new(base + 5).read() };
    let atapi = lba_mid == 0x14 && lba_hi == 0xEB;
    if atapi {
        unsafe {
            Port::<u8>::new(base + 7).write(cmd::IDENTIFY_PACKET);
        }
    }

    if wait_drq(base).is_err() {
        return None;
    }

    let mut data = Port::<u16>::new(base);
    let mut identify = [0u16; 256];
    for word in identify.iter_mut() {
        *word = unsafe { data.read() };
    }

    let lba48 = identify[83] & (1 << 10) != 0;
    let sector_count = if atapi {
        0
    } else if lba48 {
        (identify[100] as u64)
            | ((identify[101] as u64) << 16)
            | ((identify[102] as u64) << 32)
            | ((identify[103] as u64) << 48)
    } else {
        (identify[60] as u64) | ((identify[61] as u64) << 16)
    };

    Some(AtaDriveInfo {
        index: 0,
        channel,
        position,
        atapi,
        lba48,
        sector_count,
        model: extract_string(&identify, 27, 20),
        serial: extract_string(&identify, 10, 10),
    })
}

/// Probe both channels and record what answers.
pub fn init() {
    let mut drives = Vec::new();
    let mut index = 0u8;
    for &channel in &[Channel::Primary, Channel::Secondary] {
        for &position in &[Position::Master, Position::Slave] {
            if let Some(mut info) = identify(channel, position) {
                info.index = index;
                crate::log!(
                    "[ATA] drive {}: {} ({}, {} sectors)",
                    index,
                    info.model,
                    if info.atapi { "ATAPI" } else { "ATA" },
                    info.sector_count
                );
                drives.push(info);
            }
            index += 1;
        }
    }
    if drives.is_empty() {
        crate::log!("[ATA] no drives detected");
    }
    *DRIVES.lock() = drives;
}

/// Detected drives (clone of the registry)
pub fn drives() -> Vec<AtaDriveInfo> {
    DRIVES.lock().clone()
}

fn lookup(index: u8) -> Result<AtaDriveInfo, AtaError> {
    DRIVES
        .lock()
        .iter()
        .find(|d| d.index == index)
        .cloned()
        .ok_or(AtaError::NoDevice)
}

/// Read `count` 512-byte sectors (PIO, LBA28).
pub fn read_sectors(index: u8, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), AtaError> {
    let info = lookup(index)?;
    if info.atapi {
        // Packet-command media access lives in the external optical
        // driver; the core only consumes this interface.
        return Err(AtaError::NotReady);
    }
    if lba + count as u64 > info.sector_count || lba >= (1 << 28) {
        return Err(AtaError::Unsupported);
    }
    if buf.len() < count as usize * 512 {
        return Err(AtaError::Io);
    }

    let base = info.channel.base();
    for sector in 0..count as u64 {
        let cur = (lba + sector) as u32;
        wait_ready(base)?;
        select(base, info.position, cur);
        unsafe {
            Port::<u8>::new(base + 2).write(1u8);
            Port::<u8>::new(base + 3).write(cur as u8);
            Port::<u8>::new(base + 4).write((cur >> 8) as u8);
            Port::<u8>::new(base + 5).write((cur >> 16) as u8);
            Port::<u8>::new(base + 7).write(cmd::READ_SECTORS);
        }
        wait_drq(base)?;

        let mut data = Port::<u16>::new(base);
        let off = sector as usize * 512;
        for i in 0..256 {
            let word: u16 = unsafe { data.read() };
            buf[off + i * 2] = (word & 0xFF) as u8;
            buf[off + i * 2 + 1] = (word >> 8) as u8;
        }
    }
    Ok(())
}

/// Write `count` 512-byte sectors (PIO, LBA28) and flush.
pub fn write_sectors(index: u8, lba: u64, count: u32, buf: &[u8]) -> Result<(), AtaError> {
    let info = lookup(index)?;
    if info.atapi {
        return Err(AtaError::Unsupported);
    }
    if lba + count as u64 > info.sector_count || lba >= (1 << 28) {
        return Err(AtaError::Unsupported);
    }
    if buf.len() < count as usize * 512 {
        return Err(AtaError::Io);
    }

    let base = info.channel.base();
    for sector in 0..count as u64 {
        let cur = (lba + sector) as u32;
        wait_ready(base)?;
        select(base, info.position, cur);
        unsafe {
            Port::<u8>::new(base + 2).write(1u8);
            Port::<u8>::new(base + 3).write(cur as u8);
            Port::<u8>::new(base + 4).write((cur >> 8) as u8);
            Port::<u8>::new(base + 5).write((cur >> 16) as u8);
            Port::<u8>::new(base + 7).write(cmd::WRITE_SECTORS);
        }
        wait_drq(base)?;

        let mut data = Port::<u16>::new(base);
        let off = sector as usize * 512;
        for i in 0..256 {
            let word = (buf[off + i * 2] as u16) | ((buf[off + i * 2 + 1] as u16) << 8);
            unsafe { data.write(word) };
        }

        unsafe {
            Port::<u8>::new(base + 7).write(cmd::CACHE_FLUSH);
        }
        wait_ready(base)?;
    }
    Ok(())
}
