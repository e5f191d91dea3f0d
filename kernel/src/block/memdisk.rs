//! RAM-backed disk
//!
//! A vDrive backend living entirely in memory. Used by the boot-time
//! self tests and the host tests to exercise the partition, FAT32 and
//! MDFS paths without hardware.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::{BlockError, BlockFlags, BlockInfo, BlockOps, SectorDevice};

pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    sector_size: usize,
    sector_count: u64,
    readonly: bool,
    model: String,
}

impl MemDisk {
    pub fn new(sector_count: u64, sector_size: usize, model: &str) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sector_count as usize * sector_size]),
            sector_size,
            sector_count,
            readonly: false,
            model: String::from(model),
        }
    }

    pub fn new_readonly(sector_count: u64, sector_size: usize, model: &str) -> Self {
        let mut disk = Self::new(sector_count, sector_size, model);
        disk.readonly = true;
        disk
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Direct byte patch, for corruption tests
    pub fn patch_byte(&self, offset: usize, f: impl FnOnce(u8) -> u8) {
        let mut data = self.data.lock();
        if offset < data.len() {
            data[offset] = f(data[offset]);
        }
    }
}

impl SectorDevice for MemDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if sector >= self.sector_count || buf.len() < self.sector_size {
            return Err(BlockError::OutOfRange);
        }
        let start = sector as usize * self.sector_size;
        let data = self.data.lock();
        buf[..self.sector_size].copy_from_slice(&data[start..start + self.sector_size]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        if self.readonly {
            return Err(BlockError::ReadOnly);
        }
        if sector >= self.sector_count || buf.len() < self.sector_size {
            return Err(BlockError::OutOfRange);
        }
        let start = sector as usize * self.sector_size;
        let mut data = self.data.lock();
        data[start..start + self.sector_size].copy_from_slice(&buf[..self.sector_size]);
        Ok(())
    }
}

impl BlockOps for MemDisk {
    fn get_info(&self) -> Result<BlockInfo, BlockError> {
        let mut flags = BlockFlags::empty();
        if self.readonly {
            flags |= BlockFlags::READONLY;
        }
        Ok(BlockInfo {
            sector_size: self.sector_size as u32,
            sector_count: self.sector_count,
            flags,
            model: self.model.clone(),
        })
    }

    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        for i in 0..count as u64 {
            let off = i as usize * self.sector_size;
            self.read_sector(lba + i, &mut buf[off..off + self.sector_size])?;
        }
        Ok(())
    }

    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
        for i in 0..count as u64 {
            let off = i as usize * self.sector_size;
            self.write_sector(lba + i, &buf[off..off + self.sector_size])?;
        }
        Ok(())
    }
}
