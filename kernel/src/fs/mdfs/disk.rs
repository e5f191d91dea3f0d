//! MDFS on-disk primitives
//!
//! 4 KiB block I/O over a partition-relative sector device, the 256-byte
//! inode codec and the CRC32 used by superblock and directory entry
//! sets (IEEE 802.3 reflected polynomial, as implemented by crc32fast).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{BLOCK_SIZE, INODE_SIZE, MAX_DIRECT};
use crate::block::SectorDevice;
use crate::fs::{FsError, FsResult};

/// CRC32 over a byte buffer (poly 0xEDB88320, init/final 0xFFFFFFFF)
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Decoded inode (on disk: 256 bytes, little-endian, packed)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Inode {
    /// 0x4000 directory, 0x8000 file
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size_bytes: u64,
    pub link_count: u32,
    pub flags: u32,
    pub direct: [u64; MAX_DIRECT],
    /// Reserved for v3
    pub indirect1: u64,
}

pub const MODE_DIR: u16 = 0x4000;
pub const MODE_FILE: u16 = 0x8000;

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & 0xF000 == MODE_DIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & 0xF000 == MODE_FILE
    }

    /// Decode from the first 256 bytes of `raw`
    pub fn decode(raw: &[u8]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[o..o + 8]);
            u64::from_le_bytes(b)
        };

        let mut direct = [0u64; MAX_DIRECT];
        for (i, d) in direct.iter_mut().enumerate() {
            *d = u64_at(28 + i * 8);
        }

        Self {
            mode: u16_at(0),
            uid: u32_at(4),
            gid: u32_at(8),
            size_bytes: u64_at(12),
            link_count: u32_at(20),
            flags: u32_at(24),
            direct,
            indirect1: u64_at(124),
        }
    }

    /// Encode into a 256-byte record
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut raw = [0u8; INODE_SIZE];
        raw[0..2].copy_from_slice(&self.mode.to_le_bytes());
        raw[4..8].copy_from_slice(&self.uid.to_le_bytes());
        raw[8..12].copy_from_slice(&self.gid.to_le_bytes());
        raw[12..20].copy_from_slice(&self.size_bytes.to_le_bytes());
        raw[20..24].copy_from_slice(&self.link_count.to_le_bytes());
        raw[24..28].copy_from_slice(&self.flags.to_le_bytes());
        for (i, d) in self.direct.iter().enumerate() {
            raw[28 + i * 8..36 + i * 8].copy_from_slice(&d.to_le_bytes());
        }
        raw[124..132].copy_from_slice(&self.indirect1.to_le_bytes());
        raw
    }
}

/// Block-granular I/O over the partition
pub struct BlockIo {
    dev: Arc<dyn SectorDevice>,
}

impl BlockIo {
    pub fn new(dev: Arc<dyn SectorDevice>) -> Self {
        Self { dev }
    }

    fn sectors_per_block(&self) -> u64 {
        (BLOCK_SIZE / self.dev.sector_size()) as u64
    }

    /// Blocks the partition can hold
    pub fn block_count(&self) -> u64 {
        self.dev.sector_count() / self.sectors_per_block()
    }

    pub fn read_block(&self, block_no: u64) -> FsResult<Vec<u8>> {
        let spb = self.sectors_per_block();
        let ss = self.dev.sector_size();
        let mut buf = vec![0u8; BLOCK_SIZE];
        for i in 0..spb {
            let off = i as usize * ss;
            self.dev
                .read_sector(block_no * spb + i, &mut buf[off..off + ss])
                .map_err(|_| FsError::Io)?;
        }
        Ok(buf)
    }

    pub fn write_block(&self, block_no: u64, buf: &[u8]) -> FsResult<()> {
        let spb = self.sectors_per_block();
        let ss = self.dev.sector_size();
        for i in 0..spb {
            let off = i as usize * ss;
            self.dev
                .write_sector(block_no * spb + i, &buf[off..off + ss])
                .map_err(|_| FsError::Io)?;
        }
        Ok(())
    }

    /// Read one inode out of the inode table
    pub fn read_inode(&self, inode_table_start: u64, ino: u32) -> FsResult<Inode> {
        if ino == 0 {
            return Err(FsError::InvalidPath);
        }
        let byte_off = ino as u64 * INODE_SIZE as u64;
        let block = inode_table_start + byte_off / BLOCK_SIZE as u64;
        let off = (byte_off % BLOCK_SIZE as u64) as usize;

        let blk = self.read_block(block)?;
        Ok(Inode::decode(&blk[off..off + INODE_SIZE]))
    }

    /// Write one inode (read-modify-write of its table block)
    pub fn write_inode(&self, inode_table_start: u64, ino: u32, inode: &Inode) -> FsResult<()> {
        if ino == 0 {
            return Err(FsError::InvalidPath);
        }
        let byte_off = ino as u64 * INODE_SIZE as u64;
        let block = inode_table_start + byte_off / BLOCK_SIZE as u64;
        let off = (byte_off % BLOCK_SIZE as u64) as usize;

        let mut blk = self.read_block(block)?;
        blk[off..off + INODE_SIZE].copy_from_slice(&inode.encode());
        self.write_block(block, &blk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_vectors() {
        // IEEE 802.3 reference values
        assert_eq!(crc32(b""), 0x0000_0000);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b"The quick brown fox jumps over the lazy dog"), 0x414F_A339);
    }

    #[test]
    fn test_inode_codec_roundtrip() {
        let mut ino = Inode {
            mode: MODE_FILE,
            uid: 7,
            gid: 42,
            size_bytes: 0x1234_5678_9ABC,
            link_count: 2,
            flags: 0xA5,
            direct: [0; MAX_DIRECT],
            indirect1: 99,
        };
        for (i, d) in ino.direct.iter_mut().enumerate() {
            *d = 1000 + i as u64;
        }

        let raw = ino.encode();
        assert_eq!(Inode::decode(&raw), ino);
    }

    #[test]
    fn test_inode_mode_checks() {
        let dir = Inode {
            mode: MODE_DIR,
            ..Default::default()
        };
        let file = Inode {
            mode: MODE_FILE,
            ..Default::default()
        };
        assert!(dir.is_dir() && !dir.is_file());
        assert!(file.is_file() && !file.is_dir());
    }
}
