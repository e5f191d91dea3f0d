//! MDFS v2 - the native ModuOS filesystem
//!
//! On-disk layout (4 KiB blocks from the partition start):
//! block 0 reserved, 1 superblock, 2 backup superblock, 3 block bitmap,
//! 4 inode bitmap, 5..12 inode table (128 inodes of 256 bytes), 13+ data.
//! Root inode is 1 (mode 0x4000) with `direct[0]` pointing at the first
//! directory block. Directories are exFAT-style entry sets with CRC32.

pub mod dir;
pub mod disk;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub use self::dir::MdfsDirent;
use self::dir::{ENTRY_TYPE_DIR, ENTRY_TYPE_FILE};
use self::disk::{crc32, BlockIo, Inode, MODE_DIR, MODE_FILE};
use super::{DirEntryInfo, FileInfo, FsError, FsResult};
use crate::block::SectorDevice;

pub const MAGIC: u32 = 0x5346_444D; // "MDFS" little-endian
pub const VERSION: u32 = 2;
pub const BLOCK_SIZE: usize = 4096;
pub const INODE_SIZE: usize = 256;
pub const MAX_DIRECT: usize = 12;
pub const MAX_NAME: usize = 255;
pub const DIR_REC_SIZE: usize = 32;

/// Fixed v2 layout (block numbers from the partition start)
const SUPERBLOCK_BLOCK: u64 = 1;
const BACKUP_SUPERBLOCK_BLOCK: u64 = 2;
const BLOCK_BITMAP_START: u64 = 3;
const BLOCK_BITMAP_BLOCKS: u64 = 1;
const INODE_BITMAP_START: u64 = 4;
const INODE_BITMAP_BLOCKS: u64 = 1;
const INODE_TABLE_START: u64 = 5;
const INODE_TABLE_BLOCKS: u64 = 8;
const ROOT_INODE: u32 = 1;

/// Parsed superblock
#[derive(Clone, Copy, Debug)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub block_bitmap_start: u64,
    pub block_bitmap_blocks: u64,
    pub inode_bitmap_start: u64,
    pub inode_bitmap_blocks: u64,
    pub inode_table_start: u64,
    pub inode_table_blocks: u64,
    pub root_inode: u64,
    pub uuid: [u8; 16],
    pub features: u32,
    pub checksum: u32,
}

impl Superblock {
    fn decode(raw: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[o..o + 8]);
            u64::from_le_bytes(b)
        };
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[104..120]);

        Self {
            magic: u32_at(0),
            version: u32_at(4),
            block_size: u32_at(8),
            total_blocks: u64_at(16),
            free_blocks: u64_at(24),
            total_inodes: u64_at(32),
            free_inodes: u64_at(40),
            block_bitmap_start: u64_at(48),
            block_bitmap_blocks: u64_at(56),
            inode_bitmap_start: u64_at(64),
            inode_bitmap_blocks: u64_at(72),
            inode_table_start: u64_at(80),
            inode_table_blocks: u64_at(88),
            root_inode: u64_at(96),
            uuid,
            features: u32_at(120),
            checksum: u32_at(124),
        }
    }

    /// Encode into a full block; the stored checksum is CRC32 over the
    /// encoded block with the checksum field zeroed.
    fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; BLOCK_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&self.version.to_le_bytes());
        raw[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        raw[16..24].copy_from_slice(&self.total_blocks.to_le_bytes());
        raw[24..32].copy_from_slice(&self.free_blocks.to_le_bytes());
        raw[32..40].copy_from_slice(&self.total_inodes.to_le_bytes());
        raw[40..48].copy_from_slice(&self.free_inodes.to_le_bytes());
        raw[48..56].copy_from_slice(&self.block_bitmap_start.to_le_bytes());
        raw[56..64].copy_from_slice(&self.block_bitmap_blocks.to_le_bytes());
        raw[64..72].copy_from_slice(&self.inode_bitmap_start.to_le_bytes());
        raw[72..80].copy_from_slice(&self.inode_bitmap_blocks.to_le_bytes());
        raw[80..88].copy_from_slice(&self.inode_table_start.to_le_bytes());
        raw[88..96].copy_from_slice(&self.inode_table_blocks.to_le_bytes());
        raw[96..104].copy_from_slice(&self.root_inode.to_le_bytes());
        raw[104..120].copy_from_slice(&self.uuid);
        raw[120..124].copy_from_slice(&self.features.to_le_bytes());

        let crc = crc32(&raw);
        raw[124..128].copy_from_slice(&crc.to_le_bytes());
        raw
    }
}

/// A mounted MDFS volume
pub struct MdfsFs {
    pub(super) io: BlockIo,
    pub(super) sb: Superblock,
    /// Serializes every mutating operation on this mount
    write_lock: Mutex<()>,
}

impl MdfsFs {
    /// Mount: read the superblock at block 1 and validate it.
    /// A zero stored checksum is tolerated (unchecksummed volume);
    /// version and block size are enforced.
    pub fn mount(dev: Arc<dyn SectorDevice>) -> FsResult<Self> {
        let io = BlockIo::new(dev);
        let raw = io.read_block(SUPERBLOCK_BLOCK)?;
        let sb = Superblock::decode(&raw);

        if sb.magic != MAGIC {
            return Err(FsError::BadSignature);
        }
        if sb.version != VERSION {
            return Err(FsError::NotSupported);
        }
        if sb.block_size != BLOCK_SIZE as u32 {
            return Err(FsError::NotSupported);
        }

        if sb.checksum != 0 {
            let mut check = raw.clone();
            check[124..128].fill(0);
            if crc32(&check) != sb.checksum {
                crate::log_warn!("[MDFS] superblock checksum mismatch");
                return Err(FsError::Corrupt);
            }
        }

        crate::log!(
            "[MDFS] Mounted: {} blocks, {} inodes, root inode {}",
            sb.total_blocks,
            sb.total_inodes,
            sb.root_inode
        );

        Ok(Self {
            io,
            sb,
            write_lock: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // Allocators (single-block bitmaps)
    // ------------------------------------------------------------------

    fn meta_end(&self) -> u64 {
        self.sb.inode_table_start + self.sb.inode_table_blocks
    }

    /// Scan the block bitmap from the end of the metadata forward.
    pub(super) fn alloc_block(&self) -> FsResult<u64> {
        let mut bm = self.io.read_block(self.sb.block_bitmap_start)?;
        let start = self.meta_end().max(1);
        for b in start..self.sb.total_blocks {
            let byte = (b / 8) as usize;
            let bit = 1u8 << (b % 8);
            if bm[byte] & bit == 0 {
                bm[byte] |= bit;
                self.io.write_block(self.sb.block_bitmap_start, &bm)?;
                return Ok(b);
            }
        }
        Err(FsError::NoSpace)
    }

    pub(super) fn free_block(&self, block: u64) -> FsResult<()> {
        if block == 0 {
            return Err(FsError::InvalidPath);
        }
        let mut bm = self.io.read_block(self.sb.block_bitmap_start)?;
        let byte = (block / 8) as usize;
        bm[byte] &= !(1u8 << (block % 8));
        self.io.write_block(self.sb.block_bitmap_start, &bm)
    }

    fn alloc_inode(&self) -> FsResult<u32> {
        let mut bm = self.io.read_block(self.sb.inode_bitmap_start)?;
        for i in 1..self.sb.total_inodes {
            let byte = (i / 8) as usize;
            let bit = 1u8 << (i % 8);
            if bm[byte] & bit == 0 {
                bm[byte] |= bit;
                self.io.write_block(self.sb.inode_bitmap_start, &bm)?;
                return Ok(i as u32);
            }
        }
        Err(FsError::NoSpace)
    }

    fn free_inode(&self, ino: u32) -> FsResult<()> {
        if ino == 0 {
            return Err(FsError::InvalidPath);
        }
        let mut bm = self.io.read_block(self.sb.inode_bitmap_start)?;
        let byte = (ino / 8) as usize;
        bm[byte] &= !(1u8 << (ino % 8));
        self.io.write_block(self.sb.inode_bitmap_start, &bm)
    }

    // ------------------------------------------------------------------
    // Path walking
    // ------------------------------------------------------------------

    fn is_root(path: &str) -> bool {
        path.is_empty() || path == "/"
    }

    /// Walk a normalized absolute path, case-sensitively.
    /// Returns (inode number, entry_type).
    fn lookup_path(&self, path: &str) -> FsResult<(u32, u8)> {
        if Self::is_root(path) {
            return Ok((self.sb.root_inode as u32, ENTRY_TYPE_DIR));
        }

        let mut cur = self.sb.root_inode as u32;
        let mut cur_type = ENTRY_TYPE_DIR;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

        for comp in components {
            if comp.len() > MAX_NAME {
                return Err(FsError::PathTooLong);
            }
            if cur_type != ENTRY_TYPE_DIR {
                return Err(FsError::NotADirectory);
            }
            let (ino, typ) = self.dir_lookup(cur, comp)?;
            cur = ino;
            cur_type = typ;
        }
        Ok((cur, cur_type))
    }

    fn split_parent(path: &str) -> FsResult<(String, &str)> {
        if Self::is_root(path) {
            return Err(FsError::InvalidPath);
        }
        let base = super::path::basename(path);
        if base.is_empty() {
            return Err(FsError::InvalidPath);
        }
        Ok((super::path::parent_of(path), base))
    }

    // ------------------------------------------------------------------
    // Public path API
    // ------------------------------------------------------------------

    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        if Self::is_root(path) {
            return Ok(FileInfo {
                name: String::from("/"),
                size: 0,
                is_directory: true,
            });
        }
        let (ino, typ) = self.lookup_path(path)?;
        let size = if typ == ENTRY_TYPE_DIR {
            0
        } else {
            self.io
                .read_inode(self.sb.inode_table_start, ino)?
                .size_bytes
        };
        Ok(FileInfo {
            name: String::from(super::path::basename(path)),
            size,
            is_directory: typ == ENTRY_TYPE_DIR,
        })
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    pub fn directory_exists(&self, path: &str) -> bool {
        matches!(self.stat(path), Ok(info) if info.is_directory)
    }

    pub fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntryInfo>> {
        let (ino, typ) = self.lookup_path(path)?;
        if typ != ENTRY_TYPE_DIR {
            return Err(FsError::NotADirectory);
        }
        let entries = self.dir_list(ino)?;
        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            let size = if e.entry_type == ENTRY_TYPE_FILE {
                self.io
                    .read_inode(self.sb.inode_table_start, e.inode)
                    .map(|i| i.size_bytes)
                    .unwrap_or(0)
            } else {
                0
            };
            out.push(DirEntryInfo {
                name: e.name,
                size,
                is_directory: e.entry_type == ENTRY_TYPE_DIR,
            });
        }
        Ok(out)
    }

    /// Read a whole file (direct blocks; indirect is reserved for v3).
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let (ino_no, typ) = self.lookup_path(path)?;
        if typ != ENTRY_TYPE_FILE {
            return Err(FsError::IsADirectory);
        }
        let inode = self.io.read_inode(self.sb.inode_table_start, ino_no)?;

        let size = inode.size_bytes as usize;
        let mut data = Vec::with_capacity(size);
        let mut done = 0;
        while done < size {
            let bi = done / BLOCK_SIZE;
            if bi >= MAX_DIRECT {
                break;
            }
            let bno = inode.direct[bi];
            if bno == 0 {
                break;
            }
            let block = self.io.read_block(bno)?;
            let take = (size - done).min(BLOCK_SIZE);
            data.extend_from_slice(&block[..take]);
            done += take;
        }
        Ok(data)
    }

    /// Write a whole file, creating it on demand. Up to 12 direct
    /// blocks; larger files are refused (NoSpace).
    pub fn write_file(&self, path: &str, content: &[u8]) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        if content.len() > MAX_DIRECT * BLOCK_SIZE {
            return Err(FsError::NoSpace);
        }
        let (parent_path, base) = Self::split_parent(path)?;
        let (parent_ino, parent_type) = self.lookup_path(&parent_path)?;
        if parent_type != ENTRY_TYPE_DIR {
            return Err(FsError::NotADirectory);
        }

        let ino_no = match self.dir_lookup(parent_ino, base) {
            Ok((ino, typ)) => {
                if typ != ENTRY_TYPE_FILE {
                    return Err(FsError::IsADirectory);
                }
                ino
            }
            Err(FsError::NotFound) => {
                let ino = self.alloc_inode()?;
                let inode = Inode {
                    mode: MODE_FILE,
                    link_count: 1,
                    ..Default::default()
                };
                if let Err(e) = self
                    .io
                    .write_inode(self.sb.inode_table_start, ino, &inode)
                {
                    let _ = self.free_inode(ino);
                    return Err(e);
                }
                if let Err(e) = self.dir_add(parent_ino, base, ino, ENTRY_TYPE_FILE) {
                    let _ = self.free_inode(ino);
                    return Err(e);
                }
                ino
            }
            Err(e) => return Err(e),
        };

        let mut inode = self.io.read_inode(self.sb.inode_table_start, ino_no)?;

        let mut done = 0;
        while done < content.len() {
            let bi = done / BLOCK_SIZE;
            if inode.direct[bi] == 0 {
                inode.direct[bi] = self.alloc_block()?;
            }
            let bno = inode.direct[bi];
            let mut block = vec![0u8; BLOCK_SIZE];
            let take = (content.len() - done).min(BLOCK_SIZE);
            block[..take].copy_from_slice(&content[done..done + take]);
            self.io.write_block(bno, &block)?;
            done += take;
        }

        // Shrink: free now-unused direct blocks
        let used_blocks = content.len().div_ceil(BLOCK_SIZE);
        for bi in used_blocks..MAX_DIRECT {
            if inode.direct[bi] != 0 {
                let _ = self.free_block(inode.direct[bi]);
                inode.direct[bi] = 0;
            }
        }

        inode.size_bytes = content.len() as u64;
        self.io
            .write_inode(self.sb.inode_table_start, ino_no, &inode)
    }

    /// Create a directory. Creating an existing directory succeeds;
    /// a file in the way is NotADirectory.
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        let (parent_path, base) = Self::split_parent(path)?;
        let (parent_ino, parent_type) = self.lookup_path(&parent_path)?;
        if parent_type != ENTRY_TYPE_DIR {
            return Err(FsError::NotADirectory);
        }

        match self.dir_lookup(parent_ino, base) {
            Ok((_, ENTRY_TYPE_DIR)) => return Ok(()),
            Ok(_) => return Err(FsError::NotADirectory),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let ino = self.alloc_inode()?;
        let block = match self.alloc_block() {
            Ok(b) => b,
            Err(e) => {
                let _ = self.free_inode(ino);
                return Err(e);
            }
        };

        let zero = vec![0u8; BLOCK_SIZE];
        if let Err(e) = self.io.write_block(block, &zero) {
            let _ = self.free_block(block);
            let _ = self.free_inode(ino);
            return Err(e);
        }

        let mut inode = Inode {
            mode: MODE_DIR,
            link_count: 1,
            ..Default::default()
        };
        inode.direct[0] = block;
        if let Err(e) = self.io.write_inode(self.sb.inode_table_start, ino, &inode) {
            let _ = self.free_block(block);
            let _ = self.free_inode(ino);
            return Err(e);
        }

        if let Err(e) = self.dir_add(parent_ino, base, ino, ENTRY_TYPE_DIR) {
            let _ = self.free_block(block);
            let _ = self.free_inode(ino);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a file: delete the entry, free the data blocks, clear and
    /// free the inode.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        let (parent_path, base) = Self::split_parent(path)?;
        let (parent_ino, _) = self.lookup_path(&parent_path)?;
        let (ino, typ) = self.dir_lookup(parent_ino, base)?;
        if typ != ENTRY_TYPE_FILE {
            return Err(FsError::IsADirectory);
        }

        let inode = self.io.read_inode(self.sb.inode_table_start, ino)?;
        self.dir_remove(parent_ino, base)?;

        for bno in inode.direct.iter().filter(|&&b| b != 0) {
            let _ = self.free_block(*bno);
        }
        let _ = self
            .io
            .write_inode(self.sb.inode_table_start, ino, &Inode::default());
        let _ = self.free_inode(ino);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        if Self::is_root(path) {
            return Err(FsError::InvalidPath);
        }
        let (parent_path, base) = Self::split_parent(path)?;
        let (parent_ino, _) = self.lookup_path(&parent_path)?;
        let (ino, typ) = self.dir_lookup(parent_ino, base)?;
        if typ != ENTRY_TYPE_DIR {
            return Err(FsError::NotADirectory);
        }

        if !self.dir_list(ino)?.is_empty() {
            return Err(FsError::NotEmpty);
        }

        let inode = self.io.read_inode(self.sb.inode_table_start, ino)?;
        self.dir_remove(parent_ino, base)?;

        for bno in inode.direct.iter().filter(|&&b| b != 0) {
            let _ = self.free_block(*bno);
        }
        let _ = self
            .io
            .write_inode(self.sb.inode_table_start, ino, &Inode::default());
        let _ = self.free_inode(ino);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// mkfs
// ----------------------------------------------------------------------

/// Minimum partition size in blocks for the fixed v2 layout
const MIN_BLOCKS: u64 = 32;

/// Format a partition as MDFS v2 and seed it with `lost+found/` and
/// `test.txt`, the mkfs smoke-test content.
pub fn mkfs(dev: Arc<dyn SectorDevice>, _label: Option<&str>) -> FsResult<()> {
    let io = BlockIo::new(dev.clone());
    let total_blocks = io.block_count();
    if total_blocks < MIN_BLOCKS {
        return Err(FsError::NoSpace);
    }

    let meta_end = INODE_TABLE_START + INODE_TABLE_BLOCKS;
    let total_inodes = INODE_TABLE_BLOCKS * (BLOCK_SIZE as u64 / INODE_SIZE as u64);
    let root_dir_block = meta_end;

    let mut sb = Superblock {
        magic: MAGIC,
        version: VERSION,
        block_size: BLOCK_SIZE as u32,
        total_blocks,
        free_blocks: total_blocks - meta_end - 1, // root dir block taken
        total_inodes,
        free_inodes: total_inodes - 1, // root inode taken
        block_bitmap_start: BLOCK_BITMAP_START,
        block_bitmap_blocks: BLOCK_BITMAP_BLOCKS,
        inode_bitmap_start: INODE_BITMAP_START,
        inode_bitmap_blocks: INODE_BITMAP_BLOCKS,
        inode_table_start: INODE_TABLE_START,
        inode_table_blocks: INODE_TABLE_BLOCKS,
        root_inode: ROOT_INODE as u64,
        uuid: [0; 16],
        features: 0,
        checksum: 0,
    };

    // Block bitmap: metadata + root directory block used
    let mut bitmap = vec![0u8; BLOCK_SIZE];
    for b in 0..meta_end {
        bitmap[(b / 8) as usize] |= 1 << (b % 8);
    }
    bitmap[(root_dir_block / 8) as usize] |= 1 << (root_dir_block % 8);
    io.write_block(BLOCK_BITMAP_START, &bitmap)?;

    // Inode bitmap: inode 0 reserved, inode 1 = root
    let mut ibitmap = vec![0u8; BLOCK_SIZE];
    ibitmap[0] |= 0b0000_0011;
    io.write_block(INODE_BITMAP_START, &ibitmap)?;

    // Zero the inode table
    let zero = vec![0u8; BLOCK_SIZE];
    for i in 0..INODE_TABLE_BLOCKS {
        io.write_block(INODE_TABLE_START + i, &zero)?;
    }

    // Root inode
    let mut root = Inode {
        mode: MODE_DIR,
        link_count: 1,
        ..Default::default()
    };
    root.direct[0] = root_dir_block;
    io.write_inode(INODE_TABLE_START, ROOT_INODE, &root)?;

    // Empty root directory block
    io.write_block(root_dir_block, &zero)?;

    // Superblock + backup (checksummed over the zeroed field)
    let encoded = sb.encode();
    io.write_block(SUPERBLOCK_BLOCK, &encoded)?;
    io.write_block(BACKUP_SUPERBLOCK_BLOCK, &encoded)?;

    // mkfs smoke-test content: lost+found (dir) and test.txt (file)
    {
        let fs = MdfsFs::mount(dev)?;
        fs.mkdir("/lost+found")?;
        fs.write_file("/test.txt", b"MDFS OK\n")?;

        // Account for the seeded allocations and rewrite the superblock
        sb.free_blocks = sb.free_blocks.saturating_sub(2);
        sb.free_inodes = sb.free_inodes.saturating_sub(2);
        let encoded = sb.encode();
        fs.io.write_block(SUPERBLOCK_BLOCK, &encoded)?;
        fs.io.write_block(BACKUP_SUPERBLOCK_BLOCK, &encoded)?;
    }

    crate::log!("[MDFS] mkfs complete: {} blocks, {} inodes", total_blocks, total_inodes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use crate::block::memdisk::MemDisk;

    fn fresh_fs() -> (Arc<MemDisk>, MdfsFs) {
        // 4 MiB partition: 1024 blocks of 4 KiB
        let disk = Arc::new(MemDisk::new(8192, 512, "mdfs-test"));
        let dev: Arc<dyn SectorDevice> = disk.clone();
        mkfs(dev.clone(), None).unwrap();
        (disk, MdfsFs::mount(dev).unwrap())
    }

    #[test]
    fn test_mkfs_seeds_and_superblock() {
        let (_disk, fs) = fresh_fs();
        assert_eq!(fs.sb.magic, MAGIC);
        assert_eq!(fs.sb.version, VERSION);
        assert_eq!(fs.sb.total_inodes, 128);

        let root = fs.read_dir("/").unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"lost+found"));
        assert!(names.contains(&"test.txt"));
        assert_eq!(fs.read_file("/test.txt").unwrap(), b"MDFS OK\n");
    }

    #[test]
    fn test_mount_rejects_wrong_version() {
        let disk = Arc::new(MemDisk::new(8192, 512, "badver"));
        let dev: Arc<dyn SectorDevice> = disk.clone();
        mkfs(dev.clone(), None).unwrap();

        // version lives at superblock byte offset 4 (block 1)
        disk.patch_byte(BLOCK_SIZE + 4, |_| 3);
        // fix up the checksum so only the version check can fire
        let io = BlockIo::new(dev.clone());
        let mut raw = io.read_block(SUPERBLOCK_BLOCK).unwrap();
        raw[124..128].fill(0);
        let crc = crc32(&raw);
        raw[124..128].copy_from_slice(&crc.to_le_bytes());
        io.write_block(SUPERBLOCK_BLOCK, &raw).unwrap();

        assert_eq!(MdfsFs::mount(dev).unwrap_err(), FsError::NotSupported);
    }

    #[test]
    fn test_mount_tolerates_zero_checksum() {
        let disk = Arc::new(MemDisk::new(8192, 512, "zerocrc"));
        let dev: Arc<dyn SectorDevice> = disk.clone();
        mkfs(dev.clone(), None).unwrap();

        let io = BlockIo::new(dev.clone());
        let mut raw = io.read_block(SUPERBLOCK_BLOCK).unwrap();
        raw[124..128].fill(0);
        io.write_block(SUPERBLOCK_BLOCK, &raw).unwrap();

        assert!(MdfsFs::mount(dev).is_ok());
    }

    #[test]
    fn test_dir_add_lookup_remove_cycle() {
        let (_disk, fs) = fresh_fs();
        let root = fs.sb.root_inode as u32;

        fs.dir_add(root, "alpha", 5, dir::ENTRY_TYPE_FILE).unwrap();
        assert_eq!(fs.dir_lookup(root, "alpha").unwrap(), (5, dir::ENTRY_TYPE_FILE));

        fs.dir_remove(root, "alpha").unwrap();
        assert_eq!(fs.dir_lookup(root, "alpha").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn test_lookup_is_byte_exact() {
        let (_disk, fs) = fresh_fs();
        fs.mkdir("/Case").unwrap();
        assert!(fs.directory_exists("/Case"));
        assert!(!fs.exists("/case"));
    }

    #[test]
    fn test_long_names_span_records() {
        let (_disk, fs) = fresh_fs();
        // 100 bytes -> 1 primary + 4 name records
        let name: String = core::iter::repeat('n').take(100).collect();
        assert_eq!(dir::record_count_for(100), 5);

        let mut path = String::from("/");
        path.push_str(&name);
        fs.write_file(&path, b"long name payload").unwrap();

        let listing = fs.read_dir("/").unwrap();
        assert!(listing.iter().any(|e| e.name == name));
        assert_eq!(fs.read_file(&path).unwrap(), b"long name payload");
    }

    #[test]
    fn test_mkdir_write_unlink_rmdir_cycle() {
        let (_disk, fs) = fresh_fs();

        fs.mkdir("/a").unwrap();
        fs.write_file("/a/x.txt", b"ok\n").unwrap();

        let listing = fs.read_dir("/a").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "x.txt");
        assert_eq!(fs.read_file("/a/x.txt").unwrap(), b"ok\n");

        assert_eq!(fs.rmdir("/a").unwrap_err(), FsError::NotEmpty);
        fs.unlink("/a/x.txt").unwrap();
        fs.rmdir("/a").unwrap();
        assert_eq!(fs.rmdir("/a").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn test_mkdir_idempotence() {
        let (_disk, fs) = fresh_fs();
        fs.mkdir("/d").unwrap();
        assert!(fs.mkdir("/d").is_ok());
        fs.write_file("/f", b"x").unwrap();
        assert_eq!(fs.mkdir("/f").unwrap_err(), FsError::NotADirectory);
    }

    #[test]
    fn test_write_rewrite_shrinks() {
        let (_disk, fs) = fresh_fs();
        let big = vec![7u8; 2 * BLOCK_SIZE + 17];
        fs.write_file("/data", &big).unwrap();
        assert_eq!(fs.read_file("/data").unwrap(), big);

        fs.write_file("/data", b"small").unwrap();
        assert_eq!(fs.read_file("/data").unwrap(), b"small");
        assert_eq!(fs.stat("/data").unwrap().size, 5);
    }

    #[test]
    fn test_write_refuses_beyond_direct_blocks() {
        let (_disk, fs) = fresh_fs();
        let too_big = vec![0u8; MAX_DIRECT * BLOCK_SIZE + 1];
        assert_eq!(fs.write_file("/huge", &too_big).unwrap_err(), FsError::NoSpace);
    }

    #[test]
    fn test_entry_checksum_updates_on_mutation() {
        let (_disk, fs) = fresh_fs();
        let root = fs.sb.root_inode as u32;
        fs.dir_add(root, "check", 9, dir::ENTRY_TYPE_FILE).unwrap();

        // Locate the entry set in the root directory block and verify
        // CRC(set with checksum=0) == stored checksum
        let root_inode = fs.io.read_inode(fs.sb.inode_table_start, root).unwrap();
        let block = fs.io.read_block(root_inode.direct[0]).unwrap();

        let mut off = 0;
        let mut verified = false;
        while off + DIR_REC_SIZE <= BLOCK_SIZE {
            if block[off] == 0 {
                break;
            }
            let count = block[off + 3] as usize;
            let set = &block[off..off + count * DIR_REC_SIZE];
            let stored = u32::from_le_bytes([set[12], set[13], set[14], set[15]]);
            let mut copy = set.to_vec();
            copy[12..16].fill(0);
            assert_eq!(crc32(&copy), stored);
            verified = true;
            off += count * DIR_REC_SIZE;
        }
        assert!(verified);
    }

    #[test]
    fn test_corrupted_name_payload_is_rejected() {
        let (disk, fs) = fresh_fs();
        fs.mkdir("/victim").unwrap();
        let before = fs.read_dir("/").unwrap().len();

        // Flip one bit inside the name payload of the "victim" entry set.
        // Root dir block is the first data block; find the set on disk.
        let root_inode = fs
            .io
            .read_inode(fs.sb.inode_table_start, fs.sb.root_inode as u32)
            .unwrap();
        let dir_block = root_inode.direct[0];
        let block = fs.io.read_block(dir_block).unwrap();

        let mut off = 0;
        let mut victim_name_byte = None;
        while off + DIR_REC_SIZE <= BLOCK_SIZE {
            if block[off] == 0 {
                break;
            }
            let count = block[off + 3] as usize;
            let nl = u16::from_le_bytes([block[off + 8], block[off + 9]]) as usize;
            let name = &block[off + DIR_REC_SIZE + 1..off + DIR_REC_SIZE + 1 + nl.min(31)];
            if name == b"victim" {
                victim_name_byte = Some(off + DIR_REC_SIZE + 1);
                break;
            }
            off += count.max(1) * DIR_REC_SIZE;
        }
        let byte_off = victim_name_byte.expect("victim entry not found on disk");
        disk.patch_byte(dir_block as usize * BLOCK_SIZE + byte_off, |b| b ^ 0x01);

        // The corrupted set fails its checksum: dropped from listings,
        // invisible to lookup
        let after = fs.read_dir("/").unwrap();
        assert_eq!(after.len(), before - 1);
        assert!(!after.iter().any(|e| e.name == "victim"));
        assert_eq!(
            fs.dir_lookup(fs.sb.root_inode as u32, "victim").unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn test_dir_grows_when_block_fills() {
        let (_disk, fs) = fresh_fs();
        // 4096 / 64 bytes per 2-record set = 64 sets per block; overflow it
        fs.mkdir("/many").unwrap();
        let (dir_ino, _) = fs.lookup_path("/many").unwrap();
        for i in 0..70 {
            let mut name = String::from("entry");
            name.push_str(&i.to_string());
            fs.dir_add(dir_ino, &name, 100 + i, dir::ENTRY_TYPE_FILE).unwrap();
        }
        assert_eq!(fs.dir_list(dir_ino).unwrap().len(), 70);

        let inode = fs
            .io
            .read_inode(fs.sb.inode_table_start, dir_ino)
            .unwrap();
        assert!(inode.direct[1] != 0, "directory should have grown a second block");
    }
}
