//! MDFS v2 directory entry sets
//!
//! A directory entry is a contiguous set of 32-byte records: one primary
//! record followed by `record_count - 1` name records carrying 31 bytes
//! of UTF-8 each. The primary's CRC32 covers the whole set with the
//! checksum field zeroed. Deleted sets keep their record_count so
//! scanners can skip them safely.

use alloc::string::String;
use alloc::vec::Vec;

use super::disk::crc32;
use super::{MdfsFs, BLOCK_SIZE, DIR_REC_SIZE, MAX_DIRECT, MAX_NAME};
use crate::fs::{FsError, FsResult};

pub const DIRREC_PRIMARY: u8 = 1;
pub const DIRREC_NAME: u8 = 2;

pub const DIRFLAG_VALID: u8 = 0x01;
pub const DIRFLAG_DELETED: u8 = 0x02;

pub const ENTRY_TYPE_FILE: u8 = 1;
pub const ENTRY_TYPE_DIR: u8 = 2;

/// Bytes of name payload per name record
const NAME_PAYLOAD: usize = 31;

/// A decoded directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MdfsDirent {
    pub inode: u32,
    /// 1 = file, 2 = directory
    pub entry_type: u8,
    pub name: String,
}

/// Records needed for a name of `name_len` bytes (primary + names)
pub fn record_count_for(name_len: usize) -> usize {
    (1 + name_len.div_ceil(NAME_PAYLOAD)).min(255)
}

/// Primary-record field views over a 32-byte slice
fn rec_type(rec: &[u8]) -> u8 {
    rec[0]
}
fn rec_flags(rec: &[u8]) -> u8 {
    rec[1]
}
fn rec_entry_type(rec: &[u8]) -> u8 {
    rec[2]
}
fn rec_count(rec: &[u8]) -> usize {
    rec[3] as usize
}
fn rec_inode(rec: &[u8]) -> u32 {
    u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]])
}
fn rec_name_len(rec: &[u8]) -> usize {
    u16::from_le_bytes([rec[8], rec[9]]) as usize
}
fn rec_checksum(rec: &[u8]) -> u32 {
    u32::from_le_bytes([rec[12], rec[13], rec[14], rec[15]])
}

/// CRC32 over an entry set with its checksum field zeroed
fn entry_set_crc(set: &[u8]) -> u32 {
    let mut copy: Vec<u8> = set.to_vec();
    copy[12..16].fill(0);
    crc32(&copy)
}

/// Extract the name carried by an entry set
fn read_set_name(set: &[u8]) -> String {
    let nl = rec_name_len(set).min(MAX_NAME);
    let count = rec_count(set);
    let mut bytes: Vec<u8> = Vec::with_capacity(nl);
    for ri in 1..count {
        if bytes.len() >= nl {
            break;
        }
        let rec = &set[ri * DIR_REC_SIZE..(ri + 1) * DIR_REC_SIZE];
        if rec_type(rec) != DIRREC_NAME {
            break;
        }
        let take = (nl - bytes.len()).min(NAME_PAYLOAD);
        bytes.extend_from_slice(&rec[1..1 + take]);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Build an entry set in place at `set` (already zeroed, right length)
fn build_entry_set(set: &mut [u8], name: &str, inode: u32, entry_type: u8) {
    let name_bytes = name.as_bytes();
    let count = record_count_for(name_bytes.len());

    set[0] = DIRREC_PRIMARY;
    set[1] = DIRFLAG_VALID;
    set[2] = entry_type;
    set[3] = count as u8;
    set[4..8].copy_from_slice(&inode.to_le_bytes());
    set[8..10].copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());

    let mut pos = 0;
    for ri in 1..count {
        let rec = &mut set[ri * DIR_REC_SIZE..(ri + 1) * DIR_REC_SIZE];
        rec[0] = DIRREC_NAME;
        let take = (name_bytes.len() - pos).min(NAME_PAYLOAD);
        rec[1..1 + take].copy_from_slice(&name_bytes[pos..pos + take]);
        pos += take;
    }

    let crc = entry_set_crc(set);
    set[12..16].copy_from_slice(&crc.to_le_bytes());
}

/// Scan decision for one record position
enum Scan {
    Stop,
    Skip(usize),
    Entry(usize),
}

/// Look at the record at `off`: stop, skip N records, or a valid
/// checksummed entry spanning N records.
fn classify(block: &[u8], off: usize) -> Scan {
    let rec = &block[off..off + DIR_REC_SIZE];
    if rec_type(rec) == 0 {
        return Scan::Stop;
    }

    let adv = if rec_type(rec) == DIRREC_PRIMARY && rec_count(rec) > 0 {
        rec_count(rec)
    } else {
        1
    };

    if rec_type(rec) != DIRREC_PRIMARY
        || rec_flags(rec) & DIRFLAG_VALID == 0
        || rec_flags(rec) & DIRFLAG_DELETED != 0
    {
        return Scan::Skip(adv);
    }

    let set_bytes = rec_count(rec) * DIR_REC_SIZE;
    if off + set_bytes > BLOCK_SIZE {
        return Scan::Stop;
    }

    // Checksum gate: saved == 0 passes for forward compatibility
    let saved = rec_checksum(rec);
    if saved != 0 && saved != entry_set_crc(&block[off..off + set_bytes]) {
        return Scan::Skip(adv);
    }

    Scan::Entry(adv)
}

impl MdfsFs {
    fn dir_inode(&self, dir_ino: u32) -> FsResult<super::disk::Inode> {
        let inode = self.io.read_inode(self.sb.inode_table_start, dir_ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(inode)
    }

    /// List every valid entry of a directory.
    pub fn dir_list(&self, dir_ino: u32) -> FsResult<Vec<MdfsDirent>> {
        let dir = self.dir_inode(dir_ino)?;
        let mut out = Vec::new();

        for di in 0..MAX_DIRECT {
            let bno = dir.direct[di];
            if bno == 0 {
                continue;
            }
            let block = self.io.read_block(bno)?;

            let mut off = 0;
            while off + DIR_REC_SIZE <= BLOCK_SIZE {
                match classify(&block, off) {
                    Scan::Stop => break,
                    Scan::Skip(n) => off += n * DIR_REC_SIZE,
                    Scan::Entry(n) => {
                        let set = &block[off..off + n * DIR_REC_SIZE];
                        out.push(MdfsDirent {
                            inode: rec_inode(set),
                            entry_type: rec_entry_type(set),
                            name: read_set_name(set),
                        });
                        off += n * DIR_REC_SIZE;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Byte-exact lookup of `name`. Returns (inode, entry_type).
    pub fn dir_lookup(&self, dir_ino: u32, name: &str) -> FsResult<(u32, u8)> {
        if name.is_empty() || name.len() > MAX_NAME {
            return Err(FsError::InvalidPath);
        }
        let dir = self.dir_inode(dir_ino)?;

        for di in 0..MAX_DIRECT {
            let bno = dir.direct[di];
            if bno == 0 {
                continue;
            }
            let block = self.io.read_block(bno)?;

            let mut off = 0;
            while off + DIR_REC_SIZE <= BLOCK_SIZE {
                match classify(&block, off) {
                    Scan::Stop => break,
                    Scan::Skip(n) => off += n * DIR_REC_SIZE,
                    Scan::Entry(n) => {
                        let set = &block[off..off + n * DIR_REC_SIZE];
                        if rec_name_len(set) == name.len() && read_set_name(set) == name {
                            return Ok((rec_inode(set), rec_entry_type(set)));
                        }
                        off += n * DIR_REC_SIZE;
                    }
                }
            }
        }
        Err(FsError::NotFound)
    }

    /// Add an entry. Scans the existing direct blocks for a run of free
    /// record slots; when every existing block is full and a direct slot
    /// is still open, a fresh zeroed block is allocated and linked.
    pub fn dir_add(&self, dir_ino: u32, name: &str, inode: u32, entry_type: u8) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME {
            return Err(FsError::InvalidPath);
        }
        let mut dir = self.dir_inode(dir_ino)?;

        let count = record_count_for(name.len());
        let set_bytes = count * DIR_REC_SIZE;

        for di in 0..MAX_DIRECT {
            let bno = dir.direct[di];
            if bno == 0 {
                continue;
            }
            let mut block = self.io.read_block(bno)?;

            let mut off = 0;
            while off + set_bytes <= BLOCK_SIZE {
                // A slot run must be fully free; occupied records advance
                // the scan by their own record_count.
                let rec = &block[off..off + DIR_REC_SIZE];
                if rec_type(rec) != 0 {
                    let adv = if rec_type(rec) == DIRREC_PRIMARY && rec_count(rec) > 0 {
                        rec_count(rec)
                    } else {
                        1
                    };
                    off += adv * DIR_REC_SIZE;
                    continue;
                }

                let fits = block[off..off + set_bytes]
                    .chunks(DIR_REC_SIZE)
                    .all(|r| rec_type(r) == 0);
                if !fits {
                    off += DIR_REC_SIZE;
                    continue;
                }

                block[off..off + set_bytes].fill(0);
                build_entry_set(&mut block[off..off + set_bytes], name, inode, entry_type);
                return self.io.write_block(bno, &block);
            }
        }

        // All existing blocks are full: take the first unused direct slot
        let slot = dir
            .direct
            .iter()
            .position(|&b| b == 0)
            .ok_or(FsError::NoSpace)?;

        let new_block = self.alloc_block()?;
        let mut block = alloc::vec![0u8; BLOCK_SIZE];
        build_entry_set(&mut block[0..set_bytes], name, inode, entry_type);
        if let Err(e) = self.io.write_block(new_block, &block) {
            let _ = self.free_block(new_block);
            return Err(e);
        }

        dir.direct[slot] = new_block;
        if let Err(e) = self
            .io
            .write_inode(self.sb.inode_table_start, dir_ino, &dir)
        {
            let _ = self.free_block(new_block);
            return Err(e);
        }
        Ok(())
    }

    /// Mark an entry deleted: set the DELETED flag and recompute the
    /// checksum, preserving record_count for safe scanning.
    pub fn dir_remove(&self, dir_ino: u32, name: &str) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME {
            return Err(FsError::InvalidPath);
        }
        let dir = self.dir_inode(dir_ino)?;

        for di in 0..MAX_DIRECT {
            let bno = dir.direct[di];
            if bno == 0 {
                continue;
            }
            let mut block = self.io.read_block(bno)?;

            let mut off = 0;
            while off + DIR_REC_SIZE <= BLOCK_SIZE {
                match classify(&block, off) {
                    Scan::Stop => break,
                    Scan::Skip(n) => off += n * DIR_REC_SIZE,
                    Scan::Entry(n) => {
                        let set_bytes = n * DIR_REC_SIZE;
                        let matches = {
                            let set = &block[off..off + set_bytes];
                            rec_name_len(set) == name.len() && read_set_name(set) == name
                        };
                        if matches {
                            let set = &mut block[off..off + set_bytes];
                            set[1] |= DIRFLAG_DELETED;
                            let crc = entry_set_crc(set);
                            set[12..16].copy_from_slice(&crc.to_le_bytes());
                            return self.io.write_block(bno, &block);
                        }
                        off += set_bytes;
                    }
                }
            }
        }
        Err(FsError::NotFound)
    }
}
