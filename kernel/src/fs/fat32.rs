//! FAT32 Filesystem Driver
//!
//! Full read/write support: BPB validation, 28-bit FAT chains, long
//! filenames (read and write), creation with `~N` alias disambiguation,
//! unlink with LFN tombstoning, mkdir/rmdir and volume formatting.
//!
//! Structure:
//! - Boot sector (sector 0 of the partition) with BPB, FS-info at +1
//! - Reserved sectors, then `num_fats` FAT copies, then the data region
//! - Data clusters numbered from 2; directory entries are 32 bytes

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::{DirEntryInfo, FileInfo, FsError, FsResult};
use crate::block::SectorDevice;

/// FAT entry values
const FAT_FREE: u32 = 0x0000_0000;
const FAT_EOC: u32 = 0x0FFF_FFFF;
const FAT_EOC_MIN: u32 = 0x0FFF_FFF8;
const FAT_MASK: u32 = 0x0FFF_FFFF;

/// Longest name a single LFN stack can carry (20 records x 13 chars)
const MAX_LFN_RECORDS: usize = 20;
const MAX_NAME_LEN: usize = 255;

/// FAT32 Boot Sector / BPB (BIOS Parameter Block)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BootSector {
    jmp_boot: [u8; 3],
    oem_name: [u8; 8],
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    num_fats: u8,
    root_entry_count: u16,
    total_sectors_16: u16,
    media_type: u8,
    fat_size_16: u16,
    sectors_per_track: u16,
    num_heads: u16,
    hidden_sectors: u32,
    total_sectors_32: u32,
    // FAT32 specific
    fat_size_32: u32,
    ext_flags: u16,
    fs_version: u16,
    root_cluster: u32,
    fs_info: u16,
    backup_boot: u16,
    reserved: [u8; 12],
    drive_number: u8,
    reserved1: u8,
    boot_sig: u8,
    volume_id: u32,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

/// Directory entry (32 bytes)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct DirEntry83 {
    name: [u8; 11],
    attr: u8,
    nt_reserved: u8,
    create_time_tenth: u8,
    create_time: u16,
    create_date: u16,
    access_date: u16,
    cluster_hi: u16,
    modify_time: u16,
    modify_date: u16,
    cluster_lo: u16,
    file_size: u32,
}

impl DirEntry83 {
    const ATTR_READ_ONLY: u8 = 0x01;
    const ATTR_VOLUME_ID: u8 = 0x08;
    const ATTR_DIRECTORY: u8 = 0x10;
    const ATTR_ARCHIVE: u8 = 0x20;
    const ATTR_LONG_NAME: u8 = 0x0F;

    fn cluster(&self) -> u32 {
        let hi = self.cluster_hi as u32;
        let lo = self.cluster_lo as u32;
        (hi << 16) | lo
    }

    fn set_cluster(&mut self, cluster: u32) {
        self.cluster_hi = (cluster >> 16) as u16;
        self.cluster_lo = (cluster & 0xFFFF) as u16;
    }

    fn is_directory(&self) -> bool {
        self.attr & Self::ATTR_DIRECTORY != 0
    }

    fn is_volume_label(&self) -> bool {
        self.attr & Self::ATTR_VOLUME_ID != 0 && self.attr & Self::ATTR_LONG_NAME != Self::ATTR_LONG_NAME
    }
}

/// Long File Name entry (attr 0x0F)
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct LfnEntry {
    order: u8,
    name1: [u16; 5],
    attr: u8,
    lfn_type: u8,
    checksum: u8,
    name2: [u16; 6],
    cluster: u16,
    name3: [u16; 2],
}

/// Checksum over the 11-byte short name, stored in every LFN record
fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in short_name.iter() {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

/// Where a directory entry lives on disk
#[derive(Clone, Copy, Debug)]
struct EntryLocation {
    /// Cluster holding the short entry
    cluster: u32,
    /// Byte offset of the short entry inside that cluster
    offset: usize,
    /// Number of LFN records directly preceding it in the same cluster
    lfn_before: usize,
}

/// A decoded directory entry
#[derive(Clone)]
struct RawEntry {
    name: String,
    entry: DirEntry83,
    location: EntryLocation,
}

/// FAT32 filesystem over a partition-relative sector device
pub struct Fat32Fs {
    dev: Arc<dyn SectorDevice>,
    bytes_per_sector: usize,
    sectors_per_cluster: usize,
    reserved_sectors: u64,
    num_fats: u32,
    sectors_per_fat: u64,
    root_cluster: u32,
    first_data_sector: u64,
    total_clusters: u32,
    /// Serializes every mutating operation on this mount
    write_lock: Mutex<()>,
}

impl Fat32Fs {
    /// Mount: read the boot sector, validate the signature at
    /// `bytes_per_sector - 2` and sanity-check the BPB.
    pub fn mount(dev: Arc<dyn SectorDevice>) -> FsResult<Self> {
        let bps = dev.sector_size();
        if !(512..=4096).contains(&bps) || !bps.is_power_of_two() {
            return Err(FsError::BadBpb);
        }

        let mut boot = vec![0u8; bps];
        dev.read_sector(0, &mut boot).map_err(|_| FsError::Io)?;

        if boot[bps - 2] != 0x55 || boot[bps - 1] != 0xAA {
            return Err(FsError::BadSignature);
        }

        let bpb = unsafe { core::ptr::read_unaligned(boot.as_ptr() as *const BootSector) };
        let bytes_per_sector = bpb.bytes_per_sector as usize;
        let sectors_per_cluster = bpb.sectors_per_cluster as usize;
        let reserved = bpb.reserved_sectors as u64;
        let num_fats = bpb.num_fats as u32;
        let fat_size = bpb.fat_size_32 as u64;
        let root_cluster = bpb.root_cluster;
        let total_sectors = if bpb.total_sectors_32 != 0 {
            bpb.total_sectors_32 as u64
        } else {
            bpb.total_sectors_16 as u64
        };

        if bytes_per_sector != bps
            || sectors_per_cluster == 0
            || sectors_per_cluster > 128
            || reserved == 0
            || num_fats == 0
            || fat_size == 0
            || root_cluster < 2
            || bytes_per_sector * sectors_per_cluster > 64 * 1024
        {
            return Err(FsError::BadBpb);
        }

        let first_data_sector = reserved + num_fats as u64 * fat_size;
        let data_sectors = total_sectors.saturating_sub(first_data_sector);
        let total_clusters = (data_sectors / sectors_per_cluster as u64) as u32;

        crate::log!(
            "[FAT32] Mounted: {} B/sector, {} sectors/cluster, root cluster {}",
            bytes_per_sector,
            sectors_per_cluster,
            root_cluster
        );

        Ok(Self {
            dev,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors: reserved,
            num_fats,
            sectors_per_fat: fat_size,
            root_cluster,
            first_data_sector,
            total_clusters,
            write_lock: Mutex::new(()),
        })
    }

    fn cluster_size(&self) -> usize {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.first_data_sector + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    fn read_sector(&self, sector: u64) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.bytes_per_sector];
        self.dev.read_sector(sector, &mut buf).map_err(|_| FsError::Io)?;
        Ok(buf)
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> FsResult<()> {
        self.dev.write_sector(sector, buf).map_err(|_| FsError::Io)
    }

    fn read_cluster(&self, cluster: u32) -> FsResult<Vec<u8>> {
        let base = self.cluster_to_sector(cluster);
        let mut data = vec![0u8; self.cluster_size()];
        for i in 0..self.sectors_per_cluster {
            let off = i * self.bytes_per_sector;
            self.dev
                .read_sector(base + i as u64, &mut data[off..off + self.bytes_per_sector])
                .map_err(|_| FsError::Io)?;
        }
        Ok(data)
    }

    fn write_cluster(&self, cluster: u32, data: &[u8]) -> FsResult<()> {
        let base = self.cluster_to_sector(cluster);
        for i in 0..self.sectors_per_cluster {
            let off = i * self.bytes_per_sector;
            self.dev
                .write_sector(base + i as u64, &data[off..off + self.bytes_per_sector])
                .map_err(|_| FsError::Io)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // FAT access
    // ------------------------------------------------------------------

    /// Read a 32-bit FAT entry, reading two consecutive sectors when the
    /// entry straddles a sector boundary.
    fn fat_entry(&self, cluster: u32) -> FsResult<u32> {
        let fat_offset = cluster as u64 * 4;
        let sector = self.reserved_sectors + fat_offset / self.bytes_per_sector as u64;
        let within = (fat_offset % self.bytes_per_sector as u64) as usize;

        let bytes = if within + 4 <= self.bytes_per_sector {
            let buf = self.read_sector(sector)?;
            [buf[within], buf[within + 1], buf[within + 2], buf[within + 3]]
        } else {
            let first = self.read_sector(sector)?;
            let second = self.read_sector(sector + 1)?;
            let mut joined = [0u8; 4];
            for (i, b) in joined.iter_mut().enumerate() {
                let pos = within + i;
                *b = if pos < self.bytes_per_sector {
                    first[pos]
                } else {
                    second[pos - self.bytes_per_sector]
                };
            }
            joined
        };

        Ok(u32::from_le_bytes(bytes) & FAT_MASK)
    }

    /// Write a FAT entry (top nibble preserved) into every FAT copy.
    fn set_fat_entry(&self, cluster: u32, value: u32) -> FsResult<()> {
        let fat_offset = cluster as u64 * 4;
        let rel_sector = fat_offset / self.bytes_per_sector as u64;
        let within = (fat_offset % self.bytes_per_sector as u64) as usize;

        for copy in 0..self.num_fats as u64 {
            let sector = self.reserved_sectors + copy * self.sectors_per_fat + rel_sector;
            let mut buf = self.read_sector(sector)?;
            let old = u32::from_le_bytes([
                buf[within],
                buf[within + 1],
                buf[within + 2],
                buf[within + 3],
            ]);
            let merged = (old & !FAT_MASK) | (value & FAT_MASK);
            buf[within..within + 4].copy_from_slice(&merged.to_le_bytes());
            self.write_sector(sector, &buf)?;
        }
        Ok(())
    }

    /// Next cluster in a chain; None at end-of-chain or a self-loop.
    fn next_cluster(&self, cluster: u32) -> FsResult<Option<u32>> {
        let entry = self.fat_entry(cluster)?;
        if entry >= FAT_EOC_MIN || entry == cluster || entry < 2 {
            Ok(None)
        } else {
            Ok(Some(entry))
        }
    }

    /// First-fit cluster allocation: scan the FAT from entry 2 for a
    /// zero, mark it end-of-chain.
    fn alloc_cluster(&self) -> FsResult<u32> {
        for cluster in 2..self.total_clusters + 2 {
            if self.fat_entry(cluster)? == FAT_FREE {
                self.set_fat_entry(cluster, FAT_EOC)?;
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Allocate a zeroed cluster.
    fn alloc_cluster_zeroed(&self) -> FsResult<u32> {
        let cluster = self.alloc_cluster()?;
        let zero = vec![0u8; self.cluster_size()];
        if let Err(e) = self.write_cluster(cluster, &zero) {
            let _ = self.set_fat_entry(cluster, FAT_FREE);
            return Err(e);
        }
        Ok(cluster)
    }

    /// Free a whole chain starting at `cluster`.
    fn free_chain(&self, mut cluster: u32) -> FsResult<()> {
        while cluster >= 2 && cluster < FAT_EOC_MIN {
            let next = self.fat_entry(cluster)?;
            self.set_fat_entry(cluster, FAT_FREE)?;
            if next >= FAT_EOC_MIN || next < 2 || next == cluster {
                break;
            }
            cluster = next;
        }
        Ok(())
    }

    /// Collect the cluster chain starting at `start`.
    fn chain(&self, start: u32) -> FsResult<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cur = start;
        loop {
            if cur < 2 {
                break;
            }
            if clusters.contains(&cur) {
                // Self-loop protection
                break;
            }
            clusters.push(cur);
            match self.next_cluster(cur)? {
                Some(next) => cur = next,
                None => break,
            }
        }
        Ok(clusters)
    }

    // ------------------------------------------------------------------
    // Directory reading
    // ------------------------------------------------------------------

    /// Decode every live entry of the directory starting at `dir_cluster`.
    fn read_dir_entries(&self, dir_cluster: u32) -> FsResult<Vec<RawEntry>> {
        let mut out = Vec::new();
        let cluster_size = self.cluster_size();

        for cluster in self.chain(dir_cluster)? {
            let data = self.read_cluster(cluster)?;
            let mut lfn_stack: Vec<LfnEntry> = Vec::new();
            let mut lfn_start_offset = 0usize;

            let mut offset = 0;
            while offset + 32 <= cluster_size {
                let first = data[offset];
                if first == 0x00 {
                    // End of directory
                    return Ok(out);
                }
                if first == 0xE5 {
                    lfn_stack.clear();
                    offset += 32;
                    continue;
                }

                let attr = data[offset + 11];
                if attr & DirEntry83::ATTR_LONG_NAME == DirEntry83::ATTR_LONG_NAME {
                    let lfn = unsafe {
                        core::ptr::read_unaligned(data[offset..].as_ptr() as *const LfnEntry)
                    };
                    if lfn_stack.is_empty() {
                        lfn_start_offset = offset;
                    }
                    if lfn_stack.len() < MAX_LFN_RECORDS {
                        lfn_stack.push(lfn);
                    }
                    offset += 32;
                    continue;
                }

                let entry = unsafe {
                    core::ptr::read_unaligned(data[offset..].as_ptr() as *const DirEntry83)
                };
                if entry.is_volume_label() {
                    lfn_stack.clear();
                    offset += 32;
                    continue;
                }

                let lfn_before = if lfn_stack.is_empty() {
                    0
                } else {
                    (offset - lfn_start_offset) / 32
                };
                let short_name = entry.name;
                let name = if lfn_stack.is_empty() {
                    short_name_to_string(&short_name)
                } else {
                    assemble_lfn(&lfn_stack)
                };
                lfn_stack.clear();

                out.push(RawEntry {
                    name,
                    entry,
                    location: EntryLocation {
                        cluster,
                        offset,
                        lfn_before,
                    },
                });
                offset += 32;
            }
        }
        Ok(out)
    }

    fn find_in_dir(&self, dir_cluster: u32, name: &str) -> FsResult<Option<RawEntry>> {
        let entries = self.read_dir_entries(dir_cluster)?;
        Ok(entries
            .into_iter()
            .find(|e| e.name.eq_ignore_ascii_case(name)))
    }

    /// Walk a normalized absolute path to its directory cluster + entry.
    /// Returns (parent_cluster, entry); the root has no entry.
    fn resolve(&self, path: &str) -> FsResult<(u32, Option<RawEntry>)> {
        let mut dir = self.root_cluster;
        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if components.is_empty() {
            return Ok((dir, None));
        }

        for (i, comp) in components.iter().enumerate() {
            let found = self.find_in_dir(dir, comp)?.ok_or(FsError::NotFound)?;
            if i + 1 == components.len() {
                return Ok((dir, Some(found)));
            }
            if !found.entry.is_directory() {
                return Err(FsError::NotADirectory);
            }
            dir = found.entry.cluster();
            if dir < 2 {
                dir = self.root_cluster;
            }
        }
        unreachable!()
    }

    // ------------------------------------------------------------------
    // Public read interface
    // ------------------------------------------------------------------

    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let (_, entry) = self.resolve(path)?;
        match entry {
            None => Ok(FileInfo {
                name: String::from("/"),
                size: 0,
                is_directory: true,
            }),
            Some(e) => Ok(FileInfo {
                name: e.name,
                size: e.entry.file_size as u64,
                is_directory: e.entry.is_directory(),
            }),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    pub fn directory_exists(&self, path: &str) -> bool {
        matches!(self.stat(path), Ok(info) if info.is_directory)
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let (_, entry) = self.resolve(path)?;
        let entry = entry.ok_or(FsError::IsADirectory)?;
        if entry.entry.is_directory() {
            return Err(FsError::IsADirectory);
        }

        let size = entry.entry.file_size as usize;
        let mut data = Vec::with_capacity(size);
        let start = entry.entry.cluster();
        if size == 0 || start < 2 {
            return Ok(data);
        }

        for cluster in self.chain(start)? {
            if data.len() >= size {
                break;
            }
            let chunk = self.read_cluster(cluster)?;
            let take = (size - data.len()).min(chunk.len());
            data.extend_from_slice(&chunk[..take]);
        }
        Ok(data)
    }

    /// List a directory.
    pub fn list_dir(&self, path: &str) -> FsResult<Vec<DirEntryInfo>> {
        let (_, entry) = self.resolve(path)?;
        let cluster = match entry {
            None => self.root_cluster,
            Some(e) => {
                if !e.entry.is_directory() {
                    return Err(FsError::NotADirectory);
                }
                let c = e.entry.cluster();
                if c < 2 {
                    self.root_cluster
                } else {
                    c
                }
            }
        };

        Ok(self
            .read_dir_entries(cluster)?
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(|e| DirEntryInfo {
                name: e.name,
                size: e.entry.file_size as u64,
                is_directory: e.entry.is_directory(),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Generate a free 8.3 alias for `long_name` inside a directory:
    /// upper-case base truncated to 6 + `~N`, extension kept.
    fn generate_alias(&self, dir_cluster: u32, long_name: &str) -> FsResult<[u8; 11]> {
        let existing: Vec<[u8; 11]> = self
            .read_dir_entries(dir_cluster)?
            .iter()
            .map(|e| e.entry.name)
            .collect();

        let (base, ext) = split_basename_ext(long_name);
        let clean_base = sanitize_83(&base, 8);
        let clean_ext = sanitize_83(&ext, 3);

        // Try the plain 8.3 form first if it fits losslessly
        if fits_83(long_name) {
            let alias = pack_83(&clean_base, &clean_ext);
            if !existing.contains(&alias) {
                return Ok(alias);
            }
        }

        for n in 1..1_000_000u32 {
            let tail = {
                let mut t = String::from("~");
                t.push_str(&n.to_string());
                t
            };
            let keep = 8usize.saturating_sub(tail.len());
            let mut base_n = String::new();
            for c in clean_base.chars().take(keep) {
                base_n.push(c);
            }
            base_n.push_str(&tail);
            let alias = pack_83(&base_n, &clean_ext);
            if !existing.contains(&alias) {
                return Ok(alias);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Find a run of `slots` consecutive free entries in a directory,
    /// extending it with a fresh cluster if needed.
    /// Returns (cluster, byte offset of the first slot).
    fn find_free_slots(&self, dir_cluster: u32, slots: usize) -> FsResult<(u32, usize)> {
        let cluster_size = self.cluster_size();
        // Entry sets do not span clusters here; a name too long for one
        // cluster of this volume cannot be stored
        if slots > cluster_size / 32 {
            return Err(FsError::PathTooLong);
        }
        let chain = self.chain(dir_cluster)?;

        for &cluster in &chain {
            let data = self.read_cluster(cluster)?;
            let mut run_start = None;
            let mut run_len = 0;

            let mut offset = 0;
            while offset + 32 <= cluster_size {
                let first = data[offset];
                if first == 0x00 || first == 0xE5 {
                    if run_start.is_none() {
                        run_start = Some(offset);
                    }
                    run_len += 1;
                    if run_len >= slots {
                        return Ok((cluster, run_start.unwrap()));
                    }
                    // 0x00 means everything after is free too
                    if first == 0x00 {
                        let remaining = (cluster_size - offset) / 32;
                        if run_len + remaining - 1 >= slots {
                            return Ok((cluster, run_start.unwrap()));
                        }
                    }
                } else {
                    run_start = None;
                    run_len = 0;
                }
                offset += 32;
            }
        }

        // No room: grow the directory by one cluster
        let last = *chain.last().ok_or(FsError::Corrupt)?;
        let new_cluster = self.alloc_cluster_zeroed()?;
        if let Err(e) = self.set_fat_entry(last, new_cluster) {
            let _ = self.set_fat_entry(new_cluster, FAT_FREE);
            return Err(e);
        }
        Ok((new_cluster, 0))
    }

    /// Publish a directory entry: LFN records in descending order (top
    /// record carries 0x40 | ord), then the short entry.
    fn write_dir_entry(
        &self,
        dir_cluster: u32,
        long_name: &str,
        entry: &DirEntry83,
    ) -> FsResult<()> {
        // LFN records hold 13 UTF-16 units each
        let utf16: Vec<u16> = long_name.encode_utf16().collect();
        let lfn_records = utf16.len().div_ceil(13);
        if lfn_records > MAX_LFN_RECORDS {
            return Err(FsError::PathTooLong);
        }
        let slots = lfn_records + 1;

        let (cluster, start) = self.find_free_slots(dir_cluster, slots)?;
        let mut data = self.read_cluster(cluster)?;

        let short_name = entry.name;
        let checksum = lfn_checksum(&short_name);

        for i in 0..lfn_records {
            let ord = lfn_records - i; // descending
            let mut lfn = LfnEntry {
                order: ord as u8 | if i == 0 { 0x40 } else { 0 },
                name1: [0xFFFF; 5],
                attr: DirEntry83::ATTR_LONG_NAME,
                lfn_type: 0,
                checksum,
                name2: [0xFFFF; 6],
                cluster: 0,
                name3: [0xFFFF; 2],
            };

            let base = (ord - 1) * 13;
            let mut chars = [0xFFFFu16; 13];
            let mut terminated = false;
            for (j, slot) in chars.iter_mut().enumerate() {
                let idx = base + j;
                if idx < utf16.len() {
                    *slot = utf16[idx];
                } else if !terminated {
                    *slot = 0x0000;
                    terminated = true;
                } else {
                    break;
                }
            }
            // Assign whole arrays; references into a packed struct are
            // not allowed
            lfn.name1 = chars[0..5].try_into().unwrap();
            lfn.name2 = chars[5..11].try_into().unwrap();
            lfn.name3 = chars[11..13].try_into().unwrap();

            let offset = start + i * 32;
            let bytes = unsafe {
                core::slice::from_raw_parts(&lfn as *const LfnEntry as *const u8, 32)
            };
            data[offset..offset + 32].copy_from_slice(bytes);
        }

        let offset = start + lfn_records * 32;
        let bytes =
            unsafe { core::slice::from_raw_parts(entry as *const DirEntry83 as *const u8, 32) };
        data[offset..offset + 32].copy_from_slice(bytes);

        self.write_cluster(cluster, &data)
    }

    /// Rewrite an existing short entry in place.
    fn update_entry(&self, location: &EntryLocation, entry: &DirEntry83) -> FsResult<()> {
        let mut data = self.read_cluster(location.cluster)?;
        let bytes =
            unsafe { core::slice::from_raw_parts(entry as *const DirEntry83 as *const u8, 32) };
        data[location.offset..location.offset + 32].copy_from_slice(bytes);
        self.write_cluster(location.cluster, &data)
    }

    /// Write a whole file, creating it if needed, truncating otherwise.
    pub fn write_file(&self, path: &str, content: &[u8]) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        let name = super::path::basename(path);
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidPath);
        }
        let parent_path = super::path::parent_of(path);
        let (_, parent_entry) = self.resolve(&parent_path)?;
        let dir_cluster = match parent_entry {
            None => self.root_cluster,
            Some(e) if e.entry.is_directory() => e.entry.cluster().max(2),
            Some(_) => return Err(FsError::NotADirectory),
        };

        let existing = self.find_in_dir(dir_cluster, name)?;
        if let Some(ref e) = existing {
            if e.entry.is_directory() {
                return Err(FsError::IsADirectory);
            }
        }

        // Allocate the new chain first so failure leaves the old file intact
        let cluster_size = self.cluster_size();
        let needed = content.len().div_ceil(cluster_size);
        let mut new_chain: Vec<u32> = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.alloc_cluster() {
                Ok(c) => new_chain.push(c),
                Err(e) => {
                    for &c in &new_chain {
                        let _ = self.set_fat_entry(c, FAT_FREE);
                    }
                    return Err(e);
                }
            }
        }
        for i in 0..new_chain.len() {
            let next = if i + 1 < new_chain.len() {
                new_chain[i + 1]
            } else {
                FAT_EOC
            };
            if let Err(e) = self.set_fat_entry(new_chain[i], next) {
                for &c in &new_chain {
                    let _ = self.set_fat_entry(c, FAT_FREE);
                }
                return Err(e);
            }
        }

        // Data into the new clusters
        for (i, &cluster) in new_chain.iter().enumerate() {
            let mut chunk = vec![0u8; cluster_size];
            let start = i * cluster_size;
            let take = (content.len() - start).min(cluster_size);
            chunk[..take].copy_from_slice(&content[start..start + take]);
            if let Err(e) = self.write_cluster(cluster, &chunk) {
                for &c in &new_chain {
                    let _ = self.set_fat_entry(c, FAT_FREE);
                }
                return Err(e);
            }
        }

        let first_cluster = new_chain.first().copied().unwrap_or(0);

        match existing {
            Some(found) => {
                let old_cluster = found.entry.cluster();
                let mut entry = found.entry;
                entry.file_size = content.len() as u32;
                entry.set_cluster(first_cluster);
                if let Err(e) = self.update_entry(&found.location, &entry) {
                    // Old entry still published; drop the new chain
                    for &c in &new_chain {
                        let _ = self.set_fat_entry(c, FAT_FREE);
                    }
                    return Err(e);
                }
                if old_cluster >= 2 {
                    let _ = self.free_chain(old_cluster);
                }
            }
            None => {
                let alias = self.generate_alias(dir_cluster, name)?;
                let mut entry = DirEntry83 {
                    name: alias,
                    attr: DirEntry83::ATTR_ARCHIVE,
                    nt_reserved: 0,
                    create_time_tenth: 0,
                    create_time: 0,
                    create_date: 0,
                    access_date: 0,
                    cluster_hi: 0,
                    modify_time: 0,
                    modify_date: 0,
                    cluster_lo: 0,
                    file_size: content.len() as u32,
                };
                entry.set_cluster(first_cluster);
                if let Err(e) = self.write_dir_entry(dir_cluster, name, &entry) {
                    // No entry published: release the data clusters again
                    for &c in &new_chain {
                        let _ = self.set_fat_entry(c, FAT_FREE);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Create a directory with `.` and `..` entries.
    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        let name = super::path::basename(path);
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::InvalidPath);
        }
        let parent_path = super::path::parent_of(path);
        let (_, parent_entry) = self.resolve(&parent_path)?;
        let parent_cluster = match parent_entry {
            None => self.root_cluster,
            Some(e) if e.entry.is_directory() => e.entry.cluster().max(2),
            Some(_) => return Err(FsError::NotADirectory),
        };

        if let Some(existing) = self.find_in_dir(parent_cluster, name)? {
            // mkdir over an existing directory is idempotent
            return if existing.entry.is_directory() {
                Ok(())
            } else {
                Err(FsError::NotADirectory)
            };
        }

        let new_cluster = self.alloc_cluster_zeroed()?;

        // `.` and `..` point to self and parent (0 encodes the root)
        let mut data = vec![0u8; self.cluster_size()];
        let mut dot = DirEntry83 {
            name: *b".          ",
            attr: DirEntry83::ATTR_DIRECTORY,
            nt_reserved: 0,
            create_time_tenth: 0,
            create_time: 0,
            create_date: 0,
            access_date: 0,
            cluster_hi: 0,
            modify_time: 0,
            modify_date: 0,
            cluster_lo: 0,
            file_size: 0,
        };
        dot.set_cluster(new_cluster);
        let mut dotdot = dot;
        dotdot.name = *b"..         ";
        let parent_for_entry = if parent_cluster == self.root_cluster {
            0
        } else {
            parent_cluster
        };
        dotdot.set_cluster(parent_for_entry);

        let dot_bytes =
            unsafe { core::slice::from_raw_parts(&dot as *const DirEntry83 as *const u8, 32) };
        let dotdot_bytes =
            unsafe { core::slice::from_raw_parts(&dotdot as *const DirEntry83 as *const u8, 32) };
        data[0..32].copy_from_slice(dot_bytes);
        data[32..64].copy_from_slice(dotdot_bytes);
        if let Err(e) = self.write_cluster(new_cluster, &data) {
            let _ = self.set_fat_entry(new_cluster, FAT_FREE);
            return Err(e);
        }

        let alias = self.generate_alias(parent_cluster, name)?;
        let mut entry = DirEntry83 {
            name: alias,
            attr: DirEntry83::ATTR_DIRECTORY,
            nt_reserved: 0,
            create_time_tenth: 0,
            create_time: 0,
            create_date: 0,
            access_date: 0,
            cluster_hi: 0,
            modify_time: 0,
            modify_date: 0,
            cluster_lo: 0,
            file_size: 0,
        };
        entry.set_cluster(new_cluster);
        if let Err(e) = self.write_dir_entry(parent_cluster, name, &entry) {
            let _ = self.set_fat_entry(new_cluster, FAT_FREE);
            return Err(e);
        }
        Ok(())
    }

    /// Tombstone a directory entry: 0xE5 on the short entry, then walk
    /// backward over the contiguous preceding LFN records.
    fn tombstone(&self, location: &EntryLocation) -> FsResult<()> {
        let mut data = self.read_cluster(location.cluster)?;
        data[location.offset] = 0xE5;
        let mut offset = location.offset;
        for _ in 0..location.lfn_before {
            if offset < 32 {
                break;
            }
            offset -= 32;
            data[offset] = 0xE5;
        }
        self.write_cluster(location.cluster, &data)
    }

    /// Remove a file.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        let (_, entry) = self.resolve(path)?;
        let entry = entry.ok_or(FsError::IsADirectory)?;
        if entry.entry.is_directory() {
            return Err(FsError::IsADirectory);
        }

        self.tombstone(&entry.location)?;
        let cluster = entry.entry.cluster();
        if cluster >= 2 {
            let _ = self.free_chain(cluster);
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let _lock = self.write_lock.lock();

        let (_, entry) = self.resolve(path)?;
        let entry = entry.ok_or(FsError::InvalidPath)?;
        if !entry.entry.is_directory() {
            return Err(FsError::NotADirectory);
        }

        let cluster = entry.entry.cluster();
        if cluster >= 2 {
            let listing = self.read_dir_entries(cluster)?;
            if listing.iter().any(|e| e.name != "." && e.name != "..") {
                return Err(FsError::NotEmpty);
            }
        }

        self.tombstone(&entry.location)?;
        if cluster >= 2 {
            let _ = self.free_chain(cluster);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Name handling helpers
// ----------------------------------------------------------------------

fn short_name_to_string(name: &[u8; 11]) -> String {
    let base: String = name[0..8]
        .iter()
        .take_while(|&&c| c != b' ' && c != 0)
        .map(|&c| if c == 0x05 { 0xE5 as char } else { c as char })
        .collect();
    let ext: String = name[8..11]
        .iter()
        .take_while(|&&c| c != b' ' && c != 0)
        .map(|&c| c as char)
        .collect();

    if ext.is_empty() {
        base
    } else {
        let mut s = base;
        s.push('.');
        s.push_str(&ext);
        s
    }
}

/// Reassemble an LFN stack (records were pushed in on-disk order, which
/// is descending, so walk it in reverse).
fn assemble_lfn(stack: &[LfnEntry]) -> String {
    let mut name = String::new();
    for lfn in stack.iter().rev() {
        let name1 = lfn.name1;
        let name2 = lfn.name2;
        let name3 = lfn.name3;
        for &c in name1.iter().chain(name2.iter()).chain(name3.iter()) {
            if c == 0x0000 || c == 0xFFFF {
                return name;
            }
            name.push(char::from_u32(c as u32).unwrap_or('?'));
        }
    }
    name
}

fn split_basename_ext(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (String::from(&name[..pos]), String::from(&name[pos + 1..])),
        _ => (String::from(name), String::new()),
    }
}

/// Strip a name component down to 8.3-legal upper-case characters.
fn sanitize_83(part: &str, max: usize) -> String {
    let mut out = String::new();
    for c in part.chars() {
        if out.len() >= max {
            break;
        }
        let c = c.to_ascii_uppercase();
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        }
    }
    if out.is_empty() && max == 8 {
        out.push('_');
    }
    out
}

/// Can this name be stored losslessly as a plain 8.3 entry?
fn fits_83(name: &str) -> bool {
    let (base, ext) = split_basename_ext(name);
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return false;
    }
    let ok = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    ok(&base) && ok(&ext) && name.chars().filter(|&c| c == '.').count() <= 1
}

fn pack_83(base: &str, ext: &str) -> [u8; 11] {
    let mut name = [b' '; 11];
    for (i, b) in base.bytes().take(8).enumerate() {
        name[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        name[8 + i] = b.to_ascii_uppercase();
    }
    name
}

// ----------------------------------------------------------------------
// Formatting (mkfs)
// ----------------------------------------------------------------------

/// Pick a cluster size for a volume (sectors), Windows-style defaults.
fn auto_sectors_per_cluster(total_sectors: u64) -> u8 {
    let mib = total_sectors * 512 / (1024 * 1024);
    match mib {
        0..=64 => 1,
        65..=128 => 2,
        129..=256 => 4,
        257..=8192 => 8,
        8193..=16384 => 16,
        16385..=32768 => 32,
        _ => 64,
    }
}

/// Format a partition as FAT32.
///
/// Writes the boot sector (+ backup at 6), the FS-info sector, both FAT
/// copies and an empty root directory at cluster 2.
pub fn format(
    dev: &Arc<dyn SectorDevice>,
    volume_label: Option<&str>,
    sectors_per_cluster: u32,
) -> FsResult<()> {
    let bps = dev.sector_size();
    let total_sectors = dev.sector_count();
    if total_sectors < 1024 {
        return Err(FsError::NoSpace);
    }

    let spc = if sectors_per_cluster == 0 {
        auto_sectors_per_cluster(total_sectors) as u32
    } else {
        sectors_per_cluster
    };
    if !spc.is_power_of_two() || spc > 128 || bps * spc as usize > 64 * 1024 {
        return Err(FsError::BadBpb);
    }

    let reserved: u64 = 32;
    let num_fats: u64 = 2;

    // Iterate once: clusters depend on FAT size and vice versa
    let mut fat_sectors = 1u64;
    for _ in 0..2 {
        let data_sectors = total_sectors - reserved - num_fats * fat_sectors;
        let clusters = data_sectors / spc as u64;
        fat_sectors = ((clusters + 2) * 4).div_ceil(bps as u64);
    }

    let mut boot = vec![0u8; bps];
    let mut label = [b' '; 11];
    for (i, b) in volume_label
        .unwrap_or("NO NAME")
        .bytes()
        .take(11)
        .enumerate()
    {
        label[i] = b.to_ascii_uppercase();
    }

    let bpb = BootSector {
        jmp_boot: [0xEB, 0x58, 0x90],
        oem_name: *b"MODUOS  ",
        bytes_per_sector: bps as u16,
        sectors_per_cluster: spc as u8,
        reserved_sectors: reserved as u16,
        num_fats: num_fats as u8,
        root_entry_count: 0,
        total_sectors_16: 0,
        media_type: 0xF8,
        fat_size_16: 0,
        sectors_per_track: 63,
        num_heads: 255,
        hidden_sectors: 0,
        total_sectors_32: total_sectors as u32,
        fat_size_32: fat_sectors as u32,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: 2,
        fs_info: 1,
        backup_boot: 6,
        reserved: [0; 12],
        drive_number: 0x80,
        reserved1: 0,
        boot_sig: 0x29,
        volume_id: 0x4D44_5336, // "MDS6"
        volume_label: label,
        fs_type: *b"FAT32   ",
    };
    let bpb_bytes = unsafe {
        core::slice::from_raw_parts(
            &bpb as *const BootSector as *const u8,
            core::mem::size_of::<BootSector>(),
        )
    };
    boot[..bpb_bytes.len()].copy_from_slice(bpb_bytes);
    boot[510] = 0x55;
    boot[511] = 0xAA;
    boot[bps - 2] = 0x55;
    boot[bps - 1] = 0xAA;

    dev.write_sector(0, &boot).map_err(|_| FsError::Io)?;
    dev.write_sector(6, &boot).map_err(|_| FsError::Io)?;

    // FS-info sector
    let mut fsinfo = vec![0u8; bps];
    fsinfo[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    fsinfo[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    fsinfo[488..492].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // free count unknown
    fsinfo[492..496].copy_from_slice(&3u32.to_le_bytes()); // next free hint
    fsinfo[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    dev.write_sector(1, &fsinfo).map_err(|_| FsError::Io)?;

    // Zero both FATs, then seed the reserved entries + root EOC
    let zero = vec![0u8; bps];
    for copy in 0..num_fats {
        let base = reserved + copy * fat_sectors;
        for s in 0..fat_sectors {
            dev.write_sector(base + s, &zero).map_err(|_| FsError::Io)?;
        }
        let mut first = vec![0u8; bps];
        first[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        first[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        first[8..12].copy_from_slice(&FAT_EOC.to_le_bytes()); // root dir
        dev.write_sector(base, &first).map_err(|_| FsError::Io)?;
    }

    // Empty root directory (cluster 2)
    let first_data = reserved + num_fats * fat_sectors;
    for s in 0..spc as u64 {
        dev.write_sector(first_data + s, &zero)
            .map_err(|_| FsError::Io)?;
    }

    crate::log!(
        "[FAT32] Formatted: {} sectors, {} sectors/cluster, FAT {} sectors x{}",
        total_sectors,
        spc,
        fat_sectors,
        num_fats
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::memdisk::MemDisk;

    fn fresh_fs(sectors: u64) -> Fat32Fs {
        let dev: Arc<dyn SectorDevice> = Arc::new(MemDisk::new(sectors, 512, "fat-test"));
        format(&dev, Some("TESTVOL"), 1).unwrap();
        Fat32Fs::mount(dev).unwrap()
    }

    #[test]
    fn test_format_then_mount() {
        let fs = fresh_fs(16384);
        assert_eq!(fs.root_cluster, 2);
        assert!(fs.list_dir("/").unwrap().is_empty());
    }

    #[test]
    fn test_mount_rejects_bad_signature() {
        let dev: Arc<dyn SectorDevice> = Arc::new(MemDisk::new(2048, 512, "blank"));
        assert_eq!(Fat32Fs::mount(dev).unwrap_err(), FsError::BadSignature);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let fs = fresh_fs(16384);
        fs.write_file("/hello.txt", b"hello fat32\n").unwrap();
        assert_eq!(fs.read_file("/hello.txt").unwrap(), b"hello fat32\n");

        let info = fs.stat("/hello.txt").unwrap();
        assert_eq!(info.size, 12);
        assert!(!info.is_directory);
    }

    #[test]
    fn test_lfn_roundtrip_with_spaces() {
        let fs = fresh_fs(16384);
        fs.write_file("/hello world with spaces.txt", b"hi\n").unwrap();

        let listing = fs.list_dir("/").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "hello world with spaces.txt");
        assert_eq!(listing[0].size, 3);

        assert_eq!(fs.read_file("/hello world with spaces.txt").unwrap(), b"hi\n");
    }

    #[test]
    fn test_lfn_roundtrip_long_ascii_names() {
        // 4 KiB clusters so even 20-record LFN sets fit in one cluster
        let dev: Arc<dyn SectorDevice> = Arc::new(MemDisk::new(16384, 512, "lfn-test"));
        format(&dev, Some("LFNVOL"), 8).unwrap();
        let fs = Fat32Fs::mount(dev).unwrap();
        for len in [1usize, 13, 14, 26, 100, 200, 255] {
            let name: String = core::iter::repeat('a').take(len).collect();
            let path = {
                let mut p = String::from("/");
                p.push_str(&name);
                p
            };
            fs.write_file(&path, b"x").unwrap();
            let listing = fs.list_dir("/").unwrap();
            assert!(
                listing.iter().filter(|e| e.name == name).count() == 1,
                "name of length {} did not round-trip",
                len
            );
            fs.unlink(&path).unwrap();
        }
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let fs = fresh_fs(16384);
        fs.write_file("/MixedCase.TXT", b"data").unwrap();
        assert!(fs.exists("/mixedcase.txt"));
        assert!(fs.exists("/MIXEDCASE.TXT"));
    }

    #[test]
    fn test_overwrite_keeps_single_listing_entry() {
        let fs = fresh_fs(16384);
        fs.write_file("/file.bin", &[1u8; 700]).unwrap();
        fs.write_file("/file.bin", &[2u8; 100]).unwrap();

        let listing = fs.list_dir("/").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].size, 100);
        assert_eq!(fs.read_file("/file.bin").unwrap(), vec![2u8; 100]);
    }

    #[test]
    fn test_multi_cluster_file() {
        let fs = fresh_fs(16384);
        // 3 clusters of 512 bytes, plus a tail
        let data: Vec<u8> = (0..1600u32).map(|i| (i % 251) as u8).collect();
        fs.write_file("/big.dat", &data).unwrap();
        assert_eq!(fs.read_file("/big.dat").unwrap(), data);
    }

    #[test]
    fn test_mkdir_and_nested_files() {
        let fs = fresh_fs(16384);
        fs.mkdir("/ModuOS").unwrap();
        fs.mkdir("/ModuOS/System64").unwrap();
        fs.write_file("/ModuOS/System64/mdsys.sqr", b"marker").unwrap();

        assert!(fs.exists("/ModuOS/System64/mdsys.sqr"));
        assert!(fs.directory_exists("/ModuOS"));
        assert!(fs.directory_exists("/ModuOS/System64"));

        let listing = fs.list_dir("/ModuOS/System64").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "mdsys.sqr");
    }

    #[test]
    fn test_mkdir_idempotent_and_file_collision() {
        let fs = fresh_fs(16384);
        fs.mkdir("/dir").unwrap();
        assert!(fs.mkdir("/dir").is_ok());

        fs.write_file("/afile", b"x").unwrap();
        assert_eq!(fs.mkdir("/afile").unwrap_err(), FsError::NotADirectory);
    }

    #[test]
    fn test_unlink_removes_entry_and_lfn() {
        let fs = fresh_fs(16384);
        fs.write_file("/a long deleted name.txt", b"gone").unwrap();
        fs.write_file("/keeper.txt", b"stay").unwrap();

        fs.unlink("/a long deleted name.txt").unwrap();
        let listing = fs.list_dir("/").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "keeper.txt");

        assert_eq!(
            fs.read_file("/a long deleted name.txt").unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn test_rmdir_refuses_nonempty() {
        let fs = fresh_fs(16384);
        fs.mkdir("/d").unwrap();
        fs.write_file("/d/x", b"1").unwrap();
        assert_eq!(fs.rmdir("/d").unwrap_err(), FsError::NotEmpty);
        fs.unlink("/d/x").unwrap();
        fs.rmdir("/d").unwrap();
        assert_eq!(fs.stat("/d").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn test_alias_disambiguation() {
        let fs = fresh_fs(16384);
        // Same 8.3 prefix, different long names
        fs.write_file("/longfilename one.txt", b"1").unwrap();
        fs.write_file("/longfilename two.txt", b"2").unwrap();
        fs.write_file("/longfilename three.txt", b"3").unwrap();

        let listing = fs.list_dir("/").unwrap();
        assert_eq!(listing.len(), 3);
        assert_eq!(fs.read_file("/longfilename two.txt").unwrap(), b"2");
    }

    #[test]
    fn test_lfn_checksum_known_value() {
        // Checksum algorithm cross-checked against the reference
        // implementation in the FAT specification
        let name = *b"FILENAMETXT";
        let mut sum: u16 = 0;
        for &b in name.iter() {
            sum = (((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b as u16)) & 0xFF;
        }
        assert_eq!(lfn_checksum(&name) as u16, sum);
    }

    #[test]
    fn test_dir_grows_past_one_cluster() {
        let fs = fresh_fs(16384);
        // 512-byte clusters hold 16 entries; force directory expansion
        for i in 0..40 {
            let mut path = String::from("/f");
            path.push_str(&i.to_string());
            fs.write_file(&path, b"x").unwrap();
        }
        assert_eq!(fs.list_dir("/").unwrap().len(), 40);
    }
}
