//! Paging - 4-Level Page Tables for x86_64
//!
//! Walks and builds PML4 -> PDPT -> PD -> PT trees with 4 KiB pages.
//! The kernel owns a single global tree: low RAM is identity-mapped,
//! the heap lives at a fixed high-half window and MMIO goes through a
//! dedicated ioremap window. Page tables themselves are allocated from
//! the frame allocator and are always reachable through the identity map.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::memory::{
    frame, phys_to_virt, FRAME_SIZE, HEAP_SIZE_MAX, HEAP_VIRT_BASE, IDENTITY_MAP_LIMIT,
    IOREMAP_BASE, IOREMAP_SIZE, USER_BASE, USER_TOP,
};

/// Number of entries per page table
pub const ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    /// Page table entry flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE_PAGE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Kernel data: present + writable, not executable
    pub fn kernel_data() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::NO_EXECUTE
    }

    /// Kernel code/data for the identity map (executable; the kernel
    /// image lives inside it)
    pub fn kernel_identity() -> Self {
        Self::PRESENT | Self::WRITABLE
    }

    /// MMIO: present + writable + cache-disable + write-through
    pub fn mmio() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::NO_CACHE | Self::WRITE_THROUGH | Self::NO_EXECUTE
    }

    /// User code: present + user
    pub fn user_code() -> Self {
        Self::PRESENT | Self::USER
    }

    /// User data: present + writable + user, not executable
    pub fn user_data() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER | Self::NO_EXECUTE
    }
}

/// Mapping failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Intermediate table or target frame could not be allocated
    OutOfFrames,
    /// Virtual address already mapped to a different frame
    MapConflict,
    /// Address not mapped
    Unmapped,
    /// Mapping would land inside the kernel heap window
    HeapWindow,
    /// ioremap window exhausted
    NoSpace,
}

/// Page table entry
#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageTableEntry(u64);

impl PageTableEntry {
    /// Physical address mask (bits 12-51)
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    fn set(&mut self, phys: u64, flags: PageFlags) {
        self.0 = (phys & Self::ADDR_MASK) | flags.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn phys_addr(&self) -> u64 {
        self.0 & Self::ADDR_MASK
    }

    fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }
}

/// Page table (512 entries, 4 KiB aligned)
#[repr(C, align(4096))]
struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// View the table at a physical address through the identity map
    unsafe fn from_phys<'a>(phys: u64) -> &'a mut PageTable {
        &mut *(phys_to_virt(phys) as *mut PageTable)
    }
}

/// Physical address of the kernel PML4 (0 until init)
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

/// Serializes table mutation
static PAGING_LOCK: Mutex<()> = Mutex::new(());

/// Next free virtual address in the ioremap window
static IOREMAP_NEXT: AtomicU64 = AtomicU64::new(IOREMAP_BASE);

fn table_indices(virt: u64) -> [usize; 4] {
    [
        ((virt >> 39) & 0x1FF) as usize,
        ((virt >> 30) & 0x1FF) as usize,
        ((virt >> 21) & 0x1FF) as usize,
        ((virt >> 12) & 0x1FF) as usize,
    ]
}

fn flush_tlb(virt: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
}

fn in_heap_window(virt: u64) -> bool {
    virt >= HEAP_VIRT_BASE && virt < HEAP_VIRT_BASE + HEAP_SIZE_MAX as u64
}

/// Map one 4 KiB page, creating intermediate tables on demand.
///
/// If an intermediate allocation fails, tables allocated by this call are
/// freed again before the error is returned.
fn map_page_in(root_phys: u64, virt: u64, phys: u64, flags: PageFlags) -> Result<(), MapError> {
    let _guard = PAGING_LOCK.lock();

    let idx = table_indices(virt);
    let mut allocated: [Option<(u64, usize, u64)>; 3] = [None; 3];
    let mut table_phys = root_phys;

    for level in 0..3 {
        let table = unsafe { PageTable::from_phys(table_phys) };
        let entry = &mut table.entries[idx[level]];
        if !entry.is_present() {
            let new_table = match frame::alloc_frame_zeroed() {
                Ok(f) => f,
                Err(_) => {
                    // Unwind: clear and free every table this call created
                    for alloc in allocated.iter().flatten().rev() {
                        let (parent, slot, child) = *alloc;
                        let parent = unsafe { PageTable::from_phys(parent) };
                        parent.entries[slot].clear();
                        frame::free_frame(child);
                    }
                    return Err(MapError::OutOfFrames);
                }
            };
            // Intermediate entries carry the most permissive flags; the
            // leaf entry enforces the real protection.
            entry.set(
                new_table,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            );
            allocated[level] = Some((table_phys, idx[level], new_table));
        } else if flags.contains(PageFlags::USER) && !entry.flags().contains(PageFlags::USER) {
            let entry_flags = entry.flags() | PageFlags::USER;
            let phys = entry.phys_addr();
            entry.set(phys, entry_flags);
        }
        table_phys = entry.phys_addr();
    }

    let table = unsafe { PageTable::from_phys(table_phys) };
    let entry = &mut table.entries[idx[3]];
    if entry.is_present() {
        if entry.phys_addr() == phys {
            // Same frame: allow a flags refresh
            entry.set(phys, flags);
            flush_tlb(virt);
            return Ok(());
        }
        return Err(MapError::MapConflict);
    }

    entry.set(phys, flags);
    flush_tlb(virt);
    Ok(())
}

/// Map a page in the kernel page tree. Mappings into the heap window are
/// refused; the heap is populated only by `map_heap_window`.
pub fn map_page(virt: u64, phys: u64, flags: PageFlags) -> Result<(), MapError> {
    if in_heap_window(virt) {
        return Err(MapError::HeapWindow);
    }
    map_page_in(kernel_pml4(), virt, phys, flags)
}

/// Remove a mapping and return the frame it pointed to.
pub fn unmap_page(virt: u64) -> Result<u64, MapError> {
    let _guard = PAGING_LOCK.lock();

    let idx = table_indices(virt);
    let mut table_phys = kernel_pml4();
    for level in 0..3 {
        let table = unsafe { PageTable::from_phys(table_phys) };
        let entry = &table.entries[idx[level]];
        if !entry.is_present() {
            return Err(MapError::Unmapped);
        }
        table_phys = entry.phys_addr();
    }

    let table = unsafe { PageTable::from_phys(table_phys) };
    let entry = &mut table.entries[idx[3]];
    if !entry.is_present() {
        return Err(MapError::Unmapped);
    }
    let phys = entry.phys_addr();
    entry.clear();
    flush_tlb(virt);
    Ok(phys)
}

/// Walk the active tree and translate a virtual address.
pub fn virt_to_phys(virt: u64) -> Result<u64, MapError> {
    let idx = table_indices(virt);
    let mut table_phys = kernel_pml4();
    for level in 0..3 {
        let table = unsafe { PageTable::from_phys(table_phys) };
        let entry = &table.entries[idx[level]];
        if !entry.is_present() {
            return Err(MapError::Unmapped);
        }
        if entry.flags().contains(PageFlags::HUGE_PAGE) {
            // 2 MiB / 1 GiB page: add the remaining offset
            let shift = [30u64, 21, 12][level.min(2)];
            let base = entry.phys_addr();
            return Ok(base + (virt & ((1 << shift) - 1)));
        }
        table_phys = entry.phys_addr();
    }

    let table = unsafe { PageTable::from_phys(table_phys) };
    let entry = &table.entries[idx[3]];
    if !entry.is_present() {
        return Err(MapError::Unmapped);
    }
    Ok(entry.phys_addr() + (virt & 0xFFF))
}

fn entry_flags(virt: u64) -> Result<PageFlags, MapError> {
    let idx = table_indices(virt);
    let mut table_phys = kernel_pml4();
    for level in 0..3 {
        let table = unsafe { PageTable::from_phys(table_phys) };
        let entry = &table.entries[idx[level]];
        if !entry.is_present() {
            return Err(MapError::Unmapped);
        }
        table_phys = entry.phys_addr();
    }
    let table = unsafe { PageTable::from_phys(table_phys) };
    let entry = &table.entries[idx[3]];
    if !entry.is_present() {
        return Err(MapError::Unmapped);
    }
    Ok(entry.flags())
}

/// Map a physical MMIO range into the ioremap window with
/// cache-disable + write-through. Returns the virtual address.
pub fn ioremap(phys: u64, size: usize) -> Result<u64, MapError> {
    let page_offset = phys & 0xFFF;
    let base = phys & !0xFFF;
    let pages = ((size as u64 + page_offset + FRAME_SIZE - 1) / FRAME_SIZE).max(1);

    let virt = IOREMAP_NEXT.fetch_add(pages * FRAME_SIZE, Ordering::SeqCst);
    if virt + pages * FRAME_SIZE > IOREMAP_BASE + IOREMAP_SIZE {
        return Err(MapError::NoSpace);
    }

    for i in 0..pages {
        if let Err(e) = map_page_in(
            kernel_pml4(),
            virt + i * FRAME_SIZE,
            base + i * FRAME_SIZE,
            PageFlags::mmio(),
        ) {
            for j in 0..i {
                let _ = unmap_page(virt + j * FRAME_SIZE);
            }
            return Err(e);
        }
    }

    crate::log_debug!(
        "[MMIO] ioremap {:#x} ({} pages) -> {:#x}",
        phys,
        pages,
        virt + page_offset
    );
    Ok(virt + page_offset)
}

/// Physical address of the kernel PML4
pub fn kernel_pml4() -> u64 {
    KERNEL_PML4.load(Ordering::Relaxed)
}

/// Build the kernel page tree: identity map of RAM up to
/// min(512 MiB, top of usable memory), then switch CR3 to it.
pub fn init() {
    let root = frame::alloc_frame_zeroed().expect("no frame for kernel PML4");
    KERNEL_PML4.store(root, Ordering::SeqCst);

    let top = crate::memory::total_physical_memory().min(IDENTITY_MAP_LIMIT);
    let mut addr = 0u64;
    while addr < top {
        map_page_in(root, addr, addr, PageFlags::kernel_identity())
            .expect("identity map failed");
        addr += FRAME_SIZE;
    }

    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    }
    crate::log!(
        "[PAGING] Kernel tree active: identity map to {} MB, PML4 at {:#x}",
        top / 1024 / 1024,
        root
    );
}

/// Map the heap window with freshly allocated frames.
pub(super) fn map_heap_window(size: usize) -> Result<(), MapError> {
    let pages = size as u64 / FRAME_SIZE;
    for i in 0..pages {
        let frame = frame::alloc_frame().map_err(|_| MapError::OutOfFrames)?;
        map_page_in(
            kernel_pml4(),
            HEAP_VIRT_BASE + i * FRAME_SIZE,
            frame,
            PageFlags::kernel_data(),
        )?;
    }
    Ok(())
}

/// Is this address inside the userland window?
pub fn is_user_address(addr: u64) -> bool {
    (USER_BASE..USER_TOP).contains(&addr)
}

/// Validate a user pointer range before the kernel touches it: every page
/// must be mapped with the USER bit (and WRITABLE if `write`).
/// Returns false (callers turn that into EFAULT) instead of faulting.
pub fn validate_user_ptr(addr: u64, len: usize, write: bool) -> bool {
    if len == 0 {
        return true;
    }
    let end = match addr.checked_add(len as u64) {
        Some(e) => e,
        None => return false,
    };
    if !is_user_address(addr) || !is_user_address(end - 1) {
        return false;
    }

    let mut page = addr & !0xFFF;
    while page < end {
        match entry_flags(page) {
            Ok(flags) => {
                if !flags.contains(PageFlags::USER) {
                    return false;
                }
                if write && !flags.contains(PageFlags::WRITABLE) {
                    return false;
                }
            }
            Err(_) => return false,
        }
        page += FRAME_SIZE;
    }
    true
}

/// Paging self-test: fresh mapping round-trips through virt_to_phys.
pub fn self_test() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    let virt = IOREMAP_BASE + IOREMAP_SIZE - FRAME_SIZE; // scratch page
    match frame::alloc_frame() {
        Ok(phys) => {
            match map_page_in(kernel_pml4(), virt, phys, PageFlags::kernel_data()) {
                Ok(()) => {
                    if virt_to_phys(virt) == Ok(phys) {
                        passed += 1;
                    } else {
                        crate::log_error!("[PAGING-TEST] round-trip mismatch");
                        failed += 1;
                    }
                    let _ = unmap_page(virt);
                }
                Err(e) => {
                    crate::log_error!("[PAGING-TEST] map failed: {:?}", e);
                    failed += 1;
                }
            }
            frame::free_frame(phys);
        }
        Err(_) => failed += 1,
    }

    // Mapping into the heap window must be refused
    if map_page(HEAP_VIRT_BASE, 0x1000, PageFlags::kernel_data()) == Err(MapError::HeapWindow) {
        passed += 1;
    } else {
        crate::log_error!("[PAGING-TEST] heap window not protected");
        failed += 1;
    }

    (passed, failed)
}
