//! Memory Management Subsystem
//!
//! Physical frames, 4-level paging with an identity map of low RAM,
//! the kernel heap at a fixed high-half window, and DMA buffers.

pub mod dma;
pub mod frame;
pub mod heap;
pub mod paging;

use core::sync::atomic::{AtomicU64, Ordering};

pub use paging::{is_user_address, validate_user_ptr, MapError, PageFlags};

/// Page / frame size (4 KiB)
pub const FRAME_SIZE: u64 = 4096;

/// RAM is identity-mapped at boot up to this physical address (512 MiB),
/// which satisfies DMA assumptions in the legacy driver paths.
pub const IDENTITY_MAP_LIMIT: u64 = 512 * 1024 * 1024;

/// Fixed high-half window for the kernel heap
pub const HEAP_VIRT_BASE: u64 = 0xFFFF_FF80_0000_0000;
/// Maximum heap window size
pub const HEAP_SIZE_MAX: usize = 256 * 1024 * 1024;
/// Minimum heap size
pub const HEAP_SIZE_MIN: usize = 16 * 1024 * 1024;

/// ioremap window for MMIO mappings, separate from the heap window
pub const IOREMAP_BASE: u64 = 0xFFFF_FF00_0000_0000;
pub const IOREMAP_SIZE: u64 = 1024 * 1024 * 1024;

/// Userland window: above the identity-mapped RAM, below the canonical hole
pub const USER_BASE: u64 = 0x4000_0000;
pub const USER_TOP: u64 = 0x8000_0000;
/// Default user mmap region base
pub const USER_MMAP_BASE: u64 = 0x6000_0000;
/// Top of the user stack
pub const USER_STACK_TOP: u64 = 0x7000_0000;

/// Total physical memory detected at boot
static TOTAL_PHYS_MEMORY: AtomicU64 = AtomicU64::new(0);

/// Convert a physical address inside the identity-mapped window to a
/// virtual address. ModuOS identity-maps low RAM, so this is the identity.
pub fn phys_to_virt(phys: u64) -> u64 {
    phys
}

/// Store detected total physical memory
pub fn set_total_physical_memory(bytes: u64) {
    TOTAL_PHYS_MEMORY.store(bytes, Ordering::SeqCst);
}

/// Get total physical memory in bytes
pub fn total_physical_memory() -> u64 {
    TOTAL_PHYS_MEMORY.load(Ordering::Relaxed)
}

/// Compute the heap size: 25% of usable RAM, clamped
pub fn compute_heap_size(total_ram: u64) -> usize {
    ((total_ram / 4) as usize).clamp(HEAP_SIZE_MIN, HEAP_SIZE_MAX)
}

/// Bring up frames, paging and the heap, in that order.
pub fn init() {
    let total = crate::boot::total_usable_memory();
    set_total_physical_memory(total);
    crate::log!("[MEM] Total usable memory: {} MB", total / 1024 / 1024);

    frame::init();
    paging::init();

    let heap_size = compute_heap_size(total.min(IDENTITY_MAP_LIMIT));
    paging::map_heap_window(heap_size).expect("failed to map kernel heap window");
    heap::init_at(HEAP_VIRT_BASE as usize, heap_size);
    crate::log!(
        "[HEAP] Initialized: {} MB at {:#x}",
        heap_size / 1024 / 1024,
        HEAP_VIRT_BASE
    );
}

/// Memory statistics
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub heap_used: usize,
    pub heap_free: usize,
    pub frames_used: usize,
    pub frames_free: usize,
}

/// Get memory statistics
pub fn stats() -> MemoryStats {
    let (frames_total, frames_used) = frame::stats();
    MemoryStats {
        heap_used: heap::used(),
        heap_free: heap::free(),
        frames_used: frames_used as usize,
        frames_free: (frames_total - frames_used) as usize,
    }
}
