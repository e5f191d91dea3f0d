//! Physical Frame Allocator (Bitmap)
//!
//! Tracks all usable physical pages (4 KiB frames) via a bitmap.
//! Each bit represents one physical frame: 0 = free, 1 = allocated.
//! Initialized from the Multiboot2 memory map before the heap exists,
//! so the bitmap lives in static storage.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::boot;
use crate::memory::{FRAME_SIZE, IDENTITY_MAP_LIMIT};

/// Low-memory guard: never hand out frames below 64 KiB
const LOW_GUARD: u64 = 0x1_0000;

/// Maximum tracked frames (the identity-mapped window)
const MAX_FRAMES: usize = (IDENTITY_MAP_LIMIT / FRAME_SIZE) as usize;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Frame allocation failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// No free frame left; callers must back out partial work
    OutOfFrames,
}

/// Statistics: total frames managed
static TOTAL_FRAMES: AtomicU64 = AtomicU64::new(0);
/// Statistics: allocated frames
static USED_FRAMES: AtomicU64 = AtomicU64::new(0);

struct FrameAllocator {
    /// Bitmap: each bit = one 4 KiB frame. bit set = allocated.
    bitmap: [u64; BITMAP_WORDS],
    /// Total number of frames tracked
    total_frames: usize,
    /// Hint: word index of the last allocation (speeds up the linear scan)
    next_hint: usize,
    initialized: bool,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; BITMAP_WORDS],
            total_frames: 0,
            next_hint: 0,
            initialized: false,
        }
    }

    /// Used ranges round outward (any overlap taints the frame); free
    /// ranges round inward (partial frames stay reserved).
    fn mark_range(&mut self, base: u64, length: u64, used: bool) {
        let (start, end) = if used {
            (
                (base / FRAME_SIZE) as usize,
                ((base + length + FRAME_SIZE - 1) / FRAME_SIZE) as usize,
            )
        } else {
            (
                ((base + FRAME_SIZE - 1) / FRAME_SIZE) as usize,
                ((base + length) / FRAME_SIZE) as usize,
            )
        };
        for frame in start..end.min(self.total_frames) {
            let word = frame / 64;
            let bit = frame % 64;
            if used {
                self.bitmap[word] |= 1u64 << bit;
            } else {
                self.bitmap[word] &= !(1u64 << bit);
            }
        }
    }

    /// First-fit scan for a free frame. Fails closed: a used frame is
    /// never returned.
    fn alloc(&mut self) -> Result<u64, FrameError> {
        let words = BITMAP_WORDS;
        for offset in 0..words {
            let idx = (self.next_hint + offset) % words;
            let word = self.bitmap[idx];
            if word == u64::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            let frame_index = idx * 64 + bit;
            if frame_index >= self.total_frames {
                continue;
            }

            self.bitmap[idx] |= 1u64 << bit;
            self.next_hint = idx;
            USED_FRAMES.fetch_add(1, Ordering::Relaxed);
            return Ok(frame_index as u64 * FRAME_SIZE);
        }

        Err(FrameError::OutOfFrames)
    }

    fn free(&mut self, phys: u64) {
        let frame_index = (phys / FRAME_SIZE) as usize;
        if frame_index >= self.total_frames {
            return;
        }
        let word = frame_index / 64;
        let bit = frame_index % 64;
        if self.bitmap[word] & (1u64 << bit) != 0 {
            self.bitmap[word] &= !(1u64 << bit);
            USED_FRAMES.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

static FRAME_ALLOC: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Initialize the frame allocator from the Multiboot2 memory map.
///
/// Frames overlapping the low guard, the kernel image, the Multiboot2
/// information and boot modules are pre-marked used. Frames above the
/// identity-mapped window are not tracked (they stay marked used).
pub fn init() {
    let mut alloc = FRAME_ALLOC.lock();

    let mut top: u64 = 0;
    boot::for_each_usable_region(|r| {
        let end = r.base + r.length;
        if end > top {
            top = end;
        }
    });
    let top = top.min(IDENTITY_MAP_LIMIT);
    alloc.total_frames = (top / FRAME_SIZE) as usize;

    // Usable regions become free...
    boot::for_each_usable_region(|r| {
        alloc.mark_range(r.base, r.length, false);
    });

    // ...then everything the kernel already occupies goes back to used.
    alloc.mark_range(0, LOW_GUARD, true);
    let kstart = boot::kernel_start();
    let kend = boot::kernel_end();
    alloc.mark_range(kstart, kend - kstart, true);
    let mb2 = boot::mb2_info_region();
    alloc.mark_range(mb2.base, mb2.length, true);
    boot::for_each_module_region(|r| {
        alloc.mark_range(r.base, r.length, true);
    });

    let mut free_count: u64 = 0;
    for i in 0..alloc.total_frames {
        if alloc.bitmap[i / 64] & (1u64 << (i % 64)) == 0 {
            free_count += 1;
        }
    }
    let total = alloc.total_frames as u64;
    TOTAL_FRAMES.store(total, Ordering::SeqCst);
    USED_FRAMES.store(total - free_count, Ordering::SeqCst);
    alloc.initialized = true;

    crate::log!(
        "[FRAME] Allocator ready: {} total frames, {} free ({} MB), {} used",
        total,
        free_count,
        free_count * 4 / 1024,
        total - free_count
    );
}

/// Allocate a single physical 4 KiB frame.
pub fn alloc_frame() -> Result<u64, FrameError> {
    FRAME_ALLOC.lock().alloc()
}

/// Allocate a zeroed physical frame. Valid because every tracked frame
/// lies inside the identity-mapped window.
pub fn alloc_frame_zeroed() -> Result<u64, FrameError> {
    let phys = alloc_frame()?;
    let virt = crate::memory::phys_to_virt(phys);
    unsafe {
        core::ptr::write_bytes(virt as *mut u8, 0, FRAME_SIZE as usize);
    }
    Ok(phys)
}

/// Free a physical frame previously returned by `alloc_frame`.
pub fn free_frame(phys: u64) {
    FRAME_ALLOC.lock().free(phys);
}

/// Number of frames the allocator tracks
pub fn total_frames() -> u64 {
    TOTAL_FRAMES.load(Ordering::Relaxed)
}

/// Number of currently free frames
pub fn free_frames() -> u64 {
    total_frames() - USED_FRAMES.load(Ordering::Relaxed)
}

/// Return (total, used) frame counts.
pub fn stats() -> (u64, u64) {
    (total_frames(), USED_FRAMES.load(Ordering::Relaxed))
}

/// Run self-tests on the frame allocator. Returns (passed, failed).
pub fn self_test() -> (usize, usize) {
    let mut passed = 0usize;
    let mut failed = 0usize;

    // Test 1: allocation returns a page-aligned address
    match alloc_frame() {
        Ok(phys) => {
            if phys & 0xFFF == 0 {
                passed += 1;
            } else {
                crate::log_error!("[FRAME-TEST] alloc NOT page-aligned ({:#x})", phys);
                failed += 1;
            }
            free_frame(phys);
        }
        Err(_) => {
            crate::log_error!("[FRAME-TEST] alloc failed");
            failed += 1;
        }
    }

    // Test 2: zeroed allocation
    match alloc_frame_zeroed() {
        Ok(phys) => {
            let virt = crate::memory::phys_to_virt(phys);
            let page = unsafe { core::slice::from_raw_parts(virt as *const u8, 4096) };
            if page.iter().all(|&b| b == 0) {
                passed += 1;
            } else {
                crate::log_error!("[FRAME-TEST] alloc_zeroed NOT zeroed");
                failed += 1;
            }
            free_frame(phys);
        }
        Err(_) => {
            crate::log_error!("[FRAME-TEST] alloc_zeroed failed");
            failed += 1;
        }
    }

    // Test 3: 16 consecutive allocs produce unique frames
    let mut frames = [0u64; 16];
    let mut unique = true;
    for slot in frames.iter_mut() {
        match alloc_frame() {
            Ok(f) => *slot = f,
            Err(_) => {
                unique = false;
                break;
            }
        }
    }
    for i in 0..16 {
        for j in (i + 1)..16 {
            if frames[i] != 0 && frames[i] == frames[j] {
                unique = false;
            }
        }
    }
    for &f in frames.iter() {
        if f != 0 {
            free_frame(f);
        }
    }
    if unique {
        passed += 1;
    } else {
        crate::log_error!("[FRAME-TEST] duplicate or failed multi-alloc");
        failed += 1;
    }

    // Test 4: stats stay consistent across alloc/free
    let (_, used_before) = stats();
    if let Ok(f) = alloc_frame() {
        let (_, used_after) = stats();
        if used_after == used_before + 1 {
            passed += 1;
        } else {
            crate::log_error!(
                "[FRAME-TEST] stats before={} after={}",
                used_before,
                used_after
            );
            failed += 1;
        }
        free_frame(f);
    } else {
        failed += 1;
    }

    (passed, failed)
}
