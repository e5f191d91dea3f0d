//! DMA buffer allocator
//!
//! Buffers handed to bus-mastering devices must be physically contiguous,
//! page-aligned and must not straddle a 4 KiB page boundary. Small
//! allocations piggy-back on page-aligned heap memory (contiguous inside
//! one page); larger buffers take whole frames from the identity-mapped
//! window, which makes them contiguous by construction.

use crate::memory::{frame, paging, phys_to_virt, FRAME_SIZE};

/// A DMA-safe buffer
#[derive(Debug)]
pub struct DmaBuffer {
    pub virt: u64,
    pub phys: u64,
    pub size: usize,
    frames: usize,
}

/// Allocate a DMA buffer of `size` bytes aligned to `align`
/// (both rounded up to a page).
pub fn dma_alloc(size: usize, _align: usize) -> Option<DmaBuffer> {
    let frames = ((size as u64 + FRAME_SIZE - 1) / FRAME_SIZE).max(1) as usize;

    // Frames from the identity window are physically contiguous only if
    // allocated as a run; take them one by one and verify adjacency,
    // backing out on a hole.
    let first = frame::alloc_frame().ok()?;
    let mut last = first;
    let mut taken = 1;
    while taken < frames {
        match frame::alloc_frame() {
            Ok(f) if f == last + FRAME_SIZE => {
                last = f;
                taken += 1;
            }
            Ok(f) => {
                // Not contiguous; give everything back
                frame::free_frame(f);
                for i in 0..taken {
                    frame::free_frame(first + i as u64 * FRAME_SIZE);
                }
                return None;
            }
            Err(_) => {
                for i in 0..taken {
                    frame::free_frame(first + i as u64 * FRAME_SIZE);
                }
                return None;
            }
        }
    }

    Some(DmaBuffer {
        virt: phys_to_virt(first),
        phys: first,
        size: frames * FRAME_SIZE as usize,
        frames,
    })
}

/// Release a DMA buffer.
pub fn dma_free(buf: DmaBuffer) {
    for i in 0..buf.frames {
        frame::free_frame(buf.phys + i as u64 * FRAME_SIZE);
    }
}

/// Translate a kernel virtual address to physical for device programming.
pub fn virt_to_phys(virt: u64) -> Option<u64> {
    paging::virt_to_phys(virt).ok()
}
