//! Boot information capture (Multiboot2)
//!
//! Parses the Multiboot2 boot information once at startup and keeps it
//! available for the rest of the kernel: memory map, kernel command line,
//! boot modules, framebuffer and UEFI detection.

pub mod boot32;

use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};
use spin::Once;

pub use boot32::MULTIBOOT2_ENTRY_MAGIC;

static MB2_INFO: Once<BootInformation<'static>> = Once::new();
static BOOT_CONFIG: Once<BootConfig> = Once::new();

/// A usable physical memory region from the Multiboot2 memory map
#[derive(Clone, Copy, Debug)]
pub struct PhysRegion {
    pub base: u64,
    pub length: u64,
}

/// Framebuffer description from Multiboot2 tag 8
#[derive(Clone, Copy, Debug)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
}

/// Parsed boot configuration
#[derive(Clone, Debug, Default)]
pub struct BootConfig {
    /// `gfx-test` on the kernel command line selects the graphics boot path
    pub gfx_test: bool,
    /// Booted from UEFI firmware (EFI system table tag present)
    pub uefi: bool,
    pub framebuffer: Option<FramebufferInfo>,
}

// Kernel image bounds from the linker script
extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Physical address of the first byte of the kernel image
pub fn kernel_start() -> u64 {
    unsafe { &__kernel_start as *const u8 as u64 }
}

/// Physical address just past the kernel image
pub fn kernel_end() -> u64 {
    unsafe { &__kernel_end as *const u8 as u64 }
}

/// Capture and parse the Multiboot2 boot information.
///
/// Must be called exactly once, before the frame allocator comes up.
pub fn init(magic: u64, mb2_addr: u64) {
    if magic as u32 != MULTIBOOT2_ENTRY_MAGIC {
        panic!("bad Multiboot2 magic: {:#x}", magic);
    }

    let info = unsafe {
        BootInformation::load(mb2_addr as *const BootInformationHeader)
            .expect("failed to load Multiboot2 information")
    };
    let info = MB2_INFO.call_once(|| info);

    let mut config = BootConfig::default();

    if let Some(tag) = info.command_line_tag() {
        if let Ok(cmdline) = tag.cmdline() {
            crate::log!("[BOOT] cmdline: \"{}\"", cmdline);
            for token in cmdline.split_whitespace() {
                match token {
                    "gfx-test" => config.gfx_test = true,
                    other => crate::log_debug!("[BOOT] ignoring cmdline token '{}'", other),
                }
            }
        }
    }

    // UEFI detection: an EFI system table tag means we were booted by
    // UEFI firmware (full SMBIOS parsing is out of scope).
    if info.efi_sdt64_tag().is_some() || info.efi_bs_not_exited_tag().is_some() {
        config.uefi = true;
        crate::log!("[BOOT] UEFI firmware detected");
    }

    if let Some(Ok(fb)) = info.framebuffer_tag() {
        config.framebuffer = Some(FramebufferInfo {
            addr: fb.address(),
            width: fb.width(),
            height: fb.height(),
            pitch: fb.pitch(),
            bpp: fb.bpp(),
        });
        crate::log!(
            "[BOOT] framebuffer {}x{} bpp={} at {:#x}",
            fb.width(),
            fb.height(),
            fb.bpp(),
            fb.address()
        );
    }

    for module in info.module_tags() {
        crate::log!(
            "[BOOT] module {:#x}..{:#x} '{}'",
            module.start_address(),
            module.end_address(),
            module.cmdline().unwrap_or("")
        );
    }

    BOOT_CONFIG.call_once(|| config);
}

/// Boot configuration parsed from the command line and tags
pub fn config() -> &'static BootConfig {
    BOOT_CONFIG.get().expect("boot::init not called")
}

fn info() -> &'static BootInformation<'static> {
    MB2_INFO.get().expect("boot::init not called")
}

/// Total bytes of usable physical memory in the Multiboot2 memory map
pub fn total_usable_memory() -> u64 {
    let mut total = 0;
    for_each_usable_region(|r| total += r.length);
    total
}

/// Walk the usable regions of the memory map.
///
/// Heap-free on purpose: the frame allocator calls this before any
/// allocator exists.
pub fn for_each_usable_region(mut f: impl FnMut(PhysRegion)) {
    let tag = info()
        .memory_map_tag()
        .expect("Multiboot2 memory map missing");
    for area in tag.memory_areas() {
        if area.typ() != MemoryAreaType::Available {
            continue;
        }
        f(PhysRegion {
            base: area.start_address(),
            length: area.size(),
        });
    }
}

/// Physical range occupied by the Multiboot2 information itself
pub fn mb2_info_region() -> PhysRegion {
    let info = info();
    PhysRegion {
        base: info.start_address() as u64,
        length: (info.end_address() - info.start_address()) as u64,
    }
}

/// Physical ranges of all boot modules
pub fn for_each_module_region(mut f: impl FnMut(PhysRegion)) {
    for module in info().module_tags() {
        f(PhysRegion {
            base: module.start_address() as u64,
            length: (module.end_address() - module.start_address()) as u64,
        });
    }
}
