//! ModuOS Kernel
//!
//! Monolithic x86_64 kernel booted via Multiboot2. Brings up memory,
//! interrupts, processes, the unified storage layer and the virtual
//! filesystem, then loads SQRM modules from the boot volume.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]
extern crate alloc;

// Core services
mod logger;
mod serial;
mod time;

// Boot + CPU structures
mod boot;
mod gdt;
mod interrupts;

// Memory management
mod memory;

// Processes + syscalls
mod exec;
mod process;
mod syscall;

// Storage + filesystems
mod block;
mod drivers;
mod fs;

// Loadable modules
mod sqrm;

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU8, Ordering};

/// Boot stage tracker: the bring-up order is a kernel invariant
/// (filesystem mount before DEVFS before SQRM before rescan), so each
/// phase asserts that it runs in sequence.
static BOOT_STAGE: AtomicU8 = AtomicU8::new(0);

fn boot_stage(expected: u8, name: &str) {
    let prev = BOOT_STAGE.swap(expected, Ordering::SeqCst);
    if prev + 1 != expected {
        panic!("boot order violated at stage {} ({})", expected, name);
    }
    crate::log!("[BOOT] stage {}: {}", expected, name);
}

/// Kernel entry point, called from the Multiboot2 trampoline with the
/// boot magic and the physical address of the boot information.
#[no_mangle]
pub extern "C" fn kmain(magic: u64, mb2_addr: u64) -> ! {
    // Stage 1: serial + logging (everything else wants log output)
    serial::init();
    serial_println!("ModuOS kernel starting (Multiboot2 magic {:#x})", magic);
    boot_stage(1, "serial + logger");

    // Stage 2: boot information capture
    boot::init(magic, mb2_addr);
    boot_stage(2, "multiboot2 capture");

    // Stage 3: GDT + TSS (ring 0/3)
    gdt::init();
    boot_stage(3, "gdt");

    // Stage 4: memory - frames, paging + identity map, heap window
    memory::init();
    boot_stage(4, "memory");

    // Stage 5: IDT, PIC remap, PIT at 100 Hz, syscall gate
    interrupts::init();
    boot_stage(5, "interrupts");

    // Stage 6: process table and scheduler (boot thread becomes pid 0)
    process::init();
    boot_stage(6, "processes");

    // Stage 7: storage backends and the vDrive layer
    drivers::init();
    block::vdrive::init();
    block::vdrive::register_blockdevs();
    boot_stage(7, "storage");

    // Stage 8: filesystem core + boot volume in slot 0
    fs::init();
    fs::fd::init();
    let mut boot_slot: Option<usize> = None;
    for id in 0..block::vdrive::count() as u8 {
        match fs::mount_drive(id, 0, fs::FsType::Unknown) {
            Ok(slot) => {
                crate::log!("[BOOT] boot filesystem: vDrive{} in slot {}", id, slot);
                boot_slot = Some(slot);
                break;
            }
            Err(e) => {
                crate::log_debug!("[BOOT] vDrive{} not mountable: {:?}", id, e);
            }
        }
    }
    if boot_slot.is_none() {
        crate::log_warn!("[BOOT] no boot filesystem found");
    }
    boot_stage(8, "boot filesystem");

    // Stage 9: DEVFS ($/dev nodes need the framebuffer info)
    fs::devfs::init();
    boot_stage(9, "devfs");

    // Stage 10: SQRM modules from the boot volume, then rescan for
    // filesystems their drivers may have brought
    if let Some(slot) = boot_slot {
        sqrm::load_all(slot);
    }
    fs::rescan_all();
    boot_stage(10, "sqrm + rescan");

    // Boot-time self tests (frame allocator, paging, heap)
    run_self_tests();

    if boot::config().gfx_test {
        // Graphics test path: the framebuffer console is an external
        // collaborator; report what video0 would hand out and move on.
        crate::log!("[BOOT] gfx-test requested; framebuffer: {:?}", boot::config().framebuffer);
    }

    // Launch the init program from the boot volume, if present
    if boot_slot.is_some() {
        match exec::spawn("/ModuOS/System64/init.elf", alloc::vec![]) {
            Ok(pid) => crate::log!("[BOOT] init process pid {}", pid),
            Err(e) => crate::log_warn!("[BOOT] no init program: {:?}", e),
        }
    }

    crate::log!("[BOOT] kernel up; entering idle loop");

    // The boot thread is pid 0: the idle task
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

fn run_self_tests() {
    let mut passed = 0;
    let mut failed = 0;
    for (name, result) in [
        ("frame", memory::frame::self_test()),
        ("paging", memory::paging::self_test()),
        ("heap", memory::heap::self_test()),
    ] {
        let (p, f) = result;
        passed += p;
        failed += f;
        if f > 0 {
            crate::log_error!("[SELFTEST] {}: {} passed, {} FAILED", name, p, f);
        }
    }
    crate::log!("[SELFTEST] {} passed, {} failed", passed, failed);
}

/// Kernel panic: log the structured message and halt.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("");
    serial_println!("!!! KERNEL PANIC !!!");
    if let Some(location) = info.location() {
        serial_println!("  at {}:{}", location.file(), location.line());
    }
    serial_println!("  {}", info.message());
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {} bytes", layout.size());
}
