//! Per-module kernel capability API
//!
//! Every loaded module receives its own `KernelApi` table. The base
//! members are always filled; the rest are gated by module type and stay
//! None otherwise. Modules may keep the pointer for their lifetime, so
//! the table lives boxed inside the module registry entry.

use core::ffi::c_void;
use spin::Mutex;

use super::{ModuleType, SQRM_ABI_VERSION};
use crate::block::{self, Handle};

/// DMA buffer descriptor crossing the module ABI
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CDmaBuffer {
    pub virt: u64,
    pub phys: u64,
    pub size: usize,
}

/// PCM device ops registered by AUDIO modules
#[repr(C)]
pub struct AudioPcmOps {
    pub play: Option<extern "C" fn(ctx: *mut c_void, buf: *const u8, len: usize) -> i32>,
    pub stop: Option<extern "C" fn(ctx: *mut c_void) -> i32>,
}

/// The capability table handed to `sqrm_module_init`
#[repr(C)]
pub struct KernelApi {
    pub abi_version: u32,
    pub module_type: u32,
    pub module_name: *const u8,

    // Logging (always present)
    pub log: Option<extern "C" fn(msg: *const u8)>,

    // Memory (always present)
    pub kmalloc: Option<extern "C" fn(size: usize) -> *mut c_void>,
    pub kfree: Option<extern "C" fn(ptr: *mut c_void)>,

    // DMA (always present)
    pub dma_alloc: Option<extern "C" fn(out: *mut CDmaBuffer, size: usize, align: usize) -> i32>,
    pub dma_free: Option<extern "C" fn(buf: *const CDmaBuffer)>,

    // Port I/O (always present)
    pub inb: Option<extern "C" fn(port: u16) -> u8>,
    pub inw: Option<extern "C" fn(port: u16) -> u16>,
    pub inl: Option<extern "C" fn(port: u16) -> u32>,
    pub outb: Option<extern "C" fn(port: u16, val: u8)>,
    pub outw: Option<extern "C" fn(port: u16, val: u16)>,
    pub outl: Option<extern "C" fn(port: u16, val: u32)>,

    // IRQ plumbing (always present)
    pub irq_install_handler: Option<extern "C" fn(irq: i32, handler: extern "C" fn())>,
    pub irq_uninstall_handler: Option<extern "C" fn(irq: i32)>,
    pub pic_send_eoi: Option<extern "C" fn(irq: u8)>,

    // VFS driver registration (FS modules)
    pub fs_register_driver:
        Option<extern "C" fn(name: *const u8, ops: *const crate::fs::ExtDriverOps) -> i32>,

    // DEVFS node registration (FS + driver modules)
    pub devfs_register_path: Option<
        extern "C" fn(
            path: *const u8,
            read: Option<extern "C" fn(*mut c_void, *mut u8, usize) -> isize>,
            write: Option<extern "C" fn(*mut c_void, *const u8, usize) -> isize>,
            ctx: *mut c_void,
        ) -> i32,
    >,

    // Block device access (FS modules)
    pub block_get_info:
        Option<extern "C" fn(handle: u32, out_sector_size: *mut u32, out_sectors: *mut u64, out_flags: *mut u32) -> i32>,
    pub block_read:
        Option<extern "C" fn(handle: u32, lba: u64, count: u32, buf: *mut u8, buf_size: usize) -> i32>,
    pub block_write:
        Option<extern "C" fn(handle: u32, lba: u64, count: u32, buf: *const u8, buf_size: usize) -> i32>,
    pub block_get_handle_for_vdrive: Option<extern "C" fn(vdrive_id: i32, out: *mut u32) -> i32>,

    // Audio (AUDIO modules)
    pub audio_register_pcm:
        Option<extern "C" fn(name: *const u8, ops: *const AudioPcmOps, ctx: *mut c_void) -> i32>,
}

// ----------------------------------------------------------------------
// C-callable shims
// ----------------------------------------------------------------------

fn cstr_to_str<'a>(ptr: *const u8, max: usize) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    unsafe {
        while len < max && *ptr.add(len) != 0 {
            len += 1;
        }
        core::str::from_utf8(core::slice::from_raw_parts(ptr, len)).ok()
    }
}

extern "C" fn api_log(msg: *const u8) {
    if let Some(s) = cstr_to_str(msg, 512) {
        crate::log!("[SQRM-MOD] {}", s.trim_end_matches('\n'));
    }
}

/// kmalloc shim: a size header in front of the payload lets kfree
/// reconstruct the layout from the bare pointer.
extern "C" fn api_kmalloc(size: usize) -> *mut c_void {
    const HEADER: usize = 16;
    match crate::memory::heap::kmalloc_aligned(size + HEADER, 16) {
        Some(ptr) => unsafe {
            (ptr as *mut usize).write(size);
            ptr.add(HEADER) as *mut c_void
        },
        None => core::ptr::null_mut(),
    }
}

extern "C" fn api_kfree(ptr: *mut c_void) {
    const HEADER: usize = 16;
    if ptr.is_null() {
        return;
    }
    unsafe {
        let base = (ptr as *mut u8).sub(HEADER);
        let size = (base as *mut usize).read();
        crate::memory::heap::kfree(base, size + HEADER, 16);
    }
}

extern "C" fn api_dma_alloc(out: *mut CDmaBuffer, size: usize, align: usize) -> i32 {
    if out.is_null() {
        return -1;
    }
    match crate::memory::dma::dma_alloc(size, align) {
        Some(buf) => {
            unsafe {
                out.write(CDmaBuffer {
                    virt: buf.virt,
                    phys: buf.phys,
                    size: buf.size,
                });
            }
            // Ownership transfers to the module until dma_free
            core::mem::forget(buf);
            0
        }
        None => -2,
    }
}

extern "C" fn api_dma_free(buf: *const CDmaBuffer) {
    if buf.is_null() {
        return;
    }
    let c = unsafe { buf.read() };
    let frames = c.size / crate::memory::FRAME_SIZE as usize;
    for i in 0..frames {
        crate::memory::frame::free_frame(c.phys + (i as u64) * crate::memory::FRAME_SIZE);
    }
}

extern "C" fn api_inb(port: u16) -> u8 {
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

extern "C" fn api_inw(port: u16) -> u16 {
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

extern "C" fn api_inl(port: u16) -> u32 {
    unsafe { x86_64::instructions::port::Port::new(port).read() }
}

extern "C" fn api_outb(port: u16, val: u8) {
    unsafe { x86_64::instructions::port::Port::new(port).write(val) }
}

extern "C" fn api_outw(port: u16, val: u16) {
    unsafe { x86_64::instructions::port::Port::new(port).write(val) }
}

extern "C" fn api_outl(port: u16, val: u32) {
    unsafe { x86_64::instructions::port::Port::new(port).write(val) }
}

extern "C" fn api_irq_install(irq: i32, handler: extern "C" fn()) {
    if (0..16).contains(&irq) {
        crate::interrupts::irq::install_handler(irq as u8, handler);
    }
}

extern "C" fn api_irq_uninstall(irq: i32) {
    if (0..16).contains(&irq) {
        crate::interrupts::irq::uninstall_handler(irq as u8);
    }
}

extern "C" fn api_pic_send_eoi(irq: u8) {
    crate::interrupts::pic::send_eoi(irq);
}

extern "C" fn api_fs_register_driver(name: *const u8, ops: *const crate::fs::ExtDriverOps) -> i32 {
    let Some(name) = cstr_to_str(name, 16) else {
        return -1;
    };
    match crate::fs::register_driver(name, ops) {
        Ok(()) => 0,
        Err(_) => -2,
    }
}

extern "C" fn api_devfs_register_path(
    path: *const u8,
    read: Option<extern "C" fn(*mut c_void, *mut u8, usize) -> isize>,
    write: Option<extern "C" fn(*mut c_void, *const u8, usize) -> isize>,
    ctx: *mut c_void,
) -> i32 {
    let Some(path) = cstr_to_str(path, 64) else {
        return -1;
    };
    match crate::fs::devfs::register_external(path, read, write, ctx) {
        Ok(()) => 0,
        Err(_) => -2,
    }
}

extern "C" fn api_block_get_info(
    handle: u32,
    out_sector_size: *mut u32,
    out_sectors: *mut u64,
    out_flags: *mut u32,
) -> i32 {
    match block::get_info(handle as Handle) {
        Ok(info) => {
            unsafe {
                if !out_sector_size.is_null() {
                    out_sector_size.write(info.sector_size);
                }
                if !out_sectors.is_null() {
                    out_sectors.write(info.sector_count);
                }
                if !out_flags.is_null() {
                    out_flags.write(info.flags.bits());
                }
            }
            0
        }
        Err(_) => -1,
    }
}

extern "C" fn api_block_read(handle: u32, lba: u64, count: u32, buf: *mut u8, buf_size: usize) -> i32 {
    if buf.is_null() {
        return -1;
    }
    let slice = unsafe { core::slice::from_raw_parts_mut(buf, buf_size) };
    match block::read(handle as Handle, lba, count, slice) {
        Ok(()) => 0,
        Err(block::BlockError::ReadOnly) => -30,
        Err(_) => -2,
    }
}

extern "C" fn api_block_write(handle: u32, lba: u64, count: u32, buf: *const u8, buf_size: usize) -> i32 {
    if buf.is_null() {
        return -1;
    }
    let slice = unsafe { core::slice::from_raw_parts(buf, buf_size) };
    match block::write(handle as Handle, lba, count, slice) {
        Ok(()) => 0,
        Err(block::BlockError::ReadOnly) => -30,
        Err(_) => -2,
    }
}

extern "C" fn api_block_get_handle_for_vdrive(vdrive_id: i32, out: *mut u32) -> i32 {
    if out.is_null() || !(0..256).contains(&vdrive_id) {
        return -1;
    }
    let h = crate::block::vdrive::handle_for(vdrive_id as u8);
    unsafe { out.write(h) };
    if h == crate::block::INVALID_HANDLE {
        -2
    } else {
        0
    }
}

// Minimal PCM registry for AUDIO modules
struct PcmDevice {
    name: [u8; 32],
    ops: *const AudioPcmOps,
    ctx: *mut c_void,
}

unsafe impl Send for PcmDevice {}

static PCM_DEVICES: Mutex<alloc::vec::Vec<PcmDevice>> = Mutex::new(alloc::vec::Vec::new());

extern "C" fn api_audio_register_pcm(name: *const u8, ops: *const AudioPcmOps, ctx: *mut c_void) -> i32 {
    let Some(name_str) = cstr_to_str(name, 31) else {
        return -1;
    };
    if ops.is_null() {
        return -1;
    }
    let mut fixed = [0u8; 32];
    fixed[..name_str.len()].copy_from_slice(name_str.as_bytes());
    PCM_DEVICES.lock().push(PcmDevice {
        name: fixed,
        ops,
        ctx,
    });
    crate::log!("[AUDIO] PCM device registered: {}", name_str);
    0
}

/// Registered PCM device count (diagnostics)
pub fn pcm_device_count() -> usize {
    PCM_DEVICES.lock().len()
}

// ----------------------------------------------------------------------
// Table construction
// ----------------------------------------------------------------------

/// Build the capability table for one module. Base capabilities are
/// always present; FS and AUDIO extras depend on the module type.
pub fn build(module_type: ModuleType, module_name: *const u8) -> KernelApi {
    let mut api = KernelApi {
        abi_version: SQRM_ABI_VERSION,
        module_type: module_type as u32,
        module_name,

        log: Some(api_log),
        kmalloc: Some(api_kmalloc),
        kfree: Some(api_kfree),
        dma_alloc: Some(api_dma_alloc),
        dma_free: Some(api_dma_free),
        inb: Some(api_inb),
        inw: Some(api_inw),
        inl: Some(api_inl),
        outb: Some(api_outb),
        outw: Some(api_outw),
        outl: Some(api_outl),
        irq_install_handler: Some(api_irq_install),
        irq_uninstall_handler: Some(api_irq_uninstall),
        pic_send_eoi: Some(api_pic_send_eoi),

        fs_register_driver: None,
        devfs_register_path: None,
        block_get_info: None,
        block_read: None,
        block_write: None,
        block_get_handle_for_vdrive: None,
        audio_register_pcm: None,
    };

    if module_type == ModuleType::Fs {
        api.fs_register_driver = Some(api_fs_register_driver);
        api.devfs_register_path = Some(api_devfs_register_path);
        api.block_get_info = Some(api_block_get_info);
        api.block_read = Some(api_block_read);
        api.block_write = Some(api_block_write);
        api.block_get_handle_for_vdrive = Some(api_block_get_handle_for_vdrive);
    }

    if module_type == ModuleType::Audio {
        api.audio_register_pcm = Some(api_audio_register_pcm);
    }

    api
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_gating_by_type() {
        let fs_api = build(ModuleType::Fs, core::ptr::null());
        assert!(fs_api.fs_register_driver.is_some());
        assert!(fs_api.block_read.is_some());
        assert!(fs_api.audio_register_pcm.is_none());

        let usb_api = build(ModuleType::Usb, core::ptr::null());
        assert!(usb_api.log.is_some());
        assert!(usb_api.kmalloc.is_some());
        assert!(usb_api.fs_register_driver.is_none());
        assert!(usb_api.block_read.is_none());
        assert!(usb_api.audio_register_pcm.is_none());

        let audio_api = build(ModuleType::Audio, core::ptr::null());
        assert!(audio_api.audio_register_pcm.is_some());
        assert!(audio_api.fs_register_driver.is_none());
    }
}
