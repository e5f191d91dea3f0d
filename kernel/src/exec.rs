//! Userland program execution
//!
//! Loads an ELF binary from the current mount through the HVFS path,
//! maps its PT_LOAD segments and a user stack into the user window,
//! copies argv onto the stack and spawns a user process.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::memory::{frame, paging, PageFlags, FRAME_SIZE, USER_BASE, USER_STACK_TOP, USER_TOP};
use crate::process;
use crate::sqrm::elf::{self, Elf64Header, Elf64Phdr, PT_LOAD};

/// Exec errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    BadElf,
    OutOfMemory,
    TooManyProcesses,
}

const USER_STACK_SIZE: u64 = process::USER_STACK_SIZE as u64;

fn map_user_range(vaddr: u64, len: u64, flags: PageFlags) -> Result<(), ExecError> {
    let start = vaddr & !(FRAME_SIZE - 1);
    let end = (vaddr + len + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
    let mut page = start;
    while page < end {
        match paging::virt_to_phys(page) {
            Ok(_) => {} // already mapped (overlapping segments)
            Err(_) => {
                let f = frame::alloc_frame().map_err(|_| ExecError::OutOfMemory)?;
                unsafe {
                    core::ptr::write_bytes(crate::memory::phys_to_virt(f) as *mut u8, 0, FRAME_SIZE as usize);
                }
                paging::map_page(page, f, flags).map_err(|_| ExecError::OutOfMemory)?;
            }
        }
        page += FRAME_SIZE;
    }
    Ok(())
}

/// Copy argv strings and the pointer array onto the user stack.
/// Returns (new stack top, argc, argv address).
fn build_user_stack(stack_top: u64, argv: &[String]) -> (u64, u64, u64) {
    let mut sp = stack_top;

    // String payloads, highest first
    let mut ptrs: Vec<u64> = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp -= bytes.len() as u64 + 1;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), sp as *mut u8, bytes.len());
            *(sp as *mut u8).add(bytes.len()) = 0;
        }
        ptrs.push(sp);
    }
    ptrs.reverse();

    // Pointer array (NULL-terminated), then argc on top:
    // the program entry sees [rsp] = argc, [rsp+8] = argv[0], ...
    sp &= !0xF;
    sp -= 8; // terminator
    unsafe { (sp as *mut u64).write(0) };
    for &p in ptrs.iter().rev() {
        sp -= 8;
        unsafe { (sp as *mut u64).write(p) };
    }
    let argv_addr = sp;

    if sp % 16 == 8 {
        sp -= 8; // keep argc 16-byte aligned
    }
    sp -= 8;
    unsafe { (sp as *mut u64).write(argv.len() as u64) };

    (sp, argv.len() as u64, argv_addr)
}

/// Load and start a user program. Returns the new pid.
///
/// The binary runs in the shared kernel page tree with USER-flagged
/// pages inside the user window; segments outside that window are
/// rejected.
pub fn spawn(path: &str, argv: Vec<String>) -> Result<u32, ExecError> {
    let slot = process::with_process(process::current_pid(), |p| p.current_slot)
        .unwrap_or(0)
        .max(0) as usize;

    let bytes = crate::fs::read_file(slot, path).map_err(|_| ExecError::NotFound)?;

    let eh = Elf64Header::from_bytes(&bytes).ok_or(ExecError::BadElf)?;
    if eh.e_machine != elf::EM_X86_64 {
        return Err(ExecError::BadElf);
    }
    // ET_EXEC binaries run at their linked address; ET_DYN is linked to
    // the user window base by the userland toolchain.
    if eh.e_phoff == 0 || eh.e_phnum == 0 || eh.e_phentsize as usize != Elf64Phdr::SIZE {
        return Err(ExecError::BadElf);
    }

    let mut max_vaddr = 0u64;
    for i in 0..eh.e_phnum as usize {
        let ph: Elf64Phdr = elf::read_at(&bytes, eh.e_phoff as usize + i * Elf64Phdr::SIZE)
            .ok_or(ExecError::BadElf)?;
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        if ph.p_vaddr < USER_BASE || ph.p_vaddr + ph.p_memsz > USER_TOP {
            return Err(ExecError::BadElf);
        }

        let writable = ph.p_flags & 0x2 != 0;
        // Map writable for the copy; code pages are restricted below
        map_user_range(ph.p_vaddr, ph.p_memsz, PageFlags::user_data())?;

        let src_end = ph.p_offset as usize + ph.p_filesz as usize;
        if src_end > bytes.len() {
            return Err(ExecError::BadElf);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[ph.p_offset as usize..].as_ptr(),
                ph.p_vaddr as *mut u8,
                ph.p_filesz as usize,
            );
        }

        // Executable code pages drop the write bit after loading
        if !writable {
            let start = ph.p_vaddr & !(FRAME_SIZE - 1);
            let end = (ph.p_vaddr + ph.p_memsz + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
            let mut page = start;
            while page < end {
                if let Ok(phys) = paging::virt_to_phys(page) {
                    let _ = paging::map_page(page, phys & !0xFFF, PageFlags::user_code());
                }
                page += FRAME_SIZE;
            }
        }

        max_vaddr = max_vaddr.max(ph.p_vaddr + ph.p_memsz);
    }

    if max_vaddr == 0 {
        return Err(ExecError::BadElf);
    }

    // User stack just below USER_STACK_TOP
    let stack_bottom = USER_STACK_TOP - USER_STACK_SIZE;
    map_user_range(stack_bottom, USER_STACK_SIZE, PageFlags::user_data())?;
    let (user_rsp, _argc, _argv_addr) = build_user_stack(USER_STACK_TOP - 64, &argv);

    // User heap starts page-aligned after the image
    let heap_base = (max_vaddr + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
    let heap_limit = crate::memory::USER_MMAP_BASE;

    let name = crate::fs::path::basename(path).to_string();
    let pid = process::process_create_user(
        &name,
        eh.e_entry,
        user_rsp,
        heap_base,
        heap_limit,
        1,
        argv,
    )
    .ok_or(ExecError::TooManyProcesses)?;

    Ok(pid)
}
