//! SQRM - loadable kernel modules
//!
//! `.sqrm` files are ELF64 ET_DYN objects discovered on the boot
//! filesystem under `/ModuOS/System64/md`. Loading relocates the image
//! into kernel memory, validates the exported `sqrm_module_desc`, builds
//! a per-module capability API and calls the entry point. A nonzero init
//! return unloads the image again; duplicate module names are refused.

pub mod api;
pub mod elf;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;

use self::api::KernelApi;
use self::elf::*;
use crate::memory::dma::DmaBuffer;

/// Module ABI version the kernel implements
pub const SQRM_ABI_VERSION: u32 = 1;

/// Module directory on the boot filesystem
pub const MODULE_DIR: &str = "/ModuOS/System64/md";

/// Exported descriptor symbol every module must carry
pub const DESC_SYMBOL: &str = "sqrm_module_desc";

const MAX_MODULES: usize = 64;
const MAX_MODULE_NAME: usize = 63;

/// Module classes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ModuleType {
    Fs = 1,
    Drive = 2,
    Usb = 3,
    Audio = 4,
}

impl ModuleType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ModuleType::Fs),
            2 => Some(ModuleType::Drive),
            3 => Some(ModuleType::Usb),
            4 => Some(ModuleType::Audio),
            _ => None,
        }
    }
}

/// Loader errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqrmError {
    Io,
    /// Malformed or unsupported ELF image
    BadElf,
    MissingDescriptor,
    /// Descriptor present but abi/type/name invalid
    BadAbi,
    DuplicateName,
    /// init() returned nonzero
    InitFailed,
    TooManyModules,
    NoMemory,
}

/// Parsed and validated descriptor
#[derive(Clone, Debug)]
pub struct StagedDesc {
    pub abi_version: u32,
    pub module_type: ModuleType,
    pub name: String,
    /// Entry point offset into the image
    pub entry_offset: u64,
}

/// One committed module
struct LoadedModule {
    /// File basename (dedup key for load_all)
    file_name: String,
    /// Descriptor name (must be unique)
    name: Box<[u8]>, // NUL-terminated
    module_type: ModuleType,
    image: DmaBuffer,
    /// Stable API table; modules may keep the pointer
    api: Box<KernelApi>,
}

// The API table holds raw C function pointers; the registry itself is
// only touched under the lock
unsafe impl Send for LoadedModule {}

static MODULES: Mutex<Vec<LoadedModule>> = Mutex::new(Vec::new());

type InitFn = extern "C" fn(*const KernelApi) -> i32;

// ----------------------------------------------------------------------
// Image staging (pure: no kernel state, host-testable)
// ----------------------------------------------------------------------

/// PT_LOAD span and entry data derived from the headers
#[derive(Clone, Copy, Debug)]
pub struct LoadPlan {
    pub min_vaddr: u64,
    pub max_vaddr: u64,
    /// Page-aligned image size
    pub image_size: usize,
    pub entry: u64,
}

/// Validate an ELF buffer as a loadable module and compute its span.
pub fn plan(bytes: &[u8]) -> Result<(Elf64Header, LoadPlan), SqrmError> {
    let eh = Elf64Header::from_bytes(bytes).ok_or(SqrmError::BadElf)?;
    if eh.e_type != ET_DYN || eh.e_machine != EM_X86_64 {
        return Err(SqrmError::BadElf);
    }
    if eh.e_phoff == 0 || eh.e_phnum == 0 || eh.e_phentsize as usize != Elf64Phdr::SIZE {
        return Err(SqrmError::BadElf);
    }
    let ph_end = eh.e_phoff as usize + eh.e_phnum as usize * Elf64Phdr::SIZE;
    if ph_end > bytes.len() {
        return Err(SqrmError::BadElf);
    }

    let mut min_v = u64::MAX;
    let mut max_v = 0u64;
    for i in 0..eh.e_phnum as usize {
        let ph: Elf64Phdr =
            read_at(bytes, eh.e_phoff as usize + i * Elf64Phdr::SIZE).ok_or(SqrmError::BadElf)?;
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        min_v = min_v.min(ph.p_vaddr);
        max_v = max_v.max(ph.p_vaddr + ph.p_memsz);
    }
    if min_v == u64::MAX || max_v <= min_v {
        return Err(SqrmError::BadElf);
    }

    // e_entry must land inside a PT_LOAD range
    if eh.e_entry < min_v || eh.e_entry >= max_v {
        return Err(SqrmError::BadElf);
    }

    let image_size = ((max_v - min_v + 0xFFF) & !0xFFF) as usize;
    Ok((
        eh,
        LoadPlan {
            min_vaddr: min_v,
            max_vaddr: max_v,
            image_size,
            entry: eh.e_entry,
        },
    ))
}

/// Map a virtual address to an image offset.
///
/// Accepts, in order: an absolute address inside the loaded image, a VA
/// inside [min_v, max_v), or a bare image-relative offset (some
/// toolchains emit relocation values that way).
fn map_va_to_off(va: u64, base: u64, min_v: u64, max_v: u64, img_sz: u64) -> Option<u64> {
    if base != 0 && va >= base && va < base + img_sz {
        return Some(va - base);
    }
    if va >= min_v && va < max_v {
        let off = va - min_v;
        if off < img_sz {
            return Some(off);
        }
        return None;
    }
    if va < img_sz {
        return Some(va);
    }
    None
}

/// Copy every PT_LOAD's file bytes into the zeroed image.
fn copy_segments(bytes: &[u8], eh: &Elf64Header, image: &mut [u8], min_v: u64) {
    for i in 0..eh.e_phnum as usize {
        let Some(ph) = read_at::<Elf64Phdr>(bytes, eh.e_phoff as usize + i * Elf64Phdr::SIZE)
        else {
            continue;
        };
        if ph.p_type != PT_LOAD || ph.p_filesz == 0 {
            continue;
        }
        let src_start = ph.p_offset as usize;
        let src_end = src_start + ph.p_filesz as usize;
        if src_end > bytes.len() {
            continue;
        }
        let dst_start = (ph.p_vaddr - min_v) as usize;
        let dst_end = dst_start + ph.p_filesz as usize;
        if dst_end > image.len() {
            continue;
        }
        image[dst_start..dst_end].copy_from_slice(&bytes[src_start..src_end]);
    }
}

fn write_u64_at(image: &mut [u8], off: u64, value: u64) {
    let off = off as usize;
    if off + 8 <= image.len() {
        image[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn read_u64_at(image: &[u8], off: u64) -> u64 {
    let off = off as usize;
    if off + 8 > image.len() {
        return 0;
    }
    let mut b = [0u8; 8];
    b.copy_from_slice(&image[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Resolve a dynamic symbol value to an absolute address (S)
fn resolve_sym(
    image: &[u8],
    base: u64,
    min_v: u64,
    max_v: u64,
    syms_off: u64,
    sym_count: usize,
    index: u32,
) -> u64 {
    if index as usize >= sym_count {
        return 0;
    }
    let sym_pos = syms_off as usize + index as usize * Elf64Sym::SIZE;
    let Some(sym) = read_at::<Elf64Sym>(image, sym_pos) else {
        return 0;
    };
    if sym.st_value == 0 {
        return 0;
    }
    match map_va_to_off(sym.st_value, base, min_v, max_v, image.len() as u64) {
        Some(off) => base + off,
        None => 0,
    }
}

/// Apply relocations from the PT_DYNAMIC tables. Best-effort: entries
/// that do not resolve are skipped.
fn apply_relocations_dynamic(
    bytes: &[u8],
    eh: &Elf64Header,
    image: &mut [u8],
    base: u64,
    min_v: u64,
    max_v: u64,
) -> Result<(), ()> {
    let img_sz = image.len() as u64;

    let mut dynph: Option<Elf64Phdr> = None;
    for i in 0..eh.e_phnum as usize {
        if let Some(ph) = read_at::<Elf64Phdr>(bytes, eh.e_phoff as usize + i * Elf64Phdr::SIZE) {
            if ph.p_type == PT_DYNAMIC {
                dynph = Some(ph);
                break;
            }
        }
    }
    let dynph = dynph.ok_or(())?;
    let dyn_off = map_va_to_off(dynph.p_vaddr, 0, min_v, max_v, img_sz).ok_or(())?;
    if dyn_off + dynph.p_memsz > img_sz {
        return Err(());
    }

    let mut symtab_va = 0u64;
    let mut syment = Elf64Sym::SIZE as u64;
    let mut rela_va = 0u64;
    let mut rela_sz = 0u64;
    let mut rela_ent = Elf64Rela::SIZE as u64;
    let mut rel_va = 0u64;
    let mut rel_sz = 0u64;
    let mut rel_ent = Elf64Rel::SIZE as u64;

    let dyn_count = (dynph.p_memsz / Elf64Dyn::SIZE as u64) as usize;
    for i in 0..dyn_count {
        let Some(d) = read_at::<Elf64Dyn>(image, dyn_off as usize + i * Elf64Dyn::SIZE) else {
            break;
        };
        match d.d_tag {
            DT_NULL => break,
            DT_SYMTAB => symtab_va = d.d_val,
            DT_SYMENT => syment = d.d_val,
            DT_RELA => rela_va = d.d_val,
            DT_RELASZ => rela_sz = d.d_val,
            DT_RELAENT => rela_ent = d.d_val,
            DT_REL => rel_va = d.d_val,
            DT_RELSZ => rel_sz = d.d_val,
            DT_RELENT => rel_ent = d.d_val,
            _ => {}
        }
    }

    // Dynamic symbol table (no hash table parsing; cap by image size)
    let (syms_off, sym_count) = if symtab_va != 0 && syment == Elf64Sym::SIZE as u64 {
        match map_va_to_off(symtab_va, 0, min_v, max_v, img_sz) {
            Some(off) => (off, ((img_sz - off) / Elf64Sym::SIZE as u64) as usize),
            None => (0, 0),
        }
    } else {
        (0, 0)
    };

    // RELA entries (explicit addend)
    if rela_va != 0 && rela_sz != 0 && rela_ent == Elf64Rela::SIZE as u64 {
        if let Some(off) = map_va_to_off(rela_va, 0, min_v, max_v, img_sz) {
            if off + rela_sz <= img_sz {
                let n = (rela_sz / Elf64Rela::SIZE as u64) as usize;
                for i in 0..n {
                    let Some(rela) =
                        read_at::<Elf64Rela>(&*image, off as usize + i * Elf64Rela::SIZE)
                    else {
                        break;
                    };
                    let Some(where_off) =
                        map_va_to_off(rela.r_offset, 0, min_v, max_v, img_sz)
                    else {
                        continue;
                    };
                    match r_type(rela.r_info) {
                        R_X86_64_RELATIVE => {
                            write_u64_at(image, where_off, base.wrapping_add(rela.r_addend as u64));
                        }
                        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                            let s = resolve_sym(
                                image,
                                base,
                                min_v,
                                max_v,
                                syms_off,
                                sym_count,
                                r_sym(rela.r_info),
                            );
                            write_u64_at(image, where_off, s.wrapping_add(rela.r_addend as u64));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // REL entries (addend taken in place)
    if rel_va != 0 && rel_sz != 0 && rel_ent == Elf64Rel::SIZE as u64 {
        if let Some(off) = map_va_to_off(rel_va, 0, min_v, max_v, img_sz) {
            if off + rel_sz <= img_sz {
                let n = (rel_sz / Elf64Rel::SIZE as u64) as usize;
                for i in 0..n {
                    let Some(rel) = read_at::<Elf64Rel>(&*image, off as usize + i * Elf64Rel::SIZE)
                    else {
                        break;
                    };
                    let Some(where_off) = map_va_to_off(rel.r_offset, 0, min_v, max_v, img_sz)
                    else {
                        continue;
                    };
                    let addend = read_u64_at(image, where_off);
                    match r_type(rel.r_info) {
                        R_X86_64_RELATIVE => {
                            write_u64_at(image, where_off, base.wrapping_add(addend));
                        }
                        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                            let s = resolve_sym(
                                image,
                                base,
                                min_v,
                                max_v,
                                syms_off,
                                sym_count,
                                r_sym(rel.r_info),
                            );
                            write_u64_at(image, where_off, s.wrapping_add(addend));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(())
}

/// Apply SHT_RELA sections resolved through SHT_SYMTAB.
fn apply_relocations_sections(
    bytes: &[u8],
    eh: &Elf64Header,
    image: &mut [u8],
    base: u64,
    min_v: u64,
    max_v: u64,
) -> Result<(), ()> {
    if eh.e_shoff == 0 || eh.e_shnum == 0 || eh.e_shentsize as usize != Elf64Shdr::SIZE {
        return Err(());
    }
    let sh_end = eh.e_shoff as usize + eh.e_shnum as usize * Elf64Shdr::SIZE;
    if sh_end > bytes.len() {
        return Err(());
    }
    let img_sz = image.len() as u64;

    // Optional SHT_SYMTAB (required only for symbol relocations)
    let mut symtab: Option<Elf64Shdr> = None;
    for i in 0..eh.e_shnum as usize {
        if let Some(sh) = read_at::<Elf64Shdr>(bytes, eh.e_shoff as usize + i * Elf64Shdr::SIZE) {
            if sh.sh_type == SHT_SYMTAB {
                symtab = Some(sh);
                break;
            }
        }
    }

    for si in 0..eh.e_shnum as usize {
        let Some(sh) = read_at::<Elf64Shdr>(bytes, eh.e_shoff as usize + si * Elf64Shdr::SIZE)
        else {
            continue;
        };
        if sh.sh_type != SHT_RELA || sh.sh_entsize as usize != Elf64Rela::SIZE {
            continue;
        }
        if sh.sh_offset as usize + sh.sh_size as usize > bytes.len() {
            continue;
        }

        let n = sh.sh_size as usize / Elf64Rela::SIZE;
        for i in 0..n {
            let Some(rela) =
                read_at::<Elf64Rela>(bytes, sh.sh_offset as usize + i * Elf64Rela::SIZE)
            else {
                break;
            };
            let Some(where_off) = map_va_to_off(rela.r_offset, 0, min_v, max_v, img_sz) else {
                continue;
            };

            match r_type(rela.r_info) {
                R_X86_64_RELATIVE => {
                    write_u64_at(image, where_off, base.wrapping_add(rela.r_addend as u64));
                }
                R_X86_64_64 => {
                    let Some(symtab) = symtab else { continue };
                    let n_syms = symtab.sh_size as usize / Elf64Sym::SIZE;
                    let idx = r_sym(rela.r_info) as usize;
                    if idx >= n_syms {
                        continue;
                    }
                    let Some(sym) = read_at::<Elf64Sym>(
                        bytes,
                        symtab.sh_offset as usize + idx * Elf64Sym::SIZE,
                    ) else {
                        continue;
                    };
                    let s = if sym.st_value != 0 {
                        map_va_to_off(sym.st_value, base, min_v, max_v, img_sz)
                            .map(|off| base + off)
                            .unwrap_or(0)
                    } else {
                        0
                    };
                    write_u64_at(image, where_off, s.wrapping_add(rela.r_addend as u64));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Find `sqrm_module_desc` via SHT_SYMTAB and validate it.
fn find_descriptor(
    bytes: &[u8],
    eh: &Elf64Header,
    image: &[u8],
    base: u64,
    min_v: u64,
    max_v: u64,
) -> Result<(u32, u32, String), SqrmError> {
    if eh.e_shoff == 0 || eh.e_shnum == 0 || eh.e_shentsize as usize != Elf64Shdr::SIZE {
        return Err(SqrmError::MissingDescriptor);
    }
    let sh_end = eh.e_shoff as usize + eh.e_shnum as usize * Elf64Shdr::SIZE;
    if sh_end > bytes.len() {
        return Err(SqrmError::MissingDescriptor);
    }
    let img_sz = image.len() as u64;

    // First SHT_SYMTAB and its linked string table
    let mut symtab: Option<Elf64Shdr> = None;
    for i in 0..eh.e_shnum as usize {
        if let Some(sh) = read_at::<Elf64Shdr>(bytes, eh.e_shoff as usize + i * Elf64Shdr::SIZE) {
            if sh.sh_type == SHT_SYMTAB {
                symtab = Some(sh);
                break;
            }
        }
    }
    let symtab = symtab.ok_or(SqrmError::MissingDescriptor)?;
    let strtab: Elf64Shdr = read_at(
        bytes,
        eh.e_shoff as usize + symtab.sh_link as usize * Elf64Shdr::SIZE,
    )
    .ok_or(SqrmError::MissingDescriptor)?;
    if strtab.sh_type != SHT_STRTAB {
        return Err(SqrmError::MissingDescriptor);
    }
    if symtab.sh_offset as usize + symtab.sh_size as usize > bytes.len()
        || strtab.sh_offset as usize + strtab.sh_size as usize > bytes.len()
    {
        return Err(SqrmError::MissingDescriptor);
    }

    let n_syms = symtab.sh_size as usize / Elf64Sym::SIZE;
    for i in 0..n_syms {
        let Some(sym) = read_at::<Elf64Sym>(bytes, symtab.sh_offset as usize + i * Elf64Sym::SIZE)
        else {
            break;
        };
        let name_off = strtab.sh_offset as usize + sym.st_name as usize;
        if sym.st_name as u64 >= strtab.sh_size {
            continue;
        }
        let name_bytes = &bytes[name_off..];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(0);
        if &name_bytes[..name_len] != DESC_SYMBOL.as_bytes() {
            continue;
        }

        // Descriptor layout: u32 abi_version, u32 type, u64 name pointer
        let off = map_va_to_off(sym.st_value, base, min_v, max_v, img_sz)
            .ok_or(SqrmError::MissingDescriptor)? as usize;
        if off + 16 > image.len() {
            return Err(SqrmError::MissingDescriptor);
        }
        let abi = u32::from_le_bytes([image[off], image[off + 1], image[off + 2], image[off + 3]]);
        let mtype =
            u32::from_le_bytes([image[off + 4], image[off + 5], image[off + 6], image[off + 7]]);
        let name_ptr = read_u64_at(image, off as u64 + 8);

        let name_off = map_va_to_off(name_ptr, base, min_v, max_v, img_sz)
            .ok_or(SqrmError::BadAbi)? as usize;
        let tail = &image[name_off..image.len().min(name_off + MAX_MODULE_NAME + 1)];
        let name_len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let name = core::str::from_utf8(&tail[..name_len])
            .map_err(|_| SqrmError::BadAbi)?
            .to_string();

        return Ok((abi, mtype, name));
    }

    Err(SqrmError::MissingDescriptor)
}

/// Stage a module image into `image` (zeroed, plan.image_size bytes at
/// virtual address `base`): copy segments, relocate, pull the
/// descriptor. Pure except for the buffers.
pub fn stage(
    bytes: &[u8],
    image: &mut [u8],
    base: u64,
) -> Result<StagedDesc, SqrmError> {
    let (eh, plan) = plan(bytes)?;
    debug_assert!(image.len() >= plan.image_size);

    copy_segments(bytes, &eh, image, plan.min_vaddr);

    // Dynamic relocations first (section headers may be stripped); the
    // section pass adds coverage for toolchains that keep them.
    let dyn_rc = apply_relocations_dynamic(
        bytes,
        &eh,
        image,
        base,
        plan.min_vaddr,
        plan.max_vaddr,
    );
    let sh_rc =
        apply_relocations_sections(bytes, &eh, image, base, plan.min_vaddr, plan.max_vaddr);
    if dyn_rc.is_err() && sh_rc.is_err() {
        crate::log_debug!("[SQRM] no relocation tables found (static module?)");
    }

    let (abi, mtype_raw, name) =
        find_descriptor(bytes, &eh, image, base, plan.min_vaddr, plan.max_vaddr)?;

    if abi != SQRM_ABI_VERSION {
        return Err(SqrmError::BadAbi);
    }
    let module_type = ModuleType::from_u32(mtype_raw).ok_or(SqrmError::BadAbi)?;
    if name.is_empty() {
        return Err(SqrmError::BadAbi);
    }

    Ok(StagedDesc {
        abi_version: abi,
        module_type,
        name,
        entry_offset: plan.entry - plan.min_vaddr,
    })
}

// ----------------------------------------------------------------------
// Kernel load path
// ----------------------------------------------------------------------

fn already_loaded_file(basename: &str) -> bool {
    MODULES.lock().iter().any(|m| m.file_name == basename)
}

fn name_in_use(name: &str) -> bool {
    let modules = MODULES.lock();
    modules.iter().any(|m| {
        let stored = &m.name[..m.name.len().saturating_sub(1)];
        stored == name.as_bytes()
    })
}

fn load_one(boot_slot: usize, path: &str, basename: &str) -> Result<(), SqrmError> {
    if already_loaded_file(basename) {
        return Ok(());
    }
    if MODULES.lock().len() >= MAX_MODULES {
        return Err(SqrmError::TooManyModules);
    }

    let bytes = crate::fs::read_file(boot_slot, path).map_err(|_| SqrmError::Io)?;
    let (_, plan) = self::plan(&bytes)?;

    // The image lives in identity-mapped frames: physically contiguous,
    // page-aligned and executable (the identity window carries no NX).
    let image_buf =
        crate::memory::dma::dma_alloc(plan.image_size, 4096).ok_or(SqrmError::NoMemory)?;
    let image =
        unsafe { core::slice::from_raw_parts_mut(image_buf.virt as *mut u8, plan.image_size) };
    image.fill(0);

    let desc = match stage(&bytes, image, image_buf.virt) {
        Ok(d) => d,
        Err(e) => {
            crate::memory::dma::dma_free(image_buf);
            return Err(e);
        }
    };

    if name_in_use(&desc.name) {
        crate::log_error!("[SQRM] duplicate module name '{}' refused", desc.name);
        crate::memory::dma::dma_free(image_buf);
        return Err(SqrmError::DuplicateName);
    }

    crate::log!(
        "[SQRM] Loading module: {} (type={:?} name={})",
        basename,
        desc.module_type,
        desc.name
    );

    // NUL-terminated copy of the name; the API table points at it
    let mut name_bytes = Vec::with_capacity(desc.name.len() + 1);
    name_bytes.extend_from_slice(desc.name.as_bytes());
    name_bytes.push(0);
    let name_box: Box<[u8]> = name_bytes.into_boxed_slice();

    let api_box = Box::new(api::build(desc.module_type, name_box.as_ptr()));

    let entry_addr = image_buf.virt + desc.entry_offset;
    let init: InitFn = unsafe { core::mem::transmute(entry_addr as *const ()) };
    let rc = init(&*api_box as *const KernelApi);
    crate::log!("[SQRM] init returned: {}", rc);

    if rc != 0 {
        crate::memory::dma::dma_free(image_buf);
        return Err(SqrmError::InitFailed);
    }

    MODULES.lock().push(LoadedModule {
        file_name: basename.to_string(),
        name: name_box,
        module_type: desc.module_type,
        image: image_buf,
        api: api_box,
    });
    Ok(())
}

/// Load every `*.sqrm` from the module directory on the boot
/// filesystem. Safe to call repeatedly; loaded modules are skipped.
pub fn load_all(boot_slot: usize) {
    let entries = match crate::fs::read_dir(boot_slot, MODULE_DIR) {
        Ok(e) => e,
        Err(_) => {
            crate::log!("[SQRM] No module directory: {}", MODULE_DIR);
            return;
        }
    };

    let mut loaded_any = false;
    for entry in entries {
        if entry.is_directory || !entry.name.ends_with(".sqrm") {
            continue;
        }
        let mut path = String::from(MODULE_DIR);
        path.push('/');
        path.push_str(&entry.name);

        match load_one(boot_slot, &path, &entry.name) {
            Ok(()) => loaded_any = true,
            Err(e) => {
                crate::log_error!("[SQRM] failed to load {}: {:?}", entry.name, e);
            }
        }
    }

    if !loaded_any {
        crate::log!("[SQRM] No modules loaded");
    }
}

/// Number of committed modules
pub fn loaded_count() -> usize {
    MODULES.lock().len()
}

/// Names and types of committed modules (diagnostics)
pub fn loaded_modules() -> Vec<(String, ModuleType)> {
    let modules = MODULES.lock();
    modules
        .iter()
        .map(|m| {
            let name = core::str::from_utf8(&m.name[..m.name.len() - 1])
                .unwrap_or("?")
                .to_string();
            (name, m.module_type)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// Build a minimal ET_DYN module image:
    /// one PT_LOAD at vaddr 0 (0x100 bytes, like a real shared object),
    /// a symtab/strtab pair exporting `sqrm_module_desc` at VA 0, the
    /// descriptor's name at VA 0x10, the entry at VA 0x20, and one RELA
    /// section relocating the descriptor's name pointer.
    fn build_module(e_machine: u16, e_type: u16, abi: u32, mtype: u32) -> Vec<u8> {
        let mut f = vec![0u8; 0x600];

        // Payload (file offset 0x200 <-> vaddr 0)
        // Descriptor at VA 0: abi, type, name ptr (VA 0x10)
        f[0x200..0x204].copy_from_slice(&abi.to_le_bytes());
        f[0x204..0x208].copy_from_slice(&mtype.to_le_bytes());
        f[0x208..0x210].copy_from_slice(&0x10u64.to_le_bytes());
        // Name at VA 0x10
        f[0x210..0x216].copy_from_slice(b"hello\0");
        // Entry at VA 0x20: ret (never executed by the tests)
        f[0x220] = 0xC3;

        // Symbol table at 0x300: null symbol + descriptor symbol
        let sym_off = 0x300;
        let desc_sym = sym_off + Elf64Sym::SIZE;
        f[desc_sym..desc_sym + 4].copy_from_slice(&1u32.to_le_bytes()); // st_name
        f[desc_sym + 8..desc_sym + 16].copy_from_slice(&0u64.to_le_bytes()); // st_value

        // String table at 0x350: "\0sqrm_module_desc\0"
        let str_off = 0x350;
        f[str_off] = 0;
        f[str_off + 1..str_off + 1 + DESC_SYMBOL.len()].copy_from_slice(DESC_SYMBOL.as_bytes());

        // RELA at 0x380: relocate the name pointer field at VA 0x8
        let rela_off = 0x380;
        f[rela_off..rela_off + 8].copy_from_slice(&0x8u64.to_le_bytes()); // r_offset
        let r_info = (R_X86_64_RELATIVE as u64) & 0xFFFF_FFFF;
        f[rela_off + 8..rela_off + 16].copy_from_slice(&r_info.to_le_bytes());
        f[rela_off + 16..rela_off + 24].copy_from_slice(&0x10i64.to_le_bytes()); // addend

        // Section headers at 0x400: null, symtab, strtab, rela
        let shoff = 0x400;
        let mut write_shdr = |idx: usize, sh_type: u32, off: u64, size: u64, link: u32, entsize: u64| {
            let base = shoff + idx * Elf64Shdr::SIZE;
            f[base + 4..base + 8].copy_from_slice(&sh_type.to_le_bytes());
            f[base + 24..base + 32].copy_from_slice(&off.to_le_bytes());
            f[base + 32..base + 40].copy_from_slice(&size.to_le_bytes());
            f[base + 40..base + 44].copy_from_slice(&link.to_le_bytes());
            f[base + 56..base + 64].copy_from_slice(&entsize.to_le_bytes());
        };
        write_shdr(1, SHT_SYMTAB, sym_off as u64, (2 * Elf64Sym::SIZE) as u64, 2, Elf64Sym::SIZE as u64);
        write_shdr(2, SHT_STRTAB, str_off as u64, 32, 0, 0);
        write_shdr(3, SHT_RELA, rela_off as u64, Elf64Rela::SIZE as u64, 1, Elf64Rela::SIZE as u64);

        // Program header at 0x40: PT_LOAD file 0x200..0x300 -> VA 0
        let phoff = 0x40;
        f[phoff..phoff + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        f[phoff + 8..phoff + 16].copy_from_slice(&0x200u64.to_le_bytes()); // p_offset
        f[phoff + 16..phoff + 24].copy_from_slice(&0u64.to_le_bytes()); // p_vaddr
        f[phoff + 32..phoff + 40].copy_from_slice(&0x100u64.to_le_bytes()); // p_filesz
        f[phoff + 40..phoff + 48].copy_from_slice(&0x100u64.to_le_bytes()); // p_memsz

        // ELF header
        f[0..4].copy_from_slice(&ELF_MAGIC);
        f[4] = ELFCLASS64;
        f[5] = ELFDATA2LSB;
        f[16..18].copy_from_slice(&e_type.to_le_bytes());
        f[18..20].copy_from_slice(&e_machine.to_le_bytes());
        f[24..32].copy_from_slice(&0x20u64.to_le_bytes()); // e_entry
        f[32..40].copy_from_slice(&(phoff as u64).to_le_bytes()); // e_phoff
        f[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
        f[54..56].copy_from_slice(&(Elf64Phdr::SIZE as u16).to_le_bytes()); // e_phentsize
        f[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        f[58..60].copy_from_slice(&(Elf64Shdr::SIZE as u16).to_le_bytes()); // e_shentsize
        f[60..62].copy_from_slice(&4u16.to_le_bytes()); // e_shnum

        f
    }

    #[test]
    fn test_plan_accepts_valid_module() {
        let bytes = build_module(EM_X86_64, ET_DYN, 1, 3);
        let (_, plan) = plan(&bytes).unwrap();
        assert_eq!(plan.min_vaddr, 0);
        assert_eq!(plan.max_vaddr, 0x100);
        assert_eq!(plan.image_size, 0x1000);
        assert_eq!(plan.entry, 0x20);
    }

    #[test]
    fn test_plan_rejects_wrong_machine() {
        // e_machine != x86_64 is rejected with no commit
        let bytes = build_module(40 /* ARM */, ET_DYN, 1, 3);
        assert_eq!(plan(&bytes).unwrap_err(), SqrmError::BadElf);
    }

    #[test]
    fn test_plan_rejects_non_dyn() {
        let bytes = build_module(EM_X86_64, 2 /* ET_EXEC */, 1, 3);
        assert_eq!(plan(&bytes).unwrap_err(), SqrmError::BadElf);
    }

    #[test]
    fn test_stage_extracts_descriptor() {
        let bytes = build_module(EM_X86_64, ET_DYN, 1, 3);
        let mut image = vec![0u8; 0x1000];
        let base = 0x40_0000u64; // arbitrary load address
        let desc = stage(&bytes, &mut image, base).unwrap();

        assert_eq!(desc.abi_version, 1);
        assert_eq!(desc.module_type, ModuleType::Usb);
        assert_eq!(desc.name, "hello");
        assert_eq!(desc.entry_offset, 0x20);

        // The RELATIVE relocation rewrote the name pointer to base+0x10
        let ptr = u64::from_le_bytes(image[8..16].try_into().unwrap());
        assert_eq!(ptr, base + 0x10);
    }

    #[test]
    fn test_stage_rejects_bad_abi_and_type() {
        let bytes = build_module(EM_X86_64, ET_DYN, 9, 3);
        let mut image = vec![0u8; 0x1000];
        assert_eq!(stage(&bytes, &mut image, 0x40_0000).unwrap_err(), SqrmError::BadAbi);

        let bytes = build_module(EM_X86_64, ET_DYN, 1, 7);
        let mut image = vec![0u8; 0x1000];
        assert_eq!(stage(&bytes, &mut image, 0x40_0000).unwrap_err(), SqrmError::BadAbi);
    }

    #[test]
    fn test_va_mapping_tolerates_image_relative() {
        // Absolute inside the loaded image
        assert_eq!(map_va_to_off(0x40_0010, 0x40_0000, 0x1000, 0x1100, 0x1000), Some(0x10));
        // VA inside [min_v, max_v)
        assert_eq!(map_va_to_off(0x1004, 0x40_0000, 0x1000, 0x1100, 0x1000), Some(4));
        // Bare image-relative offset
        assert_eq!(map_va_to_off(0x80, 0x40_0000, 0x1000, 0x1100, 0x1000), Some(0x80));
        // Out of every range
        assert_eq!(map_va_to_off(0x9_0000, 0x40_0000, 0x1000, 0x1100, 0x1000), None);
    }
}
