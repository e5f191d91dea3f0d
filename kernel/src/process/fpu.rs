//! Lazy FPU/SSE state switching
//!
//! The live FPU state belongs to at most one user process. Context
//! switches never touch it; they only arm CR0.TS for user processes that
//! are not the current owner. The first FPU instruction then traps with
//! #NM, where ownership actually moves via FXSAVE/FXRSTOR.
//!
//! Kernel threads never participate: TS is cleared on any non-user
//! switch, because kernel routines (memcpy, formatting) may use SSE and
//! the #NM handler itself runs fxsave/fxrstor.

use core::sync::atomic::{AtomicU32, Ordering};

/// 512-byte FXSAVE area, 16-byte aligned as fxsave64 requires
#[derive(Clone)]
#[repr(C, align(16))]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub const fn zeroed() -> Self {
        Self([0; 512])
    }
}

/// PID owning the live FPU state (0 = none)
static FPU_OWNER: AtomicU32 = AtomicU32::new(0);

fn set_ts() {
    unsafe {
        let mut cr0: u64;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nostack, preserves_flags));
        cr0 |= 1 << 3; // TS
        core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
    }
}

fn clear_ts() {
    unsafe {
        core::arch::asm!("clts", options(nostack, preserves_flags));
    }
}

unsafe fn fxsave(area: *mut FpuState) {
    core::arch::asm!("fxsave64 [{}]", in(reg) area, options(nostack));
}

unsafe fn fxrstor(area: *const FpuState) {
    core::arch::asm!("fxrstor64 [{}]", in(reg) area, options(nostack));
}

/// Context-switch hook: arm or disarm the #NM trap for the incoming
/// process.
pub fn on_context_switch(next_pid: u32, next_is_user: bool) {
    if !next_is_user {
        clear_ts();
        return;
    }
    if FPU_OWNER.load(Ordering::Relaxed) == next_pid {
        clear_ts();
    } else {
        set_ts();
    }
}

/// Process-exit hook: a dead owner leaves no live state behind.
pub fn on_process_exit(pid: u32) {
    if FPU_OWNER.load(Ordering::Relaxed) == pid {
        FPU_OWNER.store(0, Ordering::Relaxed);
        set_ts();
    }
}

/// #NM handler body: move FPU ownership to the current process.
pub fn handle_nm() {
    let pid = crate::process::current_pid();
    let is_user = crate::process::current_is_user();

    if !is_user {
        // Kernel code should not run with TS set; clear and continue.
        clear_ts();
        return;
    }

    clear_ts();

    let owner = FPU_OWNER.load(Ordering::Relaxed);
    if owner == pid {
        return;
    }

    if owner != 0 {
        if let Some(area) = crate::process::fpu_area_ptr(owner) {
            unsafe { fxsave(area) };
        }
    }

    if let Some(area) = crate::process::fpu_area_ptr(pid) {
        unsafe { fxrstor(area as *const FpuState) };
    }
    FPU_OWNER.store(pid, Ordering::Relaxed);
}
