//! CPU context and the context-switch primitive
//!
//! The saved state holds the six SysV callee-saved GPRs plus RIP, RSP and
//! RFLAGS. Field order and offsets MUST match the assembly below:
//! r15(0) r14(8) r13(16) r12(24) rbx(32) rbp(40) rip(48) rsp(56) rflags(64).

use core::arch::naked_asm;

/// Saved CPU state for a process
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct CpuState {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

/// RFLAGS value for a fresh context: IF set, reserved bit 1 set
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Switch from `old` to `new`.
///
/// Saves the callee-saved registers, the return address (as RIP), the
/// post-return RSP and RFLAGS into `old`, then loads `new` and jumps.
/// Interrupts must be disabled by the caller; IF comes back with the
/// incoming context's saved RFLAGS.
///
/// # Safety
/// Both pointers must reference valid, pinned `CpuState` records and the
/// new context's stack and RIP must be valid to resume.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut CpuState, new: *const CpuState) {
    naked_asm!(
        // Save outgoing state (rdi = old)
        "mov [rdi + 0], r15",
        "mov [rdi + 8], r14",
        "mov [rdi + 16], r13",
        "mov [rdi + 24], r12",
        "mov [rdi + 32], rbx",
        "mov [rdi + 40], rbp",
        "mov rax, [rsp]",          // return address becomes saved RIP
        "mov [rdi + 48], rax",
        "lea rax, [rsp + 8]",      // RSP after the return
        "mov [rdi + 56], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 64], rax",
        // Load incoming state (rsi = new)
        "mov r15, [rsi + 0]",
        "mov r14, [rsi + 8]",
        "mov r13, [rsi + 16]",
        "mov r12, [rsi + 24]",
        "mov rbx, [rsi + 32]",
        "mov rbp, [rsi + 40]",
        "mov rsp, [rsi + 56]",
        "mov rax, [rsi + 64]",
        "push rax",
        "popfq",                   // restores IF from the incoming context
        "mov rax, [rsi + 48]",
        "jmp rax",
    );
}

/// First instruction of every kernel thread.
///
/// `process_create` seeds R12 with the entry function; when the thread
/// function returns, the process exits with code 0.
#[unsafe(naked)]
pub unsafe extern "C" fn kthread_trampoline() {
    naked_asm!(
        "call r12",
        "xor edi, edi",
        "call {exit}",
        exit = sym kthread_exit,
    );
}

extern "C" fn kthread_exit(code: i32) -> ! {
    crate::process::exit(code)
}

/// First instruction of every user process: drop to ring 3 via IRETQ.
///
/// Seeded registers: R12 = user RIP, R13 = user RSP.
#[unsafe(naked)]
pub unsafe extern "C" fn user_entry_trampoline() {
    naked_asm!(
        "call {prepare}",          // returns user SS in rax, user CS in rdx
        "push rax",                // SS
        "push r13",                // user RSP
        "push {rflags}",           // RFLAGS with IF set
        "push rdx",                // CS
        "push r12",                // user RIP
        "iretq",
        prepare = sym prepare_user_entry,
        rflags = const INITIAL_RFLAGS,
    );
}

/// Returns (user SS, user CS) in (rax, rdx) for the IRETQ frame.
extern "C" fn prepare_user_entry() -> u128 {
    let ss = crate::gdt::user_data_selector().0 as u128;
    let cs = crate::gdt::user_code_selector().0 as u128;
    // SysV returns u128 in rax:rdx
    ss | (cs << 64)
}
