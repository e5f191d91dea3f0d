//! Round-robin scheduler
//!
//! The ready list is a queue of pids into the fixed process table. The
//! timer ISR burns the running process's slice and sets the reschedule
//! flag; the switch itself happens on IRQ return or at the explicit
//! yield/sleep/exit/wait points. Priorities only scale the initial time
//! slice.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::context::{context_switch, CpuState};
use super::{fpu, Pid, ProcessState};

/// Base quantum in ticks (10 ms each)
const QUANTUM_BASE: u64 = 5;

static READY: Mutex<VecDeque<Pid>> = Mutex::new(VecDeque::new());

/// Set by the timer ISR when the running slice expires
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Terminated processes waiting for reclamation
static REAP_LIST: Mutex<Vec<Pid>> = Mutex::new(Vec::new());

/// Scratch save area for contexts that will never resume
static mut DEAD_CTX: CpuState = CpuState {
    r15: 0,
    r14: 0,
    r13: 0,
    r12: 0,
    rbx: 0,
    rbp: 0,
    rip: 0,
    rsp: 0,
    rflags: 0,
};

/// Initial time slice for a priority level (0 = highest)
pub fn quantum_for_priority(priority: i32) -> u64 {
    QUANTUM_BASE * (4 - priority.clamp(0, 3)) as u64
}

/// Pre-size the queues so the timer ISR never has to grow them
/// (an allocation inside the ISR could spin on the heap lock).
pub fn init() {
    let _irq = crate::interrupts::IrqGuard::new();
    READY.lock().reserve(super::MAX_PROCESSES);
    REAP_LIST.lock().reserve(super::MAX_PROCESSES);
}

/// Add a process to the ready list
pub fn add(pid: Pid) {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut ready = READY.lock();
    if !ready.contains(&pid) {
        ready.push_back(pid);
    }
}

/// Ask for a reschedule at the next safe point
pub fn request_reschedule() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

/// Timer ISR hook: wake expired sleepers, burn the current slice.
/// Runs with interrupts disabled.
pub fn on_timer_tick(now: u64) {
    // Wake sleepers whose deadline has passed
    let mut woken = [0 as Pid; 16];
    let mut n = 0;
    super::each_process(|p| {
        if p.state == ProcessState::Sleeping && p.sleep_until <= now && n < woken.len() {
            p.state = ProcessState::Ready;
            woken[n] = p.pid;
            n += 1;
        }
    });
    for &pid in &woken[..n] {
        READY.lock().push_back(pid);
    }

    // Burn the running process's slice
    let expired = super::with_process(super::current_pid(), |p| {
        p.total_time += 1;
        p.time_slice = p.time_slice.saturating_sub(1);
        p.time_slice == 0
    })
    .unwrap_or(false);

    if expired {
        request_reschedule();
    }
}

/// Consume the reschedule flag on the way out of an IRQ.
pub fn preempt_if_requested() {
    if NEED_RESCHED.swap(false, Ordering::Relaxed) {
        schedule();
    }
}

fn reap_pending() {
    // Drain by popping so the list keeps its reserved capacity
    loop {
        let pid = REAP_LIST.lock().pop();
        match pid {
            Some(pid) => super::reap(pid),
            None => break,
        }
    }
}

/// Pick the next Ready process and switch to it.
///
/// Interrupts are disabled across the critical window; the incoming
/// context re-enables them through its saved RFLAGS.
pub fn schedule() {
    let _irq = crate::interrupts::IrqGuard::new();

    reap_pending();

    let current = super::current_pid();

    // Pick the next runnable pid, dropping dead entries on the way
    let next = loop {
        let candidate = READY.lock().pop_front();
        let Some(pid) = candidate else { break None };
        match super::with_process(pid, |p| p.state) {
            Some(ProcessState::Ready) => break Some(pid),
            Some(ProcessState::Terminated) => super::reap(pid),
            Some(_) => {} // Blocked/Sleeping/Zombie: re-added on wake
            None => {}    // already gone
        }
    };

    let Some(next) = next else {
        // Nothing else runnable: stay with the current context
        return;
    };

    if next == current {
        super::refill_slice(current);
        super::set_state(current, ProcessState::Running);
        return;
    }

    // Requeue or retire the outgoing process
    let old_state = super::with_process(current, |p| p.state);
    let old_ctx: *mut CpuState = match old_state {
        Some(ProcessState::Running) | Some(ProcessState::Ready) => {
            super::set_state(current, ProcessState::Ready);
            READY.lock().push_back(current);
            match super::switch_info(current) {
                Some((ctx, _, _, _)) => ctx,
                None => core::ptr::addr_of_mut!(DEAD_CTX),
            }
        }
        Some(ProcessState::Terminated) => {
            // The dead context's save is discarded; reclaim on the next pass
            REAP_LIST.lock().push(current);
            core::ptr::addr_of_mut!(DEAD_CTX)
        }
        _ => {
            // Sleeping/Blocked/Zombie keep their slot; save normally
            match super::switch_info(current) {
                Some((ctx, _, _, _)) => ctx,
                None => core::ptr::addr_of_mut!(DEAD_CTX),
            }
        }
    };

    let Some((new_ctx, new_kstack, new_is_user, _)) = super::switch_info(next) else {
        return;
    };

    super::set_state(next, ProcessState::Running);
    super::refill_slice(next);
    super::set_current_pid(next);

    crate::gdt::set_kernel_stack(new_kstack);
    fpu::on_context_switch(next, new_is_user);

    unsafe {
        context_switch(old_ctx, new_ctx);
    }
    // Execution resumes here when this context is scheduled again.
}

/// Scheduler statistics
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub ready_count: usize,
    pub current: Pid,
}

pub fn stats() -> SchedulerStats {
    let _irq = crate::interrupts::IrqGuard::new();
    SchedulerStats {
        ready_count: READY.lock().len(),
        current: super::current_pid(),
    }
}
