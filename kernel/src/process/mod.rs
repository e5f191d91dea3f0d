//! Process Manager
//!
//! Fixed process table, PID allocation, process lifecycle and the
//! per-process resources: kernel stack, user stack, FPU save area,
//! user heap (sbrk) and mmap windows, working directory and the
//! current filesystem mount slot.

pub mod context;
pub mod fpu;
pub mod scheduler;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

pub use context::CpuState;
use fpu::FpuState;

/// Process ID type
pub type Pid = u32;

/// Maximum number of live processes
pub const MAX_PROCESSES: usize = 256;
/// Kernel stack size per process
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;
/// User stack size
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// The boot/idle kernel context
pub const PID_KERNEL: Pid = 0;

/// Process state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Ready to run
    Ready,
    /// Currently executing
    Running,
    /// Waiting for I/O or a child
    Blocked,
    /// Timed wait until `sleep_until`
    Sleeping,
    /// Exited, waiting to be reaped by the parent
    Zombie,
    /// Killed; reclaimed on the next scheduler pass
    Terminated,
}

/// A user-heap allocation made through the MALLOC syscall
#[derive(Clone, Copy, Debug)]
struct UserAlloc {
    addr: u64,
    pages: u64,
}

/// Process Control Block
pub struct Process {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub state: ProcessState,
    /// Defined only in Zombie/Terminated
    pub exit_code: i32,
    pub cpu_state: CpuState,
    pub fpu_state: Box<FpuState>,
    /// Page table root (CR3); 0 = the global kernel tree
    pub page_table: u64,
    kernel_stack: Box<[u8]>,
    pub is_user: bool,
    pub user_rip: u64,
    pub user_rsp: u64,
    /// User heap (sbrk)
    pub user_heap_base: u64,
    pub user_heap_end: u64,
    pub user_heap_limit: u64,
    /// User mmap region
    pub user_mmap_base: u64,
    pub user_mmap_end: u64,
    pub user_mmap_limit: u64,
    user_allocs: Vec<UserAlloc>,
    /// Remaining scheduler ticks
    pub time_slice: u64,
    pub total_time: u64,
    /// 0 = highest
    pub priority: i32,
    /// Wakeup deadline in ticks while Sleeping
    pub sleep_until: u64,
    pub argv: Vec<String>,
    pub cwd: String,
    /// Currently active filesystem mount slot (-1 = none)
    pub current_slot: i32,
}

impl Process {
    fn kernel_stack_top(&self) -> u64 {
        let base = self.kernel_stack.as_ptr() as u64;
        (base + self.kernel_stack.len() as u64) & !0xF
    }
}

struct ProcessTable {
    slots: [Option<Box<Process>>; MAX_PROCESSES],
}

impl ProcessTable {
    fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots
            .iter()
            .flatten()
            .find(|p| p.pid == pid)
            .map(|b| &**b)
    }

    fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.pid == pid)
            .map(|b| &mut **b)
    }

    fn insert(&mut self, proc: Box<Process>) -> Result<(), Box<Process>> {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(proc);
                return Ok(());
            }
        }
        Err(proc)
    }

    fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|p| p.pid) == Some(pid) {
                return slot.take();
            }
        }
        None
    }
}

const NONE_PROC: Option<Box<Process>> = None;

static TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable {
    slots: [NONE_PROC; MAX_PROCESSES],
});

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static CURRENT_PID: AtomicU32 = AtomicU32::new(PID_KERNEL);

/// Register the boot thread as process 0 and start the scheduler.
pub fn init() {
    let kernel = Box::new(Process {
        pid: PID_KERNEL,
        parent_pid: PID_KERNEL,
        name: String::from("kernel"),
        uid: 0,
        gid: 0,
        state: ProcessState::Running,
        exit_code: 0,
        cpu_state: CpuState::default(),
        fpu_state: Box::new(FpuState::zeroed()),
        page_table: crate::memory::paging::kernel_pml4(),
        kernel_stack: vec![0u8; 64].into_boxed_slice(), // boot stack is external
        is_user: false,
        user_rip: 0,
        user_rsp: 0,
        user_heap_base: 0,
        user_heap_end: 0,
        user_heap_limit: 0,
        user_mmap_base: 0,
        user_mmap_end: 0,
        user_mmap_limit: 0,
        user_allocs: Vec::new(),
        time_slice: scheduler::quantum_for_priority(0),
        total_time: 0,
        priority: 0,
        sleep_until: 0,
        argv: Vec::new(),
        cwd: String::from("/"),
        current_slot: 0,
    });

    {
        let _irq = crate::interrupts::IrqGuard::new();
        TABLE
            .lock()
            .insert(kernel)
            .ok()
            .expect("process table full at init");
    }
    CURRENT_PID.store(PID_KERNEL, Ordering::SeqCst);
    scheduler::init();

    crate::log!("[PROC] Process table ready ({} slots)", MAX_PROCESSES);
}

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

fn new_process(name: &str, priority: i32, argv: Vec<String>) -> Box<Process> {
    let parent = current_pid();
    let (cwd, slot) = with_process(parent, |p| (p.cwd.clone(), p.current_slot))
        .unwrap_or((String::from("/"), 0));

    Box::new(Process {
        pid: alloc_pid(),
        parent_pid: parent,
        name: String::from(name),
        uid: 0,
        gid: 0,
        state: ProcessState::Ready,
        exit_code: 0,
        cpu_state: CpuState::default(),
        fpu_state: Box::new(FpuState::zeroed()),
        page_table: crate::memory::paging::kernel_pml4(),
        kernel_stack: vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        is_user: false,
        user_rip: 0,
        user_rsp: 0,
        user_heap_base: 0,
        user_heap_end: 0,
        user_heap_limit: 0,
        user_mmap_base: crate::memory::USER_MMAP_BASE,
        user_mmap_end: crate::memory::USER_MMAP_BASE,
        user_mmap_limit: crate::memory::USER_STACK_TOP,
        user_allocs: Vec::new(),
        time_slice: scheduler::quantum_for_priority(priority),
        total_time: 0,
        priority,
        sleep_until: 0,
        argv,
        cwd,
        current_slot: slot,
    })
}

/// Create a kernel thread. The entry function runs until it returns,
/// then the process exits with code 0.
pub fn process_create(name: &str, entry: fn(), priority: i32) -> Option<Pid> {
    process_create_with_args(name, entry, priority, Vec::new())
}

/// Create a kernel thread with arguments (visible through `argv`).
pub fn process_create_with_args(
    name: &str,
    entry: fn(),
    priority: i32,
    argv: Vec<String>,
) -> Option<Pid> {
    let mut proc = new_process(name, priority, argv);
    let pid = proc.pid;

    proc.cpu_state.rip = context::kthread_trampoline as usize as u64;
    proc.cpu_state.rsp = proc.kernel_stack_top();
    proc.cpu_state.r12 = entry as usize as u64;
    proc.cpu_state.rflags = context::INITIAL_RFLAGS;

    let inserted = {
        let _irq = crate::interrupts::IrqGuard::new();
        TABLE.lock().insert(proc).is_ok()
    };
    if !inserted {
        crate::log_error!("[PROC] table full, cannot create '{}'", name);
        return None;
    }
    scheduler::add(pid);
    crate::log_debug!("[PROC] created '{}' pid={} prio={}", name, pid, priority);
    Some(pid)
}

/// Create a user process around an already-mapped image.
///
/// `exec` maps the segments and the user stack before calling this.
pub fn process_create_user(
    name: &str,
    user_rip: u64,
    user_rsp: u64,
    heap_base: u64,
    heap_limit: u64,
    priority: i32,
    argv: Vec<String>,
) -> Option<Pid> {
    let mut proc = new_process(name, priority, argv);
    let pid = proc.pid;

    proc.is_user = true;
    proc.user_rip = user_rip;
    proc.user_rsp = user_rsp;
    proc.user_heap_base = heap_base;
    proc.user_heap_end = heap_base;
    proc.user_heap_limit = heap_limit;

    proc.cpu_state.rip = context::user_entry_trampoline as usize as u64;
    proc.cpu_state.rsp = proc.kernel_stack_top();
    proc.cpu_state.r12 = user_rip;
    proc.cpu_state.r13 = user_rsp;
    proc.cpu_state.rflags = context::INITIAL_RFLAGS;

    let inserted = {
        let _irq = crate::interrupts::IrqGuard::new();
        TABLE.lock().insert(proc).is_ok()
    };
    if !inserted {
        crate::log_error!("[PROC] table full, cannot create user '{}'", name);
        return None;
    }
    scheduler::add(pid);
    crate::log!("[PROC] user process '{}' pid={} entry={:#x}", name, pid, user_rip);
    Some(pid)
}

/// PID of the running process
pub fn current_pid() -> Pid {
    CURRENT_PID.load(Ordering::Relaxed)
}

pub(crate) fn set_current_pid(pid: Pid) {
    CURRENT_PID.store(pid, Ordering::Relaxed);
}

/// Is the running process a user process?
pub fn current_is_user() -> bool {
    with_process(current_pid(), |p| p.is_user).unwrap_or(false)
}

/// Run a closure against a process record
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut table = TABLE.lock();
    table.get_mut(pid).map(f)
}

/// Run a closure over every live process record
pub(crate) fn each_process(mut f: impl FnMut(&mut Process)) {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut table = TABLE.lock();
    for p in table.slots.iter_mut().flatten() {
        f(p);
    }
}

/// Raw pointer to a process's FPU save area (for the #NM handler)
pub fn fpu_area_ptr(pid: Pid) -> Option<*mut FpuState> {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut table = TABLE.lock();
    table
        .get_mut(pid)
        .map(|p| &mut *p.fpu_state as *mut FpuState)
}

/// Does the pid name a live process?
pub fn exists(pid: Pid) -> bool {
    let _irq = crate::interrupts::IrqGuard::new();
    TABLE.lock().get(pid).is_some()
}

/// Number of live processes
pub fn count() -> usize {
    let _irq = crate::interrupts::IrqGuard::new();
    TABLE.lock().slots.iter().flatten().count()
}

/// Snapshot of (pid, name, state, total_time) for diagnostics
pub fn snapshot() -> Vec<(Pid, String, ProcessState, u64)> {
    let _irq = crate::interrupts::IrqGuard::new();
    let table = TABLE.lock();
    table
        .slots
        .iter()
        .flatten()
        .map(|p| (p.pid, p.name.clone(), p.state, p.total_time))
        .collect()
}

/// Voluntarily give up the CPU: clears the slice and reschedules.
pub fn yield_now() {
    with_process(current_pid(), |p| p.time_slice = 0);
    scheduler::schedule();
}

/// Timed wait: Sleeping until the deadline tick, then Ready again.
pub fn sleep(ms: u64) {
    if ms == 0 {
        yield_now();
        return;
    }
    let deadline = crate::time::ticks() + crate::time::ms_to_ticks(ms);
    with_process(current_pid(), |p| {
        p.state = ProcessState::Sleeping;
        p.sleep_until = deadline;
    });
    scheduler::schedule();
}

/// Block the current process (I/O wait).
pub fn block_current() {
    with_process(current_pid(), |p| p.state = ProcessState::Blocked);
    scheduler::schedule();
}

/// Wake a Sleeping or Blocked process.
pub fn wake(pid: Pid) {
    let woke = with_process(pid, |p| {
        if p.state == ProcessState::Sleeping || p.state == ProcessState::Blocked {
            p.state = ProcessState::Ready;
            true
        } else {
            false
        }
    })
    .unwrap_or(false);
    if woke {
        scheduler::add(pid);
    }
}

/// Exit the current process. Releases its file descriptors, drops FPU
/// ownership, marks it Zombie for the parent and never returns.
pub fn exit(code: i32) -> ! {
    let pid = current_pid();
    if pid == PID_KERNEL {
        panic!("kernel idle process attempted to exit ({})", code);
    }

    crate::fs::fd::close_all(pid);
    fpu::on_process_exit(pid);

    let parent = with_process(pid, |p| {
        p.state = ProcessState::Zombie;
        p.exit_code = code;
        p.parent_pid
    })
    .unwrap_or(PID_KERNEL);

    // A parent blocked in wait() gets its child back now
    wake(parent);

    crate::log_debug!("[PROC] pid {} exited with {}", pid, code);
    scheduler::schedule();
    unreachable!("scheduled back into a zombie");
}

/// Mark a process Terminated; the scheduler reclaims it on its next pass.
pub fn kill(pid: Pid, _sig: i32) -> Result<(), ()> {
    if pid == PID_KERNEL {
        return Err(());
    }
    let found = with_process(pid, |p| {
        p.state = ProcessState::Terminated;
        p.exit_code = -1;
    });
    match found {
        Some(()) => {
            crate::fs::fd::close_all(pid);
            fpu::on_process_exit(pid);
            Ok(())
        }
        None => Err(()),
    }
}

/// Fault path: kill the running user process and never come back to the
/// faulting context.
pub fn kill_current_and_reschedule(code: i32) -> ! {
    let pid = current_pid();
    crate::fs::fd::close_all(pid);
    fpu::on_process_exit(pid);
    with_process(pid, |p| {
        p.state = ProcessState::Terminated;
        p.exit_code = code;
    });
    scheduler::schedule();
    unreachable!("scheduled back into a terminated process");
}

/// Reap one Zombie child of the current process.
///
/// Returns (pid, exit_code), or None if the caller has no children at
/// all. Blocks while children exist but none has exited yet.
pub fn wait() -> Option<(Pid, i32)> {
    let me = current_pid();
    loop {
        let mut reaped: Option<(Pid, i32)> = None;
        let mut have_children = false;
        {
            let _irq = crate::interrupts::IrqGuard::new();
            let mut table = TABLE.lock();
            let mut zombie_pid = None;
            for p in table.slots.iter().flatten() {
                if p.parent_pid == me && p.pid != me {
                    have_children = true;
                    if p.state == ProcessState::Zombie {
                        zombie_pid = Some(p.pid);
                        break;
                    }
                }
            }
            if let Some(zpid) = zombie_pid {
                if let Some(z) = table.remove(zpid) {
                    reaped = Some((z.pid, z.exit_code));
                }
            }
        }

        if let Some(r) = reaped {
            return Some(r);
        }
        if !have_children {
            return None;
        }
        block_current();
    }
}

/// Extend (or shrink) the user heap. Returns the previous break, or
/// None on failure. New pages are mapped user-writable on demand.
pub fn sbrk(increment: i64) -> Option<u64> {
    use crate::memory::{frame, paging, PageFlags, FRAME_SIZE};

    let pid = current_pid();
    let (old_end, new_end, limit, base) = with_process(pid, |p| {
        let old = p.user_heap_end;
        let new = if increment >= 0 {
            old.checked_add(increment as u64)?
        } else {
            old.checked_sub((-increment) as u64)?
        };
        Some((old, new, p.user_heap_limit, p.user_heap_base))
    })??;

    if new_end > limit || new_end < base {
        return None;
    }

    if increment > 0 {
        let first_new = (old_end + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        let mut page = first_new;
        while page < new_end {
            let f = frame::alloc_frame().ok()?;
            if paging::map_page(page, f, PageFlags::user_data()).is_err() {
                frame::free_frame(f);
                // Unwind pages mapped by this call
                let mut unwind = first_new;
                while unwind < page {
                    if let Ok(old_frame) = paging::unmap_page(unwind) {
                        frame::free_frame(old_frame);
                    }
                    unwind += FRAME_SIZE;
                }
                return None;
            }
            page += FRAME_SIZE;
        }
    }

    with_process(pid, |p| p.user_heap_end = new_end);
    Some(old_end)
}

/// Map `size` bytes into the current process's mmap region.
pub fn mmap(size: usize) -> Option<u64> {
    use crate::memory::{frame, paging, PageFlags, FRAME_SIZE};

    if size == 0 {
        return None;
    }
    let pid = current_pid();
    let pages = (size as u64 + FRAME_SIZE - 1) / FRAME_SIZE;

    let addr = with_process(pid, |p| {
        let addr = p.user_mmap_end;
        if addr + pages * FRAME_SIZE > p.user_mmap_limit {
            None
        } else {
            p.user_mmap_end += pages * FRAME_SIZE;
            Some(addr)
        }
    })??;

    for i in 0..pages {
        let f = frame::alloc_frame().ok()?;
        if paging::map_page(addr + i * FRAME_SIZE, f, PageFlags::user_data()).is_err() {
            frame::free_frame(f);
            for j in 0..i {
                if let Ok(old) = paging::unmap_page(addr + j * FRAME_SIZE) {
                    frame::free_frame(old);
                }
            }
            return None;
        }
    }

    with_process(pid, |p| p.user_allocs.push(UserAlloc { addr, pages }));
    Some(addr)
}

/// Unmap a region previously returned by `mmap`/MALLOC.
pub fn munmap(addr: u64) -> bool {
    use crate::memory::{frame, paging, FRAME_SIZE};

    let pid = current_pid();
    let alloc = with_process(pid, |p| {
        let idx = p.user_allocs.iter().position(|a| a.addr == addr)?;
        Some(p.user_allocs.swap_remove(idx))
    })
    .flatten();

    match alloc {
        Some(a) => {
            for i in 0..a.pages {
                if let Ok(f) = paging::unmap_page(a.addr + i * FRAME_SIZE) {
                    frame::free_frame(f);
                }
            }
            true
        }
        None => false,
    }
}

/// Reclaim a Terminated process's resources (scheduler pass).
pub(crate) fn reap(pid: Pid) {
    let _irq = crate::interrupts::IrqGuard::new();
    if let Some(p) = TABLE.lock().remove(pid) {
        crate::log_debug!("[PROC] reaped pid {} ('{}')", p.pid, p.name);
    }
}

/// Internal scheduler access: state + cpu pointers for the switch.
pub(crate) fn switch_info(pid: Pid) -> Option<(*mut CpuState, u64, bool, ProcessState)> {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut table = TABLE.lock();
    table.get_mut(pid).map(|p| {
        (
            &mut p.cpu_state as *mut CpuState,
            p.kernel_stack_top(),
            p.is_user,
            p.state,
        )
    })
}

pub(crate) fn set_state(pid: Pid, state: ProcessState) {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut table = TABLE.lock();
    if let Some(p) = table.get_mut(pid) {
        p.state = state;
    }
}

pub(crate) fn refill_slice(pid: Pid) {
    let _irq = crate::interrupts::IrqGuard::new();
    let mut table = TABLE.lock();
    if let Some(p) = table.get_mut(pid) {
        p.time_slice = scheduler::quantum_for_priority(p.priority);
    }
}
