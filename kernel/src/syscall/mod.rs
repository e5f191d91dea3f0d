//! System Call Interface
//!
//! INT 0x80 with the syscall number in RAX and arguments in RDI, RSI,
//! RDX, R10, R8. Returns in RAX; negative values are errno codes. User
//! pointers are validated against the page tables before the kernel
//! touches them - an unmapped pointer earns EFAULT, never a fault.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::arch::naked_asm;

use crate::fs::{self, fd, FsError};
use crate::memory::validate_user_ptr;
use crate::process;

/// Syscall numbers
pub mod nr {
    pub const EXIT: u64 = 1;
    pub const FORK: u64 = 2;
    pub const READ: u64 = 3;
    pub const WRITE: u64 = 4;
    pub const WRITEFILE: u64 = 5;
    pub const OPEN: u64 = 6;
    pub const CLOSE: u64 = 7;
    pub const WAIT: u64 = 8;
    pub const GETPID: u64 = 9;
    pub const GETPPID: u64 = 10;
    pub const SLEEP: u64 = 11;
    pub const YIELD: u64 = 12;
    pub const MALLOC: u64 = 13;
    pub const FREE: u64 = 14;
    pub const KILL: u64 = 15;
    pub const TIME: u64 = 16;
    pub const EXEC: u64 = 17;
    pub const INPUT: u64 = 18;
    pub const SSTATS: u64 = 19;
    pub const CHDIR: u64 = 20;
    pub const GETCWD: u64 = 21;
    pub const STAT: u64 = 22;
    pub const LSEEK: u64 = 23;
    pub const MKDIR: u64 = 24;
    pub const RMDIR: u64 = 25;
    pub const UNLINK: u64 = 26;
    pub const OPENDIR: u64 = 27;
    pub const READDIR: u64 = 28;
    pub const CLOSEDIR: u64 = 29;
    pub const MMAP: u64 = 30;
    pub const MUNMAP: u64 = 31;
    pub const SBRK: u64 = 32;
    pub const SYSINFO2: u64 = 33;
}

/// Error codes (negative returns)
pub mod errno {
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const ESRCH: i64 = -3;
    pub const EIO: i64 = -5;
    pub const EBADF: i64 = -9;
    pub const EAGAIN: i64 = -11;
    pub const ENOMEM: i64 = -12;
    pub const EFAULT: i64 = -14;
    pub const EBUSY: i64 = -16;
    pub const EEXIST: i64 = -17;
    pub const ENODEV: i64 = -19;
    pub const ENOTDIR: i64 = -20;
    pub const EISDIR: i64 = -21;
    pub const EINVAL: i64 = -22;
    pub const EMFILE: i64 = -24;
    pub const ENOSPC: i64 = -28;
    pub const EROFS: i64 = -30;
    pub const ENAMETOOLONG: i64 = -36;
    pub const ENOSYS: i64 = -38;
    pub const ENOTEMPTY: i64 = -39;
}

fn fs_errno(e: FsError) -> i64 {
    match e {
        FsError::NotFound => errno::ENOENT,
        FsError::NotADirectory => errno::ENOTDIR,
        FsError::IsADirectory => errno::EISDIR,
        FsError::NotEmpty => errno::ENOTEMPTY,
        FsError::ReadOnly => errno::EROFS,
        FsError::Exists | FsError::AlreadyMounted => errno::EEXIST,
        FsError::NoSpace | FsError::TooManyMounts => errno::ENOSPC,
        FsError::PathTooLong => errno::ENAMETOOLONG,
        FsError::InvalidPath => errno::EINVAL,
        FsError::BadFd => errno::EBADF,
        FsError::TooManyOpenFiles => errno::EMFILE,
        FsError::DeviceNotReady => errno::ENODEV,
        FsError::WouldBlock => errno::EAGAIN,
        FsError::NotSupported => errno::ENOSYS,
        _ => errno::EIO,
    }
}

/// INT 0x80 entry: save scratch registers, marshal the arguments into
/// the SysV positions and dispatch. The interrupt gate enters with IF
/// clear and it stays clear for the handler duration.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        // Scratch registers (rax doubles as the result slot)
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        // dispatch(num=rax, a1=rdi, a2=rsi, a3=rdx, a4=r10, a5=r8)
        "mov rcx, rdx", // a3
        "mov rdx, rsi", // a2
        "mov rsi, rdi", // a1
        "mov rdi, rax", // num
        "mov r9, r8",   // a5
        "mov r8, r10",  // a4
        "call {dispatch}",
        // Return value into the saved RAX slot
        "mov [rsp + 64], rax",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        dispatch = sym syscall_dispatch,
    );
}

// ----------------------------------------------------------------------
// User pointer helpers
// ----------------------------------------------------------------------

fn user_buf<'a>(addr: u64, len: usize) -> Result<&'a [u8], i64> {
    if len == 0 {
        return Ok(&[]);
    }
    if !validate_user_ptr(addr, len, false) {
        return Err(errno::EFAULT);
    }
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

fn user_buf_mut<'a>(addr: u64, len: usize) -> Result<&'a mut [u8], i64> {
    if len == 0 {
        return Ok(&mut []);
    }
    if !validate_user_ptr(addr, len, true) {
        return Err(errno::EFAULT);
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// Read a NUL-terminated user string, validating page by page.
fn user_cstr(addr: u64, max: usize) -> Result<String, i64> {
    if addr == 0 {
        return Err(errno::EFAULT);
    }
    let mut out = Vec::new();
    let mut pos = addr;
    loop {
        if out.len() >= max {
            return Err(errno::ENAMETOOLONG);
        }
        if !validate_user_ptr(pos, 1, false) {
            return Err(errno::EFAULT);
        }
        let b = unsafe { *(pos as *const u8) };
        if b == 0 {
            break;
        }
        out.push(b);
        pos += 1;
    }
    String::from_utf8(out).map_err(|_| errno::EINVAL)
}

fn current_fs_context() -> (String, usize) {
    process::with_process(process::current_pid(), |p| {
        (p.cwd.clone(), p.current_slot.max(0) as usize)
    })
    .unwrap_or((String::from("/"), 0))
}

fn resolve_user_path(path: &str) -> Result<fs::Resolved, i64> {
    let (cwd, slot) = current_fs_context();
    fs::resolve(path, &cwd, slot).map_err(fs_errno)
}

// ----------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------

/// Rust-side dispatcher; result is returned to userland in RAX.
pub extern "C" fn syscall_dispatch(num: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let _ = (a4, a5);
    match num {
        nr::EXIT => process::exit(a1 as i32),
        nr::FORK => errno::ENOSYS,
        nr::READ => sys_read(a1 as usize, a2, a3 as usize),
        nr::WRITE => sys_write(a1),
        nr::WRITEFILE => sys_writefile(a1 as usize, a2, a3 as usize),
        nr::OPEN => sys_open(a1, a2 as u32),
        nr::CLOSE => sys_close(a1 as usize),
        nr::WAIT => sys_wait(a1),
        nr::GETPID => process::current_pid() as i64,
        nr::GETPPID => {
            process::with_process(process::current_pid(), |p| p.parent_pid as i64).unwrap_or(0)
        }
        nr::SLEEP => {
            process::sleep((a1).saturating_mul(1000));
            0
        }
        nr::YIELD => {
            process::yield_now();
            0
        }
        nr::MALLOC => match process::mmap(a1 as usize) {
            Some(addr) => addr as i64,
            None => errno::ENOMEM,
        },
        nr::FREE => {
            if process::munmap(a1) {
                0
            } else {
                errno::EINVAL
            }
        }
        nr::KILL => match process::kill(a1 as u32, a2 as i32) {
            Ok(()) => 0,
            Err(()) => errno::ESRCH,
        },
        nr::TIME => crate::time::uptime_ms() as i64,
        nr::EXEC => sys_exec(a1),
        nr::INPUT => sys_input(a1, a2 as usize),
        nr::SSTATS => sys_sstats(),
        nr::CHDIR => sys_chdir(a1),
        nr::GETCWD => sys_getcwd(a1, a2 as usize),
        nr::STAT => sys_stat(a1, a2, a3 as usize),
        nr::LSEEK => sys_lseek(a1 as usize, a2 as i64, a3 as u32),
        nr::MKDIR => sys_path_op(a1, PathOp::Mkdir),
        nr::RMDIR => sys_path_op(a1, PathOp::Rmdir),
        nr::UNLINK => sys_path_op(a1, PathOp::Unlink),
        nr::OPENDIR => sys_opendir(a1),
        nr::READDIR => sys_readdir(a1 as usize, a2, a3 as usize, a4, a5),
        nr::CLOSEDIR => sys_closedir(a1 as usize),
        nr::MMAP => match process::mmap(a2 as usize) {
            Some(addr) => addr as i64,
            None => errno::ENOMEM,
        },
        nr::MUNMAP => {
            if process::munmap(a1) {
                0
            } else {
                errno::EINVAL
            }
        }
        nr::SBRK => match process::sbrk(a1 as i64) {
            Some(old) => old as i64,
            None => errno::ENOMEM,
        },
        nr::SYSINFO2 => sys_sysinfo2(a1, a2 as usize),
        _ => {
            crate::log_debug!("[SYSCALL] unknown syscall {}", num);
            errno::ENOSYS
        }
    }
}

// ----------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------

fn sys_read(fd_num: usize, buf: u64, count: usize) -> i64 {
    let buf = match user_buf_mut(buf, count) {
        Ok(b) => b,
        Err(e) => return e,
    };
    if fd_num == fd::STDIN_FILENO {
        // stdin reads come from the keyboard stream (blocking)
        return crate::drivers::input::read_kbd(buf, false) as i64;
    }
    match fd::read(fd_num, buf) {
        Ok(n) => n as i64,
        Err(e) => fs_errno(e),
    }
}

/// WRITE: console output of a NUL-terminated string.
fn sys_write(str_addr: u64) -> i64 {
    match user_cstr(str_addr, 4096) {
        Ok(s) => {
            crate::serial_print!("{}", s);
            s.len() as i64
        }
        Err(e) => e,
    }
}

fn sys_writefile(fd_num: usize, buf: u64, count: usize) -> i64 {
    let buf = match user_buf(buf, count) {
        Ok(b) => b,
        Err(e) => return e,
    };
    if fd_num == fd::STDOUT_FILENO || fd_num == fd::STDERR_FILENO {
        if let Ok(s) = core::str::from_utf8(buf) {
            crate::serial_print!("{}", s);
        }
        return count as i64;
    }
    match fd::write(fd_num, buf) {
        Ok(n) => n as i64,
        Err(e) => fs_errno(e),
    }
}

fn sys_open(path_addr: u64, flags: u32) -> i64 {
    let path = match user_cstr(path_addr, fs::path::MAX_PATH) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let resolved = match resolve_user_path(&path) {
        Ok(r) => r,
        Err(e) => return e,
    };
    match fd::open(&resolved, flags, process::current_pid()) {
        Ok(n) => n as i64,
        Err(e) => fs_errno(e),
    }
}

fn sys_close(fd_num: usize) -> i64 {
    match fd::close(fd_num) {
        Ok(()) => 0,
        Err(e) => fs_errno(e),
    }
}

fn sys_wait(status_addr: u64) -> i64 {
    match process::wait() {
        Some((pid, code)) => {
            if status_addr != 0 {
                match user_buf_mut(status_addr, 4) {
                    Ok(buf) => buf.copy_from_slice(&code.to_le_bytes()),
                    Err(e) => return e,
                }
            }
            pid as i64
        }
        None => errno::ESRCH,
    }
}

fn sys_exec(path_addr: u64) -> i64 {
    let path = match user_cstr(path_addr, fs::path::MAX_PATH) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let argv = alloc::vec![path.clone()];
    match crate::exec::spawn(&path, argv) {
        Ok(pid) => pid as i64,
        Err(crate::exec::ExecError::NotFound) => errno::ENOENT,
        Err(crate::exec::ExecError::BadElf) => errno::EINVAL,
        Err(_) => errno::ENOMEM,
    }
}

fn sys_input(buf: u64, max_len: usize) -> i64 {
    let buf = match user_buf_mut(buf, max_len) {
        Ok(b) => b,
        Err(e) => return e,
    };
    // Non-blocking drain of the keyboard stream
    crate::drivers::input::read_kbd(buf, true) as i64
}

fn sys_sstats() -> i64 {
    let stats = process::scheduler::stats();
    crate::log!(
        "[SSTATS] {} process(es), {} ready, current pid {}",
        process::count(),
        stats.ready_count,
        stats.current
    );
    for (pid, name, state, ticks) in process::snapshot() {
        crate::log!("[SSTATS]   {} '{}' {:?} {} ticks", pid, name, state, ticks);
    }
    process::count() as i64
}

fn sys_chdir(path_addr: u64) -> i64 {
    let path = match user_cstr(path_addr, fs::path::MAX_PATH) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let resolved = match resolve_user_path(&path) {
        Ok(r) => r,
        Err(e) => return e,
    };
    match &resolved {
        fs::Resolved::Mount { slot, rel } => {
            if !fs::directory_exists(*slot, rel) {
                return errno::ENOTDIR;
            }
            let (cwd, _) = current_fs_context();
            let new_cwd = fs::path::absolutize(&cwd, &path);
            process::with_process(process::current_pid(), |p| {
                p.cwd = new_cwd.clone();
                p.current_slot = *slot as i32;
            });
            0
        }
        fs::Resolved::DevVfs { .. } => errno::ENOTDIR,
    }
}

fn sys_getcwd(buf: u64, size: usize) -> i64 {
    let (cwd, _) = current_fs_context();
    if cwd.len() + 1 > size {
        return errno::EINVAL;
    }
    let out = match user_buf_mut(buf, cwd.len() + 1) {
        Ok(b) => b,
        Err(e) => return e,
    };
    out[..cwd.len()].copy_from_slice(cwd.as_bytes());
    out[cwd.len()] = 0;
    buf as i64
}

/// STAT result record handed to userland
#[repr(C)]
struct UserStat {
    size: u64,
    is_directory: u32,
    reserved: u32,
}

fn sys_stat(path_addr: u64, out_addr: u64, out_size: usize) -> i64 {
    let path = match user_cstr(path_addr, fs::path::MAX_PATH) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let resolved = match resolve_user_path(&path) {
        Ok(r) => r,
        Err(e) => return e,
    };
    let info = match resolved {
        fs::Resolved::Mount { slot, rel } => match fs::stat(slot, &rel) {
            Ok(i) => i,
            Err(e) => return fs_errno(e),
        },
        fs::Resolved::DevVfs { .. } => fs::FileInfo {
            name: String::new(),
            size: 0,
            is_directory: true,
        },
    };

    let need = core::mem::size_of::<UserStat>();
    if out_size < need {
        return errno::EINVAL;
    }
    let out = match user_buf_mut(out_addr, need) {
        Ok(b) => b,
        Err(e) => return e,
    };
    let stat = UserStat {
        size: info.size,
        is_directory: info.is_directory as u32,
        reserved: 0,
    };
    let bytes =
        unsafe { core::slice::from_raw_parts(&stat as *const UserStat as *const u8, need) };
    out.copy_from_slice(bytes);
    0
}

fn sys_lseek(fd_num: usize, offset: i64, whence: u32) -> i64 {
    match fd::lseek(fd_num, offset, whence) {
        Ok(pos) => pos as i64,
        Err(e) => fs_errno(e),
    }
}

enum PathOp {
    Mkdir,
    Rmdir,
    Unlink,
}

fn sys_path_op(path_addr: u64, op: PathOp) -> i64 {
    let path = match user_cstr(path_addr, fs::path::MAX_PATH) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let resolved = match resolve_user_path(&path) {
        Ok(r) => r,
        Err(e) => return e,
    };
    let (slot, rel) = match resolved {
        fs::Resolved::Mount { slot, rel } => (slot, rel),
        fs::Resolved::DevVfs { .. } => return errno::EPERM,
    };
    let result = match op {
        PathOp::Mkdir => fs::mkdir(slot, &rel),
        PathOp::Rmdir => fs::rmdir(slot, &rel),
        PathOp::Unlink => fs::unlink(slot, &rel),
    };
    match result {
        Ok(()) => 0,
        Err(e) => fs_errno(e),
    }
}

fn sys_opendir(path_addr: u64) -> i64 {
    let path = match user_cstr(path_addr, fs::path::MAX_PATH) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let resolved = match resolve_user_path(&path) {
        Ok(r) => r,
        Err(e) => return e,
    };
    match fd::opendir(&resolved, process::current_pid()) {
        Ok(n) => n as i64,
        Err(e) => fs_errno(e),
    }
}

/// READDIR: 1 = entry produced, 0 = end of directory
fn sys_readdir(fd_num: usize, name_buf: u64, buf_size: usize, is_dir_addr: u64, size_addr: u64) -> i64 {
    let entry = match fd::readdir(fd_num) {
        Ok(Some(e)) => e,
        Ok(None) => return 0,
        Err(e) => return fs_errno(e),
    };

    if buf_size == 0 || name_buf == 0 {
        return errno::EINVAL;
    }
    let n = entry.name.len().min(buf_size - 1);
    let out = match user_buf_mut(name_buf, n + 1) {
        Ok(b) => b,
        Err(e) => return e,
    };
    out[..n].copy_from_slice(&entry.name.as_bytes()[..n]);
    out[n] = 0;

    if is_dir_addr != 0 {
        match user_buf_mut(is_dir_addr, 4) {
            Ok(b) => b.copy_from_slice(&(entry.is_directory as i32).to_le_bytes()),
            Err(e) => return e,
        }
    }
    if size_addr != 0 {
        match user_buf_mut(size_addr, 4) {
            Ok(b) => b.copy_from_slice(&(entry.size as u32).to_le_bytes()),
            Err(e) => return e,
        }
    }
    1
}

fn sys_closedir(fd_num: usize) -> i64 {
    if !fd::is_directory_fd(fd_num) {
        return errno::EBADF;
    }
    match fd::close(fd_num) {
        Ok(()) => 0,
        Err(e) => fs_errno(e),
    }
}

/// SYSINFO2 record
#[repr(C)]
struct SysInfo2 {
    total_memory: u64,
    heap_used: u64,
    heap_free: u64,
    uptime_ms: u64,
    process_count: u32,
    mount_count: u32,
    module_count: u32,
    reserved: u32,
}

fn sys_sysinfo2(out_addr: u64, out_size: usize) -> i64 {
    let need = core::mem::size_of::<SysInfo2>();
    if out_size < need {
        return errno::EINVAL;
    }
    let out = match user_buf_mut(out_addr, need) {
        Ok(b) => b,
        Err(e) => return e,
    };

    let mem = crate::memory::stats();
    let info = SysInfo2 {
        total_memory: crate::memory::total_physical_memory(),
        heap_used: mem.heap_used as u64,
        heap_free: mem.heap_free as u64,
        uptime_ms: crate::time::uptime_ms(),
        process_count: process::count() as u32,
        mount_count: fs::mount_count() as u32,
        module_count: crate::sqrm::loaded_count() as u32,
        reserved: 0,
    };
    let bytes =
        unsafe { core::slice::from_raw_parts(&info as *const SysInfo2 as *const u8, need) };
    out.copy_from_slice(bytes);
    0
}
