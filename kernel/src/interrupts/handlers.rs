//! Interrupt and exception handlers
//!
//! Faults raised from user mode kill the offending process with a logged
//! cause; faults raised from kernel mode panic with a structured message.
//! The timer ISR drives the scheduler tick.

use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

use super::pic::{InterruptIndex, PICS};

/// Was the interrupted code running in ring 3?
fn from_user_mode(frame: &InterruptStackFrame) -> bool {
    (frame.code_segment & 0b11) == 3
}

/// Common exception exit: kill the current user process or panic.
fn fault(name: &str, frame: &InterruptStackFrame, code: Option<u64>) {
    let rip = frame.instruction_pointer.as_u64();
    if from_user_mode(frame) {
        let pid = crate::process::current_pid();
        crate::log_error!(
            "[FAULT] {} in user process {} at {:#x} (code {:?})",
            name,
            pid,
            rip,
            code
        );
        crate::process::kill_current_and_reschedule(128 + 11);
    } else {
        panic!(
            "kernel fault: {} at {:#x} (code {:?}, flags {:#x})",
            name,
            rip,
            code,
            frame.cpu_flags
        );
    }
}

pub extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    fault("#DE divide error", &frame, None);
}

pub extern "x86-interrupt" fn debug_handler(frame: InterruptStackFrame) {
    crate::log_warn!("[FAULT] #DB debug trap at {:#x}", frame.instruction_pointer.as_u64());
}

pub extern "x86-interrupt" fn non_maskable_interrupt_handler(_frame: InterruptStackFrame) {
    crate::log_warn!("[FAULT] NMI received");
}

pub extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    crate::log!("[FAULT] #BP breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

pub extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    fault("#OF overflow", &frame, None);
}

pub extern "x86-interrupt" fn bound_range_handler(frame: InterruptStackFrame) {
    fault("#BR bound range exceeded", &frame, None);
}

pub extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    fault("#UD invalid opcode", &frame, None);
}

/// #NM: coprocessor not available, the lazy-FPU switch point.
pub extern "x86-interrupt" fn device_not_available_handler(_frame: InterruptStackFrame) {
    crate::process::fpu::handle_nm();
}

pub extern "x86-interrupt" fn double_fault_handler(
    frame: InterruptStackFrame,
    code: u64,
) -> ! {
    panic!("double fault (code {}) at {:#x}", code, frame.instruction_pointer.as_u64());
}

pub extern "x86-interrupt" fn invalid_tss_handler(frame: InterruptStackFrame, code: u64) {
    fault("#TS invalid TSS", &frame, Some(code));
}

pub extern "x86-interrupt" fn segment_not_present_handler(frame: InterruptStackFrame, code: u64) {
    fault("#NP segment not present", &frame, Some(code));
}

pub extern "x86-interrupt" fn stack_segment_handler(frame: InterruptStackFrame, code: u64) {
    fault("#SS stack segment fault", &frame, Some(code));
}

pub extern "x86-interrupt" fn general_protection_fault_handler(
    frame: InterruptStackFrame,
    code: u64,
) {
    fault("#GP general protection fault", &frame, Some(code));
}

pub extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: PageFaultErrorCode,
) {
    let addr = Cr2::read().as_u64();
    if from_user_mode(&frame) {
        let pid = crate::process::current_pid();
        crate::log_error!(
            "[FAULT] #PF in user process {}: addr {:#x} rip {:#x} ({:?})",
            pid,
            addr,
            frame.instruction_pointer.as_u64(),
            code
        );
        crate::process::kill_current_and_reschedule(128 + 11);
    } else {
        panic!(
            "kernel page fault: addr {:#x} rip {:#x} ({:?})",
            addr,
            frame.instruction_pointer.as_u64(),
            code
        );
    }
}

pub extern "x86-interrupt" fn x87_floating_point_handler(frame: InterruptStackFrame) {
    fault("#MF x87 floating point", &frame, None);
}

pub extern "x86-interrupt" fn alignment_check_handler(frame: InterruptStackFrame, code: u64) {
    fault("#AC alignment check", &frame, Some(code));
}

pub extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    panic!("machine check at {:#x}", frame.instruction_pointer.as_u64());
}

pub extern "x86-interrupt" fn simd_floating_point_handler(frame: InterruptStackFrame) {
    fault("#XM SIMD floating point", &frame, None);
}

pub extern "x86-interrupt" fn virtualization_handler(frame: InterruptStackFrame) {
    fault("#VE virtualization", &frame, None);
}

// ============================================================================
// Hardware IRQs
// ============================================================================

/// IRQ0: PIT tick. Advances time, wakes sleepers, burns the running
/// process's time slice and requests a reschedule on expiry. The actual
/// switch happens after EOI, on the way out of the handler.
pub extern "x86-interrupt" fn timer_interrupt_handler(_frame: InterruptStackFrame) {
    let now = crate::time::tick();
    crate::process::scheduler::on_timer_tick(now);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }

    crate::process::scheduler::preempt_if_requested();
}

/// IRQ1: PS/2 keyboard. The register-level PS/2 driver is an external
/// collaborator; this reads the scancode it leaves in port 0x60 and
/// feeds the DEVFS input rings.
pub extern "x86-interrupt" fn keyboard_interrupt_handler(_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    let scancode: u8 = unsafe { Port::new(0x60).read() };
    crate::drivers::input::on_scancode(scancode);

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

macro_rules! generic_irq_handler {
    ($name:ident, $irq:expr) => {
        pub extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            crate::interrupts::irq::dispatch($irq);
            unsafe {
                PICS.lock()
                    .notify_end_of_interrupt(super::pic::PIC1_OFFSET + $irq);
            }
        }
    };
}

generic_irq_handler!(irq2_handler, 2);
generic_irq_handler!(irq3_handler, 3);
generic_irq_handler!(irq4_handler, 4);
generic_irq_handler!(irq5_handler, 5);
generic_irq_handler!(irq6_handler, 6);
generic_irq_handler!(irq7_handler, 7);
generic_irq_handler!(irq8_handler, 8);
generic_irq_handler!(irq9_handler, 9);
generic_irq_handler!(irq10_handler, 10);
generic_irq_handler!(irq11_handler, 11);
generic_irq_handler!(irq12_handler, 12);
generic_irq_handler!(irq13_handler, 13);
generic_irq_handler!(irq14_handler, 14);
generic_irq_handler!(irq15_handler, 15);
