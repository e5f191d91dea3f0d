//! Interrupt Handling Subsystem
//!
//! IDT with the 32 CPU exception vectors, the 16 remapped PIC IRQs and
//! the INT 0x80 syscall gate. Also provides the IRQ-save lock primitive
//! used around shared kernel state.

mod handlers;
pub mod irq;
pub mod pic;
pub mod pit;

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::PrivilegeLevel;

/// Syscall software interrupt vector
pub const SYSCALL_VECTOR: u8 = 0x80;

lazy_static! {
    /// Interrupt Descriptor Table
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        // CPU exceptions
        idt.divide_error.set_handler_fn(handlers::divide_error_handler);
        idt.debug.set_handler_fn(handlers::debug_handler);
        idt.non_maskable_interrupt
            .set_handler_fn(handlers::non_maskable_interrupt_handler);
        idt.breakpoint.set_handler_fn(handlers::breakpoint_handler);
        idt.overflow.set_handler_fn(handlers::overflow_handler);
        idt.bound_range_exceeded
            .set_handler_fn(handlers::bound_range_handler);
        idt.invalid_opcode.set_handler_fn(handlers::invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(handlers::device_not_available_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(handlers::double_fault_handler)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(handlers::invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(handlers::segment_not_present_handler);
        idt.stack_segment_fault
            .set_handler_fn(handlers::stack_segment_handler);
        idt.general_protection_fault
            .set_handler_fn(handlers::general_protection_fault_handler);
        idt.page_fault.set_handler_fn(handlers::page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(handlers::x87_floating_point_handler);
        idt.alignment_check
            .set_handler_fn(handlers::alignment_check_handler);
        idt.machine_check.set_handler_fn(handlers::machine_check_handler);
        idt.simd_floating_point
            .set_handler_fn(handlers::simd_floating_point_handler);
        idt.virtualization.set_handler_fn(handlers::virtualization_handler);

        // Hardware IRQs (PIC remapped to 0x20..0x2F)
        idt[pic::InterruptIndex::Timer.as_usize()]
            .set_handler_fn(handlers::timer_interrupt_handler);
        idt[pic::InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(handlers::keyboard_interrupt_handler);
        idt[pic::PIC1_OFFSET as usize + 2].set_handler_fn(handlers::irq2_handler);
        idt[pic::PIC1_OFFSET as usize + 3].set_handler_fn(handlers::irq3_handler);
        idt[pic::PIC1_OFFSET as usize + 4].set_handler_fn(handlers::irq4_handler);
        idt[pic::PIC1_OFFSET as usize + 5].set_handler_fn(handlers::irq5_handler);
        idt[pic::PIC1_OFFSET as usize + 6].set_handler_fn(handlers::irq6_handler);
        idt[pic::PIC1_OFFSET as usize + 7].set_handler_fn(handlers::irq7_handler);
        idt[pic::PIC1_OFFSET as usize + 8].set_handler_fn(handlers::irq8_handler);
        idt[pic::PIC1_OFFSET as usize + 9].set_handler_fn(handlers::irq9_handler);
        idt[pic::PIC1_OFFSET as usize + 10].set_handler_fn(handlers::irq10_handler);
        idt[pic::PIC1_OFFSET as usize + 11].set_handler_fn(handlers::irq11_handler);
        idt[pic::PIC1_OFFSET as usize + 12].set_handler_fn(handlers::irq12_handler);
        idt[pic::PIC1_OFFSET as usize + 13].set_handler_fn(handlers::irq13_handler);
        idt[pic::PIC1_OFFSET as usize + 14].set_handler_fn(handlers::irq14_handler);
        idt[pic::PIC1_OFFSET as usize + 15].set_handler_fn(handlers::irq15_handler);

        // INT 0x80 syscall gate: naked entry, callable from ring 3.
        // The gate type keeps IF clear for the handler duration.
        unsafe {
            idt[SYSCALL_VECTOR as usize]
                .set_handler_addr(x86_64::VirtAddr::new(
                    crate::syscall::syscall_entry as usize as u64,
                ))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

/// Initialize interrupt handling
pub fn init() {
    IDT.load();

    unsafe {
        pic::PICS.lock().initialize();
    }
    pit::init();

    x86_64::instructions::interrupts::enable();

    crate::log!("[INT] IDT loaded, PIC remapped to 0x20..0x2F, INT 0x80 gate armed");
}

/// Disable interrupts and run closure
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// IRQ lock: saves IF, disables interrupts, restores the saved state on
/// drop. Used for the small critical sections around shared kernel data.
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        let was_enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        Self { was_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
}
