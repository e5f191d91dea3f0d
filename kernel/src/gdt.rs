//! Global Descriptor Table
//!
//! Ring 0/3 segments plus a TSS carrying the kernel stack used on
//! privilege transitions and a dedicated double-fault stack.

use lazy_static::lazy_static;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot for the double-fault handler
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const STACK_SIZE: usize = 4096 * 5;

/// Stack used when a double fault fires (static; the heap may be the
/// thing that broke)
static mut DOUBLE_FAULT_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

/// Stack entered from ring 3 on interrupts/syscalls until the scheduler
/// installs per-process kernel stacks
static mut PRIVILEGE_STACK: [u8; STACK_SIZE] = [0; STACK_SIZE];

/// The TSS itself. Only mutated with interrupts disabled (boot, and the
/// scheduler's stack handoff inside the switch critical section).
static mut TSS_STORAGE: TaskStateSegment = TaskStateSegment::new();

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    user_code: SegmentSelector,
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

fn tss() -> &'static mut TaskStateSegment {
    unsafe { &mut *core::ptr::addr_of_mut!(TSS_STORAGE) }
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let t = tss();
        t.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(DOUBLE_FAULT_STACK) });
            start + STACK_SIZE
        };
        t.privilege_stack_table[0] = {
            let start = VirtAddr::from_ptr(unsafe { core::ptr::addr_of!(PRIVILEGE_STACK) });
            start + STACK_SIZE
        };

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss_sel = gdt.add_entry(Descriptor::tss_segment(tss()));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss: tss_sel,
            },
        )
    };
}

/// Load the GDT, reload segment registers and the TSS.
pub fn init() {
    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
    crate::log!("[GDT] Loaded (ring 0/3 segments + TSS)");
}

/// Point TSS.RSP0 at a process kernel stack; entered on ring 3 -> ring 0.
pub fn set_kernel_stack(stack_top: u64) {
    tss().privilege_stack_table[0] = VirtAddr::new(stack_top);
}

/// Kernel code selector (for IDT entries)
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code
}

/// User code selector with RPL 3
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code
}

/// User data selector with RPL 3
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data
}
