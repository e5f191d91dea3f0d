//! IRQ handler registry for driver modules
//!
//! SQRM driver modules install plain `extern "C"` handlers for their IRQ
//! line; the generic IRQ stubs dispatch here before EOI.

use spin::Mutex;

type IrqHandler = extern "C" fn();

static HANDLERS: Mutex<[Option<IrqHandler>; 16]> = Mutex::new([None; 16]);

/// Install a handler for an IRQ line (0..15) and unmask the line.
pub fn install_handler(irq: u8, handler: IrqHandler) {
    if irq >= 16 {
        return;
    }
    super::without_interrupts(|| {
        HANDLERS.lock()[irq as usize] = Some(handler);
        super::pic::set_irq_masked(irq, false);
    });
    crate::log!("[IRQ] Handler installed for IRQ {}", irq);
}

/// Remove the handler for an IRQ line and mask the line again.
pub fn uninstall_handler(irq: u8) {
    if irq >= 16 {
        return;
    }
    super::without_interrupts(|| {
        HANDLERS.lock()[irq as usize] = None;
        super::pic::set_irq_masked(irq, true);
    });
    crate::log!("[IRQ] Handler removed for IRQ {}", irq);
}

/// Invoke the installed handler, if any.
pub(super) fn dispatch(irq: u8) {
    let handler = HANDLERS.lock()[irq as usize];
    if let Some(h) = handler {
        h();
    }
}
