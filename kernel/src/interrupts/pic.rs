//! Programmable Interrupt Controller (8259 PIC)
//!
//! Remaps the two cascaded PICs to vectors 0x20..0x2F and routes
//! hardware IRQ masking and end-of-interrupt.

use spin::Mutex;
use x86_64::instructions::port::Port;

/// PIC1 command port
const PIC1_COMMAND: u16 = 0x20;
/// PIC1 data port
const PIC1_DATA: u16 = 0x21;
/// PIC2 command port
const PIC2_COMMAND: u16 = 0xA0;
/// PIC2 data port
const PIC2_DATA: u16 = 0xA1;

/// End of interrupt command
const PIC_EOI: u8 = 0x20;

/// PIC1 offset in IDT
pub const PIC1_OFFSET: u8 = 0x20;
/// PIC2 offset in IDT
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

/// Hardware interrupt vectors
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC1_OFFSET,
    Keyboard = PIC1_OFFSET + 1,
}

impl InterruptIndex {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_usize(self) -> usize {
        self as usize
    }
}

/// Chained PIC controller
pub struct ChainedPics {
    pics: [Pic; 2],
}

impl ChainedPics {
    pub const fn new() -> Self {
        Self {
            pics: [
                Pic::new(PIC1_COMMAND, PIC1_DATA, PIC1_OFFSET),
                Pic::new(PIC2_COMMAND, PIC2_DATA, PIC2_OFFSET),
            ],
        }
    }

    /// Initialize both PICs (remap to 0x20..0x2F)
    pub unsafe fn initialize(&mut self) {
        // ICW1: start initialization sequence
        self.pics[0].command.write(0x11);
        self.pics[1].command.write(0x11);

        // ICW2: vector offsets
        self.pics[0].data.write(self.pics[0].offset);
        self.pics[1].data.write(self.pics[1].offset);

        // ICW3: cascading
        self.pics[0].data.write(4); // PIC2 at IRQ2
        self.pics[1].data.write(2); // cascade identity

        // ICW4: 8086 mode
        self.pics[0].data.write(0x01);
        self.pics[1].data.write(0x01);

        // Enable timer, keyboard and the cascade line; SQRM driver
        // modules unmask their own lines via irq_set_masked.
        self.pics[0].data.write(0b1111_1000);
        self.pics[1].data.write(0b1111_1111);
    }

    /// Notify end of interrupt
    pub unsafe fn notify_end_of_interrupt(&mut self, irq_vector: u8) {
        if irq_vector >= self.pics[1].offset {
            self.pics[1].command.write(PIC_EOI);
        }
        self.pics[0].command.write(PIC_EOI);
    }

    /// Mask or unmask a single IRQ line (0..15)
    pub unsafe fn set_masked(&mut self, irq: u8, masked: bool) {
        let (pic, line) = if irq < 8 {
            (&mut self.pics[0], irq)
        } else {
            (&mut self.pics[1], irq - 8)
        };
        let mut mask: u8 = pic.data.read();
        if masked {
            mask |= 1 << line;
        } else {
            mask &= !(1 << line);
        }
        pic.data.write(mask);
    }
}

/// Single PIC controller
struct Pic {
    command: Port<u8>,
    data: Port<u8>,
    offset: u8,
}

impl Pic {
    const fn new(command_port: u16, data_port: u16, offset: u8) -> Self {
        Self {
            command: Port::new(command_port),
            data: Port::new(data_port),
            offset,
        }
    }
}

/// Global PIC instance
pub static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new());

/// Send EOI for a raw IRQ number (0..15). Exposed to SQRM driver modules.
pub fn send_eoi(irq: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC1_OFFSET + irq);
    }
}

/// Mask/unmask an IRQ line. Exposed to SQRM driver modules.
pub fn set_irq_masked(irq: u8, masked: bool) {
    if irq < 16 {
        unsafe {
            PICS.lock().set_masked(irq, masked);
        }
    }
}
