//! Input event rings (kbd0 / event0)
//!
//! Bounded single-producer/single-consumer FIFOs: the keyboard IRQ
//! handler produces, blocking DEVFS reads consume. Overflow drops the
//! incoming element. kbd0 carries plain ASCII bytes, event0 carries
//! packed 16-byte Event records.

use spin::Mutex;

/// A 16-byte input event record as read from `$/dev/input/event0`
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Event {
    pub event_type: u16,
    pub code: u16,
    pub value: u32,
    pub timestamp: u64,
}

pub const EVENT_KEY_PRESSED: u16 = 1;
pub const EVENT_KEY_RELEASED: u16 = 2;

const KBD_RING_SIZE: usize = 256;
const EVENT_RING_SIZE: usize = 128;

struct Ring<T: Copy + Default, const N: usize> {
    buf: [T; N],
    head: usize,
    tail: usize,
    dropped: u64,
}

impl<T: Copy + Default, const N: usize> Ring<T, N> {
    const fn new(zero: T) -> Self {
        Self {
            buf: [zero; N],
            head: 0,
            tail: 0,
            dropped: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn push(&mut self, item: T) {
        let next = (self.head + 1) % N;
        if next == self.tail {
            // Full: drop, per the overflow policy
            self.dropped += 1;
            return;
        }
        self.buf[self.head] = item;
        self.head = next;
    }

    fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self.buf[self.tail];
        self.tail = (self.tail + 1) % N;
        Some(item)
    }
}

static KBD_RING: Mutex<Ring<u8, KBD_RING_SIZE>> = Mutex::new(Ring::new(0));
static EVENT_RING: Mutex<Ring<Event, EVENT_RING_SIZE>> =
    Mutex::new(Ring::new(Event {
        event_type: 0,
        code: 0,
        value: 0,
        timestamp: 0,
    }));

static SHIFT_DOWN: Mutex<bool> = Mutex::new(false);

/// Scancode set 1 -> ASCII (unshifted)
const SCANCODE_MAP: [u8; 58] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

const SCANCODE_MAP_SHIFT: [u8; 58] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ',
];

const SC_LSHIFT: u8 = 0x2A;
const SC_RSHIFT: u8 = 0x36;

/// IRQ1 producer: translate a set-1 scancode and feed both rings.
pub fn on_scancode(scancode: u8) {
    let released = scancode & 0x80 != 0;
    let code = scancode & 0x7F;

    if code == SC_LSHIFT || code == SC_RSHIFT {
        *SHIFT_DOWN.lock() = !released;
        return;
    }

    let ascii = if (code as usize) < SCANCODE_MAP.len() {
        if *SHIFT_DOWN.lock() {
            SCANCODE_MAP_SHIFT[code as usize]
        } else {
            SCANCODE_MAP[code as usize]
        }
    } else {
        0
    };

    let event = Event {
        event_type: if released {
            EVENT_KEY_RELEASED
        } else {
            EVENT_KEY_PRESSED
        },
        code: code as u16,
        value: ascii as u32,
        timestamp: crate::time::uptime_ms(),
    };
    EVENT_RING.lock().push(event);

    if !released && ascii != 0 {
        KBD_RING.lock().push(ascii);
    }
}

/// Inject an input event from another driver (USB HID via SQRM).
pub fn push_event(event: Event) {
    crate::interrupts::without_interrupts(|| {
        EVENT_RING.lock().push(event);
        if event.event_type == EVENT_KEY_PRESSED && event.value != 0 && event.value < 128 {
            KBD_RING.lock().push(event.value as u8);
        }
    });
}

/// Halt until the next interrupt, leaving IF set while waiting.
fn hlt_wait() {
    x86_64::instructions::interrupts::enable_and_hlt();
}

/// Read ASCII bytes from kbd0.
///
/// Blocking mode halts until at least one byte arrives; non-blocking
/// returns 0 immediately on an empty ring.
pub fn read_kbd(buf: &mut [u8], nonblock: bool) -> usize {
    if buf.is_empty() {
        return 0;
    }
    loop {
        // Ring locks are shared with the IRQ producer: drain with
        // interrupts off
        let n = crate::interrupts::without_interrupts(|| {
            let mut ring = KBD_RING.lock();
            let mut n = 0;
            while n < buf.len() {
                match ring.pop() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            n
        });
        if n > 0 || nonblock {
            return n;
        }
        hlt_wait();
    }
}

/// Read whole 16-byte Event records from event0. Same blocking rules.
pub fn read_events(buf: &mut [u8], nonblock: bool) -> usize {
    let record = core::mem::size_of::<Event>();
    if buf.len() < record {
        return 0;
    }
    loop {
        let n = crate::interrupts::without_interrupts(|| {
            let mut ring = EVENT_RING.lock();
            let mut n = 0;
            while n + record <= buf.len() {
                match ring.pop() {
                    Some(ev) => {
                        let bytes = unsafe {
                            core::slice::from_raw_parts(
                                &ev as *const Event as *const u8,
                                record,
                            )
                        };
                        buf[n..n + record].copy_from_slice(bytes);
                        n += record;
                    }
                    None => break,
                }
            }
            n
        });
        if n > 0 || nonblock {
            return n;
        }
        hlt_wait();
    }
}

/// Bytes waiting in the kbd0 ring
pub fn kbd_pending() -> bool {
    crate::interrupts::without_interrupts(|| !KBD_RING.lock().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_is_16_bytes() {
        assert_eq!(core::mem::size_of::<Event>(), 16);
    }

    #[test]
    fn test_ring_push_pop_order() {
        let mut ring: Ring<u8, 8> = Ring::new(0);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_ring_overflow_drops() {
        let mut ring: Ring<u8, 4> = Ring::new(0);
        for i in 0..10 {
            ring.push(i);
        }
        // Capacity is N-1; the rest were dropped
        assert_eq!(ring.pop(), Some(0));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.dropped, 7);
    }
}
