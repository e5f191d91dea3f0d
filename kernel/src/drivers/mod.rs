//! Hardware driver backends
//!
//! The storage backends (ATA, SATA) expose only the narrow surface the
//! vDrive layer consumes; input feeds the DEVFS rings.

pub mod ata;
pub mod input;
pub mod sata;

/// Bring up the storage backends in enumeration order (ATA, then SATA).
pub fn init() {
    ata::init();
    sata::init();
}
