//! 8259 PIC (Programmable Interrupt Controller).
//!
//! Remap IRQ 0–15 to IDT vectors 0x20–0x2F, clear of the CPU exceptions.
//! Only the keyboard (IRQ1) is left unmasked.

pub const MASTER_VECTOR: u8 = 0x20;
pub const SLAVE_VECTOR: u8 = 0x28;

pub const KEYBOARD_IRQ: u8 = 1;

/// Interrupt mask register values after [`init`]: set bits are masked.
pub const MASTER_MASK: u8 = !(1 << KEYBOARD_IRQ);
pub const SLAVE_MASK: u8 = 0xFF;

/// IDT vector an IRQ line arrives on.
pub const fn vector(irq: u8) -> u8 {
    if irq < 8 {
        MASTER_VECTOR + irq
    } else {
        SLAVE_VECTOR + irq - 8
    }
}

#[cfg(target_arch = "x86")]
mod hardware {
    use super::*;
    use crate::arch::x86::port::outb;

    const MASTER_CMD: u16 = 0x20;
    const MASTER_DATA: u16 = 0x21;
    const SLAVE_CMD: u16 = 0xA0;
    const SLAVE_DATA: u16 = 0xA1;

    const ICW1_INIT: u8 = 0x11;
    const ICW4_8086: u8 = 0x01;
    const MASTER_CASCADE: u8 = 0x04; // IR2 has slave
    const SLAVE_CASCADE: u8 = 0x02; // connected to master's IR2
    const EOI: u8 = 0x20;

    /// Initialize PICs: remap IRQs, mask all except the keyboard.
    /// Safe to call only once at kernel startup.
    pub fn init() {
        unsafe {
            // Start initialization
            outb(MASTER_CMD, ICW1_INIT);
            outb(SLAVE_CMD, ICW1_INIT);

            // Remap vectors
            outb(MASTER_DATA, MASTER_VECTOR);
            outb(SLAVE_DATA, SLAVE_VECTOR);

            // Setup cascade
            outb(MASTER_DATA, MASTER_CASCADE);
            outb(SLAVE_DATA, SLAVE_CASCADE);

            // 8086 mode
            outb(MASTER_DATA, ICW4_8086);
            outb(SLAVE_DATA, ICW4_8086);

            outb(MASTER_DATA, MASTER_MASK);
            outb(SLAVE_DATA, SLAVE_MASK);
        }
    }

    /// Notify PIC that IRQ has been handled.
    ///
    /// # Safety
    /// Port I/O: the caller's IOPL must cover its ring.
    pub unsafe fn end_of_interrupt(irq: u8) {
        if irq >= 8 {
            outb(SLAVE_CMD, EOI);
        }
        outb(MASTER_CMD, EOI);
    }
}

#[cfg(target_arch = "x86")]
pub use hardware::{end_of_interrupt, init};
