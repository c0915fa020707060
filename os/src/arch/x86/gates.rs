//! Outer-ring side of the call gates.
//!
//! Every call is `lcall $selector, $0`; the gate supplies the real offset.
//! Core gate stubs preserve all registers but EAX.

use core::arch::asm;
use core::ffi::CStr;

use crate::kernel::gate::services::CoreServices;
use crate::kernel::gate::{GateRegs, PrintRequest};
use crate::kernel::ring::ResumeToken;
use crate::layout::{CG_CORE_PRINTR, CG_CORE_RESUME, CG_DEVS_TTY_W, CG_GDT_SET, CG_IDT_SET, CG_LIBS_TX_IRQ};

/// [`CoreServices`] over the real call gates, for code running in rings 1..3.
pub struct CallGates;

macro_rules! lcall {
    ($gate:expr, $regs:expr) => {{
        let regs: GateRegs = $regs;
        let status: u32;
        // SAFETY: the gate stub preserves every register but EAX and
        // returns with `lret`.
        unsafe {
            asm!(
                "lcall ${gate}, $0",
                gate = const $gate.0,
                inout("eax") regs.eax => status,
                in("ebx") regs.ebx,
                in("ecx") regs.ecx,
                in("edx") regs.edx,
                options(att_syntax),
            )
        };
        status
    }};
}

impl CoreServices for CallGates {
    fn gdt_set(&mut self, regs: GateRegs) -> u32 {
        lcall!(CG_GDT_SET, regs)
    }

    fn idt_set(&mut self, regs: GateRegs) -> u32 {
        lcall!(CG_IDT_SET, regs)
    }

    fn print(&mut self, message: &CStr, color: u8, position: Option<(u8, u8)>) {
        let request = PrintRequest {
            color,
            message: message.as_ptr() as usize as u32,
            position,
        };
        lcall!(CG_CORE_PRINTR, request.encode());
    }
}

/// Prints through the devs relay at `CG_DEVS_TTY_W`. Rings 0..2 only.
pub fn devs_tty_write(message: &CStr, color: u8) {
    let request = PrintRequest {
        color,
        message: message.as_ptr() as usize as u32,
        position: None,
    };
    lcall!(CG_DEVS_TTY_W, request.encode());
}

/// Calls the libs `CG_LIBS_TX_IRQ` service; returns its counter.
pub fn libs_tx_irq() -> u32 {
    lcall!(CG_LIBS_TX_IRQ, GateRegs::default())
}

/// Hands `token` back to ring 0 through `CG_CORE_RESUME`.
pub fn resume(token: ResumeToken) -> ! {
    // SAFETY: the resume stub never returns here.
    unsafe {
        asm!(
            "lcall ${gate}, $0",
            gate = const CG_CORE_RESUME.0,
            in("eax") token.into_raw(),
            options(att_syntax, noreturn),
        )
    }
}
