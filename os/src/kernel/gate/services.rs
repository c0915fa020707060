//! Typed client side of the core call gates.
//!
//! Ring init code is written against [`CoreServices`]. On hardware the outer
//! rings reach ring 0 through `lcall` (see `arch::x86::gates::CallGates`);
//! ring 0 itself, and the host tests, call the dispatcher directly through
//! [`DirectCore`] with an explicit caller ring.
//!
//! TSS and LDT installs take the structure itself: on the gates only its
//! address travels, while [`DirectCore`] hands the contents over as well.

use core::ffi::CStr;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use super::adopt::{CallerMemory, TaskStore};
use super::{
    dispatch_gdt_set, dispatch_idt_set, dispatch_print, status, GateRegs, GdtRequest, IdtRequest,
    PrintRequest,
};
use crate::config::MAX_PRINT_LEN;
use crate::console::TextConsole;
use crate::kernel::error::GateStatus;
use crate::kernel::gdt::descriptor::Descriptor;
use crate::kernel::gdt::ldt::{Ldt, LDT_LIMIT};
use crate::kernel::gdt::tss::Tss32;
use crate::kernel::gdt::DescriptorTable;
use crate::kernel::idt::InterruptTable;

fn checked(status: u32) -> Result<(), GateStatus> {
    match status {
        0 => Ok(()),
        code => Err(GateStatus(code)),
    }
}

pub trait CoreServices {
    /// `CG_GDT_SET` with raw registers; returns the EAX status.
    fn gdt_set(&mut self, regs: GateRegs) -> u32;

    /// `CG_IDT_SET` with raw registers; returns the EAX status.
    fn idt_set(&mut self, regs: GateRegs) -> u32;

    /// `CG_CORE_PRINTR`. `position` is (row, column).
    fn print(&mut self, message: &CStr, color: u8, position: Option<(u8, u8)>);

    fn install_descriptor(
        &mut self,
        selector: SegmentSelector,
        descriptor: Descriptor,
    ) -> Result<(), GateStatus> {
        checked(self.gdt_set(
            GdtRequest::Descriptor {
                selector,
                descriptor,
            }
            .encode(),
        ))
    }

    fn install_call_gate(
        &mut self,
        selector: SegmentSelector,
        handler: u32,
        param_count: u8,
    ) -> Result<(), GateStatus> {
        checked(self.gdt_set(
            GdtRequest::CallGate {
                selector,
                handler,
                param_count,
            }
            .encode(),
        ))
    }

    fn install_tss(&mut self, selector: SegmentSelector, tss: &Tss32) -> Result<(), GateStatus> {
        checked(self.gdt_set(
            GdtRequest::Tss {
                selector,
                base: tss.base(),
            }
            .encode(),
        ))
    }

    /// Installs a full two-entry LDT.
    fn install_ldt(&mut self, selector: SegmentSelector, ldt: &Ldt) -> Result<(), GateStatus> {
        checked(self.gdt_set(
            GdtRequest::Ldt {
                selector,
                base: ldt.base(),
                limit: LDT_LIMIT,
            }
            .encode(),
        ))
    }

    fn install_interrupt(
        &mut self,
        vector: u8,
        handler: u32,
        dpl: PrivilegeLevel,
    ) -> Result<(), GateStatus> {
        checked(self.idt_set(
            IdtRequest {
                vector: vector as u32,
                handler,
                dpl,
            }
            .encode(),
        ))
    }
}

/// `memory` with the structure of the request in flight laid over it.
struct Handover<'m> {
    memory: &'m dyn CallerMemory,
    tss: Option<Tss32>,
    ldt: Option<Ldt>,
    at: u32,
}

impl CallerMemory for Handover<'_> {
    fn owns(&self, ring: PrivilegeLevel, addr: u32, len: u32) -> bool {
        self.memory.owns(ring, addr, len)
    }

    fn read_tss(&self, addr: u32) -> Option<Tss32> {
        match self.tss {
            Some(tss) if addr == self.at => Some(tss),
            _ => self.memory.read_tss(addr),
        }
    }

    fn read_ldt(&self, addr: u32) -> Option<Ldt> {
        match self.ldt {
            Some(ldt) if addr == self.at => Some(ldt),
            _ => self.memory.read_ldt(addr),
        }
    }
}

/// In-process dispatcher access on behalf of `caller`.
pub struct DirectCore<'t, 'a> {
    gdt: &'t mut DescriptorTable<'a>,
    idt: &'t mut InterruptTable<'a>,
    console: &'t mut TextConsole<'a>,
    tasks: &'t mut TaskStore,
    memory: &'t dyn CallerMemory,
    caller: PrivilegeLevel,
}

impl<'t, 'a> DirectCore<'t, 'a> {
    pub fn new(
        gdt: &'t mut DescriptorTable<'a>,
        idt: &'t mut InterruptTable<'a>,
        console: &'t mut TextConsole<'a>,
        tasks: &'t mut TaskStore,
        memory: &'t dyn CallerMemory,
        caller: PrivilegeLevel,
    ) -> Self {
        Self {
            gdt,
            idt,
            console,
            tasks,
            memory,
            caller,
        }
    }

    fn dispatch(&mut self, regs: GateRegs, handover: Handover<'_>) -> u32 {
        status(
            "gdt_set",
            dispatch_gdt_set(self.gdt, self.tasks, &handover, self.caller, &regs),
        )
    }

    fn handover(&self) -> Handover<'t> {
        Handover {
            memory: self.memory,
            tss: None,
            ldt: None,
            at: 0,
        }
    }
}

impl CoreServices for DirectCore<'_, '_> {
    fn gdt_set(&mut self, regs: GateRegs) -> u32 {
        let handover = self.handover();
        self.dispatch(regs, handover)
    }

    fn idt_set(&mut self, regs: GateRegs) -> u32 {
        status("idt_set", dispatch_idt_set(self.idt, self.caller, &regs))
    }

    fn print(&mut self, message: &CStr, color: u8, position: Option<(u8, u8)>) {
        let bytes = message.to_bytes();
        let request = PrintRequest {
            color,
            message: bytes.as_ptr() as usize as u32,
            position,
        };
        dispatch_print(self.console, &request, &bytes[..bytes.len().min(MAX_PRINT_LEN)]);
    }

    fn install_tss(&mut self, selector: SegmentSelector, tss: &Tss32) -> Result<(), GateStatus> {
        let regs = GdtRequest::Tss {
            selector,
            base: tss.base(),
        }
        .encode();
        let handover = Handover {
            tss: Some(*tss),
            at: tss.base(),
            ..self.handover()
        };
        checked(self.dispatch(regs, handover))
    }

    fn install_ldt(&mut self, selector: SegmentSelector, ldt: &Ldt) -> Result<(), GateStatus> {
        let regs = GdtRequest::Ldt {
            selector,
            base: ldt.base(),
            limit: LDT_LIMIT,
        }
        .encode();
        let handover = Handover {
            ldt: Some(*ldt),
            at: ldt.base(),
            ..self.handover()
        };
        checked(self.dispatch(regs, handover))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::COLS;
    use crate::kernel::gate::testing::Bench;
    use crate::kernel::gdt::descriptor::SystemType;
    use crate::kernel::gdt::tss::TSS_LIMIT;
    use crate::layout::*;
    use x86_64::PrivilegeLevel::*;

    #[test]
    fn test_typed_helpers_report_status() {
        let mut bench = Bench::new();
        let foreign = Tss32::zeroed();
        bench.run(Ring2, |core| {
            assert!(core.install_call_gate(CG_LIBS_TX_IRQ, 0x0010_4000, 0).is_ok());
            assert_eq!(core.install_tss(TSS_CORE, &foreign), Err(GateStatus(2)));
            assert_eq!(core.install_interrupt(3, 0x1000, Ring2), Err(GateStatus(3)));
        });
        let gate = bench.slot(CG_LIBS_TX_IRQ);
        assert_eq!(gate.system_type(), Some(SystemType::CallGate));
        assert_eq!(gate.gate_offset(), 0x0010_4000);
        assert_eq!(gate.param_count(), 0);
    }

    #[test]
    fn test_ring0_tss_install_is_exact() {
        let mut bench = Bench::new();
        let tss = Box::new(Tss32::zeroed());
        bench.run(Ring0, |core| core.install_tss(TSS_CORE, &tss)).unwrap();
        let slot = bench.slot(TSS_CORE);
        assert_eq!(slot.base(), tss.base());
        assert_eq!(slot.limit(), TSS_LIMIT);
    }

    #[test]
    fn test_outer_ring_hands_over_contents() {
        let mut bench = Bench::new();
        let ldt = Ldt::for_ring(Ring3, USERS_SYS_LIMIT);
        bench.run(Ring3, |core| core.install_ldt(LDT_USERS, &ldt)).unwrap();
        let copy = bench.tasks.ldt(LDT_USERS).unwrap();
        assert_eq!(copy.code(), ldt.code());
        assert_eq!(bench.slot(LDT_USERS).base(), copy.base());
        assert_ne!(bench.slot(LDT_USERS).base(), ldt.base());

        // a zeroed TSS names no code segment
        let blank = Tss32::zeroed();
        assert_eq!(
            bench.run(Ring3, |core| core.install_tss(TSS_MAIN_TASK, &blank)),
            Err(GateStatus(11))
        );
    }

    #[test]
    fn test_interrupt_install_through_services() {
        let mut bench = Bench::new();
        bench.run(Ring1, |core| {
            assert!(core.install_interrupt(0x21, 0x0010_8000, Ring1).is_ok());
        });
        let gate = bench.idt[0x21];
        assert_eq!(gate.gate_offset(), 0x0010_8000);
        assert_eq!(gate.dpl(), Ring1);
    }

    #[test]
    fn test_print_at_position() {
        let mut bench = Bench::new();
        bench.run(Ring3, |core| {
            core.print(c"SYS is ready...", 0x20, Some((22, 31)));
            core.print(c"R4R<:>", 0x02, None);
        });
        assert_eq!(bench.cells[22 * COLS + 31] as u8, b'S');
        assert_eq!(bench.row_text(0), "R4R<:>");
    }
}
