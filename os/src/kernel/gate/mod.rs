//! Call-gate dispatcher
//!
//! Outer rings never write the GDT or IDT themselves. They `lcall` one of a
//! few fixed gates whose ring-0 stubs switch DS/ES to core data, hand the
//! caller's registers to the functions below and `lret` with a status in EAX
//! (0 on success, see [`GateError::code`]).
//!
//! `CG_GDT_SET` register contract (opcode in EDX, tried in this order):
//!
//! | EDX  | service         | EAX          | EBX          | ECX      |
//! |------|-----------------|--------------|--------------|----------|
//! | 0x01 | raw descriptor  | low dword    | high dword   | selector |
//! | 0x8C | call gate       | param count  | handler      | selector |
//! | 0x89 | TSS             | TSS address  | selector     |          |
//! | 0x82 | LDT             | limit        | base         | selector |
//!
//! Rings 1..3 may install call gates and code/data segments of their own
//! privilege within their reach. Their TSS and LDT requests name memory in
//! their own region; ring 0 adopts a checked copy of it.
//!
//! `CG_IDT_SET`: EAX dpl, EBX handler, ECX vector.
//! `CG_CORE_PRINTR`: EAX colour, EBX NUL-terminated message, CX packed
//! position (CL row, CH column; zero prints at the cursor).

pub mod adopt;
pub mod services;
#[cfg(test)]
pub(crate) mod testing;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::config::MAX_PRINT_LEN;
use crate::console::TextConsole;
use crate::kernel::error::{GateError, GateResult};
use crate::kernel::gdt::descriptor::{ring, Access, Descriptor, SystemType};
use crate::kernel::gdt::ldt::LDT_LIMIT;
use crate::kernel::gdt::tss::{TSS_LIMIT, TSS_SIZE};
use crate::kernel::gdt::DescriptorTable;
use crate::layout::reach;
use adopt::{CallerMemory, TaskStore};
use crate::kernel::idt::{InterruptTable, EXCEPTION_VECTORS};

pub const OP_DESCRIPTOR: u32 = 0x01;
pub const OP_CALL_GATE: u32 = 0x8C;
pub const OP_TSS: u32 = 0x89;
pub const OP_LDT: u32 = 0x82;

/// General registers as the caller left them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GdtRequest {
    Descriptor {
        selector: SegmentSelector,
        descriptor: Descriptor,
    },
    CallGate {
        selector: SegmentSelector,
        handler: u32,
        param_count: u8,
    },
    Tss {
        selector: SegmentSelector,
        base: u32,
    },
    Ldt {
        selector: SegmentSelector,
        base: u32,
        limit: u32,
    },
}

impl GdtRequest {
    pub fn decode(regs: &GateRegs) -> GateResult<Self> {
        let sel = |value: u32| SegmentSelector(value as u16);
        if regs.edx == OP_DESCRIPTOR {
            Ok(Self::Descriptor {
                selector: sel(regs.ecx),
                descriptor: Descriptor::from_words(regs.eax, regs.ebx),
            })
        } else if regs.edx == OP_CALL_GATE {
            if regs.eax > 0x1F {
                return Err(GateError::BadArgument(regs.eax));
            }
            Ok(Self::CallGate {
                selector: sel(regs.ecx),
                handler: regs.ebx,
                param_count: regs.eax as u8,
            })
        } else if regs.edx == OP_TSS {
            Ok(Self::Tss {
                selector: sel(regs.ebx),
                base: regs.eax,
            })
        } else if regs.edx == OP_LDT {
            Ok(Self::Ldt {
                selector: sel(regs.ecx),
                base: regs.ebx,
                limit: regs.eax,
            })
        } else {
            Err(GateError::UnknownOpcode(regs.edx))
        }
    }

    pub fn encode(&self) -> GateRegs {
        match *self {
            Self::Descriptor {
                selector,
                descriptor,
            } => GateRegs {
                eax: descriptor.low(),
                ebx: descriptor.high(),
                ecx: selector.0 as u32,
                edx: OP_DESCRIPTOR,
            },
            Self::CallGate {
                selector,
                handler,
                param_count,
            } => GateRegs {
                eax: param_count as u32,
                ebx: handler,
                ecx: selector.0 as u32,
                edx: OP_CALL_GATE,
            },
            Self::Tss { selector, base } => GateRegs {
                eax: base,
                ebx: selector.0 as u32,
                ecx: 0,
                edx: OP_TSS,
            },
            Self::Ldt {
                selector,
                base,
                limit,
            } => GateRegs {
                eax: limit,
                ebx: base,
                ecx: selector.0 as u32,
                edx: OP_LDT,
            },
        }
    }

    fn selector(&self) -> SegmentSelector {
        match *self {
            Self::Descriptor { selector, .. }
            | Self::CallGate { selector, .. }
            | Self::Tss { selector, .. }
            | Self::Ldt { selector, .. } => selector,
        }
    }
}

fn require(caller: PrivilegeLevel, required: PrivilegeLevel) -> GateResult<()> {
    if (caller as u8) <= (required as u8) {
        Ok(())
    } else {
        Err(GateError::PrivilegeViolation { caller, required })
    }
}

/// Gate targets must be present GDT code segments the caller could already
/// reach, so a new gate never leads inward past the caller's own ring.
fn check_gate_target(
    gdt: &DescriptorTable<'_>,
    caller: PrivilegeLevel,
    target: SegmentSelector,
) -> GateResult<()> {
    // TI set: gates into an LDT are not supported
    if target.0 & 0b100 != 0 {
        return Err(GateError::BadGateTarget(target.0));
    }
    let segment = gdt
        .read_at(target)
        .map_err(|_| GateError::BadGateTarget(target.0))?;
    if !(segment.is_present() && segment.is_code_segment()) {
        return Err(GateError::BadGateTarget(target.0));
    }
    require(caller, segment.dpl())
}

/// Raw installs from rings 1..3: call gates or code/data segments of the
/// caller's own privilege that stay within its reach, into slots that hold
/// no system descriptor of ring 0's map.
fn authorize_raw(
    gdt: &DescriptorTable<'_>,
    caller: PrivilegeLevel,
    current: Descriptor,
    descriptor: Descriptor,
) -> GateResult<()> {
    if current.is_present() {
        require(caller, current.dpl())?;
        if caller != PrivilegeLevel::Ring0 && current.system_type().is_some() {
            return Err(GateError::SystemDescriptor(current.access().bits()));
        }
    }
    require(caller, descriptor.dpl())?;
    if descriptor.is_gate() {
        check_gate_target(gdt, caller, descriptor.gate_selector())?;
    }
    if caller == PrivilegeLevel::Ring0 || !descriptor.is_present() {
        return Ok(());
    }
    match descriptor.system_type() {
        Some(SystemType::CallGate) => Ok(()),
        Some(_) => Err(GateError::SystemDescriptor(descriptor.access().bits())),
        None if descriptor.access().contains(Access::CODE_DATA) => {
            adopt::check_segment_reach(caller, descriptor)
        }
        None => Err(GateError::SystemDescriptor(descriptor.access().bits())),
    }
}

fn authorize(
    gdt: &DescriptorTable<'_>,
    caller: PrivilegeLevel,
    request: &GdtRequest,
) -> GateResult<()> {
    let selector = request.selector();
    if selector.index() == 0 {
        return Err(GateError::Table(crate::kernel::error::TableError::NullSlot));
    }
    let current = gdt.read_at(selector)?;

    match *request {
        GdtRequest::Descriptor { descriptor, .. } => authorize_raw(gdt, caller, current, descriptor),
        GdtRequest::CallGate { .. } => {
            if current.is_gate() {
                check_gate_target(gdt, caller, current.gate_selector())?;
            }
            Ok(())
        }
        GdtRequest::Tss { .. } | GdtRequest::Ldt { .. } => {
            require(caller, current.dpl())?;
            if caller != PrivilegeLevel::Ring0 && current.system_type() == Some(SystemType::TssBusy) {
                return Err(GateError::BadTaskState("task is running"));
            }
            Ok(())
        }
    }
}

/// Serves one `CG_GDT_SET` request from a caller running at `caller`.
///
/// TSS and LDT requests from rings 1..3 hand over task state that is copied
/// into `tasks` (see [`adopt`]); the placeholder then points at the copy.
/// On any error the table is left exactly as it was.
pub fn dispatch_gdt_set(
    gdt: &mut DescriptorTable<'_>,
    tasks: &mut TaskStore,
    memory: &dyn CallerMemory,
    caller: PrivilegeLevel,
    regs: &GateRegs,
) -> GateResult<()> {
    let request = GdtRequest::decode(regs)?;
    authorize(gdt, caller, &request)?;

    match request {
        GdtRequest::Descriptor {
            selector,
            descriptor,
        } => gdt.install_at(selector, descriptor)?,
        GdtRequest::CallGate {
            selector,
            handler,
            param_count,
        } => gdt.patch_call_gate_offset(selector, handler, param_count)?,
        GdtRequest::Tss { selector, base } if caller == PrivilegeLevel::Ring0 => {
            gdt.patch_tss_base_limit(selector, base, TSS_LIMIT)?
        }
        GdtRequest::Tss { selector, base } => {
            if !memory.owns(caller, base, TSS_SIZE as u32) {
                return Err(GateError::OutOfReach(base));
            }
            let tss = memory.read_tss(base).ok_or(GateError::OutOfReach(base))?;
            let copy = tasks.adopt_tss(gdt, memory, caller, selector, &tss)?;
            gdt.patch_tss_base_limit(selector, copy, TSS_LIMIT)?
        }
        GdtRequest::Ldt {
            selector,
            base,
            limit,
        } if caller == PrivilegeLevel::Ring0 => gdt.patch_ldt_base_limit(selector, base, limit)?,
        GdtRequest::Ldt {
            selector,
            base,
            limit,
        } => {
            if limit > LDT_LIMIT || !memory.owns(caller, base, limit + 1) {
                return Err(GateError::OutOfReach(base));
            }
            let ldt = memory.read_ldt(base).ok_or(GateError::OutOfReach(base))?;
            let copy = tasks.adopt_ldt(caller, selector, &ldt, limit)?;
            gdt.patch_ldt_base_limit(selector, copy, limit)?
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtRequest {
    pub vector: u32,
    pub handler: u32,
    pub dpl: PrivilegeLevel,
}

impl IdtRequest {
    pub fn decode(regs: &GateRegs) -> GateResult<Self> {
        if regs.eax > 3 {
            return Err(GateError::BadArgument(regs.eax));
        }
        Ok(Self {
            vector: regs.ecx,
            handler: regs.ebx,
            dpl: ring(regs.eax as u8),
        })
    }

    pub fn encode(&self) -> GateRegs {
        GateRegs {
            eax: self.dpl as u32,
            ebx: self.handler,
            ecx: self.vector,
            edx: 0,
        }
    }
}

/// Serves one `CG_IDT_SET` request. Exception vectors stay with ring 0.
pub fn dispatch_idt_set(
    idt: &mut InterruptTable<'_>,
    caller: PrivilegeLevel,
    regs: &GateRegs,
) -> GateResult<()> {
    let request = IdtRequest::decode(regs)?;
    if (request.vector as usize) < EXCEPTION_VECTORS {
        return Err(GateError::ReservedVector(request.vector));
    }
    require(caller, request.dpl)?;
    idt.install_entry(request.vector as usize, request.handler, request.dpl)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintRequest {
    pub color: u8,
    pub message: u32,
    /// (row, column); `None` prints at the cursor.
    pub position: Option<(u8, u8)>,
}

impl PrintRequest {
    pub fn decode(regs: &GateRegs) -> Self {
        let packed = regs.ecx as u16;
        Self {
            color: regs.eax as u8,
            message: regs.ebx,
            position: (packed != 0).then(|| (packed as u8, (packed >> 8) as u8)),
        }
    }

    pub fn encode(&self) -> GateRegs {
        let packed = match self.position {
            Some((row, col)) => (row as u32) | ((col as u32) << 8),
            None => 0,
        };
        GateRegs {
            eax: self.color as u32,
            ebx: self.message,
            ecx: packed,
            edx: 0,
        }
    }
}

/// Longest message ring 0 reads at `addr` for `caller`. The caller's own
/// segments bound what it may hand over.
pub fn message_window(caller: PrivilegeLevel, addr: u32) -> GateResult<usize> {
    let end = reach(caller);
    if addr >= end {
        return Err(GateError::OutOfReach(addr));
    }
    Ok(((end - addr) as usize).min(MAX_PRINT_LEN))
}

/// Renders a decoded print request whose message bytes were already fetched.
pub fn dispatch_print(console: &mut TextConsole<'_>, request: &PrintRequest, message: &[u8]) {
    match request.position {
        None => console.puts(message, request.color),
        Some((row, col)) => console.puts_at(message, request.color, row as usize, col as usize),
    }
}

/// Turns a dispatcher result into the EAX status word.
pub fn status(service: &str, result: GateResult<()>) -> u32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            log::warn!("{}: {}", service, e);
            e.code()
        }
    }
}

/// Ring-0 targets of the call-gate stubs.
#[cfg(target_arch = "x86")]
pub(crate) mod entry {
    use super::*;
    use adopt::hardware::TASK_STORE;
    use adopt::RingRegions;

    fn caller_ring(cs: u32) -> PrivilegeLevel {
        ring(cs as u8)
    }

    pub extern "C" fn gdt_set(eax: u32, ebx: u32, ecx: u32, edx: u32, caller_cs: u32) -> u32 {
        let regs = GateRegs { eax, ebx, ecx, edx };
        // SAFETY: ring 0 runs one gate at a time with interrupts disabled.
        let mut gdt = unsafe { crate::kernel::gdt::system_table() };
        let mut tasks = TASK_STORE.lock();
        let result = dispatch_gdt_set(&mut gdt, &mut tasks, &RingRegions, caller_ring(caller_cs), &regs);
        status("gdt_set", result)
    }

    pub extern "C" fn idt_set(eax: u32, ebx: u32, ecx: u32, edx: u32, caller_cs: u32) -> u32 {
        let regs = GateRegs { eax, ebx, ecx, edx };
        // SAFETY: as above.
        let mut idt = unsafe { crate::kernel::idt::system_table() };
        status("idt_set", dispatch_idt_set(&mut idt, caller_ring(caller_cs), &regs))
    }

    pub extern "C" fn printr(eax: u32, ebx: u32, ecx: u32, edx: u32, caller_cs: u32) -> u32 {
        let request = PrintRequest::decode(&GateRegs { eax, ebx, ecx, edx });
        let window = match message_window(caller_ring(caller_cs), request.message) {
            Ok(window) => window,
            Err(e) => return status("printr", Err(e)),
        };
        // SAFETY: every segment has base 0, so EBX is a linear address; the
        // scan stays inside the caller's reach.
        let message = unsafe { c_string(request.message as usize as *const u8, window) };
        crate::console::with_console(|console| dispatch_print(console, &request, message));
        0
    }

    pub extern "C" fn unbound(_eax: u32, _ebx: u32, _ecx: u32, edx: u32, _caller_cs: u32) -> u32 {
        status("unbound gate", Err(GateError::UnknownOpcode(edx)))
    }

    unsafe fn c_string<'a>(ptr: *const u8, max: usize) -> &'a [u8] {
        let mut len = 0;
        while len < max && *ptr.add(len) != 0 {
            len += 1;
        }
        core::slice::from_raw_parts(ptr, len)
    }
}
