//! 32-bit Task State Segment
//!
//! In this kernel a TSS serves two purposes:
//! - it names the stack the CPU switches to when code running in the task
//!   enters a more privileged ring (through a call gate or an interrupt);
//! - it is the target of a hardware task switch (`ljmp` to its selector), which
//!   loads every register, LDTR and CR3 from the fields below.

use core::mem::{offset_of, size_of};

use static_assertions::const_assert;
use static_assertions::const_assert_eq;
use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::kernel::error::TaskError;
use crate::layout::data_selector_for;

/// Architectural TSS size in bytes.
pub const TSS_SIZE: usize = 104;
pub const TSS_LIMIT: u32 = (TSS_SIZE - 1) as u32;

/// IOPB offset past the segment limit: no I/O permission bitmap.
pub const IO_MAP_DISABLED: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Tss32 {
    pub back_link: u16,
    _reserved0: u16,
    pub ring0_stack: u32,
    pub ring0_ss: u16,
    _reserved1: u16,
    pub ring1_stack: u32,
    pub ring1_ss: u16,
    _reserved2: u16,
    pub ring2_stack: u32,
    pub ring2_ss: u16,
    _reserved3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _reserved4: u16,
    pub cs: u16,
    _reserved5: u16,
    pub ss: u16,
    _reserved6: u16,
    pub ds: u16,
    _reserved7: u16,
    pub fs: u16,
    _reserved8: u16,
    pub gs: u16,
    _reserved9: u16,
    pub ldt: u16,
    _reserved10: u16,
    pub debug_trap: u16,
    pub io_map_base: u16,
}

const_assert!(size_of::<Tss32>() >= TSS_SIZE);
const_assert_eq!(offset_of!(Tss32, ring0_stack), 4);
const_assert_eq!(offset_of!(Tss32, ring2_ss), 24);
const_assert_eq!(offset_of!(Tss32, cr3), 28);
const_assert_eq!(offset_of!(Tss32, eip), 32);
const_assert_eq!(offset_of!(Tss32, es), 72);
const_assert_eq!(offset_of!(Tss32, ldt), 96);
const_assert_eq!(offset_of!(Tss32, io_map_base), 102);

impl Tss32 {
    pub const fn zeroed() -> Self {
        Self {
            back_link: 0,
            _reserved0: 0,
            ring0_stack: 0,
            ring0_ss: 0,
            _reserved1: 0,
            ring1_stack: 0,
            ring1_ss: 0,
            _reserved2: 0,
            ring2_stack: 0,
            ring2_ss: 0,
            _reserved3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _reserved4: 0,
            cs: 0,
            _reserved5: 0,
            ss: 0,
            _reserved6: 0,
            ds: 0,
            _reserved7: 0,
            fs: 0,
            _reserved8: 0,
            gs: 0,
            _reserved9: 0,
            ldt: 0,
            _reserved10: 0,
            debug_trap: 0,
            io_map_base: 0,
        }
    }

    pub fn base(&self) -> u32 {
        self as *const Self as usize as u32
    }

    fn set_inner_stack(&mut self, ring: usize, top: u32) {
        let ss = data_selector_for(crate::kernel::gdt::descriptor::ring(ring as u8)).0;
        match ring {
            0 => (self.ring0_stack, self.ring0_ss) = (top, ss),
            1 => (self.ring1_stack, self.ring1_ss) = (top, ss),
            _ => (self.ring2_stack, self.ring2_ss) = (top, ss),
        }
    }
}

/// What a task is for; decides whether it runs with interrupts enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    /// Services a device interrupt; runs with IF clear.
    Irq,
    Sched,
    Main,
    Nested,
}

impl TaskRole {
    pub const fn interrupts_enabled(self) -> bool {
        !matches!(self, Self::Irq)
    }
}

/// Segment and privilege context shared by every task of one ring.
#[derive(Debug, Clone, Copy)]
pub struct TaskLayout {
    pub ring: PrivilegeLevel,
    pub iopl: PrivilegeLevel,
    pub code: SegmentSelector,
    pub data: SegmentSelector,
    pub gs: SegmentSelector,
    pub ldt: SegmentSelector,
}

/// Per-task runtime values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub entry: u32,
    pub stack_top: u32,
    pub cr3: u32,
}

pub fn task_eflags(role: TaskRole, iopl: PrivilegeLevel) -> u32 {
    let mut flags = RFlags::empty();
    if role.interrupts_enabled() {
        flags |= RFlags::INTERRUPT_FLAG;
    }
    if iopl as u8 & 1 != 0 {
        flags |= RFlags::IOPL_LOW;
    }
    if iopl as u8 & 2 != 0 {
        flags |= RFlags::IOPL_HIGH;
    }
    flags.bits() as u32
}

/// Fills a TSS for one task of `layout.ring`.
///
/// `inner` holds stack tops for rings 0, 1, ... in order. A task must carry a
/// stack for every ring more privileged than its own; at most rings 0..=2 have
/// TSS slots.
pub fn build_tss(
    layout: &TaskLayout,
    role: TaskRole,
    ctx: TaskContext,
    inner: &[u32],
) -> Result<Tss32, TaskError> {
    let needed = layout.ring as usize;
    if inner.len() < needed || inner.len() > 3 {
        return Err(TaskError::InnerStacks {
            ring: layout.ring,
            provided: inner.len(),
        });
    }

    let mut tss = Tss32::zeroed();
    for (ring, top) in inner.iter().enumerate() {
        tss.set_inner_stack(ring, *top);
    }
    tss.cr3 = ctx.cr3;
    tss.eip = ctx.entry;
    tss.esp = ctx.stack_top;
    tss.eflags = task_eflags(role, layout.iopl);
    tss.cs = layout.code.0;
    tss.ss = layout.data.0;
    tss.ds = layout.data.0;
    tss.es = layout.data.0;
    tss.fs = layout.data.0;
    tss.gs = layout.gs.0;
    tss.ldt = layout.ldt.0;
    tss.io_map_base = IO_MAP_DISABLED;
    Ok(tss)
}
