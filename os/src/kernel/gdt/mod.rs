//! Global Descriptor Table
//!
//! The GDT is one fixed 64 KiB region (8192 slots) at `GDT_START`, shared by
//! every ring. It is zero-filled once, populated with the static system map by
//! [`build_system_table`], and afterwards only mutated by ring 0: directly
//! during core setup, and on behalf of outer rings through the `CG_GDT_SET`
//! dispatcher.
//!
//! # Safety
//!
//! [`system_table`] hands out a view over raw physical memory. There is one
//! writer at a time by construction (single core, interrupts disabled while
//! any table is edited); callers must keep it that way.

pub mod descriptor;
pub mod ldt;
pub mod tss;

#[cfg(test)]
mod tests;

use core::slice;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel::{Ring0, Ring1, Ring2, Ring3};

use crate::kernel::error::{TableError, TableResult};
use crate::layout::*;
use descriptor::{Access, Descriptor, Flags, SystemType};

/// Operand of `lgdt`/`lidt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct TablePointer {
    pub limit: u16,
    pub base: u32,
}

/// A typed view over a descriptor table in memory.
///
/// Only checked-index operations are exposed. The three partial patches
/// rewrite address fields of an existing placeholder and leave its access
/// byte alone, so privilege and type stay exactly as built.
pub struct DescriptorTable<'a> {
    slots: &'a mut [Descriptor],
}

impl<'a> DescriptorTable<'a> {
    pub fn new(slots: &'a mut [Descriptor]) -> Self {
        Self { slots }
    }

    /// # Safety
    /// `base` must point to `len` writable descriptors that nothing else
    /// references for the lifetime of the table.
    pub unsafe fn from_raw(base: *mut Descriptor, len: usize) -> Self {
        Self {
            slots: slice::from_raw_parts_mut(base, len),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn pointer(&self) -> TablePointer {
        TablePointer {
            // An empty view has no last byte; lgdt reads limit 0 as one byte.
            limit: (self.slots.len() * 8).saturating_sub(1) as u16,
            base: self.slots.as_ptr() as usize as u32,
        }
    }

    pub fn zero_fill(&mut self) {
        self.fill(Descriptor::NULL);
    }

    /// Writes `descriptor` into every slot, the null slot included.
    pub fn fill(&mut self, descriptor: Descriptor) {
        self.slots.fill(descriptor);
    }

    fn check(&self, index: usize) -> TableResult<()> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(TableError::IndexOutOfRange {
                index,
                capacity: self.slots.len(),
            })
        }
    }

    pub fn install(&mut self, index: usize, descriptor: Descriptor) -> TableResult<()> {
        self.check(index)?;
        self.slots[index] = descriptor;
        Ok(())
    }

    pub fn read(&self, index: usize) -> TableResult<Descriptor> {
        self.check(index)?;
        Ok(self.slots[index])
    }

    pub fn install_at(&mut self, selector: SegmentSelector, descriptor: Descriptor) -> TableResult<()> {
        self.install(selector.index() as usize, descriptor)
    }

    pub fn read_at(&self, selector: SegmentSelector) -> TableResult<Descriptor> {
        self.read(selector.index() as usize)
    }

    fn expect_type(
        &self,
        index: usize,
        expected: &'static str,
        matches: impl Fn(SystemType) -> bool,
    ) -> TableResult<Descriptor> {
        let current = self.read(index)?;
        match current.system_type() {
            Some(ty) if matches(ty) => Ok(current),
            _ => Err(TableError::TypeMismatch {
                index,
                expected,
                found: current.access().bits(),
            }),
        }
    }

    /// Late-binds the target of a call-gate placeholder.
    pub fn patch_call_gate_offset(
        &mut self,
        selector: SegmentSelector,
        handler: u32,
        param_count: u8,
    ) -> TableResult<()> {
        let index = selector.index() as usize;
        let gate = self.expect_type(index, "call gate", |ty| ty == SystemType::CallGate)?;
        self.slots[index] = gate.with_gate_target(handler, param_count);
        Ok(())
    }

    pub fn patch_tss_base_limit(
        &mut self,
        selector: SegmentSelector,
        base: u32,
        limit: u32,
    ) -> TableResult<()> {
        let index = selector.index() as usize;
        let tss = self.expect_type(index, "TSS", SystemType::is_tss)?;
        self.slots[index] = tss.with_base_limit(base, limit);
        Ok(())
    }

    pub fn patch_ldt_base_limit(
        &mut self,
        selector: SegmentSelector,
        base: u32,
        limit: u32,
    ) -> TableResult<()> {
        let index = selector.index() as usize;
        let ldt = self.expect_type(index, "LDT", |ty| ty == SystemType::Ldt)?;
        self.slots[index] = ldt.with_base_limit(base, limit);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Descriptor)> + '_ {
        self.slots.iter().copied().enumerate()
    }
}

/// The live GDT at `GDT_START`.
///
/// # Safety
/// Identity mapping must cover `GDT_START` and no other `DescriptorTable`
/// over the same region may be alive.
#[cfg(target_arch = "x86")]
pub unsafe fn system_table() -> DescriptorTable<'static> {
    DescriptorTable::from_raw(GDT_START as usize as *mut Descriptor, GDT_ENTRIES)
}

const fn flat(limit: u32, kind: Access, dpl: x86_64::PrivilegeLevel) -> Descriptor {
    Descriptor::segment(0, limit, Access::segment(kind, dpl), Flags::PROTECTED_4K)
}

const fn placeholder(ty: SystemType, limit: u32, dpl: x86_64::PrivilegeLevel) -> Descriptor {
    Descriptor::segment(0, limit, Access::system(ty, dpl), Flags::empty())
}

const fn call_gate(target: SegmentSelector, dpl: x86_64::PrivilegeLevel, params: u8) -> Descriptor {
    Descriptor::gate(target, 0, dpl, SystemType::CallGate, params)
}

/// Static descriptor map installed at boot.
///
/// Code/data segments for rings 0..3 shrink downwards so that each ring only
/// reaches memory below its own region. TSS/LDT and call-gate slots are
/// placeholders whose type and DPL are fixed here; addresses are patched in
/// later, for outer-ring tasks to ring 0's adopted copies.
pub const SYSTEM_DESCRIPTORS: [(SegmentSelector, Descriptor); 28] = [
    (CORE_CODE, flat(MEM_LIMIT, Access::CODE_EXECUTE_READ, Ring0)),
    (CORE_DATA, flat(MEM_LIMIT, Access::DATA_READ_WRITE, Ring0)),
    (DEVS_CODE, flat(DEVS_LIMIT, Access::CODE_EXECUTE_READ, Ring1)),
    (DEVS_DATA, flat(DEVS_LIMIT, Access::DATA_READ_WRITE, Ring1)),
    (LIBS_CODE, flat(LIBS_LIMIT, Access::CODE_EXECUTE_READ, Ring2)),
    (LIBS_DATA, flat(LIBS_LIMIT, Access::DATA_READ_WRITE, Ring2)),
    (USERS_CODE, flat(USERS_SYS_LIMIT, Access::CODE_EXECUTE_READ, Ring3)),
    (USERS_DATA, flat(USERS_SYS_LIMIT, Access::DATA_READ_WRITE, Ring3)),
    (TSS_CORE, placeholder(SystemType::TssAvailable, 1024, Ring0)),
    (LDT_CORE, placeholder(SystemType::Ldt, 1024, Ring0)),
    (TSS_DEVS_IRQ, placeholder(SystemType::TssAvailable, 0, Ring1)),
    (LDT_DEVS, placeholder(SystemType::Ldt, 0, Ring1)),
    (TSS_DEVS_SCHED, placeholder(SystemType::TssAvailable, 0, Ring1)),
    (DEVS_ACCES_DATA, flat(MEM_LIMIT, Access::DATA_READ_WRITE, Ring1)),
    (TSS_LIBS_IRQ, placeholder(SystemType::TssAvailable, 0, Ring2)),
    (LDT_LIBS, placeholder(SystemType::Ldt, 0, Ring2)),
    (TSS_LIBS_SCHED, placeholder(SystemType::TssAvailable, 0, Ring2)),
    (TSS_MAIN_TASK, placeholder(SystemType::TssAvailable, 0, Ring3)),
    (LDT_USERS, placeholder(SystemType::Ldt, 0, Ring3)),
    (TSS_USERS_TASK, placeholder(SystemType::TssAvailable, 0, Ring3)),
    (USRS_ACCES_DATA, flat(DEVS_LIMIT, Access::DATA_READ_WRITE, Ring3)),
    (CG_IDT_SET, call_gate(CORE_CODE, Ring1, 0)),
    (CG_CORE_TX_IRQ, call_gate(CORE_CODE, Ring3, 1)),
    (CG_CORE_PRINTR, call_gate(CORE_CODE, Ring3, 1)),
    (CG_LIBS_TX_IRQ, call_gate(LIBS_CODE, Ring3, 1)),
    (CG_DEVS_TTY_W, call_gate(DEVS_CODE, Ring2, 3)),
    (CG_GDT_SET, call_gate(CORE_CODE, Ring3, 0)),
    (CG_CORE_RESUME, call_gate(CORE_CODE, Ring3, 0)),
];

/// Installs [`SYSTEM_DESCRIPTORS`] into a zeroed table.
pub fn build_system_table(gdt: &mut DescriptorTable<'_>) -> TableResult<()> {
    for (selector, descriptor) in SYSTEM_DESCRIPTORS {
        gdt.install_at(selector, descriptor)?;
    }
    log::debug!(
        "gdt: {} system descriptors installed, limit 0x{:x}",
        SYSTEM_DESCRIPTORS.len(),
        { gdt.pointer().limit }
    );
    Ok(())
}
