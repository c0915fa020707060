//! Interrupt Descriptor Table
//!
//! 256 interrupt gates at `IDT_START`. Every vector starts out bound to the
//! catch-all handler; vectors 0..32 are then bound to the exception
//! reporters, and rings may bind device vectors above 32 through `CG_IDT_SET`.
//!
//! Entries are overwritten in place. Callers edit a vector only while it cannot
//! fire: before `sti`, or with the vector masked at the PIC.

pub mod handlers;

use x86_64::PrivilegeLevel;

use crate::kernel::error::TableResult;
use crate::kernel::gdt::descriptor::{Descriptor, SystemType};
use crate::kernel::gdt::{DescriptorTable, TablePointer};
use crate::layout::code_selector_for;

/// Vectors 0..32 are CPU exceptions.
pub const EXCEPTION_VECTORS: usize = 32;

/// Keyboard IRQ1 after the PIC is remapped to 0x20.
pub const KEY_INT: u8 = 0x21;

/// 32-bit interrupt gate into the code segment of `dpl`.
pub const fn interrupt_gate(handler: u32, dpl: PrivilegeLevel) -> Descriptor {
    Descriptor::gate(
        code_selector_for(dpl),
        handler,
        dpl,
        SystemType::InterruptGate,
        0,
    )
}

pub struct InterruptTable<'a> {
    table: DescriptorTable<'a>,
}

impl<'a> InterruptTable<'a> {
    pub fn new(slots: &'a mut [Descriptor]) -> Self {
        Self {
            table: DescriptorTable::new(slots),
        }
    }

    /// Binds every vector to `handler` at ring 0.
    pub fn install_default(&mut self, handler: u32) {
        self.table.fill(interrupt_gate(handler, PrivilegeLevel::Ring0));
    }

    pub fn install_exception_vectors(&mut self, handlers: &[u32; EXCEPTION_VECTORS]) -> TableResult<()> {
        for (vector, handler) in handlers.iter().enumerate() {
            self.install_entry(vector, *handler, PrivilegeLevel::Ring0)?;
        }
        Ok(())
    }

    pub fn install_entry(&mut self, index: usize, handler: u32, dpl: PrivilegeLevel) -> TableResult<()> {
        self.table.install(index, interrupt_gate(handler, dpl))
    }

    pub fn read(&self, index: usize) -> TableResult<Descriptor> {
        self.table.read(index)
    }

    pub fn pointer(&self) -> TablePointer {
        self.table.pointer()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }
}

/// The live IDT at `IDT_START`.
///
/// # Safety
/// Same contract as [`crate::kernel::gdt::system_table`].
#[cfg(target_arch = "x86")]
pub unsafe fn system_table() -> InterruptTable<'static> {
    use crate::layout::{IDT_ENTRIES, IDT_START};
    InterruptTable {
        table: DescriptorTable::from_raw(IDT_START as usize as *mut Descriptor, IDT_ENTRIES),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::*;
    use x86_64::PrivilegeLevel::*;

    fn blank() -> [Descriptor; IDT_ENTRIES] {
        [Descriptor::NULL; IDT_ENTRIES]
    }

    #[test]
    fn test_page_fault_vector_encoding() {
        let mut slots = blank();
        let mut idt = InterruptTable::new(&mut slots);
        idt.install_entry(14, 0xDEAD_BEEF, Ring0).unwrap();

        let entry = idt.read(14).unwrap();
        assert_eq!(entry.low(), 0x0008_BEEF);
        assert_eq!(entry.high(), 0xDEAD_8E00);
        assert_eq!(entry.gate_selector(), CORE_CODE);
        assert_eq!(entry.gate_offset(), 0xDEAD_BEEF);
        assert_eq!(entry.access().bits(), 0x8E);
    }

    #[test]
    fn test_entry_selector_follows_dpl() {
        let mut slots = blank();
        let mut idt = InterruptTable::new(&mut slots);
        idt.install_entry(KEY_INT as usize, 0x0010_2000, Ring1).unwrap();

        let entry = idt.read(KEY_INT as usize).unwrap();
        assert_eq!(entry.gate_selector(), DEVS_CODE);
        assert_eq!(entry.dpl(), Ring1);
        assert_eq!(entry.access().bits(), 0xAE);
    }

    #[test]
    fn test_default_then_exceptions() {
        let mut slots = blank();
        let mut idt = InterruptTable::new(&mut slots);
        idt.install_default(0x0010_0000);

        let handlers: [u32; EXCEPTION_VECTORS] = core::array::from_fn(|v| 0x0020_0000 + v as u32 * 0x10);
        idt.install_exception_vectors(&handlers).unwrap();

        for vector in 0..EXCEPTION_VECTORS {
            assert_eq!(idt.read(vector).unwrap().gate_offset(), handlers[vector]);
        }
        for vector in EXCEPTION_VECTORS..IDT_ENTRIES {
            let entry = idt.read(vector).unwrap();
            assert_eq!(entry.gate_offset(), 0x0010_0000);
            assert!(entry.is_present());
        }
    }

    #[test]
    fn test_default_covers_short_tables() {
        let mut slots = [Descriptor::NULL; 4];
        let mut idt = InterruptTable::new(&mut slots);
        idt.install_default(0x0010_0040);
        assert_eq!(idt.capacity(), 4);
        for vector in 0..4 {
            assert_eq!(idt.read(vector).unwrap(), interrupt_gate(0x0010_0040, Ring0));
        }
    }

    #[test]
    fn test_out_of_range_vector() {
        let mut slots = blank();
        let mut idt = InterruptTable::new(&mut slots);
        assert!(idt.install_entry(IDT_ENTRIES, 0x1000, Ring0).is_err());
        let limit = idt.pointer().limit;
        assert_eq!(limit, 0x7FF);
    }
}
