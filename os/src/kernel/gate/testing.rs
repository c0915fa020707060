//! Host harness for code written against the call gates.
//!
//! Host vectors stand in for the GDT, IDT and VGA buffer; [`Bench::run`] hands
//! the closure a [`DirectCore`] for the given caller ring.

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use super::adopt::{CallerMemory, TaskStore};
use super::services::DirectCore;
use crate::console::{TextConsole, COLS, ROWS};
use crate::kernel::gdt::descriptor::Descriptor;
use crate::kernel::gdt::ldt::Ldt;
use crate::kernel::gdt::tss::Tss32;
use crate::kernel::gdt::{build_system_table, DescriptorTable};
use crate::kernel::idt::InterruptTable;
use crate::layout::{in_region, GDT_ENTRIES, IDT_ENTRIES};

/// Ownership policy for host-built task state, whose stacks live on the heap.
pub struct AnyAddress;

impl CallerMemory for AnyAddress {
    fn owns(&self, _ring: PrivilegeLevel, _addr: u32, _len: u32) -> bool {
        true
    }

    fn read_tss(&self, _addr: u32) -> Option<Tss32> {
        None
    }

    fn read_ldt(&self, _addr: u32) -> Option<Ldt> {
        None
    }
}

/// Task state staged at fixed addresses inside the region of `ring`.
pub struct Staged {
    pub ring: PrivilegeLevel,
    pub tss: Option<(u32, Tss32)>,
    pub ldt: Option<(u32, Ldt)>,
}

impl Staged {
    pub fn new(ring: PrivilegeLevel) -> Self {
        Self {
            ring,
            tss: None,
            ldt: None,
        }
    }
}

impl CallerMemory for Staged {
    fn owns(&self, ring: PrivilegeLevel, addr: u32, len: u32) -> bool {
        ring == self.ring && in_region(ring, addr, len)
    }

    fn read_tss(&self, addr: u32) -> Option<Tss32> {
        self.tss.filter(|(at, _)| *at == addr).map(|(_, tss)| tss)
    }

    fn read_ldt(&self, addr: u32) -> Option<Ldt> {
        self.ldt.filter(|(at, _)| *at == addr).map(|(_, ldt)| ldt)
    }
}

pub struct Bench {
    pub gdt: Vec<Descriptor>,
    pub idt: Vec<Descriptor>,
    pub cells: Vec<u16>,
    pub tasks: Box<TaskStore>,
}

impl Bench {
    /// System GDT built, IDT and screen blank, page directory 0x1F_0000.
    pub fn new() -> Self {
        let mut gdt = vec![Descriptor::NULL; GDT_ENTRIES];
        build_system_table(&mut DescriptorTable::new(&mut gdt)).unwrap();
        let mut tasks = Box::new(TaskStore::new());
        tasks.set_directory(0x1F_0000);
        Self {
            gdt,
            idt: vec![Descriptor::NULL; IDT_ENTRIES],
            cells: vec![0; COLS * ROWS],
            tasks,
        }
    }

    pub fn run<R>(&mut self, caller: PrivilegeLevel, f: impl FnOnce(&mut DirectCore<'_, '_>) -> R) -> R {
        let mut gdt = DescriptorTable::new(&mut self.gdt);
        let mut idt = InterruptTable::new(&mut self.idt);
        let mut console = TextConsole::new(&mut self.cells);
        let mut core = DirectCore::new(&mut gdt, &mut idt, &mut console, &mut self.tasks, &AnyAddress, caller);
        f(&mut core)
    }

    pub fn slot(&self, selector: SegmentSelector) -> Descriptor {
        self.gdt[selector.index() as usize]
    }

    /// Text of screen row `row`, trailing blanks trimmed.
    pub fn row_text(&self, row: usize) -> String {
        let text: String = self.cells[row * COLS..(row + 1) * COLS]
            .iter()
            .map(|cell| match *cell as u8 {
                0 => ' ',
                byte => byte as char,
            })
            .collect();
        text.trim_end().to_string()
    }
}
