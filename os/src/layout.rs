//! Fixed physical memory layout and GDT selector map.
//!
//! The descriptor tables sit at the top of an 8 MiB pool. Below them are four
//! 64 KiB regions (core, devs, libs, users). Each ring's stack starts one word
//! under the region above it. All segment bases are zero; rings are separated
//! by segment limit, descriptor DPL and page-level U/S bits.

use core::ops::Range;

use static_assertions::const_assert;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

pub const PAGE_SIZE: u32 = 0x1000;

pub const MEM_SIZE: u32 = 0x80_0000;

pub const GDT_ENTRIES: usize = 8192;
pub const GDT_SIZE: u32 = (GDT_ENTRIES * 8) as u32;
pub const GDT_START: u32 = MEM_SIZE - GDT_SIZE;

pub const IDT_ENTRIES: usize = 256;
/// 256 gates, reserved twice over so the IDT owns a whole page.
pub const IDT_SIZE: u32 = (IDT_ENTRIES * 8 * 2) as u32;
pub const IDT_START: u32 = GDT_START - IDT_SIZE;

pub const REGION_SIZE: u32 = 0x1_0000;
pub const CORE_START: u32 = IDT_START - REGION_SIZE;
pub const DEVS_START: u32 = CORE_START - REGION_SIZE;
pub const LIBS_START: u32 = DEVS_START - REGION_SIZE;
pub const USERS_START: u32 = LIBS_START - REGION_SIZE;

/// Load address of the init image (and of the ELF kernel's upper half).
pub const INIT_START: u32 = 0x20_0000;

pub const CORE_STACK: u32 = IDT_START - 4;
pub const DEVS_STACK: u32 = CORE_START - 4;
pub const LIBS_STACK: u32 = DEVS_START - 4;
pub const USERS_STACK: u32 = LIBS_START - 4;

/// Segment limits, in 4 KiB pages.
pub const MEM_LIMIT: u32 = MEM_SIZE / PAGE_SIZE - 1;
pub const SYS_LIMIT: u32 = MEM_LIMIT;
pub const DEVS_LIMIT: u32 = CORE_START / PAGE_SIZE - 1;
pub const LIBS_LIMIT: u32 = DEVS_START / PAGE_SIZE - 1;
pub const USERS_SYS_LIMIT: u32 = LIBS_START / PAGE_SIZE - 1;

/// First byte of the supervisor-only upper pool: the libs, devs and core
/// regions and both descriptor tables. Only the users region and the shared
/// read-only kernel image are mapped user-accessible.
pub const SUPERVISOR_START: u32 = LIBS_START;
/// Legacy BIOS/real-mode area, supervisor-only.
pub const LOW_MEM_END: u32 = 0x10_0000;

const_assert!(GDT_START == 0x7F_0000);
const_assert!(IDT_START == 0x7E_F000);
const_assert!(CORE_START == 0x7D_F000);
const_assert!(USERS_START == 0x7A_F000);
const_assert!(INIT_START < USERS_START);
const_assert!(SUPERVISOR_START % PAGE_SIZE == 0);
const_assert!(REGION_SIZE % PAGE_SIZE == 0);

/// GDT selector in slot `index` requested at `rpl`.
pub const fn gdt(index: u16, rpl: PrivilegeLevel) -> SegmentSelector {
    SegmentSelector::new(index, rpl)
}

/// LDT selector (TI bit set) for slot `index` requested at `rpl`.
pub const fn ldt(index: u16, rpl: PrivilegeLevel) -> SegmentSelector {
    SegmentSelector((index << 3) | 0b100 | rpl as u16)
}

use PrivilegeLevel::{Ring0, Ring1, Ring2, Ring3};

pub const NULL_SELECTOR: SegmentSelector = SegmentSelector(0);

pub const CORE_CODE: SegmentSelector = gdt(1, Ring0);
pub const CORE_DATA: SegmentSelector = gdt(2, Ring0);
pub const DEVS_CODE: SegmentSelector = gdt(3, Ring1);
pub const DEVS_DATA: SegmentSelector = gdt(4, Ring1);
pub const LIBS_CODE: SegmentSelector = gdt(5, Ring2);
pub const LIBS_DATA: SegmentSelector = gdt(6, Ring2);
pub const USERS_CODE: SegmentSelector = gdt(7, Ring3);
pub const USERS_DATA: SegmentSelector = gdt(8, Ring3);

pub const TSS_CORE: SegmentSelector = gdt(9, Ring0);
pub const LDT_CORE: SegmentSelector = gdt(10, Ring0);
pub const TSS_DEVS_IRQ: SegmentSelector = gdt(11, Ring0);
pub const LDT_DEVS: SegmentSelector = gdt(12, Ring0);
pub const TSS_DEVS_SCHED: SegmentSelector = gdt(13, Ring0);
pub const DEVS_ACCES_DATA: SegmentSelector = gdt(14, Ring1);
pub const TSS_LIBS_IRQ: SegmentSelector = gdt(15, Ring0);
pub const LDT_LIBS: SegmentSelector = gdt(16, Ring0);
pub const TSS_LIBS_SCHED: SegmentSelector = gdt(17, Ring0);
pub const TSS_MAIN_TASK: SegmentSelector = gdt(19, Ring0);
pub const LDT_USERS: SegmentSelector = gdt(20, Ring0);
pub const TSS_USERS_TASK: SegmentSelector = gdt(21, Ring0);
pub const USRS_ACCES_DATA: SegmentSelector = gdt(22, Ring3);

pub const CG_IDT_SET: SegmentSelector = gdt(23, Ring0);
pub const CG_CORE_TX_IRQ: SegmentSelector = gdt(32, Ring0);
pub const CG_CORE_PRINTR: SegmentSelector = gdt(33, Ring0);
pub const CG_LIBS_TX_IRQ: SegmentSelector = gdt(34, Ring0);
pub const CG_DEVS_TTY_W: SegmentSelector = gdt(35, Ring0);
pub const CG_GDT_SET: SegmentSelector = gdt(36, Ring0);
pub const CG_CORE_RESUME: SegmentSelector = gdt(37, Ring0);

pub const CORE_LDT_CODE: SegmentSelector = ldt(0, Ring0);
pub const CORE_LDT_DATA: SegmentSelector = ldt(1, Ring0);
pub const DEVS_LDT_CODE: SegmentSelector = ldt(0, Ring1);
pub const DEVS_LDT_DATA: SegmentSelector = ldt(1, Ring1);
pub const LIBS_LDT_CODE: SegmentSelector = ldt(0, Ring2);
pub const LIBS_LDT_DATA: SegmentSelector = ldt(1, Ring2);
pub const USERS_LDT_CODE: SegmentSelector = ldt(0, Ring3);
pub const USERS_LDT_DATA: SegmentSelector = ldt(1, Ring3);

/// Code segment a handler bound at `dpl` runs in.
pub const fn code_selector_for(dpl: PrivilegeLevel) -> SegmentSelector {
    match dpl {
        Ring0 => CORE_CODE,
        Ring1 => DEVS_CODE,
        Ring2 => LIBS_CODE,
        Ring3 => USERS_CODE,
    }
}

/// Stack segment used when the CPU switches to ring `dpl`.
pub const fn data_selector_for(dpl: PrivilegeLevel) -> SegmentSelector {
    match dpl {
        Ring0 => CORE_DATA,
        Ring1 => DEVS_DATA,
        Ring2 => LIBS_DATA,
        Ring3 => USERS_DATA,
    }
}

/// LDT the tasks of ring `dpl` run with.
pub const fn ldt_selector_for(dpl: PrivilegeLevel) -> SegmentSelector {
    match dpl {
        Ring0 => LDT_CORE,
        Ring1 => LDT_DEVS,
        Ring2 => LDT_LIBS,
        Ring3 => LDT_USERS,
    }
}

/// Private 64 KiB region of ring `dpl`: statics, task state and stacks.
pub const fn region(dpl: PrivilegeLevel) -> Range<u32> {
    match dpl {
        Ring0 => CORE_START..IDT_START,
        Ring1 => DEVS_START..CORE_START,
        Ring2 => LIBS_START..DEVS_START,
        Ring3 => USERS_START..LIBS_START,
    }
}

/// One past the last byte the flat segments of ring `dpl` reach.
pub const fn reach(dpl: PrivilegeLevel) -> u32 {
    match dpl {
        Ring0 => MEM_SIZE,
        Ring1 => CORE_START,
        Ring2 => DEVS_START,
        Ring3 => LIBS_START,
    }
}

/// Whether `addr..addr + len` lies inside the private region of `dpl`.
pub const fn in_region(dpl: PrivilegeLevel, addr: u32, len: u32) -> bool {
    let region = region(dpl);
    match addr.checked_add(len) {
        Some(end) => addr >= region.start && end <= region.end,
        None => false,
    }
}

const_assert!((DEVS_LIMIT + 1) * PAGE_SIZE == CORE_START);
const_assert!((LIBS_LIMIT + 1) * PAGE_SIZE == DEVS_START);
const_assert!((USERS_SYS_LIMIT + 1) * PAGE_SIZE == LIBS_START);
