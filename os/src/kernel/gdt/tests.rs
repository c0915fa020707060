//! GDT table manager tests
//!
//! Host arrays stand in for the table at `GDT_START`.

use x86_64::PrivilegeLevel::*;

use super::descriptor::{Access, Descriptor, Flags, SystemType};
use super::*;
use crate::kernel::error::TableError;

fn table() -> Vec<Descriptor> {
    vec![Descriptor::from_raw(0xAAAA_AAAA_AAAA_AAAA); GDT_ENTRIES]
}

#[test]
fn test_zero_fill_then_install_core_code() {
    let mut slots = table();
    let mut gdt = DescriptorTable::new(&mut slots);
    gdt.zero_fill();
    assert!(gdt.iter().all(|(_, d)| d.is_null()));

    let access = Access::segment(Access::CODE_EXECUTE_READ, Ring0);
    let code = Descriptor::segment(0, 0x7FF, access, Flags::PROTECTED_4K);
    assert!(gdt.install(1, code).is_ok());

    let read = gdt.read(1).unwrap();
    assert_eq!(read.base(), 0);
    assert_eq!(read.limit(), 0x7FF);
    assert_eq!(read.access(), access);
    assert_eq!(read.access().bits(), 0x9A);
    assert_eq!(read.flags(), Flags::SIZE_32 | Flags::GRANULARITY_4K);
    assert!(!gdt.read(2).unwrap().is_present());
}

#[test]
fn test_install_read_back_across_the_table() {
    let mut slots = table();
    let mut gdt = DescriptorTable::new(&mut slots);
    gdt.zero_fill();
    for index in [0, 1, 37, 4095, GDT_ENTRIES - 1] {
        let d = Descriptor::from_raw(0x00CF_9200_0000_0000 | index as u64);
        assert!(gdt.install(index, d).is_ok());
        assert_eq!(gdt.read(index), Ok(d));
    }
}

#[test]
fn test_out_of_range_install_leaves_table_unchanged() {
    let mut slots = table();
    let mut gdt = DescriptorTable::new(&mut slots);
    gdt.zero_fill();
    gdt.install(5, Descriptor::from_raw(0x1234)).unwrap();

    assert_eq!(
        gdt.install(GDT_ENTRIES, Descriptor::from_raw(0x9999)),
        Err(TableError::IndexOutOfRange {
            index: GDT_ENTRIES,
            capacity: GDT_ENTRIES
        })
    );
    assert!(gdt.read(GDT_ENTRIES + 7).is_err());
    assert_eq!(gdt.iter().filter(|(_, d)| !d.is_null()).count(), 1);
}

#[test]
fn test_call_gate_patch_keeps_access_byte() {
    let mut slots = table();
    let mut gdt = DescriptorTable::new(&mut slots);
    gdt.zero_fill();
    build_system_table(&mut gdt).unwrap();

    for (selector, placeholder) in SYSTEM_DESCRIPTORS {
        if placeholder.system_type() != Some(SystemType::CallGate) {
            continue;
        }
        for (offset, params) in [(0x0010_0000, 0), (0xFFFF_FFFF, 0x1F), (0x1234, 3)] {
            gdt.patch_call_gate_offset(selector, offset, params).unwrap();
            let patched = gdt.read_at(selector).unwrap();
            assert_eq!(patched.access(), placeholder.access());
            assert_eq!(patched.gate_selector(), placeholder.gate_selector());
            assert_eq!(patched.gate_offset(), offset);
            assert_eq!(patched.param_count(), params);
        }
    }
}

#[test]
fn test_patches_refuse_wrong_descriptor_type() {
    let mut slots = table();
    let mut gdt = DescriptorTable::new(&mut slots);
    gdt.zero_fill();
    build_system_table(&mut gdt).unwrap();

    let before = gdt.read_at(CORE_CODE).unwrap();
    assert!(matches!(
        gdt.patch_call_gate_offset(CORE_CODE, 0x1000, 0),
        Err(TableError::TypeMismatch { index: 1, .. })
    ));
    assert!(gdt.patch_tss_base_limit(LDT_USERS, 0x1000, 103).is_err());
    assert!(gdt.patch_ldt_base_limit(TSS_MAIN_TASK, 0x1000, 15).is_err());
    assert_eq!(gdt.read_at(CORE_CODE), Ok(before));
}

#[test]
fn test_system_map() {
    let mut slots = table();
    let mut gdt = DescriptorTable::new(&mut slots);
    gdt.zero_fill();
    build_system_table(&mut gdt).unwrap();

    let users_code = gdt.read_at(USERS_CODE).unwrap();
    assert_eq!(users_code.dpl(), Ring3);
    assert_eq!(users_code.limit(), USERS_SYS_LIMIT);

    let devs_access = gdt.read_at(DEVS_ACCES_DATA).unwrap();
    assert_eq!(devs_access.dpl(), Ring1);
    assert_eq!(devs_access.limit(), MEM_LIMIT);

    let main = gdt.read_at(TSS_MAIN_TASK).unwrap();
    assert_eq!(main.system_type(), Some(SystemType::TssAvailable));
    assert_eq!(main.dpl(), Ring3);
    assert!(main.flags().is_empty());

    for (selector, ring) in [(TSS_DEVS_IRQ, Ring1), (LDT_LIBS, Ring2), (TSS_LIBS_SCHED, Ring2)] {
        let slot = gdt.read_at(selector).unwrap();
        assert_eq!(slot.dpl(), ring);
        assert_eq!(slot.base(), 0);
        assert!(slot.system_type().is_some());
    }

    let idt_set = gdt.read_at(CG_IDT_SET).unwrap();
    assert_eq!(idt_set.dpl(), Ring1);
    assert_eq!(idt_set.gate_selector(), CORE_CODE);
    assert!(idt_set.is_present());
    assert_eq!(idt_set.gate_offset(), 0);

    // 18 and 24..32 stay free
    assert!(gdt.read(18).unwrap().is_null());
    assert!(gdt.read(24).unwrap().is_null());
    assert!(gdt.read(38).unwrap().is_null());
}

#[test]
fn test_table_pointer_covers_whole_table() {
    let mut slots = table();
    let gdt = DescriptorTable::new(&mut slots);
    let pointer = gdt.pointer();
    let limit = pointer.limit;
    assert_eq!(limit as u32, GDT_SIZE - 1);
}

#[test]
fn test_empty_table_pointer_does_not_wrap() {
    let mut slots: [Descriptor; 0] = [];
    let gdt = DescriptorTable::new(&mut slots);
    let limit = gdt.pointer().limit;
    assert_eq!(limit, 0);

    let mut one = [Descriptor::NULL; 1];
    let limit = DescriptorTable::new(&mut one).pointer().limit;
    assert_eq!(limit, 7);
}

#[test]
fn test_fill_writes_every_slot() {
    let mut slots = [Descriptor::NULL; 6];
    let mut gdt = DescriptorTable::new(&mut slots);
    let gate = Descriptor::gate(CORE_CODE, 0x0010_0000, Ring0, SystemType::InterruptGate, 0);
    gdt.fill(gate);
    assert!(gdt.iter().all(|(_, d)| d == gate));
}
