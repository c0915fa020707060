//! i686 privileged instructions and privilege transitions.
//!
//! Each function documents its register contract; nothing outside this module
//! issues raw assembly.

pub mod gates;
pub mod port;
pub mod stubs;

use core::arch::asm;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::kernel::gdt::descriptor::ring;
use crate::kernel::gdt::TablePointer;
use crate::kernel::ring::IretFrame;
use crate::layout::{CORE_CODE, CORE_DATA};

/// Loads GDTR and reloads every segment register with the core selectors.
///
/// # Safety
/// `ptr` must describe a table holding `CORE_CODE`/`CORE_DATA` flat segments.
pub unsafe fn load_gdt(ptr: &TablePointer) {
    asm!("lgdt [{}]", in(reg) ptr, options(readonly, nostack, preserves_flags));
    asm!(
        "ljmp ${code}, $2f",
        "2:",
        "mov ${data}, %ax",
        "mov %ax, %ds",
        "mov %ax, %es",
        "mov %ax, %fs",
        "mov %ax, %gs",
        "mov %ax, %ss",
        code = const CORE_CODE.0,
        data = const CORE_DATA.0,
        out("eax") _,
        options(att_syntax, preserves_flags),
    );
}

/// # Safety
/// `ptr` must describe a valid IDT whose handlers stay mapped.
pub unsafe fn load_idt(ptr: &TablePointer) {
    asm!("lidt [{}]", in(reg) ptr, options(readonly, nostack, preserves_flags));
}

/// # Safety
/// `selector` must name a present LDT descriptor in the GDT.
pub unsafe fn load_ldt(selector: SegmentSelector) {
    asm!("lldt {0:x}", in(reg) selector.0, options(nostack, preserves_flags));
}

/// # Safety
/// `selector` must name an available TSS descriptor in the GDT.
pub unsafe fn load_task_register(selector: SegmentSelector) {
    asm!("ltr {0:x}", in(reg) selector.0, options(nostack, preserves_flags));
}

/// Drops into an outer ring via `iretd`.
///
/// In: `frame` on the stack as SS, ESP, EFLAGS, CS, EIP; `token` in EAX.
/// The entered ring reads EAX before touching it.
///
/// # Safety
/// The frame must name a valid code segment, stack and entry point for the
/// target ring.
pub unsafe fn enter_ring(frame: &IretFrame, token: u32) -> ! {
    asm!(
        "push dword ptr [{f} + 16]",
        "push dword ptr [{f} + 12]",
        "push dword ptr [{f} + 8]",
        "push dword ptr [{f} + 4]",
        "push dword ptr [{f}]",
        "iretd",
        f = in(reg) frame as *const IretFrame,
        in("eax") token,
        options(noreturn),
    );
}

/// Far pointer operand for `ljmp`/`lcall` through memory.
#[repr(C, packed)]
struct FarPointer {
    offset: u32,
    selector: u16,
}

/// Hardware task switch to `tss`. The offset is ignored by the CPU.
///
/// # Safety
/// `tss` must name an available TSS whose fields describe a runnable task.
pub unsafe fn jump_to_task(tss: SegmentSelector) -> ! {
    let target = FarPointer {
        offset: 0,
        selector: tss.0,
    };
    asm!(
        "ljmp *({})",
        in(reg) &target,
        options(att_syntax, noreturn),
    );
}

/// Nested task switch to `tss`. Returns once that task executes `iretd`
/// with NT set; every register is restored from this task's TSS.
///
/// # Safety
/// `tss` must name an available TSS reachable from the current CPL.
pub unsafe fn call_task(tss: SegmentSelector) {
    let target = FarPointer {
        offset: 0,
        selector: tss.0,
    };
    asm!("lcall *({})", in(reg) &target, options(att_syntax));
}

/// Returns from a task entered with [`call_task`]. The task resumes after
/// this call the next time it is called.
///
/// # Safety
/// The current task must have been entered by a task call (NT set).
pub unsafe fn return_from_task() {
    asm!("iretl", options(att_syntax));
}

pub fn read_cr0() -> u32 {
    let value: u32;
    unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

pub fn read_cr3() -> u32 {
    let value: u32;
    unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

/// # Safety
/// `directory` must be the physical address of a valid page directory that
/// identity maps the running kernel.
pub unsafe fn write_cr3(directory: u32) {
    asm!("mov cr3, {}", in(reg) directory, options(nostack, preserves_flags));
}

const CR0_WP: u32 = 1 << 16;
const CR0_PG: u32 = 1 << 31;

/// Turns on paging with write protection, so read-only pages bind rings 0..2
/// as well.
///
/// # Safety
/// CR3 must already hold a page directory that identity maps the kernel.
pub unsafe fn enable_paging() {
    let cr0 = read_cr0() | CR0_WP | CR0_PG;
    asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
}

/// Reloads CR3 to drop every cached translation.
pub fn flush_tlb() {
    unsafe { write_cr3(read_cr3()) };
}

/// Privilege level of the code running now.
pub fn current_ring() -> PrivilegeLevel {
    let cs: u16;
    unsafe { asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags)) };
    ring(cs as u8)
}

/// Stops this CPU for good. Ring 0 only.
pub fn halt_forever() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

/// Parks outer-ring code that has nothing left to do (`hlt` is privileged).
pub fn spin_forever() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
