//! Assembly entry points: call-gate stubs, exception stubs and the first
//! instructions each outer ring runs.
//!
//! Every stub that lands in ring 0 switches DS/ES to core data before
//! touching memory. Call-gate stubs return with `lret` and preserve every
//! register except EAX, which carries the status.

use core::arch::global_asm;

use crate::layout::{CG_CORE_PRINTR, CORE_DATA};
use crate::pic::KEYBOARD_IRQ;

/// Ring-0 call-gate stub.
///
/// Stack on entry: EIP, CS of the caller (plus ESP, SS on a privilege change).
/// Calls `target(eax, ebx, ecx, edx, caller_cs)` with interrupts disabled.
macro_rules! core_gate_stub {
    ($name:literal, $target:path) => {
        global_asm!(
            concat!(".global ", $name),
            concat!($name, ":"),
            "pushfl",
            "cli",
            "pushl %ds",
            "pushl %es",
            "push %esi",
            "mov ${data}, %si",
            "mov %si, %ds",
            "mov %si, %es",
            // caller CS, past the four saves and the return EIP
            "mov 20(%esp), %esi",
            "push %esi",
            "push %edx",
            "push %ecx",
            "push %ebx",
            "push %eax",
            "call {target}",
            "add $4, %esp",
            "pop %ebx",
            "pop %ecx",
            "pop %edx",
            "add $4, %esp",
            "pop %esi",
            "popl %es",
            "popl %ds",
            "popfl",
            "lret",
            data = const CORE_DATA.0,
            target = sym $target,
            options(att_syntax),
        );
    };
}

core_gate_stub!("cg_gdt_set_entry", crate::kernel::gate::entry::gdt_set);
core_gate_stub!("cg_idt_set_entry", crate::kernel::gate::entry::idt_set);
core_gate_stub!("cg_core_printr_entry", crate::kernel::gate::entry::printr);
core_gate_stub!("cg_core_tx_irq_entry", crate::kernel::gate::entry::unbound);

// CG_CORE_RESUME: EAX holds the resume token. Runs on the ring-0 stack of
// the current TSS and never returns to the caller.
global_asm!(
    ".global cg_core_resume_entry",
    "cg_core_resume_entry:",
    "mov ${data}, %bx",
    "mov %bx, %ds",
    "mov %bx, %es",
    "push %eax",
    "call {resume}",
    data = const CORE_DATA.0,
    resume = sym crate::kernel::ring::hardware::core_resume,
    options(att_syntax),
);

macro_rules! exception_stub {
    ($vector:literal) => {
        global_asm!(
            concat!(".global exc_", $vector),
            concat!("exc_", $vector, ":"),
            "pushl $0",
            concat!("pushl $", $vector),
            "jmp exception_common",
            options(att_syntax),
        );
    };
    ($vector:literal, error_code) => {
        global_asm!(
            concat!(".global exc_", $vector),
            concat!("exc_", $vector, ":"),
            concat!("pushl $", $vector),
            "jmp exception_common",
            options(att_syntax),
        );
    };
}

macro_rules! exception_table {
    ($($vector:literal => $name:ident $(, $code:ident)?;)*) => {
        $(exception_stub!($vector $(, $code)?);)*

        extern "C" {
            $(fn $name();)*
        }

        /// Addresses of the 32 exception stubs, by vector.
        pub fn exception_entries() -> [u32; 32] {
            [$($name as usize as u32,)*]
        }
    };
}

exception_table! {
    0 => exc_0;
    1 => exc_1;
    2 => exc_2;
    3 => exc_3;
    4 => exc_4;
    5 => exc_5;
    6 => exc_6;
    7 => exc_7;
    8 => exc_8, error_code;
    9 => exc_9;
    10 => exc_10, error_code;
    11 => exc_11, error_code;
    12 => exc_12, error_code;
    13 => exc_13, error_code;
    14 => exc_14, error_code;
    15 => exc_15;
    16 => exc_16;
    17 => exc_17, error_code;
    18 => exc_18;
    19 => exc_19;
    20 => exc_20;
    21 => exc_21, error_code;
    22 => exc_22;
    23 => exc_23;
    24 => exc_24;
    25 => exc_25;
    26 => exc_26;
    27 => exc_27;
    28 => exc_28;
    29 => exc_29, error_code;
    30 => exc_30, error_code;
    31 => exc_31;
}

// Stack: vector, error code, EIP, CS, EFLAGS.
global_asm!(
    "exception_common:",
    "mov ${data}, %ax",
    "mov %ax, %ds",
    "mov %ax, %es",
    "push %esp",
    "call exception_report",
    ".global unexpected_interrupt_stub",
    "unexpected_interrupt_stub:",
    "mov ${data}, %ax",
    "mov %ax, %ds",
    "mov %ax, %es",
    "call unexpected_interrupt_report",
    data = const CORE_DATA.0,
    options(att_syntax),
);

/// First instructions of an outer ring after `iretd`: data segments from
/// SS, then `main(token)`.
macro_rules! ring_entry {
    ($name:literal, $main:path) => {
        global_asm!(
            concat!(".global ", $name),
            concat!($name, ":"),
            "mov %ss, %bx",
            "mov %bx, %ds",
            "mov %bx, %es",
            "push %eax",
            "call {main}",
            main = sym $main,
            options(att_syntax),
        );
    };
}

ring_entry!("devs_entry", crate::kernel::ring::devs::hardware::devs_main);
ring_entry!("libs_entry", crate::kernel::ring::libs::hardware::libs_main);
ring_entry!("users_entry", crate::kernel::ring::users::hardware::users_main);

// CG_DEVS_TTY_W: ring-1 relay of a libs print request to CG_CORE_PRINTR,
// registers unchanged.
global_asm!(
    ".global devs_tty_write_entry",
    "devs_tty_write_entry:",
    "lcall ${printr}, $0",
    "lret",
    printr = const CG_CORE_PRINTR.0,
    options(att_syntax),
);

// CG_LIBS_TX_IRQ: ring-2 service, result in EAX.
global_asm!(
    ".global libs_tx_irq_entry",
    "libs_tx_irq_entry:",
    "pushl %ds",
    "pushl %es",
    "push %ecx",
    "push %edx",
    "mov %ss, %cx",
    "mov %cx, %ds",
    "mov %cx, %es",
    "call {target}",
    "pop %edx",
    "pop %ecx",
    "popl %es",
    "popl %ds",
    "lret",
    target = sym crate::kernel::ring::libs::hardware::tx_irq,
    options(att_syntax),
);

// Keyboard IRQ, bound at DPL 1 into devs code. Hands the line to the devs
// IRQ task.
global_asm!(
    ".global devs_keyboard_entry",
    "devs_keyboard_entry:",
    "pushal",
    "pushl %ds",
    "pushl %es",
    "mov %ss, %ax",
    "mov %ax, %ds",
    "mov %ax, %es",
    "pushl ${line}",
    "call {target}",
    "add $4, %esp",
    "popl %es",
    "popl %ds",
    "popal",
    "iretl",
    line = const KEYBOARD_IRQ as u32,
    target = sym crate::kernel::ring::devs::hardware::raise_irq,
    options(att_syntax),
);

extern "C" {
    pub fn cg_gdt_set_entry();
    pub fn cg_idt_set_entry();
    pub fn cg_core_printr_entry();
    pub fn cg_core_tx_irq_entry();
    pub fn cg_core_resume_entry();
    pub fn unexpected_interrupt_stub();
    pub fn devs_entry();
    pub fn libs_entry();
    pub fn users_entry();
    pub fn devs_tty_write_entry();
    pub fn libs_tx_irq_entry();
    pub fn devs_keyboard_entry();
}

/// Address of a stub for descriptor and frame fields.
pub fn address(stub: unsafe extern "C" fn()) -> u32 {
    stub as usize as u32
}
