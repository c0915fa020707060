//! CPU exception reporting
//!
//! Every exception in this kernel is fatal. The assembly stubs push a uniform
//! [`ExceptionFrame`] (dummy error code where the CPU supplies none) and call
//! [`exception_report`], which prints the fault on the console in red and
//! halts.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Fault,
    Trap,
    Interrupt,
    Abort,
    Reserved,
}

impl ExceptionKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Fault => "FAULT",
            Self::Trap => "TRAP",
            Self::Interrupt => "INTERRUPT",
            Self::Abort => "ABORT",
            Self::Reserved => "RESERVED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionInfo {
    pub kind: ExceptionKind,
    pub mnemonic: Option<&'static str>,
    pub name: &'static str,
    pub description: Option<&'static str>,
}

const fn info(
    kind: ExceptionKind,
    mnemonic: &'static str,
    name: &'static str,
    description: &'static str,
) -> ExceptionInfo {
    ExceptionInfo {
        kind,
        mnemonic: if mnemonic.is_empty() { None } else { Some(mnemonic) },
        name,
        description: Some(description),
    }
}

const RESERVED: ExceptionInfo = ExceptionInfo {
    kind: ExceptionKind::Reserved,
    mnemonic: None,
    name: "Reserved",
    description: None,
};

use ExceptionKind::*;

pub static EXCEPTIONS: [ExceptionInfo; 32] = [
    info(Fault, "#DE", "Divide Error", "Caused by DIV or IDIV instruction division by zero."),
    info(Trap, "#DB", "Debug Exception", "Single-step, data breakpoint, or debug register trigger."),
    info(Interrupt, "NMI", "Non-Maskable Interrupt", "Asynchronous hardware-triggered interrupt."),
    info(Trap, "#BP", "Breakpoint", "Triggered by the INT3 instruction for debugging."),
    info(Trap, "#OF", "Overflow", "Caused by INTO instruction when OF flag set."),
    info(Fault, "#BR", "BOUND Range Exceeded", "BOUND instruction detected index outside bounds."),
    info(Fault, "#UD", "Invalid Opcode", "Processor detected undefined or illegal instruction."),
    info(Fault, "#NM", "Device Not Available", "FPU unavailable or TS flag set in CR0."),
    info(Abort, "#DF", "Double Fault", "Exception occurred during handling of another exception."),
    info(Fault, "", "Coprocessor Segment Overrun", "(Floating-point instruction) Legacy 286 error, ignored on modern CPUs."),
    info(Fault, "#TS", "Invalid TSS", "Task State Segment access or limit violation."),
    info(Fault, "#NP", "Segment Not Present", "Segment present flag (P) cleared in descriptor."),
    info(Fault, "#SS", "Stack Segment Fault", "Stack selector or segment limit invalid."),
    info(Fault, "#GP", "General Protection Fault", "Violation of segment descriptor privilege or limit."),
    info(Fault, "#PF", "Page Fault", "Page not present or protection violation detected."),
    ExceptionInfo {
        description: Some("Intel reserved exception vector."),
        ..RESERVED
    },
    info(Fault, "#MF", "x87 FPU Floating-Point Error", "Numeric overflow, underflow, or precision problem."),
    info(Fault, "#AC", "Alignment Check", "Unaligned memory access (only in Ring 3)."),
    info(Abort, "#MC", "Machine Check", "Hardware-detected internal CPU error."),
    info(Fault, "#XM", "SIMD Floating-Point Exception", "Numeric error in SSE/AVX operation."),
    info(Fault, "#VE", "Virtualization Exception", "VMX-root violation in virtualized environment."),
    info(Fault, "#CP", "Control Protection Exception", "Control-flow enforcement (CET) violation."),
    RESERVED, RESERVED, RESERVED, RESERVED, RESERVED,
    RESERVED, RESERVED, RESERVED, RESERVED, RESERVED,
];

/// Vectors for which the CPU pushes an error code.
pub const fn has_error_code(vector: u32) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

/// Stack image built by the exception stubs.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ExceptionFrame {
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

/// Renders the console report for one exception.
pub fn write_report(out: &mut impl fmt::Write, frame: &ExceptionFrame) -> fmt::Result {
    let vector = frame.vector;
    let Some(info) = EXCEPTIONS.get(vector as usize) else {
        return writeln!(out, "INTERRUPT: {} |0x{:02X}| **Unexpected**", vector, vector);
    };

    write!(out, "{}: {} |0x{:02X}| ", info.kind.label(), vector, vector)?;
    if let Some(mnemonic) = info.mnemonic {
        write!(out, "{} | ", mnemonic)?;
    }
    writeln!(out, "**{}**", info.name)?;
    if let Some(description) = info.description {
        writeln!(out, "{}", description)?;
    }
    if has_error_code(vector) {
        writeln!(out, "error code 0x{:x}", frame.error_code)?;
    }
    writeln!(out, "at {:04x}:{:08x} eflags {:08x}", frame.cs, frame.eip, frame.eflags)
}

/// Entered from the exception stubs with DS/ES already on core data.
#[cfg(target_arch = "x86")]
#[no_mangle]
extern "C" fn exception_report(frame: &ExceptionFrame) -> ! {
    use crate::config::colors;

    log::error!(
        "exception {} at {:#x}:{:#x} (error {:#x})",
        frame.vector,
        frame.cs,
        frame.eip,
        frame.error_code
    );
    crate::console::with_fault_console(|console| {
        let _ = write_report(&mut console.writer(colors::FAULT), frame);
    });
    crate::arch::x86::halt_forever()
}

/// Catch-all for vectors nothing claimed.
#[cfg(target_arch = "x86")]
#[no_mangle]
extern "C" fn unexpected_interrupt_report() -> ! {
    use crate::config::colors;

    log::error!("unexpected interrupt");
    crate::console::with_fault_console(|console| {
        console.put_at(0, crate::console::COLS - 1, b'!', colors::FAULT);
    });
    crate::arch::x86::halt_forever()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Buffer {
        bytes: [u8; 512],
        len: usize,
    }

    impl Buffer {
        fn new() -> Self {
            Self { bytes: [0; 512], len: 0 }
        }

        fn as_str(&self) -> &str {
            core::str::from_utf8(&self.bytes[..self.len]).unwrap()
        }
    }

    impl fmt::Write for Buffer {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let end = self.len + s.len();
            self.bytes[self.len..end].copy_from_slice(s.as_bytes());
            self.len = end;
            Ok(())
        }
    }

    fn frame(vector: u32, error_code: u32) -> ExceptionFrame {
        ExceptionFrame {
            vector,
            error_code,
            eip: 0x0010_2345,
            cs: 0x08,
            eflags: 0x202,
        }
    }

    #[test]
    fn test_page_fault_report() {
        let mut out = Buffer::new();
        write_report(&mut out, &frame(14, 0x2)).unwrap();
        let text = out.as_str();
        assert!(text.starts_with(
            "FAULT: 14 |0x0E| #PF | **Page Fault**\n\
             Page not present or protection violation detected.\n"
        ));
        assert!(text.contains("error code 0x2"));
    }

    #[test]
    fn test_report_without_mnemonic() {
        let mut out = Buffer::new();
        write_report(&mut out, &frame(9, 0)).unwrap();
        assert!(out.as_str().starts_with("FAULT: 9 |0x09| **Coprocessor Segment Overrun**\n"));

        let mut out = Buffer::new();
        write_report(&mut out, &frame(27, 0)).unwrap();
        assert!(out.as_str().starts_with("RESERVED: 27 |0x1B| **Reserved**\n"));
        assert!(!out.as_str().contains("error code"));
    }

    #[test]
    fn test_nmi_label() {
        let mut out = Buffer::new();
        write_report(&mut out, &frame(2, 0)).unwrap();
        assert!(out.as_str().starts_with("INTERRUPT: 2 |0x02| NMI | **Non-Maskable Interrupt**"));
    }

    #[test]
    fn test_error_code_vectors() {
        let with_code: [u32; 10] = [8, 10, 11, 12, 13, 14, 17, 21, 29, 30];
        for vector in 0..32 {
            assert_eq!(has_error_code(vector), with_code.contains(&vector), "vector {}", vector);
        }
    }
}
