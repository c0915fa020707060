pub mod error;
pub mod gate;
pub mod gdt;
pub mod idt;
pub mod ring;

use core::fmt;

use crate::config::MULTIBOOT_BOOTLOADER_MAGIC;
use crate::kernel::error::{TableError, TaskError};
use crate::paging::PagingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelInitError {
    /// EAX at entry was not the multiboot handoff value
    BadMagic(u32),
    Table(TableError),
    Paging(PagingError),
    Task(TaskError),
    /// CR0 does not report PE and PG after paging init
    NotProtected,
}

impl KernelInitError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::BadMagic(_) => "not loaded by a multiboot loader",
            Self::Table(_) => "descriptor table setup failed",
            Self::Paging(_) => "paging setup failed",
            Self::Task(_) => "core task setup failed",
            Self::NotProtected => "CPU is not in paged protected mode",
        }
    }
}

impl fmt::Display for KernelInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(magic) => write!(f, "{}: 0x{:08x}", self.description(), magic),
            Self::Table(e) => write!(f, "{}: {}", self.description(), e),
            Self::Paging(e) => write!(f, "{}: {}", self.description(), e),
            Self::Task(e) => write!(f, "{}: {}", self.description(), e),
            Self::NotProtected => write!(f, "{}", self.description()),
        }
    }
}

impl From<TableError> for KernelInitError {
    fn from(e: TableError) -> Self {
        Self::Table(e)
    }
}

impl From<PagingError> for KernelInitError {
    fn from(e: PagingError) -> Self {
        Self::Paging(e)
    }
}

impl From<TaskError> for KernelInitError {
    fn from(e: TaskError) -> Self {
        Self::Task(e)
    }
}

pub fn check_magic(magic: u32) -> Result<(), KernelInitError> {
    if magic == MULTIBOOT_BOOTLOADER_MAGIC {
        Ok(())
    } else {
        Err(KernelInitError::BadMagic(magic))
    }
}

#[cfg(target_arch = "x86")]
mod hardware {
    use core::fmt;

    use super::*;
    use crate::arch::x86::{self, stubs};
    use crate::config::colors;

    /// Brings ring 0 up: descriptor tables, PIC, paging, console and the
    /// core task. Interrupts stay disabled; the first `sti` happens when the
    /// users main task is entered with IF set.
    ///
    /// # Safety
    /// Once, from `_start`, in ring 0 with interrupts disabled.
    pub unsafe fn early_init(magic: u32) -> Result<(), KernelInitError> {
        #[cfg(feature = "serial-log")]
        {
            crate::serial::init();
            // A second logger can only come from a second call.
            let _ = crate::serial::init_logger();
        }
        check_magic(magic)?;
        log::info!("multiboot handoff ok");

        let mut gdt = gdt::system_table();
        gdt.zero_fill();
        gdt::build_system_table(&mut gdt)?;
        x86::load_gdt(&gdt.pointer());

        let mut idt = idt::system_table();
        idt.install_default(stubs::address(stubs::unexpected_interrupt_stub));
        idt.install_exception_vectors(&stubs::exception_entries())?;
        x86::load_idt(&idt.pointer());
        log::info!("gdt and idt loaded");

        crate::pic::init();
        crate::paging::init()?;

        let mode = crate::cpu_mode::current();
        log::debug!("cr0: {:?}", mode);
        if !mode.is_paged_protected_mode() {
            return Err(KernelInitError::NotProtected);
        }

        crate::console::init();
        ring::ring0::hardware::init()?;
        Ok(())
    }

    /// Starts the outer-ring bootstrap. Never returns.
    pub fn kernel_start() -> ! {
        ring::hardware::start()
    }

    /// Prints a fault banner and halts. Ring 0 only.
    pub fn fatal(args: fmt::Arguments<'_>) -> ! {
        log::error!("fatal: {}", args);
        crate::console::with_fault_console(|console| {
            use core::fmt::Write;
            let _ = writeln!(console.writer(colors::FAULT), "\n{}", args);
        });
        x86::halt_forever()
    }
}

#[cfg(target_arch = "x86")]
pub use hardware::{early_init, fatal, kernel_start};
