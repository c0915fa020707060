//! Paging unit
//!
//! Identity maps the 8 MiB pool with 4 KiB pages. Segment limits keep rings 1
//! and 2 below the regions above their own; paging adds the U/S split that
//! keeps ring 3 out of the real-mode area and everything from the libs region
//! up, maps the shared kernel image read-only, and lets a task's window be
//! relocated with [`set_task_vmem`].

mod error;
mod tables;

pub use error::{PagingError, PagingResult};
pub use tables::{
    is_supervisor_only, shared_flags, supervisor_flags, user_flags, PageTable, PagingTables,
    ENTRIES, TABLE_COUNT,
};

#[cfg(target_arch = "x86")]
mod hardware {
    use core::sync::atomic::{AtomicU32, Ordering};

    use spin::Mutex;
    use x86_64::structures::paging::PageTableFlags;

    use super::*;
    use crate::arch::x86;

    static TABLES: Mutex<PagingTables> = Mutex::new(PagingTables::new());

    /// CR3 value once paging is up.
    static DIRECTORY: AtomicU32 = AtomicU32::new(0);

    /// Pages covered by the directory and its tables.
    const TABLE_PAGES: usize = 1 + TABLE_COUNT;

    extern "C" {
        static __kernel_start: u8;
        static __shared_end: u8;
    }

    /// Kernel code and read-only data, as placed by `linker.ld`.
    fn shared_image() -> core::ops::Range<u32> {
        // SAFETY: linker symbols; only their addresses are taken.
        unsafe {
            let start = core::ptr::addr_of!(__kernel_start) as usize as u32;
            let end = core::ptr::addr_of!(__shared_end) as usize as u32;
            start..end
        }
    }

    /// Builds the tables, hides them from outer rings and turns paging on.
    ///
    /// # Safety
    /// Ring 0, once, before anything relies on CR3.
    pub unsafe fn init() -> PagingResult<u32> {
        let mut tables = TABLES.lock();
        let shared = shared_image();
        tables.build(shared.clone());
        let directory = tables.directory_address();
        tables.set_pte_flags(directory, TABLE_PAGES, supervisor_flags())?;

        x86::write_cr3(directory);
        x86::enable_paging();
        DIRECTORY.store(directory, Ordering::Release);
        log::info!(
            "paging: identity map up, cr3 {:#x}, image {:#x}..{:#x} read-only",
            directory,
            shared.start,
            shared.end
        );
        Ok(directory)
    }

    pub fn directory_address() -> u32 {
        DIRECTORY.load(Ordering::Acquire)
    }

    pub fn set_pte_flags(addr: u32, pages: usize, flags: PageTableFlags) -> PagingResult<()> {
        TABLES.lock().set_pte_flags(addr, pages, flags)?;
        x86::flush_tlb();
        Ok(())
    }

    pub fn set_task_vmem(addr: u32, pages: usize, phys: u32) -> PagingResult<()> {
        TABLES.lock().set_task_vmem(addr, pages, phys)?;
        x86::flush_tlb();
        Ok(())
    }
}

#[cfg(target_arch = "x86")]
pub use hardware::{directory_address, init, set_pte_flags, set_task_vmem};
