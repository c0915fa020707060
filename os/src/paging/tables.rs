//! Two-level 32-bit page tables identity mapping the 8 MiB pool.

use x86_64::structures::paging::PageTableFlags;

use super::error::{PagingError, PagingResult};
use core::ops::Range;

use crate::layout::{LOW_MEM_END, MEM_SIZE, PAGE_SIZE, SUPERVISOR_START};

pub const ENTRIES: usize = 1024;
/// Bytes covered by one page table.
pub const TABLE_SPAN: u32 = ENTRIES as u32 * PAGE_SIZE;
pub const TABLE_COUNT: usize = (MEM_SIZE / TABLE_SPAN) as usize;

const FLAG_MASK: u32 = 0xFFF;
const FRAME_MASK: u32 = !FLAG_MASK;

/// Flags of kernel-only pages.
pub fn supervisor_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE
}

/// Flags of pages every ring may touch (segment limits still apply).
pub fn user_flags() -> PageTableFlags {
    supervisor_flags() | PageTableFlags::USER_ACCESSIBLE
}

/// Flags of the shared kernel image: code and constants every ring runs
/// and reads, writable by none (CR0.WP binds rings 0..2 too).
pub fn shared_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE
}

/// Supervisor-only ranges: the real-mode area below 1 MiB and everything
/// from the libs region up, which holds the libs, devs and core data and
/// both descriptor tables.
pub const fn is_supervisor_only(addr: u32) -> bool {
    addr < LOW_MEM_END || addr >= SUPERVISOR_START
}

fn entry_flags(flags: PageTableFlags) -> PagingResult<u32> {
    let bits = flags.bits();
    if bits & !(FLAG_MASK as u64) != 0 {
        return Err(PagingError::InvalidFlags(bits));
    }
    Ok(bits as u32)
}

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct PageTable(pub [u32; ENTRIES]);

impl PageTable {
    pub const fn empty() -> Self {
        Self([0; ENTRIES])
    }
}

/// Page directory followed by its tables, all page aligned.
#[repr(C, align(4096))]
pub struct PagingTables {
    pub directory: PageTable,
    pub tables: [PageTable; TABLE_COUNT],
}

impl PagingTables {
    pub const fn new() -> Self {
        Self {
            directory: PageTable::empty(),
            tables: [PageTable::empty(); TABLE_COUNT],
        }
    }

    pub fn directory_address(&self) -> u32 {
        self.directory.0.as_ptr() as usize as u32
    }

    /// Identity maps the pool. PDEs are user accessible; the PTEs decide.
    /// Pages in `shared` (the kernel code and read-only data) are mapped
    /// read-only for every ring.
    pub fn build(&mut self, shared: Range<u32>) {
        let user = user_flags().bits() as u32;
        let supervisor = supervisor_flags().bits() as u32;
        let read_only = shared_flags().bits() as u32;

        for (t, table) in self.tables.iter_mut().enumerate() {
            for (i, entry) in table.0.iter_mut().enumerate() {
                let addr = t as u32 * TABLE_SPAN + i as u32 * PAGE_SIZE;
                let flags = if is_supervisor_only(addr) {
                    supervisor
                } else if shared.contains(&addr) {
                    read_only
                } else {
                    user
                };
                *entry = addr | flags;
            }
        }
        for t in 0..TABLE_COUNT {
            let table = self.tables[t].0.as_ptr() as usize as u32;
            self.directory.0[t] = table | user;
        }
        self.directory.0[TABLE_COUNT..].fill(0);
    }

    /// Index range of `pages` PTEs starting at linear `addr`.
    fn range(addr: u32, pages: usize) -> PagingResult<core::ops::Range<usize>> {
        if addr % PAGE_SIZE != 0 {
            return Err(PagingError::Misaligned {
                addr,
                required: PAGE_SIZE,
            });
        }
        let size = u32::try_from(pages)
            .ok()
            .and_then(|p| p.checked_mul(PAGE_SIZE))
            .ok_or(PagingError::SizeOverflow { start: addr, pages })?;
        let end = addr
            .checked_add(size)
            .ok_or(PagingError::SizeOverflow { start: addr, pages })?;
        if end > MEM_SIZE {
            return Err(PagingError::OutOfRange { start: addr, size });
        }
        let first = (addr / PAGE_SIZE) as usize;
        Ok(first..first + pages)
    }

    fn entry_mut(&mut self, page: usize) -> &mut u32 {
        &mut self.tables[page / ENTRIES].0[page % ENTRIES]
    }

    pub fn entry(&self, addr: u32) -> PagingResult<u32> {
        let page = Self::range(addr & FRAME_MASK, 1)?.start;
        Ok(self.tables[page / ENTRIES].0[page % ENTRIES])
    }

    /// Replaces the flag bits of `pages` consecutive PTEs from `addr`.
    pub fn set_pte_flags(
        &mut self,
        addr: u32,
        pages: usize,
        flags: PageTableFlags,
    ) -> PagingResult<()> {
        let bits = entry_flags(flags)?;
        for page in Self::range(addr, pages)? {
            let entry = self.entry_mut(page);
            *entry = (*entry & FRAME_MASK) | bits;
        }
        Ok(())
    }

    /// Points `pages` PTEs from linear `addr` at the frames starting at
    /// `phys`, keeping each entry's flags.
    pub fn set_task_vmem(&mut self, addr: u32, pages: usize, phys: u32) -> PagingResult<()> {
        let entries = Self::range(addr, pages)?;
        if phys % PAGE_SIZE != 0 {
            return Err(PagingError::Misaligned {
                addr: phys,
                required: PAGE_SIZE,
            });
        }
        let span = (pages as u32).checked_mul(PAGE_SIZE);
        if span.and_then(|s| phys.checked_add(s)).is_none() {
            return Err(PagingError::SizeOverflow { start: phys, pages });
        }

        for (n, page) in entries.enumerate() {
            let entry = self.entry_mut(page);
            *entry = (phys + n as u32 * PAGE_SIZE) | (*entry & FLAG_MASK);
        }
        Ok(())
    }
}

impl Default for PagingTables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{CORE_START, DEVS_START, IDT_START, USERS_START};

    /// Kernel code and read-only data as the linker lays them out.
    const SHARED: Range<u32> = 0x10_0000..0x10_8000;

    fn built() -> Box<PagingTables> {
        let mut tables = Box::new(PagingTables::new());
        tables.build(SHARED);
        tables
    }

    const USER: u32 = 0x7;
    const SUPERVISOR: u32 = 0x3;
    const READ_ONLY: u32 = 0x5;

    #[test]
    fn test_identity_map_policy() {
        let tables = built();
        assert_eq!(TABLE_COUNT, 2);
        assert_eq!(tables.entry(0).unwrap(), SUPERVISOR);
        assert_eq!(tables.entry(0xB8000).unwrap(), 0xB8000 | SUPERVISOR);
        assert_eq!(tables.entry(LOW_MEM_END).unwrap(), LOW_MEM_END | READ_ONLY);
        assert_eq!(tables.entry(SHARED.end).unwrap(), SHARED.end | USER);
        assert_eq!(tables.entry(USERS_START).unwrap(), USERS_START | USER);
        assert_eq!(tables.entry(SUPERVISOR_START - PAGE_SIZE).unwrap(), (SUPERVISOR_START - PAGE_SIZE) | USER);
        assert_eq!(tables.entry(SUPERVISOR_START).unwrap(), SUPERVISOR_START | SUPERVISOR);
        assert_eq!(tables.entry(DEVS_START).unwrap(), DEVS_START | SUPERVISOR);
        assert_eq!(tables.entry(0x7D_F000).unwrap(), 0x7D_F000 | SUPERVISOR);
        assert_eq!(tables.entry(0x7F_F000).unwrap(), 0x7F_F000 | SUPERVISOR);

        // directory entries are the permissive gate
        for t in 0..TABLE_COUNT {
            let pde = tables.directory.0[t];
            assert_eq!(pde & FLAG_MASK, USER);
            assert_eq!(pde & FRAME_MASK, tables.tables[t].0.as_ptr() as usize as u32);
        }
        assert_eq!(tables.directory.0[TABLE_COUNT], 0);
    }

    #[test]
    fn test_set_task_vmem_keeps_flags() {
        let mut tables = built();
        tables.set_task_vmem(0x40_0000, 4, 0x20_0000).unwrap();
        assert_eq!(tables.entry(0x40_0000).unwrap(), 0x20_0000 | USER);
        assert_eq!(tables.entry(0x40_3000).unwrap(), 0x20_3000 | USER);
        assert_eq!(tables.entry(0x40_4000).unwrap(), 0x40_4000 | USER);

        tables.set_task_vmem(0x7F_0000, 1, 0x30_0000).unwrap();
        assert_eq!(tables.entry(0x7F_0000).unwrap(), 0x30_0000 | SUPERVISOR);
    }

    #[test]
    fn test_set_pte_flags() {
        let mut tables = built();
        tables.set_pte_flags(0x10_0000, 2, supervisor_flags()).unwrap();
        assert_eq!(tables.entry(0x10_1000).unwrap(), 0x10_1000 | SUPERVISOR);
        assert_eq!(tables.entry(0x10_2000).unwrap(), 0x10_2000 | READ_ONLY);
    }

    #[test]
    fn test_shared_image_is_read_only_for_every_ring() {
        let tables = built();
        for addr in SHARED.step_by(PAGE_SIZE as usize) {
            let pte = tables.entry(addr).unwrap();
            assert_eq!(pte & PageTableFlags::WRITABLE.bits() as u32, 0, "{:#x}", addr);
            assert_ne!(pte & PageTableFlags::USER_ACCESSIBLE.bits() as u32, 0);
        }
        for addr in (CORE_START..IDT_START).step_by(PAGE_SIZE as usize) {
            let pte = tables.entry(addr).unwrap();
            assert_eq!(pte & PageTableFlags::USER_ACCESSIBLE.bits() as u32, 0, "{:#x}", addr);
        }
        assert!(is_supervisor_only(DEVS_START));
        assert!(!is_supervisor_only(USERS_START));
    }

    #[test]
    fn test_edits_are_validated() {
        let mut tables = built();
        assert_eq!(
            tables.set_pte_flags(0x10_0010, 1, user_flags()),
            Err(PagingError::Misaligned {
                addr: 0x10_0010,
                required: PAGE_SIZE
            })
        );
        assert!(matches!(
            tables.set_task_vmem(0x7F_F000, 2, 0),
            Err(PagingError::OutOfRange { .. })
        ));
        assert!(matches!(
            tables.set_task_vmem(0x40_0000, 1, 0x123),
            Err(PagingError::Misaligned { addr: 0x123, .. })
        ));
        assert!(matches!(
            tables.set_pte_flags(0, usize::MAX, user_flags()),
            Err(PagingError::SizeOverflow { .. })
        ));
        assert!(matches!(
            tables.set_pte_flags(0, 1, user_flags() | PageTableFlags::NO_EXECUTE),
            Err(PagingError::InvalidFlags(_))
        ));
        // nothing changed
        assert_eq!(tables.entry(0x7F_F000).unwrap(), 0x7F_F000 | SUPERVISOR);
        assert_eq!(tables.entry(0).unwrap(), SUPERVISOR);
    }
}
