//! Protected mode / paging check via CR0.

const CR0_PE: u32 = 1 << 0; // Protected mode
const CR0_WP: u32 = 1 << 16; // Write protect in ring 0
const CR0_PG: u32 = 1 << 31; // Paging

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeReport {
    pub protected: bool,
    pub paging: bool,
    pub write_protect: bool,
}

impl ModeReport {
    pub const fn from_cr0(cr0: u32) -> Self {
        Self {
            protected: cr0 & CR0_PE != 0,
            paging: cr0 & CR0_PG != 0,
            write_protect: cr0 & CR0_WP != 0,
        }
    }

    /// PE and PG both set.
    pub const fn is_paged_protected_mode(&self) -> bool {
        self.protected && self.paging
    }
}

#[cfg(target_arch = "x86")]
pub fn current() -> ModeReport {
    ModeReport::from_cr0(crate::arch::x86::read_cr0())
}
