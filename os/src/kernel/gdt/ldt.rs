//! Two-entry Local Descriptor Tables, one per ring.

use x86_64::PrivilegeLevel;

use super::descriptor::{Access, Descriptor, Flags};

pub const LDT_ENTRIES: usize = 2;
/// Byte limit of a two-entry LDT.
pub const LDT_LIMIT: u32 = (LDT_ENTRIES * 8 - 1) as u32;

pub const LDT_CODE_INDEX: usize = 0;
pub const LDT_DATA_INDEX: usize = 1;

#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct Ldt([Descriptor; LDT_ENTRIES]);

impl Ldt {
    pub const fn empty() -> Self {
        Self([Descriptor::NULL; LDT_ENTRIES])
    }

    /// Flat code (execute/read) and data (read/write) segments owned by
    /// `dpl`, reaching `limit` pages.
    pub const fn for_ring(dpl: PrivilegeLevel, limit: u32) -> Self {
        let code = Descriptor::segment(
            0,
            limit,
            Access::segment(Access::CODE_EXECUTE_READ, dpl),
            Flags::PROTECTED_4K,
        );
        let data = Descriptor::segment(
            0,
            limit,
            Access::segment(Access::DATA_READ_WRITE, dpl),
            Flags::PROTECTED_4K,
        );
        Self([code, data])
    }

    pub const fn from_entries(entries: [Descriptor; LDT_ENTRIES]) -> Self {
        Self(entries)
    }

    pub const fn entries(&self) -> &[Descriptor; LDT_ENTRIES] {
        &self.0
    }

    pub const fn code(&self) -> Descriptor {
        self.0[LDT_CODE_INDEX]
    }

    pub const fn data(&self) -> Descriptor {
        self.0[LDT_DATA_INDEX]
    }

    pub fn base(&self) -> u32 {
        self.0.as_ptr() as usize as u32
    }
}
