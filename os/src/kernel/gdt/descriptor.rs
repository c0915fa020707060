//! 8-byte segment and gate descriptors
//!
//! Field layout follows the Intel SDM, vol. 3A, 3.4.5 and 5.8.3:
//!
//! ```text
//! segment: limit[0:15] | base[0:23] | access | limit[16:19] flags | base[24:31]
//! gate:    offset[0:15] | selector | param count | type dpl P | offset[16:31]
//! ```
//!
//! Encoding is total: inputs wider than their field are truncated exactly as
//! the hardware would see them.

use bitflags::bitflags;
use core::fmt;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

bitflags! {
    /// Access byte (descriptor bits 40..48).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const ACCESSED = 1 << 0;
        /// Readable (code) or writable (data).
        const READ_WRITE = 1 << 1;
        /// Conforming (code) or expand-down (data).
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Clear for system descriptors (TSS, LDT, gates).
        const CODE_DATA = 1 << 4;
        const DPL_LOW = 1 << 5;
        const DPL_HIGH = 1 << 6;
        const PRESENT = 1 << 7;

        const CODE_EXECUTE_READ = Self::CODE_DATA.bits() | Self::EXECUTABLE.bits() | Self::READ_WRITE.bits();
        const DATA_READ_WRITE = Self::CODE_DATA.bits() | Self::READ_WRITE.bits();
    }
}

bitflags! {
    /// Upper nibble of descriptor byte 6.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const AVAILABLE = 1 << 4;
        const LONG_MODE = 1 << 5;
        const SIZE_32 = 1 << 6;
        const GRANULARITY_4K = 1 << 7;

        const PROTECTED_4K = Self::SIZE_32.bits() | Self::GRANULARITY_4K.bits();
    }
}

/// System descriptor types (access byte bits 0..4 with `CODE_DATA` clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemType {
    Ldt = 0x2,
    TaskGate = 0x5,
    TssAvailable = 0x9,
    TssBusy = 0xB,
    CallGate = 0xC,
    InterruptGate = 0xE,
    TrapGate = 0xF,
}

impl SystemType {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x0F {
            0x2 => Some(Self::Ldt),
            0x5 => Some(Self::TaskGate),
            0x9 => Some(Self::TssAvailable),
            0xB => Some(Self::TssBusy),
            0xC => Some(Self::CallGate),
            0xE => Some(Self::InterruptGate),
            0xF => Some(Self::TrapGate),
            _ => None,
        }
    }

    pub const fn is_gate(self) -> bool {
        matches!(
            self,
            Self::TaskGate | Self::CallGate | Self::InterruptGate | Self::TrapGate
        )
    }

    pub const fn is_tss(self) -> bool {
        matches!(self, Self::TssAvailable | Self::TssBusy)
    }
}

pub const fn ring(bits: u8) -> PrivilegeLevel {
    match bits & 3 {
        0 => PrivilegeLevel::Ring0,
        1 => PrivilegeLevel::Ring1,
        2 => PrivilegeLevel::Ring2,
        _ => PrivilegeLevel::Ring3,
    }
}

impl Access {
    /// Present code/data segment of `kind` owned by `dpl`.
    pub const fn segment(kind: Access, dpl: PrivilegeLevel) -> Self {
        Self::PRESENT.union(kind).with_dpl(dpl)
    }

    /// Present system descriptor of type `ty` owned by `dpl`.
    pub const fn system(ty: SystemType, dpl: PrivilegeLevel) -> Self {
        Self::PRESENT
            .union(Self::from_bits_retain(ty as u8))
            .with_dpl(dpl)
    }

    pub const fn with_dpl(self, dpl: PrivilegeLevel) -> Self {
        let cleared = self.bits() & !(Self::DPL_LOW.bits() | Self::DPL_HIGH.bits());
        Self::from_bits_retain(cleared | ((dpl as u8) << 5))
    }

    pub const fn dpl(self) -> PrivilegeLevel {
        ring(self.bits() >> 5)
    }

    /// `None` for code/data segments and reserved system encodings.
    pub const fn system_type(self) -> Option<SystemType> {
        if self.contains(Self::CODE_DATA) {
            None
        } else {
            SystemType::from_bits(self.bits())
        }
    }
}

/// Packs a segment descriptor. `flags` supplies the upper nibble only.
pub const fn make_segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | ((access as u64) << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((flags & 0xF0) as u64) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

/// Packs a gate descriptor. `dpl` is a ring number (0..=3), `ty` a system type nibble.
pub const fn make_gate_descriptor(
    selector: u16,
    offset: u32,
    dpl: u8,
    ty: u8,
    param_count: u8,
) -> u64 {
    let offset = offset as u64;
    let type_byte = (ty & 0x0F) | ((dpl & 3) << 5) | Access::PRESENT.bits();
    (offset & 0xFFFF)
        | ((selector as u64) << 16)
        | (((param_count & 0x1F) as u64) << 32)
        | ((type_byte as u64) << 40)
        | ((offset >> 16) << 48)
}

/// One GDT, LDT or IDT slot.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn from_words(low: u32, high: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn segment(base: u32, limit: u32, access: Access, flags: Flags) -> Self {
        Self(make_segment_descriptor(base, limit, access.bits(), flags.bits()))
    }

    pub const fn gate(
        selector: SegmentSelector,
        offset: u32,
        dpl: PrivilegeLevel,
        ty: SystemType,
        param_count: u8,
    ) -> Self {
        Self(make_gate_descriptor(
            selector.0,
            offset,
            dpl as u8,
            ty as u8,
            param_count,
        ))
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn access(self) -> Access {
        Access::from_bits_retain((self.0 >> 40) as u8)
    }

    pub const fn is_present(self) -> bool {
        self.access().contains(Access::PRESENT)
    }

    pub const fn dpl(self) -> PrivilegeLevel {
        self.access().dpl()
    }

    pub const fn system_type(self) -> Option<SystemType> {
        self.access().system_type()
    }

    pub const fn is_code_segment(self) -> bool {
        self.access()
            .contains(Access::CODE_DATA.union(Access::EXECUTABLE))
    }

    pub const fn is_data_segment(self) -> bool {
        self.access().contains(Access::CODE_DATA) && !self.access().contains(Access::EXECUTABLE)
    }

    /// Data segment whose valid offsets lie above the limit.
    pub const fn is_expand_down(self) -> bool {
        self.is_data_segment() && self.access().contains(Access::CONFORMING)
    }

    pub const fn is_gate(self) -> bool {
        match self.system_type() {
            Some(ty) => ty.is_gate(),
            None => false,
        }
    }

    pub const fn base(self) -> u32 {
        (((self.0 >> 16) & 0xFF_FFFF) | (((self.0 >> 56) & 0xFF) << 24)) as u32
    }

    /// Raw 20-bit limit, in units of the granularity flag.
    pub const fn limit(self) -> u32 {
        ((self.0 & 0xFFFF) | (((self.0 >> 48) & 0xF) << 16)) as u32
    }

    /// Highest offset the segment accepts, with granularity applied.
    pub const fn byte_limit(self) -> u32 {
        if self.flags().contains(Flags::GRANULARITY_4K) {
            (self.limit() << 12) | 0xFFF
        } else {
            self.limit()
        }
    }

    /// One past the last linear address an expand-up segment covers.
    pub const fn end(self) -> u64 {
        self.base() as u64 + self.byte_limit() as u64 + 1
    }

    pub const fn flags(self) -> Flags {
        Flags::from_bits_retain(((self.0 >> 48) as u8) & 0xF0)
    }

    pub const fn gate_offset(self) -> u32 {
        ((self.0 & 0xFFFF) | ((self.0 >> 32) & 0xFFFF_0000)) as u32
    }

    pub const fn gate_selector(self) -> SegmentSelector {
        SegmentSelector((self.0 >> 16) as u16)
    }

    pub const fn param_count(self) -> u8 {
        ((self.0 >> 32) & 0x1F) as u8
    }

    /// Same gate with a new target offset and parameter count.
    pub const fn with_gate_target(self, offset: u32, param_count: u8) -> Self {
        const KEEP: u64 = 0x0000_FF00_FFFF_0000;
        let offset = offset as u64;
        Self(
            (self.0 & KEEP)
                | (offset & 0xFFFF)
                | (((param_count & 0x1F) as u64) << 32)
                | ((offset >> 16) << 48),
        )
    }

    /// Same segment with a new base and limit; access byte and flags survive.
    pub const fn with_base_limit(self, base: u32, limit: u32) -> Self {
        Self(make_segment_descriptor(
            base,
            limit,
            self.access().bits(),
            self.flags().bits(),
        ))
    }
}

impl From<u64> for Descriptor {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Descriptor> for u64 {
    fn from(d: Descriptor) -> Self {
        d.0
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_gate() {
            f.debug_struct("Gate")
                .field("selector", &format_args!("{:#x}", self.gate_selector().0))
                .field("offset", &format_args!("{:#x}", self.gate_offset()))
                .field("params", &self.param_count())
                .field("access", &format_args!("{:#04x}", self.access().bits()))
                .finish()
        } else {
            f.debug_struct("Segment")
                .field("base", &format_args!("{:#x}", self.base()))
                .field("limit", &format_args!("{:#x}", self.limit()))
                .field("access", &format_args!("{:#04x}", self.access().bits()))
                .field("flags", &format_args!("{:#x}", self.flags().bits()))
                .finish()
        }
    }
}
