//! Error types for page table edits

/// Paging operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// Address is not aligned to a page boundary
    Misaligned {
        /// The misaligned address
        addr: u32,
        /// Required alignment (4096)
        required: u32,
    },

    /// Range reaches past the identity-mapped pool
    OutOfRange {
        /// First byte of the range
        start: u32,
        /// Length in bytes
        size: u32,
    },

    /// `start + size` does not fit in 32 bits
    SizeOverflow {
        start: u32,
        pages: usize,
    },

    /// Flag bits outside the low 12 bits of an entry
    InvalidFlags(u64),
}

impl PagingError {
    /// Returns a human-readable description of the error
    pub fn description(&self) -> &'static str {
        match self {
            Self::Misaligned { .. } => "address is not properly aligned",
            Self::OutOfRange { .. } => "range outside the identity map",
            Self::SizeOverflow { .. } => "size calculation overflow",
            Self::InvalidFlags(_) => "invalid page table flags combination",
        }
    }
}

/// Convenience type alias for Results with PagingError
pub type PagingResult<T> = Result<T, PagingError>;

impl core::fmt::Display for PagingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Misaligned { addr, required } => {
                write!(
                    f,
                    "{}: address 0x{:x} must be aligned to 0x{:x}",
                    self.description(),
                    addr,
                    required
                )
            }
            Self::OutOfRange { start, size } => {
                write!(
                    f,
                    "{}: 0x{:x} + 0x{:x}",
                    self.description(),
                    start,
                    size
                )
            }
            Self::SizeOverflow { start, pages } => {
                write!(
                    f,
                    "{}: start 0x{:x} + {} pages overflows",
                    self.description(),
                    start,
                    pages
                )
            }
            Self::InvalidFlags(bits) => write!(f, "{}: 0x{:x}", self.description(), bits),
        }
    }
}
