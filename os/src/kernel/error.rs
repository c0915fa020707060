//! Error types for descriptor tables, the call-gate dispatcher, task setup and
//! the ring bootstrap sequence.

use core::fmt;
use x86_64::PrivilegeLevel;

use super::ring::BootStage;

/// Descriptor table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Slot index is past the end of the table
    IndexOutOfRange {
        index: usize,
        capacity: usize,
    },

    /// Slot 0 of the GDT is the null descriptor and is never written
    NullSlot,

    /// Partial patch aimed at a slot of the wrong descriptor type
    ///
    /// Patches only ever late-bind addresses into placeholders that were
    /// built with the right type; anything else is rejected unchanged.
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: u8,
    },
}

impl TableError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::IndexOutOfRange { .. } => "descriptor index out of range",
            Self::NullSlot => "null descriptor slot is read-only",
            Self::TypeMismatch { .. } => "slot holds a different descriptor type",
        }
    }
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { index, capacity } => {
                write!(f, "{}: {} >= {}", self.description(), index, capacity)
            }
            Self::TypeMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "{}: slot {} expected {}, access byte 0x{:02x}",
                self.description(),
                index,
                expected,
                found
            ),
            Self::NullSlot => write!(f, "{}", self.description()),
        }
    }
}

pub type TableResult<T> = Result<T, TableError>;

/// Call-gate request errors
///
/// Every variant maps to a nonzero status code handed back to the caller in
/// EAX; the table is left untouched whenever one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// EDX did not name any GDT service
    UnknownOpcode(u32),

    /// Caller asked for something more privileged than itself
    PrivilegeViolation {
        caller: PrivilegeLevel,
        required: PrivilegeLevel,
    },

    /// CPU exception vectors are bound by ring 0 only
    ReservedVector(u32),

    /// Gate target selector does not name a present code segment
    BadGateTarget(u16),

    /// Register payload outside its field range
    BadArgument(u32),

    /// Outer rings may not install system descriptors other than call gates,
    /// nor overwrite the system slots ring 0 built (access byte attached)
    SystemDescriptor(u8),

    /// Segment or task memory outside what the caller's own segments reach
    OutOfReach(u32),

    /// Handed-over task state failed validation
    BadTaskState(&'static str),

    /// Underlying table operation failed
    Table(TableError),
}

impl GateError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::UnknownOpcode(_) => "unknown call-gate opcode",
            Self::PrivilegeViolation { .. } => "request exceeds caller privilege",
            Self::ReservedVector(_) => "exception vectors are reserved",
            Self::BadGateTarget(_) => "gate target is not a present code segment",
            Self::BadArgument(_) => "argument out of range",
            Self::SystemDescriptor(_) => "system descriptors are installed by ring 0",
            Self::OutOfReach(_) => "address outside the caller's memory",
            Self::BadTaskState(_) => "task state refused",
            Self::Table(e) => e.description(),
        }
    }

    /// Status word returned in EAX.
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownOpcode(_) => 1,
            Self::PrivilegeViolation { .. } => 2,
            Self::ReservedVector(_) => 3,
            Self::BadGateTarget(_) => 4,
            Self::Table(TableError::IndexOutOfRange { .. }) => 5,
            Self::Table(TableError::NullSlot) => 6,
            Self::Table(TableError::TypeMismatch { .. }) => 7,
            Self::BadArgument(_) => 8,
            Self::SystemDescriptor(_) => 9,
            Self::OutOfReach(_) => 10,
            Self::BadTaskState(_) => 11,
        }
    }
}

impl From<TableError> for GateError {
    fn from(e: TableError) -> Self {
        Self::Table(e)
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(op) => write!(f, "{}: 0x{:x}", self.description(), op),
            Self::PrivilegeViolation { caller, required } => write!(
                f,
                "{}: caller {:?}, needs {:?}",
                self.description(),
                caller,
                required
            ),
            Self::ReservedVector(v) => write!(f, "{}: {}", self.description(), v),
            Self::BadGateTarget(sel) => write!(f, "{}: 0x{:x}", self.description(), sel),
            Self::BadArgument(value) => write!(f, "{}: 0x{:x}", self.description(), value),
            Self::SystemDescriptor(access) => {
                write!(f, "{}: access byte 0x{:02x}", self.description(), access)
            }
            Self::OutOfReach(addr) => write!(f, "{}: 0x{:08x}", self.description(), addr),
            Self::BadTaskState(why) => write!(f, "{}: {}", self.description(), why),
            Self::Table(e) => write!(f, "{}", e),
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;

/// Nonzero EAX status an outer ring receives for a refused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStatus(pub u32);

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call gate failed with status {}", self.0)
    }
}

/// Task setup errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// A TSS for this ring needs a stack for every more privileged ring
    InnerStacks {
        ring: PrivilegeLevel,
        provided: usize,
    },

    /// Descriptor install was refused by ring 0
    Install(GateStatus),
}

impl TaskError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::InnerStacks { .. } => "wrong number of inner-ring stacks",
            Self::Install(_) => "descriptor install refused",
        }
    }
}

impl From<GateStatus> for TaskError {
    fn from(status: GateStatus) -> Self {
        Self::Install(status)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InnerStacks { ring, provided } => write!(
                f,
                "{}: {:?} needs {}, got {}",
                self.description(),
                ring,
                *ring as usize,
                provided
            ),
            Self::Install(status) => write!(f, "{}: {}", self.description(), status),
        }
    }
}

/// Ring bootstrap protocol violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// `start` called after the sequence already left `Core`
    AlreadyStarted,

    /// Resume arrived from a ring other than the one currently running
    UnexpectedResume {
        expected: BootStage,
        found: BootStage,
    },

    /// The sequence would enter a ring whose init already ran
    RingReentered(BootStage),

    /// The sequence already handed off to the users main task
    AlreadyReady,

    /// Resume gate called with something other than the pending token
    InvalidToken(u32),
}

impl BootError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::AlreadyStarted => "ring bootstrap already started",
            Self::UnexpectedResume { .. } => "resume from unexpected ring",
            Self::RingReentered(_) => "ring init entered twice",
            Self::AlreadyReady => "system already ready",
            Self::InvalidToken(_) => "resume token not issued by the sequencer",
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedResume { expected, found } => write!(
                f,
                "{}: expected {:?}, found {:?}",
                self.description(),
                expected,
                found
            ),
            Self::RingReentered(stage) => write!(f, "{}: {:?}", self.description(), stage),
            Self::InvalidToken(raw) => write!(f, "{}: 0x{:x}", self.description(), raw),
            _ => write!(f, "{}", self.description()),
        }
    }
}

pub type BootResult<T> = Result<T, BootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_error_codes_are_nonzero_and_distinct() {
        let errors = [
            GateError::UnknownOpcode(0x42),
            GateError::PrivilegeViolation {
                caller: PrivilegeLevel::Ring3,
                required: PrivilegeLevel::Ring0,
            },
            GateError::ReservedVector(14),
            GateError::BadGateTarget(0x10),
            GateError::BadArgument(7),
            GateError::Table(TableError::IndexOutOfRange {
                index: 9000,
                capacity: 8192,
            }),
            GateError::Table(TableError::NullSlot),
            GateError::Table(TableError::TypeMismatch {
                index: 3,
                expected: "call gate",
                found: 0x9A,
            }),
            GateError::SystemDescriptor(0x89),
            GateError::OutOfReach(0x7D_F000),
            GateError::BadTaskState("nested task flag set"),
        ];
        for (i, a) in errors.iter().enumerate() {
            assert_ne!(a.code(), 0);
            for b in &errors[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
