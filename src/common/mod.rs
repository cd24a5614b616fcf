//! Everything that is used by the memory map, the register file, and the execution engine.

use std::fmt;
use thiserror::Error;

pub mod serialization;
pub(crate) mod util;

/// The execution mode of an emulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Bitness {
    /// 32-bit protected mode code (flat segments).
    Bits32 = 32,
    /// 64-bit long mode code.
    Bits64 = 64,
}
impl Bitness {
    /// Size of a native machine word (stack slot) in bytes.
    pub const fn word_size(self) -> u64 {
        match self {
            Bitness::Bits32 => 4,
            Bitness::Bits64 => 8,
        }
    }
    /// Mask applied to addresses computed in this mode.
    pub const fn address_mask(self) -> u64 {
        match self {
            Bitness::Bits32 => 0xffffffff,
            Bitness::Bits64 => u64::MAX,
        }
    }
    /// The bitness as iced-x86 expects it.
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// The kind of memory access that was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}
impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Fetch => "fetch",
        })
    }
}

/// Protection flags of a memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Protection(pub u8);
impl Protection {
    pub const READ: Protection = Protection(1);
    pub const WRITE: Protection = Protection(2);
    pub const EXECUTE: Protection = Protection(4);
    pub const RW: Protection = Protection(1 | 2);
    pub const RX: Protection = Protection(1 | 4);
    pub const RWX: Protection = Protection(1 | 2 | 4);

    pub const fn readable(self) -> bool { self.0 & 1 != 0 }
    pub const fn writable(self) -> bool { self.0 & 2 != 0 }
    pub const fn executable(self) -> bool { self.0 & 4 != 0 }

    /// Checks whether this protection allows the given kind of access.
    pub const fn allows(self, op: AccessKind) -> bool {
        match op {
            AccessKind::Read => self.readable(),
            AccessKind::Write => self.writable(),
            AccessKind::Fetch => self.executable(),
        }
    }
}
impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}",
            if self.readable() { 'r' } else { '-' },
            if self.writable() { 'w' } else { '-' },
            if self.executable() { 'x' } else { '-' })
    }
}

/// Why an allocation request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    /// A region with the same name already exists.
    DuplicateName,
    /// The requested span intersects the region with the given name.
    Overlap(String),
    /// Regions must contain at least one byte.
    EmptyRegion,
}
impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConflictReason::DuplicateName => f.write_str("name already in use"),
            ConflictReason::Overlap(other) => write!(f, "overlaps region `{}`", other),
            ConflictReason::EmptyRegion => f.write_str("region size is zero"),
        }
    }
}

/// Every error condition the memory map, register file, and engine can report.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EmuError {
    /// The register name is not valid in the emulator's bit-width mode.
    #[error("unknown register `{0}`")]
    UnknownRegister(String),
    /// An allocation used a duplicate name or an overlapping base.
    #[error("cannot allocate region `{name}`: {reason}")]
    AllocationConflict { name: String, reason: ConflictReason },
    /// No free span of the requested size exists.
    #[error("no free span of {size:#x} bytes")]
    OutOfAddressSpace { size: u64 },
    /// An access was unmapped, crossed a region boundary, or violated protection in strict mode.
    #[error("memory fault: {op} of {width} bytes at {address:#x}")]
    MemoryFault { address: u64, width: u64, op: AccessKind },
    /// The bytes at the instruction pointer do not decode to a supported instruction.
    #[error("unsupported instruction at {address:#x}: {bytes:02x?}")]
    UnsupportedInstruction { address: u64, bytes: Vec<u8> },
    /// A division by zero or a quotient overflow.
    #[error("divide error at {0:#x}")]
    DivideError(u64),
    /// The active breakpoint was reached; the instruction there was not executed.
    #[error("breakpoint hit at {0:#x}")]
    BreakpointHit(u64),
    /// `run` executed its instruction ceiling without reaching the stop address.
    #[error("execution exhausted after {0} instructions")]
    ExecutionExhausted(u64),
    /// The emulator already halted at the given address.
    #[error("emulator halted at {0:#x}")]
    Halted(u64),
    /// A snapshot blob has the wrong format, version, or bit-width.
    #[error("incompatible snapshot: {0}")]
    IncompatibleSnapshot(String),
    /// Hex pattern text could not be parsed.
    #[error("invalid hex pattern `{0}`")]
    InvalidPattern(String),
    /// A sized memory access asked for a width outside 1 to 8 bytes.
    #[error("invalid access width {0}")]
    InvalidWidth(u64),
}
impl EmuError {
    /// Checks if this error is unrecoverable, i.e. it moves the engine to the faulted state.
    pub fn is_fault(&self) -> bool {
        matches!(self,
            EmuError::MemoryFault { .. } | EmuError::UnsupportedInstruction { .. } | EmuError::DivideError(_))
    }
}

#[test]
fn test_error_display() {
    let e = EmuError::MemoryFault { address: 0x1ffd, width: 4, op: AccessKind::Read };
    assert_eq!(e.to_string(), "memory fault: read of 4 bytes at 0x1ffd");
    assert!(e.is_fault());

    let e = EmuError::AllocationConflict { name: "m".into(), reason: ConflictReason::Overlap("code".into()) };
    assert_eq!(e.to_string(), "cannot allocate region `m`: overlaps region `code`");
    assert!(!e.is_fault());

    assert!(!EmuError::BreakpointHit(0x1000).is_fault());
    assert!(!EmuError::ExecutionExhausted(10).is_fault());
    assert_eq!(Protection::RX.to_string(), "r-x");
}
