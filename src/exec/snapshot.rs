//! Saving and restoring the complete state of an emulator.
//!
//! A snapshot holds the register file, every memory region (metadata and contents), the execution state and position, and the breakpoint.
//! The encoding is `common::serialization`, tagged with a prefix and a version number.

use std::io::{self, Read, Write};
use num_traits::FromPrimitive;
use tracing::debug;

use crate::common::{Bitness, AccessKind, EmuError, Protection};
use crate::common::serialization::*;
use super::Emulator;
use super::State;
use super::memory::{MemoryMap, Region};
use super::registers::{RegisterFile, CELL_COUNT};

const SNAPSHOT_PREFIX: &[u8] = "x86emu-snapshot\0".as_bytes();
/// Version of the snapshot layout; snapshots of any other version are rejected.
pub const SNAPSHOT_VERSION: u32 = 2;

impl BinaryWrite for Region {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.name.bin_write(f)?;
        self.base.bin_write(f)?;
        self.size().bin_write(f)?;
        self.protection.0.bin_write(f)?;
        self.data.bin_write(f)
    }
}
impl BinaryRead for Region {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<Region> {
        let name = BinaryRead::bin_read(f)?;
        let base = BinaryRead::bin_read(f)?;
        let size = u64::bin_read(f)?;
        let protection = Protection(u8::bin_read(f)?);
        let data: Vec<u8> = BinaryRead::bin_read(f)?;
        if data.len() as u64 != size {
            return Err(io::ErrorKind::InvalidData.into());
        }
        Ok(Region { name, base, protection, data })
    }
}

fn invalid<T>() -> io::Result<T> {
    Err(io::ErrorKind::InvalidData.into())
}

impl BinaryWrite for AccessKind {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        let tag: u8 = match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
            AccessKind::Fetch => 2,
        };
        tag.bin_write(f)
    }
}
impl BinaryRead for AccessKind {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<AccessKind> {
        match u8::bin_read(f)? {
            0 => Ok(AccessKind::Read),
            1 => Ok(AccessKind::Write),
            2 => Ok(AccessKind::Fetch),
            _ => invalid(),
        }
    }
}

/// Encodes the error held by a faulted engine. Only faults (see `EmuError::is_fault`) can be stored.
fn write_fault<F: Write>(e: &EmuError, f: &mut F) -> io::Result<()> {
    match e {
        EmuError::MemoryFault { address, width, op } => {
            0u8.bin_write(f)?;
            address.bin_write(f)?;
            width.bin_write(f)?;
            op.bin_write(f)
        }
        EmuError::UnsupportedInstruction { address, bytes } => {
            1u8.bin_write(f)?;
            address.bin_write(f)?;
            bytes.bin_write(f)
        }
        EmuError::DivideError(address) => {
            2u8.bin_write(f)?;
            address.bin_write(f)
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}
fn read_fault<F: Read>(f: &mut F) -> io::Result<EmuError> {
    Ok(match u8::bin_read(f)? {
        0 => EmuError::MemoryFault { address: u64::bin_read(f)?, width: u64::bin_read(f)?, op: AccessKind::bin_read(f)? },
        1 => EmuError::UnsupportedInstruction { address: u64::bin_read(f)?, bytes: BinaryRead::bin_read(f)? },
        2 => EmuError::DivideError(u64::bin_read(f)?),
        _ => return invalid(),
    })
}

impl BinaryWrite for State {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        match self {
            State::Ready => 0u8.bin_write(f),
            State::Stepping => 1u8.bin_write(f),
            State::Halted(addr) => {
                2u8.bin_write(f)?;
                addr.bin_write(f)
            }
            State::Faulted(e) => {
                3u8.bin_write(f)?;
                write_fault(e, f)
            }
        }
    }
}
impl BinaryRead for State {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<State> {
        Ok(match u8::bin_read(f)? {
            0 => State::Ready,
            1 => State::Stepping,
            2 => State::Halted(u64::bin_read(f)?),
            3 => State::Faulted(read_fault(f)?),
            _ => return invalid(),
        })
    }
}

/// The decoded contents of a snapshot.
struct Snapshot {
    bitness: Bitness,
    cells: Vec<u64>,
    state: State,
    position: u64,
    breakpoint: Option<u64>,
    bp_resume: Option<u64>,
    regions: Vec<Region>,
}
impl BinaryWrite for Snapshot {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        SNAPSHOT_PREFIX.bin_write(f)?;
        SNAPSHOT_VERSION.bin_write(f)?;

        (self.bitness as u8).bin_write(f)?;
        self.cells.bin_write(f)?;
        self.state.bin_write(f)?;
        self.position.bin_write(f)?;
        self.breakpoint.bin_write(f)?;
        self.bp_resume.bin_write(f)?;
        self.regions.bin_write(f)
    }
}

fn incompatible(e: io::Error) -> EmuError {
    EmuError::IncompatibleSnapshot(e.to_string())
}

impl Snapshot {
    /// Decodes a snapshot, checking the prefix and version before anything else.
    fn decode<F: Read>(f: &mut F) -> Result<Snapshot, EmuError> {
        if Vec::<u8>::bin_read(f).map_err(incompatible)? != SNAPSHOT_PREFIX {
            return Err(EmuError::IncompatibleSnapshot("not a snapshot".into()));
        }
        let version = u32::bin_read(f).map_err(incompatible)?;
        if version != SNAPSHOT_VERSION {
            return Err(EmuError::IncompatibleSnapshot(format!("version {} (expected {})", version, SNAPSHOT_VERSION)));
        }

        let raw_bitness = u8::bin_read(f).map_err(incompatible)?;
        let bitness = Bitness::from_u8(raw_bitness).ok_or_else(|| EmuError::IncompatibleSnapshot(format!("unknown bitness {}", raw_bitness)))?;
        let cells = BinaryRead::bin_read(f).map_err(incompatible)?;
        let state = BinaryRead::bin_read(f).map_err(incompatible)?;
        let position = BinaryRead::bin_read(f).map_err(incompatible)?;
        let breakpoint = BinaryRead::bin_read(f).map_err(incompatible)?;
        let bp_resume = BinaryRead::bin_read(f).map_err(incompatible)?;
        let regions = BinaryRead::bin_read(f).map_err(incompatible)?;

        Ok(Snapshot { bitness, cells, state, position, breakpoint, bp_resume, regions })
    }
}

impl Emulator {
    /// Captures the registers, memory, execution state, position, and breakpoint into an opaque, versioned blob.
    pub fn serialize(&self) -> Vec<u8> {
        let snapshot = Snapshot {
            bitness: self.bitness(),
            cells: self.regs.cells().to_vec(),
            state: self.state.clone(),
            position: self.position,
            breakpoint: self.breakpoint,
            bp_resume: self.bp_resume,
            regions: self.memory.regions().cloned().collect(),
        };
        let mut f = vec![];
        // writing into a vec cannot fail, and `step` only stores faults in the faulted state
        if let Err(e) = snapshot.bin_write(&mut f) { unreachable!("{}", e); }
        f
    }
    /// Restores a blob produced by `serialize` on an emulator of the same bitness.
    /// Registers, memory, execution state, position, and breakpoint are replaced,
    /// so the emulator continues exactly as the serialized one would have (including a pending breakpoint resume, a halt, or a fault).
    /// Options (permissive mode, tracing, hooks, instruction ceiling) are kept.
    /// On failure, the internal state is unmodified.
    pub fn deserialize(&mut self, blob: &[u8]) -> Result<(), EmuError> {
        let mut f = blob;
        let snapshot = Snapshot::decode(&mut f)?;
        if snapshot.bitness != self.bitness() {
            return Err(EmuError::IncompatibleSnapshot(format!("{}-bit snapshot for a {}-bit emulator", snapshot.bitness.bits(), self.bitness().bits())));
        }
        if !f.is_empty() {
            return Err(EmuError::IncompatibleSnapshot("trailing data".into()));
        }

        let mut cells = [0; CELL_COUNT];
        if snapshot.cells.len() != CELL_COUNT {
            return Err(EmuError::IncompatibleSnapshot(format!("{} register cells (expected {})", snapshot.cells.len(), CELL_COUNT)));
        }
        cells.copy_from_slice(&snapshot.cells);
        let mut regs = RegisterFile::new(self.bitness());
        regs.load_cells(cells);

        // rebuild through the normal allocator so a corrupted blob cannot produce overlapping regions
        let mut memory = MemoryMap::new(self.bitness());
        memory.set_banzai(self.memory.banzai());
        for region in snapshot.regions {
            memory.allocate_with_protection(&region.name, region.size(), Some(region.base), region.protection)
                .map_err(|e| EmuError::IncompatibleSnapshot(e.to_string()))?;
            if let Some(r) = memory.region_mut(&region.name) { r.data = region.data; }
        }

        debug!("restored snapshot: {} regions, {:#x} bytes, position {}", memory.regions().count(), memory.total_allocated_size(), snapshot.position);
        self.regs = regs;
        self.memory = memory;
        self.position = snapshot.position;
        self.breakpoint = snapshot.breakpoint;
        self.bp_resume = snapshot.bp_resume;
        self.state = snapshot.state;
        Ok(())
    }
}

#[test]
fn test_snapshot_rejects_garbage() {
    let mut e = Emulator::new(Bitness::Bits32);
    assert!(matches!(e.deserialize(&[]), Err(EmuError::IncompatibleSnapshot(_))));
    assert!(matches!(e.deserialize(b"definitely not a snapshot"), Err(EmuError::IncompatibleSnapshot(_))));

    let mut blob = e.serialize();
    blob.pop();
    assert!(matches!(e.deserialize(&blob), Err(EmuError::IncompatibleSnapshot(_))));
}
#[test]
fn test_snapshot_version_and_bitness() {
    let e = Emulator::new(Bitness::Bits64);
    let blob = e.serialize();

    let mut other = Emulator::new(Bitness::Bits32);
    assert!(matches!(other.deserialize(&blob), Err(EmuError::IncompatibleSnapshot(_))));

    let mut bumped = blob.clone();
    let at = 8 + SNAPSHOT_PREFIX.len(); // length prefix + prefix bytes
    bumped[at..at + 4].copy_from_slice(&(SNAPSHOT_VERSION + 1).to_le_bytes());
    let mut same = Emulator::new(Bitness::Bits64);
    match same.deserialize(&bumped) {
        Err(EmuError::IncompatibleSnapshot(msg)) => assert!(msg.contains("version")),
        r => panic!("{:?}", r),
    }
    same.deserialize(&blob).unwrap();
}
#[test]
fn test_snapshot_keeps_fault() {
    let mut e = Emulator::new(Bitness::Bits32);
    let start = e.load_code("code", &[0x8b, 0x03], None).unwrap(); // mov eax, [ebx] with ebx = 0
    let err = e.step().unwrap_err();
    assert!(err.is_fault());

    let mut f = Emulator::new(Bitness::Bits32);
    f.deserialize(&e.serialize()).unwrap();
    assert_eq!(f.get_state(), &State::Faulted(err.clone()));
    assert_eq!(f.regs.ip(), start);
    assert_eq!(f.step(), Err(err));

    let mut e = Emulator::new(Bitness::Bits64);
    e.load_code("code", &[0x06], None).unwrap(); // invalid in 64-bit mode
    let err = e.step().unwrap_err();
    let mut f = Emulator::new(Bitness::Bits64);
    f.deserialize(&e.serialize()).unwrap();
    assert_eq!(f.step(), Err(err));
}
#[test]
fn test_snapshot_rejects_bad_state_tag() {
    let e = Emulator::new(Bitness::Bits32);
    let mut blob = e.serialize();
    // prefix, version, bitness, then the register cells
    let at = 8 + SNAPSHOT_PREFIX.len() + 4 + 1 + 8 + 8 * CELL_COUNT;
    assert_eq!(blob[at], 0); // ready
    blob[at] = 9;
    let mut f = Emulator::new(Bitness::Bits32);
    assert!(matches!(f.deserialize(&blob), Err(EmuError::IncompatibleSnapshot(_))));
}
#[test]
fn test_failed_restore_keeps_state() {
    let mut e = Emulator::new(Bitness::Bits32);
    e.memory.allocate("keep", 0x100, None).unwrap();
    e.set_reg("eax", 7).unwrap();
    assert!(e.deserialize(&[1, 2, 3]).is_err());
    assert_eq!(e.get_reg("eax").unwrap(), 7);
    assert!(e.memory.region("keep").is_some());
}
