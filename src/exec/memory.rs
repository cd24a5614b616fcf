//! The emulated address space: a set of named, non-overlapping, bounds-checked regions.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::mem;

use memchr::memchr;
use tracing::{debug, warn};

use crate::common::{Bitness, AccessKind, Protection, ConflictReason, EmuError};
use crate::common::util::{align_up, parse_hex_bytes};

/// Alignment of bases picked by the free-span search.
pub const REGION_ALIGNMENT: u64 = 0x1000;
/// Lowest address the free-span search will hand out (keeps the null page unmapped).
pub const ALLOC_FLOOR: u64 = 0x1000;
/// Exclusive upper bound of the 32-bit address space.
pub const ALLOC_CEILING_32: u64 = 0x1_0000_0000;
/// Exclusive upper bound of the free-span search in 64-bit mode (canonical user half).
pub const ALLOC_CEILING_64: u64 = 0x0000_8000_0000_0000;
/// Longest possible x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// A named, contiguous span of emulated memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub(crate) name: String,
    pub(crate) base: u64,
    pub(crate) protection: Protection,
    pub(crate) data: Vec<u8>,
}
impl Region {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn base(&self) -> u64 {
        self.base
    }
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
    /// One past the last address of the region.
    pub fn end(&self) -> u64 {
        self.base + self.size() // allocation guarantees this does not overflow
    }
    pub fn protection(&self) -> Protection {
        self.protection
    }
    /// The full contents of the region.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
    /// Checks if the address lies in `[base, base+size)`.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

macro_rules! impl_mem_primitive {
    ($([ $read:ident, $write:ident => $t:ty ]),*$(,)?) => {$(
        pub fn $read(&self, addr: u64) -> Result<$t, EmuError> {
            let mut v = [0; mem::size_of::<$t>()];
            v.copy_from_slice(self.slice(addr, mem::size_of::<$t>() as u64, AccessKind::Read)?);
            Ok(<$t>::from_le_bytes(v))
        }
        pub fn $write(&mut self, addr: u64, val: $t) -> Result<(), EmuError> {
            self.write_buffer(addr, &val.to_le_bytes())
        }
    )*}
}

/// The memory map of an emulator.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    regions: BTreeMap<u64, Region>, // keyed by base
    names: HashMap<String, u64>,    // name -> base
    bitness: Bitness,
    banzai: bool,
}
impl MemoryMap {
    /// Creates an empty memory map in strict mode.
    pub fn new(bitness: Bitness) -> MemoryMap {
        MemoryMap { regions: BTreeMap::new(), names: HashMap::new(), bitness, banzai: false }
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }
    /// Checks if permissive (banzai) mode is enabled.
    pub fn banzai(&self) -> bool {
        self.banzai
    }
    /// Enables or disables permissive (banzai) mode.
    /// Permissive mode lets protection violations through with a warning; boundary faults are never relaxed.
    pub fn set_banzai(&mut self, banzai: bool) {
        self.banzai = banzai;
    }

    /// Exclusive upper bound of any region in this map's mode.
    fn limit(&self) -> u64 {
        match self.bitness {
            Bitness::Bits32 => ALLOC_CEILING_32,
            Bitness::Bits64 => u64::MAX,
        }
    }
    fn ceiling(&self) -> u64 {
        match self.bitness {
            Bitness::Bits32 => ALLOC_CEILING_32,
            Bitness::Bits64 => ALLOC_CEILING_64,
        }
    }

    // -------------------------------------------------------------------------------------

    /// Allocates a read/write/execute region and returns its base.
    /// If `preferred_base` is `None`, the lowest free aligned span that fits is used.
    pub fn allocate(&mut self, name: &str, size: u64, preferred_base: Option<u64>) -> Result<u64, EmuError> {
        self.allocate_with_protection(name, size, preferred_base, Protection::RWX)
    }
    /// As `allocate` but with explicit protection flags.
    /// The new region is zero filled.
    pub fn allocate_with_protection(&mut self, name: &str, size: u64, preferred_base: Option<u64>, protection: Protection) -> Result<u64, EmuError> {
        let conflict = |reason| EmuError::AllocationConflict { name: name.to_owned(), reason };

        if self.names.contains_key(name) { return Err(conflict(ConflictReason::DuplicateName)); }
        if size == 0 { return Err(conflict(ConflictReason::EmptyRegion)); }
        if size > usize::MAX as u64 { return Err(EmuError::OutOfAddressSpace { size }); }

        let base = match preferred_base {
            Some(base) => {
                let end = match base.checked_add(size) {
                    Some(end) if end <= self.limit() => end,
                    _ => return Err(EmuError::OutOfAddressSpace { size }),
                };
                if let Some(other) = self.overlapping(base, end) {
                    return Err(conflict(ConflictReason::Overlap(other.name.clone())));
                }
                base
            }
            None => self.find_free(size).ok_or(EmuError::OutOfAddressSpace { size })?,
        };

        debug!("allocated region {} at {:#x} ({:#x} bytes, {})", name, base, size, protection);
        self.insert(Region { name: name.to_owned(), base, protection, data: vec![0; size as usize] });
        Ok(base)
    }

    /// Finds the lowest aligned base at or above `ALLOC_FLOOR` where `size` bytes are free.
    pub fn find_free(&self, size: u64) -> Option<u64> {
        let mut candidate = align_up(ALLOC_FLOOR, REGION_ALIGNMENT)?;
        for region in self.regions.values() {
            if region.end() <= candidate { continue; }
            if candidate.checked_add(size)? <= region.base { return Some(candidate); }
            candidate = align_up(region.end(), REGION_ALIGNMENT)?;
        }
        if candidate.checked_add(size)? <= self.ceiling() { Some(candidate) } else { None }
    }

    /// Gets the region intersecting `[base, end)`, if any.
    fn overlapping(&self, base: u64, end: u64) -> Option<&Region> {
        // regions are disjoint, so only the last one starting before `end` can intersect
        self.regions.range(..end).next_back().map(|(_, r)| r).filter(|r| r.end() > base)
    }

    fn insert(&mut self, region: Region) {
        self.names.insert(region.name.clone(), region.base);
        self.regions.insert(region.base, region);
    }

    // -------------------------------------------------------------------------------------

    /// Gets the region containing the address.
    pub fn region_at(&self, addr: u64) -> Option<&Region> {
        self.regions.range(..=addr).next_back().map(|(_, r)| r).filter(|r| r.contains(addr))
    }
    fn region_at_mut(&mut self, addr: u64) -> Option<&mut Region> {
        self.regions.range_mut(..=addr).next_back().map(|(_, r)| r).filter(|r| r.contains(addr))
    }
    /// Gets a region by name.
    pub fn region(&self, name: &str) -> Option<&Region> {
        self.names.get(name).and_then(|base| self.regions.get(base))
    }
    /// Gets a region by name for direct modification, bypassing protection.
    pub(crate) fn region_mut(&mut self, name: &str) -> Option<&mut Region> {
        let base = *self.names.get(name)?;
        self.regions.get_mut(&base)
    }
    /// Iterates over all regions in ascending base order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }
    /// Iterates over regions whose base is strictly above `addr`.
    pub(crate) fn regions_after(&self, addr: u64) -> impl Iterator<Item = &Region> {
        self.regions.range((Bound::Excluded(addr), Bound::Unbounded)).map(|(_, r)| r)
    }
    /// Iterates in descending order over regions that end at or below `addr`.
    pub(crate) fn regions_before(&self, addr: u64) -> impl Iterator<Item = &Region> {
        self.regions.range(..addr).rev().map(|(_, r)| r).filter(move |r| r.end() <= addr)
    }

    /// Checks if the address lies inside any region.
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.region_at(addr).is_some()
    }
    /// Gets the name of the region containing the address.
    pub fn name_of(&self, addr: u64) -> Option<&str> {
        self.region_at(addr).map(|r| r.name.as_str())
    }
    /// Total number of bytes across all regions.
    pub fn total_allocated_size(&self) -> u64 {
        self.regions.values().map(Region::size).sum()
    }

    // -------------------------------------------------------------------------------------

    /// Applies the protection check for an access to a region.
    /// Strict mode faults; permissive mode only warns.
    fn check_protection(banzai: bool, region: &Region, addr: u64, width: u64, op: AccessKind) -> Result<(), EmuError> {
        if region.protection.allows(op) { return Ok(()); }
        if banzai {
            warn!("{} of {} bytes at {:#x} violates {} protection of region {}", op, width, addr, region.protection, region.name);
            return Ok(());
        }
        Err(EmuError::MemoryFault { address: addr, width, op })
    }

    /// Grabs a contiguous block of memory that lies entirely in one region.
    pub(crate) fn slice(&self, addr: u64, len: u64, op: AccessKind) -> Result<&[u8], EmuError> {
        let fault = EmuError::MemoryFault { address: addr, width: len, op };
        let region = self.region_at(addr).ok_or_else(|| fault.clone())?;
        match addr.checked_add(len) {
            Some(end) if end <= region.end() => (),
            _ => return Err(fault),
        }
        MemoryMap::check_protection(self.banzai, region, addr, len, op)?;
        let start = (addr - region.base) as usize;
        Ok(&region.data[start..start + len as usize])
    }
    /// Similar to `slice` but returns a mutable block, checked for write access.
    pub(crate) fn slice_mut(&mut self, addr: u64, len: u64) -> Result<&mut [u8], EmuError> {
        let banzai = self.banzai;
        let fault = EmuError::MemoryFault { address: addr, width: len, op: AccessKind::Write };
        let region = self.region_at_mut(addr).ok_or_else(|| fault.clone())?;
        match addr.checked_add(len) {
            Some(end) if end <= region.end() => (),
            _ => return Err(fault),
        }
        MemoryMap::check_protection(banzai, region, addr, len, AccessKind::Write)?;
        let start = (addr - region.base) as usize;
        Ok(&mut region.data[start..start + len as usize])
    }
    /// Grabs up to `MAX_INSTRUCTION_LEN` bytes starting at `addr` from the region containing it.
    /// Fails if `addr` is unmapped (or not executable in strict mode).
    pub(crate) fn fetch(&self, addr: u64) -> Result<&[u8], EmuError> {
        let fault = EmuError::MemoryFault { address: addr, width: 1, op: AccessKind::Fetch };
        let region = self.region_at(addr).ok_or(fault)?;
        let len = std::cmp::min(region.end() - addr, MAX_INSTRUCTION_LEN as u64);
        MemoryMap::check_protection(self.banzai, region, addr, len, AccessKind::Fetch)?;
        let start = (addr - region.base) as usize;
        Ok(&region.data[start..start + len as usize])
    }

    // -------------------------------------------------------------------------------------

    /// Reads a little-endian value of `width` bytes (1 to 8), zero extended to 64-bit.
    pub fn read(&self, addr: u64, width: u64) -> Result<u64, EmuError> {
        if width < 1 || width > 8 { return Err(EmuError::InvalidWidth(width)); }
        let mut v = [0; 8];
        v[..width as usize].copy_from_slice(self.slice(addr, width, AccessKind::Read)?);
        Ok(u64::from_le_bytes(v))
    }
    /// Writes the low `width` bytes (1 to 8) of `value` in little-endian order.
    /// On failure, memory is unmodified.
    pub fn write(&mut self, addr: u64, width: u64, value: u64) -> Result<(), EmuError> {
        if width < 1 || width > 8 { return Err(EmuError::InvalidWidth(width)); }
        self.write_buffer(addr, &value.to_le_bytes()[..width as usize])
    }

    impl_mem_primitive! {
        [ read_u8,  write_u8  => u8 ],
        [ read_u16, write_u16 => u16 ],
        [ read_u32, write_u32 => u32 ],
        [ read_u64, write_u64 => u64 ],
        [ read_u128, write_u128 => u128 ],
    }

    /// Reads `len` bytes.
    /// Reading from address zero or reading zero bytes gives an empty result rather than a fault.
    pub fn read_buffer(&self, addr: u64, len: u64) -> Result<Vec<u8>, EmuError> {
        if addr == 0 || len == 0 { return Ok(vec![]); }
        Ok(self.slice(addr, len, AccessKind::Read)?.to_vec())
    }
    /// Writes a block of bytes, which must fit in one region.
    /// On failure, memory is unmodified.
    pub fn write_buffer(&mut self, addr: u64, value: &[u8]) -> Result<(), EmuError> {
        if value.is_empty() { return Ok(()); }
        self.slice_mut(addr, value.len() as u64)?.copy_from_slice(value);
        Ok(())
    }
    /// Writes separator-delimited hex bytes (e.g. `"B8 78 56 34 12"`) and returns the number of bytes written.
    pub fn write_hex(&mut self, addr: u64, text: &str) -> Result<u64, EmuError> {
        let bytes = parse_hex_bytes(text)?;
        self.write_buffer(addr, &bytes)?;
        Ok(bytes.len() as u64)
    }
    /// Fills `len` bytes with `value`.
    pub fn memset(&mut self, addr: u64, value: u8, len: u64) -> Result<(), EmuError> {
        if len == 0 { return Ok(()); }
        for b in self.slice_mut(addr, len)? { *b = value; }
        Ok(())
    }
    /// Copies `len` bytes from `src` to `dest`; the spans may be in different regions.
    pub fn memcpy(&mut self, dest: u64, src: u64, len: u64) -> Result<(), EmuError> {
        if len == 0 { return Ok(()); }
        let tmp = self.slice(src, len, AccessKind::Read)?.to_vec();
        self.write_buffer(dest, &tmp)
    }

    // -------------------------------------------------------------------------------------

    /// Reads the bytes of a null-terminated string (terminator excluded).
    /// Fails if no terminator is found before the end of the region.
    pub fn read_bytes_until_nul(&self, addr: u64) -> Result<Vec<u8>, EmuError> {
        if addr == 0 { return Ok(vec![]); }
        let region = self.region_at(addr).ok_or(EmuError::MemoryFault { address: addr, width: 1, op: AccessKind::Read })?;
        let tail = self.slice(addr, region.end() - addr, AccessKind::Read)?;
        match memchr(0, tail) {
            None => Err(EmuError::MemoryFault { address: region.end(), width: 1, op: AccessKind::Read }),
            Some(stop) => Ok(tail[..stop].to_vec()),
        }
    }
    /// Reads a null-terminated string; invalid UTF-8 is replaced.
    pub fn read_string(&self, addr: u64) -> Result<String, EmuError> {
        Ok(String::from_utf8_lossy(&self.read_bytes_until_nul(addr)?).into_owned())
    }
    /// Writes a string followed by a null terminator.
    /// On failure, memory is unmodified.
    pub fn write_string(&mut self, addr: u64, value: &str) -> Result<(), EmuError> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.write_buffer(addr, &bytes)
    }

    /// Reads a null-terminated UTF-16LE string; unpaired surrogates are replaced.
    pub fn read_wide_string(&self, addr: u64) -> Result<String, EmuError> {
        if addr == 0 { return Ok(String::new()); }
        let region = self.region_at(addr).ok_or(EmuError::MemoryFault { address: addr, width: 2, op: AccessKind::Read })?;
        let tail = self.slice(addr, region.end() - addr, AccessKind::Read)?;
        let mut units = vec![];
        for pair in tail.chunks(2) {
            if pair.len() < 2 { break; }
            match u16::from_le_bytes([pair[0], pair[1]]) {
                0 => return Ok(String::from_utf16_lossy(&units)),
                unit => units.push(unit),
            }
        }
        let stop = addr + 2 * units.len() as u64;
        Err(EmuError::MemoryFault { address: stop, width: 2, op: AccessKind::Read })
    }
    /// Writes a string as UTF-16LE followed by a 16-bit null terminator.
    /// On failure, memory is unmodified.
    pub fn write_wide_string(&mut self, addr: u64, value: &str) -> Result<(), EmuError> {
        let mut bytes = Vec::with_capacity(2 * value.len() + 2);
        for unit in value.encode_utf16().chain(std::iter::once(0)) {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        self.write_buffer(addr, &bytes)
    }
}

#[cfg(test)]
fn test_map() -> (MemoryMap, u64) {
    let mut m = MemoryMap::new(Bitness::Bits32);
    let base = m.allocate("m", 0x1000, None).unwrap();
    (m, base)
}

#[test]
fn test_allocate_first_fit() {
    let mut m = MemoryMap::new(Bitness::Bits32);
    assert_eq!(m.allocate("a", 0x10, None).unwrap(), ALLOC_FLOOR);
    assert_eq!(m.allocate("b", 0x1000, None).unwrap(), 0x2000); // rounded past the end of `a`
    assert_eq!(m.allocate("c", 0x100, Some(0x4000)).unwrap(), 0x4000);
    assert_eq!(m.allocate("d", 0x2000, None).unwrap(), 0x5000); // gap at 0x3000 is too small
    assert_eq!(m.allocate("e", 0x1000, None).unwrap(), 0x3000);
    assert_eq!(m.total_allocated_size(), 0x10 + 0x1000 + 0x100 + 0x2000 + 0x1000);
    let names: Vec<&str> = m.regions().map(Region::name).collect();
    assert_eq!(names, ["a", "b", "e", "c", "d"]);
}
#[test]
fn test_allocate_conflicts() {
    let (mut m, base) = test_map();
    match m.allocate("m", 0x10, None) {
        Err(EmuError::AllocationConflict { reason: ConflictReason::DuplicateName, .. }) => (),
        r => panic!("{:?}", r),
    }
    match m.allocate("n", 0x10, Some(base + 0xff0)) {
        Err(EmuError::AllocationConflict { reason: ConflictReason::Overlap(other), .. }) => assert_eq!(other, "m"),
        r => panic!("{:?}", r),
    }
    match m.allocate("n", 0x1000, Some(base - 0x800)) {
        Err(EmuError::AllocationConflict { reason: ConflictReason::Overlap(_), .. }) => (),
        r => panic!("{:?}", r),
    }
    assert!(matches!(m.allocate("z", 0, None), Err(EmuError::AllocationConflict { reason: ConflictReason::EmptyRegion, .. })));
    assert_eq!(m.allocate("n", 0x10, Some(base + 0x1000)).unwrap(), base + 0x1000); // adjacent is fine
}
#[test]
fn test_allocate_out_of_space() {
    let mut m = MemoryMap::new(Bitness::Bits32);
    assert_eq!(m.allocate("huge", 0x1_0000_0000, None), Err(EmuError::OutOfAddressSpace { size: 0x1_0000_0000 }));
    assert_eq!(m.allocate("top", 0x2000, Some(0xffff_f000)), Err(EmuError::OutOfAddressSpace { size: 0x2000 }));
    assert_eq!(m.allocate("top", 0x1000, Some(0xffff_f000)).unwrap(), 0xffff_f000);
    assert_eq!(m.allocate("most", 0xffff_e001, None), Err(EmuError::OutOfAddressSpace { size: 0xffff_e001 })); // one byte more than the span below `top`
    assert_eq!(m.find_free(0xffff_e000), Some(ALLOC_FLOOR));
}
#[test]
fn test_read_write_widths() {
    let (mut m, base) = test_map();
    m.write(base + 8, 4, 0xdeadbeef).unwrap();
    assert_eq!(m.read(base + 8, 4).unwrap(), 0xdeadbeef);
    assert_eq!(m.read_u16(base + 8).unwrap(), 0xbeef);
    assert_eq!(m.read_u8(base + 11).unwrap(), 0xde);
    m.write(base + 16, 2, 0x1234_5678).unwrap();
    assert_eq!(m.read(base + 16, 8).unwrap(), 0x5678);
    m.write_u64(base + 0x20, 0x0102030405060708).unwrap();
    assert_eq!(m.read_buffer(base + 0x20, 3).unwrap(), vec![8, 7, 6]);
    assert!(m.read(base + 0x1000 - 3, 4).is_err());
    assert_eq!(m.read(base, 0), Err(EmuError::InvalidWidth(0)));
    assert_eq!(m.write(base, 16, 1), Err(EmuError::InvalidWidth(16)));
    assert_eq!(m.read_u64(base).unwrap(), 0);
}
#[test]
fn test_boundary_faults() {
    for &banzai in &[false, true] {
        let (mut m, base) = test_map();
        m.set_banzai(banzai);
        assert!(m.write_u32(base + 0x1000 - 4, 1).is_ok()); // ends exactly at the last byte
        assert_eq!(m.write_u32(base + 0x1000 - 3, 1), Err(EmuError::MemoryFault { address: base + 0x1000 - 3, width: 4, op: AccessKind::Write }));
        assert_eq!(m.read_u32(base + 0x1000 - 4).unwrap(), 1); // failed write left memory alone
        assert!(m.read_u8(base - 1).is_err());
        assert!(m.write_buffer(0x10, &[1]).is_err());
    }
}
#[test]
fn test_cross_region_access_faults() {
    let (mut m, base) = test_map();
    m.allocate("next", 0x1000, Some(base + 0x1000)).unwrap();
    assert!(m.write_u32(base + 0xffe, 0).is_err()); // adjacent regions are still separate
    assert!(m.memcpy(base + 0x1000, base, 0x10).is_ok());
}
#[test]
fn test_protection() {
    let mut m = MemoryMap::new(Bitness::Bits64);
    let ro = m.allocate_with_protection("ro", 0x100, None, Protection::READ).unwrap();
    assert_eq!(m.write_u8(ro, 1), Err(EmuError::MemoryFault { address: ro, width: 1, op: AccessKind::Write }));
    assert!(m.fetch(ro).is_err());
    assert_eq!(m.read_u8(ro).unwrap(), 0);

    m.set_banzai(true);
    m.write_u8(ro, 1).unwrap();
    assert_eq!(m.read_u8(ro).unwrap(), 1);
    assert_eq!(m.fetch(ro).unwrap().len(), MAX_INSTRUCTION_LEN);
}
#[test]
fn test_empty_reads() {
    let (m, base) = test_map();
    assert_eq!(m.read_buffer(0, 16).unwrap(), Vec::<u8>::new());
    assert_eq!(m.read_buffer(base, 0).unwrap(), Vec::<u8>::new());
    assert_eq!(m.read_string(0).unwrap(), "");
    assert_eq!(m.read_wide_string(0).unwrap(), "");
    assert!(m.read_buffer(0x10, 16).is_err()); // unmapped non-zero address is a real fault
}
#[test]
fn test_strings() {
    let (mut m, base) = test_map();
    m.write_string(base, "hello").unwrap();
    assert_eq!(m.read_string(base).unwrap(), "hello");
    assert_eq!(m.read_u8(base + 5).unwrap(), 0);
    m.write_wide_string(base + 0x100, "wide ü").unwrap();
    assert_eq!(m.read_wide_string(base + 0x100).unwrap(), "wide ü");
    assert_eq!(m.read_u16(base + 0x100 + 12).unwrap(), 0);

    m.memset(base + 0xf00, b'a', 0x100).unwrap(); // no terminator before region end
    assert!(m.read_string(base + 0xf00).is_err());
    assert!(m.read_wide_string(base + 0xf00).is_err());
    assert!(m.write_string(base + 0xffc, "abcd").is_err()); // terminator does not fit
}
#[test]
fn test_introspection() {
    let (mut m, base) = test_map();
    assert!(m.is_mapped(base) && m.is_mapped(base + 0xfff) && !m.is_mapped(base + 0x1000));
    assert_eq!(m.name_of(base + 0x10), Some("m"));
    assert_eq!(m.name_of(0), None);
    assert_eq!(m.write_hex(base, "90 90 c3").unwrap(), 3);
    assert_eq!(m.read_buffer(base, 3).unwrap(), vec![0x90, 0x90, 0xc3]);
    assert!(matches!(m.write_hex(base, "9g"), Err(EmuError::InvalidPattern(_))));
    assert_eq!(m.region("m").unwrap().base(), base);
}
