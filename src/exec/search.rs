//! Byte-pattern search over the memory map.

use std::cmp;

use memchr::memmem;

use crate::common::EmuError;
use crate::common::util::parse_hex_bytes;
use super::memory::{MemoryMap, Region};

/// A byte sequence to search for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern(Vec<u8>);
impl Pattern {
    /// Builds a pattern from raw bytes.
    pub fn bytes(bytes: &[u8]) -> Pattern {
        Pattern(bytes.to_vec())
    }
    /// Builds a pattern from separator-delimited hex text (e.g. `"de ad be ef"`).
    pub fn hex(text: &str) -> Result<Pattern, EmuError> {
        Ok(Pattern(parse_hex_bytes(text)?))
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
impl From<&[u8]> for Pattern {
    fn from(bytes: &[u8]) -> Pattern {
        Pattern::bytes(bytes)
    }
}

/// Non-overlapping matches of `needle` in one region, as absolute addresses.
fn region_matches<'a>(region: &'a Region, needle: &'a [u8]) -> impl Iterator<Item = u64> + 'a {
    let base = region.base();
    memmem::find_iter(region.contents(), needle).map(move |i| base + i as u64)
}

impl MemoryMap {
    /// Finds every non-overlapping occurrence of the pattern, ascending by address.
    /// If `region` is given, only that region is scanned (an unknown name gives no matches).
    /// Matches never span two regions. An empty pattern matches nothing.
    pub fn search(&self, pattern: &Pattern, region: Option<&str>) -> Vec<u64> {
        if pattern.is_empty() { return vec![]; }
        match region {
            Some(name) => match self.region(name) {
                Some(r) => region_matches(r, pattern.as_bytes()).collect(),
                None => vec![],
            },
            None => self.regions().flat_map(|r| region_matches(r, pattern.as_bytes())).collect(),
        }
    }
    /// Finds the first occurrence of the pattern at or after `addr`.
    /// The scan starts in the region containing `addr` (if any) and continues through later regions.
    pub fn search_first_from(&self, pattern: &Pattern, addr: u64) -> Option<u64> {
        if pattern.is_empty() { return None; }
        let needle = pattern.as_bytes();
        if let Some(r) = self.region_at(addr) {
            let start = (addr - r.base()) as usize;
            if let Some(i) = memmem::find(&r.contents()[start..], needle) {
                return Some(addr + i as u64);
            }
        }
        self.regions_after(addr).find_map(|r| region_matches(r, needle).next())
    }
    /// Finds the nearest occurrence of the pattern that starts at or before `addr`.
    /// The scan starts in the region containing `addr` (if any) and continues backwards through earlier regions.
    pub fn search_last_before(&self, pattern: &Pattern, addr: u64) -> Option<u64> {
        if pattern.is_empty() { return None; }
        let needle = pattern.as_bytes();
        if let Some(r) = self.region_at(addr) {
            let contents = r.contents();
            let end = cmp::min((addr - r.base()) as usize + needle.len(), contents.len());
            if let Some(i) = memmem::rfind(&contents[..end], needle) {
                return Some(r.base() + i as u64);
            }
        }
        self.regions_before(addr).find_map(|r| memmem::rfind(r.contents(), needle).map(|i| r.base() + i as u64))
    }
}

#[cfg(test)]
use crate::common::Bitness;

#[test]
fn test_search_whole_map() {
    let mut m = MemoryMap::new(Bitness::Bits32);
    let a = m.allocate("a", 0x100, None).unwrap();
    let b = m.allocate("b", 0x100, None).unwrap();
    m.write_hex(a + 0x10, "de ad be ef").unwrap();
    m.write_hex(a + 0x40, "de ad be ef").unwrap();
    m.write_hex(b + 0x8, "de ad be ef").unwrap();

    let p = Pattern::hex("de-ad-be-ef").unwrap();
    assert_eq!(m.search(&p, None), vec![a + 0x10, a + 0x40, b + 0x8]);
    assert_eq!(m.search(&p, Some("b")), vec![b + 0x8]);
    assert_eq!(m.search(&p, Some("nope")), Vec::<u64>::new());
    assert_eq!(m.search(&Pattern::bytes(&[0xde, 0xad, 0xbe, 0xef]), None), m.search(&p, None));
    assert_eq!(m.search(&Pattern::bytes(&[0x11, 0x22]), None), Vec::<u64>::new());
    assert_eq!(m.search(&Pattern::bytes(&[]), None), Vec::<u64>::new());
}
#[test]
fn test_search_non_overlapping() {
    let mut m = MemoryMap::new(Bitness::Bits64);
    let a = m.allocate("a", 0x10, None).unwrap();
    m.write_buffer(a, &[0xaa; 5]).unwrap();
    assert_eq!(m.search(&Pattern::bytes(&[0xaa, 0xaa]), None), vec![a, a + 2]);
}
#[test]
fn test_search_does_not_span_regions() {
    let mut m = MemoryMap::new(Bitness::Bits32);
    m.allocate("a", 0x1000, Some(0x1000)).unwrap();
    m.allocate("b", 0x1000, Some(0x2000)).unwrap();
    m.write_u8(0x1fff, 0x12).unwrap();
    m.write_u8(0x2000, 0x34).unwrap();
    assert_eq!(m.search(&Pattern::hex("12 34").unwrap(), None), Vec::<u64>::new());
}
#[test]
fn test_search_first_from() {
    let mut m = MemoryMap::new(Bitness::Bits32);
    let a = m.allocate("a", 0x100, None).unwrap();
    let b = m.allocate("b", 0x100, None).unwrap();
    m.write_string(a + 0x20, "needle").unwrap();
    m.write_string(b + 0x30, "needle").unwrap();
    let p = Pattern::bytes(b"needle");
    assert_eq!(m.search_first_from(&p, a), Some(a + 0x20));
    assert_eq!(m.search_first_from(&p, a + 0x20), Some(a + 0x20));
    assert_eq!(m.search_first_from(&p, a + 0x21), Some(b + 0x30));
    assert_eq!(m.search_first_from(&p, 0x10), Some(a + 0x20));
    assert_eq!(m.search_first_from(&p, b + 0x31), None);
    assert!(Pattern::hex("nothex").is_err());
}
#[test]
fn test_search_last_before() {
    let mut m = MemoryMap::new(Bitness::Bits64);
    let a = m.allocate("a", 0x100, None).unwrap();
    let b = m.allocate("b", 0x100, None).unwrap();
    m.write_hex(a + 0x10, "4d 5a").unwrap();
    m.write_hex(b + 0x20, "4d 5a").unwrap();
    m.write_hex(b + 0x80, "4d 5a").unwrap();
    let p = Pattern::hex("4d 5a").unwrap();
    assert_eq!(m.search_last_before(&p, b + 0xff), Some(b + 0x80));
    assert_eq!(m.search_last_before(&p, b + 0x80), Some(b + 0x80));
    assert_eq!(m.search_last_before(&p, b + 0x7f), Some(b + 0x20));
    assert_eq!(m.search_last_before(&p, b + 0x1f), Some(a + 0x10));
    assert_eq!(m.search_last_before(&p, b + 0x1000), Some(b + 0x80)); // unmapped, so earlier regions only
    assert_eq!(m.search_last_before(&p, a + 0xf), None);

    // a match ending at the last byte of the region is found
    m.write_hex(b + 0xfe, "4d 5a").unwrap();
    assert_eq!(m.search_last_before(&p, b + 0xfe), Some(b + 0xfe));
}
