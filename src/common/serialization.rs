//! Little-endian binary encoding of the values that make up an emulator snapshot.
//!
//! Integers are written as their little-endian bytes, with `usize` always widened to 8 bytes.
//! Sequences (byte vectors, strings, `Vec<T>`) carry a `u64` length prefix, and `Option<T>` a one-byte tag.
//!
//! Bytes go through `TrivialBinaryRead`/`TrivialBinaryWrite` rather than the main traits,
//! so that `Vec<u8>` can be copied in bulk instead of going through the generic `Vec<T>` impl.
//!
//! # Example
//! ```
//! # use x86emu::common::serialization::*;
//! let mut blob = vec![];
//! String::from("stack").bin_write(&mut blob).unwrap();
//! Some(0x40_1000u64).bin_write(&mut blob).unwrap();
//!
//! let mut src = blob.as_slice();
//! assert_eq!(String::bin_read(&mut src).unwrap(), "stack");
//! assert_eq!(Option::<u64>::bin_read(&mut src).unwrap(), Some(0x40_1000));
//! ```

use std::io::{self, Read, Write};
use std::{cmp, mem};

/// Largest up-front allocation made for a length prefix; longer sequences grow as their data arrives.
const PREALLOCATE_LIMIT: usize = 1024 * 1024;

/// A type that can be encoded into a snapshot.
pub trait BinaryWrite {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()>;
}
/// A type that can be decoded from a snapshot.
pub trait BinaryRead: Sized {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<Self>;
}

/// Single-byte encoding, kept apart from `BinaryWrite` so byte vectors can have their own impl.
pub trait TrivialBinaryWrite {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()>;
}
/// Single-byte decoding, kept apart from `BinaryRead` so byte vectors can have their own impl.
pub trait TrivialBinaryRead: Sized {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<Self>;
}

impl TrivialBinaryWrite for u8 {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        f.write_all(&[*self])
    }
}
impl TrivialBinaryRead for u8 {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<u8> {
        let mut buf = [0];
        f.read_exact(&mut buf)?;
        Ok(buf[0])
    }
}

macro_rules! impl_le_int {
    ($($t:ty),*) => {$(
        impl BinaryWrite for $t {
            fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
                f.write_all(&self.to_le_bytes())
            }
        }
        impl BinaryRead for $t {
            fn bin_read<F: Read>(f: &mut F) -> io::Result<$t> {
                let mut buf = [0; mem::size_of::<$t>()];
                f.read_exact(&mut buf)?;
                Ok(<$t>::from_le_bytes(buf))
            }
        }
    )*}
}
impl_le_int!(u32, u64);

impl BinaryWrite for usize {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        (*self as u64).bin_write(f)
    }
}
impl BinaryRead for usize {
    /// Fails with `InvalidData` if the stored length does not fit the host's `usize`.
    fn bin_read<F: Read>(f: &mut F) -> io::Result<usize> {
        let v = u64::bin_read(f)?;
        if v > usize::MAX as u64 { return Err(io::ErrorKind::InvalidData.into()); }
        Ok(v as usize)
    }
}

impl BinaryWrite for [u8] {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.len().bin_write(f)?;
        f.write_all(self)
    }
}
impl BinaryWrite for Vec<u8> {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.as_slice().bin_write(f)
    }
}
impl BinaryRead for Vec<u8> {
    /// A corrupted length prefix cannot force a huge allocation: the data is read in bounded chunks.
    fn bin_read<F: Read>(f: &mut F) -> io::Result<Vec<u8>> {
        let len = usize::bin_read(f)?;
        let mut res = Vec::with_capacity(cmp::min(len, PREALLOCATE_LIMIT));
        let mut chunk = [0; 4096];
        while res.len() < len {
            let want = cmp::min(len - res.len(), chunk.len());
            f.read_exact(&mut chunk[..want])?;
            res.extend_from_slice(&chunk[..want]);
        }
        Ok(res)
    }
}

impl BinaryWrite for str {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.as_bytes().bin_write(f)
    }
}
impl BinaryWrite for String {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.as_str().bin_write(f)
    }
}
impl BinaryRead for String {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<String> {
        String::from_utf8(BinaryRead::bin_read(f)?).map_err(|_| io::ErrorKind::InvalidData.into())
    }
}

impl<T: BinaryWrite> BinaryWrite for [T] {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.len().bin_write(f)?;
        self.iter().try_for_each(|item| item.bin_write(f))
    }
}
impl<T: BinaryWrite> BinaryWrite for Vec<T> {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        self.as_slice().bin_write(f)
    }
}
impl<T: BinaryRead> BinaryRead for Vec<T> {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<Vec<T>> {
        let len = usize::bin_read(f)?;
        let mut res = Vec::with_capacity(cmp::min(len, PREALLOCATE_LIMIT / cmp::max(mem::size_of::<T>(), 1)));
        for _ in 0..len {
            res.push(T::bin_read(f)?);
        }
        Ok(res)
    }
}

impl<T: BinaryWrite> BinaryWrite for Option<T> {
    fn bin_write<F: Write>(&self, f: &mut F) -> io::Result<()> {
        match self {
            None => 0u8.bin_write(f),
            Some(v) => {
                1u8.bin_write(f)?;
                v.bin_write(f)
            }
        }
    }
}
impl<T: BinaryRead> BinaryRead for Option<T> {
    fn bin_read<F: Read>(f: &mut F) -> io::Result<Option<T>> {
        match u8::bin_read(f)? {
            0 => Ok(None),
            1 => Ok(Some(T::bin_read(f)?)),
            _ => Err(io::ErrorKind::InvalidData.into()),
        }
    }
}

#[test]
fn test_register_cells_layout() {
    let cells = vec![0u64, 0xdeadbeef, u64::MAX];
    let mut blob = vec![];
    cells.bin_write(&mut blob).unwrap();
    assert_eq!(blob.len(), 8 + 3 * 8);
    assert_eq!(&blob[..8], &3u64.to_le_bytes());
    assert_eq!(&blob[16..24], &0xdeadbeefu64.to_le_bytes());
    assert_eq!(Vec::<u64>::bin_read(&mut blob.as_slice()).unwrap(), cells);
}
#[test]
fn test_region_fields() {
    let mut blob = vec![];
    "code".bin_write(&mut blob).unwrap();
    0x40_0000u64.bin_write(&mut blob).unwrap();
    5u8.bin_write(&mut blob).unwrap();
    vec![0x90u8, 0xc3].bin_write(&mut blob).unwrap();
    None::<u64>.bin_write(&mut blob).unwrap();
    7u32.bin_write(&mut blob).unwrap();

    let mut src = blob.as_slice();
    assert_eq!(String::bin_read(&mut src).unwrap(), "code");
    assert_eq!(u64::bin_read(&mut src).unwrap(), 0x40_0000);
    assert_eq!(u8::bin_read(&mut src).unwrap(), 5);
    assert_eq!(Vec::<u8>::bin_read(&mut src).unwrap(), vec![0x90, 0xc3]);
    assert_eq!(Option::<u64>::bin_read(&mut src).unwrap(), None);
    assert_eq!(u32::bin_read(&mut src).unwrap(), 7);
    assert!(src.is_empty());
}
#[test]
fn test_truncated_contents() {
    let mut blob = vec![];
    vec![7u8; 100].bin_write(&mut blob).unwrap();
    blob.truncate(blob.len() - 10);
    match Vec::<u8>::bin_read(&mut blob.as_slice()) {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => (),
        r => panic!("{:?}", r),
    }

    // a length prefix far beyond the data fails without allocating it
    let mut blob = vec![];
    (u64::MAX >> 8).bin_write(&mut blob).unwrap();
    blob.extend_from_slice(&[1, 2, 3]);
    assert!(Vec::<u8>::bin_read(&mut blob.as_slice()).is_err());
}
#[test]
fn test_corrupt_tags_and_names() {
    let mut src: &[u8] = &[2, 0, 0, 0, 0, 0, 0, 0, 0];
    assert_eq!(Option::<u64>::bin_read(&mut src).unwrap_err().kind(), io::ErrorKind::InvalidData);

    let mut blob = vec![];
    vec![0xffu8, 0xfe].bin_write(&mut blob).unwrap();
    assert_eq!(String::bin_read(&mut blob.as_slice()).unwrap_err().kind(), io::ErrorKind::InvalidData);
}
