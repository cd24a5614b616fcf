use super::EmuError;

/// Converts an operand size in bytes (1, 2, 4, or 8) to a sizecode (0, 1, 2, or 3).
/// Panics if size is invalid.
pub(crate) fn sizecode_of(size: u64) -> u8 {
    match size {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => panic!("invalid operand size {}", size),
    }
}

/// Truncates a value to the given size, which is then zero extended to 64-bit.
pub(crate) fn truncate(val: u64, sizecode: u8) -> u64 {
    match sizecode {
        0 => val as u8 as u64,
        1 => val as u16 as u64,
        2 => val as u32 as u64,
        3 => val,
        _ => panic!(),
    }
}
/// Sign extends a value of the given initial size to 64-bit.
/// The conversion is first performed by truncation, so bits outside the specified size range are ignored.
pub(crate) fn sign_extend(val: u64, sizecode: u8) -> u64 {
    match sizecode {
        0 => val as i8 as u64,
        1 => val as i16 as u64,
        2 => val as i32 as u64,
        3 => val,
        _ => panic!(),
    }
}
/// Gets the sign bit of the value with given size.
/// Bits outside the range of the size are ignored.
pub(crate) fn sign_bit(val: u64, sizecode: u8) -> bool {
    match sizecode {
        0 => (val as i8) < 0,
        1 => (val as i16) < 0,
        2 => (val as i32) < 0,
        3 => (val as i64) < 0,
        _ => panic!(),
    }
}
/// Checks if the value has even parity.
pub(crate) fn is_parity_even(val: u8) -> bool {
    val.count_ones() % 2 == 0
}

/// Rounds `addr` up to a multiple of `align` (a power of two).
/// Returns `None` on overflow.
pub(crate) fn align_up(addr: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(addr.checked_add(align - 1)? & !(align - 1))
}

/// Parses separator-delimited hex bytes such as `"de ad,be-ef"`.
/// Accepted separators are whitespace, `,`, `-`, and `:`.
pub(crate) fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, EmuError> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == '-' || c == ':')
        .filter(|s| !s.is_empty())
        .map(|s| {
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            if digits.is_empty() || digits.len() > 2 { return Err(EmuError::InvalidPattern(text.to_owned())); }
            u8::from_str_radix(digits, 16).map_err(|_| EmuError::InvalidPattern(text.to_owned()))
        })
        .collect()
}

#[test]
fn test_sizecode_helpers() {
    assert_eq!(truncate(0x1234_5678_9abc_def0, 0), 0xf0);
    assert_eq!(truncate(0x1234_5678_9abc_def0, 2), 0x9abc_def0);
    assert_eq!(sign_extend(0x80, 0), 0xffff_ffff_ffff_ff80);
    assert_eq!(sign_extend(0x7fff, 1), 0x7fff);
    assert!(sign_bit(0x8000_0000, 2));
    assert!(!sign_bit(0x8000_0000, 3));
    assert!(is_parity_even(0b1001_0000));
    assert!(!is_parity_even(0b0000_0001));
    assert_eq!(sizecode_of(8), 3);
}
#[test]
fn test_align_up() {
    assert_eq!(align_up(0, 0x1000), Some(0));
    assert_eq!(align_up(1, 0x1000), Some(0x1000));
    assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
    assert_eq!(align_up(u64::MAX, 0x1000), None);
}
#[test]
fn test_parse_hex_bytes() {
    assert_eq!(parse_hex_bytes("B8 78 56 34 12").unwrap(), vec![0xb8, 0x78, 0x56, 0x34, 0x12]);
    assert_eq!(parse_hex_bytes("de,ad-be:ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(parse_hex_bytes("  0x90   0X0f ").unwrap(), vec![0x90, 0x0f]);
    assert_eq!(parse_hex_bytes("").unwrap(), Vec::<u8>::new());
    assert!(matches!(parse_hex_bytes("zz"), Err(EmuError::InvalidPattern(_))));
    assert!(matches!(parse_hex_bytes("123"), Err(EmuError::InvalidPattern(_))));
}
