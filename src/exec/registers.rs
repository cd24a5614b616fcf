//! The emulated register file.
//!
//! Every register is an alias of one of a handful of 64-bit storage cells, described by a bit offset and a bit width.
//! Names are resolved once into a [`RegId`], after which all access is by table index.

use std::collections::HashMap;
use std::fmt;

use iced_x86::Register;

use crate::common::{Bitness, EmuError};

pub const RAX: usize = 0;
pub const RCX: usize = 1;
pub const RDX: usize = 2;
pub const RBX: usize = 3;
pub const RSP: usize = 4;
pub const RBP: usize = 5;
pub const RSI: usize = 6;
pub const RDI: usize = 7;
pub const R8: usize = 8;
pub const R9: usize = 9;
pub const R10: usize = 10;
pub const R11: usize = 11;
pub const R12: usize = 12;
pub const R13: usize = 13;
pub const R14: usize = 14;
pub const R15: usize = 15;
pub const RIP: usize = 16;
pub const RFLAGS: usize = 17;
pub const FS_BASE: usize = 18;
pub const GS_BASE: usize = 19;

/// Number of storage cells in a register file.
pub const CELL_COUNT: usize = 20;

/// The value of the flags register after a reset (bit 1 is always set).
pub const RESET_FLAGS: u64 = 0x2;

/// Location of a register alias within the register file.
#[derive(Clone, Copy, Debug)]
pub struct RegSpec {
    pub name: &'static str,
    pub cell: usize,
    pub offset: u8,
    pub bits: u8,
    /// Only valid in 64-bit mode.
    pub long_only: bool,
}
impl RegSpec {
    const fn mask(&self) -> u64 {
        if self.bits >= 64 { u64::MAX } else { (1 << self.bits) - 1 }
    }
    /// Size of the alias in bytes (rounded up for single-bit flags).
    pub const fn size(&self) -> u64 {
        ((self.bits as u64) + 7) / 8
    }
}

macro_rules! register_table {
    (@mode any) => { false };
    (@mode long) => { true };
    (
        gpr: $( $gid:ident => $gname:literal : $gcell:ident [ $goff:literal ; $gbits:literal ] $gmode:ident = $iced:ident ),* ;
        special: $( $sid:ident => $sname:literal : $scell:ident [ $soff:literal ; $sbits:literal ] $smode:ident ),* $(,)?
    ) => {
        /// Identifies a register alias.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum RegId {
            $($gid,)*
            $($sid,)*
        }

        const SPECS: &[RegSpec] = &[
            $(RegSpec { name: $gname, cell: $gcell, offset: $goff, bits: $gbits, long_only: register_table!(@mode $gmode) },)*
            $(RegSpec { name: $sname, cell: $scell, offset: $soff, bits: $sbits, long_only: register_table!(@mode $smode) },)*
        ];
        const ALL_IDS: &[RegId] = &[ $(RegId::$gid,)* $(RegId::$sid,)* ];

        impl RegId {
            /// Maps a decoder register onto the register file, if it is a general-purpose register.
            pub(crate) fn from_iced(reg: Register) -> Option<RegId> {
                match reg {
                    $(Register::$iced => Some(RegId::$gid),)*
                    _ => None,
                }
            }
        }
    };
}

register_table! {
    gpr:
        Rax => "rax" : RAX[0; 64] long = RAX,
        Rcx => "rcx" : RCX[0; 64] long = RCX,
        Rdx => "rdx" : RDX[0; 64] long = RDX,
        Rbx => "rbx" : RBX[0; 64] long = RBX,
        Rsp => "rsp" : RSP[0; 64] long = RSP,
        Rbp => "rbp" : RBP[0; 64] long = RBP,
        Rsi => "rsi" : RSI[0; 64] long = RSI,
        Rdi => "rdi" : RDI[0; 64] long = RDI,
        R8  => "r8"  : R8[0; 64]  long = R8,
        R9  => "r9"  : R9[0; 64]  long = R9,
        R10 => "r10" : R10[0; 64] long = R10,
        R11 => "r11" : R11[0; 64] long = R11,
        R12 => "r12" : R12[0; 64] long = R12,
        R13 => "r13" : R13[0; 64] long = R13,
        R14 => "r14" : R14[0; 64] long = R14,
        R15 => "r15" : R15[0; 64] long = R15,

        Eax  => "eax"  : RAX[0; 32] any  = EAX,
        Ecx  => "ecx"  : RCX[0; 32] any  = ECX,
        Edx  => "edx"  : RDX[0; 32] any  = EDX,
        Ebx  => "ebx"  : RBX[0; 32] any  = EBX,
        Esp  => "esp"  : RSP[0; 32] any  = ESP,
        Ebp  => "ebp"  : RBP[0; 32] any  = EBP,
        Esi  => "esi"  : RSI[0; 32] any  = ESI,
        Edi  => "edi"  : RDI[0; 32] any  = EDI,
        R8d  => "r8d"  : R8[0; 32]  long = R8D,
        R9d  => "r9d"  : R9[0; 32]  long = R9D,
        R10d => "r10d" : R10[0; 32] long = R10D,
        R11d => "r11d" : R11[0; 32] long = R11D,
        R12d => "r12d" : R12[0; 32] long = R12D,
        R13d => "r13d" : R13[0; 32] long = R13D,
        R14d => "r14d" : R14[0; 32] long = R14D,
        R15d => "r15d" : R15[0; 32] long = R15D,

        Ax   => "ax"   : RAX[0; 16] any  = AX,
        Cx   => "cx"   : RCX[0; 16] any  = CX,
        Dx   => "dx"   : RDX[0; 16] any  = DX,
        Bx   => "bx"   : RBX[0; 16] any  = BX,
        Sp   => "sp"   : RSP[0; 16] any  = SP,
        Bp   => "bp"   : RBP[0; 16] any  = BP,
        Si   => "si"   : RSI[0; 16] any  = SI,
        Di   => "di"   : RDI[0; 16] any  = DI,
        R8w  => "r8w"  : R8[0; 16]  long = R8W,
        R9w  => "r9w"  : R9[0; 16]  long = R9W,
        R10w => "r10w" : R10[0; 16] long = R10W,
        R11w => "r11w" : R11[0; 16] long = R11W,
        R12w => "r12w" : R12[0; 16] long = R12W,
        R13w => "r13w" : R13[0; 16] long = R13W,
        R14w => "r14w" : R14[0; 16] long = R14W,
        R15w => "r15w" : R15[0; 16] long = R15W,

        Al   => "al"   : RAX[0; 8] any  = AL,
        Cl   => "cl"   : RCX[0; 8] any  = CL,
        Dl   => "dl"   : RDX[0; 8] any  = DL,
        Bl   => "bl"   : RBX[0; 8] any  = BL,
        Spl  => "spl"  : RSP[0; 8] long = SPL,
        Bpl  => "bpl"  : RBP[0; 8] long = BPL,
        Sil  => "sil"  : RSI[0; 8] long = SIL,
        Dil  => "dil"  : RDI[0; 8] long = DIL,
        R8l  => "r8l"  : R8[0; 8]  long = R8L,
        R9l  => "r9l"  : R9[0; 8]  long = R9L,
        R10l => "r10l" : R10[0; 8] long = R10L,
        R11l => "r11l" : R11[0; 8] long = R11L,
        R12l => "r12l" : R12[0; 8] long = R12L,
        R13l => "r13l" : R13[0; 8] long = R13L,
        R14l => "r14l" : R14[0; 8] long = R14L,
        R15l => "r15l" : R15[0; 8] long = R15L,

        Ah   => "ah"   : RAX[8; 8] any  = AH,
        Ch   => "ch"   : RCX[8; 8] any  = CH,
        Dh   => "dh"   : RDX[8; 8] any  = DH,
        Bh   => "bh"   : RBX[8; 8] any  = BH;

    special:
        Rip    => "rip"    : RIP[0; 64]    long,
        Eip    => "eip"    : RIP[0; 32]    any,
        Ip     => "ip"     : RIP[0; 16]    any,
        Rflags => "rflags" : RFLAGS[0; 64] long,
        Eflags => "eflags" : RFLAGS[0; 32] any,
        Flags  => "flags"  : RFLAGS[0; 16] any,
        Cf     => "cf"     : RFLAGS[0; 1]  any,
        Pf     => "pf"     : RFLAGS[2; 1]  any,
        Af     => "af"     : RFLAGS[4; 1]  any,
        Zf     => "zf"     : RFLAGS[6; 1]  any,
        Sf     => "sf"     : RFLAGS[7; 1]  any,
        Tf     => "tf"     : RFLAGS[8; 1]  any,
        If     => "if"     : RFLAGS[9; 1]  any,
        Df     => "df"     : RFLAGS[10; 1] any,
        Of     => "of"     : RFLAGS[11; 1] any,
        Fs     => "fs"     : FS_BASE[0; 64] any,
        Gs     => "gs"     : GS_BASE[0; 64] any,
}

lazy_static! {
    static ref NAMES: HashMap<&'static str, RegId> = {
        let mut names: HashMap<&'static str, RegId> = ALL_IDS.iter().map(|&id| (id.spec().name, id)).collect();
        for &(alias, id) in &[
            ("r8b", RegId::R8l), ("r9b", RegId::R9l), ("r10b", RegId::R10l), ("r11b", RegId::R11l),
            ("r12b", RegId::R12l), ("r13b", RegId::R13l), ("r14b", RegId::R14l), ("r15b", RegId::R15l),
        ] {
            names.insert(alias, id);
        }
        names
    };
}

impl RegId {
    /// Gets the location of this alias in the register file.
    pub fn spec(self) -> &'static RegSpec {
        &SPECS[self as usize]
    }
    /// Looks up a register by (case-insensitive) name, regardless of bitness.
    pub fn from_name(name: &str) -> Option<RegId> {
        NAMES.get(name.to_ascii_lowercase().as_str()).copied()
    }
    /// Checks if the register exists in the given mode.
    pub fn valid_in(self, bitness: Bitness) -> bool {
        bitness == Bitness::Bits64 || !self.spec().long_only
    }
    /// Gets the widest alias of a storage cell that is valid in the given mode.
    pub fn full_width(cell: usize, bitness: Bitness) -> RegId {
        let want = if bitness == Bitness::Bits64 || cell == FS_BASE || cell == GS_BASE { 64 } else { 32 };
        ALL_IDS.iter().copied()
            .find(|id| { let s = id.spec(); s.cell == cell && s.offset == 0 && s.bits == want })
            .unwrap_or_else(|| panic!("no full-width alias for cell {}", cell))
    }
    /// Iterates over every register alias.
    pub fn all() -> impl Iterator<Item = RegId> {
        ALL_IDS.iter().copied()
    }
}
impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.spec().name)
    }
}

macro_rules! impl_flag {
    ($mask_name:ident, $set:ident, $clear:ident, $flip:ident, $get:ident, $assign:ident => $from:ty [ $mask:literal ]) => {
        pub const $mask_name: $from = $mask;
        pub fn $set(&mut self) { self.0 |= $mask }
        pub fn $clear(&mut self) { self.0 &= !$mask }
        pub fn $flip(&mut self) { self.0 ^= $mask }
        pub const fn $get(self) -> bool { (self.0 & $mask) != 0 }
        pub fn $assign(&mut self, value: bool) {
            if value { self.$set() } else { self.$clear() }
        }
    }
}

/// The CPU flags register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flags(pub u64);
impl Default for Flags {
    fn default() -> Self {
        Flags(RESET_FLAGS)
    }
}
impl Flags {
    impl_flag! { MASK_CF, set_cf, clear_cf, flip_cf, get_cf, assign_cf => u64 [0x0000000000000001] }
    impl_flag! { MASK_PF, set_pf, clear_pf, flip_pf, get_pf, assign_pf => u64 [0x0000000000000004] }
    impl_flag! { MASK_AF, set_af, clear_af, flip_af, get_af, assign_af => u64 [0x0000000000000010] }
    impl_flag! { MASK_ZF, set_zf, clear_zf, flip_zf, get_zf, assign_zf => u64 [0x0000000000000040] }
    impl_flag! { MASK_SF, set_sf, clear_sf, flip_sf, get_sf, assign_sf => u64 [0x0000000000000080] }
    impl_flag! { MASK_TF, set_tf, clear_tf, flip_tf, get_tf, assign_tf => u64 [0x0000000000000100] }
    impl_flag! { MASK_IF, set_if, clear_if, flip_if, get_if, assign_if => u64 [0x0000000000000200] }
    impl_flag! { MASK_DF, set_df, clear_df, flip_df, get_df, assign_df => u64 [0x0000000000000400] }
    impl_flag! { MASK_OF, set_of, clear_of, flip_of, get_of, assign_of => u64 [0x0000000000000800] }

    /// Flags that POPF may modify.
    pub const MODIFIABLE: u64 = 0x0000000000000fd5;

    // -------------------------------------------------------------------------------------

    /// Checks the "below" condition.
    pub const fn condition_b(self) -> bool { self.get_cf() }
    /// Checks the "below or equal" condition.
    pub const fn condition_be(self) -> bool { self.get_cf() || self.get_zf() }
    /// Checks the "above" condition.
    pub const fn condition_a(self) -> bool { !self.condition_be() }
    /// Checks the "above or equal" condition.
    pub const fn condition_ae(self) -> bool { !self.condition_b() }

    // -------------------------------------------------------------------------------------

    /// Checks the "less than" condition.
    pub const fn condition_l(self) -> bool { self.get_sf() != self.get_of() }
    /// Checks the "less or equal" condition.
    pub const fn condition_le(self) -> bool { self.get_zf() || (self.get_sf() != self.get_of()) }
    /// Checks the "greater than" condition.
    pub const fn condition_g(self) -> bool { !self.condition_le() }
    /// Checks the "greater or equal" condition.
    pub const fn condition_ge(self) -> bool { !self.condition_l() }
}

/// An individually addressable status or control flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    Carry,
    Parity,
    Auxiliary,
    Zero,
    Sign,
    Trap,
    Interrupt,
    Direction,
    Overflow,
}
impl Flag {
    pub const fn mask(self) -> u64 {
        match self {
            Flag::Carry => Flags::MASK_CF,
            Flag::Parity => Flags::MASK_PF,
            Flag::Auxiliary => Flags::MASK_AF,
            Flag::Zero => Flags::MASK_ZF,
            Flag::Sign => Flags::MASK_SF,
            Flag::Trap => Flags::MASK_TF,
            Flag::Interrupt => Flags::MASK_IF,
            Flag::Direction => Flags::MASK_DF,
            Flag::Overflow => Flags::MASK_OF,
        }
    }
}

/// Named, width-aliased register storage for one emulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    bitness: Bitness,
    cells: [u64; CELL_COUNT],
}
impl RegisterFile {
    /// Creates a register file in the reset state.
    pub fn new(bitness: Bitness) -> RegisterFile {
        let mut regs = RegisterFile { bitness, cells: [0; CELL_COUNT] };
        regs.reset();
        regs
    }
    /// Zeros every register except the flags, which get their reset value.
    pub fn reset(&mut self) {
        self.cells = [0; CELL_COUNT];
        self.cells[RFLAGS] = RESET_FLAGS;
    }

    pub fn bitness(&self) -> Bitness {
        self.bitness
    }

    /// Resolves a register name, failing if it does not exist in this register file's mode.
    pub fn resolve(&self, name: &str) -> Result<RegId, EmuError> {
        match RegId::from_name(name) {
            Some(id) if id.valid_in(self.bitness) => Ok(id),
            _ => Err(EmuError::UnknownRegister(name.to_owned())),
        }
    }
    /// Gets a register by name.
    pub fn get(&self, name: &str) -> Result<u64, EmuError> {
        Ok(self.get_id(self.resolve(name)?))
    }
    /// Sets a register by name.
    /// The value is truncated to the width of the alias, and only that alias' bits are modified.
    pub fn set(&mut self, name: &str, value: u64) -> Result<(), EmuError> {
        let id = self.resolve(name)?;
        self.set_id(id, value);
        Ok(())
    }

    /// Gets a register by id, zero extended to 64-bit.
    pub fn get_id(&self, id: RegId) -> u64 {
        let s = id.spec();
        (self.cells[s.cell] >> s.offset) & s.mask()
    }
    /// Sets a register by id, truncating the value and leaving bits outside the alias untouched.
    pub fn set_id(&mut self, id: RegId, value: u64) {
        let s = id.spec();
        let mask = s.mask() << s.offset;
        let cell = &mut self.cells[s.cell];
        *cell = (*cell & !mask) | ((value << s.offset) & mask);
    }
    /// Writes a register the way an instruction destination does:
    /// in 64-bit mode a 32-bit general-purpose write zeros the upper half of the register.
    pub(crate) fn write_dest(&mut self, id: RegId, value: u64) {
        let s = id.spec();
        if self.bitness == Bitness::Bits64 && s.bits == 32 && s.cell < RIP {
            self.cells[s.cell] = value as u32 as u64;
        } else {
            self.set_id(id, value);
        }
    }

    /// Writes the low `bytes` bytes of a storage cell, leaving the rest alone.
    pub(crate) fn write_cell(&mut self, cell: usize, bytes: u64, value: u64) {
        let mask = if bytes >= 8 { u64::MAX } else { (1 << (8 * bytes)) - 1 };
        self.cells[cell] = (self.cells[cell] & !mask) | (value & mask);
    }

    /// Gets the value of a full storage cell.
    pub fn cell(&self, cell: usize) -> u64 {
        self.cells[cell]
    }
    pub(crate) fn cells(&self) -> &[u64; CELL_COUNT] {
        &self.cells
    }
    pub(crate) fn load_cells(&mut self, cells: [u64; CELL_COUNT]) {
        self.cells = cells;
    }

    /// Gets the instruction pointer.
    pub fn ip(&self) -> u64 {
        self.cells[RIP]
    }
    /// Sets the instruction pointer, truncated to the mode's address width.
    pub fn set_ip(&mut self, value: u64) {
        self.cells[RIP] = value & self.bitness.address_mask();
    }
    /// Gets the native-width stack pointer (`esp` or `rsp`).
    pub fn sp(&self) -> u64 {
        self.cells[RSP] & self.bitness.address_mask()
    }
    /// Sets the native-width stack pointer (`esp` or `rsp`).
    pub fn set_sp(&mut self, value: u64) {
        self.write_native(RSP, value);
    }
    /// Gets the native-width value of a general-purpose cell.
    pub fn native(&self, cell: usize) -> u64 {
        self.cells[cell] & self.bitness.address_mask()
    }
    /// Sets the native-width value of a general-purpose cell.
    pub fn write_native(&mut self, cell: usize, value: u64) {
        let mask = self.bitness.address_mask();
        self.cells[cell] = (self.cells[cell] & !mask) | (value & mask);
    }

    pub fn flags(&self) -> Flags {
        Flags(self.cells[RFLAGS])
    }
    pub fn set_flags(&mut self, flags: Flags) {
        self.cells[RFLAGS] = flags.0;
    }
    pub fn get_flag(&self, flag: Flag) -> bool {
        self.cells[RFLAGS] & flag.mask() != 0
    }
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        if value { self.cells[RFLAGS] |= flag.mask() } else { self.cells[RFLAGS] &= !flag.mask() }
    }
}

#[test]
fn test_register_aliases() {
    let mut r = RegisterFile::new(Bitness::Bits64);
    assert_eq!(r.get("rax").unwrap(), 0);

    r.set("rax", 0x2049381758392734).unwrap();
    assert_eq!(r.get("rax").unwrap(), 0x2049381758392734);
    assert_eq!(r.get("eax").unwrap(), 0x58392734);
    assert_eq!(r.get("ax").unwrap(), 0x2734);
    assert_eq!(r.get("al").unwrap(), 0x34);
    assert_eq!(r.get("ah").unwrap(), 0x27);

    r.set("ax", 0x8692).unwrap();
    assert_eq!(r.get("rax").unwrap(), 0x2049381758398692);
    assert_eq!(r.get("ah").unwrap(), 0x86);

    r.set("al", 0xf5).unwrap();
    assert_eq!(r.get("rax").unwrap(), 0x20493817583986f5);
    assert_eq!(r.get("ah").unwrap(), 0x86);

    r.set("ah", 0x12).unwrap();
    assert_eq!(r.get("rax").unwrap(), 0x20493817583912f5);
    assert_eq!(r.get("al").unwrap(), 0xf5);

    // a narrow alias write never touches the upper half, unlike instruction semantics
    r.set("eax", 0x59288643).unwrap();
    assert_eq!(r.get("rax").unwrap(), 0x2049381759288643);
    r.write_dest(RegId::Eax, 0x59288643);
    assert_eq!(r.get("rax").unwrap(), 0x59288643);
}
#[test]
fn test_register_truncation() {
    let mut r = RegisterFile::new(Bitness::Bits32);
    r.set("ax", 0x1_2345).unwrap();
    assert_eq!(r.get("eax").unwrap(), 0x2345);
    r.set("eax", 0xffff_ffff_ffff).unwrap();
    assert_eq!(r.get("eax").unwrap(), 0xffff_ffff);
    r.set("bl", 0x1ff).unwrap();
    assert_eq!(r.get("ebx").unwrap(), 0xff);
    r.set("zf", 2).unwrap(); // truncated to the single bit, which is zero
    assert!(!r.get_flag(Flag::Zero));
    r.set("ZF", 3).unwrap();
    assert!(r.get_flag(Flag::Zero));
    assert_eq!(r.get("eflags").unwrap(), RESET_FLAGS | Flags::MASK_ZF);
}
#[test]
fn test_register_names_by_mode() {
    let r32 = RegisterFile::new(Bitness::Bits32);
    let r64 = RegisterFile::new(Bitness::Bits64);
    for name in &["rax", "r8", "r9d", "r15w", "sil", "r8b", "rip", "rflags"] {
        assert_eq!(r32.get(name), Err(EmuError::UnknownRegister(name.to_string())));
        assert!(r64.get(name).is_ok(), "{}", name);
    }
    for name in &["eax", "esp", "bh", "eip", "ip", "eflags", "cf", "of", "fs"] {
        assert!(r32.get(name).is_ok(), "{}", name);
        assert!(r64.get(name).is_ok(), "{}", name);
    }
    assert!(r64.get("xyz").is_err());
    assert_eq!(RegId::from_name("R8B"), Some(RegId::R8l));
}
#[test]
fn test_flags_independent() {
    let mut r = RegisterFile::new(Bitness::Bits32);
    r.set_flag(Flag::Carry, true);
    r.set_flag(Flag::Overflow, true);
    assert!(r.get_flag(Flag::Carry) && r.get_flag(Flag::Overflow));
    assert!(!r.get_flag(Flag::Zero) && !r.get_flag(Flag::Sign));
    r.set_flag(Flag::Carry, false);
    assert!(!r.get_flag(Flag::Carry) && r.get_flag(Flag::Overflow));
    assert_eq!(r.get("of").unwrap(), 1);
    assert_eq!(r.get("cf").unwrap(), 0);
}
#[test]
fn test_full_width_alias() {
    assert_eq!(RegId::full_width(RAX, Bitness::Bits32), RegId::Eax);
    assert_eq!(RegId::full_width(RAX, Bitness::Bits64), RegId::Rax);
    assert_eq!(RegId::full_width(RIP, Bitness::Bits32), RegId::Eip);
    assert_eq!(RegId::full_width(RFLAGS, Bitness::Bits64), RegId::Rflags);
    assert_eq!(RegId::full_width(FS_BASE, Bitness::Bits32), RegId::Fs);
    assert_eq!(RegId::from_iced(Register::R10D), Some(RegId::R10d));
    assert_eq!(RegId::from_iced(Register::BH), Some(RegId::Bh));
    assert_eq!(RegId::from_iced(Register::XMM0), None);
}
