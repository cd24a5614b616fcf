//! Semantics of the instructions the emulator can execute.

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

use crate::common::{Bitness, EmuError};
use crate::common::util::{sizecode_of, truncate, sign_extend, sign_bit, is_parity_even};
use super::Emulator;
use super::registers::*;

/// What happens after an instruction completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Flow {
    Next,
    Halt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StringOp {
    Movs,
    Stos,
    Lods,
    Cmps,
    Scas,
}

macro_rules! calc_mul {
    ($a:ident, $b:ident : $normal:ty, $extended:ty, $normal_bits:literal) => {{
        let full = $a as $normal as $extended * $b as $normal as $extended;
        ((full >> $normal_bits) as u64, full as u64, full as $normal as $extended != full)
    }}
}

/// Computes the unsigned product of `a` and `b`, split into high and low halves.
/// Bits in `a` and `b` that are outside of `sizecode` are ignored.
/// For the low half of the result, bits outside the range of `sizecode` but up to `sizecode+1` are the truncated full value.
/// For the upper half, bits outside the range of `sizecode` are undefined.
/// Also returns a flag denoting if the operation overflowed `sizecode`.
fn raw_mul(sizecode: u8, a: u64, b: u64) -> (u64, u64, bool) {
    match sizecode {
        0 => calc_mul!(a, b : u8, u16, 8),
        1 => calc_mul!(a, b : u16, u32, 16),
        2 => calc_mul!(a, b : u32, u64, 32),
        3 => calc_mul!(a, b : u64, u128, 64),
        _ => unreachable!(),
    }
}
/// As `raw_mul` except performs signed multiplication.
fn raw_imul(sizecode: u8, a: u64, b: u64) -> (u64, u64, bool) {
    match sizecode {
        0 => calc_mul!(a, b : i8, i16, 8),
        1 => calc_mul!(a, b : i16, i32, 16),
        2 => calc_mul!(a, b : i32, i64, 32),
        3 => calc_mul!(a, b : i64, i128, 64),
        _ => unreachable!(),
    }
}

macro_rules! calc_div {
    ($a:ident, $b:ident : $normal:ty, $extended:ty) => {{
        let (num, den) = ($a as $extended, $b as $normal as $extended);
        match (num.checked_div(den), num.checked_rem(den)) {
            (Some(quo), Some(rem)) => (quo as u64, rem as u64, quo as $normal as $extended != quo),
            _ => (0, 0, true), // zero divisor or overflow of the extended type
        }
    }}
}

/// Computes the division of the extended numerator `a` by the denominator `b`.
/// Returns the low half of the quotient, the remainder, and a flag denoting overflow of the quotient.
/// Bits outside the range of sizecode+1 (for a), or sizecode (for b) are ignored.
/// Bits outside the range of sizecode for both results are undefined.
fn raw_div(sizecode: u8, a: u128, b: u64) -> (u64, u64, bool) {
    match sizecode {
        0 => calc_div!(a, b : u8, u16),
        1 => calc_div!(a, b : u16, u32),
        2 => calc_div!(a, b : u32, u64),
        3 => calc_div!(a, b : u64, u128),
        _ => unreachable!(),
    }
}
fn raw_idiv(sizecode: u8, a: u128, b: u64) -> (u64, u64, bool) {
    match sizecode {
        0 => calc_div!(a, b : i8, i16),
        1 => calc_div!(a, b : i16, i32),
        2 => calc_div!(a, b : i32, i64),
        3 => calc_div!(a, b : i64, i128),
        _ => unreachable!(),
    }
}

/// Updates ZF SF PF to reflect the given value.
/// Bits outside the range of the given size are ignored.
fn update_flags_zsp(flags: &mut Flags, value: u64, sizecode: u8) {
    flags.0 &= !mask!(Flags: MASK_ZF | MASK_SF | MASK_PF);
    if truncate(value, sizecode) == 0 { flags.set_zf(); }
    if sign_bit(value, sizecode) { flags.set_sf(); }
    if is_parity_even(value as u8) { flags.set_pf(); }
}

/// Computes `a + b + carry` and the resulting arithmetic flags.
/// `a` and `b` must already be truncated to `sizecode`.
fn add_flags(flags: &mut Flags, sizecode: u8, a: u64, b: u64, carry: bool) -> u64 {
    let res = truncate(a.wrapping_add(b).wrapping_add(carry as u64), sizecode); // has to be truncated for CF logic

    update_flags_zsp(flags, res, sizecode);
    flags.assign_cf(res < a || (carry && res == a));
    flags.assign_af((a ^ b ^ res) & 0x10 != 0);
    flags.assign_of(sign_bit(!(a ^ b) & (a ^ res), sizecode)); // overflow if sign(a)=sign(b) and sign(a)!=sign(res)
    res
}
/// Computes `a - b - borrow` and the resulting arithmetic flags.
/// `a` and `b` must already be truncated to `sizecode`.
fn sub_flags(flags: &mut Flags, sizecode: u8, a: u64, b: u64, borrow: bool) -> u64 {
    let res = truncate(a.wrapping_sub(b).wrapping_sub(borrow as u64), sizecode);

    update_flags_zsp(flags, res, sizecode);
    flags.assign_cf(a < b || (borrow && a == b)); // a borrow was taken from the highest bit
    flags.assign_af((a ^ b ^ res) & 0x10 != 0);
    flags.assign_of(sign_bit((a ^ b) & (a ^ res), sizecode)); // overflow if sign(a)!=sign(b) and sign(a)!=sign(res)
    res
}
/// Sets the flags for a bitwise logic result. AF is undefined and left alone.
fn logic_flags(flags: &mut Flags, sizecode: u8, res: u64) -> u64 {
    flags.0 &= !mask!(Flags: MASK_OF | MASK_CF);
    update_flags_zsp(flags, res, sizecode);
    res
}

/// Evaluates the condition encoded in a conditional jump, move, or set mnemonic.
fn condition(flags: Flags, mnemonic: Mnemonic) -> Option<bool> {
    Some(match mnemonic {
        Mnemonic::Jo | Mnemonic::Cmovo | Mnemonic::Seto => flags.get_of(),
        Mnemonic::Jno | Mnemonic::Cmovno | Mnemonic::Setno => !flags.get_of(),
        Mnemonic::Jb | Mnemonic::Cmovb | Mnemonic::Setb => flags.condition_b(),
        Mnemonic::Jae | Mnemonic::Cmovae | Mnemonic::Setae => flags.condition_ae(),
        Mnemonic::Je | Mnemonic::Cmove | Mnemonic::Sete => flags.get_zf(),
        Mnemonic::Jne | Mnemonic::Cmovne | Mnemonic::Setne => !flags.get_zf(),
        Mnemonic::Jbe | Mnemonic::Cmovbe | Mnemonic::Setbe => flags.condition_be(),
        Mnemonic::Ja | Mnemonic::Cmova | Mnemonic::Seta => flags.condition_a(),
        Mnemonic::Js | Mnemonic::Cmovs | Mnemonic::Sets => flags.get_sf(),
        Mnemonic::Jns | Mnemonic::Cmovns | Mnemonic::Setns => !flags.get_sf(),
        Mnemonic::Jp | Mnemonic::Cmovp | Mnemonic::Setp => flags.get_pf(),
        Mnemonic::Jnp | Mnemonic::Cmovnp | Mnemonic::Setnp => !flags.get_pf(),
        Mnemonic::Jl | Mnemonic::Cmovl | Mnemonic::Setl => flags.condition_l(),
        Mnemonic::Jge | Mnemonic::Cmovge | Mnemonic::Setge => flags.condition_ge(),
        Mnemonic::Jle | Mnemonic::Cmovle | Mnemonic::Setle => flags.condition_le(),
        Mnemonic::Jg | Mnemonic::Cmovg | Mnemonic::Setg => flags.condition_g(),
        _ => return None,
    })
}

/// Checks if the instruction uses the implicit string operands (e.g. `movsd` the string op rather than the SSE move).
fn is_string(instr: &Instruction) -> bool {
    (0..instr.op_count()).any(|i| match instr.op_kind(i) {
        OpKind::MemorySegSI | OpKind::MemorySegESI | OpKind::MemorySegRSI
        | OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI => true,
        _ => false,
    })
}

const ACCUMULATORS: [RegId; 4] = [RegId::Al, RegId::Ax, RegId::Eax, RegId::Rax];

impl Emulator {
    /// Executes a decoded instruction.
    /// The instruction pointer has already been advanced past it.
    pub(super) fn execute(&mut self, instr: &Instruction) -> Result<Flow, EmuError> {
        match instr.mnemonic() {
            Mnemonic::Nop | Mnemonic::Pause | Mnemonic::Endbr32 | Mnemonic::Endbr64 => (),
            Mnemonic::Hlt => return Ok(Flow::Halt),

            Mnemonic::Mov => self.exec_mov(instr)?,
            Mnemonic::Movzx => self.exec_movzx(instr)?,
            Mnemonic::Movsx | Mnemonic::Movsxd => self.exec_movsx(instr)?,
            Mnemonic::Lea => self.exec_lea(instr)?,
            Mnemonic::Xchg => self.exec_xchg(instr)?,
            Mnemonic::Xadd => self.exec_xadd(instr)?,
            Mnemonic::Cmpxchg => self.exec_cmpxchg(instr)?,
            Mnemonic::Bswap => self.exec_bswap(instr)?,

            Mnemonic::Add => self.exec_alu(instr, true, |f, s, a, b| add_flags(f, s, a, b, false))?,
            Mnemonic::Adc => self.exec_alu(instr, true, |f, s, a, b| { let c = f.get_cf(); add_flags(f, s, a, b, c) })?,
            Mnemonic::Sub => self.exec_alu(instr, true, |f, s, a, b| sub_flags(f, s, a, b, false))?,
            Mnemonic::Sbb => self.exec_alu(instr, true, |f, s, a, b| { let c = f.get_cf(); sub_flags(f, s, a, b, c) })?,
            Mnemonic::Cmp => self.exec_alu(instr, false, |f, s, a, b| sub_flags(f, s, a, b, false))?,
            Mnemonic::And => self.exec_alu(instr, true, |f, s, a, b| logic_flags(f, s, a & b))?,
            Mnemonic::Or => self.exec_alu(instr, true, |f, s, a, b| logic_flags(f, s, a | b))?,
            Mnemonic::Xor => self.exec_alu(instr, true, |f, s, a, b| logic_flags(f, s, a ^ b))?,
            Mnemonic::Test => self.exec_alu(instr, false, |f, s, a, b| logic_flags(f, s, a & b))?,

            Mnemonic::Inc => self.exec_unary(instr, |f, s, v| {
                let res = truncate(v.wrapping_add(1), s);
                update_flags_zsp(f, res, s);
                f.assign_af(res & 0x0f == 0); // low nibble of 0 was a nibble overflow
                f.assign_of(sign_bit(!v & res, s));
                res
            })?,
            Mnemonic::Dec => self.exec_unary(instr, |f, s, v| {
                let res = truncate(v.wrapping_sub(1), s);
                update_flags_zsp(f, res, s);
                f.assign_af(v & 0x0f == 0); // low nibble of 0 was a nibble underflow
                f.assign_of(sign_bit(v & !res, s));
                res
            })?,
            Mnemonic::Neg => self.exec_unary(instr, |f, s, v| {
                let res = truncate(v.wrapping_neg(), s);
                update_flags_zsp(f, res, s);
                f.assign_cf(v != 0); // this is 0 < v (see sub_flags logic for 0 - v)
                f.assign_af(v & 0x0f != 0);
                f.assign_of(sign_bit(v & res, s));
                res
            })?,
            Mnemonic::Not => self.exec_unary(instr, |_, _, v| !v)?,

            Mnemonic::Mul => self.exec_mul_1(instr, raw_mul)?,
            Mnemonic::Imul if instr.op_count() == 1 => self.exec_mul_1(instr, raw_imul)?,
            Mnemonic::Imul => self.exec_imul_n(instr)?,
            Mnemonic::Div => self.exec_div(instr, raw_div)?,
            Mnemonic::Idiv => self.exec_div(instr, raw_idiv)?,

            Mnemonic::Shl | Mnemonic::Sal => self.exec_shift(instr, true, |_, m| m, |sizecode, val, masked, _| {
                let bits = 8u32 << sizecode;
                let res = val << masked;
                let carry = val.wrapping_shr(bits.wrapping_sub(masked)) & 1 != 0;
                let overflow = sign_bit(res, sizecode) ^ carry;
                (res, carry, overflow)
            })?,
            Mnemonic::Shr => self.exec_shift(instr, true, |_, m| m, |sizecode, val, masked, _| {
                let res = val >> masked;
                let carry = (val >> (masked - 1)) & 1 != 0;
                let overflow = sign_bit(val, sizecode);
                (res, carry, overflow)
            })?,
            Mnemonic::Sar => self.exec_shift(instr, true, |_, m| m, |sizecode, val, masked, _| {
                let extended = sign_extend(val, sizecode) as i64;
                let res = (extended >> masked) as u64;
                let carry = (extended >> (masked - 1)) & 1 != 0;
                (res, carry, false)
            })?,
            Mnemonic::Rol => self.exec_shift(instr, false, |sizecode, masked| (masked - 1) % (8 << sizecode) + 1, |sizecode, val, masked, _| {
                let res = match sizecode {
                    0 => (val as u8).rotate_left(masked) as u64,
                    1 => (val as u16).rotate_left(masked) as u64,
                    2 => (val as u32).rotate_left(masked) as u64,
                    3 => val.rotate_left(masked),
                    _ => unreachable!(),
                };
                let carry = res & 1 != 0;
                let overflow = sign_bit(res, sizecode) ^ carry;
                (res, carry, overflow)
            })?,
            Mnemonic::Ror => self.exec_shift(instr, false, |sizecode, masked| (masked - 1) % (8 << sizecode) + 1, |sizecode, val, masked, _| {
                let res = match sizecode {
                    0 => (val as u8).rotate_right(masked) as u64,
                    1 => (val as u16).rotate_right(masked) as u64,
                    2 => (val as u32).rotate_right(masked) as u64,
                    3 => val.rotate_right(masked),
                    _ => unreachable!(),
                };
                let carry = sign_bit(res, sizecode);
                let overflow = sign_bit(res ^ (res << 1), sizecode);
                (res, carry, overflow)
            })?,
            Mnemonic::Rcl => self.exec_shift(instr, false, |sizecode, masked| masked % ((8 << sizecode) + 1), |sizecode, val, masked, cf| {
                let bits = (8 << sizecode) + 1;
                let lower = if masked > 1 { val >> (bits - masked) } else { 0 };
                let upper = ((val << 1) | (if cf { 1 } else { 0 })) << (masked - 1);
                let res = upper | lower;
                let carry = (val >> (bits - masked - 1)) & 1 != 0;
                let overflow = sign_bit(res, sizecode) ^ carry;
                (res, carry, overflow)
            })?,
            Mnemonic::Rcr => self.exec_shift(instr, false, |sizecode, masked| masked % ((8 << sizecode) + 1), |sizecode, val, masked, cf| {
                let bits = (8 << sizecode) + 1;
                let lower = ((val >> 1) | (if cf { 1 << (bits - 2) } else { 0 })) >> (masked - 1);
                let upper = if masked > 1 { val << (bits - masked) } else { 0 };
                let res = upper | lower;
                let carry = (val >> (masked - 1)) & 1 != 0;
                let overflow = sign_bit(res ^ (res << 1), sizecode);
                (res, carry, overflow)
            })?,

            Mnemonic::Bt => self.exec_bit_test(instr, None)?,
            Mnemonic::Btc => self.exec_bit_test(instr, Some(|v, m| v ^ m))?,
            Mnemonic::Btr => self.exec_bit_test(instr, Some(|v, m| v & !m))?,
            Mnemonic::Bts => self.exec_bit_test(instr, Some(|v, m| v | m))?,

            Mnemonic::Push => self.exec_push(instr)?,
            Mnemonic::Pop => self.exec_pop(instr)?,
            Mnemonic::Pushf => self.exec_pushf(instr, 2)?,
            Mnemonic::Pushfd => self.exec_pushf(instr, 4)?,
            Mnemonic::Pushfq => self.exec_pushf(instr, 8)?,
            Mnemonic::Popf => self.exec_popf(instr, 2)?,
            Mnemonic::Popfd => self.exec_popf(instr, 4)?,
            Mnemonic::Popfq => self.exec_popf(instr, 8)?,
            Mnemonic::Pusha => self.exec_pusha(instr, 2)?,
            Mnemonic::Pushad => self.exec_pusha(instr, 4)?,
            Mnemonic::Popa => self.exec_popa(instr, 2)?,
            Mnemonic::Popad => self.exec_popa(instr, 4)?,
            Mnemonic::Leave => self.exec_leave()?,

            Mnemonic::Jmp => {
                let target = self.branch_target(instr)?;
                self.regs.set_ip(target);
            }
            Mnemonic::Call => self.exec_call(instr)?,
            Mnemonic::Ret => self.exec_ret(instr)?,
            Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => self.exec_loop(instr)?,
            Mnemonic::Jcxz => self.exec_jump_if_zero(instr, RegId::Cx),
            Mnemonic::Jecxz => self.exec_jump_if_zero(instr, RegId::Ecx),
            Mnemonic::Jrcxz => self.exec_jump_if_zero(instr, RegId::Rcx),

            Mnemonic::Clc => self.modify_flags(|f| f.clear_cf()),
            Mnemonic::Stc => self.modify_flags(|f| f.set_cf()),
            Mnemonic::Cmc => self.modify_flags(|f| f.flip_cf()),
            Mnemonic::Cld => self.modify_flags(|f| f.clear_df()),
            Mnemonic::Std => self.modify_flags(|f| f.set_df()),

            Mnemonic::Cbw => self.exec_widen(RegId::Al, 0, RegId::Ax),
            Mnemonic::Cwde => self.exec_widen(RegId::Ax, 1, RegId::Eax),
            Mnemonic::Cdqe => self.exec_widen(RegId::Eax, 2, RegId::Rax),
            Mnemonic::Cwd => self.exec_sign_fill(RegId::Ax, 1, RegId::Dx),
            Mnemonic::Cdq => self.exec_sign_fill(RegId::Eax, 2, RegId::Edx),
            Mnemonic::Cqo => self.exec_sign_fill(RegId::Rax, 3, RegId::Rdx),

            Mnemonic::Movsd | Mnemonic::Cmpsd if !is_string(instr) => return Err(self.unsupported(instr)),
            Mnemonic::Movsb | Mnemonic::Movsw | Mnemonic::Movsd | Mnemonic::Movsq => self.exec_string(instr, StringOp::Movs)?,
            Mnemonic::Stosb | Mnemonic::Stosw | Mnemonic::Stosd | Mnemonic::Stosq => self.exec_string(instr, StringOp::Stos)?,
            Mnemonic::Lodsb | Mnemonic::Lodsw | Mnemonic::Lodsd | Mnemonic::Lodsq => self.exec_string(instr, StringOp::Lods)?,
            Mnemonic::Cmpsb | Mnemonic::Cmpsw | Mnemonic::Cmpsd | Mnemonic::Cmpsq => self.exec_string(instr, StringOp::Cmps)?,
            Mnemonic::Scasb | Mnemonic::Scasw | Mnemonic::Scasd | Mnemonic::Scasq => self.exec_string(instr, StringOp::Scas)?,

            m => {
                let cnd = match condition(self.regs.flags(), m) {
                    Some(cnd) => cnd,
                    None => return Err(self.unsupported(instr)),
                };
                match instr.op_kind(0) {
                    OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => if cnd { self.regs.set_ip(instr.near_branch_target()); },
                    _ if instr.op_count() == 1 => self.write_op(instr, 0, cnd as u64)?, // setcc
                    _ => { // cmovcc reads its source even if the condition is false
                        let src = self.read_op(instr, 1)?;
                        let v = if cnd { src } else { self.read_op(instr, 0)? };
                        self.write_op(instr, 0, v)?; // still zero extends 32-bit destinations
                    }
                }
            }
        }
        Ok(Flow::Next)
    }

    // -------------------------------------------------------------------------------------

    fn unsupported(&self, instr: &Instruction) -> EmuError {
        let address = instr.ip();
        let bytes = self.memory.fetch(address).map(|b| b[..std::cmp::min(b.len(), instr.len())].to_vec()).unwrap_or_default();
        EmuError::UnsupportedInstruction { address, bytes }
    }
    fn reg_id(&self, instr: &Instruction, reg: Register) -> Result<RegId, EmuError> {
        RegId::from_iced(reg).ok_or_else(|| self.unsupported(instr))
    }

    /// Base address of the segment used by the memory operand (only FS and GS have a non-zero base).
    fn segment_base(&self, instr: &Instruction) -> u64 {
        match instr.memory_segment() {
            Register::FS => self.regs.cell(FS_BASE),
            Register::GS => self.regs.cell(GS_BASE),
            _ => 0,
        }
    }
    /// Computes the address of the memory operand.
    /// `segmented` adds the FS/GS base (everything except `lea`).
    fn effective_address(&self, instr: &Instruction, segmented: bool) -> Result<u64, EmuError> {
        let mut addr = instr.memory_displacement64(); // already absolute for rip-relative operands
        let mut bits = 64;
        let base = instr.memory_base();
        let index = instr.memory_index();
        if base == Register::EIP {
            bits = 32;
        } else if base != Register::None && base != Register::RIP {
            let id = self.reg_id(instr, base)?;
            bits = id.spec().bits;
            addr = addr.wrapping_add(self.regs.get_id(id));
        }
        if index != Register::None {
            let id = self.reg_id(instr, index)?;
            bits = id.spec().bits;
            addr = addr.wrapping_add(self.regs.get_id(id).wrapping_mul(instr.memory_index_scale() as u64));
        }
        if bits < 64 { addr &= (1 << bits) - 1; }
        if segmented { addr = addr.wrapping_add(self.segment_base(instr)); }
        Ok(addr & self.bitness().address_mask())
    }

    /// Gets the size of an operand in bytes.
    fn op_size(&self, instr: &Instruction, n: u32) -> Result<u64, EmuError> {
        Ok(match instr.op_kind(n) {
            OpKind::Register => self.reg_id(instr, instr.op_register(n))?.spec().size(),
            OpKind::Memory => instr.memory_size().size() as u64,
            OpKind::Immediate8 => 1,
            OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
            OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
            OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => 8,
            _ => return Err(self.unsupported(instr)),
        })
    }
    fn op_sizecode(&self, instr: &Instruction, n: u32) -> Result<u8, EmuError> {
        match self.op_size(instr, n)? {
            size @ 1 | size @ 2 | size @ 4 | size @ 8 => Ok(sizecode_of(size)),
            _ => Err(self.unsupported(instr)),
        }
    }
    /// Reads an operand, zero extended to 64-bit (immediates are sign extended by the decoder).
    fn read_op(&self, instr: &Instruction, n: u32) -> Result<u64, EmuError> {
        match instr.op_kind(n) {
            OpKind::Register => Ok(self.regs.get_id(self.reg_id(instr, instr.op_register(n))?)),
            OpKind::Memory => {
                let size = self.op_size(instr, n)?;
                if size == 0 || size > 8 { return Err(self.unsupported(instr)); }
                self.memory.read(self.effective_address(instr, true)?, size)
            }
            OpKind::Immediate8 | OpKind::Immediate16 | OpKind::Immediate32 | OpKind::Immediate64
            | OpKind::Immediate8to16 | OpKind::Immediate8to32 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => Ok(instr.immediate(n)),
            _ => Err(self.unsupported(instr)),
        }
    }
    /// Writes an operand, truncating the value to the operand's size.
    fn write_op(&mut self, instr: &Instruction, n: u32, value: u64) -> Result<(), EmuError> {
        match instr.op_kind(n) {
            OpKind::Register => {
                let id = self.reg_id(instr, instr.op_register(n))?;
                self.regs.write_dest(id, value);
                Ok(())
            }
            OpKind::Memory => {
                let size = self.op_size(instr, n)?;
                if size == 0 || size > 8 { return Err(self.unsupported(instr)); }
                let addr = self.effective_address(instr, true)?;
                self.memory.write(addr, size, value)
            }
            _ => Err(self.unsupported(instr)),
        }
    }

    fn modify_flags(&mut self, f: impl FnOnce(&mut Flags)) {
        let mut flags = self.regs.flags();
        f(&mut flags);
        self.regs.set_flags(flags);
    }

    // -------------------------------------------------------------------------------------

    fn exec_mov(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let v = self.read_op(instr, 1)?;
        self.write_op(instr, 0, v)
    }
    fn exec_movzx(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let v = truncate(self.read_op(instr, 1)?, self.op_sizecode(instr, 1)?);
        self.write_op(instr, 0, v)
    }
    fn exec_movsx(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let v = sign_extend(self.read_op(instr, 1)?, self.op_sizecode(instr, 1)?);
        self.write_op(instr, 0, v)
    }
    fn exec_lea(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let addr = self.effective_address(instr, false)?;
        self.write_op(instr, 0, addr)
    }
    fn exec_xchg(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let a = self.read_op(instr, 0)?;
        let b = self.read_op(instr, 1)?;
        self.write_op(instr, 0, b)?;
        self.write_op(instr, 1, a)
    }
    fn exec_xadd(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let a = truncate(self.read_op(instr, 0)?, sizecode);
        let b = truncate(self.read_op(instr, 1)?, sizecode);
        let mut flags = self.regs.flags();
        let res = add_flags(&mut flags, sizecode, a, b, false);
        if instr.op_kind(0) == OpKind::Memory {
            self.write_op(instr, 0, res)?; // may fault, so it goes before the register write
            self.write_op(instr, 1, a)?;
        } else {
            // the destination is written last so `xadd r, r` keeps the sum
            self.write_op(instr, 1, a)?;
            self.write_op(instr, 0, res)?;
        }
        self.regs.set_flags(flags);
        Ok(())
    }
    fn exec_cmpxchg(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let acc = ACCUMULATORS[sizecode as usize];
        let dest = truncate(self.read_op(instr, 0)?, sizecode);
        let expected = self.regs.get_id(acc);
        let mut flags = self.regs.flags();
        sub_flags(&mut flags, sizecode, expected, dest, false);
        if expected == dest {
            let src = self.read_op(instr, 1)?;
            self.write_op(instr, 0, src)?;
        } else {
            self.regs.write_dest(acc, dest);
        }
        self.regs.set_flags(flags);
        Ok(())
    }
    fn exec_bswap(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let v = self.read_op(instr, 0)?;
        let res = match self.op_sizecode(instr, 0)? {
            2 => (v as u32).swap_bytes() as u64,
            3 => v.swap_bytes(),
            _ => v, // 16-bit form is undefined
        };
        self.write_op(instr, 0, res)
    }

    /// Executes a two-operand arithmetic/logic instruction: `dest <- f(dest, src)`.
    /// The flags are only committed if the store succeeds.
    fn exec_alu(&mut self, instr: &Instruction, should_store: bool, op: fn(&mut Flags, u8, u64, u64) -> u64) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let a = truncate(self.read_op(instr, 0)?, sizecode);
        let b = truncate(self.read_op(instr, 1)?, sizecode);
        let mut flags = self.regs.flags();
        let res = op(&mut flags, sizecode, a, b);
        if should_store { self.write_op(instr, 0, res)?; }
        self.regs.set_flags(flags);
        Ok(())
    }
    /// Executes a one-operand instruction: `dest <- f(dest)`.
    fn exec_unary(&mut self, instr: &Instruction, op: fn(&mut Flags, u8, u64) -> u64) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let v = truncate(self.read_op(instr, 0)?, sizecode);
        let mut flags = self.regs.flags();
        let res = op(&mut flags, sizecode, v);
        self.write_op(instr, 0, res)?;
        self.regs.set_flags(flags);
        Ok(())
    }

    fn exec_mul_1(&mut self, instr: &Instruction, multiplier: fn(u8, u64, u64) -> (u64, u64, bool)) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let v = self.read_op(instr, 0)?;
        let (high, low, overflow) = multiplier(sizecode, self.regs.cell(RAX), v);
        match sizecode {
            0 => self.regs.set_id(RegId::Ax, low), // 16-bit result fits in 64-bit "low" half, so we can ignore high
            1 => { self.regs.set_id(RegId::Dx, high); self.regs.set_id(RegId::Ax, low); }
            2 => { self.regs.write_dest(RegId::Edx, high); self.regs.write_dest(RegId::Eax, low); }
            3 => { self.regs.set_id(RegId::Rdx, high); self.regs.set_id(RegId::Rax, low); }
            _ => unreachable!(),
        }
        self.modify_flags(|f| { f.assign_cf(overflow); f.assign_of(overflow); });
        Ok(())
    }
    fn exec_imul_n(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let (a, b) = match instr.op_count() {
            3 => (self.read_op(instr, 1)?, self.read_op(instr, 2)?),
            _ => (self.read_op(instr, 0)?, self.read_op(instr, 1)?),
        };
        let (_, res, overflow) = raw_imul(sizecode, a, b);
        self.write_op(instr, 0, res)?;
        self.modify_flags(|f| { f.assign_cf(overflow); f.assign_of(overflow); });
        Ok(())
    }
    fn exec_div(&mut self, instr: &Instruction, divider: fn(u8, u128, u64) -> (u64, u64, bool)) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let v = truncate(self.read_op(instr, 0)?, sizecode);
        if v == 0 { return Err(EmuError::DivideError(instr.ip())); }
        let num = match sizecode {
            0 => self.regs.get_id(RegId::Ax) as u128,
            1 => ((self.regs.get_id(RegId::Dx) as u128) << 16) | self.regs.get_id(RegId::Ax) as u128,
            2 => ((self.regs.get_id(RegId::Edx) as u128) << 32) | self.regs.get_id(RegId::Eax) as u128,
            3 => ((self.regs.cell(RDX) as u128) << 64) | self.regs.cell(RAX) as u128,
            _ => unreachable!(),
        };
        let (quo, rem, overflow) = divider(sizecode, num, v);
        if overflow { return Err(EmuError::DivideError(instr.ip())); }
        match sizecode {
            0 => self.regs.set_id(RegId::Ax, ((rem as u8 as u64) << 8) | quo as u8 as u64),
            1 => { self.regs.set_id(RegId::Dx, rem); self.regs.set_id(RegId::Ax, quo); }
            2 => { self.regs.write_dest(RegId::Edx, rem); self.regs.write_dest(RegId::Eax, quo); }
            3 => { self.regs.set_id(RegId::Rdx, rem); self.regs.set_id(RegId::Rax, quo); }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Executes a shift or rotate.
    /// `maskmod` maps the masked (non-zero) count to the effective count passed to `shifter`; an effective count of zero changes nothing.
    /// OF is only defined for a count of 1 and is otherwise left alone; rotates leave ZF SF PF alone.
    fn exec_shift(&mut self, instr: &Instruction, updates_zsp: bool, maskmod: fn(u8, u32) -> u32, shifter: fn(u8, u64, u32, bool) -> (u64, bool, bool)) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let a = truncate(self.read_op(instr, 0)?, sizecode); // shifters assume this
        let count = if instr.op_count() > 1 { self.read_op(instr, 1)? } else { 1 };
        let count = count as u32 & (if sizecode >= 3 { 0x3f } else { 0x1f });
        if count == 0 { return Ok(()); }
        let masked = maskmod(sizecode, count);
        if masked == 0 { return Ok(()); }

        let mut flags = self.regs.flags();
        let (res, carry, overflow) = shifter(sizecode, a, masked, flags.get_cf());
        self.write_op(instr, 0, res)?;
        flags.assign_cf(carry);
        if count == 1 { flags.assign_of(overflow); }
        if updates_zsp { update_flags_zsp(&mut flags, res, sizecode); }
        self.regs.set_flags(flags);
        Ok(())
    }
    fn exec_bit_test(&mut self, instr: &Instruction, mutator: Option<fn(u64, u64) -> u64>) -> Result<(), EmuError> {
        let sizecode = self.op_sizecode(instr, 0)?;
        let bits = 8u64 << sizecode;
        let offset = self.read_op(instr, 1)?;

        // a register bit offset into memory is signed and may select a block outside the operand
        let cf = if instr.op_kind(0) == OpKind::Memory && instr.op_kind(1) == OpKind::Register {
            let offset = sign_extend(offset, self.op_sizecode(instr, 1)?) as i64;
            let addr = self.effective_address(instr, true)?.wrapping_add(((offset >> (3 + sizecode)) << sizecode) as u64) & self.bitness().address_mask();
            let a = self.memory.read(addr, 1 << sizecode)?;
            let mask = 1 << (offset as u64 & (bits - 1));
            if let Some(f) = mutator { self.memory.write(addr, 1 << sizecode, f(a, mask))?; }
            a & mask != 0
        } else {
            let a = truncate(self.read_op(instr, 0)?, sizecode);
            let mask = 1 << (offset & (bits - 1));
            if let Some(f) = mutator { self.write_op(instr, 0, f(a, mask))?; }
            a & mask != 0
        };
        self.modify_flags(|f| f.assign_cf(cf));
        Ok(())
    }

    // -------------------------------------------------------------------------------------

    fn push_sized(&mut self, instr: &Instruction, size: u64, value: u64) -> Result<(), EmuError> {
        match size {
            2 => self.push_u16(value as u16),
            4 => self.push_u32(value as u32),
            8 => self.push_u64(value),
            _ => Err(self.unsupported(instr)),
        }
    }
    fn pop_sized(&mut self, instr: &Instruction, size: u64) -> Result<u64, EmuError> {
        Ok(match size {
            2 => self.pop_u16()? as u64,
            4 => self.pop_u32()? as u64,
            8 => self.pop_u64()?,
            _ => return Err(self.unsupported(instr)),
        })
    }
    fn exec_push(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(instr, 0)?;
        let value = self.read_op(instr, 0)?;
        self.push_sized(instr, size, value)
    }
    fn exec_pop(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(instr, 0)?;
        let value = self.pop_sized(instr, size)?;
        self.write_op(instr, 0, value)
    }
    fn exec_pushf(&mut self, instr: &Instruction, size: u64) -> Result<(), EmuError> {
        let flags = self.regs.flags().0;
        self.push_sized(instr, size, flags)
    }
    fn exec_popf(&mut self, instr: &Instruction, size: u64) -> Result<(), EmuError> {
        let value = self.pop_sized(instr, size)?;
        self.modify_flags(|f| f.0 = (f.0 & !Flags::MODIFIABLE) | (value & Flags::MODIFIABLE));
        Ok(())
    }
    fn exec_pusha(&mut self, instr: &Instruction, size: u64) -> Result<(), EmuError> {
        let sp = self.regs.sp();
        for &cell in &[RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI] {
            let v = if cell == RSP { sp } else { self.regs.cell(cell) };
            self.push_sized(instr, size, v)?;
        }
        Ok(())
    }
    fn exec_popa(&mut self, instr: &Instruction, size: u64) -> Result<(), EmuError> {
        for &cell in &[RDI, RSI, RBP, RSP, RBX, RDX, RCX, RAX] {
            let v = self.pop_sized(instr, size)?;
            if cell != RSP { self.regs.write_cell(cell, size, v); } // the saved stack pointer is discarded
        }
        Ok(())
    }
    fn exec_leave(&mut self) -> Result<(), EmuError> {
        let word = self.bitness().word_size();
        let bp = self.regs.native(RBP);
        let saved = self.memory.read(bp, word)?;
        self.regs.set_sp(bp.wrapping_add(word));
        self.regs.write_native(RBP, saved);
        Ok(())
    }

    // -------------------------------------------------------------------------------------

    fn branch_target(&self, instr: &Instruction) -> Result<u64, EmuError> {
        match instr.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Ok(instr.near_branch_target()),
            OpKind::Register | OpKind::Memory => self.read_op(instr, 0),
            _ => Err(self.unsupported(instr)), // far branches
        }
    }
    fn exec_call(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let target = self.branch_target(instr)?;
        self.push(instr.next_ip())?;
        self.regs.set_ip(target);
        Ok(())
    }
    fn exec_ret(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let ret = self.pop()?;
        if instr.op_count() == 1 {
            let sp = self.regs.sp().wrapping_add(instr.immediate(0));
            self.regs.set_sp(sp);
        }
        self.regs.set_ip(ret);
        Ok(())
    }
    fn exec_loop(&mut self, instr: &Instruction) -> Result<(), EmuError> {
        let counter = match self.bitness() {
            Bitness::Bits32 => RegId::Ecx,
            Bitness::Bits64 => RegId::Rcx,
        };
        let zf = self.regs.flags().get_zf();
        let cnd = match instr.mnemonic() {
            Mnemonic::Loope => zf,
            Mnemonic::Loopne => !zf,
            _ => true,
        };
        let count = self.regs.get_id(counter).wrapping_sub(1);
        self.regs.write_dest(counter, count);
        if self.regs.get_id(counter) != 0 && cnd { self.regs.set_ip(instr.near_branch_target()); }
        Ok(())
    }
    fn exec_jump_if_zero(&mut self, instr: &Instruction, counter: RegId) {
        if self.regs.get_id(counter) == 0 { self.regs.set_ip(instr.near_branch_target()); }
    }

    // -------------------------------------------------------------------------------------

    fn exec_widen(&mut self, src: RegId, sizecode: u8, dest: RegId) {
        let v = sign_extend(self.regs.get_id(src), sizecode);
        self.regs.write_dest(dest, v);
    }
    fn exec_sign_fill(&mut self, src: RegId, sizecode: u8, dest: RegId) {
        let fill = if sign_bit(self.regs.get_id(src), sizecode) { u64::MAX } else { 0 };
        self.regs.write_dest(dest, fill);
    }

    // -------------------------------------------------------------------------------------

    /// Gets the source index, destination index, and counter registers for the string instruction's address size.
    fn string_regs(&self, instr: &Instruction) -> (RegId, RegId, RegId) {
        for i in 0..instr.op_count() {
            match instr.op_kind(i) {
                OpKind::MemorySegSI | OpKind::MemoryESDI => return (RegId::Si, RegId::Di, RegId::Cx),
                OpKind::MemorySegESI | OpKind::MemoryESEDI => return (RegId::Esi, RegId::Edi, RegId::Ecx),
                OpKind::MemorySegRSI | OpKind::MemoryESRDI => return (RegId::Rsi, RegId::Rdi, RegId::Rcx),
                _ => (),
            }
        }
        match self.bitness() {
            Bitness::Bits32 => (RegId::Esi, RegId::Edi, RegId::Ecx),
            Bitness::Bits64 => (RegId::Rsi, RegId::Rdi, RegId::Rcx),
        }
    }
    /// Executes a string instruction; a repeated one runs to completion within this single instruction.
    fn exec_string(&mut self, instr: &Instruction, op: StringOp) -> Result<(), EmuError> {
        let size = instr.memory_size().size() as u64;
        if size != 1 && size != 2 && size != 4 && size != 8 { return Err(self.unsupported(instr)); }
        let regs = self.string_regs(instr);
        let compares = op == StringOp::Cmps || op == StringOp::Scas;

        if !instr.has_rep_prefix() && !instr.has_repne_prefix() {
            return self.exec_string_once(instr, op, size, regs);
        }
        let counter = regs.2;
        loop {
            let count = self.regs.get_id(counter);
            if count == 0 { break; }
            self.exec_string_once(instr, op, size, regs)?;
            self.regs.write_dest(counter, count - 1);
            if compares {
                let zf = self.regs.flags().get_zf();
                if (instr.has_repe_prefix() && !zf) || (instr.has_repne_prefix() && zf) { break; }
            }
        }
        Ok(())
    }
    fn exec_string_once(&mut self, instr: &Instruction, op: StringOp, size: u64, (si, di, _): (RegId, RegId, RegId)) -> Result<(), EmuError> {
        let sizecode = sizecode_of(size);
        let acc = ACCUMULATORS[sizecode as usize];
        let mask = self.bitness().address_mask();
        let src = self.regs.get_id(si).wrapping_add(self.segment_base(instr)) & mask;
        let dest = self.regs.get_id(di);

        match op {
            StringOp::Movs => {
                let v = self.memory.read(src, size)?;
                self.memory.write(dest, size, v)?;
            }
            StringOp::Stos => {
                let v = self.regs.get_id(acc);
                self.memory.write(dest, size, v)?;
            }
            StringOp::Lods => {
                let v = self.memory.read(src, size)?;
                self.regs.write_dest(acc, v);
            }
            StringOp::Cmps => {
                let a = self.memory.read(src, size)?;
                let b = self.memory.read(dest, size)?;
                self.modify_flags(|f| { sub_flags(f, sizecode, a, b, false); });
            }
            StringOp::Scas => {
                let a = self.regs.get_id(acc);
                let b = self.memory.read(dest, size)?;
                self.modify_flags(|f| { sub_flags(f, sizecode, a, b, false); });
            }
        }

        let delta = if self.regs.flags().get_df() { size.wrapping_neg() } else { size };
        if op != StringOp::Stos && op != StringOp::Scas {
            let v = self.regs.get_id(si).wrapping_add(delta);
            self.regs.write_dest(si, v);
        }
        if op != StringOp::Lods {
            let v = self.regs.get_id(di).wrapping_add(delta);
            self.regs.write_dest(di, v);
        }
        Ok(())
    }
}

#[test]
fn test_raw_muldiv() {
    assert_eq!(raw_mul(0, 0xff, 0xff), (0xfe, 0xfe01, true));
    assert_eq!(raw_mul(2, 3, 4), (0, 12, false));
    assert_eq!(raw_imul(0, 0xff, 0x02), (u64::MAX, (-2i64) as u64, false)); // -1 * 2
    assert_eq!(raw_div(1, 0x0001_0000, 2), (0x8000, 0, false));
    assert_eq!(raw_div(0, 0x1000, 2), (0x800, 0, true)); // quotient does not fit in a byte
    assert_eq!(raw_idiv(0, 0xfff9, 2), ((-3i64) as u64, (-1i64) as u64, false)); // -7 / 2
    assert!(raw_idiv(0, 0x8000, 0xff).2); // -32768 / -1 must not panic
    assert!(raw_idiv(3, 1 << 127, u64::MAX).2);
}
#[test]
fn test_add_sub_flags() {
    let mut f = Flags::default();
    assert_eq!(add_flags(&mut f, 0, 0xff, 1, false), 0);
    assert!(f.get_cf() && f.get_zf() && f.get_af() && !f.get_of());
    assert_eq!(add_flags(&mut f, 0, 0x7f, 0, true), 0x80);
    assert!(!f.get_cf() && f.get_of() && f.get_sf());
    assert_eq!(add_flags(&mut f, 2, 0xffffffff, 0, true), 0);
    assert!(f.get_cf());
    assert_eq!(sub_flags(&mut f, 1, 0, 1, false), 0xffff);
    assert!(f.get_cf() && f.get_sf() && !f.get_zf());
    assert_eq!(sub_flags(&mut f, 0, 5, 5, true), 0xff);
    assert!(f.get_cf());
    assert_eq!(sub_flags(&mut f, 0, 0x80, 1, false), 0x7f);
    assert!(f.get_of() && !f.get_cf());
}
#[test]
fn test_conditions() {
    let mut f = Flags::default();
    f.set_zf();
    assert_eq!(condition(f, Mnemonic::Je), Some(true));
    assert_eq!(condition(f, Mnemonic::Cmovne), Some(false));
    assert_eq!(condition(f, Mnemonic::Setbe), Some(true));
    f.clear_zf();
    f.set_sf();
    assert_eq!(condition(f, Mnemonic::Jl), Some(true));
    assert_eq!(condition(f, Mnemonic::Setg), Some(false));
    assert_eq!(condition(f, Mnemonic::Mov), None);
}
