//! Everything pertaining to executing x86 machine code.

use std::{cmp, mem};

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction};
use tracing::{debug, trace, warn};

use crate::common::{Bitness, AccessKind, EmuError, Protection};

pub mod registers;
pub mod memory;
pub mod search;
pub mod snapshot;
mod instructions;

use registers::*;
use memory::*;

/// Default ceiling on the number of instructions a single call to `run` may execute.
pub const DEFAULT_MAX_INSTRUCTIONS: u64 = 50_000_000;

/// Current state of an emulator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// No instruction has been executed yet.
    Ready,
    /// The emulator has executed at least one instruction and can continue.
    Stepping,
    /// The emulator executed `hlt` at the given address.
    Halted(u64),
    /// The emulator hit an unrecoverable error; every later `step` or `run` reports it again.
    Faulted(EmuError),
}

/// Reason why `run` returned successfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The instruction pointer reached the requested stop address.
    StopAddress(u64),
    /// The program executed `hlt` at the given address.
    Halted(u64),
}

/// What the engine should do with an instruction after the pre-instruction hook ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookAction {
    /// Execute the instruction normally.
    Continue,
    /// Do not execute the instruction and continue with the one after it.
    Skip,
    /// Do not execute the instruction and continue wherever the hook left the instruction pointer.
    /// Leaving it unchanged executes the same instruction again on the next step.
    Redirect,
}

/// A callback invoked before every instruction.
/// It only sees the register file and memory map, never the emulator itself.
pub type PreInstructionHook = Box<dyn FnMut(&mut RegisterFile, &mut MemoryMap, &Instruction) -> HookAction + Send>;

/// One register change recorded while register tracing is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegTraceEntry {
    /// Position of the instruction that made the change.
    pub position: u64,
    /// The full-width register that changed.
    pub register: RegId,
    /// The new value of the register.
    pub value: u64,
}

macro_rules! impl_stack_primitive {
    ($([ $push:ident, $pop:ident => $t:ty ]),*$(,)?) => {$(
        pub fn $push(&mut self, val: $t) -> Result<(), EmuError> {
            self.push_mem(&val.to_le_bytes())
        }
        pub fn $pop(&mut self) -> Result<$t, EmuError> {
            let mut v = [0; mem::size_of::<$t>()];
            v.copy_from_slice(self.pop_mem(mem::size_of::<$t>() as u64)?);
            Ok(<$t>::from_le_bytes(v))
        }
    )*}
}

/// Holds options for initializing an emulator.
#[derive(Clone, Debug, Default)]
pub struct EmulatorArgs {
    /// Maximum number of instructions a single call to `run` may execute.
    /// If omitted, defaults to `DEFAULT_MAX_INSTRUCTIONS`.
    pub max_instructions: Option<u64>,
    /// Start in permissive (banzai) mode.
    pub banzai: bool,
    /// Start with register tracing enabled.
    pub trace_regs: bool,
    /// Verbosity level; 2 or above logs every executed instruction.
    pub verbose: u8,
}

/// An x86 emulator: one register file, one memory map, and the machinery that executes code in them.
pub struct Emulator {
    pub regs: RegisterFile,
    pub memory: MemoryMap,

    state: State,
    position: u64,
    breakpoint: Option<u64>,
    bp_resume: Option<u64>, // breakpoint address that the next step is allowed to execute

    max_instructions: u64,
    trace_regs: bool,
    verbose: u8,

    hook: Option<PreInstructionHook>,
    reg_trace: Vec<RegTraceEntry>,
}
impl Emulator {
    /// Creates a new emulator with default options.
    pub fn new(bitness: Bitness) -> Emulator {
        Emulator::with_args(bitness, &Default::default())
    }
    /// Creates a new emulator with the given options.
    pub fn with_args(bitness: Bitness, args: &EmulatorArgs) -> Emulator {
        let mut memory = MemoryMap::new(bitness);
        memory.set_banzai(args.banzai);
        Emulator {
            regs: RegisterFile::new(bitness),
            memory,

            state: State::Ready,
            position: 0,
            breakpoint: None,
            bp_resume: None,

            max_instructions: args.max_instructions.unwrap_or(DEFAULT_MAX_INSTRUCTIONS),
            trace_regs: args.trace_regs,
            verbose: args.verbose,

            hook: None,
            reg_trace: vec![],
        }
    }

    pub fn bitness(&self) -> Bitness {
        self.regs.bitness()
    }
    /// Gets the current state of the emulator.
    pub fn get_state(&self) -> &State {
        &self.state
    }

    // -------------------------------------------------------------------------------------

    /// Gets a register by name.
    pub fn get_reg(&self, name: &str) -> Result<u64, EmuError> {
        self.regs.get(name)
    }
    /// Sets a register by name, truncating the value to the register's width.
    pub fn set_reg(&mut self, name: &str, value: u64) -> Result<(), EmuError> {
        self.regs.set(name, value)
    }

    /// Allocates a region holding `code` and points the instruction pointer at it.
    /// Returns the base of the new region.
    pub fn load_code(&mut self, name: &str, code: &[u8], base: Option<u64>) -> Result<u64, EmuError> {
        let base = self.memory.allocate_with_protection(name, code.len() as u64, base, Protection::RX)?;
        if let Some(r) = self.memory.region_mut(name) { r.data.copy_from_slice(code); }
        self.regs.set_ip(base);
        Ok(base)
    }
    /// Allocates a read/write region named `stack` and points the stack pointer at its top.
    /// Returns the base of the new region.
    pub fn allocate_stack(&mut self, size: u64) -> Result<u64, EmuError> {
        let base = self.memory.allocate_with_protection("stack", size, None, Protection::RW)?;
        self.regs.set_sp(base + size);
        Ok(base)
    }

    // -------------------------------------------------------------------------------------

    /// Sets the active breakpoint, replacing any previous one.
    pub fn set_breakpoint(&mut self, addr: u64) {
        self.breakpoint = Some(addr);
        self.bp_resume = None;
    }
    /// Gets the active breakpoint.
    pub fn get_breakpoint(&self) -> Option<u64> {
        self.breakpoint
    }
    pub fn clear_breakpoint(&mut self) {
        self.breakpoint = None;
        self.bp_resume = None;
    }

    /// Gets the number of instructions executed since creation or the last reset.
    pub fn get_position(&self) -> u64 {
        self.position
    }
    /// Resets the instruction counter (and nothing else).
    pub fn reset_position(&mut self) {
        self.position = 0;
    }

    pub fn banzai(&self) -> bool {
        self.memory.banzai()
    }
    /// Enables or disables permissive (banzai) mode.
    pub fn set_banzai(&mut self, banzai: bool) {
        self.memory.set_banzai(banzai);
    }
    pub fn set_verbose(&mut self, verbose: u8) {
        self.verbose = verbose;
    }
    /// Sets the per-`run` instruction ceiling (`None` restores the default).
    pub fn set_max_instructions(&mut self, max: Option<u64>) {
        self.max_instructions = max.unwrap_or(DEFAULT_MAX_INSTRUCTIONS);
    }

    /// Installs a pre-instruction hook, replacing any previous one.
    pub fn set_hook<F>(&mut self, hook: F) where F: FnMut(&mut RegisterFile, &mut MemoryMap, &Instruction) -> HookAction + Send + 'static {
        self.hook = Some(Box::new(hook));
    }
    pub fn clear_hook(&mut self) {
        self.hook = None;
    }

    /// Enables or disables register tracing.
    pub fn set_trace_regs(&mut self, trace_regs: bool) {
        self.trace_regs = trace_regs;
    }
    /// Gets the register changes recorded so far.
    pub fn reg_trace(&self) -> &[RegTraceEntry] {
        &self.reg_trace
    }
    /// Takes the recorded register changes, leaving the trace empty.
    pub fn take_reg_trace(&mut self) -> Vec<RegTraceEntry> {
        mem::take(&mut self.reg_trace)
    }

    // -------------------------------------------------------------------------------------

    /// Executes one instruction.
    ///
    /// If the active breakpoint equals the instruction pointer, nothing is executed and `BreakpointHit` is returned;
    /// the next call then executes the instruction at the breakpoint.
    /// Unrecoverable errors move the emulator to the faulted state, leaving the instruction pointer at the faulting instruction.
    pub fn step(&mut self) -> Result<(), EmuError> {
        match &self.state {
            State::Faulted(e) => return Err(e.clone()),
            State::Halted(addr) => return Err(EmuError::Halted(*addr)),
            State::Ready | State::Stepping => (),
        }

        let ip = self.regs.ip();
        if self.breakpoint == Some(ip) && self.bp_resume != Some(ip) {
            self.bp_resume = Some(ip);
            return Err(EmuError::BreakpointHit(ip));
        }
        self.bp_resume = None;

        let before = if self.trace_regs { Some(*self.regs.cells()) } else { None };
        match self.step_inner(ip) {
            Ok(halted) => {
                if let Some(before) = before { self.record_changes(&before); }
                self.position += 1;
                self.state = if halted { State::Halted(ip) } else { State::Stepping };
                Ok(())
            }
            Err(e) => {
                self.regs.set_ip(ip);
                if e.is_fault() { self.state = State::Faulted(e.clone()); }
                Err(e)
            }
        }
    }
    /// Fetches, decodes, and executes the instruction at `ip`.
    /// Returns true if the instruction halted the emulator.
    fn step_inner(&mut self, ip: u64) -> Result<bool, EmuError> {
        let instr = decode(self.bitness(), self.memory.fetch(ip)?, ip)?;
        if self.verbose >= 2 {
            trace!(position = self.position, "{:#x}: {}", ip, instr);
        }

        if let Some(hook) = self.hook.as_mut() {
            match hook(&mut self.regs, &mut self.memory, &instr) {
                HookAction::Continue => (),
                HookAction::Skip => { self.regs.set_ip(instr.next_ip()); return Ok(false); }
                HookAction::Redirect => return Ok(false),
            }
        }

        self.regs.set_ip(instr.next_ip());
        match self.execute(&instr) {
            Ok(flow) => Ok(flow == instructions::Flow::Halt),
            Err(EmuError::UnsupportedInstruction { .. }) if self.banzai() => {
                warn!("skipping unimplemented instruction at {:#x}: {}", ip, instr);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
    fn record_changes(&mut self, before: &[u64; CELL_COUNT]) {
        let bitness = self.bitness();
        for (cell, (&old, &new)) in before.iter().zip(self.regs.cells().iter()).enumerate() {
            if cell == RIP || old == new { continue; }
            let register = RegId::full_width(cell, bitness);
            self.reg_trace.push(RegTraceEntry { position: self.position, register, value: self.regs.get_id(register) });
        }
    }

    /// Executes instructions until the instruction pointer equals `stop`, the program halts, or an error occurs.
    /// The stop address is checked before each instruction, so a `stop` equal to the current instruction pointer executes nothing.
    /// Fails with `ExecutionExhausted` if the instruction ceiling is reached first.
    pub fn run(&mut self, stop: u64) -> Result<StopReason, EmuError> {
        let stop = stop & self.bitness().address_mask();
        if self.verbose >= 1 { debug!("running from {:#x} until {:#x}", self.regs.ip(), stop); }
        let mut executed = 0;
        loop {
            if let State::Halted(addr) = self.state { return Ok(StopReason::Halted(addr)); }
            if self.regs.ip() == stop { return Ok(StopReason::StopAddress(stop)); }
            if executed >= self.max_instructions { return Err(EmuError::ExecutionExhausted(self.max_instructions)); }
            self.step()?;
            executed += 1;
        }
    }

    // -------------------------------------------------------------------------------------

    /// Pushes a binary value onto the stack.
    /// On failure, the internal state is unmodified.
    pub fn push_mem(&mut self, value: &[u8]) -> Result<(), EmuError> {
        let pos = self.regs.sp().wrapping_sub(value.len() as u64) & self.bitness().address_mask();
        self.memory.write_buffer(pos, value)?;
        self.regs.set_sp(pos);
        Ok(())
    }
    /// Pops a binary value from the stack.
    /// Returns a reference to the (logically) removed block of memory.
    /// On failure, the internal state is unmodified.
    pub fn pop_mem(&mut self, len: u64) -> Result<&[u8], EmuError> {
        let pos = self.regs.sp();
        let res = self.memory.slice(pos, len, AccessKind::Read)?;
        self.regs.set_sp(pos.wrapping_add(len));
        Ok(res)
    }

    impl_stack_primitive! {
        [ push_u16, pop_u16 => u16 ],
        [ push_u32, pop_u32 => u32 ],
        [ push_u64, pop_u64 => u64 ],
    }

    /// Pushes a native machine word (4 or 8 bytes) onto the stack.
    /// If the value is too large, it is truncated.
    pub fn push(&mut self, value: u64) -> Result<(), EmuError> {
        match self.bitness() {
            Bitness::Bits32 => self.push_u32(value as u32),
            Bitness::Bits64 => self.push_u64(value),
        }
    }
    /// Pops a native machine word (4 or 8 bytes) off the stack.
    pub fn pop(&mut self) -> Result<u64, EmuError> {
        Ok(match self.bitness() {
            Bitness::Bits32 => self.pop_u32()? as u64,
            Bitness::Bits64 => self.pop_u64()?,
        })
    }
}

/// Decodes the instruction at the start of `fetched`, which holds the bytes from `ip` to the end of its region.
fn decode(bitness: Bitness, fetched: &[u8], ip: u64) -> Result<Instruction, EmuError> {
    let mut decoder = Decoder::with_ip(bitness.bits(), fetched, ip, DecoderOptions::NONE);
    let instr = decoder.decode();
    if !instr.is_invalid() { return Ok(instr); }

    let unsupported = EmuError::UnsupportedInstruction { address: ip, bytes: fetched.to_vec() };
    if decoder.last_error() != DecoderError::NoMoreBytes { return Err(unsupported); }

    // iced also runs out of bytes on invalid opcodes at the end of a region; only a valid instruction that needs more bytes is a fetch fault
    let mut padded = [0; MAX_INSTRUCTION_LEN];
    let len = cmp::min(fetched.len(), MAX_INSTRUCTION_LEN);
    padded[..len].copy_from_slice(&fetched[..len]);
    let full = Decoder::with_ip(bitness.bits(), &padded, ip, DecoderOptions::NONE).decode();
    if !full.is_invalid() && full.len() > len {
        return Err(EmuError::MemoryFault { address: ip + len as u64, width: 1, op: AccessKind::Fetch });
    }
    Err(unsupported)
}

#[cfg(test)]
fn test_emu(bitness: Bitness, code: &str) -> Emulator {
    let mut e = Emulator::new(bitness);
    let code = crate::common::util::parse_hex_bytes(code).unwrap();
    e.load_code("code", &code, Some(0x40_0000)).unwrap();
    e.allocate_stack(0x1000).unwrap();
    e
}

#[test]
fn test_step_and_position() {
    let mut e = test_emu(Bitness::Bits32, "B8 78 56 34 12 90");
    assert_eq!(e.get_state(), &State::Ready);
    e.step().unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 0x12345678);
    assert_eq!(e.regs.ip(), 0x40_0005);
    assert_eq!(e.get_state(), &State::Stepping);
    e.step().unwrap();
    assert_eq!(e.get_position(), 2);
    e.reset_position();
    assert_eq!(e.get_position(), 0);
    assert_eq!(e.get_reg("eax").unwrap(), 0x12345678); // only the counter is reset
}
#[test]
fn test_fault_is_sticky() {
    let mut e = test_emu(Bitness::Bits32, "8B 03"); // mov eax, [ebx] with ebx = 0
    let err = EmuError::MemoryFault { address: 0, width: 4, op: AccessKind::Read };
    assert_eq!(e.step(), Err(err.clone()));
    assert_eq!(e.get_state(), &State::Faulted(err.clone()));
    assert_eq!(e.regs.ip(), 0x40_0000);
    assert_eq!(e.step(), Err(err.clone()));
    assert_eq!(e.run(0x40_0002), Err(err));
    assert_eq!(e.get_position(), 0);
}
#[test]
fn test_fetch_past_region_end() {
    let mut e = test_emu(Bitness::Bits32, "90 B8 78 56");
    e.step().unwrap();
    assert_eq!(e.step(), Err(EmuError::MemoryFault { address: 0x40_0004, width: 1, op: AccessKind::Fetch }));
}
#[test]
fn test_unsupported_bytes() {
    let mut e = test_emu(Bitness::Bits64, "06"); // push es is invalid in 64-bit mode
    match e.step() {
        Err(EmuError::UnsupportedInstruction { address, bytes }) => {
            assert_eq!(address, 0x40_0000);
            assert_eq!(bytes, vec![0x06]);
        }
        r => panic!("{:?}", r),
    }

    // the same opcode with more bytes after it is still unsupported, not a fetch fault
    let mut e = test_emu(Bitness::Bits64, "06 90");
    assert!(matches!(e.step(), Err(EmuError::UnsupportedInstruction { address: 0x40_0000, .. })));
}
#[test]
fn test_halt() {
    let mut e = test_emu(Bitness::Bits64, "90 F4 90");
    assert_eq!(e.run(0x40_0003), Ok(StopReason::Halted(0x40_0001)));
    assert_eq!(e.get_state(), &State::Halted(0x40_0001));
    assert_eq!(e.get_position(), 2);
    assert_eq!(e.step(), Err(EmuError::Halted(0x40_0001)));
}
#[test]
fn test_run_ceiling() {
    let mut e = test_emu(Bitness::Bits32, "EB FE"); // jmp $
    e.set_max_instructions(Some(100));
    assert_eq!(e.run(0x1234), Err(EmuError::ExecutionExhausted(100)));
    assert_eq!(e.get_position(), 100);
    assert_eq!(e.get_state(), &State::Stepping); // exhausting the budget is not a fault
}
#[test]
fn test_breakpoint_resume() {
    let mut e = test_emu(Bitness::Bits32, "40 40 40"); // inc eax x3
    e.set_breakpoint(0x40_0001);
    assert_eq!(e.get_breakpoint(), Some(0x40_0001));
    assert_eq!(e.run(0x40_0003), Err(EmuError::BreakpointHit(0x40_0001)));
    assert_eq!(e.get_reg("eax").unwrap(), 1);
    assert_eq!(e.run(0x40_0003), Ok(StopReason::StopAddress(0x40_0003)));
    assert_eq!(e.get_reg("eax").unwrap(), 3);
    assert_eq!(e.get_state(), &State::Stepping);
}
#[test]
fn test_hook_skip() {
    let mut e = test_emu(Bitness::Bits32, "B8 01 00 00 00 BB 02 00 00 00");
    e.set_hook(|regs, _, instr| {
        if instr.op0_register() == iced_x86::Register::EAX { regs.set("ecx", 7).unwrap(); HookAction::Skip } else { HookAction::Continue }
    });
    e.run(0x40_000a).unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 0);
    assert_eq!(e.get_reg("ecx").unwrap(), 7);
    assert_eq!(e.get_reg("ebx").unwrap(), 2);
    assert_eq!(e.get_position(), 2);
}
#[test]
fn test_hook_redirect() {
    let mut e = test_emu(Bitness::Bits32, "40 43 41"); // inc eax ; inc ebx ; inc ecx
    let mut retried = false;
    e.set_hook(move |regs, _, instr| {
        if instr.ip() == 0x40_0000 && !retried { retried = true; return HookAction::Redirect; } // same instruction again
        if instr.ip() == 0x40_0001 { regs.set_ip(0x40_0002); return HookAction::Redirect; }
        HookAction::Continue
    });
    e.step().unwrap();
    assert_eq!(e.regs.ip(), 0x40_0000);
    assert_eq!(e.get_reg("eax").unwrap(), 0);
    e.run(0x40_0003).unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 1);
    assert_eq!(e.get_reg("ebx").unwrap(), 0);
    assert_eq!(e.get_reg("ecx").unwrap(), 1);
    assert_eq!(e.get_position(), 4);
}
#[test]
fn test_reg_trace() {
    let mut e = test_emu(Bitness::Bits64, "48 B8 F0 DE BC 9A 78 56 34 12 50");
    e.set_trace_regs(true);
    e.run(0x40_000b).unwrap();
    let sp = e.regs.sp();
    assert_eq!(e.reg_trace(), &[
        RegTraceEntry { position: 0, register: RegId::Rax, value: 0x123456789abcdef0 },
        RegTraceEntry { position: 1, register: RegId::Rsp, value: sp },
    ]);
    assert_eq!(e.take_reg_trace().len(), 2);
    assert!(e.reg_trace().is_empty());
}
#[test]
fn test_banzai_skips_unimplemented() {
    let mut e = test_emu(Bitness::Bits32, "0F A2 40"); // cpuid; inc eax
    assert!(matches!(e.step(), Err(EmuError::UnsupportedInstruction { .. })));

    let mut e = test_emu(Bitness::Bits32, "0F A2 40");
    e.set_banzai(true);
    e.run(0x40_0003).unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 1);
    assert_eq!(e.get_position(), 2);
}
