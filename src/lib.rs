#![forbid(unsafe_code)]

//! x86emu is a deterministic, in-process emulator for short sequences of 32-bit and 64-bit x86 user-mode code.
//! It is intended for analysis tooling that needs to run snippets of machine code against a synthetic register file and memory map,
//! inspect the results, and optionally snapshot and restore the whole machine.
//! Nothing here touches the host: there are no system calls, no devices, and no privileged instructions.
//!
//! # Example of Usage
//!
//! ```
//! # use x86emu::*;
//! # use x86emu::common::Bitness;
//! // mov eax, 0x12345678 ; add eax, ebx
//! let code = [0xb8, 0x78, 0x56, 0x34, 0x12, 0x01, 0xd8];
//!
//! let mut emu = exec::Emulator::new(Bitness::Bits32);
//! let start = emu.load_code("code", &code, None).unwrap();
//! emu.allocate_stack(0x1000).unwrap();
//! emu.set_reg("ebx", 1).unwrap();
//!
//! // execute until we reach the end of the code
//! let reason = emu.run(start + code.len() as u64).unwrap();
//! assert_eq!(reason, exec::StopReason::StopAddress(start + 7));
//! assert_eq!(emu.get_reg("eax").unwrap(), 0x12345679);
//! assert_eq!(emu.get_reg("ax").unwrap(), 0x5679);
//! assert_eq!(emu.get_position(), 2);
//! ```

#[macro_use] extern crate num_derive;
#[macro_use] extern crate lazy_static;

macro_rules! mask {
    ($src:ident : $($mask:ident)|+) => {
        $($src::$mask)|+
    };
    () => { 0 };
}

pub mod exec;
pub mod common;

#[cfg(test)]
mod test;
