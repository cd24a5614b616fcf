use crate::common::*;
use crate::common::util::parse_hex_bytes;
use crate::exec::*;
use crate::exec::registers::*;
use crate::exec::memory::MemoryMap;
use crate::exec::search::Pattern;

const CODE_BASE: u64 = 0x40_0000;
const DATA_BASE: u64 = 0x60_0000;

/// Creates an emulator with the hex-encoded code loaded at `CODE_BASE`, a stack, and a 0x1000-byte read/write `data` region at `DATA_BASE`.
macro_rules! emu {
    ($bitness:ident, $code:expr) => {{
        let mut e = Emulator::new(Bitness::$bitness);
        let code = parse_hex_bytes($code).unwrap();
        e.load_code("code", &code, Some(CODE_BASE)).unwrap();
        e.allocate_stack(0x1000).unwrap();
        e.memory.allocate_with_protection("data", 0x1000, Some(DATA_BASE), Protection::RW).unwrap();
        e
    }};
}

/// Runs until the instruction pointer falls off the end of the code region.
fn run_to_end(e: &mut Emulator) -> Result<StopReason, EmuError> {
    let end = e.memory.region("code").unwrap().end();
    e.run(end)
}

mod scenario_tests;
mod exe_tests;
mod property_tests;
mod thread_tests;
