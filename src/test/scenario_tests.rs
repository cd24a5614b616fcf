use super::*;

#[test]
fn test_add_twice() {
    let mut e = emu!(Bits32, "01 D8 01 D8"); // add eax, ebx ; add eax, ebx
    e.set_reg("eax", 1).unwrap();
    e.set_reg("ebx", 2).unwrap();
    let before = e.get_position();
    e.step().unwrap();
    e.step().unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 5);
    assert_eq!(e.get_position(), before + 2);
}

#[test]
fn test_region_dword() {
    let mut e = Emulator::new(Bitness::Bits64);
    let base = e.memory.allocate("m", 0x1000, None).unwrap();
    e.memory.write_u32(base + 8, 0xdeadbeef).unwrap();
    assert_eq!(e.memory.read_u32(base + 8).unwrap(), 0xdeadbeef);
    assert_eq!(e.memory.read(base + 8, 4).unwrap(), 0xdeadbeef);
    assert_eq!(e.memory.read_u32(base + 0x1000 - 3), Err(EmuError::MemoryFault { address: base + 0x1000 - 3, width: 4, op: AccessKind::Read }));

    // the same boundary holds in permissive mode
    e.set_banzai(true);
    assert!(e.memory.read_u32(base + 0x1000 - 3).is_err());
    e.memory.write_u32(base + 0x1000 - 4, 1).unwrap();
    assert!(e.memory.write_u32(base + 0x1000 - 3, 1).is_err());
}

#[test]
fn test_snapshot_into_fresh_engine() {
    let mut e = emu!(Bits32, "40 40 40");
    e.set_reg("eax", 0x12345678).unwrap();
    e.memory.write_u32(DATA_BASE + 0x10, 0xcafebabe).unwrap();
    e.set_breakpoint(CODE_BASE + 2);
    e.step().unwrap();
    let blob = e.serialize();

    let mut f = Emulator::new(Bitness::Bits32);
    f.deserialize(&blob).unwrap();
    assert_eq!(f.get_reg("eax").unwrap(), 0x12345679);
    assert_eq!(f.memory.read_u32(DATA_BASE + 0x10).unwrap(), 0xcafebabe);
    assert_eq!(f.get_position(), 1);
    assert_eq!(f.get_breakpoint(), Some(CODE_BASE + 2));
    assert_eq!(f.get_state(), &State::Stepping);
    assert_eq!(f.memory.region("code").unwrap().protection(), Protection::RX);

    // both engines continue identically
    for emu in [&mut e, &mut f].iter_mut() {
        emu.step().unwrap();
        assert_eq!(emu.step(), Err(EmuError::BreakpointHit(CODE_BASE + 2)));
        emu.step().unwrap();
    }
    assert_eq!(e.get_reg("eax").unwrap(), f.get_reg("eax").unwrap());
    assert_eq!(e.regs, f.regs);
    assert_eq!(e.serialize(), f.serialize());
}

#[test]
fn test_snapshot_after_breakpoint_hit() {
    let mut e = emu!(Bits32, "40 43 41"); // inc eax ; inc ebx ; inc ecx
    e.set_breakpoint(CODE_BASE + 1);
    assert_eq!(e.run(CODE_BASE + 3), Err(EmuError::BreakpointHit(CODE_BASE + 1)));
    let mut f = Emulator::new(Bitness::Bits32);
    f.deserialize(&e.serialize()).unwrap();

    // the restored engine is past the hit too, so both execute the instruction at the breakpoint
    for emu in [&mut e, &mut f].iter_mut() {
        emu.step().unwrap();
        assert_eq!(emu.get_reg("ebx").unwrap(), 1);
        assert_eq!(run_to_end(emu), Ok(StopReason::StopAddress(CODE_BASE + 3)));
    }
    assert_eq!(e.serialize(), f.serialize());
}

#[test]
fn test_snapshot_after_halt() {
    let mut e = emu!(Bits32, "F4 40"); // hlt ; inc eax
    assert_eq!(run_to_end(&mut e), Ok(StopReason::Halted(CODE_BASE)));
    let mut f = Emulator::new(Bitness::Bits32);
    f.deserialize(&e.serialize()).unwrap();
    assert_eq!(f.get_state(), &State::Halted(CODE_BASE));

    for emu in [&mut e, &mut f].iter_mut() {
        assert_eq!(emu.step(), Err(EmuError::Halted(CODE_BASE)));
        assert_eq!(run_to_end(emu), Ok(StopReason::Halted(CODE_BASE)));
        assert_eq!(emu.get_reg("eax").unwrap(), 0);
        assert_eq!(emu.get_position(), 1);
    }
}

#[test]
fn test_snapshot_replaces_memory() {
    let e = emu!(Bits64, "90");
    let blob = e.serialize();

    let mut f = Emulator::new(Bitness::Bits64);
    f.memory.allocate("junk", 0x2000, Some(0x1_0000)).unwrap();
    f.deserialize(&blob).unwrap();
    assert!(f.memory.region("junk").is_none());
    assert_eq!(f.memory.regions().count(), 3);
    assert_eq!(f.memory.total_allocated_size(), e.memory.total_allocated_size());
}

#[test]
fn test_breakpoint_in_buffer() {
    let mut e = emu!(Bits32, "40 43 41"); // inc eax ; inc ebx ; inc ecx
    let x = CODE_BASE + 1;
    e.set_breakpoint(x);
    assert_eq!(e.run(CODE_BASE + 3), Err(EmuError::BreakpointHit(x)));
    assert_eq!(e.regs.ip(), x);
    assert_eq!(e.get_reg("ebx").unwrap(), 0);
    assert_eq!(e.get_position(), 1);

    // stepping after the hit executes the instruction at the breakpoint
    e.step().unwrap();
    assert_eq!(e.get_reg("ebx").unwrap(), 1);
    assert_eq!(run_to_end(&mut e), Ok(StopReason::StopAddress(CODE_BASE + 3)));
    assert_eq!(e.get_reg("ecx").unwrap(), 1);
}

#[test]
fn test_stack_helpers() {
    let mut e = emu!(Bits32, "90");
    let top = e.regs.sp();
    e.push(0x1_2345_6789).unwrap(); // truncated to a dword
    assert_eq!(e.regs.sp(), top - 4);
    e.push_u16(0xbeef).unwrap();
    assert_eq!(e.pop_u16().unwrap(), 0xbeef);
    assert_eq!(e.pop().unwrap(), 0x2345_6789);
    assert_eq!(e.regs.sp(), top);

    // popping past the top of the stack faults without moving the stack pointer
    assert!(matches!(e.pop(), Err(EmuError::MemoryFault { .. })));
    assert_eq!(e.regs.sp(), top);

    let mut e = emu!(Bits64, "90");
    e.push(0xfedc_ba98_7654_3210).unwrap();
    assert_eq!(e.regs.sp(), top - 8);
    assert_eq!(e.pop_u64().unwrap(), 0xfedc_ba98_7654_3210);
    e.push_mem(b"abc").unwrap();
    assert_eq!(e.pop_mem(3).unwrap(), b"abc");
}

#[test]
fn test_hex_pattern_round_trip() {
    let mut e = emu!(Bits64, "90");
    e.memory.write_hex(DATA_BASE + 0x20, "DE AD BE EF").unwrap();
    e.memory.write_hex(DATA_BASE + 0x80, "de ad be ef").unwrap();
    let pattern = Pattern::hex("DE AD BE EF").unwrap();
    assert_eq!(e.memory.search(&pattern, None), vec![DATA_BASE + 0x20, DATA_BASE + 0x80]);
    assert_eq!(e.memory.search(&pattern, Some("code")), vec![]);
    assert_eq!(e.memory.search(&pattern, Some("nope")), vec![]);
    assert_eq!(e.memory.search_first_from(&pattern, DATA_BASE + 0x21), Some(DATA_BASE + 0x80));
    assert!(matches!(Pattern::hex("DE AD XY"), Err(EmuError::InvalidPattern(_))));
}

#[test]
fn test_strings_through_engine() {
    let mut e = emu!(Bits32, "90");
    e.memory.write_string(DATA_BASE, "hello").unwrap();
    e.memory.write_wide_string(DATA_BASE + 0x100, "wide").unwrap();
    assert_eq!(e.memory.read_string(DATA_BASE).unwrap(), "hello");
    assert_eq!(e.memory.read_wide_string(DATA_BASE + 0x100).unwrap(), "wide");
    assert_eq!(e.memory.read_buffer(DATA_BASE + 0x100, 4).unwrap(), vec![b'w', 0, b'i', 0]);

    e.memory.memset(DATA_BASE + 0x200, 0x41, 0x10).unwrap();
    e.memory.memcpy(DATA_BASE + 0x300, DATA_BASE + 0x200, 0x10).unwrap();
    assert_eq!(e.memory.read_bytes_until_nul(DATA_BASE + 0x300).unwrap(), vec![0x41; 0x10]);
}

#[test]
fn test_unknown_registers() {
    let mut e = Emulator::new(Bitness::Bits32);
    assert_eq!(e.get_reg("rax"), Err(EmuError::UnknownRegister("rax".into())));
    assert_eq!(e.set_reg("r8d", 1), Err(EmuError::UnknownRegister("r8d".into())));
    assert_eq!(e.get_reg("bogus"), Err(EmuError::UnknownRegister("bogus".into())));

    let e = Emulator::new(Bitness::Bits64);
    assert_eq!(e.get_reg("r8b").unwrap(), 0);
    assert_eq!(e.get_reg("eflags").unwrap(), 2);
}

#[test]
fn test_args() {
    let args = EmulatorArgs { max_instructions: Some(3), banzai: true, trace_regs: true, verbose: 0 };
    let mut e = Emulator::with_args(Bitness::Bits32, &args);
    assert!(e.banzai());
    e.load_code("code", &parse_hex_bytes("40 40 40 40 40").unwrap(), Some(CODE_BASE)).unwrap();
    assert_eq!(run_to_end(&mut e), Err(EmuError::ExecutionExhausted(3)));
    assert_eq!(e.reg_trace().len(), 4); // eax three times, eflags once when 3 sets PF
    assert_eq!(e.get_reg("eax").unwrap(), 3);
}
