use super::*;

#[test]
fn test_imm_load() {
    let mut e = emu!(Bits64, "48 B8 F0 DE BC 9A 78 56 34 12 B8 01 00 00 00 B4 12 66 BB FF FF");
    e.set_reg("rbx", 0x1111_2222_3333_4444).unwrap();
    e.step().unwrap(); // mov rax, 0x123456789abcdef0
    assert_eq!(e.get_reg("rax").unwrap(), 0x1234_5678_9abc_def0);
    e.step().unwrap(); // mov eax, 1 zeros the upper half
    assert_eq!(e.get_reg("rax").unwrap(), 1);
    e.step().unwrap(); // mov ah, 0x12
    assert_eq!(e.get_reg("rax").unwrap(), 0x1201);
    e.step().unwrap(); // mov bx, 0xffff leaves the rest of rbx alone
    assert_eq!(e.get_reg("rbx").unwrap(), 0x1111_2222_3333_ffff);
    assert_eq!(run_to_end(&mut e), Ok(StopReason::StopAddress(CODE_BASE + 21)));
}

#[test]
fn test_memory_operands() {
    let mut e = emu!(Bits32, "89 03 8B 4B 00 64 8B 13 88 43 08");
    e.set_reg("eax", 0xdeadbeef).unwrap();
    e.set_reg("ebx", DATA_BASE).unwrap();
    e.step().unwrap(); // mov [ebx], eax
    assert_eq!(e.memory.read_u32(DATA_BASE).unwrap(), 0xdeadbeef);
    e.step().unwrap(); // mov ecx, [ebx+0]
    assert_eq!(e.get_reg("ecx").unwrap(), 0xdeadbeef);

    e.set_reg("fs", 0x1000).unwrap();
    e.set_reg("ebx", DATA_BASE - 0x1000).unwrap();
    e.step().unwrap(); // mov edx, fs:[ebx]
    assert_eq!(e.get_reg("edx").unwrap(), 0xdeadbeef);
    e.set_reg("ebx", DATA_BASE).unwrap();
    e.step().unwrap(); // mov [ebx+8], al
    assert_eq!(e.memory.read_u8(DATA_BASE + 8).unwrap(), 0xef);
}

#[test]
fn test_rip_relative_and_lea() {
    // mov eax, [rip+0] reads the dword right after the instruction
    let mut e = emu!(Bits64, "8B 05 00 00 00 00 78 56 34 12");
    e.step().unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 0x12345678);

    let mut e = emu!(Bits64, "48 8D 44 8B 10"); // lea rax, [rbx+rcx*4+0x10]
    e.set_reg("rbx", 0x1000).unwrap();
    e.set_reg("rcx", 3).unwrap();
    e.step().unwrap();
    assert_eq!(e.get_reg("rax").unwrap(), 0x101c);
}

#[test]
fn test_protection_in_execution() {
    let mut e = emu!(Bits32, "89 03"); // mov [ebx], eax
    e.set_reg("ebx", CODE_BASE).unwrap();
    assert_eq!(e.step(), Err(EmuError::MemoryFault { address: CODE_BASE, width: 4, op: AccessKind::Write }));
    assert_eq!(e.get_state(), &State::Faulted(EmuError::MemoryFault { address: CODE_BASE, width: 4, op: AccessKind::Write }));

    let mut e = emu!(Bits32, "89 03 90 90");
    e.set_banzai(true);
    e.set_reg("eax", 0x40404040).unwrap();
    e.set_reg("ebx", CODE_BASE).unwrap();
    e.step().unwrap(); // self-modifying code is allowed in permissive mode
    assert_eq!(e.memory.read_u32(CODE_BASE).unwrap(), 0x40404040);
    e.step().unwrap(); // inc eax
    e.step().unwrap(); // inc eax
    assert_eq!(e.get_reg("eax").unwrap(), 0x40404042);

    // but never past the end of a region
    let mut e = emu!(Bits32, "89 03");
    e.set_banzai(true);
    e.set_reg("ebx", CODE_BASE + 1).unwrap();
    assert_eq!(e.step(), Err(EmuError::MemoryFault { address: CODE_BASE + 1, width: 4, op: AccessKind::Write }));
}

#[test]
fn test_arithmetic_flags() {
    let mut e = emu!(Bits32, "31 C0 0F 94 C1 F9 11 D8 29 D8 39 D8 0F 9C C2");
    e.set_reg("eax", 0x55).unwrap();
    e.set_reg("ebx", 2).unwrap();
    e.step().unwrap(); // xor eax, eax
    assert_eq!(e.get_reg("eax").unwrap(), 0);
    assert_eq!((e.get_reg("zf").unwrap(), e.get_reg("pf").unwrap(), e.get_reg("cf").unwrap()), (1, 1, 0));
    e.step().unwrap(); // sete cl
    assert_eq!(e.get_reg("cl").unwrap(), 1);
    e.step().unwrap(); // stc
    e.step().unwrap(); // adc eax, ebx
    assert_eq!(e.get_reg("eax").unwrap(), 3);
    e.step().unwrap(); // sub eax, ebx
    assert_eq!(e.get_reg("eax").unwrap(), 1);
    e.step().unwrap(); // cmp eax, ebx
    assert_eq!(e.get_reg("eax").unwrap(), 1);
    assert_eq!((e.get_reg("cf").unwrap(), e.get_reg("sf").unwrap()), (1, 1));
    e.step().unwrap(); // setl dl
    assert_eq!(e.get_reg("dl").unwrap(), 1);
}

#[test]
fn test_inc_dec_neg_not() {
    let mut e = emu!(Bits32, "F9 40 4B F7 D9 F7 D2");
    e.set_reg("eax", 0x7fffffff).unwrap();
    e.set_reg("ebx", 1).unwrap();
    e.set_reg("ecx", 5).unwrap();
    e.step().unwrap(); // stc
    e.step().unwrap(); // inc eax
    assert_eq!(e.get_reg("eax").unwrap(), 0x80000000);
    assert_eq!((e.get_reg("of").unwrap(), e.get_reg("cf").unwrap()), (1, 1)); // carry is preserved
    e.step().unwrap(); // dec ebx
    assert_eq!((e.get_reg("ebx").unwrap(), e.get_reg("zf").unwrap()), (0, 1));
    e.step().unwrap(); // neg ecx
    assert_eq!(e.get_reg("ecx").unwrap(), (-5i32) as u32 as u64);
    assert_eq!(e.get_reg("cf").unwrap(), 1);
    e.step().unwrap(); // not edx
    assert_eq!(e.get_reg("edx").unwrap(), 0xffffffff);
}

#[test]
fn test_mul_div() {
    let mut e = emu!(Bits32, "F7 E3 6B C3 FD 99 F7 FB F7 F3");
    e.set_reg("eax", 0x80000000).unwrap();
    e.set_reg("ebx", 4).unwrap();
    e.step().unwrap(); // mul ebx
    assert_eq!((e.get_reg("edx").unwrap(), e.get_reg("eax").unwrap()), (2, 0));
    assert_eq!((e.get_reg("cf").unwrap(), e.get_reg("of").unwrap()), (1, 1));

    e.set_reg("ebx", 7).unwrap();
    e.step().unwrap(); // imul eax, ebx, -3
    assert_eq!(e.get_reg("eax").unwrap(), (-21i32) as u32 as u64);

    e.set_reg("ebx", 2).unwrap();
    e.step().unwrap(); // cdq
    assert_eq!(e.get_reg("edx").unwrap(), 0xffffffff);
    e.step().unwrap(); // idiv ebx
    assert_eq!(e.get_reg("eax").unwrap(), (-10i32) as u32 as u64);
    assert_eq!(e.get_reg("edx").unwrap(), (-1i32) as u32 as u64);

    e.set_reg("edx", 0).unwrap();
    e.set_reg("eax", 100).unwrap();
    e.set_reg("ebx", 0).unwrap();
    let ip = e.regs.ip();
    assert_eq!(e.step(), Err(EmuError::DivideError(ip))); // div ebx
    assert_eq!(e.get_state(), &State::Faulted(EmuError::DivideError(ip)));
    assert_eq!(e.get_reg("eax").unwrap(), 100);
}

#[test]
fn test_div_quotient_overflow() {
    let mut e = emu!(Bits64, "48 F7 F3 F6 F3"); // div rbx ; div bl
    e.set_reg("rdx", 0).unwrap();
    e.set_reg("rax", 100).unwrap();
    e.set_reg("rbx", 7).unwrap();
    e.step().unwrap();
    assert_eq!((e.get_reg("rax").unwrap(), e.get_reg("rdx").unwrap()), (14, 2));

    e.set_reg("ax", 0x1000).unwrap();
    e.set_reg("bl", 2).unwrap();
    assert_eq!(e.step(), Err(EmuError::DivideError(CODE_BASE + 3)));
}

#[test]
fn test_shifts_and_rotates() {
    let mut e = emu!(Bits32, "C1 E0 04 C1 FB 02 D1 E9 C1 C2 08 0F A3 C6");
    e.set_reg("eax", 0x10000001).unwrap();
    e.set_reg("ebx", 0xfffffff0).unwrap();
    e.set_reg("ecx", 3).unwrap();
    e.set_reg("edx", 0x12345678).unwrap();
    e.set_reg("esi", 0b100).unwrap();
    e.step().unwrap(); // shl eax, 4
    assert_eq!(e.get_reg("eax").unwrap(), 0x10);
    assert_eq!(e.get_reg("cf").unwrap(), 1);
    e.step().unwrap(); // sar ebx, 2
    assert_eq!(e.get_reg("ebx").unwrap(), 0xfffffffc);
    e.step().unwrap(); // shr ecx, 1
    assert_eq!((e.get_reg("ecx").unwrap(), e.get_reg("cf").unwrap()), (1, 1));
    e.set_reg("zf", 1).unwrap();
    e.step().unwrap(); // rol edx, 8
    assert_eq!(e.get_reg("edx").unwrap(), 0x34567812);
    assert_eq!(e.get_reg("zf").unwrap(), 1); // rotates leave ZF alone
    e.set_reg("eax", 2).unwrap();
    e.step().unwrap(); // bt esi, eax
    assert_eq!(e.get_reg("cf").unwrap(), 1);
}

#[test]
fn test_rotate_by_operand_width() {
    let mut e = emu!(Bits32, "C0 C0 08 C0 C8 08 C0 C0 09");
    e.set_reg("al", 1).unwrap();
    e.step().unwrap(); // rol al, 8
    assert_eq!((e.get_reg("al").unwrap(), e.get_reg("cf").unwrap()), (1, 1));

    e.set_reg("al", 0x80).unwrap();
    e.set_reg("cf", 0).unwrap();
    e.step().unwrap(); // ror al, 8
    assert_eq!((e.get_reg("al").unwrap(), e.get_reg("cf").unwrap()), (0x80, 1));

    e.set_reg("cf", 0).unwrap();
    e.step().unwrap(); // rol al, 9 rotates by one
    assert_eq!((e.get_reg("al").unwrap(), e.get_reg("cf").unwrap()), (1, 1));
}

#[test]
fn test_movzx_movsx_bswap_xchg() {
    let mut e = emu!(Bits32, "0F B6 C3 0F BE CB 0F CA 87 F7");
    e.set_reg("ebx", 0x80).unwrap();
    e.set_reg("edx", 0x12345678).unwrap();
    e.set_reg("esi", 1).unwrap();
    e.set_reg("edi", 2).unwrap();
    e.step().unwrap();
    assert_eq!(e.get_reg("eax").unwrap(), 0x80);
    e.step().unwrap();
    assert_eq!(e.get_reg("ecx").unwrap(), 0xffffff80);
    e.step().unwrap();
    assert_eq!(e.get_reg("edx").unwrap(), 0x78563412);
    e.step().unwrap();
    assert_eq!((e.get_reg("esi").unwrap(), e.get_reg("edi").unwrap()), (2, 1));
}

#[test]
fn test_cmov() {
    let mut e = emu!(Bits32, "39 D8 0F 4C C3");
    e.set_reg("eax", 1).unwrap();
    e.set_reg("ebx", 5).unwrap();
    run_to_end(&mut e).unwrap(); // cmp eax, ebx ; cmovl eax, ebx
    assert_eq!(e.get_reg("eax").unwrap(), 5);

    // a 32-bit cmov zero extends even when the condition is false
    let mut e = emu!(Bits64, "39 D8 0F 4C C3");
    e.set_reg("rax", 0xffff_ffff_0000_0009).unwrap();
    e.set_reg("rbx", 5).unwrap();
    run_to_end(&mut e).unwrap();
    assert_eq!(e.get_reg("rax").unwrap(), 9);
}

#[test]
fn test_jumps_and_loops() {
    let mut e = emu!(Bits32, "39 D8 74 02 40 40 43"); // cmp ; je +2 ; inc eax x2 ; inc ebx
    e.set_reg("eax", 1).unwrap();
    e.set_reg("ebx", 1).unwrap();
    run_to_end(&mut e).unwrap();
    assert_eq!((e.get_reg("eax").unwrap(), e.get_reg("ebx").unwrap()), (1, 2));
    assert_eq!(e.get_position(), 3);

    let mut e = emu!(Bits32, "B9 03 00 00 00 40 E2 FD"); // mov ecx, 3 ; inc eax ; loop
    run_to_end(&mut e).unwrap();
    assert_eq!((e.get_reg("eax").unwrap(), e.get_reg("ecx").unwrap()), (3, 0));
    assert_eq!(e.get_position(), 7);
}

#[test]
fn test_call_ret() {
    // call +1 ; hlt ; mov rax, 42 ; ret
    let mut e = emu!(Bits64, "E8 01 00 00 00 F4 48 C7 C0 2A 00 00 00 C3");
    let top = e.regs.sp();
    assert_eq!(e.run(0), Ok(StopReason::Halted(CODE_BASE + 5)));
    assert_eq!(e.get_reg("rax").unwrap(), 42);
    assert_eq!(e.regs.sp(), top);
    assert_eq!(e.get_position(), 4);
    assert_eq!(e.memory.read_u64(top - 8).unwrap(), CODE_BASE + 5); // return address is left below the stack pointer
}

#[test]
fn test_push_pop_instructions() {
    let mut e = emu!(Bits32, "68 EF BE AD DE 5B 9C 58 60 61 55 89 E5 C9");
    let top = e.regs.sp();
    e.step().unwrap(); // push 0xdeadbeef
    assert_eq!(e.regs.sp(), top - 4);
    e.step().unwrap(); // pop ebx
    assert_eq!(e.get_reg("ebx").unwrap(), 0xdeadbeef);
    e.step().unwrap(); // pushfd
    e.step().unwrap(); // pop eax
    assert_eq!(e.get_reg("eax").unwrap(), 2);

    e.set_reg("ecx", 0x1234).unwrap();
    e.step().unwrap(); // pushad
    assert_eq!(e.regs.sp(), top - 32);
    e.set_reg("ecx", 0).unwrap();
    e.step().unwrap(); // popad
    assert_eq!(e.get_reg("ecx").unwrap(), 0x1234);
    assert_eq!(e.regs.sp(), top);

    e.set_reg("ebp", 0x5555).unwrap();
    e.step().unwrap(); // push ebp
    e.step().unwrap(); // mov ebp, esp
    e.step().unwrap(); // leave
    assert_eq!(e.get_reg("ebp").unwrap(), 0x5555);
    assert_eq!(e.regs.sp(), top);
}

#[test]
fn test_string_instructions() {
    let mut e = emu!(Bits32, "F3 A4 F2 AE FD AB FC");
    e.memory.write_buffer(DATA_BASE, b"hello\0").unwrap();
    e.set_reg("esi", DATA_BASE).unwrap();
    e.set_reg("edi", DATA_BASE + 0x80).unwrap();
    e.set_reg("ecx", 5).unwrap();
    e.step().unwrap(); // rep movsb runs to completion in one step
    assert_eq!(e.memory.read_buffer(DATA_BASE + 0x80, 5).unwrap(), b"hello");
    assert_eq!(e.get_reg("ecx").unwrap(), 0);
    assert_eq!(e.get_reg("esi").unwrap(), DATA_BASE + 5);
    assert_eq!(e.get_reg("edi").unwrap(), DATA_BASE + 0x85);
    assert_eq!(e.get_position(), 1);

    e.set_reg("edi", DATA_BASE).unwrap();
    e.set_reg("ecx", 0xffffffff).unwrap();
    e.set_reg("al", 0).unwrap();
    e.step().unwrap(); // repne scasb finds the terminator
    assert_eq!(e.get_reg("edi").unwrap(), DATA_BASE + 6);
    assert_eq!(e.get_reg("ecx").unwrap(), 0xffffffff - 6);
    assert_eq!(e.get_reg("zf").unwrap(), 1);

    e.set_reg("edi", DATA_BASE + 0x100).unwrap();
    e.set_reg("eax", 0x11223344).unwrap();
    e.step().unwrap(); // std
    e.step().unwrap(); // stosd walks backwards
    assert_eq!(e.memory.read_u32(DATA_BASE + 0x100).unwrap(), 0x11223344);
    assert_eq!(e.get_reg("edi").unwrap(), DATA_BASE + 0xfc);
    e.step().unwrap(); // cld
    assert_eq!(e.get_reg("df").unwrap(), 0);
}

#[test]
fn test_xadd_cmpxchg() {
    let mut e = emu!(Bits32, "0F C1 D8 0F B1 CB 0F B1 CB");
    e.set_reg("eax", 5).unwrap();
    e.set_reg("ebx", 3).unwrap();
    e.step().unwrap(); // xadd eax, ebx
    assert_eq!((e.get_reg("eax").unwrap(), e.get_reg("ebx").unwrap()), (8, 5));

    e.set_reg("eax", 5).unwrap();
    e.set_reg("ecx", 9).unwrap();
    e.step().unwrap(); // cmpxchg ebx, ecx succeeds
    assert_eq!((e.get_reg("ebx").unwrap(), e.get_reg("zf").unwrap()), (9, 1));
    e.step().unwrap(); // fails and loads the accumulator
    assert_eq!((e.get_reg("eax").unwrap(), e.get_reg("zf").unwrap()), (9, 0));
}

#[test]
fn test_xadd_same_register_and_memory() {
    let mut e = emu!(Bits32, "0F C1 C0 0F C1 03");
    e.set_reg("eax", 5).unwrap();
    e.step().unwrap(); // xadd eax, eax
    assert_eq!(e.get_reg("eax").unwrap(), 10);

    e.set_reg("ebx", DATA_BASE).unwrap();
    e.memory.write_u32(DATA_BASE, 7).unwrap();
    e.step().unwrap(); // xadd [ebx], eax
    assert_eq!(e.memory.read_u32(DATA_BASE).unwrap(), 17);
    assert_eq!(e.get_reg("eax").unwrap(), 7);
}
