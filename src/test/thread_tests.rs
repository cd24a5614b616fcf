use super::*;
use std::thread;

fn counting_loop(bitness: Bitness, iterations: u64) -> (u64, u64) {
    // mov ecx, iterations ; inc eax ; loop back to the inc
    let mut code = vec![0xb9];
    code.extend_from_slice(&(iterations as u32).to_le_bytes());
    match bitness {
        Bitness::Bits32 => code.extend_from_slice(&[0x40, 0xe2, 0xfd]),
        Bitness::Bits64 => code.extend_from_slice(&[0xff, 0xc0, 0xe2, 0xfc]), // 40 is a rex prefix here
    }
    let mut e = Emulator::new(bitness);
    let start = e.load_code("code", &code, None).unwrap();
    e.run(start + code.len() as u64).unwrap();
    (e.get_reg("eax").unwrap(), e.get_position())
}

#[test]
fn test_engines_on_threads() {
    let a = thread::spawn(|| counting_loop(Bitness::Bits32, 1000));
    let b = thread::spawn(|| counting_loop(Bitness::Bits64, 2000));
    assert_eq!(a.join().unwrap(), (1000, 1 + 2 * 1000));
    assert_eq!(b.join().unwrap(), (2000, 1 + 2 * 2000));
}

#[test]
fn test_engine_moves_between_threads() {
    let mut e = emu!(Bits64, "48 FF C0 48 FF C0");
    e.set_hook(|_, _, _| HookAction::Continue);
    e.step().unwrap();
    let e = thread::spawn(move || {
        e.step().unwrap();
        e
    }).join().unwrap();
    assert_eq!(e.get_reg("rax").unwrap(), 2);
    assert_eq!(e.get_position(), 2);
}
