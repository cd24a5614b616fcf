use super::*;
use proptest::prelude::*;
use proptest::sample::select;

fn general_purpose_aliases() -> Vec<RegId> {
    RegId::all().filter(|id| id.spec().cell < RIP).collect()
}

fn width_mask(bytes: u64) -> u64 {
    if bytes >= 8 { u64::MAX } else { (1 << (8 * bytes)) - 1 }
}

prop_compose! {
    fn arb_allocation()(
        size in 1u64..0x3000,
        base in prop::option::of(0u64..0x40),
    ) -> (u64, Option<u64>) {
        (size, base.map(|page| page * 0x800))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn write_then_read_is_truncated_value(offset in 0u64..0x1000, width in select(vec![1u64, 2, 4, 8]), value in any::<u64>()) {
        let mut e = Emulator::new(Bitness::Bits64);
        let base = e.memory.allocate("m", 0x1000, None).unwrap();
        let addr = base + offset;
        let res = e.memory.write(addr, width, value);
        if offset + width <= 0x1000 {
            prop_assert!(res.is_ok());
            prop_assert_eq!(e.memory.read(addr, width).unwrap(), value & width_mask(width));
        } else {
            prop_assert_eq!(res, Err(EmuError::MemoryFault { address: addr, width, op: AccessKind::Write }));
            prop_assert!(e.memory.read_buffer(base, 0x1000).unwrap().iter().all(|&b| b == 0)); // failed writes leave memory alone
        }
    }

    #[test]
    fn narrow_alias_only_changes_its_bits(id in select(general_purpose_aliases()), full in any::<u64>(), value in any::<u64>()) {
        let mut regs = RegisterFile::new(Bitness::Bits64);
        let s = id.spec();
        regs.set_id(RegId::full_width(s.cell, Bitness::Bits64), full);
        regs.set_id(id, value);

        let span = if s.bits >= 64 { u64::MAX } else { ((1u64 << s.bits) - 1) << s.offset };
        let cell = regs.cell(s.cell);
        prop_assert_eq!(cell & !span, full & !span);
        prop_assert_eq!(regs.get_id(id), value & (span >> s.offset));
    }

    #[test]
    fn push_pop_is_identity(value in any::<u64>(), sixty_four in any::<bool>()) {
        let bitness = if sixty_four { Bitness::Bits64 } else { Bitness::Bits32 };
        let mut e = Emulator::new(bitness);
        e.allocate_stack(0x100).unwrap();
        e.push(0x55).unwrap();
        let sp = e.regs.sp();

        e.push(value).unwrap();
        let expected = value & bitness.address_mask();
        prop_assert_eq!(e.pop().unwrap(), expected);
        prop_assert_eq!(e.regs.sp(), sp);
        prop_assert_eq!(e.memory.read(sp, bitness.word_size()).unwrap(), 0x55);
    }

    #[test]
    fn allocations_never_overlap(requests in prop::collection::vec(arb_allocation(), 1..12)) {
        let mut map = MemoryMap::new(Bitness::Bits32);
        for (i, &(size, base)) in requests.iter().enumerate() {
            let _ = map.allocate(&format!("r{}", i), size, base);
        }
        let regions: Vec<_> = map.regions().map(|r| (r.base(), r.end())).collect();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
        prop_assert_eq!(map.total_allocated_size(), regions.iter().map(|(b, e)| e - b).sum::<u64>());
        let duplicate = matches!(map.allocate("r0", 1, None), Err(EmuError::AllocationConflict { .. }));
        prop_assert!(duplicate); // the first request always lands in an empty map
    }
}
