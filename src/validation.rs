/// End-to-end validation of the selection pipeline.
///
/// These tests verify:
/// 1. **Count and set** - the device count and selected prefix match a sequential scan
/// 2. **Sentinel tail** - every slot past the count holds -1
/// 3. **Boundaries** - limits above the maximum and at the minimum
/// 4. **Schedule independence** - arrival orders only change the prefix order
/// 5. **Driver flow** - generate, pad, select, verify
#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::cpu::{ArrivalOrder, Schedule};
    use crate::input::{pad_to_block, InputGenerator, DEFAULT_LIMIT};
    use crate::launch::SENTINEL;
    use crate::select::{select, SelectOptions};
    use crate::verify::{reference_indices, verify};

    fn options(block_size: usize, schedule: Schedule) -> SelectOptions {
        SelectOptions {
            block_size,
            schedule,
            ..Default::default()
        }
    }

    fn schedule_strategy() -> impl Strategy<Value = Schedule> {
        prop_oneof![
            Just(Schedule::Lockstep(ArrivalOrder::Ascending)),
            Just(Schedule::Lockstep(ArrivalOrder::Descending)),
            any::<u64>().prop_map(|seed| Schedule::Lockstep(ArrivalOrder::Shuffled { seed })),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_reference(
            block_exp in 0u32..7,
            blocks in 1usize..6,
            seed in any::<u64>(),
            limit in -0.1f32..1.1,
            schedule in schedule_strategy(),
        ) {
            let block_size = 1usize << block_exp;
            let input = InputGenerator::new(seed).uniform_f32(block_size * blocks);
            let sel = select(&input, limit, &options(block_size, schedule)).unwrap();

            let expected = reference_indices(&input, limit);
            prop_assert_eq!(sel.count, expected.len());
            prop_assert_eq!(sel.sorted(), expected);
            prop_assert!(sel.tail().iter().all(|&v| v == SENTINEL));
        }

        #[test]
        fn prop_arrival_order_only_permutes(
            seed in any::<u64>(),
            a in any::<u64>(),
            b in any::<u64>(),
        ) {
            let input = InputGenerator::new(seed).uniform_f32(4 * 64);
            let sa = select(&input, 0.5, &options(64, Schedule::Lockstep(ArrivalOrder::Shuffled { seed: a }))).unwrap();
            let sb = select(&input, 0.5, &options(64, Schedule::Lockstep(ArrivalOrder::Shuffled { seed: b }))).unwrap();
            prop_assert_eq!(sa.count, sb.count);
            prop_assert_eq!(sa.sorted(), sb.sorted());
        }

        #[test]
        fn prop_padding_preserves_selection(
            len in 0usize..700,
            seed in any::<u64>(),
            limit in 0.0f32..1.0,
        ) {
            let input = InputGenerator::new(seed).uniform_f32(len);
            let padded = pad_to_block(&input, 128);
            prop_assert_eq!(padded.len() % 128, 0);
            let sel = select(&padded, limit, &options(128, Schedule::default())).unwrap();
            prop_assert_eq!(sel.sorted(), reference_indices(&input, limit));
        }
    }

    #[test]
    fn test_boundary_limits() {
        let input = InputGenerator::new(3).uniform_f32(2048);
        let max = input.iter().cloned().fold(f32::MIN, f32::max);
        let min = input.iter().cloned().fold(f32::MAX, f32::min);

        let none = select(&input, max + 0.001, &SelectOptions::default()).unwrap();
        assert_eq!(none.count, 0);
        assert!(none.indices.iter().all(|&v| v == SENTINEL));

        let all = select(&input, min, &SelectOptions::default()).unwrap();
        assert_eq!(all.count, 2048);
        assert_eq!(all.sorted(), (0..2048).collect::<Vec<i32>>());
    }

    #[test]
    fn test_threaded_matches_lockstep() {
        let input = InputGenerator::new(11).uniform_f32(8 * 128);
        let lockstep = select(&input, DEFAULT_LIMIT, &options(128, Schedule::default())).unwrap();
        let threaded = select(&input, DEFAULT_LIMIT, &options(128, Schedule::Threaded)).unwrap();
        assert_eq!(lockstep.count, threaded.count);
        assert_eq!(lockstep.sorted(), threaded.sorted());
    }

    #[test]
    fn test_driver_flow_default_geometry() {
        // Same shape as the driver's defaults, scaled down.
        let input = InputGenerator::new(0).uniform_f32(64 * 512);
        let sel = select(&input, DEFAULT_LIMIT, &SelectOptions::default()).unwrap();
        assert_eq!(sel.config.grid_size, 64);
        let report = verify(&input, DEFAULT_LIMIT, &sel).unwrap();
        assert_eq!(report.selected, report.expected);
        assert_eq!(report.non_sentinel, sel.count);
        assert_eq!(sel.stats.bytes_read, 64 * 512 * 4);
        assert_eq!(sel.stats.bytes_written, sel.count as u64 * 4);
    }
}
