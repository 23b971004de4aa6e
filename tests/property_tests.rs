//! Property-based tests for progressive streams.
//!
//! These tests use proptest to generate random block sizes, resource sizes,
//! read patterns and delivery orders, and verify the stream's invariants.


use pdf_x_bridge::core::*;
use proptest::prelude::*;
use test_utils::*;

// ============================================================================
// Block size validation
// ============================================================================

/// Property: only powers of two between 1 KiB and 16 MiB open
proptest! {
    #[test]
    fn prop_block_size_validation(block_size in 0usize..(1 << 25)) {
        let valid = block_size.is_power_of_two()
            && (1024..=16 * 1024 * 1024).contains(&block_size);

        match block_shift_for(block_size) {
            Ok(shift) => {
                prop_assert!(valid);
                prop_assert_eq!(1usize << shift, block_size);
            }
            Err(e) => {
                prop_assert!(!valid);
                prop_assert_eq!(e.kind(), ErrorKind::InvalidArgument);
            }
        }
    }
}

// ============================================================================
// Seeking
// ============================================================================

/// Property: every seek lands inside [0, length] and never fetches
proptest! {
    #[test]
    fn prop_seek_clamps(
        len in 0usize..50_000,
        seeks in prop::collection::vec((any::<i64>(), 0i32..3), 1..20),
    ) {
        let (driver, mut stream) = open_recorded(len, false);

        for (offset, whence) in seeks {
            let before = stream.pos() as i128;
            let whence = Whence::from_raw(whence).unwrap();
            let base = match whence {
                Whence::Start => 0,
                Whence::Current => before,
                Whence::End => len as i128,
            };
            let expected = (base + offset as i128).clamp(0, len as i128) as usize;

            prop_assert_eq!(stream.seek(offset, whence), expected);
            prop_assert_eq!(stream.pos(), expected);
        }
        prop_assert!(driver.reads(stream.id()).is_empty());
    }
}

// ============================================================================
// Delivery order
// ============================================================================

/// Property: any delivery order yields the original bytes
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_delivery_order_round_trips(
        len in 1usize..20_000,
        order_seed in any::<u64>(),
    ) {
        let data = sample_data(len);
        let (driver, mut stream) = open_recorded(len, false);
        let handle = driver.handle(stream.id());

        let num_blocks = len.div_ceil(1024);
        let mut order: Vec<usize> = (0..num_blocks).collect();
        // Cheap deterministic shuffle driven by the seed.
        let mut seed = order_seed | 1;
        for i in (1..order.len()).rev() {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            order.swap(i, (seed % (i as u64 + 1)) as usize);
        }

        for block in order {
            prop_assert!(handle.request_block(block).unwrap());
            prop_assert!(driver.deliver(stream.id(), &data, block).unwrap());
        }

        prop_assert!(stream.is_fully_loaded());
        let bytes = stream.read_bytes(len).unwrap();
        prop_assert_eq!(bytes, data);
        prop_assert_eq!(stream.read_byte().unwrap(), None);
        prop_assert!(driver.reads(stream.id()).is_empty());
    }
}

// ============================================================================
// Request de-duplication
// ============================================================================

/// Property: random reads request each block at most once
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_each_block_requested_once(
        len in 1usize..20_000,
        positions in prop::collection::vec(any::<prop::sample::Index>(), 1..50),
        deliver_every in 1usize..5,
    ) {
        let data = sample_data(len);
        let (driver, mut stream) = open_recorded(len, false);

        for (i, position) in positions.iter().enumerate() {
            let pos = position.index(len);
            stream.set_pos(pos);
            match stream.read_byte() {
                Ok(byte) => prop_assert_eq!(byte, Some(data[pos])),
                Err(e) => prop_assert!(e.is_try_later()),
            }
            if i % deliver_every == 0 {
                driver.deliver_requested(stream.id(), &data);
            }
        }

        let mut reads = driver.reads(stream.id());
        let total = reads.len();
        reads.sort_unstable();
        reads.dedup();
        prop_assert_eq!(reads.len(), total, "a block was requested twice");

        let state = stream.handle().lock().unwrap();
        for block in 0..state.map_length() {
            let requested = reads.binary_search(&block).is_ok();
            prop_assert_eq!(state.status(block) != Some(BlockStatus::NotRequested), requested);
        }
    }
}

// ============================================================================
// Pump driver
// ============================================================================

/// Property: with prefetch the pump driver fetches every block exactly once
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_prefetch_fetches_once(len in 1usize..40_000, start in any::<prop::sample::Index>()) {
        let data = sample_data(len);
        let (driver, mut stream) = open_pumped(&data, 1024, true);

        let pos = start.index(len);
        stream.set_pos(pos);
        prop_assert!(stream.read_byte().unwrap_err().is_try_later());
        driver.run_until_idle().unwrap();

        prop_assert!(stream.is_fully_loaded());
        prop_assert_eq!(driver.fetched_blocks(), len.div_ceil(1024));
        prop_assert_eq!(stream.read_byte().unwrap(), Some(data[pos]));
    }
}
