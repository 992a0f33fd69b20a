//! Property-based tests for the bitmap, momentum, and error-code invariants

use std::collections::BTreeSet;

use proptest::prelude::*;
use updraft_agent::prelude::*;
use updraft_agent::job::FileSpec;

fn arb_count_and_order() -> impl Strategy<Value = (u32, Vec<u32>)> {
    (1u32..400).prop_flat_map(|count| {
        let indices: Vec<u32> = (0..count).collect();
        Just(indices)
            .prop_shuffle()
            .prop_map(move |order| (count, order))
    })
}

fn arb_marked_subset() -> impl Strategy<Value = (u32, BTreeSet<u32>)> {
    (1u32..300).prop_flat_map(|count| {
        prop::collection::btree_set(0..count, 0..count as usize)
            .prop_map(move |marked| (count, marked))
    })
}

fn arb_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop::sample::select(vec![
        ErrorKind::SignatureCheckFailed,
        ErrorKind::BadSignerCert,
        ErrorKind::OutOfMemory,
        ErrorKind::ActivateFailed,
        ErrorKind::CommitFailed,
        ErrorKind::PublishFailed,
        ErrorKind::NoActiveJob,
        ErrorKind::NoFreeContext,
        ErrorKind::FileClose,
        ErrorKind::FileTooLarge,
        ErrorKind::MomentumAbort,
        ErrorKind::DowngradeNotAllowed,
        ErrorKind::SameFirmwareVersion,
        ErrorKind::JobParserError,
        ErrorKind::ImageStateMismatch,
        ErrorKind::IngestError,
        ErrorKind::UserAbort,
        ErrorKind::TopicTooLarge,
        ErrorKind::EventEnqueueFailed,
        ErrorKind::InvalidDataProtocol,
        ErrorKind::SubscribeFailed,
        ErrorKind::InvalidConfiguration,
        ErrorKind::Panic,
    ])
}

fn job_for(size: u64, block_size: u32) -> JobDescriptor {
    JobDescriptor {
        job_id: "job-prop".to_string(),
        client_token: None,
        timestamp: None,
        self_test: false,
        updated_by: None,
        protocols: Vec::new(),
        stream_name: None,
        file: FileSpec {
            path: "/fw/prop.bin".to_string(),
            size,
            file_id: 1,
            block_size,
            cert_file: None,
            signature: vec![0xA5; 32],
            auth_scheme: None,
            presigned_url: None,
            version: None,
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_marking_all_blocks_in_any_order_completes(
        (count, order) in arb_count_and_order()
    ) {
        let mut bitmap = BlockBitmap::with_capacity(512);
        bitmap.init(count).expect("init");

        for (seen, index) in order.iter().enumerate() {
            prop_assert_eq!(
                bitmap.mark_received(*index).expect("mark"),
                MarkOutcome::First
            );
            let expected_complete = seen + 1 == count as usize;
            prop_assert_eq!(bitmap.is_complete(), expected_complete);
        }
        prop_assert!(bitmap.is_complete());
        prop_assert_eq!(bitmap.received_count(), count);

        // Idempotence: re-marking changes nothing.
        for index in order.iter().take(16) {
            prop_assert_eq!(
                bitmap.mark_received(*index).expect("mark"),
                MarkOutcome::Duplicate
            );
        }
        prop_assert_eq!(bitmap.received_count(), count);
        prop_assert!(bitmap.is_complete());
    }

    #[test]
    fn prop_next_missing_is_ascending_and_disjoint_from_received(
        (count, marked) in arb_marked_subset(),
        width in 1usize..64,
    ) {
        let mut bitmap = BlockBitmap::with_capacity(512);
        bitmap.init(count).expect("init");
        for index in &marked {
            bitmap.mark_received(*index).expect("mark");
        }

        let missing: Vec<u32> = bitmap.next_missing(width).collect();
        let expected_len = width.min(count as usize - marked.len());
        prop_assert_eq!(missing.len(), expected_len);
        for pair in missing.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
        for index in &missing {
            prop_assert!(!marked.contains(index));
            prop_assert!(*index < count);
        }
    }

    #[test]
    fn prop_momentum_allows_exactly_max_requests(max in 1u32..64) {
        let mut momentum = RequestMomentum::new(max);
        for _ in 0..max {
            prop_assert!(momentum.try_acquire().is_ok());
        }
        prop_assert!(momentum.try_acquire().is_err());
        momentum.reset();
        prop_assert_eq!(momentum.sent(), 0);
        prop_assert!(momentum.try_acquire().is_ok());
    }

    #[test]
    fn prop_error_code_wire_roundtrip(
        kind in arb_error_kind(),
        sub_code in 0u32..=0x00ff_ffff,
    ) {
        let code = ErrorCode::with_sub_code(kind, sub_code);
        let wire = code.as_wire();
        let back = ErrorCode::from_wire(wire).expect("non-zero word");
        prop_assert_eq!(back.kind, kind);
        prop_assert_eq!(back.as_wire(), wire);
    }

    #[test]
    fn prop_block_math_covers_the_file_exactly(
        size in 1u64..4_000_000,
        block_size in prop::sample::select(vec![256u32, 512, 1024, 2048, 4096]),
    ) {
        let config = AgentConfig {
            max_block_count: 16_384,
            max_block_size: 4096,
            ..AgentConfig::default()
        };
        let job = job_for(size, block_size);
        let mut file = FileContext::new(&config.limits, config.max_block_count);
        file.load(&job, DataProtocol::Stream, &config).expect("load");

        let count = u64::from(file.block_count());
        prop_assert_eq!(count, size.div_ceil(u64::from(block_size)));

        let mut total = 0u64;
        for index in 0..file.block_count() {
            let len = u64::from(file.expected_block_len(index));
            prop_assert!(len > 0);
            prop_assert!(len <= u64::from(block_size));
            total += len;
        }
        prop_assert_eq!(total, size);
    }
}
