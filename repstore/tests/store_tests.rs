//! End-to-end store tests over thread-per-rank groups.
//!
//! Run with:
//! ```bash
//! cargo test --package repstore --test store_tests
//! ```

mod common;

use common::{
    assert_blocks, await_deaths, decode_u32, run_ranks, submit_rank_values, u32_config,
};
use repstore::{
    BlockId, Error, OffsetMode, PermutationKind, RangedRequest, Store, StoreConfig,
};

const NUM_RANKS: usize = 8;
const BLOCKS_PER_RANK: u64 = 1000;
const TOTAL_BLOCKS: u64 = BLOCKS_PER_RANK * NUM_RANKS as u64;

/// Requests shipping the full id space to every rank of `group_size`.
fn everyone_wants_everything(group_size: usize, total_blocks: u64) -> Vec<RangedRequest> {
    (0..group_size)
        .map(|rank| ((0u64, total_blocks), rank))
        .collect()
}

#[test]
fn push_full_range_no_failures() {
    // Every rank submits 1000 values and requests everything; everyone
    // must see all 8000 blocks in ascending id order.
    run_ranks(NUM_RANKS, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        assert_eq!(store.replication_level(), 3);
        assert_eq!(store.offset_mode(), (OffsetMode::Constant, 4));

        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        let requests = everyone_wants_everything(NUM_RANKS, TOTAL_BLOCKS);
        let mut received = Vec::new();
        store
            .push_blocks(&requests, |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();
        assert_blocks(&received, 0..TOTAL_BLOCKS);
    });
}

#[test]
fn push_own_range_no_failures() {
    // The original workload shape: each rank re-requests exactly the
    // blocks it submitted.
    run_ranks(NUM_RANKS, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        let requests: Vec<RangedRequest> = (0..NUM_RANKS)
            .map(|dest| ((dest as u64 * BLOCKS_PER_RANK, BLOCKS_PER_RANK), dest))
            .collect();
        let mut received = Vec::new();
        store
            .push_blocks(&requests, |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();

        let first = rank as u64 * BLOCKS_PER_RANK;
        assert_blocks(&received, first..first + BLOCKS_PER_RANK);
    });
}

#[test]
fn push_recovers_after_two_failures() {
    // r = 3 tolerates two dead ranks; all original values must survive.
    let victims = [1usize, 3usize];
    run_ranks(NUM_RANKS, move |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        if victims.contains(&rank) {
            return;
        }
        await_deaths(&store, victims.len());

        let survivors = NUM_RANKS - victims.len();
        let requests = everyone_wants_everything(survivors, TOTAL_BLOCKS);
        let mut received = Vec::new();
        store
            .push_blocks(&requests, |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();
        assert_blocks(&received, 0..TOTAL_BLOCKS);
    });
}

#[test]
fn push_reports_unrecoverable_loss() {
    // r = 2 with three failures: ranks 5 and 6 hold a range together
    // (shift is 5 for P = 8, r = 2), so killing both loses it for good.
    let victims = [2usize, 5, 6];
    run_ranks(NUM_RANKS, move |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(2)).unwrap();
        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        if victims.contains(&rank) {
            return;
        }
        await_deaths(&store, victims.len());

        let survivors = NUM_RANKS - victims.len();
        let requests = everyone_wants_everything(survivors, TOTAL_BLOCKS);
        let result = store.push_blocks(&requests, |_, _| {
            panic!("no block may be delivered from a lost range request");
        });
        assert!(matches!(result, Err(Error::UnrecoverableDataLoss)));
    });
}

#[test]
fn pull_matches_push() {
    // Pull symmetry: asking only for one's own range yields the same bytes
    // a push of that range would.
    run_ranks(NUM_RANKS, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        let first = rank as u64 * BLOCKS_PER_RANK;
        let mut received = Vec::new();
        store
            .pull_blocks(&[(first, BLOCKS_PER_RANK)], |bytes, id| {
                received.push(decode_u32(bytes, id))
            })
            .unwrap();
        assert_blocks(&received, first..first + BLOCKS_PER_RANK);
    });
}

#[test]
fn pull_survives_failure_of_a_serving_rank() {
    // Whoever served a range first dies; pull must fall back to the next
    // surviving holder and still deliver everything.
    let victims = [0usize];
    run_ranks(NUM_RANKS, move |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        if victims.contains(&rank) {
            return;
        }
        await_deaths(&store, victims.len());

        let mut received = Vec::new();
        store
            .pull_blocks(&[(0, TOTAL_BLOCKS)], |bytes, id| {
                received.push(decode_u32(bytes, id))
            })
            .unwrap();
        assert_blocks(&received, 0..TOTAL_BLOCKS);
    });
}

#[test]
fn feistel_permutation_round_trips_through_the_wire() {
    // Scattered placement must be invisible to the caller: ids come back
    // as user ids with the right payloads.
    let config = StoreConfig::new(3, OffsetMode::Constant, 4)
        .with_permutation(PermutationKind::Feistel)
        .with_bucket_size(16)
        .with_seed(0x5eed);
    let blocks_per_rank = 1024u64;

    run_ranks(NUM_RANKS, move |rank, endpoint| {
        let mut store = Store::new(endpoint, config.clone()).unwrap();
        submit_rank_values(&mut store, rank, blocks_per_rank, NUM_RANKS);

        // A contiguous slice; under the permutation it is served by many
        // peers, but the caller only sees its ids.
        let first = rank as u64 * 128;
        let mut received = Vec::new();
        store
            .pull_blocks(&[(first, 128)], |bytes, id| {
                received.push(decode_u32(bytes, id))
            })
            .unwrap();

        assert_eq!(received.len(), 128);
        received.sort_unstable();
        assert_blocks(&received, first..first + 128);
    });
}

#[test]
fn resubmission_replaces_prior_blocks() {
    run_ranks(4, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(2)).unwrap();
        submit_rank_values(&mut store, rank, 100, 4);

        // Resubmit a differently-sized id space with shifted values.
        let first = rank as u64 * 50;
        let mut next = first;
        store
            .submit_blocks(
                |value: &u32, stream| stream.write_bytes(&value.to_le_bytes()),
                move || {
                    if next < first + 50 {
                        let block = repstore::NextBlock {
                            id: next,
                            block: next as u32 + 7,
                        };
                        next += 1;
                        Some(block)
                    } else {
                        None
                    }
                },
                200,
                false,
                false,
            )
            .unwrap();

        let mut received = Vec::new();
        store
            .pull_blocks(&[(0, 200)], |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();
        let expected: Vec<(BlockId, u32)> = (0..200).map(|id| (id, id as u32 + 7)).collect();
        assert_eq!(received, expected);
    });
}

#[test]
fn resubmission_after_failures_serves_new_data() {
    // Failures, shrink, then a fresh submission on the smaller group; the
    // new data must be retrievable.
    let victims = [1usize, 3usize];
    run_ranks(NUM_RANKS, move |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        submit_rank_values(&mut store, rank, BLOCKS_PER_RANK, NUM_RANKS);

        if victims.contains(&rank) {
            return;
        }
        await_deaths(&store, victims.len());

        // First confirm the old data is still whole.
        let survivors = NUM_RANKS - victims.len();
        let requests = everyone_wants_everything(survivors, TOTAL_BLOCKS);
        let mut received = Vec::new();
        store
            .push_blocks(&requests, |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();
        assert_blocks(&received, 0..TOTAL_BLOCKS);

        // The shrunken group renumbers ranks densely; resubmit under the
        // new numbering.
        let new_rank = rank - victims.iter().filter(|&&v| v < rank).count();
        submit_rank_values(&mut store, new_rank, 500, survivors);

        let new_total = 500 * survivors as u64;
        let requests = everyone_wants_everything(survivors, new_total);
        let mut received = Vec::new();
        store
            .push_blocks(&requests, |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();
        assert_blocks(&received, 0..new_total);
    });
}

#[test]
fn background_submission_completes_before_retrieval() {
    run_ranks(4, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(2)).unwrap();

        let first = rank as u64 * 100;
        let mut next = first;
        store
            .submit_blocks(
                |value: &u32, stream| stream.write_bytes(&value.to_le_bytes()),
                move || {
                    if next < first + 100 {
                        let block = repstore::NextBlock {
                            id: next,
                            block: next as u32,
                        };
                        next += 1;
                        Some(block)
                    } else {
                        None
                    }
                },
                400,
                true,
                false,
            )
            .unwrap();

        // Poll until the worker lands, then wait (idempotent), then read.
        while !store.poll_submit_finished().unwrap() {
            std::thread::yield_now();
        }
        store.wait_submit_finished().unwrap();

        let mut received = Vec::new();
        store
            .pull_blocks(&[(first, 100)], |bytes, id| {
                received.push(decode_u32(bytes, id))
            })
            .unwrap();
        assert_blocks(&received, first..first + 100);
    });
}

#[test]
fn retrieval_blocks_behind_background_submission() {
    // push right after an asynchronous submit: the storage lock must make
    // it wait for the worker instead of failing.
    run_ranks(4, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(2)).unwrap();

        let first = rank as u64 * 100;
        let mut next = first;
        store
            .submit_blocks(
                |value: &u32, stream| stream.write_bytes(&value.to_le_bytes()),
                move || {
                    if next < first + 100 {
                        let block = repstore::NextBlock {
                            id: next,
                            block: next as u32,
                        };
                        next += 1;
                        Some(block)
                    } else {
                        None
                    }
                },
                400,
                true,
                false,
            )
            .unwrap();

        let requests: Vec<RangedRequest> = (0..4)
            .map(|dest| ((dest as u64 * 100, 100u64), dest))
            .collect();
        let mut received = Vec::new();
        store
            .push_blocks(&requests, |bytes, id| received.push(decode_u32(bytes, id)))
            .unwrap();
        assert_blocks(&received, first..first + 100);

        store.wait_submit_finished().unwrap();
    });
}

#[test]
fn submitting_fewer_than_two_blocks_is_invalid() {
    run_ranks(1, |_, endpoint| {
        let mut store = Store::new(endpoint, u32_config(1)).unwrap();
        for total in [0u64, 1] {
            let result = store.submit_blocks(
                |_: &u32, _| {},
                || None,
                total,
                false,
                false,
            );
            assert!(matches!(result, Err(Error::InvalidArgument(_))));
        }
    });
}

#[test]
fn retrieval_without_submission_is_data_loss() {
    run_ranks(1, |_, endpoint| {
        let store = Store::new(endpoint, u32_config(1)).unwrap();
        let result = store.push_blocks(&[((0, 1), 0)], |_, _| {});
        assert!(matches!(result, Err(Error::UnrecoverableDataLoss)));
    });
}

#[test]
fn excessive_replication_level_is_invalid() {
    run_ranks(2, |rank, endpoint| {
        let mut store = Store::new(endpoint, u32_config(3)).unwrap();
        let result = store.submit_blocks(
            |_: &u32, _| {},
            || None,
            100,
            false,
            false,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let _ = rank;
    });
}

#[test]
fn lookup_table_mode_is_rejected_at_submit() {
    run_ranks(1, |_, endpoint| {
        let config = StoreConfig::new(1, OffsetMode::LookupTable, 0);
        let mut store = Store::new(endpoint, config).unwrap();
        let result = store.submit_blocks(
            |_: &u32, _| {},
            || None,
            100,
            false,
            false,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    });
}

#[test]
fn oversized_serialized_block_is_rejected() {
    run_ranks(1, |_, endpoint| {
        let mut store = Store::new(endpoint, u32_config(1)).unwrap();
        let mut produced = false;
        let result = store.submit_blocks(
            |value: &u64, stream| stream.write_bytes(&value.to_le_bytes()),
            move || {
                if produced {
                    None
                } else {
                    produced = true;
                    Some(repstore::NextBlock { id: 0, block: 9u64 })
                }
            },
            4,
            false,
            false,
        );
        match result {
            Err(Error::BlockTooLarge {
                block_id,
                written,
                limit,
            }) => {
                assert_eq!(block_id, 0);
                assert_eq!(written, 8);
                assert_eq!(limit, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    });
}
