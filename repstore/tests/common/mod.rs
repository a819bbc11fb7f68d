//! Shared harness for the end-to-end store tests.
//!
//! Each test spawns one OS thread per rank over an in-process group, runs
//! the same closure everywhere, and joins the per-rank results — the
//! thread-level analogue of launching one process per rank.

use std::sync::Arc;
use std::thread;

use rankmesh::{create_group, Endpoint};
use repstore::{BlockId, NextBlock, OffsetMode, Store, StoreConfig};

/// Runs `f(rank, endpoint)` on one thread per rank and returns the results
/// in rank order. A rank that panics fails the whole test.
pub fn run_ranks<T, F>(num_ranks: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, Endpoint) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = create_group(num_ranks)
        .into_iter()
        .enumerate()
        .map(|(rank, endpoint)| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(rank, endpoint))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// The standard test configuration: constant mode, 4-byte `u32` blocks.
pub fn u32_config(replication_level: u16) -> StoreConfig {
    StoreConfig::new(replication_level, OffsetMode::Constant, 4)
}

/// Collectively submits `blocks_per_rank` `u32` values per rank, with rank
/// `r` owning ids `[r * blocks_per_rank, (r + 1) * blocks_per_rank)` and
/// every block's value equal to its id.
pub fn submit_rank_values(
    store: &mut Store,
    rank: usize,
    blocks_per_rank: u64,
    num_ranks: usize,
) {
    let first = rank as u64 * blocks_per_rank;
    let end = first + blocks_per_rank;
    let mut next = first;
    store
        .submit_blocks(
            |value: &u32, stream| stream.write_bytes(&value.to_le_bytes()),
            move || {
                if next < end {
                    let block = NextBlock {
                        id: next,
                        block: next as u32,
                    };
                    next += 1;
                    Some(block)
                } else {
                    None
                }
            },
            blocks_per_rank * num_ranks as u64,
            false,
            false,
        )
        .unwrap();
}

/// Spins until `expected` ranks have been observed dead, shrinking the
/// store's group as deaths surface. All survivors end up on the same
/// shrunken group.
pub fn await_deaths(store: &Store, expected: usize) {
    let mut seen = 0;
    loop {
        store.shrink_comm().unwrap();
        seen += store.ranks_died_since_last_call().len();
        if seen >= expected {
            return;
        }
        thread::yield_now();
    }
}

/// Collects `(user id, value)` pairs delivered by a retrieval.
pub fn decode_u32(bytes: &[u8], id: BlockId) -> (BlockId, u32) {
    assert_eq!(bytes.len(), 4);
    (id, u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Asserts that `received` is exactly `ids`, each with value == id, in the
/// given order.
pub fn assert_blocks(received: &[(BlockId, u32)], ids: impl Iterator<Item = BlockId>) {
    let expected: Vec<(BlockId, u32)> = ids.map(|id| (id, id as u32)).collect();
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, &expected[..]);
}
