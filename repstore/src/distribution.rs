//! Deterministic mapping from block ids to the peers storing them.
//!
//! The id space `[0, N)` is cut into `min(P, N)` contiguous ranges of
//! near-equal length; each range is assigned to `r` distinct original ranks.
//! The mapping is a pure function of `(N, P, r)`, so every peer computes the
//! identical placement without communication.

use crate::comm::OriginalRank;
use crate::error::{Error, Result};
use crate::BlockId;

/// A half-open run `[start, start + len)` of consecutive internal block ids
/// placed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Position of this range in the partition.
    pub index: usize,
    /// First block id in the range.
    pub start: BlockId,
    /// Number of blocks in the range.
    pub len: u64,
}

impl BlockRange {
    /// One past the last block id in the range.
    pub fn end(&self) -> BlockId {
        self.start + self.len
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.start <= id && id < self.end()
    }
}

/// The placement function for one submission epoch.
#[derive(Debug)]
pub struct BlockDistribution {
    num_blocks: u64,
    num_peers: usize,
    replication_level: u16,
    num_ranges: usize,
    /// Length of the short ranges; the first `num_long_ranges` are one
    /// longer.
    base_len: u64,
    num_long_ranges: u64,
    /// Stride between consecutive ranges' first holders, coprime with
    /// `num_peers`.
    shift: usize,
    /// Sorted holder list per range.
    holders: Vec<Vec<OriginalRank>>,
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl BlockDistribution {
    /// Builds the placement of `num_blocks` ids over `num_peers` original
    /// ranks with `replication_level` copies each.
    pub fn new(num_blocks: u64, num_peers: usize, replication_level: u16) -> Result<Self> {
        if num_blocks == 0 {
            return Err(Error::InvalidArgument("cannot distribute zero blocks".into()));
        }
        if num_peers == 0 {
            return Err(Error::InvalidArgument(
                "cannot distribute blocks over zero peers".into(),
            ));
        }
        if replication_level == 0 {
            return Err(Error::InvalidArgument(
                "replication level must be at least 1".into(),
            ));
        }
        if replication_level as usize > num_peers {
            return Err(Error::InvalidArgument(format!(
                "replication level {} exceeds the number of peers {}",
                replication_level, num_peers
            )));
        }

        let num_ranges = (num_peers as u64).min(num_blocks) as usize;
        let base_len = num_blocks / num_ranges as u64;
        let num_long_ranges = num_blocks % num_ranges as u64;

        // Replicas of a range are `replication_level` consecutive ranks
        // starting at `index * shift`. A shift coprime with the peer count
        // gives every range a distinct first holder.
        let mut shift = (num_peers / replication_level as usize).max(1);
        while gcd(shift, num_peers) != 1 {
            shift += 1;
        }

        let holders = (0..num_ranges)
            .map(|index| {
                let mut ranks: Vec<OriginalRank> = (0..replication_level as usize)
                    .map(|j| (index * shift + j) % num_peers)
                    .collect();
                ranks.sort_unstable();
                ranks
            })
            .collect();

        Ok(Self {
            num_blocks,
            num_peers,
            replication_level,
            num_ranges,
            base_len,
            num_long_ranges,
            shift,
            holders,
        })
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    pub fn replication_level(&self) -> u16 {
        self.replication_level
    }

    pub fn num_ranges(&self) -> usize {
        self.num_ranges
    }

    /// The range at partition position `index`.
    pub fn range_with_index(&self, index: usize) -> BlockRange {
        debug_assert!(index < self.num_ranges);
        let index64 = index as u64;
        let long_len = self.base_len + 1;
        let (start, len) = if index64 < self.num_long_ranges {
            (index64 * long_len, long_len)
        } else {
            (
                self.num_long_ranges * long_len + (index64 - self.num_long_ranges) * self.base_len,
                self.base_len,
            )
        };
        BlockRange {
            index,
            start,
            len,
        }
    }

    /// The range containing `id`.
    pub fn range_of_block(&self, id: BlockId) -> BlockRange {
        debug_assert!(id < self.num_blocks);
        let long_len = self.base_len + 1;
        let long_prefix = self.num_long_ranges * long_len;
        let index = if id < long_prefix {
            (id / long_len) as usize
        } else {
            (self.num_long_ranges + (id - long_prefix) / self.base_len) as usize
        };
        self.range_with_index(index)
    }

    /// The original ranks storing `range`, sorted ascending.
    pub fn ranks_holding_range(&self, range: &BlockRange) -> &[OriginalRank] {
        &self.holders[range.index]
    }

    /// The original ranks storing the range that contains `id`.
    pub fn ranks_holding_block(&self, id: BlockId) -> &[OriginalRank] {
        &self.holders[self.range_of_block(id).index]
    }

    /// Whether `rank` stores `range`.
    pub fn is_stored_on(&self, range: &BlockRange, rank: OriginalRank) -> bool {
        self.holders[range.index].binary_search(&rank).is_ok()
    }

    /// The ranges stored by `rank`, ascending by start id.
    pub fn ranges_stored_on(&self, rank: OriginalRank) -> Vec<BlockRange> {
        (0..self.num_ranges)
            .filter(|&index| self.holders[index].binary_search(&rank).is_ok())
            .map(|index| self.range_with_index(index))
            .collect()
    }

    /// The stride between consecutive ranges' first holders.
    pub fn shift(&self) -> usize {
        self.shift
    }
}
