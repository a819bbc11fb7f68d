//! In-process storage for the serialized blocks this peer replicates.
//!
//! One flat byte buffer per locally held range; in constant offset mode the
//! i-th block of a range lives at byte offset `i * const_offset`, so no
//! per-block metadata is kept. Buffers are allocated up front from the
//! distribution and their addresses stay stable for the lifetime of the
//! store.

use crate::comm::OriginalRank;
use crate::distribution::{BlockDistribution, BlockRange};
use crate::error::{Error, Result};
use crate::BlockId;

/// Byte storage for the ranges assigned to one peer.
#[derive(Debug)]
pub struct SerializedBlockStorage {
    const_offset: usize,
    /// Owned ranges, ascending by start id.
    ranges: Vec<BlockRange>,
    /// One buffer per owned range, parallel to `ranges`.
    data: Vec<Vec<u8>>,
}

impl SerializedBlockStorage {
    /// Allocates zeroed storage for every range `my_rank` holds under
    /// `distribution`.
    pub fn new(
        distribution: &BlockDistribution,
        const_offset: usize,
        my_rank: OriginalRank,
    ) -> Self {
        debug_assert!(const_offset > 0);
        let ranges = distribution.ranges_stored_on(my_rank);
        let data = ranges
            .iter()
            .map(|range| vec![0u8; range.len as usize * const_offset])
            .collect();
        Self {
            const_offset,
            ranges,
            data,
        }
    }

    /// The ranges this storage hosts, ascending by start id.
    pub fn owned_ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    pub fn const_offset(&self) -> usize {
        self.const_offset
    }

    /// Index of the owned range containing `id`.
    fn locate(&self, id: BlockId) -> Option<usize> {
        let idx = self.ranges.partition_point(|range| range.start <= id);
        if idx == 0 {
            return None;
        }
        let idx = idx - 1;
        self.ranges[idx].contains(id).then_some(idx)
    }

    /// Writes the serialized bytes of one block.
    pub fn write_block(&mut self, id: BlockId, bytes: &[u8]) -> Result<()> {
        self.write_consecutive_blocks(id, id, bytes)
    }

    /// Writes the serialized bytes of the blocks `first..=last` in one
    /// copy. All ids must lie in a single locally held range.
    pub fn write_consecutive_blocks(
        &mut self,
        first: BlockId,
        last: BlockId,
        bytes: &[u8],
    ) -> Result<()> {
        let idx = self.locate(first).ok_or_else(|| {
            Error::MalformedMessage(format!("block {} is not stored on this peer", first))
        })?;
        let range = self.ranges[idx];
        if last < first || last >= range.end() {
            return Err(Error::MalformedMessage(format!(
                "blocks {}..={} do not lie in the range [{}, {})",
                first,
                last,
                range.start,
                range.end()
            )));
        }
        let expected = (last - first + 1) as usize * self.const_offset;
        if bytes.len() != expected {
            return Err(Error::MalformedMessage(format!(
                "blocks {}..={} carry {} bytes, expected {}",
                first,
                last,
                bytes.len(),
                expected
            )));
        }
        let offset = (first - range.start) as usize * self.const_offset;
        self.data[idx][offset..offset + expected].copy_from_slice(bytes);
        Ok(())
    }

    /// The serialized bytes of one block, or `None` if this peer does not
    /// hold it.
    pub fn block_bytes(&self, id: BlockId) -> Option<&[u8]> {
        let idx = self.locate(id)?;
        let range = self.ranges[idx];
        let offset = (id - range.start) as usize * self.const_offset;
        Some(&self.data[idx][offset..offset + self.const_offset])
    }

    /// Invokes `f` once per block of `[first, first + len)` in id order.
    ///
    /// The span must lie inside one locally held range; the retrieval
    /// sender path guarantees this by splitting requests along distribution
    /// ranges.
    pub fn for_all_blocks_in_range<F: FnMut(&[u8])>(&self, first: BlockId, len: u64, mut f: F) {
        let idx = self
            .locate(first)
            .unwrap_or_else(|| panic!("block {} is not stored on this peer", first));
        let range = self.ranges[idx];
        assert!(
            first + len <= range.end(),
            "span [{}, {}) leaves the stored range [{}, {})",
            first,
            first + len,
            range.start,
            range.end()
        );
        let offset = (first - range.start) as usize * self.const_offset;
        let bytes = &self.data[idx][offset..offset + len as usize * self.const_offset];
        for block in bytes.chunks_exact(self.const_offset) {
            f(block);
        }
    }
}
