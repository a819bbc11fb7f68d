//! Store configuration.

use crate::error::{Error, Result};

/// How serialized blocks are addressed inside the local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetMode {
    /// Every block occupies exactly `const_offset` bytes; the i-th block of
    /// a range sits at offset `i * const_offset`.
    Constant,
    /// Variable-length blocks addressed through a per-block offset table.
    /// Accepted by the configuration but not implemented yet; submitting
    /// with this mode fails with `InvalidArgument`.
    LookupTable,
}

/// Which id permutation decouples user block ids from internal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermutationKind {
    /// Internal ids equal user ids. Contiguous user ranges map to few
    /// storage ranges, concentrating load on few peers.
    Identity,
    /// Keyed range-preserving Feistel permutation: runs of `bucket_size`
    /// consecutive user ids stay consecutive, coarser structure scatters
    /// across the whole id space.
    Feistel,
}

/// Store configuration.
///
/// `replication_level` copies of every block are spread over distinct
/// peers, so the store survives up to `replication_level - 1` simultaneous
/// failures.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of distinct peers holding each block.
    pub replication_level: u16,
    /// Block addressing mode.
    pub offset_mode: OffsetMode,
    /// Exact serialized size of every block in bytes. Must be positive in
    /// constant mode and zero in lookup-table mode.
    pub const_offset: usize,
    /// Permutation selection.
    pub permutation: PermutationKind,
    /// Length of the consecutive user-id runs the permutation preserves.
    /// Ignored for the identity permutation.
    pub bucket_size: u64,
    /// Key for the Feistel permutation. Ignored for the identity
    /// permutation.
    pub seed: u64,
}

impl StoreConfig {
    /// Create a configuration with the identity permutation and a default
    /// bucket size of 64.
    pub fn new(replication_level: u16, offset_mode: OffsetMode, const_offset: usize) -> Self {
        Self {
            replication_level,
            offset_mode,
            const_offset,
            permutation: PermutationKind::Identity,
            bucket_size: 64,
            seed: 0,
        }
    }

    /// Select the permutation kind.
    pub fn with_permutation(mut self, permutation: PermutationKind) -> Self {
        self.permutation = permutation;
        self
    }

    /// Set the bucket size of the Feistel permutation.
    pub fn with_bucket_size(mut self, bucket_size: u64) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Set the Feistel permutation key.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check the cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.replication_level == 0 {
            return Err(Error::InvalidArgument(
                "replication level must be at least 1".into(),
            ));
        }
        match self.offset_mode {
            OffsetMode::Constant if self.const_offset == 0 => {
                return Err(Error::InvalidArgument(
                    "constant offset mode requires const_offset > 0".into(),
                ));
            }
            OffsetMode::LookupTable if self.const_offset != 0 => {
                return Err(Error::InvalidArgument(
                    "lookup-table offset mode requires const_offset == 0".into(),
                ));
            }
            _ => {}
        }
        if self.bucket_size == 0 {
            return Err(Error::InvalidArgument("bucket size must be at least 1".into()));
        }
        Ok(())
    }
}
