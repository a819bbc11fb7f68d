//! repstore - replicated in-memory block store for rank groups.
//!
//! Tightly-coupled parallel programs running as a fixed group of peer
//! ranks submit opaque binary blocks, each named by a 64-bit id. The store
//! replicates every block across a configurable number of peers, so that
//! after up to `replication_level - 1` simultaneous rank failures every
//! block is still retrievable by the survivors.
//!
//! ## Usage
//!
//! ```ignore
//! use repstore::{NextBlock, OffsetMode, Store, StoreConfig};
//!
//! let config = StoreConfig::new(3, OffsetMode::Constant, 4);
//! let mut store = Store::new(endpoint, config)?;
//!
//! // Collectively replicate this rank's values.
//! let mut next = 0usize;
//! store.submit_blocks(
//!     |value: &u32, stream| stream.write_bytes(&value.to_le_bytes()),
//!     || { /* yield NextBlock { id, block } until exhausted */ None },
//!     total_blocks,
//!     false,
//!     false,
//! )?;
//!
//! // ... ranks fail, the group shrinks ...
//! store.shrink_comm()?;
//!
//! // Fetch what this rank needs to take over the lost work.
//! store.pull_blocks(&[(first_id, count)], |bytes, id| {
//!     recover_value(id, bytes);
//! })?;
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: store configuration (`StoreConfig`, `OffsetMode`,
//!   `PermutationKind`)
//! - [`comm`]: messaging adapter over a rank group (`GroupContext`, sparse
//!   all-to-all, collectives, rank translation)
//! - [`distribution`]: deterministic block placement (`BlockDistribution`,
//!   `BlockRange`)
//! - [`permutation`]: user-id to internal-id permutations (`Permutation`)
//! - [`storage`]: local replica bytes (`SerializedBlockStorage`)
//! - [`submission`]: serialization into framed per-peer buffers and the
//!   submission exchange
//! - [`retrieval`]: transfer planning and the push/pull data exchanges
//! - [`store`]: the façade (`Store`)
//!
//! Rank placement is expressed in *original* ranks — the numbering at the
//! time of the last submission — while messages travel between *current*
//! ranks of the possibly shrunken group. The [`comm::GroupContext`]
//! adapter owns that translation; everything above it is a pure function
//! of the submitted block count, the group size, and the configuration, so
//! all peers agree on placement without negotiation.

pub mod comm;
pub mod config;
pub mod distribution;
pub mod error;
pub mod permutation;
pub mod retrieval;
pub mod storage;
pub mod submission;

mod store;

/// A user-visible block identifier.
pub type BlockId = u64;

pub use comm::{
    CurrentRank, GroupContext, OriginalRank, RankView, RecvMessage, ReduceOp, SendMessage,
};
pub use config::{OffsetMode, PermutationKind, StoreConfig};
pub use distribution::{BlockDistribution, BlockRange};
pub use error::{Error, Result};
pub use permutation::Permutation;
pub use retrieval::{BlockRangeRequest, RangedRequest};
pub use storage::SerializedBlockStorage;
pub use store::Store;
pub use submission::{BlockStream, NextBlock};
