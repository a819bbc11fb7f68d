//! rankmesh - fault-tolerant in-process rank groups.
//!
//! This crate gives a fixed-size set of OS threads the communication model
//! of a fault-tolerant message-passing job: numbered ranks, tagged
//! point-to-point messages, barriers, failure notifications, communicator
//! revocation, and shrunken-group rebuilds.
//!
//! # Architecture
//!
//! ```text
//!   create_group(4)
//!        │
//!        ▼
//!  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐
//!  │ Endpoint │ │ Endpoint │ │ Endpoint │ │ Endpoint │   one per thread
//!  │  rank 0  │ │  rank 1  │ │  rank 2  │ │  rank 3  │
//!  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘
//!       │  MPSC queue each, senders to every peer │
//!       └────────────┴─────┬──────┴───────────────┘
//!                          ▼
//!                 shared registry
//!        (liveness, epochs, barriers, revocation)
//! ```
//!
//! - **Groups are epochs**: a [`Group`] handle pins a member list. Messages
//!   are routed per epoch and never cross handles.
//! - **Failures are observed, not delivered**: after [`Endpoint::fail`],
//!   peers get [`MeshError::Fault`] from any operation involving the dead
//!   rank, mirroring how a fault-tolerant MPI surfaces process failure.
//! - **Survivors rebuild**: [`Endpoint::shrink`] derives a dense renumbered
//!   handle that is identical across all survivors.

pub mod group;
pub mod mpsc;

pub use group::{create_group, create_group_with, BarrierToken, Endpoint, Group};
pub use mpsc::{MpscChannel, StdMpsc};

#[cfg(feature = "crossbeam")]
pub use mpsc::CrossbeamMpsc;

/// Errors surfaced by group operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshError {
    /// A rank involved in the operation has died.
    Fault,
    /// The group handle has been revoked; switch to a new handle.
    Revoked,
    /// The addressed rank is not a member of the group.
    InvalidRank,
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshError::Fault => write!(f, "a rank in the group has failed"),
            MeshError::Revoked => write!(f, "the group handle has been revoked"),
            MeshError::InvalidRank => write!(f, "rank is not a member of the group"),
        }
    }
}

impl std::error::Error for MeshError {}

/// Result type for group operations.
pub type Result<T> = std::result::Result<T, MeshError>;
