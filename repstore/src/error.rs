//! Error types for the replicated block store.

use rankmesh::MeshError;

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum Error {
    /// A constructor or call argument violates its contract.
    InvalidArgument(String),
    /// One or more peers died during a communication phase. The caller must
    /// shrink or replace the group handle before continuing.
    Fault,
    /// The group handle was revoked mid-phase; install a new one.
    Revoked,
    /// A requested block range has no surviving replica.
    UnrecoverableDataLoss,
    /// The serializer wrote more bytes than the configured constant block
    /// size.
    BlockTooLarge {
        block_id: u64,
        written: usize,
        limit: usize,
    },
    /// A received message does not parse as the expected wire format.
    MalformedMessage(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Fault => write!(f, "a rank in the group failed"),
            Error::Revoked => write!(
                f,
                "the group handle has been revoked; install a new one before communicating again"
            ),
            Error::UnrecoverableDataLoss => {
                write!(f, "unrecoverable data loss: a requested range has no surviving replica")
            }
            Error::BlockTooLarge {
                block_id,
                written,
                limit,
            } => write!(
                f,
                "serialized block {} is {} bytes, exceeding the constant offset of {} bytes",
                block_id, written, limit
            ),
            Error::MalformedMessage(msg) => write!(f, "malformed message: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<MeshError> for Error {
    fn from(e: MeshError) -> Self {
        match e {
            MeshError::Fault => Error::Fault,
            MeshError::Revoked => Error::Revoked,
            MeshError::InvalidRank => {
                Error::InvalidArgument("rank is not a member of the group".into())
            }
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;
