//! Messaging adapter over a fault-tolerant rank group.
//!
//! [`GroupContext`] is the store's only window onto the messaging layer. It
//! keeps two group snapshots: the *original* group, frozen when blocks were
//! last submitted, and the *current* group, which shrinks as ranks fail.
//! Block placement is expressed in original ranks; every transfer first
//! translates through this adapter to find who is still alive and under
//! which current rank.
//!
//! All operations are synchronous and re-raise substrate failures
//! ([`Error::Fault`], [`Error::Revoked`]) instead of swallowing them.

use rankmesh::{Endpoint, Group};

use crate::error::{Error, Result};

/// Rank numbering at the time of the last submission.
pub type OriginalRank = usize;
/// Rank numbering in the present, possibly shrunken, group.
pub type CurrentRank = usize;

/// Tag of the submission data exchange.
pub const SUBMISSION_TAG: u16 = 42;
/// Tag of the pull-request exchange.
pub const PULL_REQUEST_TAG: u16 = 43;
/// Tag of the retrieval data exchange.
pub const BLOCK_DATA_TAG: u16 = 44;
/// Tag reserved for the collectives below.
const COLLECTIVE_TAG: u16 = 7;

/// An outgoing sparse all-to-all message. Borrows the payload; the adapter
/// copies it onto the wire.
#[derive(Debug, Clone, Copy)]
pub struct SendMessage<'a> {
    pub data: &'a [u8],
    pub dest: CurrentRank,
}

/// A received sparse all-to-all message with an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvMessage {
    pub data: Vec<u8>,
    pub src: CurrentRank,
}

/// Reduction operators for the collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    fn identity(self) -> u64 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Min => u64::MAX,
            ReduceOp::Max => 0,
        }
    }

    fn apply(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

/// The rank translations retrieval planning needs.
///
/// Extracted as a trait so the transfer planner can be exercised against a
/// synthetic survivor set without building a group.
pub trait RankView {
    fn my_original_rank(&self) -> OriginalRank;
    fn my_current_rank(&self) -> CurrentRank;
    /// Current rank of an original rank, or `None` if it died.
    fn current_rank(&self, original: OriginalRank) -> Option<CurrentRank>;
}

/// Adapter over one rank's endpoint into the group.
pub struct GroupContext {
    endpoint: Endpoint,
    current: Group,
    original: Group,
    /// World ranks of the group captured at the previous
    /// [`GroupContext::ranks_died_since_last_call`] invocation.
    died_snapshot: Vec<usize>,
}

impl GroupContext {
    pub fn new(endpoint: Endpoint) -> Self {
        let world = endpoint.world();
        let died_snapshot = world.members().to_vec();
        Self {
            endpoint,
            current: world.clone(),
            original: world,
            died_snapshot,
        }
    }

    /// The current group handle.
    pub fn current_group(&self) -> &Group {
        &self.current
    }

    pub fn original_size(&self) -> usize {
        self.original.size()
    }

    pub fn current_size(&self) -> usize {
        self.current.size()
    }

    /// Original rank of the peer currently numbered `current`. Every
    /// current rank has one: the current group only ever shrinks away from
    /// the original group.
    pub fn original_rank(&self, current: CurrentRank) -> OriginalRank {
        let world = self.current.members()[current];
        self.original
            .rank_of_world(world)
            .expect("current rank has no counterpart in the original group")
    }

    /// Whether the peer with this original rank is still in the current
    /// group.
    pub fn is_alive(&self, original: OriginalRank) -> bool {
        self.current_rank(original).is_some()
    }

    /// Drops the dead ranks from `original_ranks`, preserving order.
    pub fn only_alive(&self, original_ranks: &[OriginalRank]) -> Vec<OriginalRank> {
        original_ranks
            .iter()
            .copied()
            .filter(|&r| self.is_alive(r))
            .collect()
    }

    /// Current ranks of the surviving entries of `original_ranks`.
    pub fn alive_current_ranks(&self, original_ranks: &[OriginalRank]) -> Vec<CurrentRank> {
        original_ranks
            .iter()
            .filter_map(|&r| self.current_rank(r))
            .collect()
    }

    pub fn num_failures_since_reset(&self) -> usize {
        self.original.size() - self.current.size()
    }

    /// Original ranks that died since the previous invocation (or since
    /// construction, for the first call). Updates the snapshot.
    pub fn ranks_died_since_last_call(&mut self) -> Vec<OriginalRank> {
        let died: Vec<OriginalRank> = self
            .died_snapshot
            .iter()
            .filter(|&&w| self.current.rank_of_world(w).is_none())
            .filter_map(|&w| self.original.rank_of_world(w))
            .collect();
        self.died_snapshot = self.current.members().to_vec();
        died
    }

    /// Makes the current group the new original group. Invoked at the start
    /// of every submission.
    pub fn reset_original_to_current(&mut self) {
        self.original = self.current.clone();
    }

    /// Installs a new group handle, e.g. one obtained out-of-band after a
    /// failure.
    pub fn update_comm(&mut self, group: Group) {
        log::debug!(
            "rank {:?}: installing new group handle with {} members",
            self.endpoint.rank(&group),
            group.size()
        );
        self.current = group;
    }

    /// Rebuilds the current group from its survivors.
    pub fn shrink_comm(&mut self) -> Result<()> {
        let shrunk = self.endpoint.shrink(&self.current)?;
        log::debug!(
            "rank {:?}: shrunk group from {} to {} members",
            self.endpoint.rank(&shrunk),
            self.current.size(),
            shrunk.size()
        );
        self.current = shrunk;
        Ok(())
    }

    /// Revokes the current group handle on all members.
    pub fn revoke_comm(&self) {
        self.endpoint.revoke(&self.current);
    }

    /// Sparse all-to-all: posts zero or more messages, returns every
    /// message addressed to this peer.
    ///
    /// Protocol: post all sends, probe-and-receive until the local sends
    /// complete, then enter a non-blocking barrier and keep probing until
    /// it completes. Once every peer passed the barrier, every in-flight
    /// message has been drained.
    pub fn sparse_all_to_all(
        &mut self,
        messages: &[SendMessage<'_>],
        tag: u16,
    ) -> Result<Vec<RecvMessage>> {
        for message in messages {
            self.endpoint
                .send(&self.current, message.dest, tag, message.data.to_vec())?;
        }
        let mut received = Vec::new();
        let token = self.endpoint.barrier_begin(&self.current)?;
        loop {
            while let Some((src, data)) = self.endpoint.try_recv(&self.current, tag)? {
                received.push(RecvMessage { data, src });
            }
            if self.endpoint.barrier_test(&token)? {
                break;
            }
            std::thread::yield_now();
        }
        // The barrier only completes after every peer posted its sends, so
        // one last drain picks up everything that was still in flight.
        while let Some((src, data)) = self.endpoint.try_recv(&self.current, tag)? {
            received.push(RecvMessage { data, src });
        }
        Ok(received)
    }

    /// Broadcast `data` from `root` to every member.
    pub fn broadcast(&mut self, root: CurrentRank, data: &mut Vec<u8>) -> Result<()> {
        if self.my_current_rank() == root {
            for rank in 0..self.current.size() {
                if rank != root {
                    self.endpoint
                        .send(&self.current, rank, COLLECTIVE_TAG, data.clone())?;
                }
            }
        } else {
            *data = self.endpoint.recv_from(&self.current, root, COLLECTIVE_TAG)?;
        }
        Ok(())
    }

    /// Gathers one byte string per member, indexed by current rank.
    pub fn allgather_bytes(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let me = self.my_current_rank();
        let size = self.current.size();
        for rank in 0..size {
            if rank != me {
                self.endpoint
                    .send(&self.current, rank, COLLECTIVE_TAG, data.to_vec())?;
            }
        }
        let mut gathered = vec![Vec::new(); size];
        gathered[me] = data.to_vec();
        for rank in 0..size {
            if rank != me {
                gathered[rank] = self.endpoint.recv_from(&self.current, rank, COLLECTIVE_TAG)?;
            }
        }
        Ok(gathered)
    }

    /// Gathers one `u64` per member, indexed by current rank.
    pub fn allgather_u64(&mut self, value: u64) -> Result<Vec<u64>> {
        let gathered = self.allgather_bytes(&value.to_le_bytes())?;
        gathered
            .into_iter()
            .map(|bytes| {
                let array: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::MalformedMessage("allgather element is not 8 bytes".into()))?;
                Ok(u64::from_le_bytes(array))
            })
            .collect()
    }

    /// Reduces one `u64` per member down to a single value on every member.
    pub fn allreduce_u64(&mut self, value: u64, op: ReduceOp) -> Result<u64> {
        let gathered = self.allgather_u64(value)?;
        Ok(gathered.into_iter().fold(op.identity(), |a, b| op.apply(a, b)))
    }

    /// Exclusive prefix reduction over current ranks. Rank 0 gets the
    /// operator identity.
    pub fn exscan_u64(&mut self, value: u64, op: ReduceOp) -> Result<u64> {
        let me = self.my_current_rank();
        let gathered = self.allgather_u64(value)?;
        Ok(gathered[..me]
            .iter()
            .fold(op.identity(), |a, &b| op.apply(a, b)))
    }

    /// Gathers a variable number of `u64`s per member onto `root`, in rank
    /// order. Non-root members get an empty vector.
    pub fn gatherv_u64(&mut self, data: &[u64], root: CurrentRank) -> Result<Vec<u64>> {
        let me = self.my_current_rank();
        if me != root {
            self.endpoint
                .send(&self.current, root, COLLECTIVE_TAG, encode_u64s(data))?;
            return Ok(Vec::new());
        }
        let mut gathered = Vec::new();
        for rank in 0..self.current.size() {
            if rank == root {
                gathered.extend_from_slice(data);
            } else {
                let bytes = self.endpoint.recv_from(&self.current, rank, COLLECTIVE_TAG)?;
                gathered.extend(decode_u64s(&bytes)?);
            }
        }
        Ok(gathered)
    }

    /// Exchanges one `u64` with every member; `sends[i]` goes to current
    /// rank `i`, the result is indexed by source.
    pub fn alltoall_u64(&mut self, sends: &[u64]) -> Result<Vec<u64>> {
        let exchanged =
            self.alltoallv_bytes(sends.iter().map(|v| v.to_le_bytes().to_vec()).collect())?;
        exchanged
            .into_iter()
            .map(|bytes| {
                let array: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::MalformedMessage("alltoall element is not 8 bytes".into()))?;
                Ok(u64::from_le_bytes(array))
            })
            .collect()
    }

    /// Exchanges one byte string with every member; `sends[i]` goes to
    /// current rank `i`, the result is indexed by source.
    pub fn alltoallv_bytes(&mut self, sends: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let me = self.my_current_rank();
        let size = self.current.size();
        if sends.len() != size {
            return Err(Error::InvalidArgument(format!(
                "alltoall expects one send per member, got {} for a group of {}",
                sends.len(),
                size
            )));
        }
        let mut received = vec![Vec::new(); size];
        for (rank, data) in sends.into_iter().enumerate() {
            if rank == me {
                received[me] = data;
            } else {
                self.endpoint.send(&self.current, rank, COLLECTIVE_TAG, data)?;
            }
        }
        for (rank, slot) in received.iter_mut().enumerate() {
            if rank != me {
                *slot = self.endpoint.recv_from(&self.current, rank, COLLECTIVE_TAG)?;
            }
        }
        Ok(received)
    }

    /// Fault-tolerant agreement barrier: completes among the survivors even
    /// if members died.
    pub fn agree(&mut self) -> Result<()> {
        self.endpoint.agree(&self.current)?;
        Ok(())
    }

    /// Plain barrier over the current group.
    pub fn barrier(&mut self) -> Result<()> {
        self.endpoint.barrier(&self.current)?;
        Ok(())
    }
}

impl RankView for GroupContext {
    fn my_original_rank(&self) -> OriginalRank {
        self.endpoint
            .rank(&self.original)
            .expect("local peer is not a member of its own original group")
    }

    fn my_current_rank(&self) -> CurrentRank {
        self.endpoint
            .rank(&self.current)
            .expect("local peer is not a member of the current group")
    }

    fn current_rank(&self, original: OriginalRank) -> Option<CurrentRank> {
        self.original
            .members()
            .get(original)
            .and_then(|&world| self.current.rank_of_world(world))
    }
}

fn encode_u64s(values: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_u64s(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::MalformedMessage(
            "u64 array message length is not a multiple of 8".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}
