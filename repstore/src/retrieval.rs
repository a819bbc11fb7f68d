//! Retrieval protocol: planning and executing block transfers.
//!
//! Both entry points share one pipeline: user ranges are projected into
//! internal ids, split along distribution ranges, and each sub-range is
//! assigned a *serving rank* — the first surviving holder. Peers that serve
//! concatenate the raw block payloads per destination (no framing; the
//! receiver's plan supplies the boundaries), exchange them sparsely, and
//! receivers deliver each block to the user callback in ascending internal
//! id order.
//!
//! `push` requests name both the range and the destination, so every peer
//! can plan both sides locally. `pull` requests name only the caller's own
//! desires; an extra request round tells the serving peers who wants what.
//! Its wire format is a packed array of
//! `(first_id: u64, length: u64, requester: u32)` little-endian records.

use std::collections::HashMap;

use crate::comm::{
    CurrentRank, GroupContext, OriginalRank, RankView, RecvMessage, SendMessage, BLOCK_DATA_TAG,
    PULL_REQUEST_TAG,
};
use crate::distribution::{BlockDistribution, BlockRange};
use crate::error::{Error, Result};
use crate::permutation::Permutation;
use crate::storage::SerializedBlockStorage;
use crate::BlockId;

/// A block range in user id space: first id and number of blocks.
pub type BlockRangeRequest = (BlockId, u64);

/// A range plus the current rank that wants it.
pub type RangedRequest = (BlockRangeRequest, CurrentRank);

/// Size of one pull-request record on the wire.
pub const PULL_RECORD_SIZE: usize = 20;

/// An internal-id span paired with a peer: the destination on the send
/// side, the source on the receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transfer {
    pub first: BlockId,
    pub len: u64,
    pub peer: CurrentRank,
}

/// Splits a user range at bucket boundaries and projects each piece into
/// internal id space. Within a bucket the permutation preserves
/// consecutive ids, so each piece stays one contiguous internal run.
pub(crate) fn project_range(
    permutation: &Permutation,
    first: BlockId,
    len: u64,
) -> Vec<(BlockId, u64)> {
    let bucket = permutation.bucket_size();
    let end = first + len;
    let mut pieces = Vec::new();
    let mut id = first;
    while id < end {
        let bucket_end = (id / bucket + 1) * bucket;
        let piece_end = end.min(bucket_end);
        pieces.push((permutation.apply(id), piece_end - id));
        id = piece_end;
    }
    pieces
}

/// The first surviving holder of `range`, which all peers agree serves it.
fn serving_rank<V: RankView>(
    distribution: &BlockDistribution,
    range: &BlockRange,
    view: &V,
) -> Result<OriginalRank> {
    distribution
        .ranks_holding_range(range)
        .iter()
        .copied()
        .find(|&rank| view.current_rank(rank).is_some())
        .ok_or(Error::UnrecoverableDataLoss)
}

/// Computes this peer's send and receive sets for `requests`.
///
/// Every peer runs the same computation over the same requests (push) or
/// its own requests (pull), so the sets pair up across peers without
/// negotiation. Both sets come back sorted by `(peer, first)`.
pub(crate) fn plan_transfers<V: RankView>(
    distribution: &BlockDistribution,
    permutation: &Permutation,
    requests: &[RangedRequest],
    view: &V,
) -> Result<(Vec<Transfer>, Vec<Transfer>)> {
    let my_original = view.my_original_rank();
    let my_current = view.my_current_rank();
    let mut send_set = Vec::new();
    let mut recv_set = Vec::new();

    for &((user_first, user_len), dest) in requests {
        if user_len == 0 {
            continue;
        }
        if user_first + user_len > distribution.num_blocks() {
            return Err(Error::InvalidArgument(format!(
                "requested range [{}, {}) exceeds the submitted id space [0, {})",
                user_first,
                user_first + user_len,
                distribution.num_blocks()
            )));
        }
        for (piece_first, piece_len) in project_range(permutation, user_first, user_len) {
            let piece_end = piece_first + piece_len;
            let mut id = piece_first;
            while id < piece_end {
                let range = distribution.range_of_block(id);
                let sub_end = piece_end.min(range.end());
                let serving = serving_rank(distribution, &range, view)?;
                if serving == my_original {
                    send_set.push(Transfer {
                        first: id,
                        len: sub_end - id,
                        peer: dest,
                    });
                }
                if dest == my_current {
                    let serving_current = view
                        .current_rank(serving)
                        .expect("serving rank was chosen among the survivors");
                    recv_set.push(Transfer {
                        first: id,
                        len: sub_end - id,
                        peer: serving_current,
                    });
                }
                id = sub_end;
            }
        }
    }

    send_set.sort_by_key(|t| (t.peer, t.first));
    recv_set.sort_by_key(|t| (t.peer, t.first));
    Ok((send_set, recv_set))
}

/// Serves push requests and delivers the blocks this peer asked for.
pub fn push_blocks<F>(
    ctx: &mut GroupContext,
    distribution: &BlockDistribution,
    permutation: &Permutation,
    storage: &SerializedBlockStorage,
    requests: &[RangedRequest],
    handle: F,
) -> Result<()>
where
    F: FnMut(&[u8], BlockId),
{
    let (send_set, recv_set) = plan_transfers(distribution, permutation, requests, ctx)?;
    log::debug!(
        "push: serving {} spans, expecting {} spans",
        send_set.len(),
        recv_set.len()
    );
    exchange_and_deliver(ctx, permutation, storage, &send_set, &recv_set, handle)
}

/// Requests `ranges` for this peer only and delivers the blocks.
pub fn pull_blocks<F>(
    ctx: &mut GroupContext,
    distribution: &BlockDistribution,
    permutation: &Permutation,
    storage: &SerializedBlockStorage,
    ranges: &[BlockRangeRequest],
    handle: F,
) -> Result<()>
where
    F: FnMut(&[u8], BlockId),
{
    let my_current = ctx.my_current_rank();
    let requests: Vec<RangedRequest> = ranges.iter().map(|&range| (range, my_current)).collect();
    // Only the receive side of the local plan is meaningful: the serving
    // peers learn their send sets from the request exchange below.
    let (_, recv_set) = plan_transfers(distribution, permutation, &requests, ctx)?;

    let request_buffers = encode_pull_requests(&recv_set, my_current);
    let request_messages: Vec<SendMessage<'_>> = request_buffers
        .iter()
        .map(|(peer, data)| SendMessage {
            data,
            dest: *peer,
        })
        .collect();
    let incoming = ctx.sparse_all_to_all(&request_messages, PULL_REQUEST_TAG)?;
    let mut send_set = decode_pull_requests(&incoming)?;
    send_set.sort_by_key(|t| (t.peer, t.first));
    log::debug!(
        "pull: {} spans requested from this peer, expecting {} spans",
        send_set.len(),
        recv_set.len()
    );

    // Separate the request round from the data round, so data probes never
    // pick up a straggler's request bytes.
    ctx.agree()?;

    exchange_and_deliver(ctx, permutation, storage, &send_set, &recv_set, handle)
}

/// Groups the receive set by serving peer into packed request messages.
fn encode_pull_requests(
    recv_set: &[Transfer],
    requester: CurrentRank,
) -> Vec<(CurrentRank, Vec<u8>)> {
    let mut buffers: Vec<(CurrentRank, Vec<u8>)> = Vec::new();
    for transfer in recv_set {
        if !matches!(buffers.last(), Some((peer, _)) if *peer == transfer.peer) {
            buffers.push((transfer.peer, Vec::new()));
        }
        append_pull_record(&mut buffers.last_mut().unwrap().1, transfer, requester);
    }
    buffers
}

fn append_pull_record(data: &mut Vec<u8>, transfer: &Transfer, requester: CurrentRank) {
    data.extend_from_slice(&transfer.first.to_le_bytes());
    data.extend_from_slice(&transfer.len.to_le_bytes());
    data.extend_from_slice(&(requester as u32).to_le_bytes());
}

fn decode_pull_requests(messages: &[RecvMessage]) -> Result<Vec<Transfer>> {
    let mut send_set = Vec::new();
    for message in messages {
        if message.data.len() % PULL_RECORD_SIZE != 0 {
            return Err(Error::MalformedMessage(format!(
                "pull request message from rank {} is not a whole number of records",
                message.src
            )));
        }
        for record in message.data.chunks_exact(PULL_RECORD_SIZE) {
            let first = u64::from_le_bytes(record[0..8].try_into().unwrap());
            let len = u64::from_le_bytes(record[8..16].try_into().unwrap());
            let requester = u32::from_le_bytes(record[16..20].try_into().unwrap());
            send_set.push(Transfer {
                first,
                len,
                peer: requester as CurrentRank,
            });
        }
    }
    Ok(send_set)
}

/// The shared data round: ship everything in `send_set`, pair incoming
/// bytes with `recv_set`, and deliver each block to `handle` with its user
/// id.
///
/// Within one outgoing message block payloads appear in `(dest, first)`
/// order, matching the receiver's `(src, first)`-sorted receive set; a
/// cursor per source pairs bytes with ids 1:1. Delivery walks the receive
/// set in ascending internal id order across sources.
fn exchange_and_deliver<F>(
    ctx: &mut GroupContext,
    permutation: &Permutation,
    storage: &SerializedBlockStorage,
    send_set: &[Transfer],
    recv_set: &[Transfer],
    mut handle: F,
) -> Result<()>
where
    F: FnMut(&[u8], BlockId),
{
    let const_offset = storage.const_offset();

    let mut outgoing: Vec<(CurrentRank, Vec<u8>)> = Vec::new();
    for transfer in send_set {
        if !matches!(outgoing.last(), Some((peer, _)) if *peer == transfer.peer) {
            outgoing.push((transfer.peer, Vec::new()));
        }
        let data = &mut outgoing.last_mut().unwrap().1;
        storage.for_all_blocks_in_range(transfer.first, transfer.len, |bytes| {
            data.extend_from_slice(bytes)
        });
    }
    let messages: Vec<SendMessage<'_>> = outgoing
        .iter()
        .map(|(peer, data)| SendMessage {
            data,
            dest: *peer,
        })
        .collect();

    let received = ctx.sparse_all_to_all(&messages, BLOCK_DATA_TAG)?;
    // Phase barrier: a peer done with this exchange must not leak its next
    // phase's messages into ours.
    ctx.agree()?;
    drop(messages);
    drop(outgoing);

    let mut cursors: HashMap<CurrentRank, (&[u8], usize)> = HashMap::new();
    for message in &received {
        if cursors.insert(message.src, (message.data.as_slice(), 0)).is_some() {
            return Err(Error::MalformedMessage(format!(
                "rank {} sent more than one data message",
                message.src
            )));
        }
    }

    let mut deliveries = recv_set.to_vec();
    deliveries.sort_by_key(|t| (t.first, t.peer));
    for transfer in &deliveries {
        let (data, offset) = cursors.get_mut(&transfer.peer).ok_or_else(|| {
            Error::MalformedMessage(format!("no data message from rank {}", transfer.peer))
        })?;
        let span = transfer.len as usize * const_offset;
        if data.len() - *offset < span {
            return Err(Error::MalformedMessage(format!(
                "data message from rank {} is shorter than planned",
                transfer.peer
            )));
        }
        let bytes = &data[*offset..*offset + span];
        *offset += span;
        for (index, block) in bytes.chunks_exact(const_offset).enumerate() {
            let internal = transfer.first + index as u64;
            handle(block, permutation.inverse(internal));
        }
    }

    for (src, (data, offset)) in &cursors {
        if *offset != data.len() {
            return Err(Error::MalformedMessage(format!(
                "data message from rank {} carries {} unplanned bytes",
                src,
                data.len() - offset
            )));
        }
    }

    Ok(())
}
