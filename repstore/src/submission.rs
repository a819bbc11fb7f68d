//! Submission protocol: serializing blocks into per-peer send buffers and
//! exchanging them.
//!
//! Wire format of one submission message: a concatenation of frames, each
//!
//! ```text
//! first_id: u64 LE ∥ last_id: u64 LE ∥ (last_id - first_id + 1) * K payload bytes
//! ```
//!
//! with `first_id` and `last_id` inclusive internal ids. Consecutive
//! internal ids extend the open frame in place (the `last_id` field is
//! patched), so dense submissions pay the header once per run.

use crate::comm::{GroupContext, OriginalRank, RankView, RecvMessage, SendMessage, SUBMISSION_TAG};
use crate::distribution::BlockDistribution;
use crate::error::{Error, Result};
use crate::permutation::Permutation;
use crate::BlockId;

/// Size of a frame header in bytes: two little-endian `u64` ids.
pub const FRAME_HEADER_SIZE: usize = 16;

/// The next block a producer hands to the submission loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextBlock<B> {
    /// User-visible block id.
    pub id: BlockId,
    /// The block value to serialize.
    pub block: B,
}

/// Fixed-size serialization target for one block.
///
/// A serializer may write fewer than `limit` bytes (the rest is
/// zero-padded) but never more; overruns are reported when the block is
/// finished.
pub struct BlockStream<'a> {
    buf: &'a mut Vec<u8>,
    limit: usize,
    written: usize,
}

impl<'a> BlockStream<'a> {
    fn new(buf: &'a mut Vec<u8>, limit: usize) -> Self {
        buf.clear();
        Self {
            buf,
            limit,
            written: 0,
        }
    }

    /// Appends `bytes` to the block's serialized form.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let room = self.limit.saturating_sub(self.written);
        self.buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
        self.written += bytes.len();
    }

    /// Bytes written so far, including any overrun.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Pads the block to `limit` bytes, or reports an overrun.
    fn finish(self, block_id: BlockId) -> Result<()> {
        if self.written > self.limit {
            return Err(Error::BlockTooLarge {
                block_id,
                written: self.written,
                limit: self.limit,
            });
        }
        self.buf.resize(self.limit, 0);
        Ok(())
    }
}

struct OpenFrame {
    /// Byte offset of the frame header inside the buffer.
    header_pos: usize,
    /// Internal id that would extend this frame.
    next_id: BlockId,
}

struct FrameBuffer {
    data: Vec<u8>,
    open: Option<OpenFrame>,
}

/// One growable framed buffer per original rank.
pub struct SendBuffers {
    bufs: Vec<FrameBuffer>,
}

impl SendBuffers {
    pub fn new(num_peers: usize) -> Self {
        Self {
            bufs: (0..num_peers)
                .map(|_| FrameBuffer {
                    data: Vec::new(),
                    open: None,
                })
                .collect(),
        }
    }

    /// Appends the serialized bytes of internal block `id` to the buffer
    /// destined for `dest`.
    pub fn append_block(&mut self, dest: OriginalRank, id: BlockId, payload: &[u8]) {
        let buf = &mut self.bufs[dest];
        let extends = matches!(&buf.open, Some(frame) if frame.next_id == id);
        if extends {
            let frame = buf.open.as_mut().unwrap();
            frame.next_id = id + 1;
            let pos = frame.header_pos + 8;
            buf.data.extend_from_slice(payload);
            buf.data[pos..pos + 8].copy_from_slice(&id.to_le_bytes());
        } else {
            let header_pos = buf.data.len();
            buf.data.extend_from_slice(&id.to_le_bytes());
            buf.data.extend_from_slice(&id.to_le_bytes());
            buf.data.extend_from_slice(payload);
            buf.open = Some(OpenFrame {
                header_pos,
                next_id: id + 1,
            });
        }
    }

    /// The framed bytes destined for `rank`.
    pub fn buffer(&self, rank: OriginalRank) -> &[u8] {
        &self.bufs[rank].data
    }

    fn into_buffers(self) -> Vec<Vec<u8>> {
        self.bufs.into_iter().map(|b| b.data).collect()
    }
}

/// Pulls blocks from `next_block`, serializes each exactly once, and
/// appends it to the buffer of every holder of its internal id.
pub fn serialize_blocks_for_transmission<B, S, P>(
    distribution: &BlockDistribution,
    permutation: &Permutation,
    const_offset: usize,
    mut serialize: S,
    mut next_block: P,
) -> Result<SendBuffers>
where
    S: FnMut(&B, &mut BlockStream<'_>),
    P: FnMut() -> Option<NextBlock<B>>,
{
    let mut buffers = SendBuffers::new(distribution.num_peers());
    let mut scratch = Vec::with_capacity(const_offset);
    let mut num_blocks = 0u64;
    while let Some(NextBlock { id, block }) = next_block() {
        if id >= distribution.num_blocks() {
            return Err(Error::InvalidArgument(format!(
                "block id {} is outside the submitted id space [0, {})",
                id,
                distribution.num_blocks()
            )));
        }
        let internal = permutation.apply(id);
        let mut stream = BlockStream::new(&mut scratch, const_offset);
        serialize(&block, &mut stream);
        stream.finish(id)?;
        for &holder in distribution.ranks_holding_block(internal) {
            buffers.append_block(holder, internal, &scratch);
        }
        num_blocks += 1;
    }
    log::debug!("serialized {} local blocks for transmission", num_blocks);
    Ok(buffers)
}

/// Ships the send buffers to the current ranks of their destinations and
/// returns everything addressed to this peer.
///
/// Buffers aimed at dead peers are dropped: whether a block still has a
/// surviving holder is decided at retrieval, not here. The buffers are
/// freed on return, capping peak memory at one copy plus in-flight
/// messages.
pub fn exchange_data(ctx: &mut GroupContext, buffers: SendBuffers) -> Result<Vec<RecvMessage>> {
    let bufs = buffers.into_buffers();
    let mut messages = Vec::new();
    for (original, data) in bufs.iter().enumerate() {
        if data.is_empty() {
            continue;
        }
        if let Some(dest) = ctx.current_rank(original) {
            messages.push(SendMessage { data, dest });
        }
    }
    log::debug!("submission exchange: {} outgoing messages", messages.len());
    ctx.sparse_all_to_all(&messages, SUBMISSION_TAG)
}

/// Walks the frames of one received submission message, handing each
/// `(first_id, last_id, payload)` run to `f`.
pub fn parse_incoming_message<F>(data: &[u8], const_offset: usize, mut f: F) -> Result<()>
where
    F: FnMut(BlockId, BlockId, &[u8]) -> Result<()>,
{
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < FRAME_HEADER_SIZE {
            return Err(Error::MalformedMessage("truncated frame header".into()));
        }
        let first = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        let last = u64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
        pos += FRAME_HEADER_SIZE;
        if last < first {
            return Err(Error::MalformedMessage(format!(
                "frame ids {}..={} are reversed",
                first, last
            )));
        }
        let payload_len = (last - first + 1) as usize * const_offset;
        if data.len() - pos < payload_len {
            return Err(Error::MalformedMessage("truncated frame payload".into()));
        }
        f(first, last, &data[pos..pos + payload_len])?;
        pos += payload_len;
    }
    Ok(())
}
