//! The store façade: configuration, lifecycle, and the public
//! submit/push/pull surface.
//!
//! One exclusive lock (the storage lock) guards the per-submission state —
//! distribution, permutation, and serialized storage — so a store runs at
//! most one submission or retrieval at a time. A background submission
//! takes ownership of that state for the whole exchange; retrievals block
//! until it lands.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use rankmesh::{Endpoint, Group};

use crate::comm::{GroupContext, OriginalRank, RankView};
use crate::config::{OffsetMode, PermutationKind, StoreConfig};
use crate::distribution::BlockDistribution;
use crate::error::{Error, Result};
use crate::permutation::Permutation;
use crate::retrieval::{self, BlockRangeRequest, RangedRequest};
use crate::storage::SerializedBlockStorage;
use crate::submission::{self, BlockStream, NextBlock, SendBuffers};
use crate::BlockId;

/// Everything one submission epoch builds: the placement function, the id
/// permutation, and the local replica bytes.
struct EpochState {
    distribution: BlockDistribution,
    permutation: Permutation,
    storage: SerializedBlockStorage,
}

enum SubmitState {
    /// Nothing submitted, or the last submission was torn down by a fault.
    Absent,
    /// A background submission owns the state.
    InProgress,
    /// Blocks are submitted and retrievable.
    Ready(Box<EpochState>),
}

struct Shared {
    comm: Mutex<GroupContext>,
    state: Mutex<SubmitState>,
    state_changed: Condvar,
}

/// A replicated in-memory block store bound to one rank's endpoint.
pub struct Store {
    config: StoreConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl Store {
    /// Creates a store over `endpoint` after validating `config`.
    pub fn new(endpoint: Endpoint, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                comm: Mutex::new(GroupContext::new(endpoint)),
                state: Mutex::new(SubmitState::Absent),
                state_changed: Condvar::new(),
            }),
            worker: None,
        })
    }

    /// Number of peers holding a copy of every block.
    pub fn replication_level(&self) -> u16 {
        self.config.replication_level
    }

    /// The offset mode and constant block size.
    pub fn offset_mode(&self) -> (OffsetMode, usize) {
        (self.config.offset_mode, self.config.const_offset)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Installs a group handle obtained out-of-band, e.g. after the
    /// application rebuilt the communicator itself.
    pub fn update_comm(&self, group: Group) {
        self.shared.comm.lock().unwrap().update_comm(group);
    }

    /// Rebuilds the current group from its survivors.
    pub fn shrink_comm(&self) -> Result<()> {
        self.shared.comm.lock().unwrap().shrink_comm()
    }

    /// Original ranks that died since this was last called.
    pub fn ranks_died_since_last_call(&self) -> Vec<OriginalRank> {
        self.shared.comm.lock().unwrap().ranks_died_since_last_call()
    }

    /// Submits this peer's share of a globally `total_blocks`-sized block
    /// set and replicates it across the group.
    ///
    /// Every peer must call this collectively. `serialize` is invoked once
    /// per block even when the block has several holders; `next_block`
    /// yields `(id, value)` pairs until it returns `None`. Resubmitting
    /// replaces the previous submission wholesale.
    ///
    /// With `background = true` the exchange-and-store phase runs on a
    /// worker thread holding the storage lock; use
    /// [`Store::poll_submit_finished`] or [`Store::wait_submit_finished`]
    /// to observe completion. `parallel` advertises that `serialize` may
    /// run on several blocks concurrently; parallel serialization is not
    /// implemented and the flag is ignored.
    pub fn submit_blocks<B, S, P>(
        &mut self,
        serialize: S,
        next_block: P,
        total_blocks: u64,
        background: bool,
        parallel: bool,
    ) -> Result<()>
    where
        S: FnMut(&B, &mut BlockStream<'_>),
        P: FnMut() -> Option<NextBlock<B>>,
    {
        let _ = parallel;
        if total_blocks < 2 {
            return Err(Error::InvalidArgument(format!(
                "cannot submit {} blocks; replication needs at least 2",
                total_blocks
            )));
        }
        if self.config.offset_mode != OffsetMode::Constant {
            return Err(Error::InvalidArgument(
                "lookup-table offset mode is not implemented".into(),
            ));
        }

        // A still-running background submission is superseded; its outcome
        // only matters as a log line.
        if let Err(err) = self.wait_submit_finished() {
            log::warn!("previous background submission failed: {}", err);
        }

        let mut comm = self.shared.comm.lock().unwrap();
        if self.config.replication_level as usize > comm.current_size() {
            return Err(Error::InvalidArgument(format!(
                "replication level {} exceeds the group size {}",
                self.config.replication_level,
                comm.current_size()
            )));
        }

        // From here on the previous submission is gone; a fault below
        // leaves the store empty rather than half-updated.
        *self.shared.state.lock().unwrap() = SubmitState::Absent;
        self.shared.state_changed.notify_all();

        comm.reset_original_to_current();
        let num_peers = comm.current_size();
        log::debug!(
            "submitting {} blocks over {} peers, replication {}",
            total_blocks,
            num_peers,
            self.config.replication_level
        );

        let distribution =
            BlockDistribution::new(total_blocks, num_peers, self.config.replication_level)?;
        let permutation = match self.config.permutation {
            PermutationKind::Identity => Permutation::identity(total_blocks),
            PermutationKind::Feistel => Permutation::range_feistel(
                total_blocks,
                self.config.bucket_size,
                self.config.seed,
            ),
        };
        let storage = SerializedBlockStorage::new(
            &distribution,
            self.config.const_offset,
            comm.my_original_rank(),
        );
        let mut epoch = EpochState {
            distribution,
            permutation,
            storage,
        };

        let buffers = submission::serialize_blocks_for_transmission(
            &epoch.distribution,
            &epoch.permutation,
            self.config.const_offset,
            serialize,
            next_block,
        )?;

        if background {
            drop(comm);
            *self.shared.state.lock().unwrap() = SubmitState::InProgress;
            let shared = Arc::clone(&self.shared);
            self.worker = Some(thread::spawn(move || {
                let mut comm = shared.comm.lock().unwrap();
                let result = exchange_and_store(&mut comm, &mut epoch, buffers);
                drop(comm);
                let mut state = shared.state.lock().unwrap();
                *state = match &result {
                    Err(Error::Fault) => SubmitState::Absent,
                    _ => SubmitState::Ready(Box::new(epoch)),
                };
                drop(state);
                shared.state_changed.notify_all();
                result
            }));
            Ok(())
        } else {
            let result = exchange_and_store(&mut comm, &mut epoch, buffers);
            drop(comm);
            let mut state = self.shared.state.lock().unwrap();
            *state = match &result {
                Err(Error::Fault) => SubmitState::Absent,
                _ => SubmitState::Ready(Box::new(epoch)),
            };
            drop(state);
            self.shared.state_changed.notify_all();
            result
        }
    }

    /// Whether the background submission has finished. Joins the worker
    /// and surfaces its outcome when it has; immediately true when no
    /// background submission is running.
    pub fn poll_submit_finished(&mut self) -> Result<bool> {
        let finished = match &self.worker {
            None => return Ok(true),
            Some(handle) => handle.is_finished(),
        };
        if finished {
            self.wait_submit_finished().map(|()| true)
        } else {
            Ok(false)
        }
    }

    /// Blocks until the background submission finished and surfaces its
    /// outcome. A no-op when none is running.
    pub fn wait_submit_finished(&mut self) -> Result<()> {
        match self.worker.take() {
            None => Ok(()),
            Some(handle) => handle.join().expect("background submission panicked"),
        }
    }

    /// Ships the requested ranges to their destinations and hands every
    /// block addressed to this peer to `handle` as
    /// `(serialized bytes, user block id)`, in ascending internal id
    /// order.
    ///
    /// All peers must pass the same request list. The borrowed bytes are
    /// only valid for the duration of the callback.
    pub fn push_blocks<F>(&self, requests: &[RangedRequest], handle: F) -> Result<()>
    where
        F: FnMut(&[u8], BlockId),
    {
        let state = self.lock_submitted()?;
        let epoch = match &*state {
            SubmitState::Ready(epoch) => epoch,
            _ => unreachable!("lock_submitted only returns Ready states"),
        };
        let mut comm = self.shared.comm.lock().unwrap();
        let result = retrieval::push_blocks(
            &mut comm,
            &epoch.distribution,
            &epoch.permutation,
            &epoch.storage,
            requests,
            handle,
        );
        if matches!(result, Err(Error::UnrecoverableDataLoss)) {
            log::warn!("push: a requested range has no surviving replica");
        }
        result
    }

    /// Fetches the given ranges for this peer only and hands every block
    /// to `handle` as `(serialized bytes, user block id)`, in ascending
    /// internal id order.
    ///
    /// Unlike [`Store::push_blocks`], peers do not need to know each
    /// other's requests; an extra request round tells the serving peers
    /// who wants what. Must still be called collectively by all peers.
    pub fn pull_blocks<F>(&self, ranges: &[BlockRangeRequest], handle: F) -> Result<()>
    where
        F: FnMut(&[u8], BlockId),
    {
        let state = self.lock_submitted()?;
        let epoch = match &*state {
            SubmitState::Ready(epoch) => epoch,
            _ => unreachable!("lock_submitted only returns Ready states"),
        };
        let mut comm = self.shared.comm.lock().unwrap();
        let result = retrieval::pull_blocks(
            &mut comm,
            &epoch.distribution,
            &epoch.permutation,
            &epoch.storage,
            ranges,
            handle,
        );
        if matches!(result, Err(Error::UnrecoverableDataLoss)) {
            log::warn!("pull: a requested range has no surviving replica");
        }
        result
    }

    /// Takes the storage lock, waiting out any background submission.
    /// Fails with `UnrecoverableDataLoss` when no submission is present —
    /// either none happened or the last one was torn down by a fault.
    fn lock_submitted(&self) -> Result<MutexGuard<'_, SubmitState>> {
        let mut state = self.shared.state.lock().unwrap();
        while matches!(&*state, SubmitState::InProgress) {
            state = self.shared.state_changed.wait(state).unwrap();
        }
        if matches!(&*state, SubmitState::Absent) {
            return Err(Error::UnrecoverableDataLoss);
        }
        Ok(state)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Steps 6–7 of a submission: the sparse exchange and materializing the
/// received frames into local storage.
fn exchange_and_store(
    ctx: &mut GroupContext,
    epoch: &mut EpochState,
    buffers: SendBuffers,
) -> Result<()> {
    let received = submission::exchange_data(ctx, buffers)?;
    // Phase barrier: traffic of whatever comes next must not reach this
    // exchange's probes.
    ctx.agree()?;

    let const_offset = epoch.storage.const_offset();
    let num_blocks = epoch.distribution.num_blocks();
    for message in &received {
        submission::parse_incoming_message(&message.data, const_offset, |first, last, payload| {
            if last >= num_blocks {
                return Err(Error::MalformedMessage(format!(
                    "received frame {}..={} beyond the id space [0, {})",
                    first, last, num_blocks
                )));
            }
            write_run(epoch, first, last, payload)
        })?;
    }
    log::debug!("stored {} incoming submission messages", received.len());
    Ok(())
}

/// Writes one received frame, splitting it at distribution range borders:
/// a frame may span several ranges when this peer holds adjacent ones.
fn write_run(epoch: &mut EpochState, first: BlockId, last: BlockId, payload: &[u8]) -> Result<()> {
    let const_offset = epoch.storage.const_offset();
    let mut id = first;
    let mut offset = 0;
    while id <= last {
        let range = epoch.distribution.range_of_block(id);
        let piece_last = last.min(range.end() - 1);
        let piece_bytes = (piece_last - id + 1) as usize * const_offset;
        epoch
            .storage
            .write_consecutive_blocks(id, piece_last, &payload[offset..offset + piece_bytes])?;
        offset += piece_bytes;
        id = piece_last + 1;
    }
    Ok(())
}
