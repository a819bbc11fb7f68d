//! Rank groups, endpoints, and the shared registry.
//!
//! A group of `n` endpoints is created up front with [`create_group`]; each
//! endpoint is then moved onto its own thread. Endpoints exchange byte
//! messages addressed by rank relative to a [`Group`] handle. The initial
//! handle is [`Endpoint::world`]; after failures, survivors build a smaller
//! handle with [`Endpoint::shrink`].
//!
//! Failure semantics follow the fault-tolerant MPI model: once an endpoint
//! called [`Endpoint::fail`], every operation that involves it observes
//! [`MeshError::Fault`]. A revoked group handle fails every operation with
//! [`MeshError::Revoked`] until the caller switches to a new handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::mpsc::{MpscChannel, MpscChannelReceiver, MpscChannelSender, StdMpsc, TryRecvError};
use crate::{MeshError, Result};

/// A message in flight between two endpoints.
struct Envelope {
    /// World rank of the sender.
    src: usize,
    /// Epoch of the group handle the sender used.
    epoch: u64,
    /// Application tag.
    tag: u16,
    /// Owned payload.
    data: Vec<u8>,
}

/// A communicator handle: an epoch plus its member list.
///
/// Members are world ranks in ascending order; a member's position in the
/// list is its rank relative to this handle. Handles are cheap to clone and
/// remain valid snapshots even after further failures.
#[derive(Clone)]
pub struct Group {
    epoch: u64,
    members: Arc<Vec<usize>>,
}

impl Group {
    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Member world ranks, ascending.
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// Rank of `world_rank` relative to this handle, if it is a member.
    pub fn rank_of_world(&self, world_rank: usize) -> Option<usize> {
        self.members.binary_search(&world_rank).ok()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("epoch", &self.epoch)
            .field("members", &self.members)
            .finish()
    }
}

struct EpochInfo {
    members: Arc<Vec<usize>>,
    revoked: bool,
}

#[derive(Default)]
struct BarrierCell {
    arrived: HashSet<usize>,
    observed: HashSet<usize>,
}

struct RegistryState {
    /// Liveness per world rank.
    alive: Vec<bool>,
    /// All registered epochs.
    epochs: HashMap<u64, EpochInfo>,
    /// Memo so that every survivor arriving at the same member set gets
    /// the same epoch id, regardless of how many shrinks it took to get
    /// there.
    shrinks: HashMap<Vec<usize>, u64>,
    next_epoch: u64,
    /// In-progress barriers, keyed by (epoch, sequence number).
    barriers: HashMap<(u64, u64), BarrierCell>,
}

/// Token for a non-blocking barrier started with [`Endpoint::barrier_begin`].
pub struct BarrierToken {
    epoch: u64,
    seq: u64,
    group: Group,
}

/// One rank's endpoint into the group.
///
/// Not `Clone`: exactly one thread drives each endpoint, which is what makes
/// the per-rank receive queue safe without further locking.
pub struct Endpoint<M: MpscChannel = StdMpsc> {
    world_rank: usize,
    world: Group,
    senders: Vec<M::Sender<Envelope>>,
    rx: M::Receiver<Envelope>,
    state: Arc<Mutex<RegistryState>>,
    /// Messages drained from the channel but not yet claimed by a receive.
    pending: VecDeque<Envelope>,
    /// Next barrier sequence number per epoch.
    barrier_seq: HashMap<u64, u64>,
}

/// Creates a group of `n` endpoints over the default channel backend.
///
/// # Panics
/// Panics if `n` is 0.
pub fn create_group(n: usize) -> Vec<Endpoint<StdMpsc>> {
    create_group_with::<StdMpsc>(n)
}

/// Creates a group of `n` endpoints over a specific channel backend.
///
/// # Panics
/// Panics if `n` is 0.
pub fn create_group_with<M: MpscChannel>(n: usize) -> Vec<Endpoint<M>> {
    assert!(n > 0, "a group must have at least one rank");

    let mut senders = Vec::with_capacity(n);
    let mut receivers = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = M::channel();
        senders.push(tx);
        receivers.push(rx);
    }

    let members: Arc<Vec<usize>> = Arc::new((0..n).collect());
    let mut epochs = HashMap::new();
    epochs.insert(
        0,
        EpochInfo {
            members: Arc::clone(&members),
            revoked: false,
        },
    );
    let state = Arc::new(Mutex::new(RegistryState {
        alive: vec![true; n],
        epochs,
        shrinks: HashMap::new(),
        next_epoch: 1,
        barriers: HashMap::new(),
    }));

    receivers
        .into_iter()
        .enumerate()
        .map(|(world_rank, rx)| Endpoint {
            world_rank,
            world: Group {
                epoch: 0,
                members: Arc::clone(&members),
            },
            senders: senders.clone(),
            rx,
            state: Arc::clone(&state),
            pending: VecDeque::new(),
            barrier_seq: HashMap::new(),
        })
        .collect()
}

impl<M: MpscChannel> Endpoint<M> {
    /// The group handle covering every rank ever created.
    pub fn world(&self) -> Group {
        self.world.clone()
    }

    /// This endpoint's world rank.
    pub fn world_rank(&self) -> usize {
        self.world_rank
    }

    /// This endpoint's rank relative to `group`, if it is a member.
    pub fn rank(&self, group: &Group) -> Option<usize> {
        group.rank_of_world(self.world_rank)
    }

    /// Whether the member at `rank` (relative to `group`) is still alive.
    pub fn alive(&self, group: &Group, rank: usize) -> bool {
        let st = self.state.lock().unwrap();
        group
            .members
            .get(rank)
            .map(|&w| st.alive[w])
            .unwrap_or(false)
    }

    fn check_not_revoked(st: &RegistryState, group: &Group) -> Result<()> {
        if st.epochs[&group.epoch].revoked {
            Err(MeshError::Revoked)
        } else {
            Ok(())
        }
    }

    /// Sends `data` to the member at `dest` (relative to `group`).
    ///
    /// Sends are buffered and complete immediately; delivery happens when
    /// the destination drives one of its receive calls. Sending to a dead
    /// member fails with [`MeshError::Fault`]; sending to self is allowed.
    pub fn send(&self, group: &Group, dest: usize, tag: u16, data: Vec<u8>) -> Result<()> {
        let dest_world = {
            let st = self.state.lock().unwrap();
            Self::check_not_revoked(&st, group)?;
            let &dest_world = group.members.get(dest).ok_or(MeshError::InvalidRank)?;
            if !st.alive[dest_world] {
                return Err(MeshError::Fault);
            }
            dest_world
        };
        self.senders[dest_world]
            .send(Envelope {
                src: self.world_rank,
                epoch: group.epoch,
                tag,
                data,
            })
            .map_err(|_| MeshError::Fault)
    }

    /// Moves everything out of the channel into the pending queue.
    fn drain_channel(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(env) => self.pending.push_back(env),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn take_pending<F: Fn(&Envelope) -> bool>(&mut self, matches: F) -> Option<Envelope> {
        let idx = self.pending.iter().position(matches)?;
        self.pending.remove(idx)
    }

    /// Receives the next message with `tag` sent on `group`, if one is
    /// available. Returns the sender's rank relative to `group`.
    pub fn try_recv(&mut self, group: &Group, tag: u16) -> Result<Option<(usize, Vec<u8>)>> {
        {
            let st = self.state.lock().unwrap();
            Self::check_not_revoked(&st, group)?;
        }
        self.drain_channel();
        let epoch = group.epoch;
        match self.take_pending(|env| env.epoch == epoch && env.tag == tag) {
            Some(env) => {
                let src = group
                    .rank_of_world(env.src)
                    .expect("sender is not a member of its own epoch");
                Ok(Some((src, env.data)))
            }
            None => Ok(None),
        }
    }

    /// Receives the next message with `tag` from the member at `src`
    /// (relative to `group`), blocking until it arrives.
    ///
    /// Fails with [`MeshError::Fault`] if `src` dies before a message shows
    /// up.
    pub fn recv_from(&mut self, group: &Group, src: usize, tag: u16) -> Result<Vec<u8>> {
        let &src_world = group.members.get(src).ok_or(MeshError::InvalidRank)?;
        let epoch = group.epoch;
        loop {
            {
                let st = self.state.lock().unwrap();
                Self::check_not_revoked(&st, group)?;
            }
            self.drain_channel();
            if let Some(env) =
                self.take_pending(|env| env.epoch == epoch && env.tag == tag && env.src == src_world)
            {
                return Ok(env.data);
            }
            let src_alive = { self.state.lock().unwrap().alive[src_world] };
            if !src_alive {
                // One final drain so a message sent just before death is
                // still delivered.
                self.drain_channel();
                match self.take_pending(|env| {
                    env.epoch == epoch && env.tag == tag && env.src == src_world
                }) {
                    Some(env) => return Ok(env.data),
                    None => return Err(MeshError::Fault),
                }
            }
            std::thread::yield_now();
        }
    }

    /// Enters a barrier on `group` without blocking.
    ///
    /// All members of `group` must start the same barriers in the same
    /// order. Completion is polled with [`Endpoint::barrier_test`].
    pub fn barrier_begin(&mut self, group: &Group) -> Result<BarrierToken> {
        let seq = {
            let entry = self.barrier_seq.entry(group.epoch).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };
        let mut st = self.state.lock().unwrap();
        Self::check_not_revoked(&st, group)?;
        st.barriers
            .entry((group.epoch, seq))
            .or_default()
            .arrived
            .insert(self.world_rank);
        Ok(BarrierToken {
            epoch: group.epoch,
            seq,
            group: group.clone(),
        })
    }

    /// Tests a barrier for completion.
    ///
    /// Returns `Ok(true)` once every member has entered the barrier. Fails
    /// with [`MeshError::Fault`] if a member died before entering.
    pub fn barrier_test(&mut self, token: &BarrierToken) -> Result<bool> {
        let key = (token.epoch, token.seq);
        let mut st = self.state.lock().unwrap();
        Self::check_not_revoked(&st, &token.group)?;
        let cell = st.barriers.entry(key).or_default();
        if token.group.members.iter().all(|m| cell.arrived.contains(m)) {
            cell.observed.insert(self.world_rank);
            if cell.observed.len() == token.group.members.len() {
                st.barriers.remove(&key);
            }
            return Ok(true);
        }
        if token.group.members.iter().any(|&m| !st.alive[m]) {
            return Err(MeshError::Fault);
        }
        Ok(false)
    }

    /// Blocks until every member of `group` has entered the barrier.
    pub fn barrier(&mut self, group: &Group) -> Result<()> {
        let token = self.barrier_begin(group)?;
        loop {
            if self.barrier_test(&token)? {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    /// Fault-tolerant agreement barrier.
    ///
    /// Completes once every member of `group` has either entered the
    /// barrier or died; unlike [`Endpoint::barrier`], the death of a member
    /// is not an error. Used to separate communication phases after
    /// failures.
    pub fn agree(&mut self, group: &Group) -> Result<()> {
        let token = self.barrier_begin(group)?;
        let key = (token.epoch, token.seq);
        loop {
            {
                let mut st = self.state.lock().unwrap();
                Self::check_not_revoked(&st, group)?;
                let alive_snapshot = st.alive.clone();
                let cell = st.barriers.entry(key).or_default();
                if token
                    .group
                    .members
                    .iter()
                    .all(|&m| cell.arrived.contains(&m) || !alive_snapshot[m])
                {
                    cell.observed.insert(self.world_rank);
                    if cell.observed.len() == token.group.members.len() {
                        st.barriers.remove(&key);
                    }
                    return Ok(());
                }
            }
            std::thread::yield_now();
        }
    }

    /// Builds a new group handle containing the surviving members of
    /// `group`.
    ///
    /// Survivors arriving at the same member set get handles with the same
    /// epoch, even via different shrink sequences, so the new handles
    /// interoperate. Shrinking a fully-alive group returns it unchanged.
    pub fn shrink(&mut self, group: &Group) -> Result<Group> {
        let mut st = self.state.lock().unwrap();
        let survivors: Vec<usize> = group
            .members
            .iter()
            .copied()
            .filter(|&m| st.alive[m])
            .collect();
        if survivors.len() == group.members.len() {
            return Ok(group.clone());
        }
        let epoch = match st.shrinks.get(&survivors) {
            Some(&epoch) => epoch,
            None => {
                let epoch = st.next_epoch;
                st.next_epoch += 1;
                let members = Arc::new(survivors.clone());
                st.epochs.insert(
                    epoch,
                    EpochInfo {
                        members: Arc::clone(&members),
                        revoked: false,
                    },
                );
                st.shrinks.insert(survivors, epoch);
                epoch
            }
        };
        let members = Arc::clone(&st.epochs[&epoch].members);
        Ok(Group { epoch, members })
    }

    /// Revokes `group`: every subsequent operation on it, by any member,
    /// fails with [`MeshError::Revoked`].
    pub fn revoke(&self, group: &Group) {
        let mut st = self.state.lock().unwrap();
        if let Some(info) = st.epochs.get_mut(&group.epoch) {
            info.revoked = true;
        }
    }

    /// Marks this rank as dead and drops the endpoint.
    ///
    /// Peers observe the death as [`MeshError::Fault`] from any operation
    /// that involves this rank. Merely dropping an endpoint has the same
    /// effect: a rank that is gone is gone, however it exited.
    pub fn fail(self) {
        drop(self);
    }
}

impl<M: MpscChannel> Drop for Endpoint<M> {
    fn drop(&mut self) {
        // Mark the rank dead even when unwinding past a poisoned lock, so
        // peers of a panicked rank observe a fault instead of hanging.
        let mut st = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        st.alive[self.world_rank] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_world_group() {
        let group = create_group(4);
        assert_eq!(group.len(), 4);
        for (i, ep) in group.iter().enumerate() {
            assert_eq!(ep.world_rank(), i);
            assert_eq!(ep.world().size(), 4);
            assert_eq!(ep.rank(&ep.world()), Some(i));
        }
    }

    #[test]
    fn test_send_recv_including_self() {
        let mut group = create_group(2);
        let world = group[0].world();

        group[0].send(&world, 1, 7, vec![1, 2, 3]).unwrap();
        group[0].send(&world, 0, 7, vec![9]).unwrap();

        let (src, data) = group[1].try_recv(&world, 7).unwrap().unwrap();
        assert_eq!(src, 0);
        assert_eq!(data, vec![1, 2, 3]);

        let (src, data) = group[0].try_recv(&world, 7).unwrap().unwrap();
        assert_eq!(src, 0);
        assert_eq!(data, vec![9]);

        assert!(group[1].try_recv(&world, 7).unwrap().is_none());
    }

    #[test]
    fn test_recv_filters_by_tag() {
        let mut group = create_group(2);
        let world = group[0].world();

        group[0].send(&world, 1, 1, vec![1]).unwrap();
        group[0].send(&world, 1, 2, vec![2]).unwrap();

        let (_, data) = group[1].try_recv(&world, 2).unwrap().unwrap();
        assert_eq!(data, vec![2]);
        let (_, data) = group[1].try_recv(&world, 1).unwrap().unwrap();
        assert_eq!(data, vec![1]);
    }

    #[test]
    fn test_recv_from_blocks_until_message() {
        let mut group = create_group(2);
        let world = group[0].world();
        let mut ep1 = group.pop().unwrap();
        let ep0 = group.pop().unwrap();

        let h = thread::spawn(move || {
            let world = ep1.world();
            ep1.recv_from(&world, 0, 3).unwrap()
        });
        thread::sleep(std::time::Duration::from_millis(10));
        ep0.send(&world, 1, 3, vec![42]).unwrap();
        assert_eq!(h.join().unwrap(), vec![42]);
    }

    #[test]
    fn test_barrier_across_threads() {
        let group = create_group(4);
        let handles: Vec<_> = group
            .into_iter()
            .map(|mut ep| {
                thread::spawn(move || {
                    let world = ep.world();
                    for _ in 0..10 {
                        ep.barrier(&world).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_send_to_dead_rank_faults() {
        let mut group = create_group(3);
        let world = group[0].world();

        group.pop().unwrap().fail();
        assert!(matches!(
            group[0].send(&world, 2, 0, vec![]),
            Err(MeshError::Fault)
        ));
        // Sending between survivors still works.
        group[0].send(&world, 1, 0, vec![5]).unwrap();
        let (src, data) = group[1].try_recv(&world, 0).unwrap().unwrap();
        assert_eq!((src, data), (0, vec![5]));
    }

    #[test]
    fn test_barrier_faults_on_dead_member() {
        let mut group = create_group(2);
        let world = group[0].world();

        group.pop().unwrap().fail();
        assert!(matches!(group[0].barrier(&world), Err(MeshError::Fault)));
    }

    #[test]
    fn test_agree_completes_among_survivors() {
        let mut group = create_group(3);
        let world = group[0].world();

        group.pop().unwrap().fail();
        let mut ep1 = group.pop().unwrap();
        let mut ep0 = group.pop().unwrap();

        let h = thread::spawn(move || {
            let world = ep1.world();
            ep1.agree(&world).unwrap();
        });
        ep0.agree(&world).unwrap();
        h.join().unwrap();
    }

    #[test]
    fn test_shrink_is_consistent_across_survivors() {
        let mut group = create_group(4);
        let world = group[0].world();

        group.remove(2).fail();

        let shrunk: Vec<Group> = group.iter_mut().map(|ep| ep.shrink(&world).unwrap()).collect();
        assert!(shrunk.iter().all(|g| g.epoch == shrunk[0].epoch));
        assert_eq!(shrunk[0].members(), &[0, 1, 3]);

        // Ranks renumber densely on the new handle.
        assert_eq!(group[2].rank(&shrunk[0]), Some(2));
        assert_eq!(group[2].world_rank(), 3);

        // Messaging works on the shrunken handle.
        group[0].send(&shrunk[0], 2, 9, vec![1]).unwrap();
        let (src, data) = group[2].try_recv(&shrunk[2], 9).unwrap().unwrap();
        assert_eq!((src, data), (0, vec![1]));
    }

    #[test]
    fn test_messages_do_not_cross_epochs() {
        let mut group = create_group(3);
        let world = group[0].world();

        group.pop().unwrap().fail();
        group[0].send(&world, 1, 4, vec![1]).unwrap();

        let shrunk0 = group[0].shrink(&world).unwrap();
        let shrunk1 = group[1].shrink(&world).unwrap();

        // The message was sent on the world epoch; it is invisible on the
        // shrunken one but still deliverable on world.
        assert!(group[1].try_recv(&shrunk1, 4).unwrap().is_none());
        let (src, data) = group[1].try_recv(&world, 4).unwrap().unwrap();
        assert_eq!((src, data), (0, vec![1]));

        group[0].send(&shrunk0, 1, 4, vec![2]).unwrap();
        let (src, data) = group[1].try_recv(&shrunk1, 4).unwrap().unwrap();
        assert_eq!((src, data), (0, vec![2]));
    }

    #[test]
    fn test_revoked_group_rejects_operations() {
        let mut group = create_group(2);
        let world = group[0].world();

        group[0].revoke(&world);
        assert!(matches!(
            group[0].send(&world, 1, 0, vec![]),
            Err(MeshError::Revoked)
        ));
        assert!(matches!(
            group[1].try_recv(&world, 0),
            Err(MeshError::Revoked)
        ));
        assert!(matches!(group[1].barrier(&world), Err(MeshError::Revoked)));
    }

    #[test]
    fn test_invalid_rank() {
        let group = create_group(2);
        let world = group[0].world();
        assert!(matches!(
            group[0].send(&world, 5, 0, vec![]),
            Err(MeshError::InvalidRank)
        ));
    }
}
