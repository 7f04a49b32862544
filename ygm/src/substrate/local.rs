//! In-process substrate simulating an `N`-rank communicator with channels.
//!
//! Built for tests and demos: [`LocalSubstrate::cluster`] returns one handle
//! per simulated rank, each cheap to move onto its own OS thread. Sends are
//! eager — handed straight to the destination's mailbox — so `test_send`
//! always reports completion; the only genuine asynchrony to poll for is a
//! receive that hasn't arrived yet, which keeps the engine's progress loop
//! exercised the same way it would be against a real backend. All-reduce
//! and barrier rendezvous on `std::sync::Barrier`, which is sound here
//! because every rank's quiescence loop advances in lock-step: the round
//! count is itself a function of the globally reduced values every rank
//! computes identically.

use std::sync::{Arc, Barrier, Mutex};

use crossbeam_channel::{Receiver, Sender};

use super::{AllReduceHandle, Channel, RecvHandle, RecvResult, SendHandle, Substrate, SubstrateError};
use crate::error::Result;

const NUM_CHANNELS: usize = 3;

fn channel_index(channel: Channel) -> usize {
    match channel {
        Channel::AsyncData => 0,
        Channel::Barrier => 1,
        Channel::Aux => 2,
    }
}

struct AllReduceState<T> {
    values: Mutex<Vec<T>>,
    start: Barrier,
    done: Barrier,
}

impl<T: Copy + Default> AllReduceState<T> {
    fn new(size: usize) -> Self {
        Self {
            values: Mutex::new(vec![T::default(); size]),
            start: Barrier::new(size),
            done: Barrier::new(size),
        }
    }

    fn reduce(&self, rank: usize, value: T, identity: T, merge: impl Fn(T, T) -> T) -> T {
        {
            let mut values = self.values.lock().expect("all-reduce lock poisoned");
            values[rank] = value;
        }
        self.start.wait();
        let result = {
            let values = self.values.lock().expect("all-reduce lock poisoned");
            values.iter().copied().fold(identity, merge)
        };
        self.done.wait();
        result
    }
}

struct ClusterShared {
    size: i32,
    mailboxes: Vec<[Sender<(i32, Vec<u8>)>; NUM_CHANNELS]>,
    cf_barrier: Barrier,
    sum_u64: AllReduceState<u64>,
    max_u64: AllReduceState<u64>,
    min_u64: AllReduceState<u64>,
    counts: AllReduceState<(u64, u64)>,
}

/// One rank's handle into a simulated cluster.
pub struct LocalSubstrate {
    shared: Arc<ClusterShared>,
    rank: i32,
    inboxes: [Receiver<(i32, Vec<u8>)>; NUM_CHANNELS],
}

impl LocalSubstrate {
    /// Builds `size` connected substrates, one per simulated rank.
    pub fn cluster(size: usize) -> Vec<Self> {
        assert!(size > 0, "a cluster needs at least one rank");

        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let mut s = Vec::with_capacity(NUM_CHANNELS);
            let mut r = Vec::with_capacity(NUM_CHANNELS);
            for _ in 0..NUM_CHANNELS {
                let (tx, rx) = crossbeam_channel::unbounded();
                s.push(tx);
                r.push(rx);
            }
            senders.push(s.try_into().unwrap_or_else(|_| unreachable!()));
            receivers.push(r);
        }

        let shared = Arc::new(ClusterShared {
            size: size as i32,
            mailboxes: senders,
            cf_barrier: Barrier::new(size),
            sum_u64: AllReduceState::new(size),
            max_u64: AllReduceState::new(size),
            min_u64: AllReduceState::new(size),
            counts: AllReduceState::new(size),
        });

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalSubstrate {
                shared: Arc::clone(&shared),
                rank: rank as i32,
                inboxes: inbox.try_into().unwrap_or_else(|_| unreachable!()),
            })
            .collect()
    }
}

impl Substrate for LocalSubstrate {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.shared.size
    }

    fn isend(&self, dest: i32, channel: Channel, bytes: Vec<u8>) -> Result<SendHandle> {
        self.check_rank(dest)?;
        self.shared.mailboxes[dest as usize][channel_index(channel)]
            .send((self.rank, bytes))
            .map_err(|e| SubstrateError::Send {
                dest,
                reason: e.to_string(),
            })?;
        Ok(SendHandle)
    }

    fn test_send(&self, _handle: &mut SendHandle) -> Result<bool> {
        Ok(true)
    }

    fn irecv(&self, channel: Channel) -> Result<RecvHandle> {
        Ok(RecvHandle { channel })
    }

    fn test_recv(&self, handle: &mut RecvHandle) -> Result<Option<RecvResult>> {
        match self.inboxes[channel_index(handle.channel)].try_recv() {
            Ok((source, bytes)) => Ok(Some(RecvResult { source, bytes })),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Err(SubstrateError::Recv {
                reason: "mailbox disconnected".into(),
            }
            .into()),
        }
    }

    fn wait_any_recv(&self, channel: Channel) -> Result<RecvResult> {
        let (source, bytes) = self.inboxes[channel_index(channel)]
            .recv()
            .map_err(|e| SubstrateError::Recv {
                reason: e.to_string(),
            })?;
        Ok(RecvResult { source, bytes })
    }

    fn send_blocking(&self, dest: i32, channel: Channel, bytes: &[u8]) -> Result<()> {
        self.isend(dest, channel, bytes.to_vec())?;
        Ok(())
    }

    fn recv_blocking(&self, source: i32, channel: Channel) -> Result<Vec<u8>> {
        loop {
            let result = self.wait_any_recv(channel)?;
            if result.source == source {
                return Ok(result.bytes);
            }
            // A message from someone else arrived on this channel out of
            // order; since the aux/barrier channels only ever carry
            // collective traffic issued in lockstep, put it back is not
            // possible with a plain channel, so this indicates two
            // concurrent collectives shared a channel, which is a caller
            // bug. Surface it rather than silently dropping a message.
            return Err(SubstrateError::Recv {
                reason: format!("expected message from rank {source}, got one from {}", result.source),
            }
            .into());
        }
    }

    fn barrier(&self) -> Result<()> {
        self.shared.cf_barrier.wait();
        Ok(())
    }

    fn iallreduce_counts(&self, local: (u64, u64)) -> Result<AllReduceHandle> {
        let result = self.shared.counts.reduce(
            self.rank as usize,
            local,
            (0, 0),
            |a, b| (a.0 + b.0, a.1 + b.1),
        );
        Ok(AllReduceHandle(Some(result)))
    }

    fn test_allreduce(&self, handle: &mut AllReduceHandle) -> Result<Option<(u64, u64)>> {
        Ok(handle.0.take())
    }

    fn all_reduce_sum_u64(&self, value: u64) -> Result<u64> {
        Ok(self.shared.sum_u64.reduce(self.rank as usize, value, 0, |a, b| a + b))
    }

    fn all_reduce_max_u64(&self, value: u64) -> Result<u64> {
        Ok(self.shared.max_u64.reduce(self.rank as usize, value, u64::MIN, u64::max))
    }

    fn all_reduce_min_u64(&self, value: u64) -> Result<u64> {
        Ok(self.shared.min_u64.reduce(self.rank as usize, value, u64::MAX, u64::min))
    }
}
