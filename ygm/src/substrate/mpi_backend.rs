//! Real MPI-backed substrate, via the `mpi` crate (`rsmpi`).
//!
//! `rsmpi`'s genuinely non-blocking `immediate_send`/`immediate_receive`
//! API ties a request's lifetime to a borrow of its buffer through a
//! scoped-request pattern, which does not fit a `Substrate` trait whose
//! handles must outlive the call that created them. To keep the trait
//! object-free of that scope lifetime, this backend performs each
//! "non-blocking" operation eagerly, in blocking mode, and returns a handle
//! that is already complete — the same simplification
//! [`super::local::LocalSubstrate`] makes for `isend`. This costs true
//! send/receive overlap but not correctness: the engine's progress loop
//! only ever needs eventual completion, and `Iprobe` is still used so a
//! missing receive is reported as pending rather than blocking the caller.
//!
//! One [`mpi::topology::SimpleCommunicator`] is duplicated per
//! [`Channel`](super::Channel) at construction, mirroring the three
//! sub-communicators the concurrency model calls for.

use mpi::{collective::SystemOperation, topology::SimpleCommunicator, traits::*};

use super::{AllReduceHandle, Channel, RecvHandle, RecvResult, SendHandle, Substrate};
use crate::error::Result;

const TAG_ASYNC_DATA: i32 = 0;
const TAG_BARRIER: i32 = 1;
const TAG_AUX: i32 = 2;

fn tag_for(channel: Channel) -> i32 {
    match channel {
        Channel::AsyncData => TAG_ASYNC_DATA,
        Channel::Barrier => TAG_BARRIER,
        Channel::Aux => TAG_AUX,
    }
}

/// Communicator set mirroring the engine's three logical channels.
pub struct MpiSubstrate {
    async_comm: SimpleCommunicator,
    barrier_comm: SimpleCommunicator,
    aux_comm: SimpleCommunicator,
}

impl MpiSubstrate {
    /// Duplicates `world` three times, one communicator per channel, so
    /// engine traffic never collides with user-issued collectives on tag
    /// or context.
    pub fn new(world: &SimpleCommunicator) -> Self {
        Self {
            async_comm: world.duplicate(),
            barrier_comm: world.duplicate(),
            aux_comm: world.duplicate(),
        }
    }

    fn comm_for(&self, channel: Channel) -> &SimpleCommunicator {
        match channel {
            Channel::AsyncData => &self.async_comm,
            Channel::Barrier => &self.barrier_comm,
            Channel::Aux => &self.aux_comm,
        }
    }
}

impl Substrate for MpiSubstrate {
    fn rank(&self) -> i32 {
        self.async_comm.rank()
    }

    fn size(&self) -> i32 {
        self.async_comm.size()
    }

    fn isend(&self, dest: i32, channel: Channel, bytes: Vec<u8>) -> Result<SendHandle> {
        self.check_rank(dest)?;
        let comm = self.comm_for(channel);
        comm.process_at_rank(dest)
            .send_with_tag(&bytes[..], tag_for(channel));
        Ok(SendHandle)
    }

    fn test_send(&self, _handle: &mut SendHandle) -> Result<bool> {
        Ok(true)
    }

    fn irecv(&self, channel: Channel) -> Result<RecvHandle> {
        Ok(RecvHandle { channel })
    }

    fn test_recv(&self, handle: &mut RecvHandle) -> Result<Option<RecvResult>> {
        let comm = self.comm_for(handle.channel);
        match comm.any_process().matched_probe_with_tag(tag_for(handle.channel)) {
            Some((msg, status)) => {
                let count = status.count(u8::equivalent_datatype()) as usize;
                let mut bytes = vec![0u8; count];
                let (_, recv_status) = msg.matched_receive_into(&mut bytes[..]);
                Ok(Some(RecvResult {
                    source: recv_status.source_rank(),
                    bytes,
                }))
            }
            None => Ok(None),
        }
    }

    fn wait_any_recv(&self, channel: Channel) -> Result<RecvResult> {
        let comm = self.comm_for(channel);
        let (bytes, status): (Vec<u8>, _) = comm
            .any_process()
            .receive_vec_with_tag(tag_for(channel));
        Ok(RecvResult {
            source: status.source_rank(),
            bytes,
        })
    }

    fn send_blocking(&self, dest: i32, channel: Channel, bytes: &[u8]) -> Result<()> {
        self.check_rank(dest)?;
        self.comm_for(channel)
            .process_at_rank(dest)
            .send_with_tag(bytes, tag_for(channel));
        Ok(())
    }

    fn recv_blocking(&self, source: i32, channel: Channel) -> Result<Vec<u8>> {
        self.check_rank(source)?;
        let (bytes, _status): (Vec<u8>, _) = self
            .comm_for(channel)
            .process_at_rank(source)
            .receive_vec_with_tag(tag_for(channel));
        Ok(bytes)
    }

    fn barrier(&self) -> Result<()> {
        self.barrier_comm.barrier();
        Ok(())
    }

    fn iallreduce_counts(&self, local: (u64, u64)) -> Result<AllReduceHandle> {
        let send = [local.0, local.1];
        let mut recv = [0u64; 2];
        self.barrier_comm
            .all_reduce_into(&send[..], &mut recv[..], SystemOperation::sum());
        Ok(AllReduceHandle(Some((recv[0], recv[1]))))
    }

    fn test_allreduce(&self, handle: &mut AllReduceHandle) -> Result<Option<(u64, u64)>> {
        Ok(handle.0.take())
    }

    fn all_reduce_sum_u64(&self, value: u64) -> Result<u64> {
        let mut recv = 0u64;
        self.aux_comm.all_reduce_into(&value, &mut recv, SystemOperation::sum());
        Ok(recv)
    }

    fn all_reduce_max_u64(&self, value: u64) -> Result<u64> {
        let mut recv = 0u64;
        self.aux_comm.all_reduce_into(&value, &mut recv, SystemOperation::max());
        Ok(recv)
    }

    fn all_reduce_min_u64(&self, value: u64) -> Result<u64> {
        let mut recv = 0u64;
        self.aux_comm.all_reduce_into(&value, &mut recv, SystemOperation::min());
        Ok(recv)
    }
}
