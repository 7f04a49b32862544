//! The seam between the engine and the message-passing backend.
//!
//! The engine only ever talks to a [`Substrate`]: non-blocking point-to-point
//! send/receive of raw bytes, blocking point-to-point for the collectives
//! layer (which already runs after a quiescence barrier, so blocking there
//! cannot deadlock the async pipeline), and a dedicated non-blocking
//! all-reduce of two counters for the barrier protocol. Three logical
//! [`Channel`]s stand in for the three sub-communicators described in the
//! concurrency model, keeping engine traffic, barrier traffic, and
//! user-collective traffic from colliding on the same tag space.
//!
//! Handle types are concrete, not associated types, so `Substrate` stays
//! object-safe and the engine can hold a `Box<dyn Substrate>` rather than
//! being generic over the backend — every supported backend's handles are
//! small enough (a channel tag, an already-resolved `Option`) that nothing
//! is lost by unifying them.

#[cfg(feature = "sim")]
pub mod local;
#[cfg(feature = "mpi-substrate")]
pub mod mpi_backend;

use thiserror::Error;

use crate::error::Result;

/// Logical channel a message travels on, standing in for one of the three
/// sub-communicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Async data: `async`/`async_bcast`/`async_mcast` traffic and its
    /// forwarding.
    AsyncData,
    /// The barrier protocol's non-blocking counter all-reduce.
    Barrier,
    /// `mpi_send`/`mpi_recv`/`mpi_bcast` and the collectives' tree
    /// reduction.
    Aux,
}

/// Error reported by a [`Substrate`] implementation. Always fatal: the
/// engine has no retry policy for a failed send, receive, or reduction.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("send to rank {dest} failed: {reason}")]
    Send { dest: i32, reason: String },
    #[error("receive failed: {reason}")]
    Recv { reason: String },
    #[error("all-reduce failed: {reason}")]
    AllReduce { reason: String },
    #[error("barrier failed: {reason}")]
    Barrier { reason: String },
    #[error("rank {rank} is out of range [0, {size})")]
    RankOutOfRange { rank: i32, size: i32 },
}

/// Outcome of a single non-blocking receive poll.
#[derive(Debug)]
pub struct RecvResult {
    pub source: i32,
    pub bytes: Vec<u8>,
}

/// A handle to a send that may still be in flight. Every current backend
/// completes sends eagerly, so this carries no state; kept distinct from
/// `()` so a future backend with genuine send latency has somewhere to put
/// a request.
#[derive(Debug)]
pub struct SendHandle;

/// A handle to a pending, wildcard-source, non-blocking receive on one
/// channel.
#[derive(Debug)]
pub struct RecvHandle {
    pub(crate) channel: Channel,
}

/// A handle to an outstanding non-blocking all-reduce of two counters.
/// Every current backend computes the result synchronously inside
/// `iallreduce_counts`, so the handle is born already resolved.
#[derive(Debug)]
pub struct AllReduceHandle(pub(crate) Option<(u64, u64)>);

/// Abstraction over the non-blocking message-passing backend.
///
/// Implementations: [`local::LocalSubstrate`] (always available, in-process,
/// used by tests and demos) and, behind the `mpi-substrate` feature,
/// `mpi_backend::MpiSubstrate` (real MPI via the `mpi` crate).
pub trait Substrate: Send + Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;

    /// Posts a non-blocking send of `bytes` to `dest` on `channel`.
    fn isend(&self, dest: i32, channel: Channel, bytes: Vec<u8>) -> Result<SendHandle>;

    /// Non-blocking test of whether `handle`'s send has completed.
    fn test_send(&self, handle: &mut SendHandle) -> Result<bool>;

    /// Posts a non-blocking receive with wildcard source on `channel`.
    fn irecv(&self, channel: Channel) -> Result<RecvHandle>;

    /// Non-blocking test of whether `handle`'s receive has completed.
    fn test_recv(&self, handle: &mut RecvHandle) -> Result<Option<RecvResult>>;

    /// Blocks until a message arrives on `channel` from any source.
    fn wait_any_recv(&self, channel: Channel) -> Result<RecvResult>;

    /// Blocking point-to-point send, used only by the collectives layer
    /// (which runs after quiescence, so blocking cannot stall the async
    /// pipeline).
    fn send_blocking(&self, dest: i32, channel: Channel, bytes: &[u8]) -> Result<()>;

    /// Blocking point-to-point receive from a specific source.
    fn recv_blocking(&self, source: i32, channel: Channel) -> Result<Vec<u8>>;

    /// A cheap, data-free collective synchronization.
    fn barrier(&self) -> Result<()>;

    /// Initiates a non-blocking all-reduce (sum) of a `(recv_count,
    /// send_count)` pair across the communicator.
    fn iallreduce_counts(&self, local: (u64, u64)) -> Result<AllReduceHandle>;

    /// Non-blocking test of whether `handle`'s all-reduce has completed.
    fn test_allreduce(&self, handle: &mut AllReduceHandle) -> Result<Option<(u64, u64)>>;

    fn all_reduce_sum_u64(&self, value: u64) -> Result<u64>;
    fn all_reduce_max_u64(&self, value: u64) -> Result<u64>;
    fn all_reduce_min_u64(&self, value: u64) -> Result<u64>;

    fn check_rank(&self, rank: i32) -> Result<()> {
        if rank < 0 || rank >= self.size() {
            return Err(SubstrateError::RankOutOfRange {
                rank,
                size: self.size(),
            }
            .into());
        }
        Ok(())
    }
}
