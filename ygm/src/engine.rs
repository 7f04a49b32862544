//! The engine: wires the substrate, routing, registry, send aggregation,
//! receive pools, and collectives into the single-threaded cooperative
//! active-message runtime described in the crate's top-level docs.
//!
//! Every public method that can submit or deliver work takes `&self` —
//! interior mutability (`Cell`/`RefCell`) holds all mutable state, since the
//! progress loop, back-pressure, and trampolines all need to reach the same
//! engine without a `&mut` chain tangling user callback signatures. Nothing
//! here is `Sync` in the sense of safe concurrent access: the single-thread
//! rule is enforced by convention (one `Engine` per OS thread), the same
//! discipline the borrowed `Substrate` handles already assume.

use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    collectives,
    config::EngineConfig,
    dispatch,
    error::Result,
    frame::{RoutingHeader, TracingHeader, BROADCAST_FINAL_DEST},
    layout::Layout,
    recv::ReceivePool,
    registry::{self, LambdaRegistry, Tag},
    router::Router,
    send::SendAggregator,
    stats::{ReducedStats, Stats},
    substrate::{Channel, Substrate},
    trace::{Trace, TraceEvent},
};

/// Payload of the internal broadcast relay trampoline. `(origin, logical_lo,
/// logical_hi)` describes "the receiving rank is responsible for fanning
/// `user_tag`/`user_args` out to the logical range `[logical_lo, logical_hi)`
/// of a ring rooted at `origin`", where logical index `i` maps to actual rank
/// `(origin + i) % size`. Rooting the recursion at the call's own origin
/// rather than always at rank 0 means `async_bcast` never pays an extra hop
/// just because the caller isn't rank 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayFrame {
    bcast_id: u64,
    user_tag: u16,
    user_args: Vec<u8>,
    origin: i32,
    logical_lo: i32,
    logical_hi: i32,
}

pub struct Engine {
    substrate: Box<dyn Substrate>,
    layout: Layout,
    router: Router,
    config: EngineConfig,
    registry: LambdaRegistry,
    bcast_relay_tag: Tag,

    send: RefCell<SendAggregator>,
    recv_pool: RefCell<ReceivePool>,
    stats: RefCell<Stats>,
    trace: RefCell<Trace>,

    send_count: Cell<u64>,
    recv_count: Cell<u64>,
    barrier_tracker: RefCell<crate::barrier::QuiescenceTracker>,
    bcast_seen: RefCell<HashSet<u64>>,
    bcast_counter: Cell<u64>,
    trace_id_counter: Cell<i32>,

    /// Set for the duration of a trampoline's execution (including the
    /// forwarding half of routing a frame); while set, back-pressure never
    /// recurses into the progress loop, so a trampoline calling `async_send`
    /// only ever enqueues bytes.
    in_progress: Cell<bool>,
    pre_barrier_callbacks: RefCell<Vec<Box<dyn Fn(&Engine) + Send + Sync>>>,
}

impl Engine {
    /// Builds an engine over `substrate`, posting its receive pool and
    /// registering the internal broadcast relay trampoline.
    pub fn new(substrate: Box<dyn Substrate>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let rank = substrate.rank();
        let size = substrate.size();
        let layout = Layout::new(rank, size, config.local_size)?;
        let router = Router::new(layout.clone(), config.routing);

        let mut registry = LambdaRegistry::new();
        let bcast_relay_tag = registry.register::<RelayFrame, _>(|engine, args| engine.handle_bcast_relay(args));

        let recv_pool = ReceivePool::new(Channel::AsyncData, config.num_irecvs, config.irecv_size, substrate.as_ref())?;
        let free_list_cap = config.send_buffer_free_list_len;

        let trace = match &config.trace_path {
            Some(path) => Trace::open(path, rank)?,
            None => Trace::disabled(),
        };

        if config.welcome && rank == 0 {
            tracing::info!(ranks = size, local_size = config.local_size, "ygm engine starting");
        }

        Ok(Self {
            substrate,
            layout,
            router,
            config,
            registry,
            bcast_relay_tag,
            send: RefCell::new(SendAggregator::new(free_list_cap)),
            recv_pool: RefCell::new(recv_pool),
            stats: RefCell::new(Stats::new()),
            trace: RefCell::new(trace),
            send_count: Cell::new(0),
            recv_count: Cell::new(0),
            barrier_tracker: RefCell::new(crate::barrier::QuiescenceTracker::new()),
            bcast_seen: RefCell::new(HashSet::new()),
            bcast_counter: Cell::new(0),
            trace_id_counter: Cell::new(0),
            in_progress: Cell::new(false),
            pre_barrier_callbacks: RefCell::new(Vec::new()),
        })
    }

    /// A single-rank engine over an in-process substrate, for tests and
    /// doctests that need a live `Engine` but no real cluster.
    #[cfg(feature = "sim")]
    pub fn new_for_test() -> Self {
        let mut subs = crate::substrate::local::LocalSubstrate::cluster(1);
        let sub = subs.remove(0);
        Engine::new(Box::new(sub), EngineConfig::new().with_local_size(1))
            .expect("a single-rank local engine always constructs")
    }

    pub fn rank(&self) -> i32 {
        self.layout.rank()
    }

    pub fn size(&self) -> i32 {
        self.layout.size()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> Stats {
        self.stats.borrow().clone()
    }

    /// Raw `(send_count, recv_count)` driving the quiescence protocol.
    /// `Σ send_count == Σ recv_count` across the communicator once
    /// `barrier()` returns. Exposed for diagnostics and tests.
    pub fn message_counts(&self) -> (u64, u64) {
        (self.send_count.get(), self.recv_count.get())
    }

    /// `(queued_bytes, pending_bytes)`: bytes accumulated but not yet handed
    /// to a non-blocking send, and bytes posted but not yet observed
    /// complete. Exposed for diagnostics and tests.
    pub fn send_queue_depths(&self) -> (usize, usize) {
        let send = self.send.borrow();
        (send.queued_bytes(), send.pending_bytes())
    }

    /// Sums every process-local counter across the communicator. Does not
    /// invoke `barrier` first — callers that want a clean snapshot should
    /// call `barrier()` themselves before reducing.
    pub fn reduced_stats(&self) -> Result<ReducedStats> {
        self.stats.borrow().reduce(self.substrate.as_ref())
    }

    /// Registers a remotely invocable callable, returning its tag. Must be
    /// called in the same order on every rank before any `async_send` or
    /// `async_bcast` referencing it.
    pub fn register<Args, F>(&mut self, f: F) -> Tag
    where
        Args: DeserializeOwned + 'static,
        F: Fn(&Engine, Args) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register(f)
    }

    /// Registers a callback run once at the start of every `barrier()` call,
    /// before its first quiescence round.
    pub fn register_pre_barrier_callback(&self, f: impl Fn(&Engine) + Send + Sync + 'static) {
        self.pre_barrier_callbacks.borrow_mut().push(Box::new(f));
    }

    fn check_dest(&self, dest: i32) -> Result<()> {
        self.substrate.check_rank(dest)
    }

    fn next_trace_id(&self) -> i32 {
        let id = self.trace_id_counter.get();
        self.trace_id_counter.set(id.wrapping_add(1));
        id
    }

    /// Enqueues `tag`/`args` for delivery to `dest`, applying multi-hop
    /// routing and back-pressure the same way every submission path does.
    pub fn async_send<Args: Serialize>(&self, dest: i32, tag: Tag, args: &Args) -> Result<()> {
        self.check_dest(dest)?;
        let args_bytes = registry::encode_args(args)?;
        let physical = self.router.next_hop(dest);
        self.enqueue_frame(physical, dest, tag.0, &args_bytes)?;

        self.send_count.set(self.send_count.get() + 1);
        self.stats.borrow_mut().record_async();
        self.trace.borrow_mut().record(&TraceEvent::async_submit(self.rank(), dest, tag.0));

        self.maybe_apply_back_pressure()
    }

    /// Calls `async_send` once per destination in `dests`.
    pub fn async_mcast<Args: Serialize>(&self, dests: &[i32], tag: Tag, args: &Args) -> Result<()> {
        for &dest in dests {
            self.async_send(dest, tag, args)?;
        }
        Ok(())
    }

    /// Delivers `tag`/`args` exactly once on every rank, including this one.
    /// Queues like any other submission: the caller enqueues a relay frame
    /// addressed to itself, and propagation happens entirely through the
    /// relay trampoline re-issuing ordinary `async_send`-shaped frames.
    pub fn async_bcast<Args: Serialize>(&self, tag: Tag, args: &Args) -> Result<()> {
        let user_args = registry::encode_args(args)?;
        let bcast_id = self.next_bcast_id();
        let relay = RelayFrame {
            bcast_id,
            user_tag: tag.0,
            user_args,
            origin: self.rank(),
            logical_lo: 0,
            logical_hi: self.size(),
        };
        self.async_send(self.rank(), self.bcast_relay_tag, &relay)
    }

    fn next_bcast_id(&self) -> u64 {
        let n = self.bcast_counter.get();
        self.bcast_counter.set(n + 1);
        ((self.rank() as u64) << 32) | n
    }

    /// The internal broadcast relay trampoline: executes the user trampoline
    /// once (deduplicated by `bcast_id`), then fans its remaining logical
    /// range out via binomial splitting.
    fn handle_bcast_relay(&self, frame: RelayFrame) -> anyhow::Result<()> {
        if !self.bcast_seen.borrow_mut().insert(frame.bcast_id) {
            trace!(bcast_id = frame.bcast_id, "duplicate broadcast relay, dropping");
            return Ok(());
        }

        self.registry.dispatch_raw(Tag(frame.user_tag), self, &frame.user_args)?;

        let size = self.size();
        let lo = frame.logical_lo;
        let mut hi = frame.logical_hi;
        while hi - lo > 1 {
            let mid = lo + (hi - lo + 1) / 2;
            let target_rank = (frame.origin + mid).rem_euclid(size);
            let child = RelayFrame {
                bcast_id: frame.bcast_id,
                user_tag: frame.user_tag,
                user_args: frame.user_args.clone(),
                origin: frame.origin,
                logical_lo: mid,
                logical_hi: hi,
            };
            trace!(target_rank, mid, hi, "relaying broadcast range");
            self.async_send(target_rank, self.bcast_relay_tag, &child)?;
            hi = mid;
        }
        Ok(())
    }

    /// Writes a self-delimiting frame for `tag`/`args` into `physical_dest`'s
    /// accumulation buffer, back-filling the routing header's payload-size
    /// placeholder once the frame body is known.
    fn enqueue_frame(&self, physical_dest: i32, final_dest: i32, tag_raw: u16, args_bytes: &[u8]) -> Result<()> {
        let routing_enabled = self.routing_enabled();
        let tracing_enabled = self.tracing_enabled();

        let mut send = self.send.borrow_mut();
        let buffer = send.buffer_for(physical_dest);

        let header_offset = buffer.len();
        if routing_enabled {
            RoutingHeader {
                final_dest,
                payload_size: 0,
            }
            .write(buffer);
        }
        if tracing_enabled {
            let trace_id = self.next_trace_id();
            TracingHeader {
                origin_rank: self.rank(),
                trace_id,
            }
            .write(buffer);
        }

        let payload_offset = buffer.len();
        buffer.push_bytes(&tag_raw.to_le_bytes());
        buffer.push_bytes(args_bytes);
        let payload_size = (buffer.len() - payload_offset) as u32;

        if routing_enabled {
            buffer.patch_array(header_offset + 4, payload_size.to_le_bytes())?;
        }
        Ok(())
    }

    /// Re-embeds an already-framed payload toward `next_hop`, preserving the
    /// original `final_dest` and tracing header. Counts as both a receive
    /// and a send for the quiescence protocol.
    pub(crate) fn forward_frame(
        &self,
        next_hop: i32,
        final_dest: i32,
        tracing_header: Option<TracingHeader>,
        payload: &[u8],
    ) -> Result<()> {
        {
            let mut send = self.send.borrow_mut();
            let buffer = send.buffer_for(next_hop);
            RoutingHeader {
                final_dest,
                payload_size: payload.len() as u32,
            }
            .write(buffer);
            if let Some(th) = tracing_header {
                th.write(buffer);
            }
            buffer.push_bytes(payload);
        }

        self.send_count.set(self.send_count.get() + 1);
        self.recv_count.set(self.recv_count.get() + 1);
        self.stats.borrow_mut().record_route();

        self.maybe_apply_back_pressure()
    }

    pub(crate) fn routing_enabled(&self) -> bool {
        !matches!(self.config.routing, crate::router::RoutingMode::None)
    }

    pub(crate) fn tracing_enabled(&self) -> bool {
        self.trace.borrow().is_enabled()
    }

    pub(crate) fn router_next_hop(&self, dest: i32) -> i32 {
        if dest == BROADCAST_FINAL_DEST {
            dest
        } else {
            self.router.next_hop(dest)
        }
    }

    pub(crate) fn record_recv(&self) {
        self.recv_count.set(self.recv_count.get() + 1);
        self.stats.borrow_mut().record_rpc_execute();
    }

    pub(crate) fn registry_dispatch(&self, tag: u16, cursor: &mut crate::frame::FrameCursor<'_>) -> Result<()> {
        self.registry.dispatch(Tag(tag), self, cursor)
    }

    fn with_progress_masked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let was_set = self.in_progress.replace(true);
        let result = f();
        self.in_progress.set(was_set);
        result
    }

    fn maybe_apply_back_pressure(&self) -> Result<()> {
        if self.in_progress.get() {
            return Ok(());
        }
        if self.send.borrow().queued_bytes() <= self.config.buffer_size {
            return Ok(());
        }
        debug!(cap = self.config.buffer_size, "back-pressure engaged");
        self.in_progress.set(true);
        let result = (|| -> Result<()> {
            while self.send.borrow().queued_bytes() > self.config.buffer_size {
                self.local_progress()?;
            }
            Ok(())
        })();
        self.in_progress.set(false);
        result
    }

    /// One progress step, then a single flush if any destination is queued.
    fn local_progress(&self) -> Result<()> {
        self.progress_step()?;
        if self.send.borrow().has_queued_destination() {
            let mut send = self.send.borrow_mut();
            let mut stats = self.stats.borrow_mut();
            send.flush_one(self.substrate.as_ref(), self.config.freq_issend, &mut stats)?;
        }
        Ok(())
    }

    /// A single unit of progress: if the in-flight send queue is over
    /// threshold, blocks on the receive side (every current backend
    /// completes sends eagerly, so blocking on a send is never observable);
    /// otherwise polls both sides non-blockingly.
    fn progress_step(&self) -> Result<()> {
        let heavy = self.send.borrow().in_flight_len() > self.config.num_isends_wait;

        if heavy {
            let completed = self.send.borrow_mut().drain_completed(self.substrate.as_ref())?;
            if completed == 0 {
                trace!("progress step: blocking on receive");
                let result = self.recv_pool.borrow_mut().wait_any(self.substrate.as_ref())?;
                self.stats.borrow_mut().record_irecv(result.bytes.len());
                self.with_progress_masked(|| dispatch::process_buffer(self, result.source, &result.bytes))?;
            }
        } else {
            self.send.borrow_mut().drain_completed(self.substrate.as_ref())?;
            if let Some(result) = self.recv_pool.borrow_mut().poll_head(self.substrate.as_ref())? {
                self.stats.borrow_mut().record_irecv(result.bytes.len());
                self.with_progress_masked(|| dispatch::process_buffer(self, result.source, &result.bytes))?;
            }
        }
        Ok(())
    }

    /// One inner pass: drains every arrived receive, flushes every queued
    /// destination, and tests every in-flight send. Returns whether any of
    /// that did work.
    fn drain_one_pass(&self) -> Result<bool> {
        let mut did_work = false;

        while let Some(result) = self.recv_pool.borrow_mut().poll_head(self.substrate.as_ref())? {
            self.stats.borrow_mut().record_irecv(result.bytes.len());
            self.with_progress_masked(|| dispatch::process_buffer(self, result.source, &result.bytes))?;
            did_work = true;
        }

        if self.send.borrow().has_queued_destination() {
            let mut send = self.send.borrow_mut();
            let mut stats = self.stats.borrow_mut();
            send.flush_all_queued(self.substrate.as_ref(), self.config.freq_issend, &mut stats)?;
            did_work = true;
        }

        if self.send.borrow_mut().drain_completed(self.substrate.as_ref())? > 0 {
            did_work = true;
        }

        Ok(did_work)
    }

    /// Runs this barrier's pre-barrier callbacks once, then loops
    /// `drain_one_pass` until a pass does no work.
    fn flush_all_local_and_process_incoming(&self) -> Result<()> {
        for cb in self.pre_barrier_callbacks.borrow().iter() {
            cb(self);
        }
        while self.drain_one_pass()? {}
        Ok(())
    }

    /// Drives the engine to a quiescent fixed point: two consecutive rounds
    /// of a global all-reduce of `(recv_count, send_count)` agree, and the
    /// two are equal. Every rank reaches this decision on the same round
    /// number, since the decision is a pure function of the identical
    /// globally reduced value every rank computes. Followed by a cheap
    /// control-flow-only barrier and a reset of the broadcast dedup set,
    /// which is sound exactly because quiescence guarantees no relay frame
    /// from a prior broadcast remains in flight.
    pub fn barrier(&self) -> Result<()> {
        let start = std::time::Instant::now();
        self.trace.borrow_mut().record(&TraceEvent::barrier_begin(self.rank()));

        self.flush_all_local_and_process_incoming()?;
        self.barrier_tracker.borrow_mut().reset();

        loop {
            // Drain whatever arrived since the last round (including, on
            // the first iteration, nothing new beyond the initial flush
            // above) before computing this round's totals — otherwise a
            // frame that lands between rounds would sit unprocessed while
            // every rank keeps reporting stale counts.
            while self.drain_one_pass()? {}
            let local = (self.recv_count.get(), self.send_count.get());
            let mut handle = self.substrate.iallreduce_counts(local)?;
            let totals = loop {
                if let Some(t) = self.substrate.test_allreduce(&mut handle)? {
                    break t;
                }
                self.drain_one_pass()?;
            };
            self.stats.borrow_mut().record_iallreduce();
            trace!(recv = totals.0, send = totals.1, "barrier round");
            if self.barrier_tracker.borrow_mut().observe(totals) {
                break;
            }
        }

        self.substrate.barrier()?;
        self.bcast_seen.borrow_mut().clear();
        self.stats.borrow_mut().barrier_time += start.elapsed();
        self.trace.borrow_mut().record(&TraceEvent::barrier_end(self.rank()));
        Ok(())
    }

    /// A cheap, data-free collective synchronization with no quiescence
    /// guarantee — callers that only need "everyone reached this line", not
    /// "nothing is in flight", should prefer this over `barrier()`.
    pub fn cf_barrier(&self) -> Result<()> {
        self.substrate.barrier()
    }

    pub fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        self.barrier()?;
        self.substrate.all_reduce_sum_u64(value)
    }

    pub fn all_reduce_min(&self, value: u64) -> Result<u64> {
        self.barrier()?;
        self.substrate.all_reduce_min_u64(value)
    }

    pub fn all_reduce_max(&self, value: u64) -> Result<u64> {
        self.barrier()?;
        self.substrate.all_reduce_max_u64(value)
    }

    /// General binary-tree all-reduce of an arbitrary serializable value.
    pub fn all_reduce<T, F>(&self, value: T, merge: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: Fn(T, T) -> T,
    {
        self.barrier()?;
        collectives::all_reduce(self.substrate.as_ref(), &self.layout, value, merge)
    }

    /// General binary-tree broadcast of an arbitrary serializable value from
    /// `root`, present only there.
    pub fn bcast<T>(&self, value: Option<T>, root: i32) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.barrier()?;
        collectives::bcast(self.substrate.as_ref(), &self.layout, value, root)
    }

    /// Plain blocking point-to-point send on the auxiliary channel. Not a
    /// collective: unlike `bcast`/`all_reduce`, does not invoke `barrier`.
    pub fn mpi_send<T: Serialize>(&self, dest: i32, value: &T) -> Result<()> {
        let bytes = registry::encode_args(value)?;
        self.substrate.send_blocking(dest, Channel::Aux, &bytes)
    }

    /// Plain blocking point-to-point receive on the auxiliary channel.
    pub fn mpi_recv<T: DeserializeOwned>(&self, source: i32) -> Result<T> {
        let bytes = self.substrate.recv_blocking(source, Channel::Aux)?;
        bincode::deserialize(&bytes)
            .map_err(|e| crate::error::EngineError::Invariant(format!("mpi_recv decode failed: {e}")))
    }

    /// Typed broadcast over the auxiliary channel's tree, same semantics as
    /// `bcast` — kept as a separate name for callers migrating term-for-term
    /// from point-to-point collective vocabulary.
    pub fn mpi_bcast<T>(&self, value: Option<T>, root: i32) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.bcast(value, root)
    }
}
