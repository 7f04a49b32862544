//! Process-local counters, reducible across ranks.
//!
//! Supplements the distilled `send_count`/`recv_count` pair with the fuller
//! breakdown (isend/irecv counts and bytes, all-reduce count, time spent
//! waiting) kept for diagnosing throughput, without feeding back into the
//! quiescence protocol — `Stats::reduce` performs its own all-reduce and is
//! never called implicitly by `barrier()`.

use std::time::{Duration, Instant};

use crate::{error::Result, substrate::Substrate};

/// Process-local counters accumulated over the engine's lifetime.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub async_count: u64,
    pub rpc_count: u64,
    pub route_count: u64,

    pub isend_count: u64,
    pub isend_bytes: u64,
    pub irecv_count: u64,
    pub irecv_bytes: u64,

    pub iallreduce_count: u64,

    pub waitsome_time: Duration,
    pub barrier_time: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_async(&mut self) {
        self.async_count += 1;
    }

    pub fn record_rpc_execute(&mut self) {
        self.rpc_count += 1;
    }

    pub fn record_route(&mut self) {
        self.route_count += 1;
    }

    pub fn record_isend(&mut self, bytes: usize) {
        self.isend_count += 1;
        self.isend_bytes += bytes as u64;
    }

    pub fn record_irecv(&mut self, bytes: usize) {
        self.irecv_count += 1;
        self.irecv_bytes += bytes as u64;
    }

    pub fn record_iallreduce(&mut self) {
        self.iallreduce_count += 1;
    }

    /// Times a block of waitsome-style polling, accumulating into
    /// `waitsome_time` when the returned guard drops.
    pub fn time_waitsome(&mut self) -> WaitsomeTimer<'_> {
        WaitsomeTimer {
            target: &mut self.waitsome_time,
            start: Instant::now(),
        }
    }

    pub fn time_barrier(&mut self) -> WaitsomeTimer<'_> {
        WaitsomeTimer {
            target: &mut self.barrier_time,
            start: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Sums every counter across the communicator via one all-reduce call
    /// per field on the auxiliary sub-communicator, and reports the
    /// maximum wait times observed anywhere.
    pub fn reduce(&self, substrate: &dyn Substrate) -> Result<ReducedStats> {
        Ok(ReducedStats {
            async_count: substrate.all_reduce_sum_u64(self.async_count)?,
            isend_count: substrate.all_reduce_sum_u64(self.isend_count)?,
            isend_bytes: substrate.all_reduce_sum_u64(self.isend_bytes)?,
            irecv_count: substrate.all_reduce_sum_u64(self.irecv_count)?,
            irecv_bytes: substrate.all_reduce_sum_u64(self.irecv_bytes)?,
            iallreduce_count: substrate.all_reduce_sum_u64(self.iallreduce_count)?,
            max_waitsome_millis: substrate.all_reduce_max_u64(self.waitsome_time.as_millis() as u64)?,
            max_barrier_millis: substrate.all_reduce_max_u64(self.barrier_time.as_millis() as u64)?,
        })
    }
}

/// RAII guard that adds the elapsed time since creation to a `Stats` field
/// when dropped.
pub struct WaitsomeTimer<'a> {
    target: &'a mut Duration,
    start: Instant,
}

impl Drop for WaitsomeTimer<'_> {
    fn drop(&mut self) {
        *self.target += self.start.elapsed();
    }
}

/// Cross-rank reduction of [`Stats`], suitable for a one-time report.
#[derive(Debug, Clone, Default)]
pub struct ReducedStats {
    pub async_count: u64,
    pub isend_count: u64,
    pub isend_bytes: u64,
    pub irecv_count: u64,
    pub irecv_bytes: u64,
    pub iallreduce_count: u64,
    pub max_waitsome_millis: u64,
    pub max_barrier_millis: u64,
}

impl std::fmt::Display for ReducedStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "============== STATS =================")?;
        writeln!(f, "GLOBAL_ASYNC_COUNT       = {}", self.async_count)?;
        writeln!(f, "GLOBAL_ISEND_COUNT       = {}", self.isend_count)?;
        writeln!(f, "GLOBAL_ISEND_BYTES       = {}", self.isend_bytes)?;
        writeln!(f, "GLOBAL_IRECV_COUNT       = {}", self.irecv_count)?;
        writeln!(f, "GLOBAL_IRECV_BYTES       = {}", self.irecv_bytes)?;
        writeln!(f, "COUNT_IALLREDUCE         = {}", self.iallreduce_count)?;
        writeln!(f, "MAX_WAITSOME_MS          = {}", self.max_waitsome_millis)?;
        writeln!(f, "MAX_BARRIER_MS           = {}", self.max_barrier_millis)?;
        write!(f, "======================================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = Stats::new();
        assert_eq!(stats.async_count, 0);
        assert_eq!(stats.isend_bytes, 0);
    }

    #[test]
    fn record_methods_increment_counters() {
        let mut stats = Stats::new();
        stats.record_async();
        stats.record_isend(128);
        stats.record_irecv(64);
        assert_eq!(stats.async_count, 1);
        assert_eq!(stats.isend_count, 1);
        assert_eq!(stats.isend_bytes, 128);
        assert_eq!(stats.irecv_bytes, 64);
    }

    #[test]
    fn timer_accumulates_elapsed_time() {
        let mut stats = Stats::new();
        {
            let _guard = stats.time_waitsome();
        }
        // elapsed time is nondeterministic but must be non-negative and the
        // field must have been touched (Duration defaults to zero, adding
        // `elapsed()` never decreases it).
        assert!(stats.waitsome_time >= Duration::ZERO);
    }

    #[test]
    fn reset_clears_all_fields() {
        let mut stats = Stats::new();
        stats.record_async();
        stats.reset();
        assert_eq!(stats.async_count, 0);
    }
}
