//! Per-destination send aggregation, flush policy, and buffer recycling.
//!
//! Frames for the same destination accumulate in one growable buffer until
//! it is flushed — moved into an in-flight send and replaced with a fresh
//! buffer drawn from a free list (or freshly allocated, if the free list is
//! empty or past its cap). `freq_issend` makes every k-th flush of a given
//! destination wait for that specific send to complete before returning,
//! standing in for an occasional synchronous-ready (`Issend`) send, which
//! bounds the number of unmatched outstanding sends; the non-blocking
//! backends used here complete sends eagerly, so waiting for completion is
//! a direct (if input-order-blind) analogue.

use std::collections::{HashMap, VecDeque};

use crate::{
    byte_buffer::ByteBuffer,
    error::Result,
    stats::Stats,
    substrate::{Channel, SendHandle, Substrate},
};

struct InFlightSend {
    buffer: ByteBuffer,
    handle: SendHandle,
}

/// Owns every per-destination send buffer, the free list, and the queue of
/// in-flight sends. Used solely by the single progress context — no locks.
pub struct SendAggregator {
    buffers: HashMap<i32, ByteBuffer>,
    dest_queue: VecDeque<i32>,
    free_list: Vec<ByteBuffer>,
    free_list_cap: usize,
    in_flight: VecDeque<InFlightSend>,
    flush_counts: HashMap<i32, u32>,
}

impl SendAggregator {
    pub fn new(free_list_cap: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            dest_queue: VecDeque::new(),
            free_list: Vec::new(),
            free_list_cap,
            in_flight: VecDeque::new(),
            flush_counts: HashMap::new(),
        }
    }

    /// Bytes queued (not yet flushed) across every destination.
    pub fn queued_bytes(&self) -> usize {
        self.buffers.values().map(ByteBuffer::len).sum()
    }

    /// Bytes posted to a non-blocking send but not yet completed.
    pub fn pending_bytes(&self) -> usize {
        self.in_flight.iter().map(|s| s.buffer.len()).sum()
    }

    /// Number of sends posted but not yet observed complete.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn take_buffer(&mut self) -> ByteBuffer {
        self.free_list.pop().unwrap_or_default()
    }

    /// Returns the destination's accumulation buffer, enqueueing the
    /// destination for flushing if it isn't already queued.
    pub fn buffer_for(&mut self, dest: i32) -> &mut ByteBuffer {
        let buffer = self.buffers.entry(dest).or_default();
        if buffer.is_empty() {
            self.dest_queue.push_back(dest);
        }
        buffer
    }

    /// Whether any destination has queued bytes awaiting flush.
    pub fn has_queued_destination(&self) -> bool {
        !self.dest_queue.is_empty()
    }

    /// Flushes one queued destination, if any.
    pub fn flush_one(
        &mut self,
        substrate: &dyn Substrate,
        freq_issend: u32,
        stats: &mut Stats,
    ) -> Result<()> {
        let Some(dest) = self.dest_queue.pop_front() else {
            return Ok(());
        };
        let mut outgoing = self.buffers.remove(&dest).unwrap_or_default();
        if outgoing.is_empty() {
            return Ok(());
        }
        let fresh = self.take_buffer();
        self.buffers.insert(dest, fresh);

        let bytes_len = outgoing.len();
        let mut handle = substrate.isend(dest, Channel::AsyncData, outgoing.data().to_vec())?;
        stats.record_isend(bytes_len);
        stats.record_route();

        let should_wait = freq_issend > 0 && {
            let count = self.flush_counts.entry(dest).or_insert(0);
            *count += 1;
            *count % freq_issend == 0
        };

        if should_wait {
            while !substrate.test_send(&mut handle)? {
                std::hint::spin_loop();
            }
            // Completed synchronously: buffer is immediately reusable.
            self.recycle(outgoing);
        } else {
            self.in_flight.push_back(InFlightSend {
                buffer: outgoing,
                handle,
            });
        }

        Ok(())
    }

    /// Flushes every currently queued destination.
    pub fn flush_all_queued(
        &mut self,
        substrate: &dyn Substrate,
        freq_issend: u32,
        stats: &mut Stats,
    ) -> Result<()> {
        while self.has_queued_destination() {
            self.flush_one(substrate, freq_issend, stats)?;
        }
        Ok(())
    }

    /// Flushes destinations until queued bytes fall back under `buffer_size`.
    pub fn flush_to_capacity(
        &mut self,
        substrate: &dyn Substrate,
        buffer_size: usize,
        freq_issend: u32,
        stats: &mut Stats,
    ) -> Result<()> {
        while self.queued_bytes() > buffer_size && self.has_queued_destination() {
            self.flush_one(substrate, freq_issend, stats)?;
        }
        Ok(())
    }

    /// Tests every in-flight send once, recycling buffers for those that
    /// completed. Returns the number that completed.
    pub fn drain_completed(&mut self, substrate: &dyn Substrate) -> Result<usize> {
        let mut completed = 0;
        let mut still_pending = VecDeque::with_capacity(self.in_flight.len());
        while let Some(mut inflight) = self.in_flight.pop_front() {
            if substrate.test_send(&mut inflight.handle)? {
                completed += 1;
                self.recycle(inflight.buffer);
            } else {
                still_pending.push_back(inflight);
            }
        }
        self.in_flight = still_pending;
        Ok(completed)
    }

    fn recycle(&mut self, mut buffer: ByteBuffer) {
        buffer.clear();
        if self.free_list.len() < self.free_list_cap {
            self.free_list.push(buffer);
        }
    }

    /// True once every buffer is empty, nothing is queued, and nothing is
    /// in flight — part of the quiescence check.
    pub fn is_idle(&self) -> bool {
        self.queued_bytes() == 0 && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::local::LocalSubstrate;

    #[test]
    fn buffer_for_enqueues_destination_once() {
        let mut agg = SendAggregator::new(4);
        agg.buffer_for(3).push_bytes(b"a");
        agg.buffer_for(3).push_bytes(b"b");
        assert_eq!(agg.queued_bytes(), 2);
    }

    #[test]
    fn flush_one_posts_send_and_recycles_on_completion() {
        let subs = LocalSubstrate::cluster(2);
        let sub = &subs[0];
        let mut agg = SendAggregator::new(4);
        let mut stats = Stats::new();
        agg.buffer_for(1).push_bytes(b"hello");
        agg.flush_one(sub, 0, &mut stats).unwrap();
        assert_eq!(agg.pending_bytes(), 5);
        let completed = agg.drain_completed(sub).unwrap();
        assert_eq!(completed, 1);
        assert_eq!(agg.pending_bytes(), 0);
        assert!(agg.is_idle());
    }

    #[test]
    fn flush_to_capacity_drains_until_under_budget() {
        let subs = LocalSubstrate::cluster(3);
        let sub = &subs[0];
        let mut agg = SendAggregator::new(4);
        let mut stats = Stats::new();
        agg.buffer_for(1).push_bytes(&[0u8; 10]);
        agg.buffer_for(2).push_bytes(&[0u8; 10]);
        agg.flush_to_capacity(sub, 5, 0, &mut stats).unwrap();
        assert_eq!(agg.queued_bytes(), 0);
    }

    #[test]
    fn destination_is_re_enqueued_after_being_flushed() {
        let subs = LocalSubstrate::cluster(2);
        let sub = &subs[0];
        let mut agg = SendAggregator::new(4);
        let mut stats = Stats::new();

        agg.buffer_for(1).push_bytes(b"first");
        agg.flush_one(sub, 0, &mut stats).unwrap();
        assert!(!agg.has_queued_destination());

        agg.buffer_for(1).push_bytes(b"second");
        assert!(agg.has_queued_destination(), "dest 1 must be re-queued after its buffer was flushed and replaced");
        agg.flush_one(sub, 0, &mut stats).unwrap();
        assert_eq!(agg.pending_bytes(), 11);
    }
}
