//! Pre-posted non-blocking receives for one logical channel.
//!
//! Keeps a fixed number of outstanding receive slots posted at all times.
//! Since every backend here resolves a receive's bytes at completion time
//! rather than writing into a caller-owned buffer, "reposting" a slot is
//! simply issuing a fresh wildcard-source [`RecvHandle`] — the slots are
//! interchangeable, so which one reports a given arrival is not meaningful,
//! only that their count stays constant. `max_message_bytes` still bounds
//! inbound staging memory even without a fixed per-slot buffer: an arrival
//! larger than a configured receive slot is rejected rather than silently
//! accepted at unbounded size.

use std::collections::VecDeque;

use crate::{
    error::{EngineError, Result},
    substrate::{Channel, RecvHandle, RecvResult, Substrate},
};

pub struct ReceivePool {
    channel: Channel,
    slots: VecDeque<RecvHandle>,
    max_message_bytes: usize,
}

impl ReceivePool {
    /// Posts `count` receives on `channel`, each allowed up to
    /// `max_message_bytes` of payload.
    pub fn new(channel: Channel, count: usize, max_message_bytes: usize, substrate: &dyn Substrate) -> Result<Self> {
        let mut slots = VecDeque::with_capacity(count);
        for _ in 0..count {
            slots.push_back(substrate.irecv(channel)?);
        }
        Ok(Self {
            channel,
            slots,
            max_message_bytes,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    fn check_size(&self, result: &RecvResult) -> Result<()> {
        if result.bytes.len() > self.max_message_bytes {
            return Err(EngineError::Invariant(format!(
                "message of {} bytes from rank {} exceeds the configured receive slot size of {} bytes",
                result.bytes.len(),
                result.source,
                self.max_message_bytes
            )));
        }
        Ok(())
    }

    /// Non-blocking test of the head slot. Reposts it whether or not it
    /// completed, keeping the pool at a constant depth.
    pub fn poll_head(&mut self, substrate: &dyn Substrate) -> Result<Option<RecvResult>> {
        let Some(mut handle) = self.slots.pop_front() else {
            return Ok(None);
        };
        match substrate.test_recv(&mut handle)? {
            Some(result) => {
                self.slots.push_back(substrate.irecv(self.channel)?);
                self.check_size(&result)?;
                Ok(Some(result))
            }
            None => {
                self.slots.push_back(handle);
                Ok(None)
            }
        }
    }

    /// Blocks until a message arrives on this pool's channel, then reposts.
    pub fn wait_any(&mut self, substrate: &dyn Substrate) -> Result<RecvResult> {
        let result = substrate.wait_any_recv(self.channel)?;
        self.slots.pop_front();
        self.slots.push_back(substrate.irecv(self.channel)?);
        self.check_size(&result)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::local::LocalSubstrate;

    #[test]
    fn poll_head_on_empty_pool_returns_none_and_keeps_depth() {
        let subs = LocalSubstrate::cluster(2);
        let mut pool = ReceivePool::new(Channel::AsyncData, 4, 1024, &subs[0]).unwrap();
        assert!(pool.poll_head(&subs[0]).unwrap().is_none());
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn poll_head_observes_arrival_and_reposts() {
        let subs = LocalSubstrate::cluster(2);
        let mut pool = ReceivePool::new(Channel::AsyncData, 2, 1024, &subs[0]).unwrap();
        subs[1].isend(0, Channel::AsyncData, vec![9, 9]).unwrap();
        let result = pool.poll_head(&subs[0]).unwrap().unwrap();
        assert_eq!(result.bytes, vec![9, 9]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn poll_head_rejects_a_message_over_the_configured_slot_size() {
        let subs = LocalSubstrate::cluster(2);
        let mut pool = ReceivePool::new(Channel::AsyncData, 2, 4, &subs[0]).unwrap();
        subs[1].isend(0, Channel::AsyncData, vec![0u8; 5]).unwrap();
        assert!(pool.poll_head(&subs[0]).unwrap_err().to_string().contains("exceeds"));
    }
}
