//! Engine configuration: construction-time knobs, with environment-variable
//! overrides collected into a single settings object. Explicit builder
//! calls always win over the environment; the environment only supplies
//! defaults when a setter was not called.

use std::{env, str::FromStr};

use crate::{
    error::{EngineError, Result},
    router::RoutingMode,
};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_NUM_IRECVS: usize = 8;
// 1 GiB of total inbound staging divided across the default irecv count.
const DEFAULT_IRECV_SIZE: usize = 128 * 1024 * 1024;
const DEFAULT_NUM_ISENDS_WAIT: usize = 4;
const DEFAULT_SEND_FREE_LIST_LEN: usize = 4;

/// Construction-time engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Soft cap, in bytes, on queued outbound bytes per destination before
    /// back-pressure forces progress.
    pub buffer_size: usize,
    /// Number of pre-posted receive slots.
    pub num_irecvs: usize,
    /// Size, in bytes, of each pre-posted receive slot.
    pub irecv_size: usize,
    /// Send-queue length above which a progress step blocks on a wait-any
    /// instead of polling non-blockingly.
    pub num_isends_wait: usize,
    /// Cap on recycled send buffers kept in the free list.
    pub send_buffer_free_list_len: usize,
    /// Default multi-hop routing policy.
    pub routing: RoutingMode,
    /// Every `freq_issend`-th flush of a destination uses synchronous-ready
    /// (`Issend`) semantics instead of a plain non-blocking send; `0`
    /// disables this.
    pub freq_issend: u32,
    /// Emit a one-time banner from rank 0 at construction.
    pub welcome: bool,
    /// Intra-node size `L`; ranks must be uniformly distributed across
    /// nodes with this size.
    pub local_size: i32,
    /// If set, per-rank JSON-lines trace events are appended here.
    pub trace_path: Option<std::path::PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_irecvs: DEFAULT_NUM_IRECVS,
            irecv_size: DEFAULT_IRECV_SIZE,
            num_isends_wait: DEFAULT_NUM_ISENDS_WAIT,
            send_buffer_free_list_len: DEFAULT_SEND_FREE_LIST_LEN,
            routing: RoutingMode::None,
            freq_issend: 0,
            welcome: false,
            local_size: 1,
            trace_path: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration starting from defaults, layering environment
    /// variable overrides on top. Call setters afterward to override the
    /// environment in turn.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_usize("YGM_BUFFER_SIZE_KB") {
            config.buffer_size = v * 1024;
        }
        if let Some(v) = env_usize("YGM_NUM_IRECVS") {
            config.num_irecvs = v;
        }
        if let Some(v) = env_usize("YGM_IRECV_SIZE_KB") {
            config.irecv_size = v * 1024;
        }
        if let Some(v) = env_usize("YGM_NUM_ISENDS_WAIT") {
            config.num_isends_wait = v;
        }
        if let Ok(v) = env::var("YGM_ROUTING") {
            if let Ok(mode) = RoutingMode::from_str(&v) {
                config.routing = mode;
            }
        }
        if let Some(v) = env_u32("YGM_FREQ_ISSEND") {
            config.freq_issend = v;
        }
        if let Ok(v) = env::var("YGM_WELCOME") {
            config.welcome = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(v) = env::var("YGM_TRACE_PATH") {
            config.trace_path = Some(v.into());
        }

        config
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_num_irecvs(mut self, n: usize) -> Self {
        self.num_irecvs = n;
        self
    }

    pub fn with_irecv_size(mut self, bytes: usize) -> Self {
        self.irecv_size = bytes;
        self
    }

    pub fn with_routing(mut self, mode: RoutingMode) -> Self {
        self.routing = mode;
        self
    }

    pub fn with_freq_issend(mut self, freq: u32) -> Self {
        self.freq_issend = freq;
        self
    }

    pub fn with_local_size(mut self, local_size: i32) -> Self {
        self.local_size = local_size;
        self
    }

    pub fn with_trace_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(EngineError::InvalidConfig("buffer_size must be nonzero".into()));
        }
        if self.irecv_size == 0 || self.num_irecvs == 0 {
            return Err(EngineError::InvalidConfig(
                "irecv_size and num_irecvs must be nonzero".into(),
            ));
        }
        if self.local_size <= 0 {
            return Err(EngineError::InvalidConfig("local_size must be positive".into()));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budget() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_size, 16 * 1024 * 1024);
        assert_eq!(config.num_irecvs * config.irecv_size, 1024 * 1024 * 1024);
        assert_eq!(config.send_buffer_free_list_len, 4);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfig::new().with_buffer_size(1024).with_routing(RoutingMode::NodeRouted);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.routing, RoutingMode::NodeRouted);
    }

    #[test]
    fn rejects_zero_buffer_size() {
        let config = EngineConfig::new().with_buffer_size(0);
        assert!(config.validate().is_err());
    }
}
