//! Error taxonomy for the engine.
//!
//! Substrate errors and invariant violations are fatal by design: the engine
//! does not define a retry policy for either. User errors raised by a
//! trampoline are fatal only at the receiving rank and are never propagated
//! to the sender. Capacity pressure is not an error at all; it is recovered
//! silently by forcing progress (see [`crate::progress`] — folded into
//! [`crate::engine`]).

use thiserror::Error;

use crate::substrate::SubstrateError;

/// Errors surfaced by the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The message-passing backend reported a non-success result. Fatal:
    /// callers are expected to abort the process group.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// A configuration value failed validation at construction time.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// A trampoline for `tag` failed to deserialize its arguments or the
    /// user callable returned an error. Raised only to the rank that ran it.
    #[error("trampoline for tag {tag} failed: {source}")]
    Trampoline {
        tag: u16,
        #[source]
        source: anyhow::Error,
    },

    /// A frame referenced a tag with no registered trampoline. This can only
    /// happen if ranks registered trampolines in different orders, which is
    /// itself an invariant violation of the registry.
    #[error("no trampoline registered for tag {0}")]
    UnregisteredTag(u16),

    /// A free-list, frame-size, or teardown invariant was violated. These are
    /// programming errors in the engine or its caller, not recoverable
    /// conditions, and are reported with enough context to diagnose without
    /// a debugger.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
