//! An asynchronous active-message engine over a non-blocking message-passing
//! substrate.
//!
//! A process group cooperates by invoking user-supplied closures on remote
//! ranks via [`Engine::async_send`], with aggregation, multi-hop routing, and
//! termination detection handled transparently. The engine itself is
//! single-threaded and cooperative: [`Engine::async_send`] never blocks, and
//! the only suspension points are [`Engine::barrier`] and flushes forced by
//! back-pressure.
//!
//! The engine is generic over a [`Substrate`](substrate::Substrate), the seam
//! abstracting the message-passing backend. [`substrate::local::LocalSubstrate`]
//! simulates a communicator with channels inside one process (always
//! available, used by tests and demos); `substrate::mpi_backend::MpiSubstrate`
//! (feature `mpi-substrate`) talks to a real MPI runtime via the `mpi` crate.

pub mod barrier;
pub mod byte_buffer;
pub mod collectives;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod layout;
pub mod recv;
pub mod registry;
pub mod router;
pub mod send;
pub mod stats;
pub mod substrate;
pub mod trace;

pub use crate::{
    config::EngineConfig,
    engine::Engine,
    error::EngineError,
    layout::Layout,
    router::RoutingMode,
};
