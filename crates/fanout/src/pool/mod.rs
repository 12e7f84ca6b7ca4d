//! Worker pool that drains the work queue.
//!
//! ## Submodules
//!
//! - [`manager`] - Spawns workers and coordinates their shutdown.
//! - [`worker`] - The per-worker claim/process/ack loop.

pub mod manager;
pub mod worker;

pub use manager::*;
pub use worker::{WorkerCommand, WorkerContext};
