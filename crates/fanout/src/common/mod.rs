//! Shared types and error definitions used across the batching pipeline.
//!
//! ## Submodules
//!
//! - [`error`] - Centralized error type carried on delivery channels and
//!   returned from every fallible operation.
//! - [`types`] - Identifiers, statuses, jobs, fragments and the messages that
//!   move between the worker side and the intake side.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
