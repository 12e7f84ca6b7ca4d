//! Fragment production and routing.
//!
//! ## Submodules
//!
//! - [`processor`] - Runs the requests of a claimed job through the generator
//!   and emits tagged fragments.
//! - [`relay`] - Routes fragments from workers to per-request delivery
//!   channels.

pub mod processor;
pub mod relay;

pub use processor::RequestOutcome;
pub use relay::*;
