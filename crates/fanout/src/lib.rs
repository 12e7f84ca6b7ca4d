#![doc = include_str!("../README.md")]

mod batcher;
mod common;
mod config;
mod dispatcher;
mod generator;
mod ledger;
mod pool;
mod queue;
mod service;
mod streaming;

#[cfg(test)]
mod testing;

pub use crate::batcher::*;
pub use crate::common::*;
pub use crate::config::*;
pub use crate::dispatcher::*;
pub use crate::generator::*;
pub use crate::ledger::*;
pub use crate::pool::*;
pub use crate::queue::*;
pub use crate::service::*;
pub use crate::streaming::*;
