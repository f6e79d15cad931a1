//! Harvest module - the image collection loop.
//!
//! This module provides the core of the collector:
//! - **Filter**: per-iteration repository allow/deny list via [`RepoFilter`]
//! - **Ledger**: durable record of processed images via [`Ledger`]
//! - **Pipeline**: pull, batch, extract and record via [`BatchController`]
//! - **Sinks**: result fan-out via [`SinkFanOut`]
//! - **Driver**: the outer poll loop via [`IterationDriver`]

pub mod driver;
pub mod filter;
pub mod ledger;
pub mod pending;
pub mod pipeline;
pub mod sinks;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use driver::{CollectorState, DriverState, IterationDriver, IterationSummary};
pub use filter::{parse_repo_list, RepoFilter};
pub use ledger::{Ledger, LedgerError};
pub use pending::PendingQueue;
pub use pipeline::{BatchController, PassStats};
pub use sinks::{FanOutReport, FileSink, RemoteSink, SinkFanOut};
