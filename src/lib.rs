//! Batch orchestration for the AutoRoute flood-inundation model.
//!
//! A run scans a catalog of input tiles, renders one AutoRoute parameter file
//! per tile, runs the model as a subprocess under a bounded worker pool with
//! timeouts, retries and cancellation, and aggregates every attempt into a
//! run manifest plus mosaic input lists.

pub mod aggregate;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod status;
mod text_summary;

pub use aggregate::{AggregateManifest, Aggregator};
pub use catalog::Catalog;
pub use config::Config;
pub use error::{ConfigError, OrchestratorError, Result};
pub use orchestrator::{FinalReport, Orchestrator};
