//! Application-level orchestration.
//!
//! This module owns run lifecycle control (start/cancel/wait) and post-run
//! processing such as fingerprint bookkeeping. The CLI calls into this module
//! to keep responsibilities separated.

mod controller;
mod post_process;

pub use controller::{FinalReport, Orchestrator, TILES_DIR};
