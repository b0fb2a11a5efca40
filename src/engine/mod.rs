//! Execution engine: model runners, retry policy and the worker pool.

mod process;
mod retry;
mod scheduler;

pub use process::{is_error_line, ProcessRunner};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerReport};

use crate::descriptor::RunDescriptor;
use crate::model::RunResult;
use futures::future::BoxFuture;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Stop dispatching and terminate in-flight model processes
    Cancel,
}

/// Shared cancellation flag, polled by workers at their check interval.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs one model invocation to a terminal [`RunResult`].
///
/// Implementations never fail: spawn errors, non-zero exits, timeouts and
/// cancellation are all reported through [`RunResult::state`]. The working
/// directory has already been prepared when `run` is called.
pub trait ModelRunner: Send + Sync + 'static {
    fn run<'a>(
        &'a self,
        desc: &'a RunDescriptor,
        attempt: u32,
        cancel: CancelFlag,
    ) -> BoxFuture<'a, RunResult>;
}

impl<R: ModelRunner + ?Sized> ModelRunner for Arc<R> {
    fn run<'a>(
        &'a self,
        desc: &'a RunDescriptor,
        attempt: u32,
        cancel: CancelFlag,
    ) -> BoxFuture<'a, RunResult> {
        (**self).run(desc, attempt, cancel)
    }
}
