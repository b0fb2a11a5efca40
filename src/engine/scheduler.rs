//! Bounded worker pool.
//!
//! A single dispatch loop owns every [`RunDescriptor`]. A descriptor is moved
//! into exactly one worker and handed back with the result, so a tile can
//! never be in two workers at once. Ready work is ordered by
//! (eligible time, first attempt before retry, catalog position).

use crate::descriptor::{harvest_artifacts, RunDescriptor};
use crate::engine::retry::{RetryDecision, RetryPolicy};
use crate::engine::{CancelFlag, ModelRunner};
use crate::model::{now_rfc3339, RunAttempt, RunEvent, RunResult, RunState, TileOutcome};
use crate::status::{StatusBoard, TileState};
use futures::FutureExt;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    eligible: Instant,
    // false sorts first: first attempts win ties against retries.
    retry: bool,
    seq: usize,
}

/// Counters describing one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub gave_up: usize,
    pub cancelled: usize,
    pub max_in_flight: usize,
    pub was_cancelled: bool,
}

pub struct Scheduler<R: ModelRunner> {
    runner: Arc<R>,
    concurrency: usize,
    retry: RetryPolicy,
    tiles_dir: PathBuf,
    check_interval: Duration,
    cancel: CancelFlag,
    status: Arc<StatusBoard>,
}

struct Slot {
    desc: Option<RunDescriptor>,
    attempt: RunAttempt,
    settled: bool,
}

impl<R: ModelRunner> Scheduler<R> {
    /// `tiles_dir` receives harvested artifacts as `<tiles_dir>/<tile>/<product>.tif`.
    pub fn new(
        runner: R,
        concurrency: usize,
        retry: RetryPolicy,
        tiles_dir: PathBuf,
        cancel: CancelFlag,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            runner: Arc::new(runner),
            concurrency: concurrency.max(1),
            retry,
            tiles_dir,
            check_interval: Duration::from_millis(100),
            cancel,
            status,
        }
    }

    /// How often an idle dispatch loop re-checks the cancellation flag.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Run every descriptor to a terminal outcome, emitting each attempt's
    /// result and each tile's final disposition on `events`.
    pub async fn run(
        self,
        descriptors: Vec<RunDescriptor>,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> SchedulerReport {
        let start = Instant::now();
        let mut report = SchedulerReport::default();
        let mut ready: BinaryHeap<Reverse<ReadyEntry>> = BinaryHeap::new();
        let mut slots: Vec<Slot> = Vec::with_capacity(descriptors.len());
        for (seq, desc) in descriptors.into_iter().enumerate() {
            self.status.set_tile(desc.tile_id(), TileState::Queued);
            ready.push(Reverse(ReadyEntry {
                eligible: start,
                retry: false,
                seq,
            }));
            slots.push(Slot {
                desc: Some(desc),
                attempt: RunAttempt::first(start),
                settled: false,
            });
        }

        let mut workers: JoinSet<(usize, RunDescriptor, RunResult)> = JoinSet::new();
        let mut check = tokio::time::interval(self.check_interval);

        loop {
            let cancelled = self.cancel.is_cancelled();
            if !cancelled {
                self.dispatch_ready(&mut ready, &mut slots, &mut workers, &mut report);
            }
            if workers.is_empty() && (ready.is_empty() || cancelled) {
                break;
            }

            let wake = if !cancelled && workers.len() < self.concurrency {
                ready.peek().map(|Reverse(e)| e.eligible)
            } else {
                None
            };

            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((seq, desc, result)) => {
                            self.complete(seq, desc, result, &mut ready, &mut slots, &events, &mut report);
                        }
                        Err(e) => {
                            // Workers catch panics, so this only happens on runtime shutdown.
                            error!(error = %e, "worker task failed to join");
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake.unwrap_or(start)), if wake.is_some() => {}
                _ = check.tick() => {}
            }
        }

        if self.cancel.is_cancelled() {
            report.was_cancelled = true;
            // Everything still queued or waiting on backoff is cancelled without a result.
            for slot in slots.iter_mut().filter(|s| !s.settled) {
                if let Some(desc) = &slot.desc {
                    let tile_id = desc.tile_id().to_string();
                    self.settle(&tile_id, TileOutcome::Cancelled, &events, &mut report);
                    slot.settled = true;
                }
            }
        }

        info!(
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            gave_up = report.gave_up,
            cancelled = report.cancelled,
            "scheduler finished"
        );
        report
    }

    fn dispatch_ready(
        &self,
        ready: &mut BinaryHeap<Reverse<ReadyEntry>>,
        slots: &mut [Slot],
        workers: &mut JoinSet<(usize, RunDescriptor, RunResult)>,
        report: &mut SchedulerReport,
    ) {
        let now = Instant::now();
        while workers.len() < self.concurrency {
            match ready.peek() {
                Some(Reverse(entry)) if entry.eligible <= now => {}
                _ => break,
            }
            let Some(Reverse(entry)) = ready.pop() else {
                break;
            };
            let slot = &mut slots[entry.seq];
            let Some(desc) = slot.desc.take() else {
                // Descriptor is with a worker; never hand a tile out twice.
                warn!(seq = entry.seq, "tile already in flight, skipping duplicate entry");
                continue;
            };
            slot.attempt.attempts += 1;
            let attempt = slot.attempt.attempts;

            self.status
                .set_tile(desc.tile_id(), TileState::Running { attempt });
            debug!(tile = %desc.tile_id(), attempt, retry = entry.retry, "dispatching");

            let runner = self.runner.clone();
            let cancel = self.cancel.clone();
            let tiles_dir = self.tiles_dir.clone();
            let seq = entry.seq;
            let span = info_span!("tile", tile = %desc.tile_id(), attempt);
            workers.spawn(
                async move {
                    let result = AssertUnwindSafe(run_attempt(&*runner, &desc, attempt, cancel, &tiles_dir))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            RunResult::failed(
                                desc.tile_id(),
                                attempt,
                                now_rfc3339(),
                                "model runner panicked".to_string(),
                            )
                        });
                    (seq, desc, result)
                }
                .instrument(span),
            );
            report.dispatched += 1;
            report.max_in_flight = report.max_in_flight.max(workers.len());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        seq: usize,
        desc: RunDescriptor,
        result: RunResult,
        ready: &mut BinaryHeap<Reverse<ReadyEntry>>,
        slots: &mut [Slot],
        events: &mpsc::UnboundedSender<RunEvent>,
        report: &mut SchedulerReport,
    ) {
        let tile_id = desc.tile_id().to_string();
        let state = result.state;
        let attempt = result.attempt;
        match state {
            RunState::Succeeded => {
                info!(tile = %tile_id, attempt, duration_ms = result.duration_ms, "tile succeeded")
            }
            _ => warn!(
                tile = %tile_id,
                attempt,
                ?state,
                error = result.error.as_deref().unwrap_or(""),
                "tile attempt did not succeed"
            ),
        }
        let _ = events.send(RunEvent::AttemptFinished {
            result: Box::new(result.clone()),
        });

        let slot = &mut slots[seq];
        slot.desc = Some(desc);

        let outcome = match state {
            RunState::Succeeded => TileOutcome::Succeeded,
            RunState::Cancelled => TileOutcome::Cancelled,
            RunState::Failed | RunState::TimedOut => {
                match self.retry.advance(&mut slot.attempt, &result, Instant::now()) {
                    RetryDecision::Retry { .. } if self.cancel.is_cancelled() => TileOutcome::Cancelled,
                    RetryDecision::Retry { after } => {
                        info!(tile = %tile_id, attempt, backoff = %humantime::format_duration(after), "scheduling retry");
                        self.status.set_tile(
                            &tile_id,
                            TileState::Retrying {
                                attempt,
                                backoff_ms: after.as_millis() as u64,
                            },
                        );
                        ready.push(Reverse(ReadyEntry {
                            eligible: slot.attempt.next_eligible,
                            retry: true,
                            seq,
                        }));
                        return;
                    }
                    RetryDecision::GiveUp => {
                        warn!(tile = %tile_id, attempts = slot.attempt.attempts, "giving up on tile");
                        TileOutcome::GaveUp
                    }
                }
            }
        };
        slot.settled = true;
        self.settle(&tile_id, outcome, events, report);
    }

    fn settle(
        &self,
        tile_id: &str,
        outcome: TileOutcome,
        events: &mpsc::UnboundedSender<RunEvent>,
        report: &mut SchedulerReport,
    ) {
        let state = match &outcome {
            TileOutcome::Succeeded => {
                report.succeeded += 1;
                TileState::Succeeded
            }
            TileOutcome::GaveUp => {
                report.gave_up += 1;
                TileState::Failed
            }
            TileOutcome::Cancelled => {
                report.cancelled += 1;
                TileState::Cancelled
            }
            TileOutcome::Invalid { .. } => TileState::Invalid,
        };
        self.status.set_tile(tile_id, state);
        let _ = events.send(RunEvent::TileSettled {
            tile_id: tile_id.to_string(),
            outcome,
        });
    }
}

/// One attempt: stage the working directory, run the model, keep its outputs.
/// The working directory guard drops on every path out of this function.
async fn run_attempt<R: ModelRunner + ?Sized>(
    runner: &R,
    desc: &RunDescriptor,
    attempt: u32,
    cancel: CancelFlag,
    tiles_dir: &std::path::Path,
) -> RunResult {
    let work_dir = match desc.prepare() {
        Ok(guard) => guard,
        Err(e) => {
            return RunResult::failed(
                desc.tile_id(),
                attempt,
                now_rfc3339(),
                format!("failed to prepare {}: {e}", desc.work_dir.display()),
            );
        }
    };

    let mut result = runner.run(desc, attempt, cancel).await;
    if result.state == RunState::Succeeded {
        match harvest_artifacts(&result.artifacts, &tiles_dir.join(desc.tile_id())) {
            Ok(moved) => result.artifacts = moved,
            Err(e) => {
                result.state = RunState::Failed;
                result.artifacts.clear();
                result.error = Some(format!("failed to collect outputs: {e}"));
            }
        }
    }
    drop(work_dir);
    result
}
