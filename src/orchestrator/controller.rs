//! Run lifecycle controller.
//!
//! Owns start/cancel/wait for batch runs and exposes status and manifest
//! snapshots to presentation layers while a run is in progress.

use super::post_process::record_fingerprints;
use crate::aggregate::{AggregateManifest, Aggregator, AggregatorOptions};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::descriptor::{DescriptorBuilder, RunDescriptor};
use crate::engine::{CancelFlag, EngineControl, ModelRunner, ProcessRunner, RetryPolicy, Scheduler, SchedulerReport};
use crate::error::{OrchestratorError, Result};
use crate::fingerprint::{fingerprint, FingerprintStore};
use crate::model::{now_rfc3339, RunEvent, RunId, RunOutcome, RunResult, RunState, TileId, TileOutcome, Validation};
use crate::status::{RunPhase, StatusBoard, StatusReporter, StatusSnapshot, TileState};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const TILES_DIR: &str = "tiles";

/// Everything known about a run once it has finished.
#[derive(Debug, Clone)]
pub struct FinalReport {
    pub run_id: RunId,
    pub manifest: AggregateManifest,
    pub scheduler: SchedulerReport,
    pub reused: usize,
    pub elapsed: Duration,
}

/// Internal handle for a running batch.
struct RunCtx {
    ctrl_tx: UnboundedSender<EngineControl>,
    status: StatusReporter,
    manifest: watch::Receiver<AggregateManifest>,
    handle: Option<JoinHandle<Result<FinalReport>>>,
    report: Option<FinalReport>,
}

/// Starts runs and answers queries about them. Runs are independent; each
/// has its own scheduler, status board and aggregator.
#[derive(Default)]
pub struct Orchestrator {
    runs: Mutex<HashMap<RunId, RunCtx>>,
}

fn gen_run_id() -> RunId {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Descriptors split by whether their outputs can be reused from an earlier run.
struct Plan {
    dispatch: Vec<RunDescriptor>,
    reused: Vec<RunResult>,
    fingerprints: BTreeMap<TileId, String>,
    store: FingerprintStore,
}

fn plan(cfg: &Config, descriptors: Vec<RunDescriptor>) -> Plan {
    let store = FingerprintStore::load(&cfg.output_dir);
    let mut out = Plan {
        dispatch: Vec::with_capacity(descriptors.len()),
        reused: Vec::new(),
        fingerprints: BTreeMap::new(),
        store,
    };
    for desc in descriptors {
        let fp = match fingerprint(&desc) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(tile = %desc.tile_id(), error = %e, "could not fingerprint inputs");
                out.dispatch.push(desc);
                continue;
            }
        };
        let reusable = (!cfg.overwrite)
            .then(|| out.store.reusable(desc.tile_id(), &fp))
            .flatten();
        match reusable {
            Some(artifacts) => {
                info!(tile = %desc.tile_id(), "outputs up to date, skipping");
                out.reused.push(RunResult {
                    tile_id: desc.tile_id().to_string(),
                    attempt: 1,
                    state: RunState::Succeeded,
                    exit_code: None,
                    duration_ms: 0,
                    started_at: now_rfc3339(),
                    artifacts: artifacts.clone(),
                    error: None,
                    stderr_tail: Vec::new(),
                    reused: true,
                });
            }
            None => {
                out.fingerprints.insert(desc.tile_id().to_string(), fp);
                out.dispatch.push(desc);
            }
        }
    }
    out
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunCtx>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run with the subprocess runner built from `cfg`.
    pub fn start_run(&self, roots: &[PathBuf], cfg: Config) -> Result<RunId> {
        let runner = ProcessRunner::from_config(&cfg);
        self.start_run_with(roots, cfg, runner)
    }

    /// Validate, scan and resolve every tile, then spawn the run. Any
    /// configuration problem is returned here, before a single tile is
    /// dispatched. Must be called from within a tokio runtime.
    pub fn start_run_with<R: ModelRunner>(&self, roots: &[PathBuf], mut cfg: Config, runner: R) -> Result<RunId> {
        cfg.validate()?;
        cfg.resolve_dirs();
        let catalog = Catalog::scan(roots, &cfg.required_kinds)?;
        let run_id = gen_run_id();

        let builder = DescriptorBuilder::new(&cfg, &run_id);
        let descriptors = catalog
            .valid()
            .map(|tile| builder.build(Arc::new(tile.clone())))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let Plan {
            dispatch,
            reused,
            fingerprints,
            store,
        } = plan(&cfg, descriptors);

        info!(
            run_id = %run_id,
            tiles = catalog.len(),
            invalid = catalog.invalid().count(),
            reused = reused.len(),
            dispatch = dispatch.len(),
            "starting run"
        );

        let mut initial: BTreeMap<TileId, TileState> = BTreeMap::new();
        let mut aggregator = Aggregator::new(
            run_id.clone(),
            catalog.iter().map(|t| t.id.clone()),
            AggregatorOptions {
                output_dir: cfg.output_dir.clone(),
                products: cfg.output_products.clone(),
                require_all_succeed: cfg.require_all_succeed,
                merge_command: cfg.merge_command.clone(),
            },
        );
        for tile in catalog.invalid() {
            let missing = match &tile.validation {
                Validation::Invalid { missing } => missing.clone(),
                Validation::Complete => Vec::new(),
            };
            initial.insert(tile.id.clone(), TileState::Invalid);
            aggregator.accept(RunEvent::TileSettled {
                tile_id: tile.id.clone(),
                outcome: TileOutcome::Invalid { missing },
            });
        }
        let reused_count = reused.len();
        for result in reused {
            let tile_id = result.tile_id.clone();
            initial.insert(tile_id.clone(), TileState::Succeeded);
            aggregator.accept(RunEvent::AttemptFinished {
                result: Box::new(result),
            });
            aggregator.accept(RunEvent::TileSettled {
                tile_id,
                outcome: TileOutcome::Succeeded,
            });
        }
        for desc in &dispatch {
            initial.insert(desc.tile_id().to_string(), TileState::Queued);
        }

        let (board, reporter) = StatusBoard::new(run_id.clone(), initial);
        let board = Arc::new(board);
        let (manifest_tx, manifest_rx) = watch::channel(aggregator.manifest().clone());

        // Control listener.
        let cancel = CancelFlag::new();
        let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
        let cancel2 = cancel.clone();
        let control_handle = tokio::spawn(async move {
            while let Some(msg) = ctrl_rx.recv().await {
                match msg {
                    EngineControl::Cancel => {
                        cancel2.cancel();
                        break;
                    }
                }
            }
        });

        let scheduler = Scheduler::new(
            runner,
            cfg.concurrency_limit,
            RetryPolicy::from_config(&cfg),
            cfg.output_dir.join(TILES_DIR),
            cancel.clone(),
            board.clone(),
        )
        .with_check_interval(cfg.cancel_check_interval);

        let output_dir = cfg.output_dir.clone();
        let span = info_span!("run", run_id = %run_id);
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(
            async move {
                let start = Instant::now();
                let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RunEvent>();

                // Sole writer of the manifest while the run is in progress.
                let aggregator_task = tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        aggregator.accept(event);
                        manifest_tx.send_replace(aggregator.manifest().clone());
                    }
                    (aggregator, manifest_tx)
                });

                let report = scheduler.run(dispatch, event_tx).await;
                let (mut aggregator, manifest_tx) = aggregator_task
                    .await
                    .map_err(|e| OrchestratorError::Join(e.to_string()))?;
                control_handle.abort();

                board.set_phase(RunPhase::Finalizing);
                let manifest = match aggregator.finalize(report.was_cancelled).await {
                    Ok(m) => m,
                    Err(e) => {
                        board.set_phase(RunPhase::Finished);
                        return Err(e);
                    }
                };

                if let Err(e) = record_fingerprints(&output_dir, store, &fingerprints, &manifest) {
                    warn!(error = %e, "failed to save fingerprints");
                }

                manifest_tx.send_replace(manifest.clone());
                let outcome = manifest.outcome.unwrap_or(RunOutcome::Aborted);
                board.finish(outcome);
                Ok(FinalReport {
                    run_id: task_run_id,
                    manifest,
                    scheduler: report,
                    reused: reused_count,
                    elapsed: start.elapsed(),
                })
            }
            .instrument(span),
        );

        self.runs().insert(
            run_id.clone(),
            RunCtx {
                ctrl_tx,
                status: reporter,
                manifest: manifest_rx,
                handle: Some(handle),
                report: None,
            },
        );
        Ok(run_id)
    }

    pub fn get_status(&self, run_id: &str) -> Option<StatusSnapshot> {
        self.runs().get(run_id).map(|ctx| ctx.status.query())
    }

    /// A reporter that can be awaited for changes, for live progress output.
    pub fn status_reporter(&self, run_id: &str) -> Option<StatusReporter> {
        self.runs().get(run_id).map(|ctx| ctx.status.clone())
    }

    /// Returns `true` if a still-running run was signalled.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs().get(run_id) {
            Some(ctx) => {
                let sent = ctx.ctrl_tx.send(EngineControl::Cancel).is_ok();
                if sent {
                    info!(run_id, "cancellation requested");
                }
                sent
            }
            None => false,
        }
    }

    /// In-progress snapshot while running, the finalized manifest afterwards.
    pub fn get_manifest(&self, run_id: &str) -> Option<AggregateManifest> {
        self.runs().get(run_id).map(|ctx| ctx.manifest.borrow().clone())
    }

    /// Drop a finished run so its manifest is no longer held in memory.
    /// Returns `false` for unknown runs and runs still in progress.
    pub fn forget(&self, run_id: &str) -> bool {
        let mut runs = self.runs();
        let finished = runs.get(run_id).is_some_and(|ctx| {
            ctx.report.is_some() || ctx.handle.as_ref().is_some_and(|h| h.is_finished())
        });
        if finished {
            runs.remove(run_id);
            debug!(run_id, "run forgotten");
        }
        finished
    }

    /// Wait for a run to finish. May be called again after completion.
    pub async fn wait(&self, run_id: &str) -> Result<FinalReport> {
        let handle = {
            let mut runs = self.runs();
            let ctx = runs
                .get_mut(run_id)
                .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
            if let Some(report) = &ctx.report {
                return Ok(report.clone());
            }
            ctx.handle
                .take()
                .ok_or_else(|| OrchestratorError::Join(format!("run {run_id} is already being awaited")))?
        };

        let report = handle
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))??;
        if let Some(ctx) = self.runs().get_mut(run_id) {
            ctx.report = Some(report.clone());
        }
        Ok(report)
    }
}
