use crate::config::Config;
use crate::descriptor::RunDescriptor;
use crate::engine::{CancelFlag, ModelRunner};
use crate::model::{now_rfc3339, RunResult, RunState};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long to wait for pipe readers after the process is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Fed to stdin so the model exits on bad input instead of waiting for a keypress.
const STDIN_ACK: &[u8] = b"a\n";

/// One external program run against the tile's parameter file.
#[derive(Debug, Clone)]
struct Stage {
    name: &'static str,
    executable: PathBuf,
    args: Vec<String>,
}

/// Runs the AutoRoute executable as a subprocess, followed by FloodSpreader
/// when one is configured. Both stages share the tile's working directory and
/// its timeout.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    model: Stage,
    floodspreader: Option<Stage>,
    timeout: Duration,
    check_interval: Duration,
    stderr_tail: usize,
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

struct StageOutput {
    exit: Exit,
    error_line: Option<String>,
    stderr_tail: Vec<String>,
}

impl ProcessRunner {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: Stage {
                name: "model",
                executable: resolve_executable(&cfg.model_executable),
                args: cfg.model_args.clone(),
            },
            floodspreader: cfg.floodspreader_executable.as_ref().map(|exe| Stage {
                name: "floodspreader",
                executable: resolve_executable(exe),
                args: cfg.floodspreader_args.clone(),
            }),
            timeout: cfg.timeout_per_tile,
            check_interval: cfg.cancel_check_interval,
            stderr_tail: cfg.stderr_tail_lines,
        }
    }

    pub async fn run_process(
        &self,
        desc: &RunDescriptor,
        attempt: u32,
        cancel: CancelFlag,
    ) -> RunResult {
        let started_at = now_rfc3339();
        let start = Instant::now();
        let deadline = start + self.timeout;

        let mut result = RunResult {
            tile_id: desc.tile_id().to_string(),
            attempt,
            state: RunState::Failed,
            exit_code: None,
            duration_ms: 0,
            started_at,
            artifacts: BTreeMap::new(),
            error: None,
            stderr_tail: Vec::new(),
            reused: false,
        };

        let mut passed = self.run_stage(&self.model, desc, deadline, &cancel, &mut result).await;
        if passed {
            if let Some(stage) = &self.floodspreader {
                remove_stale_maps(desc);
                passed = self.run_stage(stage, desc, deadline, &cancel, &mut result).await;
            }
        }

        if passed {
            result.state = RunState::Succeeded;
            for product in &desc.products {
                let path = desc.work_dir.join(product.file_name());
                if path.is_file() {
                    result.artifacts.insert(*product, path);
                }
            }
        }
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Run one stage and fold its exit into `result`. Returns `true` if the
    /// stage succeeded and the next one may start.
    async fn run_stage(
        &self,
        stage: &Stage,
        desc: &RunDescriptor,
        deadline: Instant,
        cancel: &CancelFlag,
        result: &mut RunResult,
    ) -> bool {
        let out = match self.invoke(stage, desc, deadline, cancel).await {
            Ok(out) => out,
            Err(e) => {
                result.error = Some(format!("failed to spawn {}: {e}", stage.executable.display()));
                return false;
            }
        };
        result.stderr_tail = out.stderr_tail;
        result.exit_code = None;

        match out.exit {
            Exit::Exited(Ok(status)) => {
                result.exit_code = status.code();
                if !status.success() {
                    result.error = Some(match status.code() {
                        Some(code) => format!("{} exited with code {code}", stage.name),
                        None => format!("{} terminated by signal", stage.name),
                    });
                } else if let Some(line) = out.error_line {
                    result.error = Some(format!("{} reported an error: {line}", stage.name));
                } else {
                    return true;
                }
            }
            Exit::Exited(Err(e)) => {
                result.error = Some(format!("failed to wait for {} process: {e}", stage.name));
            }
            Exit::TimedOut => {
                result.state = RunState::TimedOut;
                result.error = Some(format!(
                    "{} exceeded timeout of {}",
                    stage.name,
                    humantime::format_duration(self.timeout)
                ));
            }
            Exit::Cancelled => {
                result.state = RunState::Cancelled;
                result.error = Some("cancelled".to_string());
            }
        }
        false
    }

    async fn invoke(
        &self,
        stage: &Stage,
        desc: &RunDescriptor,
        deadline: Instant,
        cancel: &CancelFlag,
    ) -> std::io::Result<StageOutput> {
        let mut cmd = Command::new(&stage.executable);
        cmd.args(&stage.args)
            .arg(desc.parameter_file())
            .current_dir(&desc.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        debug!(stage = stage.name, pid = ?child.id(), "process started");

        if let Some(mut stdin) = child.stdin.take() {
            // The program may exit before reading; a broken pipe here is harmless.
            let _ = stdin.write_all(STDIN_ACK).await;
        }
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(first_error_line(s)));
        let stderr_tail = self.stderr_tail;
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(tail_lines(s, stderr_tail)));

        let deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline);
        let mut check = tokio::time::interval(self.check_interval);

        let exit = loop {
            tokio::select! {
                status = child.wait() => break Exit::Exited(status),
                _ = &mut deadline => break Exit::TimedOut,
                _ = check.tick() => {
                    if cancel.is_cancelled() {
                        break Exit::Cancelled;
                    }
                }
            }
        };

        if matches!(exit, Exit::TimedOut | Exit::Cancelled) {
            if let Err(e) = child.kill().await {
                warn!(stage = stage.name, error = %e, "failed to kill process");
            }
        }

        let error_line = match stdout_task {
            Some(h) => drain(h).await.flatten(),
            None => None,
        };
        let stderr_tail = match stderr_task {
            Some(h) => drain(h).await.unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(StageOutput {
            exit,
            error_line,
            stderr_tail,
        })
    }
}

/// FloodSpreader will not overwrite existing flood maps.
fn remove_stale_maps(desc: &RunDescriptor) {
    for product in &desc.products {
        let path = desc.work_dir.join(product.file_name());
        if path.is_file() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale flood map");
            }
        }
    }
}

impl ModelRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        desc: &'a RunDescriptor,
        attempt: u32,
        cancel: CancelFlag,
    ) -> BoxFuture<'a, RunResult> {
        self.run_process(desc, attempt, cancel).boxed()
    }
}

/// `./AutoRoute` must not be looked up relative to the tile's working directory.
fn resolve_executable(path: &Path) -> PathBuf {
    if path.is_relative() && path.components().count() > 1 {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd.join(path);
        }
    }
    path.to_path_buf()
}

/// Wait briefly for a pipe reader; a surviving grandchild can hold the pipe open.
async fn drain<T>(handle: tokio::task::JoinHandle<T>) -> Option<T> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
        Ok(Ok(v)) => Some(v),
        Ok(Err(_)) => None,
        Err(_) => {
            abort.abort();
            None
        }
    }
}

/// AutoRoute sometimes reports bad input on stdout and still exits 0.
pub fn is_error_line(line: &str) -> bool {
    if line.contains("PROBLEMS") {
        return true;
    }
    line.to_ascii_lowercase().contains("error")
        && !["Perimeter", "Area", "Finder"].iter().any(|w| line.contains(w))
}

async fn first_error_line<R: AsyncRead + Unpin>(stream: R) -> Option<String> {
    let mut lines = BufReader::new(stream).lines();
    let mut found = None;
    // Keep draining so the child never blocks on a full pipe.
    while let Ok(Some(line)) = lines.next_line().await {
        if found.is_none() && is_error_line(&line) {
            found = Some(line);
        }
    }
    found
}

async fn tail_lines<R: AsyncRead + Unpin>(stream: R, keep: usize) -> Vec<String> {
    let mut lines = BufReader::new(stream).lines();
    let mut tail = VecDeque::with_capacity(keep);
    while let Ok(Some(line)) = lines.next_line().await {
        if keep == 0 {
            continue;
        }
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}
