#![allow(dead_code)]

use autoroute_batch::descriptor::RunDescriptor;
use autoroute_batch::engine::{CancelFlag, ModelRunner};
use autoroute_batch::model::{now_rfc3339, OutputProduct, RunResult, RunState};
use autoroute_batch::Config;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Write a flat-layout tile (`<id>.tif` plus `<id>__strm.gpkg`).
pub fn write_tile(root: &Path, id: &str, with_stream: bool) {
    fs::create_dir_all(root).unwrap();
    fs::write(root.join(format!("{id}.tif")), format!("dem {id}")).unwrap();
    if with_stream {
        fs::write(root.join(format!("{id}__strm.gpkg")), format!("stream {id}")).unwrap();
    }
}

pub fn config(base: &Path) -> Config {
    let mut cfg = Config::new("/nonexistent/autoroute");
    cfg.work_dir = base.join("work");
    cfg.output_dir = base.join("out");
    cfg.concurrency_limit = 2;
    cfg.backoff_base = Duration::from_millis(10);
    cfg.backoff_max = Duration::from_millis(50);
    cfg.cancel_check_interval = Duration::from_millis(20);
    cfg
}

/// Mock model that sleeps, then reports a scripted state per attempt.
///
/// Tracks how many attempts run at once and whether any tile was handed
/// out twice concurrently.
pub struct ScriptedRunner {
    delay: Duration,
    script: Mutex<HashMap<String, VecDeque<RunState>>>,
    in_flight: Mutex<HashSet<String>>,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub double_dispatch: AtomicBool,
    pub calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedRunner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            script: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            double_dispatch: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// States returned for successive attempts of `tile`; `Succeeded` once exhausted.
    pub fn script(self, tile: &str, states: &[RunState]) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(tile.to_string(), states.iter().copied().collect());
        self
    }

    pub fn calls_for(&self, tile: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(t, _)| t == tile).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn attempt(&self, desc: &RunDescriptor, attempt: u32, cancel: CancelFlag) -> RunResult {
        let tile = desc.tile_id().to_string();
        self.calls.lock().unwrap().push((tile.clone(), attempt));
        if !self.in_flight.lock().unwrap().insert(tile.clone()) {
            self.double_dispatch.store(true, Ordering::SeqCst);
        }
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let start = Instant::now();
        let started_at = now_rfc3339();
        let deadline = start + self.delay;
        let mut state = None;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                state = Some(RunState::Cancelled);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5).min(deadline.saturating_duration_since(Instant::now()))).await;
        }
        let state = state.unwrap_or_else(|| {
            self.script
                .lock()
                .unwrap()
                .get_mut(&tile)
                .and_then(|q| q.pop_front())
                .unwrap_or(RunState::Succeeded)
        });

        let mut artifacts = BTreeMap::new();
        if state == RunState::Succeeded {
            let depth = desc.work_dir.join(OutputProduct::Depth.file_name());
            fs::write(&depth, format!("depth {tile}")).unwrap();
            artifacts.insert(OutputProduct::Depth, depth);
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.lock().unwrap().remove(&tile);
        RunResult {
            tile_id: tile,
            attempt,
            state,
            exit_code: (state != RunState::Cancelled).then_some(if state == RunState::Succeeded { 0 } else { 1 }),
            duration_ms: start.elapsed().as_millis() as u64,
            started_at,
            artifacts,
            error: (state != RunState::Succeeded).then(|| format!("scripted {state:?}")),
            stderr_tail: Vec::new(),
            reused: false,
        }
    }
}

impl ModelRunner for ScriptedRunner {
    fn run<'a>(&'a self, desc: &'a RunDescriptor, attempt: u32, cancel: CancelFlag) -> BoxFuture<'a, RunResult> {
        self.attempt(desc, attempt, cancel).boxed()
    }
}

pub fn roots(dir: &Path) -> Vec<PathBuf> {
    vec![dir.to_path_buf()]
}
