//! Queryable run state for polling clients.
//!
//! The scheduler owns the [`StatusBoard`] (the only writer); clients get a
//! [`StatusReporter`] whose `query` never blocks on the run.

use crate::model::{RunId, RunOutcome, TileId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TileState {
    Queued,
    Running { attempt: u32 },
    Retrying { attempt: u32, backoff_ms: u64 },
    Succeeded,
    Failed,
    Invalid,
    Cancelled,
}

impl TileState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TileState::Succeeded | TileState::Failed | TileState::Invalid | TileState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Finalizing,
    Finished,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub invalid: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub tiles: BTreeMap<TileId, TileState>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
}

impl StatusSnapshot {
    pub fn counts(&self) -> StatusCounts {
        let mut c = StatusCounts::default();
        for state in self.tiles.values() {
            match state {
                TileState::Queued => c.queued += 1,
                TileState::Running { .. } => c.running += 1,
                TileState::Retrying { .. } => c.retrying += 1,
                TileState::Succeeded => c.succeeded += 1,
                TileState::Failed => c.failed += 1,
                TileState::Invalid => c.invalid += 1,
                TileState::Cancelled => c.cancelled += 1,
            }
        }
        c
    }
}

/// Write side of the run status.
#[derive(Debug)]
pub struct StatusBoard {
    tx: watch::Sender<StatusSnapshot>,
}

/// Read-only view handed to UI/CLI callers.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusBoard {
    pub fn new(
        run_id: RunId,
        tiles: impl IntoIterator<Item = (TileId, TileState)>,
    ) -> (Self, StatusReporter) {
        let snapshot = StatusSnapshot {
            run_id,
            phase: RunPhase::Running,
            tiles: tiles.into_iter().collect(),
            outcome: None,
        };
        let (tx, rx) = watch::channel(snapshot);
        (Self { tx }, StatusReporter { rx })
    }

    pub fn set_tile(&self, tile: &str, state: TileState) {
        self.tx.send_modify(|s| {
            s.tiles.insert(tile.to_string(), state);
        });
    }

    pub fn set_phase(&self, phase: RunPhase) {
        self.tx.send_modify(|s| s.phase = phase);
    }

    pub fn finish(&self, outcome: RunOutcome) {
        self.tx.send_modify(|s| {
            s.phase = RunPhase::Finished;
            s.outcome = Some(outcome);
        });
    }

    pub fn reporter(&self) -> StatusReporter {
        StatusReporter {
            rx: self.tx.subscribe(),
        }
    }
}

impl StatusReporter {
    pub fn query(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change. Returns `false` once the run is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
