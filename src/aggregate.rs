//! Run manifest and combined outputs.
//!
//! The aggregator is the only consumer of [`RunEvent`]s. Accepting events is
//! order-independent: per-tile results are kept sorted by attempt and tiles
//! are keyed in a `BTreeMap`, so the finalized files only depend on the set of
//! results, not on arrival order.

use crate::error::{OrchestratorError, Result};
use crate::model::{OutputProduct, RunEvent, RunId, RunOutcome, RunResult, RunState, TileId, TileOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MOSAIC_DIR: &str = "mosaic";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub outcome: Option<TileOutcome>,
    #[serde(default)]
    pub results: Vec<RunResult>,
}

impl ManifestEntry {
    /// Most recent successful attempt, if any.
    pub fn final_success(&self) -> Option<&RunResult> {
        self.results
            .iter()
            .rev()
            .find(|r| r.state == RunState::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOutput {
    /// Input list, one tile artifact path per line in ascending tile order.
    pub inputs: PathBuf,
    pub tiles: Vec<TileId>,
    /// Result of the configured merge command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<PathBuf>,
    /// Why the merge command failed. The input list is still valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombinedOutput {
    pub products: BTreeMap<OutputProduct, ProductOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateManifest {
    pub run_id: RunId,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    pub finalized: bool,
    pub tiles: BTreeMap<TileId, ManifestEntry>,
    #[serde(default)]
    pub failed_tiles: Vec<TileId>,
    #[serde(default)]
    pub combined: Option<CombinedOutput>,
}

impl AggregateManifest {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            outcome: None,
            finalized: false,
            tiles: BTreeMap::new(),
            failed_tiles: Vec::new(),
            combined: None,
        }
    }

    pub fn succeeded_tiles(&self) -> impl Iterator<Item = (&TileId, &ManifestEntry)> {
        self.tiles
            .iter()
            .filter(|(_, e)| matches!(e.outcome, Some(TileOutcome::Succeeded)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorOptions {
    pub output_dir: PathBuf,
    pub products: Vec<OutputProduct>,
    pub require_all_succeed: bool,
    pub merge_command: Option<Vec<String>>,
}

pub struct Aggregator {
    manifest: AggregateManifest,
    opts: AggregatorOptions,
}

impl Aggregator {
    pub fn new(run_id: RunId, tiles: impl IntoIterator<Item = TileId>, opts: AggregatorOptions) -> Self {
        let mut manifest = AggregateManifest::new(run_id);
        for id in tiles {
            manifest.tiles.entry(id).or_default();
        }
        Self { manifest, opts }
    }

    pub fn manifest(&self) -> &AggregateManifest {
        &self.manifest
    }

    pub fn accept(&mut self, event: RunEvent) {
        match event {
            RunEvent::AttemptFinished { result } => {
                let entry = self.manifest.tiles.entry(result.tile_id.clone()).or_default();
                match entry.results.binary_search_by_key(&result.attempt, |r| r.attempt) {
                    Ok(_) => warn!(tile = %result.tile_id, attempt = result.attempt, "duplicate result ignored"),
                    Err(pos) => entry.results.insert(pos, *result),
                }
            }
            RunEvent::TileSettled { tile_id, outcome } => {
                let entry = self.manifest.tiles.entry(tile_id.clone()).or_default();
                if let Some(existing) = &entry.outcome {
                    if *existing != outcome {
                        warn!(tile = %tile_id, ?existing, new = ?outcome, "terminal outcome already recorded");
                    }
                    return;
                }
                entry.outcome = Some(outcome);
            }
        }
    }

    /// Write combined outputs and `manifest.json`. Safe to call repeatedly:
    /// the same accepted results always produce the same bytes.
    pub async fn finalize(&mut self, aborted: bool) -> Result<AggregateManifest> {
        let out = &self.opts.output_dir;
        fs::create_dir_all(out).map_err(|e| OrchestratorError::io(out, e))?;

        let failed: Vec<TileId> = self
            .manifest
            .tiles
            .iter()
            .filter(|(_, e)| !matches!(e.outcome, Some(TileOutcome::Succeeded)))
            .map(|(id, _)| id.clone())
            .collect();

        let outcome = if aborted {
            RunOutcome::Aborted
        } else if failed.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::PartialFailure
        };

        let combined = if self.opts.require_all_succeed && !failed.is_empty() {
            warn!(failed = failed.len(), "combined output withheld: not every tile succeeded");
            None
        } else {
            Some(self.write_combined().await?)
        };

        self.manifest.outcome = Some(outcome);
        self.manifest.failed_tiles = failed;
        self.manifest.combined = combined;
        self.manifest.finalized = true;

        let path = self.opts.output_dir.join(MANIFEST_FILE);
        let mut bytes = serde_json::to_vec_pretty(&self.manifest)?;
        bytes.push(b'\n');
        fs::write(&path, bytes).map_err(|e| OrchestratorError::io(&path, e))?;
        info!(outcome = %outcome, manifest = %path.display(), "run finalized");
        Ok(self.manifest.clone())
    }

    async fn write_combined(&self) -> Result<CombinedOutput> {
        let mosaic_dir = self.opts.output_dir.join(MOSAIC_DIR);
        fs::create_dir_all(&mosaic_dir).map_err(|e| OrchestratorError::io(&mosaic_dir, e))?;

        let mut products = self.opts.products.clone();
        products.sort();
        products.dedup();

        let mut combined = CombinedOutput::default();
        for product in products {
            let mut tiles = Vec::new();
            let mut listing = String::new();
            // BTreeMap iteration gives ascending tile ids.
            for (id, entry) in self.manifest.succeeded_tiles() {
                let Some(path) = entry.final_success().and_then(|r| r.artifacts.get(&product)) else {
                    continue;
                };
                listing.push_str(&path.to_string_lossy());
                listing.push('\n');
                tiles.push(id.clone());
            }

            let inputs = mosaic_dir.join(format!("{}.txt", product.name()));
            if tiles.is_empty() {
                if inputs.exists() {
                    fs::remove_file(&inputs).map_err(|e| OrchestratorError::io(&inputs, e))?;
                }
                continue;
            }
            fs::write(&inputs, listing).map_err(|e| OrchestratorError::io(&inputs, e))?;

            let mut merged = None;
            let mut merge_error = None;
            if let Some(template) = &self.opts.merge_command {
                let output = mosaic_dir.join(format!("{}.vrt", product.name()));
                match run_merge(template, product, &inputs, &output).await {
                    Ok(()) => merged = Some(output),
                    Err(e) => {
                        warn!(product = product.name(), error = %e, "merge failed, keeping input list");
                        merge_error = Some(e.to_string());
                    }
                }
            }
            combined.products.insert(
                product,
                ProductOutput {
                    inputs,
                    tiles,
                    merged,
                    merge_error,
                },
            );
        }
        Ok(combined)
    }
}

async fn run_merge(template: &[String], product: OutputProduct, inputs: &Path, output: &Path) -> Result<()> {
    let expand = |arg: &String| {
        arg.replace("{inputs}", &inputs.to_string_lossy())
            .replace("{output}", &output.to_string_lossy())
    };
    let mut argv = template.iter().map(expand);
    let Some(program) = argv.next() else {
        return Err(OrchestratorError::Merge {
            product: product.name().to_string(),
            message: "empty merge command".to_string(),
        });
    };
    let out = Command::new(&program)
        .args(argv)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| OrchestratorError::Merge {
            product: product.name().to_string(),
            message: format!("failed to run {program}: {e}"),
        })?;
    if !out.status.success() {
        return Err(OrchestratorError::Merge {
            product: product.name().to_string(),
            message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tile: &str, attempt: u32, state: RunState, depth: Option<&Path>) -> RunResult {
        let mut r = RunResult::failed(tile, attempt, "2024-01-01T00:00:00Z".into(), "x".into());
        r.state = state;
        if let Some(p) = depth {
            r.error = None;
            r.artifacts.insert(OutputProduct::Depth, p.to_path_buf());
        }
        r
    }

    fn events(dir: &Path) -> Vec<RunEvent> {
        vec![
            RunEvent::AttemptFinished {
                result: Box::new(result("C", 1, RunState::Succeeded, Some(&dir.join("C.tif")))),
            },
            RunEvent::AttemptFinished {
                result: Box::new(result("A", 2, RunState::Succeeded, Some(&dir.join("A.tif")))),
            },
            RunEvent::AttemptFinished {
                result: Box::new(result("A", 1, RunState::Failed, None)),
            },
            RunEvent::TileSettled {
                tile_id: "A".into(),
                outcome: TileOutcome::Succeeded,
            },
            RunEvent::TileSettled {
                tile_id: "C".into(),
                outcome: TileOutcome::Succeeded,
            },
            RunEvent::TileSettled {
                tile_id: "B".into(),
                outcome: TileOutcome::Invalid {
                    missing: vec![crate::model::FileKind::StreamNetwork],
                },
            },
        ]
    }

    fn aggregator(dir: &Path) -> Aggregator {
        Aggregator::new(
            "run".into(),
            ["A", "B", "C"].map(String::from),
            AggregatorOptions {
                output_dir: dir.to_path_buf(),
                products: vec![OutputProduct::Depth, OutputProduct::Extent],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn accept_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut forward = aggregator(dir.path());
        let mut backward = aggregator(dir.path());
        for e in events(dir.path()) {
            forward.accept(e);
        }
        for e in events(dir.path()).into_iter().rev() {
            backward.accept(e);
        }
        assert_eq!(forward.manifest(), backward.manifest());
        let a = &forward.manifest().tiles["A"];
        assert_eq!(a.results.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn partial_failure_merges_succeeding_subset() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path());
        for e in events(dir.path()) {
            agg.accept(e);
        }
        let manifest = agg.finalize(false).await.unwrap();
        assert_eq!(manifest.outcome, Some(RunOutcome::PartialFailure));
        assert_eq!(manifest.failed_tiles, vec!["B".to_string()]);

        let combined = manifest.combined.unwrap();
        let depth = &combined.products[&OutputProduct::Depth];
        assert_eq!(depth.tiles, vec!["A".to_string(), "C".to_string()]);
        let listing = fs::read_to_string(&depth.inputs).unwrap();
        assert_eq!(
            listing,
            format!("{}\n{}\n", dir.path().join("A.tif").display(), dir.path().join("C.tif").display())
        );
        // No tile produced an extent raster.
        assert!(!combined.products.contains_key(&OutputProduct::Extent));
    }

    #[tokio::test]
    async fn finalize_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path());
        for e in events(dir.path()) {
            agg.accept(e);
        }
        agg.finalize(false).await.unwrap();
        let manifest_one = fs::read(dir.path().join(MANIFEST_FILE)).unwrap();
        let depth_one = fs::read(dir.path().join(MOSAIC_DIR).join("depth.txt")).unwrap();

        agg.finalize(false).await.unwrap();
        assert_eq!(fs::read(dir.path().join(MANIFEST_FILE)).unwrap(), manifest_one);
        assert_eq!(fs::read(dir.path().join(MOSAIC_DIR).join("depth.txt")).unwrap(), depth_one);
    }

    #[tokio::test]
    async fn require_all_succeed_withholds_combined_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = Aggregator::new(
            "run".into(),
            ["A", "B", "C"].map(String::from),
            AggregatorOptions {
                output_dir: dir.path().to_path_buf(),
                products: vec![OutputProduct::Depth],
                require_all_succeed: true,
                merge_command: None,
            },
        );
        for e in events(dir.path()) {
            agg.accept(e);
        }
        let manifest = agg.finalize(false).await.unwrap();
        assert_eq!(manifest.outcome, Some(RunOutcome::PartialFailure));
        assert!(manifest.combined.is_none());
    }

    #[tokio::test]
    async fn terminal_outcome_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path());
        agg.accept(RunEvent::TileSettled {
            tile_id: "A".into(),
            outcome: TileOutcome::GaveUp,
        });
        agg.accept(RunEvent::TileSettled {
            tile_id: "A".into(),
            outcome: TileOutcome::Succeeded,
        });
        assert_eq!(agg.manifest().tiles["A"].outcome, Some(TileOutcome::GaveUp));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_merge_still_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = Aggregator::new(
            "run".into(),
            ["A", "B", "C"].map(String::from),
            AggregatorOptions {
                output_dir: dir.path().to_path_buf(),
                products: vec![OutputProduct::Depth],
                merge_command: Some(
                    ["/bin/sh", "-c", "echo no driver >&2; exit 1", "{inputs}", "{output}"]
                        .map(String::from)
                        .to_vec(),
                ),
                ..Default::default()
            },
        );
        for e in events(dir.path()) {
            agg.accept(e);
        }
        let manifest = agg.finalize(false).await.unwrap();
        assert!(manifest.finalized);
        let depth = &manifest.combined.unwrap().products[&OutputProduct::Depth];
        assert!(depth.merged.is_none());
        assert!(depth.merge_error.as_deref().unwrap().contains("no driver"));
        assert!(depth.inputs.is_file());
        assert!(dir.path().join(MANIFEST_FILE).is_file());
    }

    #[tokio::test]
    async fn aborted_run_reports_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = aggregator(dir.path());
        for e in events(dir.path()) {
            agg.accept(e);
        }
        let manifest = agg.finalize(true).await.unwrap();
        assert_eq!(manifest.outcome, Some(RunOutcome::Aborted));
    }
}
