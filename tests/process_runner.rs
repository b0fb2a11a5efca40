#![cfg(unix)]

mod common;

use autoroute_batch::model::{OutputProduct, RunOutcome, RunState, TileOutcome};
use autoroute_batch::{Config, Orchestrator};
use common::{config, roots, write_tile};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// Fake model run through `/bin/sh` so the script itself is never exec'd.
fn fake_model(base: &Path, body: &str) -> Config {
    let script = base.join("fake_autoroute.sh");
    fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut cfg = config(base);
    cfg.model_executable = "/bin/sh".into();
    cfg.model_args = vec![script.to_string_lossy().into_owned()];
    cfg.max_retries = 1;
    cfg.timeout_per_tile = Duration::from_secs(20);
    cfg
}

/// Add a FloodSpreader stage, also run through `/bin/sh`.
fn with_floodspreader(mut cfg: Config, base: &Path, body: &str) -> Config {
    let script = base.join("fake_floodspreader.sh");
    fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    cfg.floodspreader_executable = Some("/bin/sh".into());
    cfg.floodspreader_args = vec![script.to_string_lossy().into_owned()];
    cfg
}

async fn run_one(cfg: Config, input: &Path) -> autoroute_batch::FinalReport {
    let orch = Orchestrator::new();
    let run_id = orch.start_run(&roots(input), cfg).unwrap();
    orch.wait(&run_id).await.unwrap()
}

#[tokio::test]
async fn successful_model_outputs_are_harvested() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let cfg = fake_model(
        dir.path(),
        r#"read ack
[ "$ack" = "a" ] || exit 8
grep -q '^DEM_File	dem.tif$' "$1" || exit 9
[ -L dem.tif ] || exit 10
echo "Low Spot Finder error tolerance 0.1"
echo depth > depth.tif
echo extent > extent.tif
echo warming up >&2"#,
    );
    let out = cfg.output_dir.clone();

    let report = run_one(cfg, &input).await;
    let a = &report.manifest.tiles["A"];
    assert_eq!(a.outcome, Some(TileOutcome::Succeeded), "{:?}", a.results);
    let result = &a.results[0];
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stderr_tail, vec!["warming up".to_string()]);
    assert_eq!(
        result.artifacts[&OutputProduct::Depth],
        out.join("tiles").join("A").join("depth.tif")
    );
    assert_eq!(
        fs::read_to_string(out.join("tiles").join("A").join("extent.tif")).unwrap(),
        "extent\n"
    );
    assert_eq!(report.manifest.outcome, Some(RunOutcome::Succeeded));
}

#[tokio::test]
async fn non_zero_exit_fails_with_stderr_tail() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let cfg = fake_model(dir.path(), "echo 'cannot open stream file' >&2\nexit 3");

    let report = run_one(cfg, &input).await;
    let a = &report.manifest.tiles["A"];
    assert_eq!(a.outcome, Some(TileOutcome::GaveUp));
    assert_eq!(a.results.len(), 1);
    assert_eq!(a.results[0].state, RunState::Failed);
    assert_eq!(a.results[0].exit_code, Some(3));
    assert_eq!(a.results[0].stderr_tail, vec!["cannot open stream file".to_string()]);
}

#[tokio::test]
async fn error_reported_on_stdout_fails_despite_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let cfg = fake_model(dir.path(), "echo 'ERROR: DEM and stream rasters differ'\necho depth > depth.tif");

    let report = run_one(cfg, &input).await;
    let result = &report.manifest.tiles["A"].results[0];
    assert_eq!(result.state, RunState::Failed);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.as_deref().unwrap().contains("DEM and stream rasters differ"));
    assert!(result.artifacts.is_empty());
}

#[tokio::test]
async fn hung_model_is_killed_at_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let mut cfg = fake_model(dir.path(), "exec sleep 30");
    cfg.timeout_per_tile = Duration::from_millis(300);
    cfg.max_retries = 2;

    let started = std::time::Instant::now();
    let report = run_one(cfg, &input).await;
    assert!(started.elapsed() < Duration::from_secs(15));
    let a = &report.manifest.tiles["A"];
    assert_eq!(a.outcome, Some(TileOutcome::GaveUp));
    assert_eq!(a.results.len(), 2);
    assert!(a.results.iter().all(|r| r.state == RunState::TimedOut));
}

#[tokio::test]
async fn missing_executable_is_a_failed_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let mut cfg = config(dir.path());
    cfg.model_executable = dir.path().join("no-such-model");
    cfg.max_retries = 1;

    let report = run_one(cfg, &input).await;
    let result = &report.manifest.tiles["A"].results[0];
    assert_eq!(result.state, RunState::Failed);
    assert!(result.error.as_deref().unwrap().starts_with("failed to spawn"));
    assert_eq!(report.manifest.outcome, Some(RunOutcome::PartialFailure));
}

#[tokio::test]
async fn merge_command_runs_once_per_product() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    write_tile(&input, "B", true);
    let mut cfg = fake_model(dir.path(), "echo depth > depth.tif");
    cfg.output_products = vec![OutputProduct::Depth];
    cfg.merge_command = Some(vec![
        "/bin/sh".into(),
        "-c".into(),
        "cp \"$0\" \"$1\"".into(),
        "{inputs}".into(),
        "{output}".into(),
    ]);
    let out = cfg.output_dir.clone();

    let report = run_one(cfg, &input).await;
    let combined = report.manifest.combined.unwrap();
    let depth = &combined.products[&OutputProduct::Depth];
    let merged = depth.merged.as_ref().unwrap();
    assert_eq!(merged, &out.join("mosaic").join("depth.vrt"));
    assert_eq!(fs::read_to_string(merged).unwrap(), fs::read_to_string(&depth.inputs).unwrap());
}

#[tokio::test]
async fn cancel_kills_running_model() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let cfg = fake_model(dir.path(), "exec sleep 30");

    let orch = Orchestrator::new();
    let run_id = orch.start_run(&roots(&input), cfg).unwrap();
    let mut reporter = orch.status_reporter(&run_id).unwrap();
    while reporter.query().counts().running < 1 {
        assert!(reporter.changed().await);
    }
    // Let the child get past spawn.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled_at = Instant::now();
    assert!(orch.cancel(&run_id));
    let report = orch.wait(&run_id).await.unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));

    let a = &report.manifest.tiles["A"];
    assert_eq!(a.outcome, Some(TileOutcome::Cancelled));
    assert_eq!(a.results.len(), 1);
    assert_eq!(a.results[0].state, RunState::Cancelled);
    assert_eq!(report.manifest.outcome, Some(RunOutcome::Aborted));
}

#[tokio::test]
async fn floodspreader_replaces_model_flood_maps() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let cfg = fake_model(dir.path(), "echo stale > depth.tif");
    let cfg = with_floodspreader(
        cfg,
        dir.path(),
        r#"read ack
[ "$ack" = "a" ] || exit 8
[ -e depth.tif ] && exit 7
grep -q '^OutDEP	depth.tif$' "$1" || exit 9
echo flood > depth.tif
echo flood > extent.tif"#,
    );
    let out = cfg.output_dir.clone();

    let report = run_one(cfg, &input).await;
    let a = &report.manifest.tiles["A"];
    assert_eq!(a.outcome, Some(TileOutcome::Succeeded), "{:?}", a.results);
    assert_eq!(a.results.len(), 1);
    assert_eq!(
        fs::read_to_string(out.join("tiles").join("A").join("depth.tif")).unwrap(),
        "flood\n"
    );
}

#[tokio::test]
async fn floodspreader_error_line_fails_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let cfg = fake_model(dir.path(), "echo depth > depth.tif");
    let cfg = with_floodspreader(cfg, dir.path(), "echo 'There were PROBLEMS reading the flow file'");

    let report = run_one(cfg, &input).await;
    let result = &report.manifest.tiles["A"].results[0];
    assert_eq!(result.state, RunState::Failed);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.as_deref().unwrap().starts_with("floodspreader reported an error"));
    assert!(result.artifacts.is_empty());
}

#[tokio::test]
async fn hung_floodspreader_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let mut cfg = fake_model(dir.path(), "echo depth > depth.tif");
    cfg.timeout_per_tile = Duration::from_millis(500);
    let cfg = with_floodspreader(cfg, dir.path(), "exec sleep 30");

    let started = Instant::now();
    let report = run_one(cfg, &input).await;
    assert!(started.elapsed() < Duration::from_secs(15));
    let result = &report.manifest.tiles["A"].results[0];
    assert_eq!(result.state, RunState::TimedOut);
    assert!(result.error.as_deref().unwrap().starts_with("floodspreader exceeded timeout"));
}

#[tokio::test]
async fn failed_merge_keeps_run_and_fingerprints() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    write_tile(&input, "A", true);
    let mut cfg = fake_model(dir.path(), "echo depth > depth.tif");
    cfg.output_products = vec![OutputProduct::Depth];
    cfg.merge_command = Some(vec![
        "/bin/sh".into(),
        "-c".into(),
        "echo 'no VRT driver' >&2; exit 1".into(),
        "{inputs}".into(),
        "{output}".into(),
    ]);
    let out = cfg.output_dir.clone();

    let orch = Orchestrator::new();
    let run_id = orch.start_run(&roots(&input), cfg).unwrap();
    let report = orch.wait(&run_id).await.unwrap();

    assert_eq!(report.manifest.outcome, Some(RunOutcome::Succeeded));
    let depth = &report.manifest.combined.as_ref().unwrap().products[&OutputProduct::Depth];
    assert!(depth.merged.is_none());
    assert!(depth.merge_error.as_deref().unwrap().contains("no VRT driver"));
    assert!(depth.inputs.is_file());
    assert!(out.join("manifest.json").is_file());
    assert!(out.join(".fingerprints.json").is_file());
    assert_eq!(orch.get_status(&run_id).unwrap().outcome, Some(RunOutcome::Succeeded));
    assert!(orch.get_manifest(&run_id).unwrap().finalized);
}
