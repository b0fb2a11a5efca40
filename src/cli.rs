use crate::catalog::Catalog;
use crate::config::Config;
use crate::model::{RunOutcome, Validation};
use crate::orchestrator::{FinalReport, Orchestrator};
use crate::status::RunPhase;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "autoroute-batch",
    version,
    about = "Run the AutoRoute flood model over a catalog of input tiles"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the model over every valid tile and build combined outputs
    Run(RunArgs),
    /// List tiles found under the catalog roots and whether they are complete
    Scan(ScanArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// YAML run configuration
    #[arg(long, short)]
    pub config: PathBuf,

    /// Directories holding tile inputs
    #[arg(required = true)]
    pub roots: Vec<PathBuf>,

    /// Print the run manifest as JSON
    #[arg(long, conflicts_with = "text")]
    pub json: bool,

    /// Print a text summary (default)
    #[arg(long)]
    pub text: bool,

    /// Override the number of concurrent model processes
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Override the per-tile timeout (e.g. 30m)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,

    /// Override the output directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Keep per-tile working directories after each attempt
    #[arg(long)]
    pub keep_working_dirs: bool,

    /// Re-run tiles even when their outputs are up to date
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ScanArgs {
    /// YAML run configuration
    #[arg(long, short)]
    pub config: PathBuf,

    /// Directories holding tile inputs
    #[arg(required = true)]
    pub roots: Vec<PathBuf>,

    /// Print the catalog as JSON
    #[arg(long)]
    pub json: bool,
}

/// Process exit code for a finished run.
pub fn exit_code(outcome: Option<RunOutcome>) -> i32 {
    match outcome {
        Some(RunOutcome::Succeeded) => 0,
        Some(RunOutcome::PartialFailure) => 2,
        Some(RunOutcome::Aborted) => 130,
        None => 1,
    }
}

/// Execute a parsed command line. Returns the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    match args.command {
        Command::Run(run_args) => run_batch(run_args).await,
        Command::Scan(scan_args) => run_scan(scan_args).await,
    }
}

/// Load the configuration file and apply command-line overrides.
pub fn build_config(args: &RunArgs) -> Result<Config> {
    let mut cfg = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    if let Some(n) = args.concurrency {
        cfg.concurrency_limit = n;
    }
    if let Some(t) = args.timeout {
        cfg.timeout_per_tile = t.into();
    }
    if let Some(dir) = &args.output_dir {
        cfg.output_dir = dir.clone();
    }
    cfg.keep_working_dirs |= args.keep_working_dirs;
    cfg.overwrite |= args.overwrite;
    cfg.validate().context("invalid configuration after overrides")?;
    Ok(cfg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    ForceQuit,
}

/// First Ctrl-C cancels the run, any later one quits immediately.
fn on_interrupt(interrupted: &mut bool) -> Interrupt {
    if std::mem::replace(interrupted, true) {
        Interrupt::ForceQuit
    } else {
        Interrupt::Cancel
    }
}

async fn run_batch(args: RunArgs) -> Result<i32> {
    let cfg = build_config(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();

    let orchestrator = Orchestrator::new();
    let run_id = orchestrator
        .start_run(&args.roots, cfg)
        .context("failed to start run")?;
    let mut reporter = orchestrator
        .status_reporter(&run_id)
        .context("run disappeared after start")?;

    let mut last_line = String::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            changed = reporter.changed() => {
                if !changed {
                    break;
                }
                let snap = reporter.query();
                let c = snap.counts();
                let line = format!(
                    "queued {} running {} retrying {} succeeded {} failed {} invalid {} cancelled {}",
                    c.queued, c.running, c.retrying, c.succeeded, c.failed, c.invalid, c.cancelled
                );
                if !args.json && line != last_line {
                    let _ = out_tx.send(OutputLine::Stderr(line.clone()));
                    last_line = line;
                }
                if snap.phase == RunPhase::Finished {
                    break;
                }
            }
            res = tokio::signal::ctrl_c() => {
                if res.is_err() {
                    continue;
                }
                match on_interrupt(&mut interrupted) {
                    Interrupt::Cancel => {
                        if orchestrator.cancel(&run_id) {
                            let _ = out_tx.send(OutputLine::Stderr("Cancelling… (Ctrl-C again to force quit)".into()));
                        }
                    }
                    Interrupt::ForceQuit => {
                        // Skip waiting for kills and pipe drains.
                        eprintln!("Interrupted again, exiting without finalizing");
                        std::process::exit(exit_code(Some(RunOutcome::Aborted)));
                    }
                }
            }
        }
    }

    let report = orchestrator.wait(&run_id).await.context("run failed")?;
    emit_report(&out_tx, &report, args.json)?;

    drop(out_tx);
    let _ = out_handle.await;
    Ok(exit_code(report.manifest.outcome))
}

fn emit_report(out_tx: &mpsc::UnboundedSender<OutputLine>, report: &FinalReport, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(&report.manifest)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        let summary = crate::text_summary::build_text_summary(report);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    Ok(())
}

async fn run_scan(args: ScanArgs) -> Result<i32> {
    let cfg = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let catalog = Catalog::scan(&args.roots, &cfg.required_kinds).context("failed to scan catalog")?;
    let (out_tx, out_handle) = spawn_output_writer();

    if args.json {
        let tiles: Vec<_> = catalog
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "validation": t.validation,
                    "files": t.files,
                    "crs": t.metadata.crs,
                })
            })
            .collect();
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&tiles)?));
    } else {
        for tile in catalog.iter() {
            let line = match &tile.validation {
                Validation::Complete => {
                    let kinds: Vec<String> = tile.files.keys().map(|k| k.to_string()).collect();
                    format!("{}\tok\t{}", tile.id, kinds.join(","))
                }
                Validation::Invalid { missing } => {
                    let kinds: Vec<String> = missing.iter().map(|k| k.to_string()).collect();
                    format!("{}\tinvalid\tmissing {}", tile.id, kinds.join(","))
                }
            };
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "{} tiles, {} valid",
            catalog.len(),
            catalog.valid().count()
        )));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(0)
}
