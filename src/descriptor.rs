//! Per-tile run descriptors and their scoped working directories.

use crate::config::Config;
use crate::error::ConfigError;
use crate::model::{FileKind, OutputProduct, ParamValue, Tile};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PARAMETER_FILE: &str = "autoroute.mifn";
pub const META_FILE: &str = "meta.txt";
const META_CARD: &str = "Meta_File";

/// Everything a worker needs to run one tile.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub tile: Arc<Tile>,
    pub work_dir: PathBuf,
    pub parameters: BTreeMap<String, ParamValue>,
    pub products: Vec<OutputProduct>,
    pub keep_work_dir: bool,
}

pub struct DescriptorBuilder<'a> {
    cfg: &'a Config,
    run_root: PathBuf,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(cfg: &'a Config, run_id: &str) -> Self {
        Self {
            cfg,
            run_root: cfg.work_dir.join(run_id),
        }
    }

    /// Resolve parameters for `tile`. Does not touch the filesystem.
    pub fn build(&self, tile: Arc<Tile>) -> Result<RunDescriptor, ConfigError> {
        if let (Some(global), Some(local)) = (&self.cfg.crs, &tile.metadata.crs) {
            if !global.trim().eq_ignore_ascii_case(local.trim()) {
                return Err(ConfigError::CrsConflict {
                    tile: tile.id.clone(),
                    tile_crs: local.clone(),
                    global_crs: global.clone(),
                });
            }
        }

        let mut parameters = self.cfg.model_parameters.clone();
        for (card, value) in &tile.metadata.parameters {
            if is_reserved_card(card) {
                return Err(ConfigError::ReservedCard {
                    tile: tile.id.clone(),
                    card: card.clone(),
                });
            }
            parameters.insert(card.clone(), value.clone());
        }
        // Global parameters may not hijack orchestrator-owned cards either.
        if let Some(card) = parameters.keys().find(|c| is_reserved_card(c)) {
            return Err(ConfigError::ReservedCard {
                tile: tile.id.clone(),
                card: card.clone(),
            });
        }

        let mut products = self.cfg.output_products.clone();
        products.sort();
        products.dedup();

        Ok(RunDescriptor {
            work_dir: self.run_root.join(&tile.id),
            tile,
            parameters,
            products,
            keep_work_dir: self.cfg.keep_working_dirs,
        })
    }
}

fn is_reserved_card(card: &str) -> bool {
    card == META_CARD
        || FileKind::ALL.iter().any(|k| k.card() == card)
        || [
            OutputProduct::Depth,
            OutputProduct::Extent,
            OutputProduct::Velocity,
            OutputProduct::Wse,
        ]
        .iter()
        .any(|p| p.card() == card)
}

impl RunDescriptor {
    pub fn tile_id(&self) -> &str {
        &self.tile.id
    }

    pub fn parameter_file(&self) -> PathBuf {
        self.work_dir.join(PARAMETER_FILE)
    }

    /// Name an input gets inside the working directory (`dem.tif`, `stream.gpkg`, ...).
    pub fn staged_name(kind: FileKind, source: &Path) -> String {
        match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", kind.standard_stem(), ext.to_ascii_lowercase()),
            None => kind.standard_stem().to_string(),
        }
    }

    /// Render the model's main input file. Paths are relative to the working
    /// directory so the text does not depend on where the run is staged.
    pub fn render_parameter_file(&self) -> String {
        let mut out = String::new();
        for (kind, source) in &self.tile.files {
            write_card(&mut out, kind.card(), &Self::staged_name(*kind, source));
        }
        out.push_str("# AutoRoute Inputs\n");
        for (card, value) in &self.parameters {
            if let Some(rendered) = value.render() {
                write_card(&mut out, card, &rendered);
            }
        }
        for product in &self.products {
            write_card(&mut out, product.card(), product.file_name());
        }
        write_card(&mut out, META_CARD, META_FILE);
        out
    }

    /// Create a fresh working directory with staged inputs and the parameter file.
    pub fn prepare(&self) -> io::Result<WorkDir> {
        if self.work_dir.exists() {
            fs::remove_dir_all(&self.work_dir)?;
        }
        fs::create_dir_all(&self.work_dir)?;
        // Guard first so a failure below still cleans up.
        let guard = WorkDir {
            path: self.work_dir.clone(),
            keep: self.keep_work_dir,
        };
        for (kind, source) in &self.tile.files {
            let target = self.work_dir.join(Self::staged_name(*kind, source));
            link_or_copy(source, &target)?;
        }
        fs::write(self.parameter_file(), self.render_parameter_file())?;
        Ok(guard)
    }
}

fn write_card(out: &mut String, card: &str, value: &str) {
    if value.is_empty() {
        let _ = writeln!(out, "{card}");
    } else {
        let _ = writeln!(out, "{card}\t{value}");
    }
}

#[cfg(unix)]
fn link_or_copy(source: &Path, target: &Path) -> io::Result<()> {
    let source = fs::canonicalize(source)?;
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn link_or_copy(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

/// Scoped working directory. Removed on drop unless configured to keep it.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            debug!(dir = %self.path.display(), "keeping working directory");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.path.display(), error = %e, "failed to remove working directory");
            }
        }
    }
}

/// Move produced artifacts out of a working directory into `dest`.
pub fn harvest_artifacts(
    artifacts: &BTreeMap<OutputProduct, PathBuf>,
    dest: &Path,
) -> io::Result<BTreeMap<OutputProduct, PathBuf>> {
    let mut moved = BTreeMap::new();
    if artifacts.is_empty() {
        return Ok(moved);
    }
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;
    for (product, source) in artifacts {
        let target = dest.join(product.file_name());
        if fs::rename(source, &target).is_err() {
            // Different filesystem: fall back to copy.
            fs::copy(source, &target)?;
            let _ = fs::remove_file(source);
        }
        moved.insert(*product, target);
    }
    Ok(moved)
}
