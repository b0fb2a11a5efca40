//! Input fingerprints for skipping tiles whose outputs are already current.

use crate::descriptor::RunDescriptor;
use crate::error::{OrchestratorError, Result};
use crate::model::{OutputProduct, TileId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

pub const FINGERPRINT_FILE: &str = ".fingerprints.json";

/// Hash of a tile's inputs (kind, name, size, mtime) and its rendered parameter file.
pub fn fingerprint(desc: &RunDescriptor) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for (kind, path) in &desc.tile.files {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        hasher.update(kind.standard_stem().as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(meta.len().to_le_bytes());
        hasher.update(mtime.as_secs().to_le_bytes());
        hasher.update(mtime.subsec_nanos().to_le_bytes());
    }
    hasher.update(desc.render_parameter_file().as_bytes());
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub artifacts: BTreeMap<OutputProduct, PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintStore {
    #[serde(default)]
    pub tiles: BTreeMap<TileId, FingerprintRecord>,
}

impl FingerprintStore {
    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(FINGERPRINT_FILE)
    }

    /// Missing or unreadable stores load as empty; the worst case is a re-run.
    pub fn load(output_dir: &Path) -> Self {
        let path = Self::path_in(output_dir);
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        serde_json::from_slice(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring corrupt fingerprint store");
            Self::default()
        })
    }

    pub fn save(&self, output_dir: &Path) -> Result<()> {
        fs::create_dir_all(output_dir).map_err(|e| OrchestratorError::io(output_dir, e))?;
        let path = Self::path_in(output_dir);
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        fs::write(&path, bytes).map_err(|e| OrchestratorError::io(&path, e))
    }

    /// Recorded artifacts for `tile` when the fingerprint matches and every artifact still exists.
    pub fn reusable(&self, tile: &str, fingerprint: &str) -> Option<&BTreeMap<OutputProduct, PathBuf>> {
        let record = self.tiles.get(tile)?;
        if record.fingerprint != fingerprint || record.artifacts.is_empty() {
            return None;
        }
        record
            .artifacts
            .values()
            .all(|p| p.is_file())
            .then_some(&record.artifacts)
    }

    pub fn record(&mut self, tile: TileId, fingerprint: String, artifacts: BTreeMap<OutputProduct, PathBuf>) {
        self.tiles.insert(
            tile,
            FingerprintRecord {
                fingerprint,
                artifacts,
            },
        );
    }

    pub fn forget(&mut self, tile: &str) {
        self.tiles.remove(tile);
    }
}
