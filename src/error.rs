//! Error types for the orchestrator.

use std::path::PathBuf;

/// Run-fatal configuration problems. Raised before any tile is dispatched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for `{option}`: {message}")]
    InvalidOption {
        option: &'static str,
        message: String,
    },

    #[error("Catalog root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Tile {tile}: CRS {tile_crs} conflicts with configured CRS {global_crs}")]
    CrsConflict {
        tile: String,
        tile_crs: String,
        global_crs: String,
    },

    #[error("Tile {tile}: parameter override `{card}` is reserved")]
    ReservedCard { tile: String, card: String },

    #[error("Tile {tile}: invalid metadata file {path}: {message}")]
    TileMetadata {
        tile: String,
        path: PathBuf,
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Merge command for `{product}` failed: {message}")]
    Merge { product: String, message: String },

    #[error("Run task failed: {0}")]
    Join(String),
}

impl OrchestratorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OrchestratorError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
