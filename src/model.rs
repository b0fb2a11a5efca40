use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tokio::time::Instant;

/// Stable tile key: a filename stem or tile sub-directory name.
pub type TileId = String;

pub type RunId = String;

/// Input file kinds a tile can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileKind {
    #[serde(rename = "dem")]
    Dem,
    #[serde(rename = "stream", alias = "strm", alias = "stream_network")]
    StreamNetwork,
    #[serde(rename = "landuse", alias = "lu", alias = "land_use")]
    LandUse,
    #[serde(rename = "flow", alias = "flow_table")]
    FlowTable,
}

impl FileKind {
    pub const ALL: [FileKind; 4] = [
        FileKind::Dem,
        FileKind::StreamNetwork,
        FileKind::LandUse,
        FileKind::FlowTable,
    ];

    /// Parse the kind part of a file name (`dem`, `strm`, `lu`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dem" => Some(FileKind::Dem),
            "stream" | "strm" => Some(FileKind::StreamNetwork),
            "landuse" | "lu" => Some(FileKind::LandUse),
            "flow" => Some(FileKind::FlowTable),
            _ => None,
        }
    }

    /// File stem used inside a working directory.
    pub fn standard_stem(self) -> &'static str {
        match self {
            FileKind::Dem => "dem",
            FileKind::StreamNetwork => "stream",
            FileKind::LandUse => "landuse",
            FileKind::FlowTable => "flow",
        }
    }

    pub fn accepts_extension(self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        let allowed: &[&str] = match self {
            FileKind::Dem | FileKind::LandUse => &["tif", "tiff", "vrt"],
            FileKind::StreamNetwork => &["tif", "tiff", "shp", "gpkg", "parquet", "geoparquet"],
            FileKind::FlowTable => &["txt", "csv"],
        };
        allowed.contains(&ext.as_str())
    }

    /// Parameter-file card naming this input.
    pub fn card(self) -> &'static str {
        match self {
            FileKind::Dem => "DEM_File",
            FileKind::StreamNetwork => "Stream_File",
            FileKind::LandUse => "LU_Raster_SameRes",
            FileKind::FlowTable => "Flow_File",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.standard_stem())
    }
}

/// Raster products the model writes under fixed names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputProduct {
    Depth,
    Extent,
    Velocity,
    Wse,
}

impl OutputProduct {
    pub fn name(self) -> &'static str {
        match self {
            OutputProduct::Depth => "depth",
            OutputProduct::Extent => "extent",
            OutputProduct::Velocity => "velocity",
            OutputProduct::Wse => "wse",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            OutputProduct::Depth => "depth.tif",
            OutputProduct::Extent => "extent.tif",
            OutputProduct::Velocity => "velocity.tif",
            OutputProduct::Wse => "wse.tif",
        }
    }

    pub fn card(self) -> &'static str {
        match self {
            OutputProduct::Depth => "OutDEP",
            OutputProduct::Extent => "OutFLD",
            OutputProduct::Velocity => "OutVEL",
            OutputProduct::Wse => "OutWSE",
        }
    }
}

/// A model parameter value as written to the parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// `None` means the card is omitted, `Some("")` a bare flag card.
    pub fn render(&self) -> Option<String> {
        match self {
            ParamValue::Flag(true) => Some(String::new()),
            ParamValue::Flag(false) => None,
            ParamValue::Integer(v) => Some(v.to_string()),
            ParamValue::Float(v) => Some(v.to_string()),
            ParamValue::Text(v) => Some(v.clone()),
        }
    }
}

/// Optional per-tile sidecar metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TileMetadata {
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Validation {
    Complete,
    Invalid { missing: Vec<FileKind> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: TileId,
    pub files: BTreeMap<FileKind, PathBuf>,
    pub validation: Validation,
    pub metadata: TileMetadata,
}

impl Tile {
    pub fn is_valid(&self) -> bool {
        matches!(self.validation, Validation::Complete)
    }

    pub fn file(&self, kind: FileKind) -> Option<&PathBuf> {
        self.files.get(&kind)
    }
}

/// Terminal state of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn is_retryable(self) -> bool {
        matches!(self, RunState::Failed | RunState::TimedOut)
    }
}

/// Outcome of one model invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub tile_id: TileId,
    pub attempt: u32,
    pub state: RunState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default)]
    pub started_at: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<OutputProduct, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reused: bool,
}

impl RunResult {
    /// Result for an attempt that never produced a process (spawn or setup failure).
    pub fn failed(tile_id: &str, attempt: u32, started_at: String, error: String) -> Self {
        Self {
            tile_id: tile_id.to_string(),
            attempt,
            state: RunState::Failed,
            exit_code: None,
            duration_ms: 0,
            started_at,
            artifacts: BTreeMap::new(),
            error: Some(error),
            stderr_tail: Vec::new(),
            reused: false,
        }
    }
}

/// Retry bookkeeping for one tile, advanced by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAttempt {
    pub attempts: u32,
    pub next_eligible: Instant,
}

impl RunAttempt {
    pub fn first(now: Instant) -> Self {
        Self {
            attempts: 0,
            next_eligible: now,
        }
    }
}

/// Final disposition of a tile within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TileOutcome {
    Succeeded,
    GaveUp,
    Invalid { missing: Vec<FileKind> },
    Cancelled,
}

impl TileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TileOutcome::Succeeded)
    }
}

/// Run-level outcome shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartialFailure,
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::PartialFailure => "succeeded with partial failures",
            RunOutcome::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Messages flowing from the scheduler to the aggregator.
#[derive(Debug, Clone)]
pub enum RunEvent {
    AttemptFinished {
        // Box to keep RunEvent small next to TileSettled.
        result: Box<RunResult>,
    },
    TileSettled {
        tile_id: TileId,
        outcome: TileOutcome,
    },
}

/// RFC 3339 timestamp for "now".
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
