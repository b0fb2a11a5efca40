//! Run configuration.
//!
//! Loaded from YAML. Keys are camelCase and unknown keys are rejected so a
//! misspelled option fails the run instead of silently falling back to a default.

use crate::error::ConfigError;
use crate::model::{FileKind, OutputProduct, ParamValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_CONCURRENCY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout_per_tile: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
    #[serde(default)]
    pub keep_working_dirs: bool,
    #[serde(default)]
    pub require_all_succeed: bool,

    pub model_executable: PathBuf,
    #[serde(default)]
    pub model_args: Vec<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_required_kinds")]
    pub required_kinds: Vec<FileKind>,
    #[serde(default = "default_output_products")]
    pub output_products: Vec<OutputProduct>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub model_parameters: BTreeMap<String, ParamValue>,
    #[serde(default = "default_stderr_tail")]
    pub stderr_tail_lines: usize,
    #[serde(default = "default_cancel_check", with = "humantime_serde")]
    pub cancel_check_interval: Duration,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub merge_command: Option<Vec<String>>,
    /// Second stage run against the same parameter file after AutoRoute succeeds.
    #[serde(default)]
    pub floodspreader_executable: Option<PathBuf>,
    #[serde(default)]
    pub floodspreader_args: Vec<String>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("autoroute-batch")
        .join("work")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("autoroute-output")
}

fn default_required_kinds() -> Vec<FileKind> {
    vec![FileKind::Dem, FileKind::StreamNetwork]
}

fn default_output_products() -> Vec<OutputProduct> {
    vec![OutputProduct::Depth, OutputProduct::Extent]
}

fn default_stderr_tail() -> usize {
    20
}

fn default_cancel_check() -> Duration {
    Duration::from_millis(100)
}

impl Config {
    /// Config with defaults for everything except the model executable.
    pub fn new(model_executable: impl Into<PathBuf>) -> Self {
        Self {
            concurrency_limit: default_concurrency(),
            timeout_per_tile: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            keep_working_dirs: false,
            require_all_succeed: false,
            model_executable: model_executable.into(),
            model_args: Vec::new(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            required_kinds: default_required_kinds(),
            output_products: default_output_products(),
            crs: None,
            model_parameters: BTreeMap::new(),
            stderr_tail_lines: default_stderr_tail(),
            cancel_check_interval: default_cancel_check(),
            overwrite: false,
            merge_command: None,
            floodspreader_executable: None,
            floodspreader_args: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 || self.concurrency_limit > MAX_CONCURRENCY {
            return Err(invalid(
                "concurrencyLimit",
                format!("must be between 1 and {MAX_CONCURRENCY}"),
            ));
        }
        if self.timeout_per_tile.is_zero() {
            return Err(invalid("timeoutPerTile", "must be greater than zero"));
        }
        if self.max_retries == 0 {
            return Err(invalid("maxRetries", "must allow at least one attempt"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(invalid(
                "backoffBase",
                format!(
                    "{} exceeds backoffMax {}",
                    humantime::format_duration(self.backoff_base),
                    humantime::format_duration(self.backoff_max)
                ),
            ));
        }
        if self.model_executable.as_os_str().is_empty() {
            return Err(invalid("modelExecutable", "must not be empty"));
        }
        if !self.required_kinds.contains(&FileKind::Dem) {
            return Err(invalid("requiredKinds", "must include dem"));
        }
        if self.output_products.is_empty() {
            return Err(invalid("outputProducts", "must name at least one product"));
        }
        if self.cancel_check_interval.is_zero() {
            return Err(invalid("cancelCheckInterval", "must be greater than zero"));
        }
        if self
            .floodspreader_executable
            .as_ref()
            .is_some_and(|exe| exe.as_os_str().is_empty())
        {
            return Err(invalid("floodspreaderExecutable", "must not be empty"));
        }
        if let Some(cmd) = &self.merge_command {
            if cmd.is_empty() {
                return Err(invalid("mergeCommand", "must name a program"));
            }
            if !cmd.iter().any(|a| a.contains("{inputs}")) || !cmd.iter().any(|a| a.contains("{output}")) {
                return Err(invalid(
                    "mergeCommand",
                    "must contain {inputs} and {output} placeholders",
                ));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Anchor relative directories at the current directory. The model runs
    /// with its working directory as cwd, so every path handed to it must be absolute.
    pub fn resolve_dirs(&mut self) {
        self.work_dir = absolute(&self.work_dir);
        self.output_dir = absolute(&self.output_dir);
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn invalid(option: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidOption {
        option,
        message: message.into(),
    }
}
