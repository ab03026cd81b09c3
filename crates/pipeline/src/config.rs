//! Sync configuration.
//!
//! Configuration is an explicit value handed to the coordinator; it is
//! stored as JSON and every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SyncError;
use crate::structure::{FolderStructure, Segment};
use crate::types::UploadMethod;

/// What to do with a file whose remote record was submitted directly
/// and never verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiedUnstagedPolicy {
    /// Leave it alone.
    #[default]
    Skip,
    /// Ask the remote to verify it again. Nothing is re-uploaded.
    RequestVerification,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_factor() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
        }
    }
}

impl BackoffConfig {
    /// Delay before the given attempt (1-based), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.factor.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// Retry policy for transient remote errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Polling of remote verification after a staged upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_poll_backoff")]
    pub backoff: BackoffConfig,
    #[serde(default = "default_verification_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_poll_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay_ms: 1_000,
        max_delay_ms: 30_000,
        factor: 2.0,
    }
}

fn default_verification_timeout_secs() -> u64 {
    300
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            backoff: default_poll_backoff(),
            timeout_secs: default_verification_timeout_secs(),
        }
    }
}

impl VerificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Name and age filters applied during the scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Glob patterns; matching user folders are ignored.
    pub user_filter: Vec<String>,
    pub group_filter: Vec<String>,
    pub experiment_filter: Vec<String>,
    pub dataset_filter: Vec<String>,
    /// When non-empty, only files matching one of these globs are kept.
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Ignore files modified within the last N minutes.
    pub ignore_new_files_minutes: Option<u64>,
    /// Ignore dataset folders whose newest file is older than N days.
    pub ignore_old_datasets_days: Option<u64>,
}

/// Top-level configuration of a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub data_directory: PathBuf,

    #[serde(default = "default_folder_structure")]
    pub folder_structure: String,

    #[serde(default)]
    pub upload_method: UploadMethod,

    #[serde(default = "default_lookup_threads")]
    pub max_lookup_threads: usize,

    #[serde(default = "default_upload_threads")]
    pub max_upload_threads: usize,

    pub facility_name: String,

    pub instrument_name: String,

    /// Username owning experiments whose user folder matched nobody.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_owner: Option<String>,

    /// Prepended to a group folder name to form the remote group name.
    #[serde(default)]
    pub group_prefix: String,

    #[serde(default)]
    pub upload_invalid_user_or_group_folders: bool,

    #[serde(default)]
    pub unverified_unstaged_policy: UnverifiedUnstagedPolicy,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Consecutive unreachable errors tolerated before the run aborts.
    #[serde(default = "default_max_unreachable_failures")]
    pub max_unreachable_failures: u32,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub filters: FilterConfig,
}

fn default_folder_structure() -> String {
    "Username / Dataset".into()
}

fn default_lookup_threads() -> usize {
    8
}

fn default_upload_threads() -> usize {
    4
}

fn default_chunk_size() -> usize {
    labsync_transfer::DEFAULT_CHUNK_SIZE
}

fn default_max_unreachable_failures() -> u32 {
    3
}

impl SyncConfig {
    /// Config with defaults for everything but the required fields.
    pub fn new(
        data_directory: impl Into<PathBuf>,
        facility_name: impl Into<String>,
        instrument_name: impl Into<String>,
    ) -> Self {
        Self {
            data_directory: data_directory.into(),
            folder_structure: default_folder_structure(),
            upload_method: UploadMethod::default(),
            max_lookup_threads: default_lookup_threads(),
            max_upload_threads: default_upload_threads(),
            facility_name: facility_name.into(),
            instrument_name: instrument_name.into(),
            default_owner: None,
            group_prefix: String::new(),
            upload_invalid_user_or_group_folders: false,
            unverified_unstaged_policy: UnverifiedUnstagedPolicy::default(),
            chunk_size: default_chunk_size(),
            max_unreachable_failures: default_max_unreachable_failures(),
            retry: RetryConfig::default(),
            verification: VerificationConfig::default(),
            filters: FilterConfig::default(),
        }
    }

    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn structure(&self) -> Result<FolderStructure, SyncError> {
        self.folder_structure.parse()
    }

    /// Checks the config and returns warnings for settings that silently
    /// exclude data. Errors are returned for settings the run cannot use.
    pub fn validate(&self) -> Result<Vec<String>, SyncError> {
        if !self.data_directory.is_dir() {
            return Err(SyncError::Config(format!(
                "data directory {} does not exist",
                self.data_directory.display()
            )));
        }
        if self.facility_name.trim().is_empty() {
            return Err(SyncError::Config("facility name is required".into()));
        }
        if self.instrument_name.trim().is_empty() {
            return Err(SyncError::Config("instrument name is required".into()));
        }
        if self.max_lookup_threads == 0 || self.max_upload_threads == 0 {
            return Err(SyncError::Config(
                "lookup and upload thread limits must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }

        let structure = self.structure()?;
        if self.upload_invalid_user_or_group_folders
            && structure.owner_segment().is_some()
            && self.default_owner.is_none()
        {
            return Err(SyncError::Config(
                "uploading invalid user folders requires a default owner".into(),
            ));
        }

        let mut warnings = Vec::new();
        if !self.upload_invalid_user_or_group_folders {
            if structure.owner_segment().is_some() {
                warnings.push("Invalid user folders are being ignored".to_string());
            }
            if structure.contains(Segment::UserGroup) {
                warnings.push("Invalid group folders are being ignored".to_string());
            }
        }
        let filters = &self.filters;
        if !filters.user_filter.is_empty() {
            warnings.push("User folders are being filtered".to_string());
        }
        if !filters.group_filter.is_empty() {
            warnings.push("Group folders are being filtered".to_string());
        }
        if !filters.experiment_filter.is_empty() {
            warnings.push("Experiment folders are being filtered".to_string());
        }
        if !filters.dataset_filter.is_empty() {
            warnings.push("Dataset folders are being filtered".to_string());
        }
        if !filters.includes.is_empty() || !filters.excludes.is_empty() {
            warnings.push("Files are being filtered by name".to_string());
        }
        if let Some(minutes) = filters.ignore_new_files_minutes {
            warnings.push(format!(
                "Files newer than {minutes} minute{} are being ignored",
                if minutes == 1 { "" } else { "s" }
            ));
        }
        if let Some(days) = filters.ignore_old_datasets_days {
            warnings.push(format!(
                "Datasets older than {days} day{} are being ignored",
                if days == 1 { "" } else { "s" }
            ));
        }

        for warning in &warnings {
            warn!(warning = %warning, "configuration");
        }
        Ok(warnings)
    }
}
