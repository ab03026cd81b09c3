use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Looks up an experiment by its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentQuery {
    pub title: String,
    pub folder_structure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_folder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_folder_name: Option<String>,
}

/// Looks up a dataset by description within an experiment and instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetQuery {
    pub experiment_id: i64,
    pub description: String,
    pub instrument_id: i64,
}

/// Looks up a file record within a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRecordQuery {
    pub dataset_id: i64,
    pub filename: String,
    pub directory: String,
}

// ---------------------------------------------------------------------------
// Create payloads
// ---------------------------------------------------------------------------

/// Registers a new instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInstrument {
    pub facility_id: i64,
    pub name: String,
}

/// Creates an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub instrument_id: i64,
    /// User granted ownership; the authenticated user when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
    pub folder_structure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_folder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_folder_name: Option<String>,
}

/// Creates a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataset {
    pub experiments: Vec<i64>,
    pub description: String,
    pub instrument_id: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub immutable: bool,
}

/// Creates a file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFileRecord {
    pub dataset_id: i64,
    pub filename: String,
    pub directory: String,
    pub size: u64,
    pub sha256sum: String,
    /// RFC 3339 modification time of the local file, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}
