use serde::{Deserialize, Serialize};

/// A user account on the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl UserRecord {
    /// Returns "First Last", falling back to the username when no name is set.
    pub fn full_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.username.clone()
        } else {
            name.to_string()
        }
    }
}

/// A user group on the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
}

/// A facility that owns instruments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub id: i64,
    pub name: String,
}

/// An instrument registered under a facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRecord {
    pub id: i64,
    pub name: String,
    pub facility_id: i64,
}

/// An experiment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// A dataset record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: i64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experiments: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_id: Option<i64>,
}

/// Metadata for one file stored in a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub dataset_id: i64,
    pub filename: String,
    /// Subdirectory relative to the dataset folder, `/`-separated, empty for top level.
    #[serde(default)]
    pub directory: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256sum: String,
}

/// Where a replica's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    /// Bytes are written to a staging area and verified asynchronously.
    Staging,
    /// Bytes arrived with the record in a single multipart request.
    Direct,
    #[serde(other)]
    Other,
}

/// A physical copy of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: i64,
    pub datafile_id: i64,
    pub uri: String,
    pub storage_class: StorageClass,
    #[serde(default)]
    pub verified: bool,
}

impl Replica {
    pub fn is_staged(&self) -> bool {
        self.storage_class == StorageClass::Staging
    }
}

/// Remote verification state of a file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending,
    Verified,
    /// Checksum or size of the stored bytes does not match the record.
    Mismatched,
}
