use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use labsync_protocol::{ExperimentRecord, FileRecord, GroupRecord, Replica, UserRecord};
use serde::{Deserialize, Serialize};

/// Sentinel shown in place of a name for user folders matching no remote user.
pub const USER_NOT_FOUND: &str = "USER NOT FOUND";

/// A local file inside a dataset folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileEntry {
    /// Directory relative to the dataset folder, `/`-separated; empty at top level.
    pub subdirectory: String,
    pub filename: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// A dataset-bearing directory found by the scanner.
#[derive(Debug, Clone)]
pub struct DiscoveredFolder {
    pub name: String,
    pub location: PathBuf,
    pub owner_folder: Option<String>,
    pub group_folder: Option<String>,
    pub experiment_folder: Option<String>,
    /// Assigned by the resolver when the experiment is resolved.
    pub experiment_title: Option<String>,
    pub files: Vec<DataFileEntry>,
}

impl DiscoveredFolder {
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, index: usize) -> Option<&DataFileEntry> {
        self.files.get(index)
    }

    /// Absolute path of the file at `index`.
    pub fn datafile_path(&self, index: usize) -> Option<PathBuf> {
        let entry = self.files.get(index)?;
        let mut path = self.location.clone();
        for part in entry.subdirectory.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path.push(&entry.filename);
        Some(path)
    }
}

/// Outcome of reconciling one local file against the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupStatus {
    NotStarted,
    InProgress,
    /// No remote record; upload required.
    NotFound,
    FoundVerified,
    /// Submitted directly and unverified; cannot be resumed.
    FoundUnverifiedUnstaged,
    /// Fully staged, awaiting remote verification.
    FoundUnverifiedFullSize,
    /// Partially staged; resume from the staged size.
    FoundUnverifiedNotFullSize,
    /// Record without replicas; upload restarts.
    FoundUnverifiedNoDfos,
    /// Replica known but its staging object is gone.
    NotFoundOnStaging,
    Failed,
}

impl LookupStatus {
    pub fn needs_upload(self) -> bool {
        matches!(
            self,
            LookupStatus::NotFound
                | LookupStatus::FoundUnverifiedNotFullSize
                | LookupStatus::FoundUnverifiedNoDfos
                | LookupStatus::NotFoundOnStaging
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, LookupStatus::NotStarted | LookupStatus::InProgress)
    }
}

/// Lookup state of a single file.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub folder_name: String,
    pub subdirectory: String,
    pub datafile_index: usize,
    pub filename: String,
    pub status: LookupStatus,
    pub message: String,
    pub complete: bool,
    /// Remote record found unverified during lookup; drives resume.
    pub existing_unverified_file_record: Option<FileRecord>,
    /// Latest staging replica of that record, when there is one.
    pub staging_replica: Option<Replica>,
    /// Bytes already staged, for `FoundUnverifiedNotFullSize`.
    pub resume_offset: u64,
    /// The failure behind a `Failed` status warrants aborting the run.
    pub fatal: bool,
}

impl Lookup {
    pub fn new(folder: &DiscoveredFolder, datafile_index: usize) -> Self {
        let (subdirectory, filename) = folder
            .file(datafile_index)
            .map(|f| (f.subdirectory.clone(), f.filename.clone()))
            .unwrap_or_default();
        Self {
            folder_name: folder.name.clone(),
            subdirectory,
            datafile_index,
            filename,
            status: LookupStatus::NotStarted,
            message: String::new(),
            complete: false,
            existing_unverified_file_record: None,
            staging_replica: None,
            resume_offset: 0,
            fatal: false,
        }
    }

    /// Sets the terminal status. A completed lookup is never changed again.
    pub fn finish(&mut self, status: LookupStatus, message: impl Into<String>) {
        if self.complete {
            return;
        }
        self.status = status;
        self.message = message.into();
        self.complete = true;
    }

    /// Relative path of the file within its dataset.
    pub fn relative_path(&self) -> String {
        if self.subdirectory.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.subdirectory, self.filename)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMethod {
    /// Whole file and metadata in one request.
    #[default]
    MultipartPost,
    /// Bytes written to staging, then verified by the remote.
    Staged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Canceled
        )
    }
}

/// Transfer of a single file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub folder_name: String,
    pub subdirectory: String,
    pub datafile_index: usize,
    pub filename: String,
    pub method: UploadMethod,
    pub file_size: u64,
    pub status: UploadStatus,
    pub message: String,
    pub bytes_uploaded: u64,
    /// Offset the transfer started from; non-zero for resumed uploads.
    pub resumed_from: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Average bytes per second; derived from the timestamps unless the
    /// transfer measured it.
    pub speed: Option<f64>,
    pub file_record_id: Option<i64>,
    /// The failure behind a `Failed` status rejects the session itself.
    pub fatal: bool,
}

impl Upload {
    pub fn new(lookup: &Lookup, method: UploadMethod, file_size: u64) -> Self {
        Self {
            folder_name: lookup.folder_name.clone(),
            subdirectory: lookup.subdirectory.clone(),
            datafile_index: lookup.datafile_index,
            filename: lookup.filename.clone(),
            method,
            file_size,
            status: UploadStatus::NotStarted,
            message: String::new(),
            bytes_uploaded: 0,
            resumed_from: 0,
            started_at: None,
            completed_at: None,
            speed: None,
            file_record_id: None,
            fatal: false,
        }
    }

    pub fn start(&mut self) {
        if self.status == UploadStatus::NotStarted {
            self.status = UploadStatus::InProgress;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, message: impl Into<String>) {
        self.finish(UploadStatus::Completed, message);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.finish(UploadStatus::Failed, message);
    }

    pub fn cancel(&mut self) {
        self.finish(UploadStatus::Canceled, "canceled");
    }

    fn finish(&mut self, status: UploadStatus, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.message = message.into();
        self.completed_at = Some(now);
        if self.speed.is_none()
            && let Some(started) = self.started_at
        {
            let elapsed = (now - started).num_milliseconds();
            if elapsed > 0 {
                self.speed = Some(self.bytes_uploaded as f64 * 1000.0 / elapsed as f64);
            }
        }
    }
}

/// A folder-level owner: the folder name plus the matching user, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub folder_name: String,
    pub user: Option<UserRecord>,
}

impl Owner {
    pub fn is_found(&self) -> bool {
        self.user.is_some()
    }

    pub fn username(&self) -> &str {
        self.user
            .as_ref()
            .map_or(USER_NOT_FOUND, |u| u.username.as_str())
    }

    pub fn full_name(&self) -> String {
        self.user
            .as_ref()
            .map_or_else(|| USER_NOT_FOUND.to_string(), UserRecord::full_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub folder_name: String,
    pub record: Option<GroupRecord>,
    /// Remote group name without the configured prefix.
    pub short_name: String,
}

impl Group {
    pub fn is_found(&self) -> bool {
        self.record.is_some()
    }
}

/// Notifications emitted during a run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    OwnerFound(Owner),
    GroupFound(Group),
    ExperimentFound(ExperimentRecord),
    DatasetFound {
        folder_name: String,
        dataset_id: i64,
        num_files: usize,
    },
    /// A folder that will not be synced, with the reason.
    FolderSkipped { path: PathBuf, reason: String },
    LookupComplete(Lookup),
    UploadProgress {
        folder_name: String,
        filename: String,
        bytes_uploaded: u64,
        file_size: u64,
    },
    UploadComplete(Upload),
}

/// Totals for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub folders: usize,
    pub folders_skipped: usize,
    pub lookups: BTreeMap<LookupStatus, usize>,
    pub uploads_completed: usize,
    pub uploads_failed: usize,
    pub uploads_canceled: usize,
    pub bytes_uploaded: u64,
}

impl RunSummary {
    pub fn record_lookup(&mut self, lookup: &Lookup) {
        *self.lookups.entry(lookup.status).or_default() += 1;
    }

    pub fn record_upload(&mut self, upload: &Upload) {
        match upload.status {
            UploadStatus::Completed => self.uploads_completed += 1,
            UploadStatus::Failed => self.uploads_failed += 1,
            UploadStatus::Canceled => self.uploads_canceled += 1,
            UploadStatus::NotStarted | UploadStatus::InProgress => {}
        }
        self.bytes_uploaded += upload.bytes_uploaded;
    }

    pub fn lookup_count(&self, status: LookupStatus) -> usize {
        self.lookups.get(&status).copied().unwrap_or(0)
    }

    pub fn total_lookups(&self) -> usize {
        self.lookups.values().sum()
    }

    pub fn total_uploads(&self) -> usize {
        self.uploads_completed + self.uploads_failed + self.uploads_canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder() -> DiscoveredFolder {
        DiscoveredFolder {
            name: "Flowers".into(),
            location: PathBuf::from("/data/testuser1/Flowers"),
            owner_folder: Some("testuser1".into()),
            group_folder: None,
            experiment_folder: None,
            experiment_title: None,
            files: vec![
                DataFileEntry {
                    subdirectory: String::new(),
                    filename: "Pond_Water_Hyacinth_Flowers.jpg".into(),
                    size: 10,
                    modified: None,
                },
                DataFileEntry {
                    subdirectory: "raw/day1".into(),
                    filename: "Pansy.jpg".into(),
                    size: 20,
                    modified: None,
                },
            ],
        }
    }

    #[test]
    fn datafile_path_joins_subdirectory() {
        let folder = folder();
        assert_eq!(
            folder.datafile_path(1).unwrap(),
            PathBuf::from("/data/testuser1/Flowers/raw/day1/Pansy.jpg")
        );
        assert!(folder.datafile_path(2).is_none());
    }

    #[test]
    fn lookup_from_folder_entry() {
        let lookup = Lookup::new(&folder(), 1);
        assert_eq!(lookup.folder_name, "Flowers");
        assert_eq!(lookup.relative_path(), "raw/day1/Pansy.jpg");
        assert_eq!(lookup.status, LookupStatus::NotStarted);
        assert!(!lookup.complete);
    }

    #[test]
    fn completed_lookup_is_immutable() {
        let mut lookup = Lookup::new(&folder(), 0);
        lookup.finish(LookupStatus::NotFound, "not found");
        lookup.finish(LookupStatus::Failed, "late");
        assert_eq!(lookup.status, LookupStatus::NotFound);
        assert_eq!(lookup.message, "not found");
    }

    #[test]
    fn only_four_statuses_need_upload() {
        let upload: Vec<LookupStatus> = [
            LookupStatus::NotStarted,
            LookupStatus::InProgress,
            LookupStatus::NotFound,
            LookupStatus::FoundVerified,
            LookupStatus::FoundUnverifiedUnstaged,
            LookupStatus::FoundUnverifiedFullSize,
            LookupStatus::FoundUnverifiedNotFullSize,
            LookupStatus::FoundUnverifiedNoDfos,
            LookupStatus::NotFoundOnStaging,
            LookupStatus::Failed,
        ]
        .into_iter()
        .filter(|s| s.needs_upload())
        .collect();
        assert_eq!(
            upload,
            vec![
                LookupStatus::NotFound,
                LookupStatus::FoundUnverifiedNotFullSize,
                LookupStatus::FoundUnverifiedNoDfos,
                LookupStatus::NotFoundOnStaging,
            ]
        );
    }

    #[test]
    fn upload_transitions_are_monotonic() {
        let lookup = Lookup::new(&folder(), 0);
        let mut upload = Upload::new(&lookup, UploadMethod::MultipartPost, 10);
        upload.start();
        assert_eq!(upload.status, UploadStatus::InProgress);
        assert!(upload.started_at.is_some());

        upload.bytes_uploaded = 10;
        upload.complete("done");
        upload.fail("too late");
        upload.cancel();
        assert_eq!(upload.status, UploadStatus::Completed);
        assert_eq!(upload.message, "done");
        assert!(upload.completed_at.is_some());
    }

    #[test]
    fn owner_sentinel_when_not_found() {
        let owner = Owner {
            folder_name: "ghost".into(),
            user: None,
        };
        assert!(!owner.is_found());
        assert_eq!(owner.username(), USER_NOT_FOUND);
        assert_eq!(owner.full_name(), USER_NOT_FOUND);
    }

    #[test]
    fn summary_counts() {
        let mut summary = RunSummary::default();
        let mut lookup = Lookup::new(&folder(), 0);
        lookup.finish(LookupStatus::NotFound, "");
        summary.record_lookup(&lookup);
        summary.record_lookup(&lookup);

        let mut upload = Upload::new(&lookup, UploadMethod::Staged, 10);
        upload.start();
        upload.bytes_uploaded = 10;
        upload.complete("ok");
        summary.record_upload(&upload);

        assert_eq!(summary.lookup_count(LookupStatus::NotFound), 2);
        assert_eq!(summary.lookup_count(LookupStatus::Failed), 0);
        assert_eq!(summary.total_lookups(), 2);
        assert_eq!(summary.uploads_completed, 1);
        assert_eq!(summary.bytes_uploaded, 10);
    }
}
