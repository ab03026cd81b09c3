//! In-memory repository used by the pipeline tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use labsync_protocol::{
    DatasetQuery, DatasetRecord, ExperimentQuery, ExperimentRecord, FacilityRecord, FileRecord,
    FileRecordQuery, GroupRecord, InstrumentRecord, NewDataset, NewExperiment, NewFileRecord,
    NewInstrument, Replica, StorageClass, UserRecord, VerificationState,
};
use labsync_transfer::{Chunk, StagingArea, checksum_bytes};
use tempfile::TempDir;

use crate::client::{BoxFuture, FileSubmission, RepositoryClient, UploadTarget};
use crate::config::{BackoffConfig, SyncConfig};
use crate::error::SyncError;

/// Failure injected into a mock operation.
#[derive(Debug, Clone, Copy)]
pub enum FailKind {
    Unauthorized,
    Unreachable,
    Timeout,
    ServerError,
    Conflict,
    ConnectionReset,
}

impl FailKind {
    fn error(self) -> SyncError {
        match self {
            FailKind::Unauthorized => SyncError::Unauthorized("invalid API key".into()),
            FailKind::Unreachable => SyncError::Unreachable("connection refused".into()),
            FailKind::Timeout => SyncError::Timeout,
            FailKind::ServerError => SyncError::Http {
                status: 500,
                message: "internal server error".into(),
            },
            FailKind::Conflict => SyncError::Conflict("duplicate key".into()),
            FailKind::ConnectionReset => SyncError::ConnectionReset,
        }
    }
}

#[derive(Default)]
struct State {
    next_id: i64,
    users: Vec<UserRecord>,
    groups: Vec<GroupRecord>,
    facilities: Vec<FacilityRecord>,
    instruments: Vec<InstrumentRecord>,
    experiments: Vec<(ExperimentQuery, ExperimentRecord)>,
    datasets: Vec<DatasetRecord>,
    files: Vec<FileRecord>,
    replicas: Vec<Replica>,
    direct_content: HashMap<i64, Vec<u8>>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, (FailKind, u32)>,
    bytes_uploaded: u64,
    pending_polls: u32,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Records every call, keeps repository state in memory and writes staged
/// bytes to a temporary staging area.
pub struct MockRepository {
    state: Mutex<State>,
    staging: StagingArea,
    delay: Option<Duration>,
    _staging_dir: TempDir,
}

impl MockRepository {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            state: Mutex::new(State::default()),
            staging: StagingArea::new(dir.path()),
            delay: None,
            _staging_dir: dir,
        }
    }

    /// Mock with "Test Facility" and users testuser1/testuser2 registered.
    pub fn with_test_users() -> Self {
        let repo = Self::new();
        repo.add_facility("Test Facility");
        repo.add_user("testuser1", "Test", "User1");
        repo.add_user("testuser2", "Test", "User2");
        repo
    }

    /// Every remote call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, op: &'static str) -> Result<(), SyncError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some((kind, remaining)) = state.failures.get_mut(op) {
            let err = kind.error();
            *remaining -= 1;
            if *remaining == 0 {
                state.failures.remove(op);
            }
            return Err(err);
        }
        Ok(())
    }

    // -- seeding --------------------------------------------------------

    pub fn add_user(&self, username: &str, first: &str, last: &str) -> UserRecord {
        let mut state = self.lock();
        let user = UserRecord {
            id: state.id(),
            username: username.into(),
            first_name: first.into(),
            last_name: last.into(),
            email: format!("{username}@example.com"),
        };
        state.users.push(user.clone());
        user
    }

    pub fn add_group(&self, name: &str) -> GroupRecord {
        let mut state = self.lock();
        let group = GroupRecord {
            id: state.id(),
            name: name.into(),
        };
        state.groups.push(group.clone());
        group
    }

    pub fn add_facility(&self, name: &str) -> FacilityRecord {
        let mut state = self.lock();
        let facility = FacilityRecord {
            id: state.id(),
            name: name.into(),
        };
        state.facilities.push(facility.clone());
        facility
    }

    pub fn add_dataset(
        &self,
        experiment_id: i64,
        description: &str,
        instrument_id: i64,
    ) -> DatasetRecord {
        let mut state = self.lock();
        let dataset = DatasetRecord {
            id: state.id(),
            description: description.into(),
            experiments: vec![experiment_id],
            instrument_id: Some(instrument_id),
        };
        state.datasets.push(dataset.clone());
        dataset
    }

    pub fn add_file_record(
        &self,
        dataset_id: i64,
        directory: &str,
        filename: &str,
        content: &[u8],
    ) -> FileRecord {
        let mut state = self.lock();
        let record = FileRecord {
            id: state.id(),
            dataset_id,
            filename: filename.into(),
            directory: directory.into(),
            size: content.len() as u64,
            sha256sum: checksum_bytes(content),
        };
        state.files.push(record.clone());
        record
    }

    pub fn add_replica(&self, record: &FileRecord, class: StorageClass, verified: bool) -> Replica {
        let mut state = self.lock();
        let replica = Replica {
            id: state.id(),
            datafile_id: record.id,
            uri: staging_key(record),
            storage_class: class,
            verified,
        };
        state.replicas.push(replica.clone());
        replica
    }

    /// Places `data` in the staging object of `replica`.
    pub fn stage_bytes(&self, replica: &Replica, data: &[u8]) {
        let chunk = Chunk {
            offset: 0,
            data: data.to_vec(),
            checksum: String::new(),
        };
        self.staging.write_chunk(&replica.uri, &chunk).unwrap();
    }

    /// Fails the next `times` calls of `op`.
    pub fn fail(&self, op: &'static str, kind: FailKind, times: u32) {
        self.lock().failures.insert(op, (kind, times));
    }

    /// Answers the next `polls` verification polls with `Pending`.
    pub fn verification_pending_for(&self, polls: u32) {
        self.lock().pending_polls = polls;
    }

    // -- inspection -----------------------------------------------------

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.lock().bytes_uploaded
    }

    pub fn file_records(&self) -> Vec<FileRecord> {
        self.lock().files.clone()
    }

    pub fn experiments(&self) -> Vec<ExperimentRecord> {
        self.lock().experiments.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn instruments(&self) -> Vec<InstrumentRecord> {
        self.lock().instruments.clone()
    }

    pub fn replicas_of(&self, record_id: i64) -> Vec<Replica> {
        self.lock()
            .replicas
            .iter()
            .filter(|r| r.datafile_id == record_id)
            .cloned()
            .collect()
    }

    pub fn staged_object(&self, replica: &Replica) -> Vec<u8> {
        self.staging.read_object(&replica.uri).unwrap()
    }

    pub fn direct_content(&self, record_id: i64) -> Option<Vec<u8>> {
        self.lock().direct_content.get(&record_id).cloned()
    }
}

fn staging_key(record: &FileRecord) -> String {
    if record.directory.is_empty() {
        format!("{}/{}", record.id, record.filename)
    } else {
        format!("{}/{}/{}", record.id, record.directory, record.filename)
    }
}

impl RepositoryClient for MockRepository {
    fn find_user_by_username<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Option<UserRecord>> {
        Box::pin(async move {
            self.enter("find_user").await?;
            Ok(self.lock().users.iter().find(|u| u.username == username).cloned())
        })
    }

    fn find_user_by_email<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Option<UserRecord>> {
        Box::pin(async move {
            self.enter("find_user").await?;
            Ok(self
                .lock()
                .users
                .iter()
                .find(|u| u.email.eq_ignore_ascii_case(email))
                .cloned())
        })
    }

    fn find_group<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<GroupRecord>> {
        Box::pin(async move {
            self.enter("find_group").await?;
            Ok(self.lock().groups.iter().find(|g| g.name == name).cloned())
        })
    }

    fn find_facility<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<FacilityRecord>> {
        Box::pin(async move {
            self.enter("find_facility").await?;
            Ok(self.lock().facilities.iter().find(|f| f.name == name).cloned())
        })
    }

    fn find_instrument<'a>(
        &'a self,
        facility_id: i64,
        name: &'a str,
    ) -> BoxFuture<'a, Option<InstrumentRecord>> {
        Box::pin(async move {
            self.enter("find_instrument").await?;
            Ok(self
                .lock()
                .instruments
                .iter()
                .find(|i| i.facility_id == facility_id && i.name == name)
                .cloned())
        })
    }

    fn create_instrument<'a>(
        &'a self,
        req: &'a NewInstrument,
    ) -> BoxFuture<'a, InstrumentRecord> {
        Box::pin(async move {
            self.enter("create_instrument").await?;
            let mut state = self.lock();
            let instrument = InstrumentRecord {
                id: state.id(),
                name: req.name.clone(),
                facility_id: req.facility_id,
            };
            state.instruments.push(instrument.clone());
            Ok(instrument)
        })
    }

    fn find_experiment<'a>(
        &'a self,
        query: &'a ExperimentQuery,
    ) -> BoxFuture<'a, Option<ExperimentRecord>> {
        Box::pin(async move {
            self.enter("find_experiment").await?;
            Ok(self
                .lock()
                .experiments
                .iter()
                .find(|(q, _)| q == query)
                .map(|(_, e)| e.clone()))
        })
    }

    fn create_experiment<'a>(
        &'a self,
        req: &'a NewExperiment,
    ) -> BoxFuture<'a, ExperimentRecord> {
        Box::pin(async move {
            self.enter("create_experiment").await?;
            let mut state = self.lock();
            let experiment = ExperimentRecord {
                id: state.id(),
                title: req.title.clone(),
                description: req.description.clone(),
            };
            let key = ExperimentQuery {
                title: req.title.clone(),
                folder_structure: req.folder_structure.clone(),
                user_folder_name: req.user_folder_name.clone(),
                group_folder_name: req.group_folder_name.clone(),
            };
            state.experiments.push((key, experiment.clone()));
            Ok(experiment)
        })
    }

    fn find_dataset<'a>(&'a self, query: &'a DatasetQuery) -> BoxFuture<'a, Option<DatasetRecord>> {
        Box::pin(async move {
            self.enter("find_dataset").await?;
            Ok(self
                .lock()
                .datasets
                .iter()
                .find(|d| {
                    d.description == query.description
                        && d.experiments.contains(&query.experiment_id)
                        && d.instrument_id == Some(query.instrument_id)
                })
                .cloned())
        })
    }

    fn create_dataset<'a>(&'a self, req: &'a NewDataset) -> BoxFuture<'a, DatasetRecord> {
        Box::pin(async move {
            self.enter("create_dataset").await?;
            let mut state = self.lock();
            let dataset = DatasetRecord {
                id: state.id(),
                description: req.description.clone(),
                experiments: req.experiments.clone(),
                instrument_id: Some(req.instrument_id),
            };
            state.datasets.push(dataset.clone());
            Ok(dataset)
        })
    }

    fn find_file_record<'a>(
        &'a self,
        query: &'a FileRecordQuery,
    ) -> BoxFuture<'a, Option<FileRecord>> {
        Box::pin(async move {
            self.enter("find_file_record").await?;
            Ok(self
                .lock()
                .files
                .iter()
                .find(|f| {
                    f.dataset_id == query.dataset_id
                        && f.filename == query.filename
                        && f.directory == query.directory
                })
                .cloned())
        })
    }

    fn create_file_record<'a>(
        &'a self,
        req: &'a NewFileRecord,
        content: FileSubmission<'a>,
    ) -> BoxFuture<'a, FileRecord> {
        Box::pin(async move {
            self.enter("create_file_record").await?;
            let mut state = self.lock();
            let duplicate = state.files.iter().any(|f| {
                f.dataset_id == req.dataset_id
                    && f.filename == req.filename
                    && f.directory == req.directory
            });
            if duplicate {
                return Err(SyncError::Conflict(format!(
                    "file record for {} already exists",
                    req.filename
                )));
            }

            let record = FileRecord {
                id: state.id(),
                dataset_id: req.dataset_id,
                filename: req.filename.clone(),
                directory: req.directory.clone(),
                size: req.size,
                sha256sum: req.sha256sum.clone(),
            };
            state.files.push(record.clone());

            let replica_id = state.id();
            let replica = match content {
                FileSubmission::Multipart(bytes) => {
                    state.bytes_uploaded += bytes.len() as u64;
                    state.direct_content.insert(record.id, bytes.to_vec());
                    Replica {
                        id: replica_id,
                        datafile_id: record.id,
                        uri: staging_key(&record),
                        storage_class: StorageClass::Direct,
                        verified: checksum_bytes(bytes) == record.sha256sum,
                    }
                }
                FileSubmission::Staged => Replica {
                    id: replica_id,
                    datafile_id: record.id,
                    uri: staging_key(&record),
                    storage_class: StorageClass::Staging,
                    verified: false,
                },
            };
            state.replicas.push(replica);
            Ok(record)
        })
    }

    fn query_replicas<'a>(&'a self, record_id: i64) -> BoxFuture<'a, Vec<Replica>> {
        Box::pin(async move {
            self.enter("query_replicas").await?;
            Ok(self.replicas_of(record_id))
        })
    }

    fn create_staging_replica<'a>(&'a self, record_id: i64) -> BoxFuture<'a, Replica> {
        Box::pin(async move {
            self.enter("create_staging_replica").await?;
            let mut state = self.lock();
            let record = state
                .files
                .iter()
                .find(|f| f.id == record_id)
                .cloned()
                .ok_or_else(|| SyncError::Http {
                    status: 404,
                    message: format!("no file record {record_id}"),
                })?;
            let replica = Replica {
                id: state.id(),
                datafile_id: record_id,
                uri: staging_key(&record),
                storage_class: StorageClass::Staging,
                verified: false,
            };
            state.replicas.push(replica.clone());
            Ok(replica)
        })
    }

    fn staged_size<'a>(&'a self, replica: &'a Replica) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            self.enter("staged_size").await?;
            Ok(self.staging.object_size(&replica.uri)?)
        })
    }

    fn upload_bytes<'a>(
        &'a self,
        target: &'a UploadTarget<'a>,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.enter("upload_bytes").await?;
            match target {
                UploadTarget::Staging(replica) => {
                    // A write at offset 0 restarts the staged object.
                    if offset == 0 {
                        let _ = std::fs::remove_file(self.staging.root().join(&replica.uri));
                    }
                    let chunk = Chunk {
                        offset,
                        data: data.to_vec(),
                        checksum: checksum_bytes(data),
                    };
                    self.staging.write_chunk(&replica.uri, &chunk)?;
                    self.lock().bytes_uploaded += data.len() as u64;
                }
                UploadTarget::Record(record_id) => {
                    let mut state = self.lock();
                    let record = state
                        .files
                        .iter()
                        .find(|f| f.id == *record_id)
                        .cloned()
                        .ok_or_else(|| SyncError::Http {
                            status: 404,
                            message: format!("no file record {record_id}"),
                        })?;
                    state.bytes_uploaded += data.len() as u64;
                    state.direct_content.insert(record.id, data.to_vec());
                    let replica = Replica {
                        id: state.id(),
                        datafile_id: record.id,
                        uri: staging_key(&record),
                        storage_class: StorageClass::Direct,
                        verified: checksum_bytes(data) == record.sha256sum,
                    };
                    state.replicas.push(replica);
                }
            }
            Ok(())
        })
    }

    fn request_verification<'a>(&'a self, _record_id: i64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.enter("request_verification").await?;
            Ok(())
        })
    }

    fn poll_verification<'a>(&'a self, record_id: i64) -> BoxFuture<'a, VerificationState> {
        Box::pin(async move {
            self.enter("poll_verification").await?;
            let mut state = self.lock();
            if state.pending_polls > 0 {
                state.pending_polls -= 1;
                return Ok(VerificationState::Pending);
            }
            let Some(record) = state.files.iter().find(|f| f.id == record_id).cloned() else {
                return Err(SyncError::Http {
                    status: 404,
                    message: format!("no file record {record_id}"),
                });
            };
            let Some(replica) = state
                .replicas
                .iter_mut()
                .filter(|r| r.datafile_id == record_id)
                .max_by_key(|r| r.id)
            else {
                return Ok(VerificationState::Pending);
            };
            if replica.verified {
                return Ok(VerificationState::Verified);
            }
            let Ok(staged) = self.staging.read_object(&replica.uri) else {
                return Ok(VerificationState::Pending);
            };
            if (staged.len() as u64) < record.size {
                return Ok(VerificationState::Pending);
            }
            if staged.len() as u64 == record.size && checksum_bytes(&staged) == record.sha256sum {
                replica.verified = true;
                Ok(VerificationState::Verified)
            } else {
                Ok(VerificationState::Mismatched)
            }
        })
    }
}

/// Config for tests: small chunks and fast backoff.
pub fn test_config(data_dir: &Path) -> SyncConfig {
    let mut config = SyncConfig::new(data_dir, "Test Facility", "Test Instrument");
    config.max_lookup_threads = 4;
    config.max_upload_threads = 2;
    config.chunk_size = 128;
    config.retry.backoff = BackoffConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        factor: 2.0,
    };
    config.verification.backoff = BackoffConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        factor: 2.0,
    };
    config.verification.timeout_secs = 5;
    config
}

/// Writes `data` to `rel` under `root`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}
