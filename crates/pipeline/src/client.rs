//! Repository client trait.
//!
//! The embedding application implements `RepositoryClient` on top of its
//! HTTP transport. Using a trait keeps the pipeline decoupled from the
//! remote API and testable with an in-memory mock.

use std::future::Future;
use std::pin::Pin;

use labsync_protocol::{
    DatasetQuery, DatasetRecord, ExperimentQuery, ExperimentRecord, FacilityRecord, FileRecord,
    FileRecordQuery, GroupRecord, InstrumentRecord, NewDataset, NewExperiment, NewFileRecord,
    NewInstrument, Replica, UserRecord, VerificationState,
};

use crate::error::SyncError;

/// Boxed future returned by every repository call.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// How file content accompanies a new file record.
#[derive(Debug, Clone, Copy)]
pub enum FileSubmission<'a> {
    /// Whole file sent with the metadata in one multipart request.
    Multipart(&'a [u8]),
    /// Metadata only; the remote allocates a staging replica for the bytes.
    Staged,
}

/// Destination of a byte upload.
#[derive(Debug, Clone, Copy)]
pub enum UploadTarget<'a> {
    /// Direct content upload for an existing file record.
    Record(i64),
    /// Write into a staging replica.
    Staging(&'a Replica),
}

/// Abstract connection to the data repository.
pub trait RepositoryClient: Send + Sync {
    fn find_user_by_username<'a>(&'a self, username: &'a str)
    -> BoxFuture<'a, Option<UserRecord>>;

    fn find_user_by_email<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Option<UserRecord>>;

    fn find_group<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<GroupRecord>>;

    fn find_facility<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Option<FacilityRecord>>;

    fn find_instrument<'a>(
        &'a self,
        facility_id: i64,
        name: &'a str,
    ) -> BoxFuture<'a, Option<InstrumentRecord>>;

    fn create_instrument<'a>(&'a self, req: &'a NewInstrument)
    -> BoxFuture<'a, InstrumentRecord>;

    fn find_experiment<'a>(
        &'a self,
        query: &'a ExperimentQuery,
    ) -> BoxFuture<'a, Option<ExperimentRecord>>;

    fn create_experiment<'a>(&'a self, req: &'a NewExperiment)
    -> BoxFuture<'a, ExperimentRecord>;

    fn find_dataset<'a>(&'a self, query: &'a DatasetQuery) -> BoxFuture<'a, Option<DatasetRecord>>;

    fn create_dataset<'a>(&'a self, req: &'a NewDataset) -> BoxFuture<'a, DatasetRecord>;

    fn find_file_record<'a>(
        &'a self,
        query: &'a FileRecordQuery,
    ) -> BoxFuture<'a, Option<FileRecord>>;

    /// Creates a file record, with its content for multipart submission.
    fn create_file_record<'a>(
        &'a self,
        req: &'a NewFileRecord,
        content: FileSubmission<'a>,
    ) -> BoxFuture<'a, FileRecord>;

    /// Replicas of a file record, in any order.
    fn query_replicas<'a>(&'a self, record_id: i64) -> BoxFuture<'a, Vec<Replica>>;

    fn create_staging_replica<'a>(&'a self, record_id: i64) -> BoxFuture<'a, Replica>;

    /// Bytes currently present at a staging replica, or `None` when its
    /// staging object does not exist.
    fn staged_size<'a>(&'a self, replica: &'a Replica) -> BoxFuture<'a, Option<u64>>;

    /// Writes `data` at `offset` of the target.
    fn upload_bytes<'a>(
        &'a self,
        target: &'a UploadTarget<'a>,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, ()>;

    /// Asks the remote to (re-)verify a file record's replicas.
    fn request_verification<'a>(&'a self, record_id: i64) -> BoxFuture<'a, ()>;

    fn poll_verification<'a>(&'a self, record_id: i64) -> BoxFuture<'a, VerificationState>;
}
