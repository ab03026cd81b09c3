//! Upload executor.
//!
//! Carries out the transfer implied by a lookup, either as one multipart
//! submission or as chunked writes to a staging replica followed by
//! remote verification. Staged uploads resume from the staged size.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use labsync_protocol::{DatasetRecord, FileRecord, NewFileRecord, Replica};
use labsync_transfer::{ChunkReader, FileDigest, TransferMeter, checksum_bytes, digest_file};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{FileSubmission, RepositoryClient, UploadTarget};
use crate::config::SyncConfig;
use crate::error::{ErrorClass, SyncError};
use crate::retry::with_retries;
use crate::types::{
    DataFileEntry, DiscoveredFolder, Lookup, LookupStatus, SyncEvent, Upload, UploadMethod,
};
use crate::verification::{VerificationOutcome, VerificationPoller};

pub struct UploadExecutor {
    client: Arc<dyn RepositoryClient>,
    config: Arc<SyncConfig>,
    cancel: CancellationToken,
    poller: VerificationPoller,
    events_tx: mpsc::Sender<SyncEvent>,
}

impl UploadExecutor {
    pub fn new(
        client: Arc<dyn RepositoryClient>,
        config: Arc<SyncConfig>,
        cancel: CancellationToken,
        events_tx: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let poller = VerificationPoller::new(
            client.clone(),
            config.verification.backoff.clone(),
            cancel.clone(),
        );
        Self {
            client,
            config,
            cancel,
            poller,
            events_tx,
        }
    }

    /// Uploads the file behind `lookup` and returns the terminal upload.
    pub async fn upload(
        &self,
        lookup: &Lookup,
        dataset: &DatasetRecord,
        folder: &DiscoveredFolder,
    ) -> Upload {
        let method = self.config.upload_method;
        let entry = folder.file(lookup.datafile_index);
        let mut upload = Upload::new(lookup, method, entry.map_or(0, |e| e.size));

        let (Some(entry), Some(path)) = (entry, folder.datafile_path(lookup.datafile_index))
        else {
            upload.fail(format!("no file at index {}", lookup.datafile_index));
            return upload;
        };
        if !lookup.status.needs_upload() {
            upload.fail(format!("{:?} does not need an upload", lookup.status));
            return upload;
        }
        if self.cancel.is_cancelled() {
            upload.cancel();
            return upload;
        }

        upload.start();
        let result = match method {
            UploadMethod::MultipartPost => {
                self.multipart(&mut upload, lookup, dataset, entry, &path).await
            }
            UploadMethod::Staged => self.staged(&mut upload, lookup, dataset, entry, &path).await,
        };

        match result {
            // Cancellation while a request was in flight discards its outcome.
            Ok(_) if self.cancel.is_cancelled() => {
                upload.cancel();
                debug!(file = %path.display(), "upload result discarded after cancel");
            }
            Ok(message) => {
                upload.complete(message);
                info!(
                    file = %path.display(),
                    bytes = upload.bytes_uploaded,
                    resumed_from = upload.resumed_from,
                    "upload completed"
                );
            }
            Err(SyncError::Canceled) => {
                upload.cancel();
                debug!(file = %path.display(), "upload canceled");
            }
            Err(e) => {
                upload.fatal = e.class() == ErrorClass::Fatal;
                if upload.fatal {
                    error!(file = %path.display(), error = %e, "fatal upload failure");
                } else {
                    warn!(file = %path.display(), error = %e, "upload failed");
                }
                upload.fail(e.to_string());
            }
        }
        upload
    }

    async fn multipart(
        &self,
        upload: &mut Upload,
        lookup: &Lookup,
        dataset: &DatasetRecord,
        entry: &DataFileEntry,
        path: &Path,
    ) -> Result<String, SyncError> {
        let data = tokio::fs::read(path).await?;
        let digest = FileDigest {
            size: data.len() as u64,
            sha256: checksum_bytes(&data),
        };
        upload.file_size = digest.size;
        let retry = &self.config.retry;

        let record_id = match &lookup.existing_unverified_file_record {
            Some(existing) => {
                let target = UploadTarget::Record(existing.id);
                with_retries(retry, &self.cancel, "upload content", || {
                    self.client.upload_bytes(&target, 0, &data)
                })
                .await?;
                existing.id
            }
            None => {
                let req = new_file_record(dataset, entry, &digest);
                with_retries(retry, &self.cancel, "create file record", || {
                    self.client
                        .create_file_record(&req, FileSubmission::Multipart(&data))
                })
                .await?
                .id
            }
        };

        upload.file_record_id = Some(record_id);
        upload.bytes_uploaded = digest.size;
        self.progress(upload);
        Ok("uploaded".into())
    }

    async fn staged(
        &self,
        upload: &mut Upload,
        lookup: &Lookup,
        dataset: &DatasetRecord,
        entry: &DataFileEntry,
        path: &Path,
    ) -> Result<String, SyncError> {
        let retry = &self.config.retry;
        let existing = lookup.existing_unverified_file_record.as_ref();
        let (record_id, replica, offset) = match lookup.status {
            LookupStatus::NotFound => {
                let owned = path.to_path_buf();
                let digest = tokio::task::spawn_blocking(move || digest_file(&owned))
                    .await
                    .map_err(|e| SyncError::Task(e.to_string()))??;
                upload.file_size = digest.size;
                let req = new_file_record(dataset, entry, &digest);
                let record = with_retries(retry, &self.cancel, "create file record", || {
                    self.client.create_file_record(&req, FileSubmission::Staged)
                })
                .await?;
                let replica = self.staging_replica_for(&record).await?;
                (record.id, replica, 0)
            }
            LookupStatus::FoundUnverifiedNoDfos => {
                let record = require(existing, "file record")?;
                let replica = with_retries(retry, &self.cancel, "create replica", || {
                    self.client.create_staging_replica(record.id)
                })
                .await?;
                (record.id, replica, 0)
            }
            LookupStatus::NotFoundOnStaging => {
                let record = require(existing, "file record")?;
                let replica = require(lookup.staging_replica.as_ref(), "staging replica")?;
                (record.id, replica.clone(), 0)
            }
            LookupStatus::FoundUnverifiedNotFullSize => {
                let record = require(existing, "file record")?;
                let replica = require(lookup.staging_replica.as_ref(), "staging replica")?;
                (record.id, replica.clone(), lookup.resume_offset)
            }
            other => {
                return Err(SyncError::Task(format!("{other:?} does not need an upload")));
            }
        };

        upload.file_record_id = Some(record_id);
        upload.resumed_from = offset;
        self.write_staged(upload, &replica, path, offset).await?;

        with_retries(retry, &self.cancel, "request verification", || {
            self.client.request_verification(record_id)
        })
        .await?;
        match self
            .poller
            .await_verification(record_id, self.config.verification.timeout())
            .await?
        {
            VerificationOutcome::Verified => Ok("uploaded and verified".into()),
            VerificationOutcome::Mismatched => Err(SyncError::Verification(
                "staged copy does not match the file record".into(),
            )),
            VerificationOutcome::TimedOut => Err(SyncError::Verification(
                "timed out waiting for verification".into(),
            )),
        }
    }

    /// Latest staging replica the remote allocated for `record`, or a new one.
    async fn staging_replica_for(&self, record: &FileRecord) -> Result<Replica, SyncError> {
        let retry = &self.config.retry;
        let replicas = with_retries(retry, &self.cancel, "query replicas", || {
            self.client.query_replicas(record.id)
        })
        .await?;
        if let Some(replica) = replicas
            .into_iter()
            .filter(Replica::is_staged)
            .max_by_key(|r| r.id)
        {
            return Ok(replica);
        }
        with_retries(retry, &self.cancel, "create replica", || {
            self.client.create_staging_replica(record.id)
        })
        .await
    }

    /// Streams the file from `offset` into the staging replica.
    ///
    /// Chunk writes are not retried: a broken connection fails the upload
    /// and the next run resumes from whatever reached staging.
    async fn write_staged(
        &self,
        upload: &mut Upload,
        replica: &Replica,
        path: &Path,
        offset: u64,
    ) -> Result<(), SyncError> {
        let chunk_size = self.config.chunk_size;
        let owned: PathBuf = path.to_path_buf();
        let mut reader =
            tokio::task::spawn_blocking(move || ChunkReader::open_at(&owned, chunk_size, offset))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))??;

        let target = UploadTarget::Staging(replica);
        let mut meter = TransferMeter::default();
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }

            let (returned, next) = tokio::task::spawn_blocking(move || {
                let next = reader.next_chunk();
                (reader, next)
            })
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?;
            reader = returned;
            let Some(chunk) = next? else {
                break;
            };

            self.client
                .upload_bytes(&target, chunk.offset, &chunk.data)
                .await?;
            meter.record(chunk.len() as u64);
            upload.bytes_uploaded += chunk.len() as u64;
            debug!(
                file = %upload.filename,
                offset = chunk.end(),
                rate = meter.current_rate(),
                "chunk staged"
            );
            self.progress(upload);
        }

        // Empty files still need a staged object.
        if offset == 0 && upload.bytes_uploaded == 0 {
            self.client.upload_bytes(&target, 0, &[]).await?;
        }

        upload.speed = Some(meter.average_rate());
        Ok(())
    }

    fn progress(&self, upload: &Upload) {
        // Progress is advisory; a full channel drops the update.
        let _ = self.events_tx.try_send(SyncEvent::UploadProgress {
            folder_name: upload.folder_name.clone(),
            filename: upload.filename.clone(),
            bytes_uploaded: upload.bytes_uploaded,
            file_size: upload.file_size,
        });
    }
}

fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T, SyncError> {
    value.ok_or_else(|| SyncError::Task(format!("lookup carries no {what}")))
}

fn new_file_record(
    dataset: &DatasetRecord,
    entry: &DataFileEntry,
    digest: &FileDigest,
) -> NewFileRecord {
    NewFileRecord {
        dataset_id: dataset.id,
        filename: entry.filename.clone(),
        directory: entry.subdirectory.clone(),
        size: digest.size,
        sha256sum: digest.sha256.clone(),
        modified_time: entry
            .modified
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
    }
}
