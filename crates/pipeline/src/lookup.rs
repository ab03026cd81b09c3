//! Per-file lookup: reconciles a local file with its remote record and
//! replicas to decide whether it needs uploading.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use labsync_protocol::{DatasetRecord, FileRecordQuery};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::RepositoryClient;
use crate::config::{SyncConfig, UnverifiedUnstagedPolicy};
use crate::error::{ErrorClass, SyncError};
use crate::retry::with_retries;
use crate::types::{DataFileEntry, DiscoveredFolder, Lookup, LookupStatus};

/// Counts consecutive "unreachable" failures across all lookups.
pub struct UnreachableTracker {
    consecutive: AtomicU32,
    threshold: u32,
}

impl UnreachableTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    /// Records a failure; true once the threshold is reached.
    pub fn record_failure(&self) -> bool {
        self.consecutive.fetch_add(1, Ordering::SeqCst) + 1 >= self.threshold
    }

    pub fn reset(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }
}

pub struct LookupEngine {
    client: Arc<dyn RepositoryClient>,
    config: Arc<SyncConfig>,
    cancel: CancellationToken,
    unreachable: UnreachableTracker,
}

impl LookupEngine {
    pub fn new(
        client: Arc<dyn RepositoryClient>,
        config: Arc<SyncConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let unreachable = UnreachableTracker::new(config.max_unreachable_failures);
        Self {
            client,
            config,
            cancel,
            unreachable,
        }
    }

    /// Determines the lookup status of file `index` of `folder`.
    ///
    /// Always returns a completed lookup. Failures end in
    /// [`LookupStatus::Failed`]; `fatal` is set when the failure should
    /// abort the run.
    pub async fn lookup(
        &self,
        dataset: &DatasetRecord,
        folder: &DiscoveredFolder,
        index: usize,
    ) -> Lookup {
        let mut lookup = Lookup::new(folder, index);
        let Some(entry) = folder.file(index) else {
            lookup.finish(LookupStatus::Failed, format!("no file at index {index}"));
            return lookup;
        };
        if self.cancel.is_cancelled() {
            lookup.finish(LookupStatus::Failed, "canceled");
            return lookup;
        }
        lookup.status = LookupStatus::InProgress;

        match self.reconcile(&mut lookup, dataset, entry).await {
            Ok(()) => self.unreachable.reset(),
            Err(e) => {
                let class = e.class();
                lookup.fatal = match class {
                    ErrorClass::Fatal => true,
                    ErrorClass::Unreachable => self.unreachable.record_failure(),
                    _ => false,
                };
                let message = match class {
                    ErrorClass::Canceled => "canceled".to_string(),
                    _ => format!("lookup failed: {e}"),
                };
                if lookup.fatal {
                    error!(file = %lookup.relative_path(), error = %e, "fatal lookup failure");
                } else if class != ErrorClass::Canceled {
                    warn!(file = %lookup.relative_path(), error = %e, "lookup failed");
                }
                lookup.finish(LookupStatus::Failed, message);
            }
        }

        debug!(
            folder = %lookup.folder_name,
            file = %lookup.relative_path(),
            status = ?lookup.status,
            "lookup complete"
        );
        lookup
    }

    async fn reconcile(
        &self,
        lookup: &mut Lookup,
        dataset: &DatasetRecord,
        entry: &DataFileEntry,
    ) -> Result<(), SyncError> {
        let retry = &self.config.retry;
        let query = FileRecordQuery {
            dataset_id: dataset.id,
            filename: entry.filename.clone(),
            directory: entry.subdirectory.clone(),
        };
        let record = with_retries(retry, &self.cancel, "find file record", || {
            self.client.find_file_record(&query)
        })
        .await?;
        let Some(record) = record else {
            lookup.finish(LookupStatus::NotFound, "not found on the repository");
            return Ok(());
        };

        let replicas = with_retries(retry, &self.cancel, "query replicas", || {
            self.client.query_replicas(record.id)
        })
        .await?;
        let Some(latest) = replicas.into_iter().max_by_key(|r| r.id) else {
            lookup.existing_unverified_file_record = Some(record);
            lookup.finish(
                LookupStatus::FoundUnverifiedNoDfos,
                "found unverified record without replicas",
            );
            return Ok(());
        };

        if latest.verified {
            lookup.finish(LookupStatus::FoundVerified, "found verified");
            return Ok(());
        }

        let record_id = record.id;
        lookup.existing_unverified_file_record = Some(record);

        if !latest.is_staged() {
            let message = match self.config.unverified_unstaged_policy {
                UnverifiedUnstagedPolicy::Skip => "found unverified record (direct submission)",
                UnverifiedUnstagedPolicy::RequestVerification => {
                    self.request_verification(record_id).await;
                    "found unverified record (direct submission); verification requested"
                }
            };
            lookup.finish(LookupStatus::FoundUnverifiedUnstaged, message);
            return Ok(());
        }

        let staged = with_retries(retry, &self.cancel, "staged size", || {
            self.client.staged_size(&latest)
        })
        .await?;
        lookup.staging_replica = Some(latest);

        match staged {
            None => {
                lookup.finish(
                    LookupStatus::NotFoundOnStaging,
                    "replica exists but its staged copy is missing",
                );
            }
            Some(size) if size < entry.size => {
                lookup.resume_offset = size;
                lookup.finish(
                    LookupStatus::FoundUnverifiedNotFullSize,
                    format!("partially staged: {size} of {} bytes", entry.size),
                );
            }
            Some(size) if size == entry.size => {
                self.request_verification(record_id).await;
                lookup.finish(
                    LookupStatus::FoundUnverifiedFullSize,
                    "fully staged, awaiting verification",
                );
            }
            Some(size) => {
                lookup.resume_offset = 0;
                lookup.finish(
                    LookupStatus::FoundUnverifiedNotFullSize,
                    format!(
                        "staged copy is larger than the local file ({size} > {} bytes)",
                        entry.size
                    ),
                );
            }
        }
        Ok(())
    }

    /// Best effort; a failed request only gets logged.
    async fn request_verification(&self, record_id: i64) {
        if let Err(e) = self.client.request_verification(record_id).await {
            debug!(record = record_id, error = %e, "verification request failed");
        }
    }
}
