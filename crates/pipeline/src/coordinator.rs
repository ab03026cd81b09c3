//! Pipeline coordinator.
//!
//! Drives one sync run: scans the data directory, resolves the entities
//! behind every dataset folder, then schedules one lookup per file and an
//! upload for each file whose lookup calls for one. Lookups and uploads
//! draw from separately bounded worker pools.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use labsync_protocol::{DatasetRecord, InstrumentRecord, UserRecord};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::RepositoryClient;
use crate::config::SyncConfig;
use crate::error::{ErrorClass, SyncError};
use crate::lookup::LookupEngine;
use crate::resolver::EntityResolver;
use crate::scanner::{FolderScanner, ScanEvent, ScanFilters};
use crate::types::{DiscoveredFolder, Lookup, LookupStatus, RunSummary, SyncEvent, Upload};
use crate::upload::UploadExecutor;

/// Terminal state of one file.
struct FileOutcome {
    lookup: Lookup,
    upload: Option<Upload>,
}

/// State shared by the per-file tasks of a run.
struct RunContext {
    config: Arc<SyncConfig>,
    lookups: LookupEngine,
    uploads: UploadExecutor,
    lookup_slots: Arc<Semaphore>,
    upload_slots: Arc<Semaphore>,
    events_tx: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
    /// Stops scheduling new work. Cancelled on user cancel or fatal abort.
    halt: CancellationToken,
    abort_reason: Mutex<Option<String>>,
}

impl RunContext {
    /// Records the first fatal failure and stops scheduling.
    fn abort(&self, reason: String) {
        let mut slot = self
            .abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!(reason = %reason, "aborting sync run");
            *slot = Some(reason);
        }
        self.halt.cancel();
    }

    fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.events_tx.send(event).await;
    }

    /// Waits for a worker slot unless scheduling has stopped.
    async fn slot(&self, slots: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.halt.cancelled() => None,
            permit = slots.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Looks up one file under an already acquired lookup slot, then
    /// uploads it if needed.
    async fn process_file(
        self: Arc<Self>,
        lookup_slot: OwnedSemaphorePermit,
        dataset: Arc<DatasetRecord>,
        folder: Arc<DiscoveredFolder>,
        index: usize,
    ) -> FileOutcome {
        let mut lookup = if self.halt.is_cancelled() {
            canceled_lookup(&folder, index)
        } else {
            self.lookups.lookup(&dataset, &folder, index).await
        };
        drop(lookup_slot);
        // Results that arrive after a user cancel are discarded.
        if self.cancel.is_cancelled() && lookup.status != LookupStatus::Failed {
            lookup = canceled_lookup(&folder, index);
        }
        if lookup.fatal {
            self.abort(lookup.message.clone());
        }
        self.emit(SyncEvent::LookupComplete(lookup.clone())).await;

        if !lookup.status.needs_upload() {
            return FileOutcome {
                lookup,
                upload: None,
            };
        }

        let upload = match self.slot(&self.upload_slots).await {
            Some(_permit) => {
                let upload = self.uploads.upload(&lookup, &dataset, &folder).await;
                // Halt before the slot frees so queued uploads never start.
                if upload.fatal {
                    self.abort(upload.message.clone());
                }
                upload
            }
            None => {
                let size = folder.file(index).map_or(0, |f| f.size);
                let mut upload = Upload::new(&lookup, self.config.upload_method, size);
                upload.cancel();
                upload
            }
        };
        self.emit(SyncEvent::UploadComplete(upload.clone())).await;
        FileOutcome {
            lookup,
            upload: Some(upload),
        }
    }
}

fn canceled_lookup(folder: &DiscoveredFolder, index: usize) -> Lookup {
    let mut lookup = Lookup::new(folder, index);
    lookup.finish(LookupStatus::Failed, "canceled");
    lookup
}

/// Runs sync passes over a data directory against one repository.
pub struct PipelineCoordinator {
    config: Arc<SyncConfig>,
    client: Arc<dyn RepositoryClient>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Option<mpsc::Receiver<SyncEvent>>,
    cancel: CancellationToken,
}

impl PipelineCoordinator {
    pub fn new(config: SyncConfig, client: Arc<dyn RepositoryClient>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            config: Arc::new(config),
            client,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Takes the event receiver. Can only be called once, before [`run`].
    ///
    /// [`run`]: Self::run
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.take()
    }

    /// Returns the cancellation token for this coordinator's runs.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs one full pass.
    ///
    /// Configuration and startup failures (missing facility, unknown
    /// default owner) are returned before any file is touched. A fatal
    /// failure during the run stops scheduling, drains in-flight work and
    /// returns [`SyncError::Aborted`]. User cancellation is not an error:
    /// the summary reports the canceled files.
    pub async fn run(&mut self) -> Result<RunSummary, SyncError> {
        // Nobody listening: drop the receiver so sends never block.
        self.events_rx = None;

        self.config.validate()?;
        let structure = self.config.structure()?;
        let filters = ScanFilters::from_config(&self.config.filters)?;
        let scanner = FolderScanner::new(&self.config.data_directory, structure.clone(), filters)?;

        let resolver = EntityResolver::new(
            self.client.clone(),
            self.config.clone(),
            structure,
            self.cancel.clone(),
        );
        let instrument = resolver.resolve_instrument().await?;
        let default_owner = resolver.resolve_default_owner().await?;

        let halt = self.cancel.child_token();
        let ctx = Arc::new(RunContext {
            config: self.config.clone(),
            lookups: LookupEngine::new(
                self.client.clone(),
                self.config.clone(),
                self.cancel.clone(),
            ),
            uploads: UploadExecutor::new(
                self.client.clone(),
                self.config.clone(),
                self.cancel.clone(),
                self.events_tx.clone(),
            ),
            lookup_slots: Arc::new(Semaphore::new(self.config.max_lookup_threads)),
            upload_slots: Arc::new(Semaphore::new(self.config.max_upload_threads)),
            events_tx: self.events_tx.clone(),
            cancel: self.cancel.clone(),
            halt: halt.clone(),
            abort_reason: Mutex::new(None),
        });

        info!(
            data_directory = %self.config.data_directory.display(),
            structure = %self.config.folder_structure,
            instrument = %instrument.name,
            "sync run started"
        );

        let (scan_tx, mut scan_rx) = mpsc::channel(64);
        let scan_halt = halt.clone();
        let scan_task = tokio::task::spawn_blocking(move || {
            for event in scanner {
                if scan_halt.is_cancelled() || scan_tx.blocking_send(event).is_err() {
                    break;
                }
            }
        });

        let mut run = RunState {
            ctx: ctx.clone(),
            resolver,
            instrument,
            default_owner,
            tasks: JoinSet::new(),
            summary: RunSummary::default(),
            experiments_seen: HashSet::new(),
            claimed: HashSet::new(),
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                event = scan_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            run.reap();
            run.handle(event).await;
        }

        drop(scan_rx);
        if let Err(e) = scan_task.await {
            warn!(error = %e, "scanner task failed");
        }
        let summary = run.drain().await;

        if let Some(reason) = ctx.abort_reason() {
            return Err(SyncError::Aborted(reason));
        }
        if self.cancel.is_cancelled() {
            info!(
                lookups = summary.total_lookups(),
                uploads_canceled = summary.uploads_canceled,
                "sync run canceled"
            );
        } else {
            info!(
                folders = summary.folders,
                lookups = summary.total_lookups(),
                uploads = summary.uploads_completed,
                failed = summary.uploads_failed,
                bytes = summary.bytes_uploaded,
                "sync run finished"
            );
        }
        Ok(summary)
    }
}

/// Main-loop state of a single run.
struct RunState {
    ctx: Arc<RunContext>,
    resolver: EntityResolver,
    instrument: InstrumentRecord,
    default_owner: Option<UserRecord>,
    tasks: JoinSet<FileOutcome>,
    summary: RunSummary,
    experiments_seen: HashSet<i64>,
    /// Files already scheduled; a file is looked up at most once per run.
    claimed: HashSet<PathBuf>,
}

impl RunState {
    async fn handle(&mut self, event: ScanEvent) {
        match event {
            ScanEvent::OwnerFolder { name, .. } => {
                match self.resolver.resolve_owner(&name).await {
                    Ok(owner) => self.ctx.emit(SyncEvent::OwnerFound(owner)).await,
                    Err(e) => self.resolution_failed(&name, e),
                }
            }
            ScanEvent::GroupFolder { name, .. } => {
                match self.resolver.resolve_group(&name).await {
                    Ok(group) => self.ctx.emit(SyncEvent::GroupFound(group)).await,
                    Err(e) => self.resolution_failed(&name, e),
                }
            }
            ScanEvent::ExperimentFolder { name, path } => {
                debug!(experiment = %name, path = %path.display(), "experiment folder");
            }
            ScanEvent::Skipped { path, reason } => {
                warn!(path = %path.display(), reason = %reason, "folder skipped");
                self.summary.folders_skipped += 1;
                self.ctx
                    .emit(SyncEvent::FolderSkipped { path, reason })
                    .await;
            }
            ScanEvent::DatasetFolder(folder) => self.dataset(folder).await,
        }
    }

    fn resolution_failed(&self, name: &str, e: SyncError) {
        match e.class() {
            ErrorClass::Canceled => {}
            ErrorClass::Fatal | ErrorClass::Unreachable => self.ctx.abort(e.to_string()),
            _ => warn!(folder = %name, error = %e, "resolution failed"),
        }
    }

    async fn dataset(&mut self, mut folder: DiscoveredFolder) {
        self.summary.folders += 1;
        let resolved = self
            .resolver
            .resolve_folder(&mut folder, &self.instrument, self.default_owner.as_ref())
            .await;

        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) if e.class() == ErrorClass::Canceled => return,
            Err(e) => {
                let reason = e.to_string();
                if matches!(e.class(), ErrorClass::Fatal | ErrorClass::Unreachable) {
                    self.ctx.abort(reason.clone());
                }
                self.skip_folder(&folder, reason).await;
                return;
            }
        };

        if self.experiments_seen.insert(resolved.experiment.id) {
            self.ctx
                .emit(SyncEvent::ExperimentFound(resolved.experiment.clone()))
                .await;
        }
        self.ctx
            .emit(SyncEvent::DatasetFound {
                folder_name: folder.name.clone(),
                dataset_id: resolved.dataset.id,
                num_files: folder.num_files(),
            })
            .await;

        let dataset = Arc::new(resolved.dataset);
        let folder = Arc::new(folder);
        for index in 0..folder.num_files() {
            let Some(path) = folder.datafile_path(index) else {
                continue;
            };
            if !self.claimed.insert(path.clone()) {
                debug!(file = %path.display(), "file already scheduled");
                continue;
            }
            // A task is spawned only once its lookup slot is free.
            let Some(lookup_slot) = self.ctx.slot(&self.ctx.lookup_slots).await else {
                let lookup = canceled_lookup(&folder, index);
                self.summary.record_lookup(&lookup);
                self.ctx.emit(SyncEvent::LookupComplete(lookup)).await;
                continue;
            };
            self.reap();
            let task = self.ctx.clone().process_file(
                lookup_slot,
                dataset.clone(),
                folder.clone(),
                index,
            );
            self.tasks.spawn(task);
        }
    }

    /// Reports every file of an unresolvable folder as failed.
    async fn skip_folder(&mut self, folder: &DiscoveredFolder, reason: String) {
        warn!(folder = %folder.name, reason = %reason, "dataset folder skipped");
        self.summary.folders_skipped += 1;
        self.ctx
            .emit(SyncEvent::FolderSkipped {
                path: folder.location.clone(),
                reason: reason.clone(),
            })
            .await;
        for index in 0..folder.num_files() {
            let mut lookup = Lookup::new(folder, index);
            lookup.finish(LookupStatus::Failed, reason.clone());
            self.summary.record_lookup(&lookup);
            self.ctx.emit(SyncEvent::LookupComplete(lookup)).await;
        }
    }

    fn absorb(&mut self, outcome: FileOutcome) {
        self.summary.record_lookup(&outcome.lookup);
        if let Some(upload) = &outcome.upload {
            self.summary.record_upload(upload);
        }
    }

    /// Folds already finished tasks into the summary.
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.collect(joined);
        }
    }

    async fn drain(mut self) -> RunSummary {
        while let Some(joined) = self.tasks.join_next().await {
            self.collect(joined);
        }
        self.summary
    }

    fn collect(&mut self, joined: Result<FileOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.absorb(outcome),
            Err(e) => warn!(error = %e, "file task failed"),
        }
    }
}
