//! Entity resolution: folder names to remote records.
//!
//! Every lookup-or-create goes through an [`IdentityCache`] keyed by the
//! entity's natural key, so concurrent resolutions of the same key share a
//! single remote round trip and at most one create call is made per run.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use labsync_protocol::{
    DatasetQuery, DatasetRecord, ExperimentQuery, ExperimentRecord, InstrumentRecord, NewDataset,
    NewExperiment, NewInstrument, UserRecord,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::RepositoryClient;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::retry::with_retries;
use crate::structure::{FolderStructure, Segment};
use crate::types::{DiscoveredFolder, Group, Owner, USER_NOT_FOUND};

/// Map of natural keys to lazily initialized values.
///
/// A failed initialization leaves the slot empty so a later caller retries.
pub struct IdentityCache<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for IdentityCache<K, V> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V: Clone> IdentityCache<K, V> {
    pub async fn get_or_try_init<F, Fut>(&self, key: K, init: F) -> Result<V, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, SyncError>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.entry(key).or_default().clone()
        };
        cell.get_or_try_init(init).await.cloned()
    }

    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remote entities backing one dataset folder.
#[derive(Debug, Clone)]
pub struct ResolvedFolder {
    pub owner: Option<Owner>,
    pub group: Option<Group>,
    pub experiment: ExperimentRecord,
    pub dataset: DatasetRecord,
}

pub struct EntityResolver {
    client: Arc<dyn RepositoryClient>,
    config: Arc<SyncConfig>,
    structure: FolderStructure,
    cancel: CancellationToken,
    instrument: OnceCell<InstrumentRecord>,
    owners: IdentityCache<String, Owner>,
    groups: IdentityCache<String, Group>,
    experiments: IdentityCache<ExperimentQuery, ExperimentRecord>,
    datasets: IdentityCache<DatasetQuery, DatasetRecord>,
}

impl EntityResolver {
    pub fn new(
        client: Arc<dyn RepositoryClient>,
        config: Arc<SyncConfig>,
        structure: FolderStructure,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            structure,
            cancel,
            instrument: OnceCell::new(),
            owners: IdentityCache::default(),
            groups: IdentityCache::default(),
            experiments: IdentityCache::default(),
            datasets: IdentityCache::default(),
        }
    }

    pub fn structure(&self) -> &FolderStructure {
        &self.structure
    }

    /// Looks up the configured facility and the instrument within it,
    /// registering the instrument if needed. A missing facility is fatal.
    pub async fn resolve_instrument(&self) -> Result<InstrumentRecord, SyncError> {
        self.instrument
            .get_or_try_init(|| async {
                let facility_name = self.config.facility_name.as_str();
                let facility = with_retries(&self.config.retry, &self.cancel, "find facility", || {
                    self.client.find_facility(facility_name)
                })
                .await?
                .ok_or_else(|| {
                    SyncError::Config(format!("facility \"{facility_name}\" not found"))
                })?;

                let name = self.config.instrument_name.as_str();
                let existing =
                    with_retries(&self.config.retry, &self.cancel, "find instrument", || {
                        self.client.find_instrument(facility.id, name)
                    })
                    .await?;
                if let Some(instrument) = existing {
                    debug!(instrument = %name, id = instrument.id, "instrument found");
                    return Ok(instrument);
                }

                let req = NewInstrument {
                    facility_id: facility.id,
                    name: name.to_string(),
                };
                let instrument = self.client.create_instrument(&req).await?;
                info!(instrument = %name, id = instrument.id, "instrument created");
                Ok::<_, SyncError>(instrument)
            })
            .await
            .cloned()
    }

    /// Resolves the configured default owner, if any. A configured owner
    /// that does not exist is a configuration error.
    pub async fn resolve_default_owner(&self) -> Result<Option<UserRecord>, SyncError> {
        let Some(username) = self.config.default_owner.as_deref() else {
            return Ok(None);
        };
        let user = with_retries(&self.config.retry, &self.cancel, "find user", || {
            self.client.find_user_by_username(username)
        })
        .await?;
        match user {
            Some(user) => Ok(Some(user)),
            None => Err(SyncError::Config(format!(
                "default owner \"{username}\" not found"
            ))),
        }
    }

    /// Matches a user folder against remote users by username or email,
    /// per the folder structure. No match yields the sentinel owner.
    pub async fn resolve_owner(&self, folder_name: &str) -> Result<Owner, SyncError> {
        self.owners
            .get_or_try_init(folder_name.to_string(), || async {
                let by_email = self.structure.owner_segment() == Some(&Segment::Email);
                let user = with_retries(&self.config.retry, &self.cancel, "find user", || {
                    if by_email {
                        self.client.find_user_by_email(folder_name)
                    } else {
                        self.client.find_user_by_username(folder_name)
                    }
                })
                .await?;
                if user.is_none() {
                    warn!(folder = %folder_name, "no user matches folder");
                }
                Ok(Owner {
                    folder_name: folder_name.to_string(),
                    user,
                })
            })
            .await
    }

    /// Matches a group folder against remote groups named
    /// `group_prefix` + folder name.
    pub async fn resolve_group(&self, folder_name: &str) -> Result<Group, SyncError> {
        self.groups
            .get_or_try_init(folder_name.to_string(), || async {
                let name = format!("{}{folder_name}", self.config.group_prefix);
                let record = with_retries(&self.config.retry, &self.cancel, "find group", || {
                    self.client.find_group(&name)
                })
                .await?;
                if record.is_none() {
                    warn!(folder = %folder_name, group = %name, "no group matches folder");
                }
                Ok(Group {
                    folder_name: folder_name.to_string(),
                    record,
                    short_name: folder_name.to_string(),
                })
            })
            .await
    }

    /// Title for a folder's experiment: the experiment folder's name when
    /// the structure has one, otherwise derived from instrument and owner.
    pub fn experiment_title(
        &self,
        folder: &DiscoveredFolder,
        owner: Option<&Owner>,
        group: Option<&Group>,
        instrument: &InstrumentRecord,
    ) -> String {
        if let Some(experiment) = &folder.experiment_folder {
            return experiment.clone();
        }
        match (owner, group) {
            (Some(owner), _) if owner.is_found() => {
                format!("{} - {}", instrument.name, owner.full_name())
            }
            (Some(owner), _) => format!(
                "{} - {} ({USER_NOT_FOUND})",
                instrument.name, owner.folder_name
            ),
            (None, Some(group)) => format!("{} - {}", instrument.name, group.short_name),
            (None, None) => instrument.name.clone(),
        }
    }

    pub async fn resolve_experiment(
        &self,
        folder: &DiscoveredFolder,
        owner: Option<&Owner>,
        group: Option<&Group>,
        instrument: &InstrumentRecord,
        default_owner: Option<&UserRecord>,
    ) -> Result<ExperimentRecord, SyncError> {
        let title = self.experiment_title(folder, owner, group, instrument);
        let query = ExperimentQuery {
            title: title.clone(),
            folder_structure: self.structure.to_string(),
            user_folder_name: folder.owner_folder.clone(),
            group_folder_name: folder.group_folder.clone(),
        };
        let owner_id = owner
            .and_then(|o| o.user.as_ref())
            .or(default_owner)
            .map(|u| u.id);

        self.experiments
            .get_or_try_init(query.clone(), || async {
                let existing =
                    with_retries(&self.config.retry, &self.cancel, "find experiment", || {
                        self.client.find_experiment(&query)
                    })
                    .await?;
                if let Some(experiment) = existing {
                    debug!(title = %experiment.title, id = experiment.id, "experiment found");
                    return Ok(experiment);
                }

                let req = NewExperiment {
                    title,
                    description: format!(
                        "Instrument: {}\nFolder structure: {}",
                        instrument.name, query.folder_structure
                    ),
                    instrument_id: instrument.id,
                    owner_id,
                    folder_structure: query.folder_structure.clone(),
                    user_folder_name: query.user_folder_name.clone(),
                    group_folder_name: query.group_folder_name.clone(),
                };
                let experiment = self.client.create_experiment(&req).await?;
                info!(title = %experiment.title, id = experiment.id, "experiment created");
                Ok(experiment)
            })
            .await
    }

    pub async fn resolve_dataset(
        &self,
        folder: &DiscoveredFolder,
        experiment: &ExperimentRecord,
        instrument: &InstrumentRecord,
    ) -> Result<DatasetRecord, SyncError> {
        let query = DatasetQuery {
            experiment_id: experiment.id,
            description: folder.name.clone(),
            instrument_id: instrument.id,
        };
        self.datasets
            .get_or_try_init(query.clone(), || async {
                let existing = with_retries(&self.config.retry, &self.cancel, "find dataset", || {
                    self.client.find_dataset(&query)
                })
                .await?;
                if let Some(dataset) = existing {
                    debug!(dataset = %dataset.description, id = dataset.id, "dataset found");
                    return Ok(dataset);
                }

                let req = NewDataset {
                    experiments: vec![query.experiment_id],
                    description: query.description.clone(),
                    instrument_id: query.instrument_id,
                    immutable: false,
                };
                let dataset = self.client.create_dataset(&req).await?;
                info!(dataset = %dataset.description, id = dataset.id, "dataset created");
                Ok(dataset)
            })
            .await
    }

    /// Resolves every entity behind a dataset folder and records the
    /// experiment title on it.
    ///
    /// Unmatched user or group folders fail with
    /// [`SyncError::InvalidFolder`] unless the config allows uploading them.
    pub async fn resolve_folder(
        &self,
        folder: &mut DiscoveredFolder,
        instrument: &InstrumentRecord,
        default_owner: Option<&UserRecord>,
    ) -> Result<ResolvedFolder, SyncError> {
        let allow_invalid = self.config.upload_invalid_user_or_group_folders;

        let owner = match &folder.owner_folder {
            Some(name) => Some(self.resolve_owner(name).await?),
            None => None,
        };
        if let Some(owner) = &owner
            && !owner.is_found()
            && !allow_invalid
        {
            return Err(SyncError::InvalidFolder(format!(
                "no user matches folder \"{}\"",
                owner.folder_name
            )));
        }

        let group = match &folder.group_folder {
            Some(name) => Some(self.resolve_group(name).await?),
            None => None,
        };
        if let Some(group) = &group
            && !group.is_found()
            && !allow_invalid
        {
            return Err(SyncError::InvalidFolder(format!(
                "no group matches folder \"{}\"",
                group.folder_name
            )));
        }

        let experiment = self
            .resolve_experiment(folder, owner.as_ref(), group.as_ref(), instrument, default_owner)
            .await?;
        folder.experiment_title = Some(experiment.title.clone());
        let dataset = self.resolve_dataset(folder, &experiment, instrument).await?;

        Ok(ResolvedFolder {
            owner,
            group,
            experiment,
            dataset,
        })
    }
}
