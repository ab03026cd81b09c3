//! Folder structure scanner.
//!
//! Walks the data directory according to a [`FolderStructure`] and yields
//! discovery events lazily, in lexicographic order. Each dataset folder is
//! yielded with its file list already enumerated.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::FilterConfig;
use crate::error::SyncError;
use crate::structure::{FolderStructure, Segment};
use crate::types::{DataFileEntry, DiscoveredFolder};

/// Something the scanner found (or refused) at one directory level.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    OwnerFolder {
        name: String,
        path: PathBuf,
    },
    GroupFolder {
        name: String,
        path: PathBuf,
    },
    ExperimentFolder {
        name: String,
        path: PathBuf,
    },
    DatasetFolder(DiscoveredFolder),
    /// A directory that does not fit the structure; reported, not fatal.
    Skipped {
        path: PathBuf,
        reason: String,
    },
}

/// Compiled name and age filters.
#[derive(Debug, Clone, Default)]
pub struct ScanFilters {
    user: Vec<Pattern>,
    group: Vec<Pattern>,
    experiment: Vec<Pattern>,
    dataset: Vec<Pattern>,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
    ignore_newer_than: Option<Duration>,
    ignore_older_than: Option<Duration>,
}

fn compile(kind: &str, patterns: &[String]) -> Result<Vec<Pattern>, SyncError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| SyncError::Config(format!("invalid {kind} pattern '{p}': {e}")))
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], name: &str) -> bool {
    patterns.iter().any(|p| p.matches(name))
}

impl ScanFilters {
    pub fn from_config(config: &FilterConfig) -> Result<Self, SyncError> {
        Ok(Self {
            user: compile("user filter", &config.user_filter)?,
            group: compile("group filter", &config.group_filter)?,
            experiment: compile("experiment filter", &config.experiment_filter)?,
            dataset: compile("dataset filter", &config.dataset_filter)?,
            includes: compile("include", &config.includes)?,
            excludes: compile("exclude", &config.excludes)?,
            ignore_newer_than: config
                .ignore_new_files_minutes
                .map(|m| Duration::from_secs(m * 60)),
            ignore_older_than: config
                .ignore_old_datasets_days
                .map(|d| Duration::from_secs(d * 24 * 60 * 60)),
        })
    }

    fn excludes_folder(&self, segment: &Segment, name: &str) -> bool {
        let patterns = match segment {
            Segment::Username | Segment::Email => &self.user,
            Segment::UserGroup => &self.group,
            Segment::Experiment => &self.experiment,
            Segment::Dataset => &self.dataset,
            Segment::Literal(_) => return false,
        };
        matches_any(patterns, name)
    }

    fn keeps_file(&self, filename: &str, modified: Option<SystemTime>, now: SystemTime) -> bool {
        // Includes alone restrict; alongside excludes they only rescue excluded names.
        let included = matches_any(&self.includes, filename);
        if self.excludes.is_empty() {
            if !self.includes.is_empty() && !included {
                return false;
            }
        } else if !included && matches_any(&self.excludes, filename) {
            return false;
        }
        if let (Some(limit), Some(modified)) = (self.ignore_newer_than, modified)
            && now.duration_since(modified).unwrap_or_default() < limit
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
struct Context {
    owner: Option<String>,
    group: Option<String>,
    experiment: Option<String>,
}

struct Pending {
    path: PathBuf,
    level: usize,
    context: Context,
}

/// Lazy, finite scan of a data directory.
pub struct FolderScanner {
    structure: FolderStructure,
    filters: ScanFilters,
    stack: Vec<Pending>,
    now: SystemTime,
}

impl FolderScanner {
    pub fn new(
        root: &Path,
        structure: FolderStructure,
        filters: ScanFilters,
    ) -> Result<Self, SyncError> {
        if !root.is_dir() {
            return Err(SyncError::Config(format!(
                "data directory {} is not a directory",
                root.display()
            )));
        }
        let mut scanner = Self {
            structure,
            filters,
            stack: Vec::new(),
            now: SystemTime::now(),
        };
        let children = sorted_subdirectories(root)?;
        scanner.push_children(children, 0, &Context::default());
        debug!(root = %root.display(), structure = %scanner.structure, "scan started");
        Ok(scanner)
    }

    fn push_children(&mut self, children: Vec<PathBuf>, level: usize, context: &Context) {
        // Reverse so the stack pops in lexicographic order.
        for path in children.into_iter().rev() {
            self.stack.push(Pending {
                path,
                level,
                context: context.clone(),
            });
        }
    }

    /// Queues the subdirectories of `path` one level deeper.
    fn descend(&mut self, path: &Path, level: usize, context: Context) -> Option<ScanEvent> {
        match sorted_subdirectories(path) {
            Ok(children) => {
                self.push_children(children, level + 1, &context);
                None
            }
            Err(e) => Some(ScanEvent::Skipped {
                path: path.to_path_buf(),
                reason: format!("unreadable directory: {e}"),
            }),
        }
    }

    fn visit(&mut self, pending: Pending) -> Option<ScanEvent> {
        let Pending {
            path,
            level,
            mut context,
        } = pending;
        let name = path.file_name()?.to_string_lossy().into_owned();
        let segment = self.structure.segments().get(level)?.clone();

        if self.filters.excludes_folder(&segment, &name) {
            debug!(path = %path.display(), "folder filtered");
            return None;
        }

        match segment {
            Segment::Literal(expected) => {
                if name != expected {
                    return Some(ScanEvent::Skipped {
                        path,
                        reason: format!("expected a folder named \"{expected}\""),
                    });
                }
                self.descend(&path, level, context)
            }
            Segment::Username | Segment::Email => {
                context.owner = Some(name.clone());
                if let Some(skipped) = self.descend(&path, level, context) {
                    return Some(skipped);
                }
                Some(ScanEvent::OwnerFolder { name, path })
            }
            Segment::UserGroup => {
                context.group = Some(name.clone());
                if let Some(skipped) = self.descend(&path, level, context) {
                    return Some(skipped);
                }
                Some(ScanEvent::GroupFolder { name, path })
            }
            Segment::Experiment => {
                context.experiment = Some(name.clone());
                if let Some(skipped) = self.descend(&path, level, context) {
                    return Some(skipped);
                }
                Some(ScanEvent::ExperimentFolder { name, path })
            }
            Segment::Dataset => Some(self.dataset(path, name, context)),
        }
    }

    fn dataset(&self, path: PathBuf, name: String, context: Context) -> ScanEvent {
        let files = match self.enumerate_files(&path) {
            Ok(files) => files,
            Err(e) => {
                return ScanEvent::Skipped {
                    path,
                    reason: format!("unreadable dataset folder: {e}"),
                };
            }
        };

        if files.is_empty() {
            return ScanEvent::Skipped {
                path,
                reason: "dataset folder contains no files".into(),
            };
        }

        if let Some(limit) = self.filters.ignore_older_than {
            let newest = files.iter().filter_map(|f| f.modified).max();
            if let Some(newest) = newest
                && self.now.duration_since(newest).unwrap_or_default() > limit
            {
                debug!(path = %path.display(), "dataset older than limit");
                return ScanEvent::Skipped {
                    path,
                    reason: "dataset folder is older than the configured limit".into(),
                };
            }
        }

        ScanEvent::DatasetFolder(DiscoveredFolder {
            name,
            location: path,
            owner_folder: context.owner,
            group_folder: context.group,
            experiment_folder: context.experiment,
            experiment_title: None,
            files,
        })
    }

    fn enumerate_files(&self, dataset: &Path) -> Result<Vec<DataFileEntry>, SyncError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dataset).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().map_err(std::io::Error::from)?;
            let modified = metadata.modified().ok();
            if !self.filters.keeps_file(&filename, modified, self.now) {
                debug!(path = %entry.path().display(), "file filtered");
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(dataset)
                .map_err(std::io::Error::other)?;
            let subdirectory = rel
                .parent()
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();

            files.push(DataFileEntry {
                subdirectory,
                filename,
                size: metadata.len(),
                modified,
            });
        }
        Ok(files)
    }
}

impl Iterator for FolderScanner {
    type Item = ScanEvent;

    fn next(&mut self) -> Option<ScanEvent> {
        while let Some(pending) = self.stack.pop() {
            if let Some(event) = self.visit(pending) {
                return Some(event);
            }
        }
        None
    }
}

/// Non-hidden subdirectories of `dir`, sorted by name. Stray files are ignored.
fn sorted_subdirectories(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        } else {
            debug!(path = %entry.path().display(), "ignoring file outside a dataset folder");
        }
    }
    dirs.sort();
    Ok(dirs)
}
