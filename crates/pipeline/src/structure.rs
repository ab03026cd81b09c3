//! Folder structure patterns.
//!
//! A pattern such as `Username / Experiment / Dataset` maps directory
//! depth onto entity kinds. Quoted segments (`"Data"`) are literal
//! directory names that must be present at that depth.

use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// One level of a folder structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Username,
    Email,
    UserGroup,
    Experiment,
    Dataset,
    Literal(String),
}

impl Segment {
    fn parse(token: &str) -> Result<Self, SyncError> {
        if let Some(inner) = token
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
        {
            if inner.is_empty() {
                return Err(SyncError::Config("empty literal folder name".into()));
            }
            return Ok(Segment::Literal(inner.to_string()));
        }
        match token {
            "Username" => Ok(Segment::Username),
            "Email" => Ok(Segment::Email),
            "User Group" => Ok(Segment::UserGroup),
            "Experiment" => Ok(Segment::Experiment),
            "Dataset" => Ok(Segment::Dataset),
            other => Err(SyncError::Config(format!(
                "unknown folder structure segment: {other}"
            ))),
        }
    }

    fn is_owner(&self) -> bool {
        matches!(self, Segment::Username | Segment::Email)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Username => f.write_str("Username"),
            Segment::Email => f.write_str("Email"),
            Segment::UserGroup => f.write_str("User Group"),
            Segment::Experiment => f.write_str("Experiment"),
            Segment::Dataset => f.write_str("Dataset"),
            Segment::Literal(name) => write!(f, "\"{name}\""),
        }
    }
}

/// A validated folder structure. `Dataset` is always the last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderStructure {
    segments: Vec<Segment>,
}

impl FolderStructure {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of directory levels from the data root to a dataset folder.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn contains(&self, segment: Segment) -> bool {
        self.segments.contains(&segment)
    }

    /// `Username` or `Email`, if the structure identifies users.
    pub fn owner_segment(&self) -> Option<&Segment> {
        self.segments.iter().find(|s| s.is_owner())
    }

    pub fn has_experiment_folder(&self) -> bool {
        self.contains(Segment::Experiment)
    }
}

impl FromStr for FolderStructure {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split('/').map(str::trim).collect();
        if tokens.iter().all(|t| t.is_empty()) {
            return Err(SyncError::Config("empty folder structure".into()));
        }

        let mut segments = Vec::with_capacity(tokens.len());
        for token in tokens {
            let segment = Segment::parse(token)?;
            if !matches!(segment, Segment::Literal(_)) && segments.contains(&segment) {
                return Err(SyncError::Config(format!(
                    "folder structure repeats {segment}: {s}"
                )));
            }
            segments.push(segment);
        }

        match segments.iter().position(|seg| *seg == Segment::Dataset) {
            None => {
                return Err(SyncError::Config(format!(
                    "folder structure has no Dataset level: {s}"
                )));
            }
            Some(i) if i + 1 != segments.len() => {
                return Err(SyncError::Config(format!(
                    "Dataset must be the last level: {s}"
                )));
            }
            Some(_) => {}
        }

        let owners = segments.iter().filter(|seg| seg.is_owner()).count();
        if owners > 1 || (owners == 1 && segments.contains(&Segment::UserGroup)) {
            return Err(SyncError::Config(format!(
                "folder structure can identify either a user or a group, not both: {s}"
            )));
        }

        Ok(Self { segments })
    }
}

impl fmt::Display for FolderStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(" / ")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
