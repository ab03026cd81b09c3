use std::path::{Component, Path};

use crate::TransferError;

/// Validates a `/`-separated relative path such as a datafile
/// subdirectory or a staging key.
///
/// Rejects empty paths, absolute paths, `..` components and Windows
/// prefixes, so the path can be joined onto a base directory safely.
pub fn validate_relative_path(rel: &str) -> Result<(), TransferError> {
    if rel.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    for component in Path::new(rel).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {rel}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {rel}"
                )));
            }
        }
    }

    Ok(())
}
