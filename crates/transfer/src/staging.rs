use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::chunked::checksum_bytes;
use crate::types::Chunk;
use crate::{TransferError, validate_relative_path};

/// A filesystem-backed staging area.
///
/// Objects are addressed by relative keys (a replica's staging URI) and
/// written chunk by chunk at explicit offsets, so an interrupted transfer
/// can be continued from the object's current size.
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, TransferError> {
        validate_relative_path(key)?;
        Ok(self.root.join(key))
    }

    /// Writes `chunk` into object `key` at the chunk's offset.
    ///
    /// The checksum is verified first when present. Existing bytes beyond
    /// the chunk are left untouched.
    pub fn write_chunk(&self, key: &str, chunk: &Chunk) -> Result<u64, TransferError> {
        let path = self.object_path(key)?;

        if !chunk.checksum.is_empty() && checksum_bytes(&chunk.data) != chunk.checksum {
            return Err(TransferError::ChecksumMismatch {
                offset: chunk.offset,
            });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(&chunk.data)?;
        Ok(chunk.end())
    }

    /// Current size of object `key`, or `None` when it does not exist.
    pub fn object_size(&self, key: &str) -> Result<Option<u64>, TransferError> {
        let path = self.object_path(key)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the full contents of object `key`.
    pub fn read_object(&self, key: &str) -> Result<Vec<u8>, TransferError> {
        let mut data = Vec::new();
        std::fs::File::open(self.object_path(key)?)?.read_to_end(&mut data)?;
        Ok(data)
    }
}
