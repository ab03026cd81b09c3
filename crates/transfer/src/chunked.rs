use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::types::Chunk;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

const DIGEST_BUFFER: usize = 64 * 1024;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Size and checksum of a whole file, as sent with a new file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

/// Streams a file through SHA-256, counting bytes as it goes.
///
/// The size is taken from the bytes actually read, so a file that grew
/// since it was scanned reports its current length.
pub fn digest_file(path: &Path) -> Result<FileDigest, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUFFER];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(FileDigest {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Reads a local file in fixed-size chunks, optionally starting mid-file.
pub struct ChunkReader {
    file: std::fs::File,
    chunk_size: usize,
    offset: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading from the start.
    ///
    /// A `chunk_size` of 0 selects [`DEFAULT_CHUNK_SIZE`].
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            offset: 0,
            file_size,
        })
    }

    /// Opens `path` and positions the reader at `offset` for a resumed transfer.
    pub fn open_at(path: &Path, chunk_size: usize, offset: u64) -> Result<Self, TransferError> {
        let mut reader = Self::open(path, chunk_size)?;
        reader.resume_at(offset)?;
        Ok(reader)
    }

    /// Moves to `offset`. Offsets past the end of the file are rejected.
    pub fn resume_at(&mut self, offset: u64) -> Result<(), TransferError> {
        if offset > self.file_size {
            return Err(TransferError::OffsetBeyondEnd {
                offset,
                size: self.file_size,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.offset >= self.file_size {
            return Ok(None);
        }

        let want = (self.file_size - self.offset).min(self.chunk_size as u64) as usize;
        let mut data = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let chunk = Chunk {
            offset: self.offset,
            checksum: checksum_bytes(&data),
            data,
        };
        self.offset = chunk.end();
        Ok(Some(chunk))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// File size as observed when the reader was opened.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.offset)
    }
}
