//! Chunked datafile transfer: resumable reads, SHA-256 checksums,
//! staging-area writes and throughput measurement.

mod chunked;
mod progress;
mod staging;
mod types;
mod validation;

pub use chunked::{ChunkReader, FileDigest, checksum_bytes, digest_file};
pub use progress::TransferMeter;
pub use staging::StagingArea;
pub use types::Chunk;
pub use validation::validate_relative_path;

/// Default chunk size for staged uploads: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("resume offset {offset} is beyond end of file ({size} bytes)")]
    OffsetBeyondEnd { offset: u64, size: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
