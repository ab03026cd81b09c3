//! Discovery-and-transfer pipeline for instrument data directories.
//!
//! This crate implements the **sync logic** that mirrors a local data
//! directory into a remote research-data repository. It has no transport
//! of its own: the embedding application provides a `RepositoryClient`
//! implementation that talks to the actual service.
//!
//! # Pipeline
//!
//! 1. **Scan**: walk the data directory per the configured folder structure
//! 2. **Resolve**: map owner, group, experiment and dataset folders to
//!    remote records, creating what is missing
//! 3. **Lookup**: reconcile each file against its remote record and replicas
//! 4. **Upload**: transfer what is missing, resuming partial staged copies
//! 5. **Verify**: wait for the remote to verify staged files

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lookup;
pub mod resolver;
pub mod retry;
pub mod scanner;
pub mod structure;
pub mod types;
pub mod upload;
pub mod verification;

#[cfg(test)]
mod testing;

// Re-export primary types for convenience.
pub use client::{BoxFuture, FileSubmission, RepositoryClient, UploadTarget};
pub use config::{
    BackoffConfig, FilterConfig, RetryConfig, SyncConfig, UnverifiedUnstagedPolicy,
    VerificationConfig,
};
pub use coordinator::PipelineCoordinator;
pub use error::{ErrorClass, SyncError};
pub use lookup::LookupEngine;
pub use resolver::EntityResolver;
pub use scanner::{FolderScanner, ScanEvent, ScanFilters};
pub use structure::{FolderStructure, Segment};
pub use types::{
    DataFileEntry, DiscoveredFolder, Group, Lookup, LookupStatus, Owner, RunSummary, SyncEvent,
    Upload, UploadMethod, UploadStatus,
};
pub use upload::UploadExecutor;
pub use verification::{VerificationOutcome, VerificationPoller};
