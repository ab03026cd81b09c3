//! Typed records and request payloads exchanged with the data repository.
//!
//! Only the fields the sync pipeline sends or interprets are modeled.
//! Unknown fields in remote payloads are ignored on deserialization.

pub mod messages;
pub mod types;

pub use messages::{
    DatasetQuery, ExperimentQuery, FileRecordQuery, NewDataset, NewExperiment, NewFileRecord,
    NewInstrument,
};
pub use types::{
    DatasetRecord, ExperimentRecord, FacilityRecord, FileRecord, GroupRecord, InstrumentRecord,
    Replica, StorageClass, UserRecord, VerificationState,
};
