//! # drover-proto
//!
//! Shared types for the drover migration adapter.
//!
//! This crate defines the OID and serial newtypes, the transaction and
//! revision model, error types, and operational defaults shared by the
//! adapter library and daemon.

pub mod defaults;
pub mod error;
pub mod oid;
pub mod txn;

// Re-export commonly used types at the crate root
pub use error::{ConfigError, DroverError, DroverResult};
pub use oid::{GlobalOid, LocalOid, Serial, SourceId};
pub use txn::{
    Checksum, CommitRequest, DestinationBatch, GlobalRevision, ObjectRevision, ObjectState,
    SourceTransaction, TxnMeta,
};
