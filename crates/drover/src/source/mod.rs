//! Legacy source backend abstraction.
//!
//! The `SourceBackend` trait is the full capability set the adapter needs
//! from a legacy database: read its objects, stream its transaction log in
//! commit order, and (when writeback is on) append replicated
//! transactions. Backends are selected by the `kind` field of the source
//! configuration.
//!
//! Available backends:
//! - **file**: single-file append log with an in-memory index
//! - **memory**: volatile, for tests and rehearsal runs
//!
//! Filesystem-backed methods use `tokio::task::spawn_blocking` internally,
//! since disk I/O can block the async runtime.

use async_trait::async_trait;
use std::sync::Arc;

use drover_proto::error::{ConfigError, DroverResult};
use drover_proto::oid::{LocalOid, Serial};
use drover_proto::txn::{ObjectRevision, SourceTransaction, TxnMeta};

use crate::config::ResolvedSource;

pub mod file;
pub mod memory;

/// One object revision as read from a source, with the serial of the
/// transaction that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRevision {
    pub oid: LocalOid,
    pub serial: Serial,
    pub data: Vec<u8>,
    pub refs: Vec<LocalOid>,
}

/// A destination transaction being mirrored back into its origin source.
#[derive(Debug, Clone)]
pub struct ReplicatedTxn {
    /// Destination transaction serial; the backend de-duplicates on it.
    pub origin: Serial,
    pub meta: TxnMeta,
    pub writes: Vec<ObjectRevision>,
}

/// Capability set of a legacy source database.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Backend kind name (e.g. "file", "memory").
    fn kind(&self) -> &str;

    /// Highest local OID written by native history, `None` when the
    /// source holds no native objects at all. OIDs minted for replicated
    /// transactions are excluded: this value must not drift once the
    /// adapter has gone live, because OID range assignment derives from
    /// it.
    async fn last_oid(&self) -> DroverResult<Option<LocalOid>>;

    /// Head serial of native history. Replicated transactions appended
    /// after go-live are excluded for the same stability reason.
    async fn last_serial(&self) -> DroverResult<Serial>;

    /// Latest revision of `oid` at or before `at`; `None` means latest.
    /// Fails with `ObjectNotFound` if no revision satisfies the read.
    async fn read(&self, oid: LocalOid, at: Option<Serial>) -> DroverResult<SourceRevision>;

    /// Serial of the latest revision of `oid`, `None` if the object has
    /// never been written. Cheap head probe for the read router.
    async fn head_serial(&self, oid: LocalOid) -> DroverResult<Option<Serial>>;

    /// Transactions with serial strictly greater than `from`, in commit
    /// order, at most `limit` of them. Restartable from any position.
    async fn read_log(&self, from: Serial, limit: usize)
        -> DroverResult<Vec<SourceTransaction>>;

    /// Append a replicated transaction and return its serial. Committing
    /// the same `origin` twice returns the first serial without
    /// re-applying. Fails with `ReadOnlySource` on read-only backends.
    async fn commit(&self, txn: ReplicatedTxn) -> DroverResult<Serial>;

    /// Serial of the replicated transaction carrying this origin id, if
    /// one has already been committed.
    async fn lookup_replicated(&self, origin: Serial) -> DroverResult<Option<Serial>>;

    /// Allocate a fresh local OID above everything that exists. Fails with
    /// `ReadOnlySource` on read-only backends.
    async fn new_oid(&self) -> DroverResult<LocalOid>;
}

/// Open the backend named by a source configuration.
pub async fn open_source(cfg: &ResolvedSource) -> DroverResult<Arc<dyn SourceBackend>> {
    match cfg.kind.as_str() {
        "file" => {
            let backend = file::FileSource::open(cfg).await?;
            Ok(Arc::new(backend))
        }
        "memory" => Ok(Arc::new(memory::MemorySource::new(cfg.id.clone()))),
        other => Err(ConfigError::UnknownBackend {
            source: cfg.id.clone(),
            kind: other.to_owned(),
        }
        .into()),
    }
}

/// List all available source backend kinds.
pub fn available_backends() -> Vec<&'static str> {
    vec!["file", "memory"]
}
