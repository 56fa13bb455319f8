//! Destination cluster client abstraction.
//!
//! The `DestinationClient` trait is everything the adapter asks of the new
//! store: commit batches (live or imported), read object state, reserve
//! global OID ranges for natively created objects, and answer the history
//! queries that unlock once import completes. Backends are selected by the
//! `kind` field of the destination configuration.
//!
//! Available backends:
//! - **file**: single-file append log with an in-memory index
//! - **memory**: volatile, for tests and rehearsal runs
//!
//! Serial allocation is split at the go-live floor handed to the
//! constructor: batches carrying a serial (imported history) commit below
//! it, batches without one (live clients) are assigned serials at or above
//! it. Committing the same provenance twice returns the first transaction
//! id without re-applying, which is what makes importer crash replay safe.

use async_trait::async_trait;
use std::sync::Arc;

use drover_proto::error::{ConfigError, DroverResult};
use drover_proto::oid::{GlobalOid, Serial, SourceId};
use drover_proto::txn::{DestinationBatch, ObjectState};

use crate::config::DestinationConfig;

pub mod file;
pub mod memory;

/// Capability set of the destination cluster.
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Backend kind name (e.g. "file", "memory").
    fn kind(&self) -> &str;

    /// Latest revision of `oid` at or before `at`; `None` means latest.
    /// `Ok(None)` when no committed revision satisfies the read; the
    /// router decides whether that means "not yet imported" or "absent".
    async fn read(&self, oid: GlobalOid, at: Option<Serial>) -> DroverResult<Option<ObjectState>>;

    /// Commit a batch atomically and return its transaction id. Every
    /// revision's checksum is verified before anything is applied; a
    /// mismatch fails the whole batch with `Corrupt`.
    async fn commit(&self, batch: DestinationBatch) -> DroverResult<Serial>;

    /// Highest source serial committed with this source's provenance,
    /// `None` if nothing has been imported from it yet. The importer
    /// checks its cursor against this at startup.
    async fn imported_serial(&self, source: &SourceId) -> DroverResult<Option<Serial>>;

    /// Reserve `count` contiguous fresh global OIDs and return the first.
    /// The reservation is durable: OIDs are never handed out twice, even
    /// across restarts.
    async fn allocate_oids(&self, count: u64) -> DroverResult<GlobalOid>;

    /// Revisions of `oid`, newest first, at most `limit`. Empty when the
    /// object has no committed revision.
    async fn history(&self, oid: GlobalOid, limit: usize) -> DroverResult<Vec<ObjectState>>;

    /// Drop revisions of `oid` older than `keep`, retaining the newest
    /// revision at or before `keep` so pinned reads there still resolve.
    /// Returns the number of revisions dropped.
    async fn reclaim_history(&self, oid: GlobalOid, keep: Serial) -> DroverResult<u64>;

    /// Highest transaction serial committed so far.
    async fn last_serial(&self) -> DroverResult<Serial>;
}

/// Open the backend named by the destination configuration.
///
/// `oid_floor` is the first global OID above every translated source
/// range; native allocation starts there. `serial_floor` is the first
/// serial live commits may use, one past the highest frozen source head.
pub async fn open_destination(
    cfg: &DestinationConfig,
    oid_floor: GlobalOid,
    serial_floor: Serial,
) -> DroverResult<Arc<dyn DestinationClient>> {
    match cfg.kind.as_str() {
        "file" => {
            let path = cfg
                .path
                .clone()
                .ok_or(ConfigError::MissingDestinationPath)?;
            let backend = file::FileDestination::open(path, oid_floor, serial_floor).await?;
            Ok(Arc::new(backend))
        }
        "memory" => Ok(Arc::new(memory::MemoryDestination::new(
            oid_floor,
            serial_floor,
        ))),
        other => Err(ConfigError::UnknownDestination(other.to_owned()).into()),
    }
}
