/// Transaction and object-revision model shared by both sides of the
/// migration.
///
/// A legacy source log is an ordered sequence of `SourceTransaction`s, each
/// a set of `ObjectRevision`s keyed by local OID. The importer translates
/// those into `DestinationBatch`es of `GlobalRevision`s. Object payloads are
/// opaque bytes; the OID references embedded in a payload are carried
/// alongside it as an explicit reference table, which is what the read
/// router rewrites when proxying legacy data.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::oid::{GlobalOid, LocalOid, Serial, SourceId};

/// SHA-1 digest of a revision payload.
pub type Checksum = [u8; 20];

/// Compute the payload checksum stored with every destination revision.
pub fn checksum(data: &[u8]) -> Checksum {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Transaction metadata preserved across import and writeback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMeta {
    pub user: String,
    pub description: String,
}

impl TxnMeta {
    pub fn new(user: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            description: description.into(),
        }
    }
}

/// One object write inside a source transaction, in the source's own
/// OID namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRevision {
    pub oid: LocalOid,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
    /// Local OIDs referenced by the payload.
    pub refs: Vec<LocalOid>,
}

impl ObjectRevision {
    pub fn new(oid: LocalOid, data: impl Into<Vec<u8>>, refs: Vec<LocalOid>) -> Self {
        Self {
            oid,
            data: data.into(),
            refs,
        }
    }
}

/// One committed transaction in a source database's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTransaction {
    /// Position in the source's commit order.
    pub serial: Serial,
    /// Destination transaction id when this transaction was produced by the
    /// writeback replicator; the backend de-duplicates on it.
    pub origin: Option<Serial>,
    pub meta: TxnMeta,
    pub revisions: Vec<ObjectRevision>,
}

impl SourceTransaction {
    /// Local OIDs touched by this transaction.
    pub fn touched(&self) -> impl Iterator<Item = LocalOid> + '_ {
        self.revisions.iter().map(|r| r.oid)
    }
}

/// One object write in the destination namespace, checksummed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRevision {
    pub oid: GlobalOid,
    pub data: Vec<u8>,
    /// Global OIDs referenced by the payload.
    pub refs: Vec<GlobalOid>,
    pub checksum: Checksum,
}

impl GlobalRevision {
    /// Build a revision, computing the payload checksum.
    pub fn new(oid: GlobalOid, data: impl Into<Vec<u8>>, refs: Vec<GlobalOid>) -> Self {
        let data = data.into();
        let checksum = checksum(&data);
        Self {
            oid,
            data,
            refs,
            checksum,
        }
    }

    /// Whether the stored checksum still matches the payload.
    pub fn verify(&self) -> bool {
        checksum(&self.data) == self.checksum
    }
}

/// An atomic batch handed to the destination store for commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationBatch {
    /// Serial to commit at. The importer sets it to preserve the source
    /// serial; `None` lets the destination allocate one above the go-live
    /// floor (live client commits).
    pub serial: Option<Serial>,
    /// `(source, serial)` of the imported transaction. Committing the same
    /// provenance twice is a no-op returning the first transaction id.
    pub provenance: Option<(SourceId, Serial)>,
    pub meta: TxnMeta,
    pub revisions: Vec<GlobalRevision>,
}

impl DestinationBatch {
    /// Batch for a live client commit.
    pub fn live(meta: TxnMeta, revisions: Vec<GlobalRevision>) -> Self {
        Self {
            serial: None,
            provenance: None,
            meta,
            revisions,
        }
    }

    /// Batch replaying an imported source transaction at its own serial.
    pub fn imported(
        source: SourceId,
        serial: Serial,
        meta: TxnMeta,
        revisions: Vec<GlobalRevision>,
    ) -> Self {
        Self {
            serial: Some(serial),
            provenance: Some((source, serial)),
            meta,
            revisions,
        }
    }

    /// Global OIDs touched by this batch.
    pub fn touched(&self) -> impl Iterator<Item = GlobalOid> + '_ {
        self.revisions.iter().map(|r| r.oid)
    }
}

/// A live client commit as accepted by the adapter facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub meta: TxnMeta,
    pub revisions: Vec<GlobalRevision>,
}

/// What a read returns: one object revision in the global namespace.
///
/// `oid` is always the canonical global OID, even when the bytes were
/// proxied from a legacy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    pub oid: GlobalOid,
    /// Serial of the transaction that produced this revision.
    pub serial: Serial,
    pub data: Vec<u8>,
    pub refs: Vec<GlobalOid>,
}
