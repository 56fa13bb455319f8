//! In-memory destination store.
//!
//! Volatile stand-in for the real cluster, used by tests and rehearsal
//! runs. Semantics match the file backend: per-object histories ordered
//! by serial, provenance-deduplicated imports, durable-in-spirit OID
//! reservations (durable here only for the process lifetime).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{GlobalOid, Serial, SourceId};
use drover_proto::txn::{DestinationBatch, ObjectState};

use super::DestinationClient;

struct StoredRev {
    serial: Serial,
    data: Vec<u8>,
    refs: Vec<GlobalOid>,
}

#[derive(Default)]
struct Inner {
    /// Per-object revisions, ordered by serial ascending. Imports of old
    /// history may land after live writes of the same object, so
    /// insertion is position-based, not append.
    by_oid: HashMap<GlobalOid, Vec<StoredRev>>,
    /// `(source, source serial) -> transaction id` of the import commit.
    provenance: HashMap<(SourceId, Serial), Serial>,
    /// Highest source serial imported per source.
    imported: HashMap<SourceId, Serial>,
    last_serial: Serial,
    next_oid: u64,
}

pub struct MemoryDestination {
    serial_floor: Serial,
    inner: RwLock<Inner>,
}

impl MemoryDestination {
    pub fn new(oid_floor: GlobalOid, serial_floor: Serial) -> Self {
        Self {
            serial_floor,
            inner: RwLock::new(Inner {
                next_oid: oid_floor.raw(),
                ..Inner::default()
            }),
        }
    }
}

fn state_of(oid: GlobalOid, rev: &StoredRev) -> ObjectState {
    ObjectState {
        oid,
        serial: rev.serial,
        data: rev.data.clone(),
        refs: rev.refs.clone(),
    }
}

#[async_trait]
impl DestinationClient for MemoryDestination {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn read(&self, oid: GlobalOid, at: Option<Serial>) -> DroverResult<Option<ObjectState>> {
        let inner = self.inner.read().await;
        let Some(history) = inner.by_oid.get(&oid) else {
            return Ok(None);
        };
        let found = match at {
            Some(at) => history.iter().rev().find(|r| r.serial <= at),
            None => history.last(),
        };
        Ok(found.map(|r| state_of(oid, r)))
    }

    async fn commit(&self, batch: DestinationBatch) -> DroverResult<Serial> {
        for rev in &batch.revisions {
            if !rev.verify() {
                return Err(DroverError::Corrupt(format!(
                    "checksum mismatch for oid {} in commit",
                    rev.oid
                )));
            }
        }
        let mut inner = self.inner.write().await;
        if let Some(prov) = &batch.provenance {
            if let Some(&tid) = inner.provenance.get(prov) {
                return Ok(tid);
            }
        }
        let serial = match batch.serial {
            Some(s) => s,
            None => self.serial_floor.max(inner.last_serial.next()),
        };
        for rev in batch.revisions {
            let history = inner.by_oid.entry(rev.oid).or_default();
            let at = history.partition_point(|r| r.serial < serial);
            history.insert(
                at,
                StoredRev {
                    serial,
                    data: rev.data,
                    refs: rev.refs,
                },
            );
        }
        if let Some((source, src_serial)) = batch.provenance {
            inner.provenance.insert((source.clone(), src_serial), serial);
            let high = inner.imported.entry(source).or_insert(src_serial);
            *high = (*high).max(src_serial);
        }
        inner.last_serial = inner.last_serial.max(serial);
        Ok(serial)
    }

    async fn imported_serial(&self, source: &SourceId) -> DroverResult<Option<Serial>> {
        Ok(self.inner.read().await.imported.get(source).copied())
    }

    async fn allocate_oids(&self, count: u64) -> DroverResult<GlobalOid> {
        let mut inner = self.inner.write().await;
        let base = inner.next_oid;
        inner.next_oid = base
            .checked_add(count)
            .ok_or_else(|| DroverError::Internal("global oid space exhausted".into()))?;
        Ok(GlobalOid::new(base))
    }

    async fn history(&self, oid: GlobalOid, limit: usize) -> DroverResult<Vec<ObjectState>> {
        let inner = self.inner.read().await;
        let Some(history) = inner.by_oid.get(&oid) else {
            return Ok(Vec::new());
        };
        Ok(history
            .iter()
            .rev()
            .take(limit)
            .map(|r| state_of(oid, r))
            .collect())
    }

    async fn reclaim_history(&self, oid: GlobalOid, keep: Serial) -> DroverResult<u64> {
        let mut inner = self.inner.write().await;
        let Some(history) = inner.by_oid.get_mut(&oid) else {
            return Ok(0);
        };
        // Retain the newest revision at or before `keep`.
        let cut = history.partition_point(|r| r.serial <= keep).saturating_sub(1);
        history.drain(..cut);
        Ok(cut as u64)
    }

    async fn last_serial(&self) -> DroverResult<Serial> {
        Ok(self.inner.read().await.last_serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_proto::txn::{GlobalRevision, TxnMeta};

    fn dest() -> MemoryDestination {
        MemoryDestination::new(GlobalOid::new(1000), Serial::new(50))
    }

    fn rev(oid: u64, data: &[u8]) -> GlobalRevision {
        GlobalRevision::new(GlobalOid::new(oid), data.to_vec(), vec![])
    }

    fn imported(source: &str, serial: u64, revisions: Vec<GlobalRevision>) -> DestinationBatch {
        DestinationBatch::imported(
            SourceId::new(source),
            Serial::new(serial),
            TxnMeta::default(),
            revisions,
        )
    }

    #[tokio::test]
    async fn test_live_commits_allocate_above_floor() {
        let d = dest();
        let a = d
            .commit(DestinationBatch::live(TxnMeta::default(), vec![rev(1, b"x")]))
            .await
            .unwrap();
        let b = d
            .commit(DestinationBatch::live(TxnMeta::default(), vec![rev(1, b"y")]))
            .await
            .unwrap();
        assert_eq!(a, Serial::new(50));
        assert_eq!(b, Serial::new(51));
        assert_eq!(d.last_serial().await.unwrap(), b);

        let state = d.read(GlobalOid::new(1), None).await.unwrap().unwrap();
        assert_eq!(state.data, b"y");
        assert_eq!(state.serial, b);
    }

    #[tokio::test]
    async fn test_imported_commit_is_replay_safe() {
        let d = dest();
        let batch = imported("root", 7, vec![rev(3, b"old")]);
        let first = d.commit(batch.clone()).await.unwrap();
        assert_eq!(first, Serial::new(7));
        // Replaying after a simulated crash must not duplicate anything.
        assert_eq!(d.commit(batch).await.unwrap(), first);
        assert_eq!(d.history(GlobalOid::new(3), 10).await.unwrap().len(), 1);
        assert_eq!(
            d.imported_serial(&SourceId::new("root")).await.unwrap(),
            Some(Serial::new(7))
        );
    }

    #[tokio::test]
    async fn test_late_import_lands_below_live_write() {
        let d = dest();
        d.commit(DestinationBatch::live(TxnMeta::default(), vec![rev(3, b"live")]))
            .await
            .unwrap();
        d.commit(imported("root", 4, vec![rev(3, b"old")]))
            .await
            .unwrap();

        let pinned = d
            .read(GlobalOid::new(3), Some(Serial::new(10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.data, b"old");
        let latest = d.read(GlobalOid::new(3), None).await.unwrap().unwrap();
        assert_eq!(latest.data, b"live");
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let d = dest();
        for (serial, data) in [(2u64, "a"), (5, "b"), (9, "c")] {
            d.commit(imported("root", serial, vec![rev(3, data.as_bytes())]))
                .await
                .unwrap();
        }
        let history = d.history(GlobalOid::new(3), 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data, b"c");
        assert_eq!(history[1].data, b"b");
        assert!(d.history(GlobalOid::new(99), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_keeps_pinned_reads_at_keep() {
        let d = dest();
        for (serial, data) in [(2u64, "a"), (5, "b"), (9, "c")] {
            d.commit(imported("root", serial, vec![rev(3, data.as_bytes())]))
                .await
                .unwrap();
        }
        let dropped = d
            .reclaim_history(GlobalOid::new(3), Serial::new(9))
            .await
            .unwrap();
        assert_eq!(dropped, 2);
        assert!(d
            .read(GlobalOid::new(3), Some(Serial::new(4)))
            .await
            .unwrap()
            .is_none());
        let at_keep = d
            .read(GlobalOid::new(3), Some(Serial::new(9)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_keep.data, b"c");
        assert_eq!(
            d.reclaim_history(GlobalOid::new(99), Serial::new(9))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_allocate_contiguous_from_floor() {
        let d = dest();
        assert_eq!(d.allocate_oids(4).await.unwrap(), GlobalOid::new(1000));
        assert_eq!(d.allocate_oids(1).await.unwrap(), GlobalOid::new(1004));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let d = dest();
        let mut bad = rev(1, b"payload");
        bad.data[0] ^= 0xff;
        let err = d
            .commit(DestinationBatch::live(TxnMeta::default(), vec![bad]))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::Corrupt(_)));
    }
}
