//! In-memory source backend.
//!
//! Serves tests and rehearsal runs. Serials are contiguous from 1, so
//! `log[i]` always holds serial `i + 1`. The `set_unavailable` switch
//! makes every trait method fail with `SourceUnavailable`, which is how
//! retry and backoff paths get exercised.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{LocalOid, Serial, SourceId};
use drover_proto::txn::{ObjectRevision, SourceTransaction, TxnMeta};

use super::{ReplicatedTxn, SourceBackend, SourceRevision};

#[derive(Default)]
struct Inner {
    log: Vec<SourceTransaction>,
    /// Highest OID seen in native transactions; what `last_oid` reports.
    native_last_oid: Option<u64>,
    /// Highest OID seen anywhere, including replicated transactions and
    /// `new_oid` mints; allocation starts above this.
    any_last_oid: Option<u64>,
    /// Head serial of native history; what `last_serial` reports.
    native_last_serial: Serial,
}

fn bump(slot: &mut Option<u64>, oid: u64) {
    *slot = Some(match *slot {
        Some(cur) => cur.max(oid),
        None => oid,
    });
}

impl Inner {
    fn append(
        &mut self,
        origin: Option<Serial>,
        meta: TxnMeta,
        revisions: Vec<ObjectRevision>,
    ) -> Serial {
        let serial = Serial::new(self.log.len() as u64 + 1);
        for rev in &revisions {
            bump(&mut self.any_last_oid, rev.oid.raw());
            if origin.is_none() {
                bump(&mut self.native_last_oid, rev.oid.raw());
            }
        }
        if origin.is_none() {
            self.native_last_serial = serial;
        }
        self.log.push(SourceTransaction {
            serial,
            origin,
            meta,
            revisions,
        });
        serial
    }
}

pub struct MemorySource {
    id: SourceId,
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl MemorySource {
    pub fn new(id: SourceId) -> Self {
        Self {
            id,
            inner: RwLock::new(Inner::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Append a native transaction, as the legacy database's own writers
    /// would have. Used to seed history.
    pub async fn append_native(&self, meta: TxnMeta, revisions: Vec<ObjectRevision>) -> Serial {
        self.inner.write().await.append(None, meta, revisions)
    }

    /// Make every backend call fail with `SourceUnavailable` until reset.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> DroverResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DroverError::SourceUnavailable {
                source: self.id.clone(),
                reason: "backend marked unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceBackend for MemorySource {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn last_oid(&self) -> DroverResult<Option<LocalOid>> {
        self.check_up()?;
        Ok(self.inner.read().await.native_last_oid.map(LocalOid::new))
    }

    async fn last_serial(&self) -> DroverResult<Serial> {
        self.check_up()?;
        Ok(self.inner.read().await.native_last_serial)
    }

    async fn read(&self, oid: LocalOid, at: Option<Serial>) -> DroverResult<SourceRevision> {
        self.check_up()?;
        let inner = self.inner.read().await;
        for txn in inner.log.iter().rev() {
            if let Some(at) = at {
                if txn.serial > at {
                    continue;
                }
            }
            if let Some(rev) = txn.revisions.iter().find(|r| r.oid == oid) {
                return Ok(SourceRevision {
                    oid,
                    serial: txn.serial,
                    data: rev.data.clone(),
                    refs: rev.refs.clone(),
                });
            }
        }
        Err(DroverError::ObjectNotFound(format!(
            "oid {} in source '{}'",
            oid, self.id
        )))
    }

    async fn head_serial(&self, oid: LocalOid) -> DroverResult<Option<Serial>> {
        self.check_up()?;
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .iter()
            .rev()
            .find(|t| t.revisions.iter().any(|r| r.oid == oid))
            .map(|t| t.serial))
    }

    async fn read_log(
        &self,
        from: Serial,
        limit: usize,
    ) -> DroverResult<Vec<SourceTransaction>> {
        self.check_up()?;
        let inner = self.inner.read().await;
        let start = (from.raw() as usize).min(inner.log.len());
        Ok(inner.log[start..].iter().take(limit).cloned().collect())
    }

    async fn commit(&self, txn: ReplicatedTxn) -> DroverResult<Serial> {
        self.check_up()?;
        let mut inner = self.inner.write().await;
        if let Some(prev) = inner
            .log
            .iter()
            .rev()
            .find(|t| t.origin == Some(txn.origin))
        {
            return Ok(prev.serial);
        }
        Ok(inner.append(Some(txn.origin), txn.meta, txn.writes))
    }

    async fn lookup_replicated(&self, origin: Serial) -> DroverResult<Option<Serial>> {
        self.check_up()?;
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .iter()
            .rev()
            .find(|t| t.origin == Some(origin))
            .map(|t| t.serial))
    }

    async fn new_oid(&self) -> DroverResult<LocalOid> {
        self.check_up()?;
        let mut inner = self.inner.write().await;
        let next = inner.any_last_oid.map(|o| o + 1).unwrap_or(0);
        inner.any_last_oid = Some(next);
        Ok(LocalOid::new(next))
    }
}
