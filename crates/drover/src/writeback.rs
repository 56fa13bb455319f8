//! Writeback replicator.
//!
//! Mirrors transactions committed to the destination by live clients back
//! into the legacy databases they touch, so a migration can still be
//! rolled back. The commit path only queues: the client's commit is
//! acknowledged by the destination alone, and delivery lag is unbounded
//! but visible through [`WritebackStats`].
//!
//! Layout is a dispatcher feeding one drainer task per writable source
//! through bounded FIFO channels. Per-source commit order is preserved, a
//! failing source never blocks delivery to another, and every record is
//! keyed by its destination transaction id so redelivery cannot
//! double-apply: the drainer probes `lookup_replicated` first and the
//! backend de-duplicates on `origin` as the second line.
//!
//! A delivery that exhausts its retries is abandoned with a standing
//! alert; it never rolls back the destination commit.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{GlobalOid, LocalOid, Serial, SourceId};
use drover_proto::txn::{GlobalRevision, ObjectRevision, TxnMeta};

use crate::config::Tuning;
use crate::source::{ReplicatedTxn, SourceBackend};
use crate::table::TranslationTable;

/// One destination transaction awaiting mirroring. Carries the full
/// revision set; each drainer extracts the slice its source owns.
#[derive(Debug)]
pub struct WritebackRecord {
    /// Destination transaction id, the idempotency key end to end.
    pub tid: Serial,
    pub meta: TxnMeta,
    pub revisions: Vec<GlobalRevision>,
}

struct Dispatch {
    record: Arc<WritebackRecord>,
    targets: Vec<SourceId>,
}

/// Delivery counters shared between the commit path and the drainers.
/// A delivery is "concluded" once it is either applied or abandoned.
#[derive(Debug, Default)]
pub struct WritebackStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl WritebackStats {
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Deliveries accepted but not yet concluded either way.
    pub fn pending(&self) -> u64 {
        self.queued().saturating_sub(self.delivered() + self.failed())
    }

    /// Whether every accepted delivery has concluded. Operators check
    /// this before stopping a cluster they might still roll back.
    pub fn drained(&self) -> bool {
        self.pending() == 0
    }

    fn add_queued(&self, n: u64) {
        self.queued.fetch_add(n, Ordering::Relaxed);
    }

    fn unqueue(&self, n: u64) {
        self.queued.fetch_sub(n, Ordering::Relaxed);
    }

    fn add_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A permanently failed delivery, kept until an operator clears it.
#[derive(Debug, Clone)]
pub struct WritebackAlert {
    pub source: SourceId,
    pub tid: Serial,
    pub reason: String,
}

/// Standing alerts for deliveries that exhausted their retries.
#[derive(Default)]
pub struct AlertRegistry {
    alerts: DashMap<(SourceId, Serial), String>,
}

impl AlertRegistry {
    fn raise(&self, source: &SourceId, tid: Serial, reason: String) {
        self.alerts.insert((source.clone(), tid), reason);
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn all(&self) -> Vec<WritebackAlert> {
        self.alerts
            .iter()
            .map(|e| WritebackAlert {
                source: e.key().0.clone(),
                tid: e.key().1,
                reason: e.value().clone(),
            })
            .collect()
    }

    /// Drop one alert after operator intervention.
    pub fn clear(&self, source: &SourceId, tid: Serial) -> bool {
        self.alerts.remove(&(source.clone(), tid)).is_some()
    }
}

pub struct WritebackReplicator {
    queue: mpsc::Sender<Dispatch>,
    /// Sources that actually have a drainer.
    writable: BTreeSet<SourceId>,
    table: Arc<TranslationTable>,
    stats: Arc<WritebackStats>,
    alerts: Arc<AlertRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WritebackReplicator {
    /// Spawn the dispatcher and one drainer per writable source.
    pub fn start(
        table: Arc<TranslationTable>,
        sources: &HashMap<SourceId, Arc<dyn SourceBackend>>,
        tuning: &Tuning,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let stats = Arc::new(WritebackStats::default());
        let alerts = Arc::new(AlertRegistry::default());
        let extensions: Arc<DashMap<(SourceId, GlobalOid), LocalOid>> = Arc::new(DashMap::new());

        let mut tasks = Vec::new();
        let mut senders = HashMap::new();
        let mut writable = BTreeSet::new();
        for (id, backend) in sources {
            if table.is_read_only(id) {
                warn!(
                    "writeback: source '{}' is read-only, transactions touching it will not be mirrored",
                    id
                );
                continue;
            }
            let (tx, rx) = mpsc::channel(tuning.writeback_channel_size.max(1));
            senders.insert(id.clone(), tx);
            writable.insert(id.clone());
            let drainer = Drainer {
                source_id: id.clone(),
                backend: backend.clone(),
                table: table.clone(),
                extensions: extensions.clone(),
                stats: stats.clone(),
                alerts: alerts.clone(),
                max_attempts: tuning.writeback_max_attempts.max(1),
                retry_delay: Duration::from_millis(tuning.writeback_retry_delay_ms.max(1)),
            };
            tasks.push(tokio::spawn(drainer.run(rx, shutdown.clone())));
        }

        let (queue_tx, queue_rx) = mpsc::channel(tuning.writeback_channel_size.max(1));
        tasks.push(tokio::spawn(dispatch_loop(queue_rx, senders, shutdown)));

        Self {
            queue: queue_tx,
            writable,
            table,
            stats,
            alerts,
            tasks: Mutex::new(tasks),
        }
    }

    /// Queue a freshly committed destination transaction for mirroring.
    ///
    /// Transactions touching no writable source OID are dropped here.
    /// This never fails the commit path: if shutdown already closed the
    /// queue, the record is abandoned and the counters say so.
    pub async fn enqueue(&self, tid: Serial, meta: TxnMeta, revisions: Vec<GlobalRevision>) {
        let mut targets = BTreeSet::new();
        for rev in &revisions {
            if let Ok((source, _)) = self.table.invert(rev.oid) {
                if self.writable.contains(&source) {
                    targets.insert(source);
                } else {
                    debug!(
                        "writeback: transaction {} touches read-only source '{}', not mirrored",
                        tid, source
                    );
                }
            }
        }
        if targets.is_empty() {
            return;
        }
        let n = targets.len() as u64;
        self.stats.add_queued(n);
        let dispatch = Dispatch {
            record: Arc::new(WritebackRecord {
                tid,
                meta,
                revisions,
            }),
            targets: targets.into_iter().collect(),
        };
        if self.queue.send(dispatch).await.is_err() {
            self.stats.unqueue(n);
            warn!("writeback: queue closed, dropping transaction {}", tid);
        }
    }

    pub fn stats(&self) -> Arc<WritebackStats> {
        self.stats.clone()
    }

    pub fn alerts(&self) -> Arc<AlertRegistry> {
        self.alerts.clone()
    }

    /// Wait for every spawned task to exit. Call after the shutdown
    /// signal; undelivered records are abandoned, not flushed.
    pub async fn join(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("writeback: worker task panicked: {}", e);
            }
        }
    }
}

async fn dispatch_loop(
    mut queue: mpsc::Receiver<Dispatch>,
    senders: HashMap<SourceId, mpsc::Sender<Arc<WritebackRecord>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let dispatch = tokio::select! {
            d = queue.recv() => match d {
                Some(d) => d,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        for target in dispatch.targets {
            let Some(tx) = senders.get(&target) else {
                continue;
            };
            if tx.send(dispatch.record.clone()).await.is_err() {
                debug!(
                    "writeback: drainer for '{}' is gone, dropping transaction {}",
                    target, dispatch.record.tid
                );
            }
        }
    }
    debug!("writeback: dispatcher stopped");
}

/// Delivery worker for one source. Single-threaded per source, so the
/// source sees replicated transactions in destination commit order.
struct Drainer {
    source_id: SourceId,
    backend: Arc<dyn SourceBackend>,
    table: Arc<TranslationTable>,
    /// Local OIDs minted for globals this source cannot name, shared so
    /// the mapping survives the drainer and stays stable per source.
    extensions: Arc<DashMap<(SourceId, GlobalOid), LocalOid>>,
    stats: Arc<WritebackStats>,
    alerts: Arc<AlertRegistry>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Drainer {
    async fn run(
        self,
        mut rx: mpsc::Receiver<Arc<WritebackRecord>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let record = tokio::select! {
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            if !self.deliver(&record, &mut shutdown).await {
                break;
            }
        }
        debug!("writeback {}: drainer stopped", self.source_id);
    }

    /// Apply one record with bounded retries. Returns `false` when
    /// shutdown interrupted the delivery.
    async fn deliver(
        &self,
        record: &WritebackRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut attempt = 1u32;
        let mut delay = self.retry_delay;
        loop {
            match self.apply(record).await {
                Ok(serial) => {
                    self.stats.add_delivered();
                    debug!(
                        "writeback {}: transaction {} applied as serial {}",
                        self.source_id, record.tid, serial
                    );
                    return true;
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "writeback {}: transaction {} attempt {}/{} failed, retrying in {}ms: {}",
                        self.source_id,
                        record.tid,
                        attempt,
                        self.max_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return false,
                    }
                    attempt += 1;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    let err = DroverError::WritebackDelivery {
                        source: self.source_id.clone(),
                        tid: record.tid,
                        reason: e.to_string(),
                    };
                    error!("writeback: {}", err);
                    self.alerts.raise(&self.source_id, record.tid, e.to_string());
                    self.stats.add_failed();
                    return true;
                }
            }
        }
    }

    async fn apply(&self, record: &WritebackRecord) -> DroverResult<Serial> {
        // Redelivery guard; the backend's origin dedupe is the backstop.
        if let Some(serial) = self.backend.lookup_replicated(record.tid).await? {
            debug!(
                "writeback {}: transaction {} already applied as serial {}",
                self.source_id, record.tid, serial
            );
            return Ok(serial);
        }
        let writes = self.localize(record).await?;
        self.backend
            .commit(ReplicatedTxn {
                origin: record.tid,
                meta: record.meta.clone(),
                writes,
            })
            .await
    }

    /// Express the record in this source's local OID space: owned
    /// revisions at their direct positions, native objects mirrored at
    /// extension positions, references through direct, alias, or
    /// extension OIDs.
    async fn localize(&self, record: &WritebackRecord) -> DroverResult<Vec<ObjectRevision>> {
        let mut writes = Vec::new();
        for rev in &record.revisions {
            let local = if self.table.is_native(rev.oid) {
                // Post-go-live object: mirror it here so a rollback
                // keeps the graph closed.
                self.extension_oid(rev.oid).await?
            } else {
                match self.table.invert(rev.oid) {
                    Ok((source, local)) if source == self.source_id => local,
                    // Another source's revision; its own drainer has it.
                    _ => continue,
                }
            };
            let mut refs = Vec::with_capacity(rev.refs.len());
            for &r in &rev.refs {
                refs.push(self.localize_ref(r).await?);
            }
            writes.push(ObjectRevision::new(local, rev.data.clone(), refs));
        }
        Ok(writes)
    }

    async fn localize_ref(&self, global: GlobalOid) -> DroverResult<LocalOid> {
        if !self.table.is_native(global) {
            if let Ok((source, local)) = self.table.invert(global) {
                if source == self.source_id {
                    return Ok(local);
                }
            }
            if let Some(alias) = self.table.alias_position(&self.source_id, global) {
                // A legacy reference to a foreign object is its mount
                // position here.
                return Ok(alias);
            }
        }
        self.extension_oid(global).await
    }

    async fn extension_oid(&self, global: GlobalOid) -> DroverResult<LocalOid> {
        let key = (self.source_id.clone(), global);
        if let Some(local) = self.extensions.get(&key) {
            return Ok(*local);
        }
        let local = self.backend.new_oid().await?;
        self.extensions.insert(key, local);
        debug!(
            "writeback {}: global oid {} mapped to extension oid {}",
            self.source_id, global, local
        );
        Ok(local)
    }
}
