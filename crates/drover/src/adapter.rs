//! Adapter facade.
//!
//! Wires the translation table, read router, import workers, writeback
//! replicator and completion detector into one object with the lifecycle
//! a daemon wants: open, start the background workers, serve reads and
//! commits, report status, shut down. Opening probes each source's
//! native head exactly once; the OID ranges and the go-live serial floor
//! derived from that probe are fixed for the adapter's lifetime.
//!
//! Reads and commits are legal as soon as [`Adapter::open`] returns,
//! before [`Adapter::start`]: the router only needs the cursor views,
//! which begin at their persisted positions. History enumeration and
//! reclamation stay gated until every source is fully imported, because
//! an answer computed from partial history would be silently wrong.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use drover_proto::defaults;
use drover_proto::error::{ConfigError, DroverError, DroverResult};
use drover_proto::oid::{GlobalOid, Serial, SourceId};
use drover_proto::txn::{CommitRequest, DestinationBatch, ObjectState};

use crate::completion::CompletionDetector;
use crate::config::{AdapterConfig, ResolvedConfig};
use crate::cursor::{CursorSet, CursorStore, CursorView, FileCursorStore, MemoryCursorStore};
use crate::destination::{open_destination, DestinationClient};
use crate::importer::{ImportState, ImportWorker};
use crate::router::ReadRouter;
use crate::source::{open_source, SourceBackend};
use crate::table::TranslationTable;
use crate::writeback::{WritebackAlert, WritebackReplicator};

/// Native OIDs are reserved from the destination in chunks and handed
/// out one at a time.
struct OidCache {
    next: GlobalOid,
    remaining: u64,
}

/// Progress of one source's import.
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub source: SourceId,
    pub state: ImportState,
    pub cursor: Serial,
    pub end: Serial,
    pub percent: f64,
}

/// Writeback queue counters and standing alerts.
#[derive(Debug, Clone)]
pub struct WritebackStatus {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    pub alerts: Vec<WritebackAlert>,
}

/// Operations still refused because import has not finished.
#[derive(Debug, Clone, Copy)]
pub struct Limitations {
    pub historical_reads: bool,
    pub reclamation: bool,
}

/// Point-in-time snapshot of the whole adapter.
#[derive(Debug, Clone)]
pub struct AdapterStatus {
    pub sources: Vec<SourceStatus>,
    pub complete: bool,
    pub limitations: Limitations,
    pub writeback: Option<WritebackStatus>,
}

/// The assembled migration adapter.
pub struct Adapter {
    table: Arc<TranslationTable>,
    router: ReadRouter,
    destination: Arc<dyn DestinationClient>,
    cursors: Arc<CursorSet>,
    importers: Vec<Arc<ImportWorker>>,
    writeback: Option<WritebackReplicator>,
    detector: Arc<CompletionDetector>,
    live_floor: Serial,
    stop: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    oid_cache: Mutex<OidCache>,
}

impl Adapter {
    /// Validate the configuration, open every backend named by it, and
    /// assemble the adapter. No background work runs yet; call
    /// [`Adapter::start`] once the caller is ready to serve traffic.
    pub async fn open(cfg: &AdapterConfig) -> DroverResult<Self> {
        let resolved = cfg.resolve()?;
        let mut backends: HashMap<SourceId, Arc<dyn SourceBackend>> = HashMap::new();
        for src in &resolved.sources {
            backends.insert(src.id.clone(), open_source(src).await?);
        }
        Self::open_with_backends(resolved, backends).await
    }

    /// Assemble the adapter around already opened source backends.
    /// Injection point for tests and embedders that construct their own
    /// backends.
    pub async fn open_with_backends(
        resolved: ResolvedConfig,
        backends: HashMap<SourceId, Arc<dyn SourceBackend>>,
    ) -> DroverResult<Self> {
        // Probe every source head once. Ranges and the live floor derive
        // from this snapshot and must not drift afterwards; the backends
        // guarantee that by excluding replicated transactions from
        // last_oid and last_serial.
        let mut frozen: Vec<(SourceId, Arc<dyn SourceBackend>, Serial)> = Vec::new();
        let mut spans: HashMap<SourceId, u64> = HashMap::new();
        for src in &resolved.sources {
            let backend = backends.get(&src.id).cloned().ok_or_else(|| {
                DroverError::Internal(format!("no backend opened for source '{}'", src.id))
            })?;
            let last = backend
                .last_oid()
                .await?
                .ok_or_else(|| ConfigError::EmptySource(src.id.clone()))?;
            let mut span = last.raw() + 1;
            if !src.read_only {
                // Local OIDs minted for writeback must stay inside the
                // mapped range.
                span += resolved.tuning.range_headroom;
            }
            spans.insert(src.id.clone(), span);
            let end = backend.last_serial().await?;
            frozen.push((src.id.clone(), backend, end));
        }

        let table = Arc::new(TranslationTable::build(&resolved, &spans)?);
        let live_floor = frozen
            .iter()
            .map(|(_, _, end)| *end)
            .max()
            .unwrap_or(Serial::ZERO)
            .next();

        let destination =
            open_destination(&resolved.destination, table.floor(), live_floor).await?;

        let store: Arc<dyn CursorStore> = match &resolved.cursor_dir {
            Some(dir) => Arc::new(FileCursorStore::new(dir.clone())),
            None => Arc::new(MemoryCursorStore::new()),
        };

        let (stop, _) = watch::channel(false);

        let mut views = Vec::with_capacity(frozen.len());
        let mut importers = Vec::with_capacity(frozen.len());
        for (id, backend, end) in &frozen {
            let start = store.load(id).await?.unwrap_or(Serial::ZERO);
            let view = Arc::new(CursorView::new(id.clone(), start, *end));
            views.push(view.clone());
            importers.push(Arc::new(ImportWorker::new(
                backend.clone(),
                destination.clone(),
                table.clone(),
                store.clone(),
                view,
                resolved.tuning.clone(),
            )));
        }
        let cursors = Arc::new(CursorSet::new(views));

        let source_map: HashMap<SourceId, Arc<dyn SourceBackend>> = frozen
            .iter()
            .map(|(id, backend, _)| (id.clone(), backend.clone()))
            .collect();

        let router = ReadRouter::new(
            table.clone(),
            cursors.clone(),
            source_map.clone(),
            destination.clone(),
            live_floor,
        );

        let detector = Arc::new(CompletionDetector::new(cursors.clone(), &resolved.tuning));

        // The replicator's drainers idle until a commit feeds them, so
        // starting them here costs nothing before go-live traffic.
        let writeback = resolved.writeback.then(|| {
            WritebackReplicator::start(
                table.clone(),
                &source_map,
                &resolved.tuning,
                stop.subscribe(),
            )
        });

        info!(
            "adapter: opened {} sources, global floor {}, live floor {}",
            frozen.len(),
            table.floor(),
            live_floor
        );

        Ok(Self {
            table,
            router,
            destination,
            cursors,
            importers,
            writeback,
            detector,
            live_floor,
            stop,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            oid_cache: Mutex::new(OidCache {
                next: GlobalOid::new(0),
                remaining: 0,
            }),
        })
    }

    /// Spawn the import workers and the completion detector. Idempotent:
    /// the second call is a no-op.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        for worker in &self.importers {
            tasks.push(tokio::spawn(worker.clone().run(self.stop.subscribe())));
        }
        tasks.push(tokio::spawn(
            self.detector.clone().run(self.stop.subscribe()),
        ));
        info!(
            "adapter: started {} import workers, writeback {}",
            self.importers.len(),
            if self.writeback.is_some() { "on" } else { "off" }
        );
    }

    /// Route one read; see [`ReadRouter::read`].
    pub async fn read(&self, oid: GlobalOid, at: Option<Serial>) -> DroverResult<ObjectState> {
        self.router.read(oid, at).await
    }

    /// Commit a live transaction and return its serial.
    ///
    /// The batch lands on the destination first. Writeback mirroring is
    /// queued after the commit is durable and never delays the ack.
    pub async fn commit(&self, request: CommitRequest) -> DroverResult<Serial> {
        let CommitRequest { meta, revisions } = request;
        match &self.writeback {
            Some(writeback) => {
                let batch = DestinationBatch::live(meta.clone(), revisions.clone());
                let tid = self.destination.commit(batch).await?;
                writeback.enqueue(tid, meta, revisions).await;
                Ok(tid)
            }
            None => {
                self.destination
                    .commit(DestinationBatch::live(meta, revisions))
                    .await
            }
        }
    }

    /// Allocate a fresh global OID for a natively created object. Always
    /// above every translated source range, never handed out twice.
    pub async fn new_oid(&self) -> DroverResult<GlobalOid> {
        let mut cache = self.oid_cache.lock().await;
        if cache.remaining == 0 {
            cache.next = self
                .destination
                .allocate_oids(defaults::DEFAULT_OID_CHUNK)
                .await?;
            cache.remaining = defaults::DEFAULT_OID_CHUNK;
        }
        let oid = cache.next;
        cache.next = cache.next.offset(1);
        cache.remaining -= 1;
        Ok(oid)
    }

    /// Revisions of `oid`, newest first, at most `limit`. Refused until
    /// every source is imported: enumerating half-copied history would
    /// present missing revisions as nonexistent.
    pub async fn object_history(
        &self,
        oid: GlobalOid,
        limit: usize,
    ) -> DroverResult<Vec<ObjectState>> {
        if !self.cursors.all_complete() {
            return Err(DroverError::Unsupported("history enumeration"));
        }
        self.destination.history(oid, limit).await
    }

    /// Drop revisions of `oid` older than `keep`, returning how many were
    /// removed. Refused until every source is imported: reclamation must
    /// not race the importer filling in the same history.
    pub async fn reclaim_history(&self, oid: GlobalOid, keep: Serial) -> DroverResult<u64> {
        if !self.cursors.all_complete() {
            return Err(DroverError::Unsupported("history reclamation"));
        }
        self.destination.reclaim_history(oid, keep).await
    }

    /// Point-in-time snapshot of import progress, gated operations and
    /// writeback counters.
    pub async fn status(&self) -> AdapterStatus {
        let mut sources = Vec::with_capacity(self.importers.len());
        for worker in &self.importers {
            let view = worker.view();
            sources.push(SourceStatus {
                source: view.source().clone(),
                state: worker.state().await,
                cursor: view.get(),
                end: view.end(),
                percent: view.percent(),
            });
        }
        let writeback = self.writeback.as_ref().map(|wb| {
            let stats = wb.stats();
            WritebackStatus {
                queued: stats.queued(),
                delivered: stats.delivered(),
                failed: stats.failed(),
                pending: stats.pending(),
                alerts: wb.alerts().all(),
            }
        });
        let complete = self.cursors.all_complete();
        AdapterStatus {
            sources,
            complete,
            limitations: Limitations {
                historical_reads: !complete,
                reclamation: !complete,
            },
            writeback,
        }
    }

    /// Latched completion signal. The receiver reads `true` once every
    /// source is fully imported, including sources that finished before
    /// the call.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.detector.subscribe()
    }

    /// Block until every source is fully imported.
    pub async fn wait_for_completion(&self) {
        let mut rx = self.detector.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop every background task and wait for them to finish. Queued
    /// writeback records that were never delivered are abandoned; the
    /// counters keep saying so.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                warn!("adapter: worker task failed: {}", err);
            }
        }
        if let Some(writeback) = &self.writeback {
            writeback.join().await;
            let stats = writeback.stats();
            if !stats.drained() {
                warn!(
                    "adapter: {} writeback records abandoned, sources lag the destination",
                    stats.pending()
                );
            }
        }
        info!("adapter: stopped");
    }

    /// The resolved OID translation table.
    pub fn table(&self) -> &Arc<TranslationTable> {
        &self.table
    }

    /// First serial a live commit can be assigned.
    pub fn live_floor(&self) -> Serial {
        self.live_floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::time::Duration;

    use tokio::time::timeout;

    use drover_proto::oid::LocalOid;
    use drover_proto::txn::{GlobalRevision, ObjectRevision, TxnMeta};

    use crate::config::{DestinationConfig, SourceConfig, Tuning};
    use crate::source::file::open_at;
    use crate::source::memory::MemorySource;

    fn tuning() -> Tuning {
        Tuning {
            completion_poll_ms: 1,
            import_retry_base_ms: 1,
            import_retry_max_ms: 4,
            range_headroom: 8,
            ..Tuning::default()
        }
    }

    /// Two sources, mounted as in the config docs: `root` carries the
    /// tree entry at oid 1 and mounts `foo` at oid 5; `foo`'s own entry
    /// is oid 2. Ranges: root [0, 14), foo [14, 25), floor 25.
    fn two_source_config(writeback: bool) -> AdapterConfig {
        AdapterConfig {
            destination: DestinationConfig {
                kind: "memory".into(),
                path: None,
            },
            writeback,
            cursor_dir: None,
            sources: vec![
                SourceConfig {
                    id: SourceId::new("root"),
                    kind: "memory".into(),
                    path: None,
                    entry_oid: Some(1),
                    base_oid: None,
                    assignments: BTreeMap::from([("foo".to_string(), 5)]),
                    read_only: false,
                },
                SourceConfig {
                    id: SourceId::new("foo"),
                    kind: "memory".into(),
                    path: None,
                    entry_oid: None,
                    base_oid: None,
                    assignments: BTreeMap::from([("oid".to_string(), 2)]),
                    read_only: false,
                },
            ],
            tuning: tuning(),
        }
    }

    fn rev(oid: u64, data: &[u8], refs: &[u64]) -> ObjectRevision {
        ObjectRevision::new(
            LocalOid::new(oid),
            data.to_vec(),
            refs.iter().map(|&r| LocalOid::new(r)).collect(),
        )
    }

    /// root: one transaction writing the entry (refs the mount position
    /// and a child) plus the mount placeholder. foo: two transactions,
    /// the second revising its entry object.
    async fn seeded_backends() -> HashMap<SourceId, Arc<dyn SourceBackend>> {
        let root = Arc::new(MemorySource::new(SourceId::new("root")));
        root.append_native(
            TxnMeta::new("alice", "initial tree"),
            vec![
                rev(0, b"root-zero", &[]),
                rev(1, b"root-entry", &[5, 2]),
                rev(2, b"root-child", &[]),
                rev(5, b"mount", &[]),
            ],
        )
        .await;
        let foo = Arc::new(MemorySource::new(SourceId::new("foo")));
        foo.append_native(
            TxnMeta::new("bob", "foo v1"),
            vec![rev(0, b"foo-zero", &[]), rev(2, b"foo-entry-v1", &[])],
        )
        .await;
        foo.append_native(TxnMeta::new("bob", "foo v2"), vec![rev(2, b"foo-entry-v2", &[0])])
            .await;

        let mut map: HashMap<SourceId, Arc<dyn SourceBackend>> = HashMap::new();
        map.insert(SourceId::new("root"), root);
        map.insert(SourceId::new("foo"), foo);
        map
    }

    async fn wait_workers_complete(adapter: &Adapter) {
        for _ in 0..1000 {
            let status = adapter.status().await;
            if status.complete
                && status
                    .sources
                    .iter()
                    .all(|s| s.state == ImportState::Complete)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("import did not complete");
    }

    async fn wait_replicated(source: &Arc<dyn SourceBackend>, origin: Serial) {
        for _ in 0..1000 {
            if source.lookup_replicated(origin).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("transaction {origin} never replicated");
    }

    #[tokio::test]
    async fn test_reads_route_before_and_after_import() {
        let cfg = two_source_config(false);
        let adapter = Adapter::open_with_backends(cfg.resolve().unwrap(), seeded_backends().await)
            .await
            .unwrap();

        assert_eq!(adapter.table().floor(), GlobalOid::new(25));
        assert_eq!(adapter.live_floor(), Serial::new(3));
        let foo_entry = GlobalOid::new(16);

        // Nothing imported yet: reads proxy from the sources, rewritten
        // to global OIDs.
        let entry = adapter.read(GlobalOid::new(1), None).await.unwrap();
        assert_eq!(entry.data, b"root-entry");
        assert_eq!(entry.oid, GlobalOid::new(1));
        assert_eq!(entry.refs, vec![foo_entry, GlobalOid::new(2)]);

        let latest = adapter.read(foo_entry, None).await.unwrap();
        assert_eq!(latest.data, b"foo-entry-v2");
        assert_eq!(latest.serial, Serial::new(2));
        assert_eq!(latest.refs, vec![GlobalOid::new(14)]);

        let pinned = adapter.read(foo_entry, Some(Serial::new(1))).await.unwrap();
        assert_eq!(pinned.data, b"foo-entry-v1");

        // History stays gated while any source is behind.
        let err = adapter.object_history(foo_entry, 10).await.unwrap_err();
        assert!(matches!(err, DroverError::Unsupported(_)));
        let err = adapter
            .reclaim_history(foo_entry, Serial::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::Unsupported(_)));

        let status = adapter.status().await;
        assert!(!status.complete);
        assert!(status.limitations.historical_reads);
        assert!(status.limitations.reclamation);
        assert_eq!(status.sources.len(), 2);
        assert!(status
            .sources
            .iter()
            .all(|s| s.state == ImportState::Starting && s.cursor == Serial::ZERO));
        assert!(status.writeback.is_none());

        adapter.start().await;
        timeout(Duration::from_secs(5), adapter.wait_for_completion())
            .await
            .unwrap();
        wait_workers_complete(&adapter).await;
        assert!(*adapter.completion().borrow());

        let status = adapter.status().await;
        assert!(status.complete);
        assert!(!status.limitations.historical_reads);
        assert!(status.sources.iter().all(|s| s.cursor == s.end));

        // Same answers, now served by the destination.
        let pinned = adapter.read(foo_entry, Some(Serial::new(1))).await.unwrap();
        assert_eq!(pinned.data, b"foo-entry-v1");
        let entry = adapter.read(GlobalOid::new(1), None).await.unwrap();
        assert_eq!(entry.refs, vec![foo_entry, GlobalOid::new(2)]);

        // The mount position itself maps to no object.
        let err = adapter.read(GlobalOid::new(5), None).await.unwrap_err();
        assert!(matches!(err, DroverError::UnmappedReference(_)));

        let history = adapter.object_history(foo_entry, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data, b"foo-entry-v2");
        assert_eq!(history[1].data, b"foo-entry-v1");

        assert_eq!(
            adapter
                .reclaim_history(foo_entry, Serial::new(2))
                .await
                .unwrap(),
            1
        );

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_commit_mirrors_back_into_origin_source() {
        let cfg = two_source_config(true);
        let backends = seeded_backends().await;
        let foo = backends.get(&SourceId::new("foo")).unwrap().clone();
        let adapter = Adapter::open_with_backends(cfg.resolve().unwrap(), backends)
            .await
            .unwrap();
        adapter.start().await;

        let foo_entry = GlobalOid::new(16);
        let tid = adapter
            .commit(CommitRequest {
                meta: TxnMeta::new("carol", "live edit"),
                revisions: vec![GlobalRevision::new(foo_entry, b"foo-entry-live".to_vec(), vec![])],
            })
            .await
            .unwrap();
        assert_eq!(tid, adapter.live_floor());

        // The live revision wins every read from now on, import or not.
        let latest = adapter.read(foo_entry, None).await.unwrap();
        assert_eq!(latest.data, b"foo-entry-live");
        assert_eq!(latest.serial, tid);

        // And the origin source eventually holds the mirror.
        wait_replicated(&foo, tid).await;
        let mirrored = foo.read(LocalOid::new(2), None).await.unwrap();
        assert_eq!(mirrored.data, b"foo-entry-live");

        // The delivered counter settles just after the source ack.
        let mut wb = adapter.status().await.writeback.unwrap();
        for _ in 0..1000 {
            if wb.delivered == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            wb = adapter.status().await.writeback.unwrap();
        }
        assert_eq!(wb.queued, 1);
        assert_eq!(wb.delivered, 1);
        assert_eq!(wb.failed, 0);
        assert_eq!(wb.pending, 0);
        assert!(wb.alerts.is_empty());

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_oid_hands_out_fresh_native_oids() {
        let cfg = two_source_config(false);
        let adapter = Adapter::open_with_backends(cfg.resolve().unwrap(), seeded_backends().await)
            .await
            .unwrap();

        // More than one reservation chunk, all sequential from the floor.
        let mut oids = Vec::new();
        for _ in 0..(defaults::DEFAULT_OID_CHUNK + 6) {
            oids.push(adapter.new_oid().await.unwrap());
        }
        let floor = adapter.table().floor().raw();
        let expected: Vec<GlobalOid> = (floor..floor + defaults::DEFAULT_OID_CHUNK + 6)
            .map(GlobalOid::new)
            .collect();
        assert_eq!(oids, expected);
        assert!(oids.iter().all(|&oid| adapter.table().is_native(oid)));

        // A commit at a native OID reads back without any source involved.
        let oid = oids[0];
        let tid = adapter
            .commit(CommitRequest {
                meta: TxnMeta::new("carol", "new object"),
                revisions: vec![GlobalRevision::new(oid, b"fresh".to_vec(), vec![])],
            })
            .await
            .unwrap();
        let state = adapter.read(oid, None).await.unwrap();
        assert_eq!(state.data, b"fresh");
        assert_eq!(state.serial, tid);
    }

    #[tokio::test]
    async fn test_restart_resumes_from_persisted_state() {
        let base = std::env::temp_dir().join("drover_test_adapter_restart");
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(base.join("cursors")).unwrap();
        let src_path = base.join("src_a.log");

        let seed = open_at(SourceId::new("a"), &src_path, false).await.unwrap();
        seed.append_native(
            TxnMeta::new("alice", "t1"),
            vec![rev(0, b"a0", &[]), rev(1, b"a1-v1", &[])],
        )
        .await
        .unwrap();
        seed.append_native(TxnMeta::new("alice", "t2"), vec![rev(1, b"a1-v2", &[0])])
            .await
            .unwrap();
        drop(seed);

        let cfg = AdapterConfig {
            destination: DestinationConfig {
                kind: "file".into(),
                path: Some(base.join("dest.log")),
            },
            writeback: false,
            cursor_dir: Some(base.join("cursors")),
            sources: vec![SourceConfig {
                id: SourceId::new("a"),
                kind: "file".into(),
                path: Some(src_path),
                entry_oid: None,
                base_oid: None,
                assignments: BTreeMap::new(),
                read_only: false,
            }],
            tuning: tuning(),
        };

        let adapter = Adapter::open(&cfg).await.unwrap();
        let status = adapter.status().await;
        assert_eq!(status.sources[0].cursor, Serial::ZERO);
        assert_eq!(status.sources[0].end, Serial::new(2));
        adapter.start().await;
        timeout(Duration::from_secs(5), adapter.wait_for_completion())
            .await
            .unwrap();
        let state = adapter.read(GlobalOid::new(1), None).await.unwrap();
        assert_eq!(state.data, b"a1-v2");
        adapter.shutdown().await;
        drop(adapter);

        // Reopen with the same config: the persisted cursor makes the
        // source complete at open and reads come from the destination.
        let adapter = Adapter::open(&cfg).await.unwrap();
        let status = adapter.status().await;
        assert!(status.complete);
        assert_eq!(status.sources[0].cursor, Serial::new(2));

        let pinned = adapter
            .read(GlobalOid::new(1), Some(Serial::new(1)))
            .await
            .unwrap();
        assert_eq!(pinned.data, b"a1-v1");
        assert_eq!(pinned.refs, Vec::<GlobalOid>::new());
        let history = adapter.object_history(GlobalOid::new(1), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        adapter.shutdown().await;

        let _ = std::fs::remove_dir_all(&base);
    }
}
