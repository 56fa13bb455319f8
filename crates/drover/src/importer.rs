//! Background history importer.
//!
//! One worker per source walks the frozen legacy log from the persisted
//! cursor up to the head captured at go-live, translating each transaction
//! into global OIDs and committing it to the destination store at its
//! original serial. The order inside one step is fixed: destination
//! commit, durable cursor save, then view publish. A crash between the
//! first two replays the transaction on restart, and provenance tracking
//! on the destination turns the second commit into a no-op.
//!
//! Source outages are retried with exponential backoff. Anything that
//! smells like divergence halts the worker instead: a cursor ahead of the
//! destination, a log that ends before the frozen head, an unmappable OID
//! inside legacy data. Importing past an inconsistency would fabricate
//! history.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{Serial, SourceId};
use drover_proto::txn::{DestinationBatch, GlobalRevision, SourceTransaction};

use crate::config::Tuning;
use crate::cursor::{CursorStore, CursorView};
use crate::destination::DestinationClient;
use crate::source::SourceBackend;
use crate::table::TranslationTable;

/// Importer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    /// Validating the persisted cursor before the first batch.
    Starting,
    /// Walking the legacy log.
    Running,
    /// Waiting out a source outage.
    Retrying,
    /// Every native transaction is on the destination.
    Complete,
    /// Stopped on an inconsistency; operator intervention required.
    Halted,
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportState::Starting => write!(f, "starting"),
            ImportState::Running => write!(f, "running"),
            ImportState::Retrying => write!(f, "retrying"),
            ImportState::Complete => write!(f, "complete"),
            ImportState::Halted => write!(f, "halted"),
        }
    }
}

/// Per-source import worker. Owns no task itself; the adapter spawns
/// [`ImportWorker::run`] and keeps the `Arc` for state inspection.
pub struct ImportWorker {
    source_id: SourceId,
    source: Arc<dyn SourceBackend>,
    destination: Arc<dyn DestinationClient>,
    table: Arc<TranslationTable>,
    store: Arc<dyn CursorStore>,
    view: Arc<CursorView>,
    tuning: Tuning,
    state: RwLock<ImportState>,
}

impl ImportWorker {
    pub fn new(
        source: Arc<dyn SourceBackend>,
        destination: Arc<dyn DestinationClient>,
        table: Arc<TranslationTable>,
        store: Arc<dyn CursorStore>,
        view: Arc<CursorView>,
        tuning: Tuning,
    ) -> Self {
        Self {
            source_id: view.source().clone(),
            source,
            destination,
            table,
            store,
            view,
            tuning,
            state: RwLock::new(ImportState::Starting),
        }
    }

    pub async fn state(&self) -> ImportState {
        *self.state.read().await
    }

    /// Progress view shared with the read router.
    pub fn view(&self) -> &Arc<CursorView> {
        &self.view
    }

    async fn set_state(&self, next: ImportState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!("importer {}: {} -> {}", self.source_id, *state, next);
            *state = next;
        }
    }

    /// Drive the import to completion, shutdown, or a halt.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "importer {}: starting at serial {} (frozen head {})",
            self.source_id,
            self.view.get(),
            self.view.end()
        );
        match self.import_loop(&mut shutdown).await {
            Ok(true) => {
                self.set_state(ImportState::Complete).await;
                info!(
                    "importer {}: source fully imported at serial {}",
                    self.source_id,
                    self.view.end()
                );
            }
            Ok(false) => {
                info!(
                    "importer {}: stopped at serial {} of {}",
                    self.source_id,
                    self.view.get(),
                    self.view.end()
                );
            }
            Err(e) => {
                self.set_state(ImportState::Halted).await;
                error!("importer {}: halted: {}", self.source_id, e);
            }
        }
    }

    /// `Ok(true)` when the source is fully imported, `Ok(false)` on
    /// shutdown, `Err` on a fatal inconsistency.
    async fn import_loop(&self, shutdown: &mut watch::Receiver<bool>) -> DroverResult<bool> {
        self.validate_cursor().await?;
        if self.view.is_complete() {
            return Ok(true);
        }
        self.set_state(ImportState::Running).await;

        let base = Duration::from_millis(self.tuning.import_retry_base_ms.max(1));
        let max = Duration::from_millis(self.tuning.import_retry_max_ms.max(1));
        let throttle = Duration::from_millis(self.tuning.import_throttle_ms);
        let mut backoff = base;

        loop {
            if *shutdown.borrow() {
                return Ok(false);
            }
            let from = self.view.get();
            let txns = match self
                .source
                .read_log(from, self.tuning.import_batch_txns)
                .await
            {
                Ok(txns) => txns,
                Err(e) if e.is_transient() => {
                    self.set_state(ImportState::Retrying).await;
                    warn!(
                        "importer {}: source unavailable, retrying in {}ms: {}",
                        self.source_id,
                        backoff.as_millis(),
                        e
                    );
                    if !sleep_or_stop(backoff, shutdown).await {
                        return Ok(false);
                    }
                    backoff = (backoff * 2).min(max);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.set_state(ImportState::Running).await;
            backoff = base;

            let mut progressed = false;
            for txn in &txns {
                // Anything past the frozen head is post-go-live traffic
                // echoed back into the source, never import material.
                if txn.serial > self.view.end() {
                    break;
                }
                let batch = self.translate(txn)?;
                self.destination.commit(batch).await?;
                self.store.save(&self.source_id, txn.serial).await?;
                self.view.publish(txn.serial);
                progressed = true;
                if *shutdown.borrow() {
                    return Ok(false);
                }
            }
            if self.view.is_complete() {
                return Ok(true);
            }
            if !progressed {
                return Err(DroverError::CursorCorruption {
                    source: self.source_id.clone(),
                    reason: format!(
                        "source log ends after serial {} but the frozen head is {}",
                        from,
                        self.view.end()
                    ),
                });
            }
            debug!(
                "importer {}: at serial {} of {} ({:.1}%)",
                self.source_id,
                self.view.get(),
                self.view.end(),
                self.view.percent()
            );
            if !throttle.is_zero() && !sleep_or_stop(throttle, shutdown).await {
                return Ok(false);
            }
        }
    }

    /// Reject a persisted cursor the rest of the system contradicts.
    async fn validate_cursor(&self) -> DroverResult<()> {
        let cursor = self.view.get();
        if cursor > self.view.end() {
            return Err(DroverError::CursorCorruption {
                source: self.source_id.clone(),
                reason: format!(
                    "cursor {} is past the frozen source head {}",
                    cursor,
                    self.view.end()
                ),
            });
        }
        let imported = self
            .destination
            .imported_serial(&self.source_id)
            .await?
            .unwrap_or(Serial::ZERO);
        // cursor < imported is the normal crash window (commit landed,
        // cursor save did not); the replay is idempotent. The other
        // direction claims data the destination never saw.
        if cursor > imported {
            return Err(DroverError::CursorCorruption {
                source: self.source_id.clone(),
                reason: format!("cursor {cursor} is ahead of destination imported head {imported}"),
            });
        }
        Ok(())
    }

    fn translate(&self, txn: &SourceTransaction) -> DroverResult<DestinationBatch> {
        let mut revisions = Vec::with_capacity(txn.revisions.len());
        for rev in &txn.revisions {
            if self.table.is_mount_position(&self.source_id, rev.oid) {
                // The legacy record at a mount position is the mount
                // itself; the weave lives in configuration now.
                debug!(
                    "importer {}: dropping mount record at oid {} (serial {})",
                    self.source_id, rev.oid, txn.serial
                );
                continue;
            }
            let oid = self.table.resolve(&self.source_id, rev.oid)?;
            let mut refs = Vec::with_capacity(rev.refs.len());
            for &r in &rev.refs {
                refs.push(self.table.resolve(&self.source_id, r)?);
            }
            revisions.push(GlobalRevision::new(oid, rev.data.clone(), refs));
        }
        Ok(DestinationBatch::imported(
            self.source_id.clone(),
            txn.serial,
            txn.meta.clone(),
            revisions,
        ))
    }
}

/// `false` when shutdown fired before the sleep elapsed.
async fn sleep_or_stop(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = shutdown.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use drover_proto::oid::{GlobalOid, LocalOid};
    use drover_proto::txn::{ObjectRevision, TxnMeta};

    use crate::config::{AdapterConfig, DestinationConfig, ResolvedConfig, SourceConfig};
    use crate::cursor::MemoryCursorStore;
    use crate::destination::memory::MemoryDestination;
    use crate::source::memory::MemorySource;

    fn source_cfg(id: &str) -> SourceConfig {
        SourceConfig {
            id: SourceId::new(id),
            kind: "memory".into(),
            path: None,
            entry_oid: None,
            base_oid: None,
            assignments: BTreeMap::new(),
            read_only: false,
        }
    }

    fn resolved(sources: Vec<SourceConfig>) -> ResolvedConfig {
        AdapterConfig {
            destination: DestinationConfig {
                kind: "memory".into(),
                path: None,
            },
            writeback: false,
            cursor_dir: None,
            sources,
            tuning: Tuning::default(),
        }
        .resolve()
        .unwrap()
    }

    fn rev(oid: u64, data: &[u8], refs: &[u64]) -> ObjectRevision {
        ObjectRevision::new(
            LocalOid::new(oid),
            data.to_vec(),
            refs.iter().map(|&r| LocalOid::new(r)).collect(),
        )
    }

    struct Fix {
        worker: Arc<ImportWorker>,
        src: Arc<MemorySource>,
        dest: Arc<MemoryDestination>,
        store: Arc<MemoryCursorStore>,
        view: Arc<CursorView>,
        table: Arc<TranslationTable>,
    }

    /// Worker over a pre-seeded source, cursor starting at `start`.
    async fn fixture(src: Arc<MemorySource>, start: Serial, tuning: Tuning) -> Fix {
        let cfg = resolved(vec![source_cfg("src")]);
        let table = Arc::new(
            TranslationTable::build(&cfg, &[(SourceId::new("src"), 100)].into_iter().collect())
                .unwrap(),
        );
        let end = src.last_serial().await.unwrap();
        let view = Arc::new(CursorView::new(SourceId::new("src"), start, end));
        let dest = Arc::new(MemoryDestination::new(table.floor(), end.next()));
        let store = Arc::new(MemoryCursorStore::new());
        let worker = Arc::new(ImportWorker::new(
            src.clone(),
            dest.clone(),
            table.clone(),
            store.clone(),
            view.clone(),
            tuning,
        ));
        Fix {
            worker,
            src,
            dest,
            store,
            view,
            table,
        }
    }

    fn global(table: &TranslationTable, source: &str, local: u64) -> GlobalOid {
        table
            .resolve(&SourceId::new(source), LocalOid::new(local))
            .unwrap()
    }

    #[tokio::test]
    async fn test_imports_everything_and_completes() {
        let src = Arc::new(MemorySource::new(SourceId::new("src")));
        src.append_native(TxnMeta::default(), vec![rev(3, b"dep", &[])])
            .await;
        src.append_native(TxnMeta::default(), vec![rev(5, b"head", &[3])])
            .await;
        let fix = fixture(src, Serial::ZERO, Tuning::default()).await;

        let (_tx, rx) = watch::channel(false);
        fix.worker.clone().run(rx).await;

        assert_eq!(fix.worker.state().await, ImportState::Complete);
        assert!(fix.view.is_complete());
        assert_eq!(
            fix.store.load(&SourceId::new("src")).await.unwrap(),
            Some(Serial::new(2))
        );

        let g5 = global(&fix.table, "src", 5);
        let state = fix.dest.read(g5, Some(Serial::new(2))).await.unwrap().unwrap();
        assert_eq!(state.data, b"head");
        assert_eq!(state.serial, Serial::new(2));
        assert_eq!(state.refs, vec![global(&fix.table, "src", 3)]);
        // The original serial survives: a pin at 1 sees nothing for oid 5.
        assert!(fix.dest.read(g5, Some(Serial::new(1))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_after_partial_crash_is_idempotent() {
        let src = Arc::new(MemorySource::new(SourceId::new("src")));
        src.append_native(TxnMeta::default(), vec![rev(1, b"one", &[])])
            .await;
        src.append_native(TxnMeta::default(), vec![rev(2, b"two", &[])])
            .await;
        let fix = fixture(src, Serial::ZERO, Tuning::default()).await;

        // Crash window: the first transaction reached the destination but
        // the cursor save never happened.
        let g1 = global(&fix.table, "src", 1);
        fix.dest
            .commit(DestinationBatch::imported(
                SourceId::new("src"),
                Serial::new(1),
                TxnMeta::default(),
                vec![GlobalRevision::new(g1, b"one".to_vec(), vec![])],
            ))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        fix.worker.clone().run(rx).await;

        assert_eq!(fix.worker.state().await, ImportState::Complete);
        // The replayed commit deduplicated instead of doubling history.
        assert_eq!(fix.dest.history(g1, 10).await.unwrap().len(), 1);
        assert_eq!(
            fix.store.load(&SourceId::new("src")).await.unwrap(),
            Some(Serial::new(2))
        );
    }

    #[tokio::test]
    async fn test_cursor_ahead_of_destination_halts() {
        let src = Arc::new(MemorySource::new(SourceId::new("src")));
        src.append_native(TxnMeta::default(), vec![rev(1, b"one", &[])])
            .await;
        src.append_native(TxnMeta::default(), vec![rev(2, b"two", &[])])
            .await;
        // Cursor claims serial 2 imported; the destination has nothing.
        let fix = fixture(src, Serial::new(2), Tuning::default()).await;

        let (_tx, rx) = watch::channel(false);
        fix.worker.clone().run(rx).await;

        assert_eq!(fix.worker.state().await, ImportState::Halted);
        assert_eq!(fix.view.get(), Serial::new(2));
        assert!(fix
            .dest
            .read(global(&fix.table, "src", 1), None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cursor_past_source_head_halts() {
        let src = Arc::new(MemorySource::new(SourceId::new("src")));
        src.append_native(TxnMeta::default(), vec![rev(1, b"one", &[])])
            .await;
        let fix = fixture(src, Serial::new(7), Tuning::default()).await;

        let (_tx, rx) = watch::channel(false);
        fix.worker.clone().run(rx).await;

        assert_eq!(fix.worker.state().await, ImportState::Halted);
    }

    #[tokio::test]
    async fn test_retries_while_source_unavailable_then_finishes() {
        let src = Arc::new(MemorySource::new(SourceId::new("src")));
        src.append_native(TxnMeta::default(), vec![rev(1, b"one", &[])])
            .await;
        src.set_unavailable(true);
        let tuning = Tuning {
            import_retry_base_ms: 1,
            import_retry_max_ms: 8,
            ..Tuning::default()
        };
        let fix = fixture(src, Serial::ZERO, tuning).await;

        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(fix.worker.clone().run(rx));

        let mut polls = 0;
        while fix.worker.state().await != ImportState::Retrying {
            polls += 1;
            assert!(polls < 1000, "worker never entered retry");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        fix.src.set_unavailable(false);
        handle.await.unwrap();

        assert_eq!(fix.worker.state().await, ImportState::Complete);
        assert!(fix.view.is_complete());
    }

    #[tokio::test]
    async fn test_mount_position_records_not_imported() {
        // "root" mounts "leaf" at local OID 5; root's log carries the
        // legacy mount record at 5 plus real data at 0.
        let mut root = source_cfg("root");
        root.assignments.insert("leaf".into(), 5);
        let cfg = resolved(vec![root, source_cfg("leaf")]);
        let spans = [(SourceId::new("root"), 100), (SourceId::new("leaf"), 10)]
            .into_iter()
            .collect();
        let table = Arc::new(TranslationTable::build(&cfg, &spans).unwrap());

        let src = Arc::new(MemorySource::new(SourceId::new("root")));
        src.append_native(
            TxnMeta::default(),
            vec![rev(0, b"entry", &[]), rev(5, b"mount-plumbing", &[])],
        )
        .await;
        let end = src.last_serial().await.unwrap();
        let view = Arc::new(CursorView::new(SourceId::new("root"), Serial::ZERO, end));
        let dest = Arc::new(MemoryDestination::new(table.floor(), end.next()));
        let store = Arc::new(MemoryCursorStore::new());
        let worker = Arc::new(ImportWorker::new(
            src,
            dest.clone(),
            table.clone(),
            store,
            view,
            Tuning::default(),
        ));

        let (_tx, rx) = watch::channel(false);
        worker.clone().run(rx).await;
        assert_eq!(worker.state().await, ImportState::Complete);

        assert!(dest
            .read(global(&table, "root", 0), None)
            .await
            .unwrap()
            .is_some());
        // resolve(root, 5) aliases to leaf's entry; nothing may land there
        // from root's log.
        let via_mount = global(&table, "root", 5);
        assert_eq!(via_mount, table.entry_global(&SourceId::new("leaf")).unwrap());
        assert!(dest.read(via_mount, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_import() {
        let src = Arc::new(MemorySource::new(SourceId::new("src")));
        src.append_native(TxnMeta::default(), vec![rev(1, b"one", &[])])
            .await;
        let fix = fixture(src, Serial::ZERO, Tuning::default()).await;

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        fix.worker.clone().run(rx).await;

        assert!(!fix.view.is_complete());
        assert_eq!(fix.view.get(), Serial::ZERO);
        assert_ne!(fix.worker.state().await, ImportState::Complete);
    }
}
