//! Import cursor store.
//!
//! One cursor per source database: the highest source serial whose
//! transaction has been committed to the destination. The importer owns
//! writes; the read router and the completion detector only read. Two
//! layers make that cheap:
//!
//! - [`CursorStore`] is the durable layer, written after every destination
//!   commit so a restart resumes instead of re-copying or skipping.
//! - [`CursorView`] is the shared in-process position, published with
//!   release ordering only after the durable save succeeded. A reader that
//!   observes a position is therefore guaranteed the data behind it is
//!   committed on the destination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{Serial, SourceId};

use crate::fsutil::atomic_write;

/// Durable cursor persistence, injectable so tests run in memory.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last saved position, `None` if this source has never been imported.
    async fn load(&self, source: &SourceId) -> DroverResult<Option<Serial>>;

    /// Persist a new position. Must be durable before returning.
    async fn save(&self, source: &SourceId, serial: Serial) -> DroverResult<()>;
}

#[derive(Serialize, Deserialize)]
struct CursorRecord {
    source: String,
    serial: u64,
    checksum: [u8; 20],
}

fn record_checksum(source: &str, serial: u64) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hasher.update(serial.to_le_bytes());
    hasher.finalize().into()
}

/// File-per-source cursor store. Each save is a checksummed record written
/// with tmp-and-rename, so a torn write surfaces as corruption instead of
/// a silently wrong position.
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, source: &SourceId) -> PathBuf {
        self.dir.join(format!("{}.cursor", source))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, source: &SourceId) -> DroverResult<Option<Serial>> {
        let path = self.path(source);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let rec: CursorRecord = bincode::deserialize(&data).map_err(|e| {
            DroverError::CursorCorruption {
                source: source.clone(),
                reason: format!("undecodable cursor file {}: {}", path.display(), e),
            }
        })?;
        if rec.source != source.as_str()
            || rec.checksum != record_checksum(&rec.source, rec.serial)
        {
            return Err(DroverError::CursorCorruption {
                source: source.clone(),
                reason: format!("checksum mismatch in {}", path.display()),
            });
        }
        Ok(Some(Serial::new(rec.serial)))
    }

    async fn save(&self, source: &SourceId, serial: Serial) -> DroverResult<()> {
        let rec = CursorRecord {
            source: source.as_str().to_owned(),
            serial: serial.raw(),
            checksum: record_checksum(source.as_str(), serial.raw()),
        };
        let data = bincode::serialize(&rec)
            .map_err(|e| DroverError::Internal(format!("cursor encode: {e}")))?;
        let path = self.path(source);
        tokio::task::spawn_blocking(move || atomic_write(&path, &data))
            .await
            .map_err(|e| DroverError::Internal(format!("cursor save join: {e}")))??;
        debug!("cursor: saved {}@{}", source, serial);
        Ok(())
    }
}

/// In-memory cursor store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryCursorStore {
    map: DashMap<SourceId, Serial>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, source: &SourceId) -> DroverResult<Option<Serial>> {
        Ok(self.map.get(source).map(|s| *s))
    }

    async fn save(&self, source: &SourceId, serial: Serial) -> DroverResult<()> {
        self.map.insert(source.clone(), serial);
        Ok(())
    }
}

/// Shared in-process view of one source's cursor.
///
/// `end` is the source's head serial frozen at startup. Everything at or
/// below it is legacy history to import; anything the log grows beyond it
/// afterwards is writeback echo and never imported.
pub struct CursorView {
    source: SourceId,
    pos: AtomicU64,
    end: Serial,
}

impl CursorView {
    pub fn new(source: SourceId, start: Serial, end: Serial) -> Self {
        Self {
            source,
            pos: AtomicU64::new(start.raw()),
            end,
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Last imported serial; zero means nothing imported yet.
    pub fn get(&self) -> Serial {
        Serial::new(self.pos.load(Ordering::Acquire))
    }

    /// Whether the transaction at `serial` has been imported.
    pub fn covers(&self, serial: Serial) -> bool {
        serial.raw() <= self.pos.load(Ordering::Acquire)
    }

    /// Head of the legacy history this source still has to deliver.
    pub fn end(&self) -> Serial {
        self.end
    }

    pub fn is_complete(&self) -> bool {
        self.get() >= self.end
    }

    /// Fraction of the legacy history imported, for progress reporting.
    pub fn percent(&self) -> f64 {
        if self.end.is_zero() {
            return 100.0;
        }
        (self.get().raw() as f64 / self.end.raw() as f64) * 100.0
    }

    /// Publish a new position. Called by the importer only, after the
    /// durable save; the release store pairs with readers' acquire loads.
    /// The position never moves backwards.
    pub(crate) fn publish(&self, serial: Serial) {
        self.pos.fetch_max(serial.raw(), Ordering::Release);
    }
}

/// All cursor views, keyed by source. Built once at startup and shared.
pub struct CursorSet {
    views: HashMap<SourceId, Arc<CursorView>>,
}

impl CursorSet {
    pub fn new(views: Vec<Arc<CursorView>>) -> Self {
        Self {
            views: views
                .into_iter()
                .map(|v| (v.source().clone(), v))
                .collect(),
        }
    }

    pub fn view(&self, source: &SourceId) -> Option<&Arc<CursorView>> {
        self.views.get(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CursorView>> {
        self.views.values()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Whether every source's cursor has reached its end of log.
    pub fn all_complete(&self) -> bool {
        self.views.values().all(|v| v.is_complete())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCursorStore::new();
        let src = SourceId::new("root");
        assert_eq!(store.load(&src).await.unwrap(), None);
        store.save(&src, Serial::new(42)).await.unwrap();
        assert_eq!(store.load(&src).await.unwrap(), Some(Serial::new(42)));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join("drover_test_cursor_rt");
        let _ = std::fs::remove_dir_all(&dir);
        let store = FileCursorStore::new(&dir);
        let src = SourceId::new("root");

        assert_eq!(store.load(&src).await.unwrap(), None);
        store.save(&src, Serial::new(7)).await.unwrap();
        store.save(&src, Serial::new(8)).await.unwrap();
        assert_eq!(store.load(&src).await.unwrap(), Some(Serial::new(8)));

        // A second store over the same directory sees the saved position.
        let reopened = FileCursorStore::new(&dir);
        assert_eq!(reopened.load(&src).await.unwrap(), Some(Serial::new(8)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_file_store_detects_corruption() {
        let dir = std::env::temp_dir().join("drover_test_cursor_corrupt");
        let _ = std::fs::remove_dir_all(&dir);
        let store = FileCursorStore::new(&dir);
        let src = SourceId::new("root");
        store.save(&src, Serial::new(7)).await.unwrap();

        let path = dir.join("root.cursor");
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let err = store.load(&src).await.unwrap_err();
        assert!(matches!(err, DroverError::CursorCorruption { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_view_publish_and_covers() {
        let view = CursorView::new(SourceId::new("a"), Serial::ZERO, Serial::new(10));
        assert!(view.covers(Serial::ZERO));
        assert!(!view.covers(Serial::new(1)));
        assert!(!view.is_complete());

        view.publish(Serial::new(4));
        assert!(view.covers(Serial::new(4)));
        assert!(!view.covers(Serial::new(5)));

        // Never moves backwards.
        view.publish(Serial::new(2));
        assert_eq!(view.get(), Serial::new(4));

        view.publish(Serial::new(10));
        assert!(view.is_complete());
        assert_eq!(view.percent(), 100.0);
    }

    #[test]
    fn test_set_all_complete() {
        let a = Arc::new(CursorView::new(SourceId::new("a"), Serial::ZERO, Serial::new(2)));
        let b = Arc::new(CursorView::new(SourceId::new("b"), Serial::ZERO, Serial::new(1)));
        let set = CursorSet::new(vec![a.clone(), b.clone()]);
        assert!(!set.all_complete());
        a.publish(Serial::new(2));
        assert!(!set.all_complete());
        b.publish(Serial::new(1));
        assert!(set.all_complete());
    }
}
