//! File-backed source backend.
//!
//! A legacy database is one append-only log of framed transactions (see
//! [`crate::fsutil`] for the frame layout). Opening it scans the whole
//! log once and builds an in-memory index: per-object revision locations,
//! transaction positions, replicated-origin lookups. Object payloads stay
//! on disk and are read on demand.
//!
//! A torn frame at the very end of the file is the footprint of a crashed
//! append: it is dropped with a warning and truncated away on writable
//! sources. Anything malformed before the end refuses to open.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use drover_proto::error::{ConfigError, DroverError, DroverResult};
use drover_proto::oid::{LocalOid, Serial, SourceId};
use drover_proto::txn::{ObjectRevision, SourceTransaction, TxnMeta};

use crate::config::ResolvedSource;
use crate::fsutil::{
    check_header, encode_frame, file_header, frame_size, parse_frame, FrameError,
    FILE_HEADER_SIZE,
};

use super::{ReplicatedTxn, SourceBackend, SourceRevision};

const LOG_MAGIC: u32 = 0x4452_4c47; // "DRLG"
const RECORD_MAGIC: u32 = 0x4452_5458; // "DRTX"
const LOG_VERSION: u32 = 1;

/// Location of one transaction record in the log file.
#[derive(Debug, Clone, Copy)]
struct RecordLoc {
    serial: Serial,
    offset: u64,
    len: u32,
}

#[derive(Debug, Default)]
struct Index {
    /// Per-object revision locations, in log order.
    by_oid: HashMap<LocalOid, Vec<RecordLoc>>,
    /// Every transaction in log order.
    txns: Vec<RecordLoc>,
    /// Replicated transactions by their destination origin serial.
    origins: HashMap<Serial, Serial>,
    /// Highest OID in native transactions; what `last_oid` reports.
    native_last_oid: Option<u64>,
    /// Highest OID anywhere, including replicated writes and minted OIDs;
    /// allocation starts above this.
    any_last_oid: Option<u64>,
    /// Head serial of native history; what `last_serial` reports.
    native_last_serial: Serial,
    /// Head serial of the whole log; appends go past this.
    any_last_serial: Serial,
    /// End of the last intact record; appends go here.
    tail: u64,
}

fn bump(slot: &mut Option<u64>, oid: u64) {
    *slot = Some(match *slot {
        Some(cur) => cur.max(oid),
        None => oid,
    });
}

impl Index {
    fn absorb(&mut self, txn: &SourceTransaction, loc: RecordLoc) {
        for rev in &txn.revisions {
            self.by_oid.entry(rev.oid).or_default().push(loc);
            bump(&mut self.any_last_oid, rev.oid.raw());
            if txn.origin.is_none() {
                bump(&mut self.native_last_oid, rev.oid.raw());
            }
        }
        if let Some(origin) = txn.origin {
            self.origins.insert(origin, txn.serial);
        } else {
            self.native_last_serial = self.native_last_serial.max(txn.serial);
        }
        self.txns.push(loc);
        self.any_last_serial = self.any_last_serial.max(txn.serial);
        self.tail = loc.offset + frame_size(loc.len) as u64;
    }
}

#[derive(Debug)]
pub struct FileSource {
    id: SourceId,
    path: PathBuf,
    read_only: bool,
    index: RwLock<Index>,
}

impl FileSource {
    /// Open the log named by a source configuration, scanning it into an
    /// index. A writable source that does not exist yet is created empty.
    pub async fn open(cfg: &ResolvedSource) -> DroverResult<Self> {
        let path = cfg
            .path
            .clone()
            .ok_or_else(|| ConfigError::MissingPath(cfg.id.clone()))?;
        let id = cfg.id.clone();
        let read_only = cfg.read_only;

        let scan_path = path.clone();
        let scan_id = id.clone();
        let index =
            tokio::task::spawn_blocking(move || scan_log(&scan_path, &scan_id, read_only))
                .await
                .map_err(|e| DroverError::Internal(format!("log scan join: {e}")))??;

        info!(
            "source {}: opened {} ({} transactions, native head serial {})",
            id,
            path.display(),
            index.txns.len(),
            index.native_last_serial
        );
        Ok(Self {
            id,
            path,
            read_only,
            index: RwLock::new(index),
        })
    }

    fn unavailable(&self, e: std::io::Error) -> DroverError {
        DroverError::SourceUnavailable {
            source: self.id.clone(),
            reason: e.to_string(),
        }
    }

    async fn fetch(&self, loc: RecordLoc) -> DroverResult<SourceTransaction> {
        let path = self.path.clone();
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || read_record(&path, &id, loc))
            .await
            .map_err(|e| DroverError::Internal(format!("log read join: {e}")))?
    }

    /// Append a native transaction at the next serial. This is how
    /// fixtures and rehearsal data get built.
    pub async fn append_native(
        &self,
        meta: TxnMeta,
        revisions: Vec<ObjectRevision>,
    ) -> DroverResult<Serial> {
        self.append(None, meta, revisions).await
    }

    async fn append(
        &self,
        origin: Option<Serial>,
        meta: TxnMeta,
        revisions: Vec<ObjectRevision>,
    ) -> DroverResult<Serial> {
        if self.read_only {
            return Err(DroverError::ReadOnlySource(self.id.clone()));
        }
        let mut index = self.index.write().await;
        // Re-check under the write lock: two racing deliveries of the
        // same origin must still commit once.
        if let Some(origin) = origin {
            if let Some(serial) = index.origins.get(&origin) {
                return Ok(*serial);
            }
        }
        let serial = index.any_last_serial.next();
        let txn = SourceTransaction {
            serial,
            origin,
            meta,
            revisions,
        };
        let payload = bincode::serialize(&txn)
            .map_err(|e| DroverError::Internal(format!("log encode: {e}")))?;
        let len = payload.len() as u32;
        let frame = encode_frame(RECORD_MAGIC, &payload);

        let path = self.path.clone();
        let offset = index.tail;
        let written = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&frame)?;
            file.sync_all()
        })
        .await
        .map_err(|e| DroverError::Internal(format!("log append join: {e}")))?;
        written.map_err(|e| self.unavailable(e))?;

        index.absorb(&txn, RecordLoc { serial, offset, len });
        debug!("source {}: appended serial {}", self.id, serial);
        Ok(serial)
    }
}

#[async_trait]
impl SourceBackend for FileSource {
    fn kind(&self) -> &str {
        "file"
    }

    async fn last_oid(&self) -> DroverResult<Option<LocalOid>> {
        Ok(self.index.read().await.native_last_oid.map(LocalOid::new))
    }

    async fn last_serial(&self) -> DroverResult<Serial> {
        Ok(self.index.read().await.native_last_serial)
    }

    async fn read(&self, oid: LocalOid, at: Option<Serial>) -> DroverResult<SourceRevision> {
        let loc = {
            let index = self.index.read().await;
            let locs = index.by_oid.get(&oid).ok_or_else(|| {
                DroverError::ObjectNotFound(format!("oid {} in source '{}'", oid, self.id))
            })?;
            let found = match at {
                Some(at) => locs.iter().rev().find(|l| l.serial <= at),
                None => locs.last(),
            };
            *found.ok_or_else(|| {
                DroverError::ObjectNotFound(format!(
                    "oid {} in source '{}' at serial {}",
                    oid,
                    self.id,
                    at.unwrap_or(Serial::ZERO)
                ))
            })?
        };
        let txn = self.fetch(loc).await?;
        let rev = txn
            .revisions
            .into_iter()
            .find(|r| r.oid == oid)
            .ok_or_else(|| {
                DroverError::Corrupt(format!(
                    "record at serial {} lost oid {} in source '{}'",
                    loc.serial, oid, self.id
                ))
            })?;
        Ok(SourceRevision {
            oid,
            serial: loc.serial,
            data: rev.data,
            refs: rev.refs,
        })
    }

    async fn head_serial(&self, oid: LocalOid) -> DroverResult<Option<Serial>> {
        let index = self.index.read().await;
        Ok(index
            .by_oid
            .get(&oid)
            .and_then(|locs| locs.last())
            .map(|l| l.serial))
    }

    async fn read_log(
        &self,
        from: Serial,
        limit: usize,
    ) -> DroverResult<Vec<SourceTransaction>> {
        let locs: Vec<RecordLoc> = {
            let index = self.index.read().await;
            let start = index.txns.partition_point(|l| l.serial <= from);
            index.txns[start..].iter().take(limit).copied().collect()
        };
        let mut out = Vec::with_capacity(locs.len());
        for loc in locs {
            out.push(self.fetch(loc).await?);
        }
        Ok(out)
    }

    async fn commit(&self, txn: ReplicatedTxn) -> DroverResult<Serial> {
        self.append(Some(txn.origin), txn.meta, txn.writes).await
    }

    async fn lookup_replicated(&self, origin: Serial) -> DroverResult<Option<Serial>> {
        Ok(self.index.read().await.origins.get(&origin).copied())
    }

    async fn new_oid(&self) -> DroverResult<LocalOid> {
        if self.read_only {
            return Err(DroverError::ReadOnlySource(self.id.clone()));
        }
        let mut index = self.index.write().await;
        let next = index.any_last_oid.map(|o| o + 1).unwrap_or(0);
        index.any_last_oid = Some(next);
        Ok(LocalOid::new(next))
    }
}

/// Open a `FileSource` directly from a path, outside any configuration.
/// Fixture helper for tests and seeding tools.
pub async fn open_at(
    id: SourceId,
    path: impl Into<PathBuf>,
    read_only: bool,
) -> DroverResult<Arc<FileSource>> {
    let cfg = ResolvedSource {
        id,
        kind: "file".into(),
        path: Some(path.into()),
        entry_oid: LocalOid::new(0),
        base_oid: None,
        mounts: Vec::new(),
        read_only,
    };
    Ok(Arc::new(FileSource::open(&cfg).await?))
}

fn scan_log(path: &Path, id: &SourceId, read_only: bool) -> DroverResult<Index> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !read_only => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = fs::File::create(path)?;
            file.write_all(&file_header(LOG_MAGIC, LOG_VERSION))?;
            file.sync_all()?;
            info!("source {}: created empty log at {}", id, path.display());
            return Ok(Index {
                tail: FILE_HEADER_SIZE as u64,
                ..Index::default()
            });
        }
        Err(e) => {
            return Err(DroverError::SourceUnavailable {
                source: id.clone(),
                reason: format!("{}: {}", path.display(), e),
            });
        }
    };

    check_header(&data, LOG_MAGIC, LOG_VERSION)
        .map_err(|why| DroverError::Corrupt(format!("log {}: {}", path.display(), why)))?;

    let mut index = Index {
        tail: FILE_HEADER_SIZE as u64,
        ..Index::default()
    };
    let mut pos = FILE_HEADER_SIZE;
    while pos < data.len() {
        match parse_frame(RECORD_MAGIC, &data[pos..]) {
            Ok((payload, total)) => {
                let txn: SourceTransaction = bincode::deserialize(payload).map_err(|e| {
                    DroverError::Corrupt(format!(
                        "log {} at offset {}: undecodable record: {}",
                        path.display(),
                        pos,
                        e
                    ))
                })?;
                if txn.serial <= index.any_last_serial {
                    return Err(DroverError::Corrupt(format!(
                        "log {}: serial {} does not advance past {}",
                        path.display(),
                        txn.serial,
                        index.any_last_serial
                    )));
                }
                let loc = RecordLoc {
                    serial: txn.serial,
                    offset: pos as u64,
                    len: payload.len() as u32,
                };
                index.absorb(&txn, loc);
                pos += total;
            }
            Err(FrameError::Torn) => {
                warn!(
                    "source {}: dropping torn record at offset {} in {}",
                    id,
                    pos,
                    path.display()
                );
                if !read_only {
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(pos as u64)?;
                    file.sync_all()?;
                }
                break;
            }
            Err(FrameError::Corrupt(why)) => {
                return Err(DroverError::Corrupt(format!(
                    "log {} at offset {}: {}",
                    path.display(),
                    pos,
                    why
                )));
            }
        }
    }
    Ok(index)
}

fn read_record(path: &Path, id: &SourceId, loc: RecordLoc) -> DroverResult<SourceTransaction> {
    let total = frame_size(loc.len);
    let unavailable = |e: std::io::Error| DroverError::SourceUnavailable {
        source: id.clone(),
        reason: e.to_string(),
    };
    let mut file = fs::File::open(path).map_err(unavailable)?;
    file.seek(SeekFrom::Start(loc.offset)).map_err(unavailable)?;
    let mut buf = vec![0u8; total];
    file.read_exact(&mut buf).map_err(unavailable)?;
    let (payload, _) = parse_frame(RECORD_MAGIC, &buf).map_err(|_| {
        DroverError::Corrupt(format!(
            "record at offset {} in {}",
            loc.offset,
            path.display()
        ))
    })?;
    bincode::deserialize(payload).map_err(|e| {
        DroverError::Corrupt(format!(
            "record at offset {} in {}: {}",
            loc.offset,
            path.display(),
            e
        ))
    })
}
