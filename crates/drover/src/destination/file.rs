//! File-backed destination store.
//!
//! One append-only log of framed records (see [`crate::fsutil`]), scanned
//! into an in-memory index at open. Three record kinds share the log:
//! committed transactions, durable OID range reservations, and history
//! reclamation tombstones. Reservations and tombstones are what make
//! `allocate_oids` and `reclaim_history` survive a restart; reclaimed
//! revision bytes stay in the file until the log is rewritten, they are
//! only masked from the index.
//!
//! Unlike a source log, serials here are not monotone in file order:
//! imported history commits at its original source serials, interleaved
//! with live commits allocated above the go-live floor.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{GlobalOid, Serial, SourceId};
use drover_proto::txn::{DestinationBatch, GlobalRevision, ObjectState, TxnMeta};

use crate::fsutil::{
    check_header, encode_frame, file_header, frame_size, parse_frame, FrameError,
    FILE_HEADER_SIZE,
};

use super::DestinationClient;

const STORE_MAGIC: u32 = 0x4452_4453; // "DRDS"
const RECORD_MAGIC: u32 = 0x4452_434d; // "DRCM"
const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
enum StoredRecord {
    Txn(StoredTxn),
    Alloc { base: u64, count: u64 },
    Reclaim { oid: GlobalOid, keep: Serial },
}

#[derive(Serialize, Deserialize)]
struct StoredTxn {
    serial: Serial,
    provenance: Option<(SourceId, Serial)>,
    meta: TxnMeta,
    revisions: Vec<GlobalRevision>,
}

/// Location of one transaction record in the log file.
#[derive(Debug, Clone, Copy)]
struct RevLoc {
    serial: Serial,
    offset: u64,
    len: u32,
}

#[derive(Default)]
struct Index {
    /// Per-object revision locations, ordered by serial ascending.
    /// Imports of old history may land after live writes of the same
    /// object, so insertion is position-based, not append.
    by_oid: HashMap<GlobalOid, Vec<RevLoc>>,
    /// `(source, source serial) -> transaction id` of the import commit.
    provenance: HashMap<(SourceId, Serial), Serial>,
    /// Highest source serial imported per source.
    imported: HashMap<SourceId, Serial>,
    last_serial: Serial,
    next_oid: u64,
    txn_count: u64,
    /// End of the last intact record; appends go here.
    tail: u64,
}

impl Index {
    fn absorb_commit(
        &mut self,
        provenance: Option<(SourceId, Serial)>,
        oids: &[GlobalOid],
        loc: RevLoc,
    ) {
        for &oid in oids {
            let locs = self.by_oid.entry(oid).or_default();
            let at = locs.partition_point(|l| l.serial < loc.serial);
            locs.insert(at, loc);
        }
        if let Some((source, src_serial)) = provenance {
            self.provenance.insert((source.clone(), src_serial), loc.serial);
            let high = self.imported.entry(source).or_insert(src_serial);
            *high = (*high).max(src_serial);
        }
        self.last_serial = self.last_serial.max(loc.serial);
        self.txn_count += 1;
    }

    fn apply_reclaim(&mut self, oid: GlobalOid, keep: Serial) -> u64 {
        let Some(locs) = self.by_oid.get_mut(&oid) else {
            return 0;
        };
        // Retain the newest revision at or before `keep`.
        let cut = locs.partition_point(|l| l.serial <= keep).saturating_sub(1);
        locs.drain(..cut);
        cut as u64
    }
}

pub struct FileDestination {
    path: PathBuf,
    serial_floor: Serial,
    index: RwLock<Index>,
}

impl FileDestination {
    /// Open the store log, creating it if missing. `oid_floor` and
    /// `serial_floor` are minimums: the scan raises the allocation
    /// positions above anything already in the log.
    pub async fn open(
        path: impl Into<PathBuf>,
        oid_floor: GlobalOid,
        serial_floor: Serial,
    ) -> DroverResult<Self> {
        let path = path.into();
        let scan_path = path.clone();
        let mut index = tokio::task::spawn_blocking(move || scan_store(&scan_path))
            .await
            .map_err(|e| DroverError::Internal(format!("store scan join: {e}")))??;
        index.next_oid = index.next_oid.max(oid_floor.raw());

        info!(
            "destination: opened {} ({} transactions, {} objects, head serial {})",
            path.display(),
            index.txn_count,
            index.by_oid.len(),
            index.last_serial
        );
        Ok(Self {
            path,
            serial_floor,
            index: RwLock::new(index),
        })
    }

    /// Encode a record and append it durably at the tail. Callers hold
    /// the index write lock for the whole commit, so appends serialize.
    async fn append_record(
        &self,
        index: &mut Index,
        record: &StoredRecord,
    ) -> DroverResult<(u64, u32)> {
        let payload = bincode::serialize(record)
            .map_err(|e| DroverError::Internal(format!("store encode: {e}")))?;
        let len = payload.len() as u32;
        let frame = encode_frame(RECORD_MAGIC, &payload);

        let path = self.path.clone();
        let offset = index.tail;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&frame)?;
            file.sync_all()
        })
        .await
        .map_err(|e| DroverError::Internal(format!("store append join: {e}")))??;

        index.tail = offset + frame_size(len) as u64;
        Ok((offset, len))
    }

    async fn fetch(&self, loc: RevLoc) -> DroverResult<StoredTxn> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_record(&path, loc))
            .await
            .map_err(|e| DroverError::Internal(format!("store read join: {e}")))?
    }

    fn state_from(&self, txn: &StoredTxn, oid: GlobalOid) -> DroverResult<ObjectState> {
        let rev = txn
            .revisions
            .iter()
            .find(|r| r.oid == oid)
            .ok_or_else(|| {
                DroverError::Corrupt(format!(
                    "record at serial {} lost oid {} in {}",
                    txn.serial,
                    oid,
                    self.path.display()
                ))
            })?;
        if !rev.verify() {
            return Err(DroverError::Corrupt(format!(
                "checksum mismatch for oid {} at serial {} in {}",
                oid,
                txn.serial,
                self.path.display()
            )));
        }
        Ok(ObjectState {
            oid,
            serial: txn.serial,
            data: rev.data.clone(),
            refs: rev.refs.clone(),
        })
    }
}

#[async_trait]
impl DestinationClient for FileDestination {
    fn kind(&self) -> &str {
        "file"
    }

    async fn read(&self, oid: GlobalOid, at: Option<Serial>) -> DroverResult<Option<ObjectState>> {
        let loc = {
            let index = self.index.read().await;
            let Some(locs) = index.by_oid.get(&oid) else {
                return Ok(None);
            };
            let found = match at {
                Some(at) => locs.iter().rev().find(|l| l.serial <= at),
                None => locs.last(),
            };
            match found {
                Some(loc) => *loc,
                None => return Ok(None),
            }
        };
        let txn = self.fetch(loc).await?;
        Ok(Some(self.state_from(&txn, oid)?))
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
        let mut index = self.index.write().await;
        if let Some(prov) = &batch.provenance {
            if let Some(&tid) = index.provenance.get(prov) {
                debug!(
                    "destination: provenance ({}, {}) already committed as {}",
                    prov.0, prov.1, tid
                );
                return Ok(tid);
            }
        }
        let serial = match batch.serial {
            Some(s) => s,
            None => self.serial_floor.max(index.last_serial.next()),
        };
        let touched: Vec<GlobalOid> = batch.revisions.iter().map(|r| r.oid).collect();
        let provenance = batch.provenance.clone();
        let record = StoredRecord::Txn(StoredTxn {
            serial,
            provenance: batch.provenance,
            meta: batch.meta,
            revisions: batch.revisions,
        });
        let (offset, len) = self.append_record(&mut index, &record).await?;
        index.absorb_commit(provenance, &touched, RevLoc { serial, offset, len });
        debug!("destination: committed serial {}", serial);
        Ok(serial)
    }

    async fn imported_serial(&self, source: &SourceId) -> DroverResult<Option<Serial>> {
        Ok(self.index.read().await.imported.get(source).copied())
    }

    async fn allocate_oids(&self, count: u64) -> DroverResult<GlobalOid> {
        let mut index = self.index.write().await;
        let base = index.next_oid;
        let next = base
            .checked_add(count)
            .ok_or_else(|| DroverError::Internal("global oid space exhausted".into()))?;
        self.append_record(&mut index, &StoredRecord::Alloc { base, count })
            .await?;
        index.next_oid = next;
        debug!("destination: reserved oids [{base}, {next})");
        Ok(GlobalOid::new(base))
    }

    async fn history(&self, oid: GlobalOid, limit: usize) -> DroverResult<Vec<ObjectState>> {
        let locs: Vec<RevLoc> = {
            let index = self.index.read().await;
            match index.by_oid.get(&oid) {
                Some(locs) => locs.iter().rev().take(limit).copied().collect(),
                None => return Ok(Vec::new()),
            }
        };
        let mut out = Vec::with_capacity(locs.len());
        for loc in locs {
            let txn = self.fetch(loc).await?;
            out.push(self.state_from(&txn, oid)?);
        }
        Ok(out)
    }

    async fn reclaim_history(&self, oid: GlobalOid, keep: Serial) -> DroverResult<u64> {
        let mut index = self.index.write().await;
        let cut = match index.by_oid.get(&oid) {
            Some(locs) => locs.partition_point(|l| l.serial <= keep).saturating_sub(1),
            None => 0,
        };
        if cut == 0 {
            return Ok(0);
        }
        // Tombstone first: the masking must survive a restart.
        self.append_record(&mut index, &StoredRecord::Reclaim { oid, keep })
            .await?;
        let dropped = index.apply_reclaim(oid, keep);
        info!("destination: reclaimed {} revisions of oid {}", dropped, oid);
        Ok(dropped)
    }

    async fn last_serial(&self) -> DroverResult<Serial> {
        Ok(self.index.read().await.last_serial)
    }
}

fn scan_store(path: &Path) -> DroverResult<Index> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let mut file = fs::File::create(path)?;
            file.write_all(&file_header(STORE_MAGIC, STORE_VERSION))?;
            file.sync_all()?;
            info!("destination: created empty store at {}", path.display());
            return Ok(Index {
                tail: FILE_HEADER_SIZE as u64,
                ..Index::default()
            });
        }
        Err(e) => return Err(e.into()),
    };

    check_header(&data, STORE_MAGIC, STORE_VERSION)
        .map_err(|why| DroverError::Corrupt(format!("store {}: {}", path.display(), why)))?;

    let mut index = Index {
        tail: FILE_HEADER_SIZE as u64,
        ..Index::default()
    };
    let mut pos = FILE_HEADER_SIZE;
    while pos < data.len() {
        match parse_frame(RECORD_MAGIC, &data[pos..]) {
            Ok((payload, total)) => {
                let record: StoredRecord = bincode::deserialize(payload).map_err(|e| {
                    DroverError::Corrupt(format!(
                        "store {} at offset {}: undecodable record: {}",
                        path.display(),
                        pos,
                        e
                    ))
                })?;
                match record {
                    StoredRecord::Txn(txn) => {
                        let oids: Vec<GlobalOid> =
                            txn.revisions.iter().map(|r| r.oid).collect();
                        let loc = RevLoc {
                            serial: txn.serial,
                            offset: pos as u64,
                            len: payload.len() as u32,
                        };
                        index.absorb_commit(txn.provenance, &oids, loc);
                    }
                    StoredRecord::Alloc { base, count } => {
                        index.next_oid = index.next_oid.max(base.saturating_add(count));
                    }
                    StoredRecord::Reclaim { oid, keep } => {
                        index.apply_reclaim(oid, keep);
                    }
                }
                pos += total;
                index.tail = pos as u64;
            }
            Err(FrameError::Torn) => {
                warn!(
                    "destination: dropping torn record at offset {} in {}",
                    pos,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(pos as u64)?;
                file.sync_all()?;
                break;
            }
            Err(FrameError::Corrupt(why)) => {
                return Err(DroverError::Corrupt(format!(
                    "store {} at offset {}: {}",
                    path.display(),
                    pos,
                    why
                )));
            }
        }
    }
    Ok(index)
}

fn read_record(path: &Path, loc: RevLoc) -> DroverResult<StoredTxn> {
    let total = frame_size(loc.len);
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(loc.offset))?;
    let mut buf = vec![0u8; total];
    file.read_exact(&mut buf)?;
    let (payload, _) = parse_frame(RECORD_MAGIC, &buf).map_err(|_| {
        DroverError::Corrupt(format!(
            "record at offset {} in {}",
            loc.offset,
            path.display()
        ))
    })?;
    match bincode::deserialize(payload) {
        Ok(StoredRecord::Txn(txn)) => Ok(txn),
        Ok(_) => Err(DroverError::Corrupt(format!(
            "record at offset {} in {} is not a transaction",
            loc.offset,
            path.display()
        ))),
        Err(e) => Err(DroverError::Corrupt(format!(
            "record at offset {} in {}: {}",
            loc.offset,
            path.display(),
            e
        ))),
    }
}
