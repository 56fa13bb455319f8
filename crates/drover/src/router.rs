//! Read router.
//!
//! Decides, per read, whether the answer lives on the destination store or
//! must be proxied from a legacy source. The decision key is the source's
//! import cursor: positions at or below it are committed on the
//! destination, so the cursor check against a published view is all the
//! synchronization a read needs. Proxied states are rewritten so callers
//! only ever observe global OIDs, both in the object identity and in its
//! embedded references.
//!
//! Serial space is split at the live floor fixed at go-live: serials below
//! it name legacy-era transactions (imported at their original positions),
//! serials at or above it name post-go-live commits that exist only on the
//! destination. A pinned read in the live era prefers a live revision and
//! otherwise falls back to the frozen legacy head.
//!
//! Source unavailability surfaces immediately: a reader is never handed
//! stale destination data in place of an unreachable source.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use drover_proto::error::{DroverError, DroverResult};
use drover_proto::oid::{GlobalOid, LocalOid, Serial, SourceId};
use drover_proto::txn::ObjectState;

use crate::cursor::{CursorSet, CursorView};
use crate::destination::DestinationClient;
use crate::source::{SourceBackend, SourceRevision};
use crate::table::TranslationTable;

pub struct ReadRouter {
    table: Arc<TranslationTable>,
    cursors: Arc<CursorSet>,
    sources: HashMap<SourceId, Arc<dyn SourceBackend>>,
    destination: Arc<dyn DestinationClient>,
    /// First serial that can belong to a post-go-live commit.
    live_floor: Serial,
}

fn not_found(global: GlobalOid, at: Option<Serial>) -> DroverError {
    match at {
        Some(at) => DroverError::ObjectNotFound(format!("oid {global} at serial {at}")),
        None => DroverError::ObjectNotFound(format!("oid {global}")),
    }
}

impl ReadRouter {
    pub fn new(
        table: Arc<TranslationTable>,
        cursors: Arc<CursorSet>,
        sources: HashMap<SourceId, Arc<dyn SourceBackend>>,
        destination: Arc<dyn DestinationClient>,
        live_floor: Serial,
    ) -> Self {
        Self {
            table,
            cursors,
            sources,
            destination,
            live_floor,
        }
    }

    /// Route one read. `at` pins the revision to the newest at or before
    /// that serial; `None` asks for the latest.
    pub async fn read(&self, global: GlobalOid, at: Option<Serial>) -> DroverResult<ObjectState> {
        if self.table.is_native(global) {
            // Created after go-live; never existed in any source.
            return match self.destination.read(global, at).await? {
                Some(state) => Ok(state),
                None => Err(not_found(global, at)),
            };
        }
        let (source, local) = self.table.invert(global)?;
        let view = self.view_of(&source)?;
        if view.is_complete() {
            // Steady state: the whole source is on the destination.
            return match self.destination.read(global, at).await? {
                Some(state) => Ok(state),
                None => Err(not_found(global, at)),
            };
        }
        match at {
            Some(at) => self.read_pinned(global, &source, local, view, at).await,
            None => self.read_latest(global, &source, local, view).await,
        }
    }

    async fn read_pinned(
        &self,
        global: GlobalOid,
        source: &SourceId,
        local: LocalOid,
        view: &CursorView,
        at: Serial,
    ) -> DroverResult<ObjectState> {
        if view.covers(at) {
            // Every transaction at or below `at` is already committed on
            // the destination, so its answer is authoritative.
            return match self.destination.read(global, Some(at)).await? {
                Some(state) => Ok(state),
                None => Err(not_found(global, Some(at))),
            };
        }
        if at >= self.live_floor {
            // The pin reaches into the live era; a post-go-live revision
            // shadows anything legacy. An imported revision below the
            // floor is not trustworthy here, later legacy history may
            // still be missing.
            if let Some(state) = self.destination.read(global, Some(at)).await? {
                if state.serial >= self.live_floor {
                    return Ok(state);
                }
            }
        }
        let clamp = at.min(view.end());
        let rev = self.source_of(source)?.read(local, Some(clamp)).await?;
        debug!(
            "router: proxied oid {} from source {} (oid {}) at serial {}",
            global, source, local, rev.serial
        );
        self.rewrite(source, rev, global)
    }

    async fn read_latest(
        &self,
        global: GlobalOid,
        source: &SourceId,
        local: LocalOid,
        view: &CursorView,
    ) -> DroverResult<ObjectState> {
        // A live write is newer than anything a legacy source holds.
        let dest_state = self.destination.read(global, None).await?;
        if let Some(state) = &dest_state {
            if state.serial >= self.live_floor {
                return Ok(state.clone());
            }
        }
        let head = match self.source_of(source)?.head_serial(local).await? {
            // Writeback echoes can grow the log past the frozen head;
            // they mirror live commits already answered above.
            Some(head) => head.min(view.end()),
            None => {
                // Never written in the source at all.
                return match dest_state {
                    Some(state) => Ok(state),
                    None => Err(not_found(global, None)),
                };
            }
        };
        if view.covers(head) {
            // The object's whole legacy history is committed; re-read the
            // destination so the answer observes it.
            return match self.destination.read(global, None).await? {
                Some(state) => Ok(state),
                None => Err(not_found(global, None)),
            };
        }
        let rev = self.source_of(source)?.read(local, Some(view.end())).await?;
        debug!(
            "router: proxied oid {} from source {} (oid {}) at serial {}",
            global, source, local, rev.serial
        );
        self.rewrite(source, rev, global)
    }

    /// Translate a proxied source revision into the global namespace:
    /// tag it with the canonical global OID and rewrite every embedded
    /// reference. An untranslatable reference fails the read.
    fn rewrite(
        &self,
        source: &SourceId,
        rev: SourceRevision,
        global: GlobalOid,
    ) -> DroverResult<ObjectState> {
        let mut refs = Vec::with_capacity(rev.refs.len());
        for r in rev.refs {
            refs.push(self.table.resolve(source, r)?);
        }
        Ok(ObjectState {
            oid: global,
            serial: rev.serial,
            data: rev.data,
            refs,
        })
    }

    fn source_of(&self, id: &SourceId) -> DroverResult<&Arc<dyn SourceBackend>> {
        self.sources
            .get(id)
            .ok_or_else(|| DroverError::Internal(format!("no backend for source '{id}'")))
    }

    fn view_of(&self, id: &SourceId) -> DroverResult<&Arc<CursorView>> {
        self.cursors
            .view(id)
            .ok_or_else(|| DroverError::Internal(format!("no cursor for source '{id}'")))
    }
}
