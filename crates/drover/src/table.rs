//! OID translation table.
//!
//! Built once at startup from the resolved configuration plus each
//! backend's OID span, then shared read-only by every worker. Each source
//! owns one contiguous global range `[base, base + span)` and a local OID
//! maps affinely into it. A mount position is an alias: resolving it
//! chases the mount chain and yields the hosting source's global OID, so
//! the mount position's own slot in the container range is a hole that no
//! resolve ever produces.
//!
//! Globals at or above [`TranslationTable::floor`] belong to no source;
//! they are native destination OIDs allocated after go-live.

use std::collections::HashMap;

use drover_proto::error::{ConfigError, DroverError, DroverResult};
use drover_proto::oid::{GlobalOid, LocalOid, SourceId};

use crate::config::ResolvedConfig;

#[derive(Debug)]
struct RangeEntry {
    source: SourceId,
    base: GlobalOid,
    span: u64,
    entry: LocalOid,
    /// Mount positions in this source, pre-chased to their hosting
    /// `(range index, local oid)` pair.
    mounts: HashMap<LocalOid, (usize, LocalOid)>,
    read_only: bool,
}

/// Immutable `(source, local) <-> global` mapping.
#[derive(Debug)]
pub struct TranslationTable {
    /// Declaration order.
    ranges: Vec<RangeEntry>,
    by_source: HashMap<SourceId, usize>,
    /// `(base, range index)` sorted by base, for inversion.
    by_base: Vec<(u64, usize)>,
    /// First global OID above every source range.
    floor: GlobalOid,
}

impl TranslationTable {
    /// Build the table. `spans` gives each source's OID span (highest
    /// existing OID + 1, plus growth headroom for writable sources).
    pub fn build(
        cfg: &ResolvedConfig,
        spans: &HashMap<SourceId, u64>,
    ) -> Result<Self, ConfigError> {
        if cfg.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        // Place explicit bases first, then pack the rest in declaration
        // order into the lowest gaps. Ranges must stay disjoint.
        let mut placed: Vec<(u64, u64, usize)> = Vec::new(); // (base, end, idx)
        for (idx, src) in cfg.sources.iter().enumerate() {
            let span = *spans.get(&src.id).unwrap_or(&0);
            if span == 0 {
                return Err(ConfigError::EmptySource(src.id.clone()));
            }
            if let Some(base) = src.base_oid {
                let end = base
                    .raw()
                    .checked_add(span)
                    .ok_or_else(|| ConfigError::RangeOverlap {
                        a: src.id.clone(),
                        b: src.id.clone(),
                    })?;
                placed.push((base.raw(), end, idx));
            }
        }
        placed.sort_unstable();
        for pair in placed.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(ConfigError::RangeOverlap {
                    a: cfg.sources[pair[0].2].id.clone(),
                    b: cfg.sources[pair[1].2].id.clone(),
                });
            }
        }
        let mut bases: Vec<Option<u64>> = vec![None; cfg.sources.len()];
        for &(base, _, idx) in &placed {
            bases[idx] = Some(base);
        }
        let mut next = 0u64;
        for (idx, src) in cfg.sources.iter().enumerate() {
            if bases[idx].is_some() {
                continue;
            }
            let span = spans[&src.id];
            loop {
                let end = next.checked_add(span).ok_or_else(|| ConfigError::RangeOverlap {
                    a: src.id.clone(),
                    b: src.id.clone(),
                })?;
                match placed.iter().find(|&&(b, e, _)| b < end && next < e) {
                    Some(&(_, e, _)) => next = e,
                    None => {
                        bases[idx] = Some(next);
                        next = end;
                        break;
                    }
                }
            }
        }

        let mut by_source = HashMap::new();
        let mut ranges: Vec<RangeEntry> = Vec::with_capacity(cfg.sources.len());
        let mut floor = 0u64;
        for (idx, src) in cfg.sources.iter().enumerate() {
            let span = spans[&src.id];
            if src.entry_oid.raw() >= span {
                return Err(ConfigError::BadEntryOid {
                    source: src.id.clone(),
                    oid: src.entry_oid,
                });
            }
            let base = bases[idx].unwrap_or(0);
            floor = floor.max(base + span);
            by_source.insert(src.id.clone(), idx);
            ranges.push(RangeEntry {
                source: src.id.clone(),
                base: GlobalOid::new(base),
                span,
                entry: src.entry_oid,
                mounts: HashMap::new(),
                read_only: src.read_only,
            });
        }

        // Resolve mount edges to their hosting pair. The config layer has
        // already rejected cyclic forests, so every chase terminates.
        for (idx, src) in cfg.sources.iter().enumerate() {
            for m in &src.mounts {
                if m.at.raw() >= ranges[idx].span {
                    return Err(ConfigError::BadMountPosition {
                        container: src.id.clone(),
                        oid: m.at,
                    });
                }
                let (mut tidx, mut tlocal) = (by_source[&m.target], m.target_oid);
                let mut hops = 0;
                while let Some(pos) = cfg.sources[tidx]
                    .mounts
                    .iter()
                    .find(|n| n.at == tlocal)
                {
                    tidx = by_source[&pos.target];
                    tlocal = pos.target_oid;
                    hops += 1;
                    if hops > cfg.sources.len() {
                        return Err(ConfigError::CyclicMounts {
                            path: format!("via mount at {} in '{}'", m.at, src.id),
                        });
                    }
                }
                if tlocal.raw() >= ranges[tidx].span {
                    return Err(ConfigError::DanglingMount {
                        container: src.id.clone(),
                        local: m.at,
                        target: ranges[tidx].source.clone(),
                        target_oid: tlocal,
                    });
                }
                ranges[idx].mounts.insert(m.at, (tidx, tlocal));
            }
        }

        let mut by_base: Vec<(u64, usize)> =
            ranges.iter().enumerate().map(|(i, r)| (r.base.raw(), i)).collect();
        by_base.sort_unstable();

        Ok(Self {
            ranges,
            by_source,
            by_base,
            floor: GlobalOid::new(floor),
        })
    }

    /// Map a source-local OID to its global OID, chasing mount aliases.
    pub fn resolve(&self, source: &SourceId, local: LocalOid) -> DroverResult<GlobalOid> {
        let idx = *self
            .by_source
            .get(source)
            .ok_or_else(|| DroverError::unmapped_local(source, local))?;
        let (idx, local) = match self.ranges[idx].mounts.get(&local) {
            Some(&(tidx, tlocal)) => (tidx, tlocal),
            None => (idx, local),
        };
        let r = &self.ranges[idx];
        if local.raw() >= r.span {
            return Err(DroverError::unmapped_local(&r.source, local));
        }
        Ok(r.base.offset(local.raw()))
    }

    /// Map a global OID back to the `(source, local)` pair hosting it.
    ///
    /// Mount-position slots are holes: no resolve produces them, so
    /// inverting one fails the same way as any unmapped global.
    pub fn invert(&self, global: GlobalOid) -> DroverResult<(SourceId, LocalOid)> {
        let g = global.raw();
        let pos = self.by_base.partition_point(|&(base, _)| base <= g);
        if pos == 0 {
            return Err(DroverError::unmapped_global(global));
        }
        let (base, idx) = self.by_base[pos - 1];
        let r = &self.ranges[idx];
        if g - base >= r.span {
            return Err(DroverError::unmapped_global(global));
        }
        let local = LocalOid::new(g - base);
        if r.mounts.contains_key(&local) {
            return Err(DroverError::unmapped_global(global));
        }
        Ok((r.source.clone(), local))
    }

    /// Global OID of a source's entry object.
    pub fn entry_global(&self, source: &SourceId) -> DroverResult<GlobalOid> {
        let idx = *self
            .by_source
            .get(source)
            .ok_or_else(|| DroverError::unmapped_local(source, LocalOid::new(0)))?;
        self.resolve(source, self.ranges[idx].entry)
    }

    /// First global OID above every source range. Native destination
    /// allocations start here.
    pub fn floor(&self) -> GlobalOid {
        self.floor
    }

    /// Whether a global OID was created natively in the destination after
    /// go-live rather than mapped from a legacy source. Every source range
    /// sits below the floor, so a range test is enough.
    pub fn is_native(&self, global: GlobalOid) -> bool {
        global >= self.floor
    }

    /// The global range `[base, base + span)` of a source.
    pub fn range_of(&self, source: &SourceId) -> Option<(GlobalOid, u64)> {
        let idx = *self.by_source.get(source)?;
        let r = &self.ranges[idx];
        Some((r.base, r.span))
    }

    /// Whether `local` is a mount position in `source`. The legacy record
    /// stored there is the mount itself, not object data.
    pub fn is_mount_position(&self, source: &SourceId, local: LocalOid) -> bool {
        match self.by_source.get(source) {
            Some(&idx) => self.ranges[idx].mounts.contains_key(&local),
            None => false,
        }
    }

    /// The mount position in `source` aliasing `global`, if there is one.
    /// This is how a legacy database names an object another source owns.
    pub fn alias_position(&self, source: &SourceId, global: GlobalOid) -> Option<LocalOid> {
        let idx = *self.by_source.get(source)?;
        for (&at, &(tidx, tlocal)) in &self.ranges[idx].mounts {
            if self.ranges[tidx].base.offset(tlocal.raw()) == global {
                return Some(at);
            }
        }
        None
    }

    pub fn is_read_only(&self, source: &SourceId) -> bool {
        match self.by_source.get(source) {
            Some(&idx) => self.ranges[idx].read_only,
            None => true,
        }
    }

    /// Configured sources in declaration order.
    pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
        self.ranges.iter().map(|r| &r.source)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
