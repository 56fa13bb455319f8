//! Adapter configuration.
//!
//! The daemon parses a config file into [`AdapterConfig`] and resolves it
//! once at startup. Resolution checks everything that can be checked
//! without opening a backend: source ids are unique, every mount
//! declaration names a configured source, and the mount graph is a forest.
//! Checks that need backend state (OID spans, entry OIDs in range) happen
//! when the translation table is built.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use drover_proto::defaults;
use drover_proto::error::{ConfigError, DroverResult};
use drover_proto::oid::{GlobalOid, LocalOid, SourceId};

/// Reserved assignment name designating a source's own entry OID.
pub const ENTRY_KEY: &str = "oid";

/// Top-level adapter configuration as parsed from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Where live traffic lands and imported history accumulates.
    pub destination: DestinationConfig,
    /// Mirror post-go-live transactions back into their origin sources.
    #[serde(default)]
    pub writeback: bool,
    /// Import cursors persist here. Unset keeps them in memory, which
    /// restarts the import from scratch on every boot.
    #[serde(default)]
    pub cursor_dir: Option<PathBuf>,
    /// Legacy sources in declaration order. Order is meaningful: it fixes
    /// the deterministic global OID range assignment.
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub tuning: Tuning,
}

/// The destination cluster backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Backend driver name, looked up in the destination registry.
    pub kind: String,
    /// Storage location for file-backed drivers.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// One legacy source database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    /// Backend driver name, looked up in the source registry.
    pub kind: String,
    /// Storage location for file-backed drivers.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// The source's designated entry OID. May also be given as the
    /// reserved `oid` key in `assignments`; default 0.
    #[serde(default)]
    pub entry_oid: Option<u64>,
    /// Explicitly configured base of this source's global OID range.
    /// Unset means the next free range in declaration order.
    #[serde(default)]
    pub base_oid: Option<u64>,
    /// `name -> local oid` assignments. A name matching another configured
    /// source mounts that source's entry object at the named OID here.
    #[serde(default)]
    pub assignments: BTreeMap<String, u64>,
    /// Refuse writeback commits and native OID growth for this source.
    #[serde(default)]
    pub read_only: bool,
}

/// Worker tuning knobs, all optional in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Transactions pulled per import round.
    pub import_batch_txns: usize,
    /// Pause between import rounds (ms). Zero disables throttling.
    pub import_throttle_ms: u64,
    /// Initial import retry backoff (ms).
    pub import_retry_base_ms: u64,
    /// Import retry backoff ceiling (ms).
    pub import_retry_max_ms: u64,
    /// Queue capacity per writeback drainer.
    pub writeback_channel_size: usize,
    /// Delivery attempts before a writeback record is abandoned.
    pub writeback_max_attempts: u32,
    /// Delay between writeback delivery attempts (ms).
    pub writeback_retry_delay_ms: u64,
    /// Completion detector poll interval (ms).
    pub completion_poll_ms: u64,
    /// Extra OID slots above a writable source's highest existing OID.
    pub range_headroom: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            import_batch_txns: defaults::DEFAULT_IMPORT_BATCH_TXNS,
            import_throttle_ms: defaults::DEFAULT_IMPORT_THROTTLE_MS,
            import_retry_base_ms: defaults::DEFAULT_IMPORT_RETRY_BASE_MS,
            import_retry_max_ms: defaults::DEFAULT_IMPORT_RETRY_MAX_MS,
            writeback_channel_size: defaults::DEFAULT_WRITEBACK_CHANNEL_SIZE,
            writeback_max_attempts: defaults::DEFAULT_WRITEBACK_MAX_ATTEMPTS,
            writeback_retry_delay_ms: defaults::DEFAULT_WRITEBACK_RETRY_DELAY_MS,
            completion_poll_ms: defaults::DEFAULT_COMPLETION_POLL_INTERVAL_MS,
            range_headroom: defaults::DEFAULT_RANGE_HEADROOM,
        }
    }
}

/// One resolved mount edge: the object at `at` in the container is
/// provided by `target`'s entry object `target_oid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDecl {
    pub at: LocalOid,
    pub target: SourceId,
    pub target_oid: LocalOid,
}

/// A source after mount resolution.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub id: SourceId,
    pub kind: String,
    pub path: Option<PathBuf>,
    pub entry_oid: LocalOid,
    pub base_oid: Option<GlobalOid>,
    pub mounts: Vec<MountDecl>,
    pub read_only: bool,
}

/// Validated configuration, ready to open backends and build the table.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub destination: DestinationConfig,
    pub writeback: bool,
    pub cursor_dir: Option<PathBuf>,
    /// Declaration order preserved.
    pub sources: Vec<ResolvedSource>,
    pub tuning: Tuning,
}

impl AdapterConfig {
    /// Read and parse a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> DroverResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Validate and derive the mount forest.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut entry_oids: HashMap<SourceId, LocalOid> = HashMap::new();
        for src in &self.sources {
            if entry_oids.contains_key(&src.id) {
                return Err(ConfigError::DuplicateSource(src.id.clone()));
            }
            let entry = match (src.entry_oid, src.assignments.get(ENTRY_KEY)) {
                (Some(a), Some(&b)) if a != b => {
                    return Err(ConfigError::ConflictingEntryOid {
                        source: src.id.clone(),
                        a: LocalOid::new(a),
                        b: LocalOid::new(b),
                    });
                }
                (Some(a), _) => a,
                (None, Some(&b)) => b,
                (None, None) => 0,
            };
            entry_oids.insert(src.id.clone(), LocalOid::new(entry));
        }

        // Derive mount edges and enforce the forest shape: a source is
        // mounted in at most one container.
        let mut mounted_in: HashMap<SourceId, SourceId> = HashMap::new();
        let mut sources = Vec::with_capacity(self.sources.len());
        for src in &self.sources {
            let mut mounts = Vec::new();
            for (name, &at) in &src.assignments {
                if name == ENTRY_KEY {
                    continue;
                }
                let target = SourceId::new(name.as_str());
                let Some(&target_oid) = entry_oids.get(&target) else {
                    return Err(ConfigError::UnknownSource {
                        referenced: target,
                        by: src.id.clone(),
                    });
                };
                if mounted_in.insert(target.clone(), src.id.clone()).is_some() {
                    return Err(ConfigError::DoubleMount(target));
                }
                mounts.push(MountDecl {
                    at: LocalOid::new(at),
                    target,
                    target_oid,
                });
            }
            sources.push(ResolvedSource {
                id: src.id.clone(),
                kind: src.kind.clone(),
                path: src.path.clone(),
                entry_oid: entry_oids[&src.id],
                base_oid: src.base_oid.map(GlobalOid::new),
                mounts,
                read_only: src.read_only,
            });
        }

        // Forest also means no cycles: walk each source's container chain.
        for src in &self.sources {
            let mut seen = HashSet::from([src.id.clone()]);
            let mut chain = vec![src.id.clone()];
            let mut cur = &src.id;
            while let Some(container) = mounted_in.get(cur) {
                chain.push(container.clone());
                if !seen.insert(container.clone()) {
                    let path = chain
                        .iter()
                        .map(SourceId::as_str)
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    return Err(ConfigError::CyclicMounts { path });
                }
                cur = container;
            }
        }

        Ok(ResolvedConfig {
            destination: self.destination.clone(),
            writeback: self.writeback,
            cursor_dir: self.cursor_dir.clone(),
            sources,
            tuning: self.tuning.clone(),
        })
    }
}

impl ResolvedConfig {
    pub fn source(&self, id: &SourceId) -> Option<&ResolvedSource> {
        self.sources.iter().find(|s| &s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str) -> SourceConfig {
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

    fn config(sources: Vec<SourceConfig>) -> AdapterConfig {
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
    }

    #[test]
    fn test_resolve_mounts() {
        let mut root = source("root");
        root.assignments.insert("foo".into(), 421);
        let mut foo = source("foo");
        foo.assignments.insert(ENTRY_KEY.into(), 123);

        let resolved = config(vec![root, foo]).resolve().unwrap();
        assert_eq!(resolved.sources[0].entry_oid, LocalOid::new(0));
        assert_eq!(
            resolved.sources[0].mounts,
            vec![MountDecl {
                at: LocalOid::new(421),
                target: SourceId::new("foo"),
                target_oid: LocalOid::new(123),
            }]
        );
        assert_eq!(resolved.sources[1].entry_oid, LocalOid::new(123));
    }

    #[test]
    fn test_unknown_mount_target() {
        let mut root = source("root");
        root.assignments.insert("ghost".into(), 7);
        let err = config(vec![root]).resolve().unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownSource {
                referenced: SourceId::new("ghost"),
                by: SourceId::new("root"),
            }
        );
    }

    #[test]
    fn test_double_mount_rejected() {
        let mut root = source("root");
        root.assignments.insert("foo".into(), 1);
        let mut other = source("other");
        other.assignments.insert("foo".into(), 2);
        let foo = source("foo");

        let err = config(vec![root, other, foo]).resolve().unwrap_err();
        assert!(matches!(err, ConfigError::DoubleMount { .. }));
    }

    #[test]
    fn test_mount_cycle_rejected() {
        let mut a = source("a");
        a.assignments.insert("b".into(), 1);
        let mut b = source("b");
        b.assignments.insert("a".into(), 1);

        let err = config(vec![a, b]).resolve().unwrap_err();
        assert!(matches!(err, ConfigError::CyclicMounts { .. }));
    }

    #[test]
    fn test_conflicting_entry_oid_rejected() {
        let mut foo = source("foo");
        foo.entry_oid = Some(5);
        foo.assignments.insert(ENTRY_KEY.into(), 6);
        let err = config(vec![foo]).resolve().unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingEntryOid { .. }));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let err = config(vec![source("x"), source("x")]).resolve().unwrap_err();
        assert_eq!(err, ConfigError::DuplicateSource(SourceId::new("x")));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
destination:
  kind: file
  path: /var/lib/drover/destination.db
writeback: true
cursor_dir: /var/lib/drover/cursors
sources:
  - id: root
    kind: file
    path: /var/lib/legacy/root.db
    assignments:
      foo: 421
  - id: foo
    kind: file
    path: /var/lib/legacy/foo.db
    assignments:
      oid: 123
    read_only: true
"#;
        let cfg: AdapterConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.writeback);
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[1].assignments[ENTRY_KEY], 123);
        let resolved = cfg.resolve().unwrap();
        assert!(resolved.sources[1].read_only);
        assert_eq!(resolved.destination.kind, "file");
        assert!(resolved.cursor_dir.is_some());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        use drover_proto::error::DroverError;

        let path = std::env::temp_dir().join("drover_test_config.yaml");
        std::fs::write(
            &path,
            "destination:\n  kind: memory\nsources:\n  - id: a\n    kind: memory\n",
        )
        .unwrap();
        let cfg = AdapterConfig::load(&path).await.unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.destination.kind, "memory");

        std::fs::write(&path, "destination: [not, a, mapping]\n").unwrap();
        let err = AdapterConfig::load(&path).await.unwrap_err();
        assert!(matches!(
            err,
            DroverError::Configuration(ConfigError::Parse(_))
        ));
        std::fs::remove_file(&path).unwrap();

        let missing = std::env::temp_dir().join("drover_test_config_missing.yaml");
        let err = AdapterConfig::load(&missing).await.unwrap_err();
        assert!(matches!(err, DroverError::Io(_)));
    }
}
