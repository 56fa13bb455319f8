/// Error taxonomy for the migration adapter.
///
/// Configuration problems are fatal at startup and never leave a partially
/// initialized adapter behind. `SourceUnavailable` is the only transient
/// class: background workers retry it with backoff, foreground reads
/// surface it immediately.

use thiserror::Error;

use crate::oid::{GlobalOid, LocalOid, Serial, SourceId};

/// Result type alias for adapter operations.
pub type DroverResult<T> = Result<T, DroverError>;

/// Unified error type for all adapter operations.
#[derive(Debug, Error)]
pub enum DroverError {
    /// Invalid OID mapping configuration, rejected eagerly at startup.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// An OID outside the resolved translation table.
    #[error("unmapped reference: {0}")]
    UnmappedReference(String),

    /// A legacy source backend could not be reached.
    #[error("source '{source}' unavailable: {reason}")]
    SourceUnavailable { source: SourceId, reason: String },

    /// A writeback record could not be delivered to its origin source.
    #[error("writeback of transaction {tid} to source '{source}' failed: {reason}")]
    WritebackDelivery {
        source: SourceId,
        tid: Serial,
        reason: String,
    },

    /// The persisted import cursor disagrees with the source log or the
    /// destination state. Fatal for that source's importer.
    #[error("import cursor for source '{source}' is corrupt: {reason}")]
    CursorCorruption { source: SourceId, reason: String },

    /// No revision of the object satisfies the read.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Writeback-side mutation attempted on a read-only source.
    #[error("source '{0}' is read-only")]
    ReadOnlySource(SourceId),

    /// Operation gated until every source is fully imported.
    #[error("{0} is unsupported while import is incomplete")]
    Unsupported(&'static str),

    /// The adapter is shutting down; the operation was abandoned.
    #[error("adapter is shutting down")]
    Shutdown,

    /// Persisted or transmitted data failed to decode or verify.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the adapter itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DroverError {
    /// An unmapped global OID.
    pub fn unmapped_global(oid: GlobalOid) -> Self {
        Self::UnmappedReference(format!("global oid {oid}"))
    }

    /// A local OID outside its source's mapped span.
    pub fn unmapped_local(source: &SourceId, oid: LocalOid) -> Self {
        Self::UnmappedReference(format!("oid {oid} in source '{source}'"))
    }

    /// Whether background workers should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }
}

/// Startup-time validation failures of the OID mapping configuration.
///
/// Each variant names one way the mount forest or the global assignment can
/// be invalid. Detection is eager; the first failure aborts construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file does not parse: {0}")]
    Parse(String),

    #[error("no source databases configured")]
    NoSources,

    #[error("source '{0}' is configured twice")]
    DuplicateSource(SourceId),

    #[error("source '{by}' mounts unconfigured source '{referenced}'")]
    UnknownSource { referenced: SourceId, by: SourceId },

    #[error("cyclic mount graph: {path}")]
    CyclicMounts { path: String },

    #[error("source '{0}' is mounted more than once")]
    DoubleMount(SourceId),

    #[error(
        "mount at oid {local} in source '{container}' targets oid {target_oid} \
         outside source '{target}'"
    )]
    DanglingMount {
        container: SourceId,
        local: LocalOid,
        target: SourceId,
        target_oid: LocalOid,
    },

    #[error("global OID ranges of sources '{a}' and '{b}' overlap")]
    RangeOverlap { a: SourceId, b: SourceId },

    #[error("entry oid {oid} is outside source '{source}'")]
    BadEntryOid { source: SourceId, oid: LocalOid },

    #[error("source '{source}' declares entry oid both as {a} and {b}")]
    ConflictingEntryOid {
        source: SourceId,
        a: LocalOid,
        b: LocalOid,
    },

    #[error("mount position {oid} is outside source '{container}'")]
    BadMountPosition { container: SourceId, oid: LocalOid },

    #[error("source '{0}' is empty; refusing to import an empty storage")]
    EmptySource(SourceId),

    #[error("source '{source}' names unknown backend kind '{kind}'")]
    UnknownBackend { source: SourceId, kind: String },

    #[error("source '{0}' uses a file backend but configures no path")]
    MissingPath(SourceId),

    #[error("destination names unknown backend kind '{0}'")]
    UnknownDestination(String),

    #[error("destination uses a file backend but configures no path")]
    MissingDestinationPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = DroverError::SourceUnavailable {
            source: SourceId::new("root"),
            reason: "connection refused".into(),
        };
        assert!(err.is_transient());
        assert!(!DroverError::Shutdown.is_transient());
        assert!(!DroverError::unmapped_global(GlobalOid::new(7)).is_transient());
    }

    #[test]
    fn test_config_error_is_descriptive() {
        let err = ConfigError::DanglingMount {
            container: SourceId::new("root"),
            local: LocalOid::new(421),
            target: SourceId::new("foo"),
            target_oid: LocalOid::new(999),
        };
        let msg = err.to_string();
        assert!(msg.contains("root"));
        assert!(msg.contains("foo"));
    }

    #[test]
    fn test_unmapped_helpers() {
        let err = DroverError::unmapped_local(&SourceId::new("foo"), LocalOid::new(5));
        assert!(matches!(err, DroverError::UnmappedReference(_)));
        assert!(err.to_string().contains("foo"));
    }
}
