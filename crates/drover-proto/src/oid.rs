/// Identifier newtypes for the two OID namespaces and the transaction axis.
///
/// A migration deployment juggles three id spaces at once:
/// - every legacy source database has its own dense *local* OID space,
/// - the destination cluster has the single merged *global* OID space,
/// - transactions are ordered by *serials*, which are globally comparable
///   (imported revisions keep their original source serials, live commits
///   are allocated serials above every frozen source log).
///
/// Keeping local and global OIDs as distinct types makes it a compile error
/// to hand a legacy OID to the destination or vice versa.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of one configured legacy source database.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// thiserror's derive treats error-enum fields named `source` as the
// `Error::source` cause, so the variants carrying a `source: SourceId`
// field only compile if `SourceId` itself implements `Error`.
impl std::error::Error for SourceId {}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// An OID inside one source database's private namespace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalOid(pub u64);

impl LocalOid {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for LocalOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalOid({:#x})", self.0)
    }
}

impl fmt::Display for LocalOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for LocalOid {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// An OID in the merged destination namespace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalOid(pub u64);

impl GlobalOid {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The OID `n` positions after this one.
    #[inline]
    pub const fn offset(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Debug for GlobalOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalOid({:#x})", self.0)
    }
}

impl fmt::Display for GlobalOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for GlobalOid {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Position of a transaction in commit order.
///
/// Serial 0 never names a transaction; it is the cursor value of a source
/// whose history has not been touched yet.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(pub u64);

impl Serial {
    pub const ZERO: Serial = Serial(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The serial directly after this one.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({:#x})", self.0)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Serial {
    fn from(v: u64) -> Self {
        Self(v)
    }
}
