//! Tunable operational defaults for the migration adapter.
//!
//! These are starting points that can be overridden per deployment in the
//! adapter configuration; invariant values (OID widths, checksum sizes)
//! live with the types that own them.

// ─── Importer Tuning ────────────────────────────────────────────────────────

/// Transactions pulled from a source log per import round.
pub const DEFAULT_IMPORT_BATCH_TXNS: usize = 64;

/// Pause between import rounds (milliseconds). Zero means run flat out.
pub const DEFAULT_IMPORT_THROTTLE_MS: u64 = 0;

/// Initial backoff after a transient source or destination failure
/// (milliseconds). Doubles per consecutive failure.
pub const DEFAULT_IMPORT_RETRY_BASE_MS: u64 = 200;

/// Backoff ceiling for import retries (milliseconds).
pub const DEFAULT_IMPORT_RETRY_MAX_MS: u64 = 10_000;

// ─── Writeback Tuning ───────────────────────────────────────────────────────

/// Queued records per source drainer before commit acknowledgement blocks.
pub const DEFAULT_WRITEBACK_CHANNEL_SIZE: usize = 256;

/// Delivery attempts per writeback record before it is dropped with an
/// alert.
pub const DEFAULT_WRITEBACK_MAX_ATTEMPTS: u32 = 5;

/// Delay between writeback delivery attempts (milliseconds).
pub const DEFAULT_WRITEBACK_RETRY_DELAY_MS: u64 = 500;

// ─── Completion Detection ───────────────────────────────────────────────────

/// Interval between completion checks while imports are draining
/// (milliseconds).
pub const DEFAULT_COMPLETION_POLL_INTERVAL_MS: u64 = 1_000;

// ─── OID Allocation ─────────────────────────────────────────────────────────

/// Extra OID slots reserved above a writable source's highest existing OID,
/// so transactions written back to it can create new native objects without
/// leaving the source's global range.
pub const DEFAULT_RANGE_HEADROOM: u64 = 1 << 16;

/// Native OIDs fetched from the destination per allocation round trip.
/// The facade hands them out one at a time from this local chunk.
pub const DEFAULT_OID_CHUNK: u64 = 64;
