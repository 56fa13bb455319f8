//! # drover
//!
//! Storage adapter that lets a distributed object store take over live
//! traffic from legacy single-node object databases on day one, while
//! their history is imported in the background. Reads are routed to
//! whichever side holds the data; writes land on the new store and are
//! optionally mirrored back so the migration can still be aborted.
//!
//! The pieces, in the order a request meets them:
//! - [`table`]: merges the legacy OID namespaces into one global space
//! - [`router`]: serves each read from the new store or a legacy source
//! - [`importer`]: streams legacy history into the new store
//! - [`writeback`]: mirrors live commits back into their origin source
//! - [`completion`]: signals when every source is fully imported
//! - [`adapter`]: the facade wiring all of the above together

pub mod adapter;
pub mod completion;
pub mod config;
pub mod cursor;
pub mod destination;
pub mod fsutil;
pub mod importer;
pub mod router;
pub mod source;
pub mod table;
pub mod writeback;
