//! # Change Feed Reference Store
//!
//! In-memory document store with a partitioned, latest-version change feed.
//!
//! This crate provides:
//! - Documents routed to partition ranges by partition key
//! - Per-range LSN assignment and logical `_ts` / `crts` timestamps
//! - Wire format negotiation (enriched `{ current, metadata }` entries)
//! - Log truncation, which expires old continuations
//! - Fault injection for transient and fatal read errors
//!
//! The store implements the engine's `ChangeFeedSource`, so a consumer can
//! run against it unchanged.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod log;
mod store;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use log::{LogEntry, OperationKind, PartitionLog, ReadPosition};
pub use store::{MemoryDocumentStore, WriteReceipt};
