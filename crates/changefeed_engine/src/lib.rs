//! # Change Feed Engine
//!
//! Consumer engine for document store change feeds.
//!
//! This crate provides:
//! - Cursor persistence (in-memory and atomic file stores)
//! - Feed polling with deadlines and transient-error classification
//! - In-order dispatch of changes to an application handler
//! - A per-range consumption loop (poll → dispatch → persist → advance)
//! - Exponential backoff with jitter
//! - A processor running one loop per partition range
//!
//! ## Architecture
//!
//! Each partition range is consumed by its own [`ConsumptionLoop`], spawned
//! as an independent tokio task by [`FeedProcessor`]. A loop reads a page
//! after its cursor, hands every change to the handler in order, saves the
//! next cursor and only then advances.
//!
//! ## Key Invariants
//!
//! - Delivery is at-least-once: a batch is redelivered until handled in full
//! - A cursor is committed only after its batch was handled and saved
//! - Changes within a range are delivered in store order
//! - An expired cursor is never silent: the loop reports the reset

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod consumer;
mod cursor_store;
mod dispatcher;
mod error;
mod poller;
mod processor;
mod source;

pub use backoff::Backoff;
pub use config::{BackoffConfig, FeedConfig};
pub use consumer::{
    ConsumptionLoop, FeedEvent, FeedStats, LoopState, LoopStatus, RangeOutcome, StopReason,
};
pub use cursor_store::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use dispatcher::{dispatch, ChangeHandler, DispatchReport};
pub use error::{
    ConfigError, DispatchError, FeedError, FeedResult, HandlerError, PersistError, SourceError,
};
pub use poller::{FeedPoller, PollResult};
pub use processor::FeedProcessor;
pub use source::{ChangeFeedSource, MockSource};

pub use tokio_util::sync::CancellationToken;
