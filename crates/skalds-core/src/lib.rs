//! # skalds-core
//!
//! Shared foundation for the Skalds orchestration platform.
//!
//! This crate provides:
//!
//! - **Domain model**: tasks with a validated lifecycle state machine,
//!   skald fleet types, control-event payloads, heartbeat semantics
//! - **Cache adapter**: typed operations on the shared cache (Redis in
//!   production, in-memory for tests) including per-hash-field TTLs
//! - **Identifiers**: opaque, strongly-typed skald and task ids
//! - **Clock**: injectable time source so monitors are testable under
//!   virtual time
//! - **Observability**: logging initialization and span helpers
//!
//! ## Core Concepts
//!
//! - **Skald**: a fleet member (executor node) that runs task workers and
//!   registers itself in the shared cache
//! - **Task**: a unit of work with a persisted lifecycle, executed by a
//!   task worker on a skald
//! - **Heartbeat**: an integer counter a worker writes to the cache; its
//!   value encodes both progress and terminal outcome

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod clock;
pub mod error;
pub mod id;
pub mod model;
pub mod observability;

pub use cache::{CacheBackend, MemoryCacheBackend, RedisCacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{SkaldId, TaskId};
pub use model::event::{EventTopic, TaskEventPayload};
pub use model::skald::{SkaldKind, SkaldStatus};
pub use model::task::{Task, TaskLifecycleStatus, TaskMode, heartbeat};
