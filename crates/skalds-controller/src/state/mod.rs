//! In-memory state stores: the controller's authoritative live view.
//!
//! Two concurrent maps with snapshot readers. The Skald Monitor writes
//! [`SkaldStore`]; the Task Monitor writes [`TaskStore`]; the dispatcher,
//! reconciler, event fanout, and query API only read. Every mutation
//! happens under the store's write lock as a whole-record replacement (or
//! a closure-merge for partial updates), and every change is fanned out
//! on a broadcast channel for server-push subscribers.

pub mod skald_store;
pub mod task_store;

pub use skald_store::{SkaldRecord, SkaldStore, SkaldStoreEvent};
pub use task_store::{TaskRecord, TaskStore, TaskStoreEvent};
