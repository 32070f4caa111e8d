//! # skalds-controller
//!
//! The orchestration brain of the Skalds platform.
//!
//! This crate implements the system controller domain:
//!
//! - **Adapters**: the task repository (document store) and the event bus
//!   (partitioned log), each as a trait with a production and an
//!   in-memory implementation
//! - **State stores**: concurrent fleet and task views rebuilt by the
//!   monitors and observed by the dispatcher, reconciler, and API
//! - **Monitors**: periodic loops that synthesize authoritative liveness
//!   from cache state and the repository
//! - **Reconciler**: the pure mapping from heartbeat observations onto
//!   lifecycle transitions, plus the worker that applies them
//! - **Dispatcher**: assignment of eligible tasks to eligible skalds
//!   under a pluggable balancing policy
//! - **Runtime**: the composition root wiring components per run mode,
//!   with ordered drain on shutdown

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod reconciler;
pub mod repository;
pub mod runtime;
pub mod state;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, DispatchPolicyKind, RunMode};
    pub use crate::dispatcher::{DispatchOutcome, DispatchPolicy, Dispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventBus, MemoryEventBus, PublishedEvent};
    pub use crate::reconciler::{Decision, Reconciler, TaskObservation, decide};
    pub use crate::repository::{
        CasOutcome, MemoryTaskRepository, TaskFilter, TaskPage, TaskRepository,
    };
    pub use crate::runtime::{ComponentStatus, SystemController};
    pub use crate::state::{
        SkaldRecord, SkaldStore, SkaldStoreEvent, TaskRecord, TaskStore, TaskStoreEvent,
    };
}
