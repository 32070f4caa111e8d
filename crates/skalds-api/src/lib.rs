//! # skalds-api
//!
//! HTTP surface of the Skalds system controller: query endpoints over the
//! live fleet/task views and the document store, mutation endpoints that
//! funnel through the store and event adapters, and long-lived
//! server-push streams of fleet and task observations.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod metrics;
pub mod openapi;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult, ServerError};
pub use server::{AppState, Server};
