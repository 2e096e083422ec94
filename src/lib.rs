//! Bridges a task/event runtime and plain HTTP.
//!
//! Tasks coming from the runtime become outbound JSON POST calls, single or
//! batched, and their outcomes go back as task results. Calls hitting the
//! webhook endpoint become `onRequest` events.

pub mod config;
pub mod data;
pub mod dispatch;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod webhook;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use relay::{HttpRelay, Relay, RelayError};
pub use service::Service;
