//! Offline-first caching and sync engine.
//!
//! Requests are classified into categories, each served by a caching
//! strategy over named, bounded stores. Writes made while offline are queued
//! durably and replayed against the origin on the next sync pass.

pub mod cache;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod engine;
pub mod event;
pub mod executor;
pub mod http;
pub mod messages;
pub mod network;
pub mod notify;
pub mod queue;
pub mod route;
pub mod strategy;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::{CacheLayer, CacheResult, CacheSource, CacheStorage, SqliteStorage};
pub use config::Config;
pub use engine::{Engine, LifecycleState};
pub use event::{spawn_event_loop, EngineHandle};
pub use http::{Request, Response};
pub use messages::{ClientEvent, ControlMessage, ControlReply, EngineEvent, EventOutcome};
pub use network::{FetchError, HttpNetwork, Network};
pub use queue::MutationQueue;
