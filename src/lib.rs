//! Offline resilience engine.
//!
//! Routes outbound requests through per-resource caching strategies over a
//! durable local store, queues offline writes, and replays them once
//! connectivity returns.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod network;
pub mod store;
pub mod sync;

pub use cache::{Ttl, TtlCache};
pub use config::Config;
pub use db::Database;
pub use engine::{ControlMessage, Engine, Lifecycle, MessageOutcome};
pub use error::{EngineError, RouteError, StoreError, StoreResult, TransportError};
pub use event::EngineHandle;
pub use network::{Request, Response, Router, Served, ServedFrom, Transport};
pub use store::LocalStore;
pub use sync::{Coordinator, DrainReport, Notification, SyncQueue};
