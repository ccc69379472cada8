//! vessel-kernel: the orchestration core of vessel.
//!
//! A Run call flows through these pieces:
//!
//! ```text
//!   BoundFunction
//!       │
//!       ▼
//!   ExecutionSession ──▶ BuilderRegistry (validate every definition)
//!       │
//!       ├──▶ EnvironmentCache ──▶ EnvironmentBuilder::build   (BUILD logs)
//!       │
//!       ├──▶ BridgePool ──▶ Bridge (vessel-agent subprocess)   (BRIDGE logs)
//!       │
//!       └──▶ Bridge::run ──▶ agent executes the function       (USER logs)
//!                 │
//!                 ▼
//!             LogSink ──▶ RunStream of PartialResult chunks
//! ```
//!
//! [`Service`] wraps sessions with the Run/Submit/SetMetadata/List/Cancel
//! surface and the background [`TaskManager`].

pub mod bridge;
pub mod builders;
pub mod cache;
pub mod config;
pub mod handle;
pub mod key;
pub mod multiplex;
pub mod paths;
pub mod pool;
pub mod process;
pub mod service;
pub mod session;
pub mod tasks;

pub use bridge::Bridge;
pub use builders::{BuildLogs, BuildRequest, BuilderRegistry, EnvironmentBuilder};
pub use cache::EnvironmentCache;
pub use config::Settings;
pub use handle::{LaunchSpec, RuntimeHandle};
pub use key::{composed_key, definition_key};
pub use multiplex::{LogSink, RunOutcome, RunStream};
pub use pool::{BridgeLease, BridgePool, PooledBridge};
pub use service::Service;
pub use session::{ExecutionSession, Runtime, SessionState};
pub use tasks::TaskManager;

pub use vessel_types;
