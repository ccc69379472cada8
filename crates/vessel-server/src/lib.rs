//! vessel-server: the network front, the worker agent and a small client.
//!
//! ```text
//!   Client ──TCP/JSON lines──▶ front ──▶ vessel_kernel::Service
//!                                              │
//!                                  bridge ──stdin/stdout──▶ vessel-agent
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod front;
pub mod protocol;

pub use client::{Client, ClientError, RunReply};
pub use config::ServerConfig;
