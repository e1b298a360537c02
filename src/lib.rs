//! multiclaw - one gateway in front of many coding agents
//!
//! Runs several long-lived agent processes that speak a JSON-lines protocol
//! over stdio and puts a single entry point in front of them. Users address
//! an agent by keyword ("atlas: run the tests"); the gateway tracks the
//! active agent per conversation, queues prompts per agent and delivers each
//! final reply back to where the prompt came from.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      multiclaw gateway                      │
//! │  HTTP / WebSocket ─┐                                        │
//! │  iMessage bridge ──┼──► router ──► task lifecycle ──┐       │
//! │                    │                                │       │
//! │                    └──◄ notifier ◄── agent events ◄─┤       │
//! └──────────────────────────────────────────────────────┼──────┘
//!                                                        │ stdio (JSON lines)
//!                              ┌──────────┬──────────────┼──────────┐
//!                              │  agent   │    agent     │  agent   │
//!                              └──────────┴──────────────┴──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: agent runtimes, the line protocol, routing and process supervision
//! - [`task`]: per-agent task queue and reply resolution
//! - [`notify`]: reply delivery and the web broadcast hub
//! - [`channels`]: outbound message adapters
//! - [`session`]: session file index
//! - [`gateway`]: the gateway facade and its HTTP API
//! - [`config`]: configuration management

pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod session;
pub mod task;

pub use config::MulticlawConfig;
pub use error::{Error, Result};
