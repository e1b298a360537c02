//! Gateway server for multiclaw
//!
//! Owns the agent registry and the task lifecycle, and serves the HTTP API
//! and WebSockets that front them.

mod handler;
mod server;

pub use handler::router;
pub use server::{
    AgentStatus, DispatchOutcome, Gateway, GatewayBuilder, GatewayState, GatewayStatus,
    InboundText,
};
