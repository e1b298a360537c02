//! Agent processes and the line protocol
//!
//! ## Architecture
//!
//! ```text
//! agent stdout ──► decoder ──► correlator ──► pending request settled
//!                     │
//!                     └──────► task lifecycle ──► notifier ──► socket / channel
//!
//! gateway ──► router ──► runtime.write_payload ──► agent stdin
//! ```
//!
//! Each agent owns its runtime state; nothing is shared between agents.

pub mod commands;
pub mod correlator;
pub mod decoder;
pub mod launcher;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod types;

pub use commands::{is_slash_command, resolve_command, GatewayCommand};
pub use correlator::{RequestOptions, ResponseCorrelator};
pub use decoder::{LineDecoder, LineHandler};
pub use launcher::{AgentLauncher, ProcessEvents};
pub use registry::AgentRegistry;
pub use router::RouterResult;
pub use runtime::{AgentListEntry, AgentProcess, AgentRuntime};
pub use types::AgentEvent;
