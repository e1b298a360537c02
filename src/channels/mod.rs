//! External messaging channels
//!
//! Inbound messages arrive over HTTP from a channel bridge; replies go back
//! through a `ChannelAdapter`.

mod adapter;
mod imessage;
mod message;

pub use adapter::ChannelAdapter;
pub use imessage::IMessageAdapter;
pub use message::{InboundMessage, OutboundMessage};
