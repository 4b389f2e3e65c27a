//! Bridge between the ComWeChat desktop automation API and a message-routing
//! master.
//!
//! Outbound sends are confirmed asynchronously by the chat client, so every
//! send registers a wait slot ([`pending`]) that a later `sent_msg` callback
//! resolves ([`correlate`]). Inbound media usually lands on disk after its
//! event arrives; such messages wait in the [`media_queue`] until the file
//! shows up, is recovered, or times out. [`Bridge`] ties these together.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod config;
pub mod correlate;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod file_locks;
pub mod master;
pub mod media_queue;
pub mod normalize;
pub mod notice;
pub mod pending;
pub mod staging;
#[cfg(test)]
pub mod test_util;
pub mod types;
mod xml;

pub use bridge::Bridge;
pub use client::{AccountInfo, ChatClient, ClientResult, ContactRecord};
pub use config::{BridgeConfig, load_config};
pub use error::{ClientError, ConfigError, Error, Result};
pub use master::Master;
pub use types::{
    Author, AuthorRole, Chat, ChatKind, EventCategory, InboundEvent, MasterMessage,
    MasterStatus, MessageCommand, MsgKind, OutboundMessage, QuoteTarget, RetryDirective,
    SendReceipt,
};
