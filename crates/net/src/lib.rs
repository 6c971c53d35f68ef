//! JetLink Network Library
//!
//! Real-time text and image messaging over plain TCP.
//!
//! # Architecture
//!
//! - **Hub**: accepts peers and relays every well-formed envelope to all of
//!   them, the sender included
//! - **Link**: a client's auto-reconnecting connection to a hub
//! - **Protocol**: one JSON envelope per newline-terminated line
//! - **Content**: image downscaling and Base64 packing around send/receive
//! - **Inbox**: hands received messages to host-supplied storage
//!
//! # Usage
//!
//! ```ignore
//! // Host starts a hub
//! let hub = Hub::new(HubConfig::default());
//! let addr = hub.start().await?;
//!
//! // Client connects and listens
//! let link = Link::connect(LinkConfig::for_addr(addr), "user_4821")?;
//! let mut messages = link.subscribe_messages();
//!
//! link.send(Some("user_1097"), ContentType::Text, "hello", None).await?;
//! while let Ok(envelope) = messages.recv().await {
//!     if link.is_self_origin(&envelope) {
//!         continue;
//!     }
//!     /* handle */
//! }
//! ```

pub mod config;
pub mod content;
pub mod error;
mod frame;
pub mod hub;
pub mod inbox;
pub mod link;
pub mod protocol;
mod session;

pub use config::{HubConfig, LinkConfig};
pub use content::{materialize_incoming, prepare_outgoing, prepare_outgoing_file, ContentError};
pub use error::{Error, Result};
pub use frame::DEFAULT_MAX_LINE_BYTES;
pub use hub::{ConnId, Hub, Line, Registry};
pub use inbox::{Delivery, ForegroundPolicy, InboundMessage, Inbox, MessageSink, Silent, SinkError};
pub use link::{Link, LinkState, TypingSignal};
pub use protocol::{
    is_self_origin, ContentType, DecodeError, Envelope, EnvelopeKind, Payload,
};

/// Default port for JetLink hubs
pub const DEFAULT_PORT: u16 = 8888;
