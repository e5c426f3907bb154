//! # Host Bridge Traits
//!
//! Capabilities the upload core needs from its host, expressed as traits.
//!
//! ## Overview
//!
//! The core never owns the server connection. The host (a desktop shell, a
//! browser bridge, a test harness) provides the outbound channel and feeds
//! server notifications back in. This crate defines that contract.
//!
//! ## Traits
//!
//! ### Server connection
//! - [`MessageTransport`](transport::MessageTransport) - Outbound calls and requests
//! - [`ChannelTransport`](transport::ChannelTransport) - Channel-backed implementation
//! - [`RawNotification`](transport::RawNotification) - Inbound push notification
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](log::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is missing:
//!
//! ```ignore
//! let transport = builder.transport
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "MessageTransport".to_string(),
//!         message: "No server transport provided.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it and report a dropped connection as
//! [`BridgeError::Disconnected`](error::BridgeError::Disconnected).
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can be shared across tasks.

pub mod error;
pub mod log;
pub mod time;
pub mod transport;

pub use error::BridgeError;

pub use log::{LogEntry, LogLevel, LoggerSink, StderrSink};
pub use time::{Clock, ManualClock, SystemClock};
pub use transport::{
    ChannelTransport, MessageKind, MessageTransport, OutboundMessage, RawNotification,
};
