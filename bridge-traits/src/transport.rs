//! Message Transport Abstraction
//!
//! The server connection is an asynchronous, notification-based channel. The
//! core sends two kinds of messages:
//!
//! - **calls**: fire-and-forget commands (`UploadChunk`, `AnnotateUpload`)
//! - **requests**: commands whose answer arrives later as a notification
//!   tagged with a response signal (`UploadingContent`, `ShowUploads`)
//!
//! Neither kind returns a server result to the caller. Everything the server
//! says comes back through [`RawNotification`]s that the host feeds into the
//! core. Connecting, reconnecting and socket watchdogs belong to the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};

/// Kind of outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Call,
    Request,
}

/// An outbound message as handed to the host connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    /// Server method name, e.g. `InitiateUpload`
    pub method: String,
    /// Response signal for requests
    pub signal: Option<String>,
    pub arguments: Value,
    /// Opaque value echoed back by the server with the response
    pub pass: Option<Value>,
}

impl OutboundMessage {
    pub fn call(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            kind: MessageKind::Call,
            method: method.into(),
            signal: None,
            arguments,
            pass: None,
        }
    }

    pub fn request(
        method: impl Into<String>,
        signal: impl Into<String>,
        arguments: Value,
        pass: Option<Value>,
    ) -> Self {
        Self {
            kind: MessageKind::Request,
            method: method.into(),
            signal: Some(signal.into()),
            arguments,
            pass,
        }
    }
}

/// A push notification received from the server
///
/// `fnc` names the server function that produced it, `sig` the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNotification {
    pub fnc: String,
    pub sig: String,
    #[serde(default)]
    pub data: Value,
}

impl RawNotification {
    pub fn new(fnc: impl Into<String>, sig: impl Into<String>, data: Value) -> Self {
        Self {
            fnc: fnc.into(),
            sig: sig.into(),
            data,
        }
    }
}

/// Outbound side of the server connection
///
/// Implementations should:
/// - Serialize and send the message without waiting for a server answer
/// - Return [`BridgeError::Disconnected`] when the connection is down
/// - Never retry on their own; retry policy belongs to the host
///
/// # Example
///
/// ```ignore
/// use bridge_traits::transport::MessageTransport;
/// use serde_json::json;
///
/// async fn list_uploads(transport: &dyn MessageTransport) -> Result<()> {
///     transport.request("GetUploads", "ShowUploads", json!({}), None).await
/// }
/// ```
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send a fire-and-forget command
    async fn call(&self, method: &str, arguments: Value) -> Result<()>;

    /// Send a command whose answer arrives later as a `response_signal` notification
    async fn request(
        &self,
        method: &str,
        response_signal: &str,
        arguments: Value,
        pass: Option<Value>,
    ) -> Result<()>;

    /// Whether the connection is currently usable
    fn is_connected(&self) -> bool {
        true
    }
}

/// Transport that forwards every outbound message into a tokio channel
///
/// Hosts drain the receiver into their socket. Tests use the receiver to
/// observe exactly what the core sent.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.sender.send(message).map_err(|e| {
            BridgeError::Disconnected(format!("outbound channel closed ({})", e.0.method))
        })
    }
}

#[async_trait]
impl MessageTransport for ChannelTransport {
    async fn call(&self, method: &str, arguments: Value) -> Result<()> {
        self.send(OutboundMessage::call(method, arguments))
    }

    async fn request(
        &self,
        method: &str,
        response_signal: &str,
        arguments: Value,
        pass: Option<Value>,
    ) -> Result<()> {
        self.send(OutboundMessage::request(
            method,
            response_signal,
            arguments,
            pass,
        ))
    }

    fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
