//! The transport collaborator: a message-oriented connection (typically a WebSocket) that can
//!  drop or stall at any time. The session engine only relies on the operations in this module,
//!  so any transport with these semantics can be plugged in.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

/// close code for a regular, client-initiated close
pub const NORMAL_CLOSURE: u16 = 1000;

/// The raw content of a single transport message
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    Message(WireFrame),
    Closed { code: u16, reason: String },
}

/// The sending side of an open connection. Sending is non-blocking: implementations queue the
///  frame for transmission and report an error only if the connection can not accept it.
#[cfg_attr(test, automock)]
pub trait Link: Send + Sync + 'static {
    fn ready_state(&self) -> ReadyState;

    fn send(&self, frame: WireFrame) -> anyhow::Result<()>;

    /// Initiates closing the connection. The transport emits [TransportEvent::Closed] once
    ///  the connection is actually closed.
    fn close(&self, code: u16, reason: &str);
}

/// An opened connection: the handle for sending plus the stream of received events
pub struct TransportLink {
    pub handle: Arc<dyn Link>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a new connection. Returning successfully corresponds to the connection's 'open'
    ///  event.
    async fn open(&self, url: &str) -> anyhow::Result<TransportLink>;
}
