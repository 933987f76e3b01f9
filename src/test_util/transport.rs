use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::envelope::decode_fields;
use crate::transport::{Link, ReadyState, Transport, TransportEvent, TransportLink, WireFrame};

/// Lets the background tasks process everything they can without advancing (paused) time
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// An in-memory [Transport] whose connections are controlled by test code. Every opened
///  connection is kept as a [ScriptedLink] for pushing frames and inspecting what was sent.
#[derive(Default)]
pub struct ScriptedTransport {
    inner: Mutex<ScriptedTransportInner>,
}

#[derive(Default)]
struct ScriptedTransportInner {
    opened_urls: Vec<String>,
    links: Vec<Arc<ScriptedLink>>,
    failures_remaining: usize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<ScriptedTransport> {
        Default::default()
    }

    /// the next `n` calls to `open` fail
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.lock().unwrap().failures_remaining = n;
    }

    /// all URLs `open` was called with, including failed attempts
    pub fn opened_urls(&self) -> Vec<String> {
        self.inner.lock().unwrap().opened_urls.clone()
    }

    pub fn links(&self) -> Vec<Arc<ScriptedLink>> {
        self.inner.lock().unwrap().links.clone()
    }

    pub fn last_link(&self) -> Option<Arc<ScriptedLink>> {
        self.inner.lock().unwrap().links.last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> anyhow::Result<TransportLink> {
        let mut inner = self.inner.lock().unwrap();
        inner.opened_urls.push(url.to_string());

        if inner.failures_remaining > 0 {
            inner.failures_remaining -= 1;
            bail!("connection refused");
        }

        let (sender, events) = mpsc::unbounded_channel();
        let link = Arc::new(ScriptedLink {
            inner: Mutex::new(ScriptedLinkInner {
                ready_state: ReadyState::Open,
                sent: Vec::new(),
                close_reason: None,
                events: sender,
            }),
        });
        inner.links.push(link.clone());

        Ok(TransportLink {
            handle: link,
            events,
        })
    }
}

pub struct ScriptedLink {
    inner: Mutex<ScriptedLinkInner>,
}

struct ScriptedLinkInner {
    ready_state: ReadyState,
    sent: Vec<WireFrame>,
    close_reason: Option<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ScriptedLink {
    /// Simulates a frame from the server. `fields` is the frame's JSON array.
    pub fn push_frame(&self, fields: Value) {
        self.push_raw(WireFrame::Text(frame_text(&fields)));
    }

    pub fn push_raw(&self, frame: WireFrame) {
        let _ = self.inner.lock().unwrap().events.send(TransportEvent::Message(frame));
    }

    /// Simulates the connection being closed from the server side or by the network
    pub fn drop_connection(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready_state = ReadyState::Closed;
        let _ = inner.events.send(TransportEvent::Closed { code: 1006, reason: reason.to_string() });
    }

    /// the reason passed by the client when it closed this link
    pub fn close_reason(&self) -> Option<String> {
        self.inner.lock().unwrap().close_reason.clone()
    }

    pub fn sent_raw(&self) -> Vec<WireFrame> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Returns the decoded frames sent so far, and forgets them
    pub fn sent_frames(&self) -> Vec<Vec<Value>> {
        std::mem::take(&mut self.inner.lock().unwrap().sent)
            .iter()
            .map(|frame| decode_fields(frame).unwrap())
            .collect()
    }

    /// Checks the oldest sent frame that was not checked yet
    pub fn assert_sent(&self, expected: Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.sent.is_empty() {
            panic!("no frame was sent, expected {}", expected);
        }
        let actual = decode_fields(&inner.sent.remove(0)).unwrap();
        assert_eq!(Value::Array(actual), expected);
    }

    pub fn assert_no_remaining_frames(&self) {
        let remaining = self.sent_frames();
        assert!(remaining.is_empty(), "unexpected frames: {:?}", remaining);
    }
}

impl Link for ScriptedLink {
    fn ready_state(&self) -> ReadyState {
        self.inner.lock().unwrap().ready_state
    }

    fn send(&self, frame: WireFrame) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ready_state != ReadyState::Open {
            bail!("link is {:?}", inner.ready_state);
        }
        inner.sent.push(frame);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.ready_state = ReadyState::Closed;
        inner.close_reason = Some(reason.to_string());
        let _ = inner.events.send(TransportEvent::Closed { code, reason: reason.to_string() });
    }
}

/// A frame's JSON array as it is put on the wire
pub fn frame_text(fields: &Value) -> String {
    let text = fields.to_string();
    match text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        Some(inner) => inner.to_string(),
        None => text,
    }
}
