use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::envelope::OperationId;
use crate::session::operation_registry::{DeliveryCallback, ReplyCallback};
use crate::session::request_error::RequestError;

/// Identity of an established session, as assigned by the server in its CONNECT frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub client_id: String,
    pub server_id: String,
    /// `<client id>-<secret suffix>`
    pub secure_id: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Opened(SessionInfo),
    /// An established session was lost. Unless the session was closed for good, reconnecting
    ///  starts right away.
    Closed { reason: String },
}

pub struct SessionEventNotifier {
    sender: broadcast::Sender<SessionEvent>,
}
impl SessionEventNotifier {
    pub fn new(capacity: usize) -> SessionEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        SessionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SessionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

pub type OpenedCallback = Arc<dyn Fn(&SessionInfo) + Send + Sync>;
pub type ClosedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A callback invocation that was triggered by a state transition. These are collected while
///  the session state is locked, and run after the lock is released so that callbacks can call
///  back into the client.
pub enum Dispatch {
    /// The recipient's callback is looked up when the delivery is run: an earlier callback in
    ///  the same batch may have closed the subscription.
    Delivery { recipient: OperationId, payload: Value, config: Value },
    Reply { callback: ReplyCallback, result: Result<Value, RequestError> },
    Opened(SessionInfo),
    Closed(String),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Delivery { recipient, payload, config } => write!(f, "Delivery({:?}, {}, {})", recipient, payload, config),
            Dispatch::Reply { result, .. } => write!(f, "Reply({:?})", result),
            Dispatch::Opened(info) => write!(f, "Opened({:?})", info),
            Dispatch::Closed(reason) => write!(f, "Closed({:?})", reason),
        }
    }
}

#[derive(Default)]
struct LifecycleHooks {
    on_open: Option<OpenedCallback>,
    on_close: Option<ClosedCallback>,
}

/// Runs [Dispatch]es: caller callbacks, lifecycle hooks and the event channel
pub struct Dispatcher {
    hooks: Mutex<LifecycleHooks>,
    events: SessionEventNotifier,
}

impl Dispatcher {
    pub fn new(event_channel_capacity: usize) -> Dispatcher {
        Dispatcher {
            hooks: Default::default(),
            events: SessionEventNotifier::new(event_channel_capacity),
        }
    }

    pub fn set_on_open(&self, callback: Option<OpenedCallback>) {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).on_open = callback;
    }

    pub fn set_on_close(&self, callback: Option<ClosedCallback>) {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).on_close = callback;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// `delivery_callback` resolves a delivery's recipient, returning `None` if it is no longer
    ///  registered
    pub fn run(&self, dispatches: Vec<Dispatch>, delivery_callback: impl Fn(&OperationId) -> Option<DeliveryCallback>) {
        for dispatch in dispatches {
            trace!("dispatching {:?}", dispatch);
            match dispatch {
                Dispatch::Delivery { recipient, payload, config } => match delivery_callback(&recipient) {
                    Some(callback) => callback(&payload, &config),
                    None => trace!("{:?} was closed before its delivery was dispatched", recipient),
                },
                Dispatch::Reply { callback, result } => callback(result),
                Dispatch::Opened(info) => {
                    // NB: the hook is cloned so the lock is not held while calling it
                    let hook = self.hooks.lock().unwrap_or_else(PoisonError::into_inner).on_open.clone();
                    if let Some(hook) = hook {
                        hook(&info);
                    }
                    self.events.send_event(SessionEvent::Opened(info));
                }
                Dispatch::Closed(reason) => {
                    let hook = self.hooks.lock().unwrap_or_else(PoisonError::into_inner).on_close.clone();
                    if let Some(hook) = hook {
                        hook(&reason);
                    }
                    self.events.send_event(SessionEvent::Closed { reason });
                }
            }
        }
    }
}
