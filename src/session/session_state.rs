use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::envelope::{decode_fields, encode_operation, OperationId};
use crate::protocol::filter_hash::FilterHash;
use crate::protocol::frame::{retransmitted_frames, ConnectData, DeliverData, ErrorData, ErrorDirective, InboundFrame, ResponseData, ServerMessage, TaskFrame};
use crate::protocol::op_code::OpCode;
use crate::session::operation_registry::{DeliveryCallback, OperationCallback, OperationRegistry, PendingOperation, ReplyCallback};
use crate::session::request_error::RequestError;
use crate::session::sequence_tracker::SequenceTracker;
use crate::session::session_config::SessionConfig;
use crate::session::session_events::{Dispatch, SessionInfo};
use crate::session::subscription_registry::SubscriptionRegistry;
use crate::transport::{Link, ReadyState, WireFrame, NORMAL_CLOSURE};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// the link is open and the handshake was sent, waiting for the server's CONNECT
    Handshaking,
    Connected,
    /// The session was closed for good, either by the server or by shutting down the client.
    ///  There is no way out of this state.
    ExpectedClose,
}

/// The complete state of a client session, independent of any async machinery: every
///  transition is triggered by a received frame, a timer in the connection driver, or a call
///  through the client API. Callbacks are never called from here, they are queued as
///  [Dispatch]es and must be run by the caller after releasing the session lock.
pub struct SessionState {
    config: Arc<SessionConfig>,
    connection_state: ConnectionState,
    /// set by a terminal server error or by shutdown: the next link loss is final
    expected_close: bool,

    link: Option<Arc<dyn Link>>,
    /// incremented whenever a link is attached or torn down, so the driver can tell whether
    ///  the link it is reading from is still current
    link_epoch: u64,
    link_signal: Arc<Notify>,
    session: Option<SessionInfo>,

    operations: OperationRegistry,
    subscriptions: SubscriptionRegistry,
    sequences: SequenceTracker,

    default_config_op: Option<OperationId>,
    disconnect_event_op: Option<OperationId>,

    dispatches: Vec<Dispatch>,
}

impl SessionState {
    pub fn new(config: Arc<SessionConfig>, link_signal: Arc<Notify>, now: Instant) -> SessionState {
        SessionState {
            config,
            connection_state: ConnectionState::Disconnected,
            expected_close: false,
            link: None,
            link_epoch: 0,
            link_signal,
            session: None,
            operations: OperationRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            sequences: SequenceTracker::new(now),
            default_config_op: None,
            disconnect_event_op: None,
            dispatches: Vec::new(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn is_expected_close(&self) -> bool {
        self.expected_close
    }

    pub fn link_epoch(&self) -> u64 {
        self.link_epoch
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.operations
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn sequences(&self) -> &SequenceTracker {
        &self.sequences
    }

    pub fn take_dispatches(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.dispatches)
    }

    /// The callback of a registered subscription, or of any other operation that receives
    ///  deliveries
    pub fn delivery_callback(&self, id: &OperationId) -> Option<DeliveryCallback> {
        match self.operations.get(id) {
            Some(PendingOperation { callback: Some(OperationCallback::Delivery(callback)), .. }) => Some(callback.clone()),
            _ => None,
        }
    }

    /// Called by the driver before opening a new link. Returns false if no further connection
    ///  attempts should be made.
    pub fn begin_connecting(&mut self) -> bool {
        if self.expected_close {
            return false;
        }
        if let Some(old) = self.link.clone() {
            debug!("closing old link before reconnecting");
            old.close(NORMAL_CLOSURE, "Closing old socket connection.");
            self.on_link_lost("Closing old socket connection.");
        }
        self.connection_state = ConnectionState::Connecting;
        true
    }

    /// Attaches a newly opened link and sends the handshake on it. Returns the link's epoch,
    ///  or `None` if the session was closed for good in the meantime.
    pub fn on_link_opened(&mut self, link: Arc<dyn Link>, now: Instant) -> Option<u64> {
        if self.expected_close {
            debug!("link opened after the session was closed - discarding it");
            link.close(NORMAL_CLOSURE, "Session closed.");
            return None;
        }

        self.link = Some(link);
        self.link_epoch += 1;
        self.connection_state = ConnectionState::Handshaking;

        let id = self.operations.next_id(OpCode::Connect);
        let handshake = vec![
            Value::String(self.config.project_id.clone()),
            Value::String(self.config.project_token.clone()),
        ];
        debug!("link opened, sending handshake");
        self.register_and_transmit(PendingOperation { id, payload: handshake, callback: None, filter_hash: None }, now);

        // sending may have found the link closed already
        self.link.as_ref()
            .map(|_| self.link_epoch)
    }

    /// The transport reported a link as closed
    pub fn on_link_closed(&mut self, epoch: u64, reason: &str) {
        if epoch == self.link_epoch {
            self.on_link_lost(reason);
        }
    }

    /// The driver gave up on a link, e.g. because of missing liveness
    pub fn close_link(&mut self, epoch: u64, reason: &str) {
        if epoch == self.link_epoch {
            self.close(reason);
        }
    }

    pub fn on_frame(&mut self, epoch: u64, frame: &WireFrame, now: Instant) {
        if epoch != self.link_epoch || self.link.is_none() {
            trace!("ignoring frame from a stale link");
            return;
        }

        let fields = match decode_fields(frame) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("received a frame that can not be decoded - ignoring: {}", e);
                return;
            }
        };
        trace!("received {:?}", fields);
        self.process_fields(fields, false, now);
    }

    fn process_fields(&mut self, fields: Vec<Value>, is_replay: bool, now: Instant) {
        let frame = match InboundFrame::from_fields(&fields) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame {:?}: {}", fields, e);
                return;
            }
        };

        let mut retry = if self.sequences.start_housekeeping(now, self.config.housekeeping_interval) {
            self.housekeeping(now)
        }
        else {
            Vec::new()
        };

        match frame {
            InboundFrame::Liveness { server_count } => {
                trace!("liveness frame, server count {:?}", server_count);
                if let Some(server_count) = server_count.filter(|_| self.session.is_some()) {
                    match self.sequences.on_server_count(server_count, self.config.max_sequence_gap) {
                        Ok(missed) => retry.extend(missed),
                        Err(e) => warn!("ignoring liveness count: {}", e),
                    }
                }
                self.request_retransmission(retry, now);
            }
            InboundFrame::Task(TaskFrame { tag, message }) => {
                self.request_retransmission(retry, now);

                let is_new = self.sequences.is_new(tag.sequence);
                if is_new && self.session.is_some() {
                    match self.sequences.on_sequence(tag.sequence, self.config.max_sequence_gap) {
                        Ok(missed) => self.request_retransmission(missed, now),
                        Err(e) => {
                            warn!("dropping frame {:?}: {}", fields, e);
                            return;
                        }
                    }
                }

                match message {
                    ServerMessage::Deliver(data) => {
                        if is_new || is_replay {
                            self.handle_deliver(tag.sequence, data, fields);
                        }
                        else {
                            trace!("dropping duplicate delivery #{}", tag.sequence);
                        }
                    }
                    ServerMessage::Response(data) => self.handle_response(data, now),
                    ServerMessage::Connect(data) => self.handle_connect(data, now),
                    ServerMessage::Error(data) => self.handle_error(data),
                }
            }
        }
    }

    fn process_replays(&mut self, replays: Vec<(u64, Vec<Value>)>, now: Instant) {
        for (sequence, fields) in replays {
            trace!("replaying frame #{}", sequence);
            self.process_fields(fields, true, now);
        }
    }

    /// Expires overdue requests and flushes buffered frames. Returns the missed frames to
    ///  request again.
    fn housekeeping(&mut self, now: Instant) -> Vec<u64> {
        trace!("housekeeping");

        let reply_timeout = self.config.reply_timeout;
        for operation in self.operations.take_expired(now, reply_timeout) {
            if let Some(OperationCallback::Reply(callback)) = operation.callback {
                self.dispatches.push(Dispatch::Reply {
                    callback,
                    result: Err(RequestError::Timeout(reply_timeout)),
                });
            }
        }

        let retry = self.sequences.retry_pass(self.config.max_retransmission_attempts);
        let replays = self.sequences.accept_retransmissions(Vec::new());
        self.process_replays(replays, now);
        retry
    }

    fn request_retransmission(&mut self, missed: Vec<u64>, now: Instant) {
        if missed.is_empty() || self.session.is_none() {
            return;
        }
        debug!("requesting retransmission of {:?}", missed);
        self.send_operation(OpCode::Retransmit, vec![json!(1), json!(missed)], Some(OperationCallback::Retransmission), now);
    }

    fn handle_deliver(&mut self, sequence: u64, data: DeliverData, fields: Vec<Value>) {
        if data.is_ordered() && self.sequences.has_open_slot_below(sequence) {
            self.sequences.buffer(sequence, fields);
            return;
        }

        let DeliverData { filter_hash, payload, config, target } = data;
        let recipients = match (target, filter_hash) {
            (Some(target), _) => vec![target],
            (None, Some(hash)) => self.subscriptions.members(hash),
            (None, None) => Vec::new(),
        };
        if recipients.is_empty() {
            trace!("no subscription for delivery #{}", sequence);
        }

        for id in recipients {
            if self.delivery_callback(&id).is_some() {
                self.dispatches.push(Dispatch::Delivery {
                    recipient: id,
                    payload: payload.clone(),
                    config: config.clone(),
                });
            }
        }
    }

    fn handle_response(&mut self, data: ResponseData, now: Instant) {
        let Some(id) = data.operation else {
            warn!("response without a valid operation id - ignoring");
            return;
        };

        let awaits_reply = match self.operations.get(&id) {
            None => {
                debug!("response for unknown operation {:?} - ignoring", id);
                return;
            }
            Some(operation) => operation.callback.as_ref().is_some_and(OperationCallback::awaits_single_reply),
        };
        if !awaits_reply {
            debug!("operation {:?} does not expect a response - ignoring", id);
            return;
        }

        match self.operations.remove(&id).and_then(|op| op.callback) {
            Some(OperationCallback::Reply(callback)) => {
                self.dispatches.push(Dispatch::Reply { callback, result: Ok(data.payload) });
            }
            Some(OperationCallback::Retransmission) => {
                let retransmitted = retransmitted_frames(&data.payload);
                let replays = self.sequences.accept_retransmissions(retransmitted);
                self.process_replays(replays, now);
            }
            _ => {}
        }
    }

    fn handle_connect(&mut self, data: ConnectData, now: Instant) {
        let ConnectData { client_id, server_id, secure_suffix } = data;
        let info = SessionInfo {
            secure_id: format!("{}-{}", client_id, secure_suffix),
            client_id,
            server_id,
        };
        info!("session established: client {} on server {}", info.client_id, info.server_id);

        self.session = Some(info.clone());
        self.connection_state = ConnectionState::Connected;
        self.subscriptions.clear();
        self.sequences.reset(now);
        self.dispatches.push(Dispatch::Opened(info));

        // NB: replayed operations keep their id, and re-registering them rebuilds the
        //      subscription index
        let ids = self.operations.ids();
        debug!("replaying {} pending operations", ids.len());
        for id in ids {
            if let Some(operation) = self.operations.remove(&id) {
                self.register_and_transmit(operation, now);
            }
        }
    }

    fn handle_error(&mut self, data: ErrorData) {
        let ErrorData { operation, message, directive } = data;
        error!("server reported an error for operation {:?}: {}", operation, message);

        if let Some(removed) = operation.and_then(|id| self.operations.remove(&id)) {
            if let Some(hash) = removed.filter_hash {
                self.subscriptions.remove(hash, &removed.id);
            }
            if let Some(OperationCallback::Reply(callback)) = removed.callback {
                self.dispatches.push(Dispatch::Reply {
                    callback,
                    result: Err(RequestError::Rejected(message)),
                });
            }
        }

        match directive {
            ErrorDirective::None => {}
            ErrorDirective::Terminal => {
                warn!("server closed the session for good - there will be no reconnect");
                self.expected_close = true;
            }
            ErrorDirective::Correction { target, value } => self.apply_correction(target, value),
        }
    }

    fn apply_correction(&mut self, target: OperationId, value: Value) {
        let Some(operation) = self.operations.get_mut(&target) else {
            debug!("correction for unknown operation {:?} - ignoring", target);
            return;
        };
        debug!("server replaced the filter of {:?} with {}", target, value);

        let new_hash = FilterHash::of(&value);
        match operation.payload.first_mut() {
            Some(first) => *first = value,
            None => operation.payload.push(value),
        }
        if let Some(old_hash) = operation.filter_hash {
            operation.filter_hash = Some(new_hash);
            self.subscriptions.migrate(target, old_hash, new_hash);
        }
    }

    fn send_operation(&mut self, op_code: OpCode, payload: Vec<Value>, callback: Option<OperationCallback>, now: Instant) -> OperationId {
        let id = self.operations.next_id(op_code);
        let filter_hash = (op_code == OpCode::Subscribe)
            .then(|| FilterHash::of(payload.first().unwrap_or(&Value::Null)));

        self.register_and_transmit(PendingOperation { id, payload, callback, filter_hash }, now);
        id
    }

    fn register_and_transmit(&mut self, operation: PendingOperation, now: Instant) {
        let id = operation.id;
        let payload = operation.payload.clone();
        let has_callback = operation.callback.is_some();

        if id.op_code.is_registered() {
            if let Some(hash) = operation.filter_hash {
                self.subscriptions.add(hash, id);
            }
            self.operations.insert(operation, now);
        }
        self.transmit(id, &payload, has_callback);
    }

    /// Sends an operation if the link is ready for it. Fire-and-forget operations are done
    ///  once they are sent, everything else stays registered until it is answered or replaced.
    fn transmit(&mut self, id: OperationId, payload: &[Value], has_callback: bool) {
        let Some(link) = self.link.clone() else {
            trace!("no link - deferring {:?}", id);
            return;
        };

        match link.ready_state() {
            ReadyState::Open if self.session.is_some() || id.op_code == OpCode::Connect => {}
            ReadyState::Closed => {
                debug!("link found closed while sending {:?}", id);
                self.on_link_lost("Connection closed.");
                return;
            }
            ready_state => {
                trace!("deferring {:?}: link is {:?}, session established: {}", id, ready_state, self.session.is_some());
                return;
            }
        }

        let frame = match encode_operation(id, payload, self.config.use_binary) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode operation {:?} - skipping: {}", id, e);
                return;
            }
        };

        trace!("sending {:?}: {:?}", id, frame);
        if let Err(e) = link.send(frame) {
            warn!("failed to send operation {:?}: {}", id, e);
            return;
        }

        if !has_callback && id.op_code < self.config.persistent_op_threshold {
            self.operations.remove(&id);
        }
    }

    fn on_link_lost(&mut self, reason: &str) {
        if self.link.take().is_none() {
            return;
        }
        self.link_epoch += 1;
        self.link_signal.notify_one();

        match self.session.take() {
            Some(info) => {
                info!("session of client {} lost: {}", info.client_id, reason);
                self.dispatches.push(Dispatch::Closed(reason.to_string()));
            }
            None => debug!("link closed before a session was established: {}", reason),
        }

        self.connection_state = if self.expected_close {
            ConnectionState::ExpectedClose
        }
        else {
            ConnectionState::Disconnected
        };
    }

    //---------------------- client API

    pub fn subscribe(&mut self, filter: Value, config: Option<Value>, callback: DeliveryCallback, now: Instant) -> OperationId {
        debug!("subscribing to {}", filter);
        let mut payload = vec![filter];
        payload.extend(config);
        self.send_operation(OpCode::Subscribe, payload, Some(OperationCallback::Delivery(callback)), now)
    }

    /// Returns false if the subscription does not exist (any more)
    pub fn edit_subscription(&mut self, id: OperationId, new_filter: Value, now: Instant) -> bool {
        let Some(operation) = self.operations.get_mut(&id).filter(|op| op.op_code() == OpCode::Subscribe) else {
            return false;
        };

        let new_hash = FilterHash::of(&new_filter);
        let Some(old_hash) = operation.filter_hash else {
            return false;
        };
        if old_hash == new_hash {
            return true;
        }

        debug!("changing filter of {:?} to {}", id, new_filter);
        match operation.payload.first_mut() {
            Some(first) => *first = new_filter.clone(),
            None => operation.payload.push(new_filter.clone()),
        }
        operation.filter_hash = Some(new_hash);
        self.subscriptions.migrate(id, old_hash, new_hash);

        self.send_operation(OpCode::EditFilter, vec![id.to_wire(), old_hash.to_wire(), new_filter], None, now);
        true
    }

    /// Returns false if the subscription does not exist (any more)
    pub fn close_subscription(&mut self, id: OperationId, now: Instant) -> bool {
        if id.op_code != OpCode::Subscribe {
            return false;
        }
        let Some(operation) = self.operations.remove(&id) else {
            return false;
        };

        debug!("closing subscription {:?}", id);
        if let Some(hash) = operation.filter_hash {
            self.subscriptions.remove(hash, &id);
            self.send_operation(OpCode::Unsubscribe, vec![hash.to_wire()], None, now);
        }
        true
    }

    pub fn publish(&mut self, filter: Value, data: Value, config: Option<Value>, now: Instant) -> OperationId {
        trace!("publishing to {}", filter);
        let mut payload = vec![filter, data];
        payload.extend(config);
        self.send_operation(OpCode::Publish, payload, None, now)
    }

    pub fn request(&mut self, payload: Vec<Value>, callback: ReplyCallback, now: Instant) -> OperationId {
        self.send_operation(OpCode::Request, payload, Some(OperationCallback::Reply(callback)), now)
    }

    pub fn set_default_config(&mut self, config: Value, now: Instant) -> OperationId {
        debug!("setting default config {}", config);
        if let Some(previous) = self.default_config_op.take() {
            self.operations.remove(&previous);
        }
        let id = self.send_operation(OpCode::SetDefaultConfig, vec![config], None, now);
        self.default_config_op = Some(id);
        id
    }

    /// Registers a message the server publishes when this client disconnects, replacing a
    ///  previous one. `None` removes the disconnect event on the server.
    pub fn set_disconnect_event(&mut self, filter: Option<Value>, data: Value, config: Option<Value>, now: Instant) {
        if let Some(previous) = self.disconnect_event_op.take() {
            self.operations.remove(&previous);
        }

        match filter {
            Some(filter) => {
                debug!("setting disconnect event for {}", filter);
                let mut payload = vec![filter, data];
                payload.extend(config);
                self.disconnect_event_op = Some(self.send_operation(OpCode::SetDisconnectEvent, payload, None, now));
            }
            None => {
                debug!("removing disconnect event");
                let id = self.send_operation(OpCode::SetDisconnectEvent, vec![Value::Null], None, now);
                self.operations.remove(&id);
            }
        }
    }

    /// Closes the current link. Unless the session is closed for good, the driver reconnects.
    pub fn close(&mut self, reason: &str) {
        if let Some(link) = self.link.clone() {
            debug!("closing link: {}", reason);
            link.close(NORMAL_CLOSURE, reason);
            self.on_link_lost(reason);
        }
    }

    /// Closes the session for good. Pending requests are failed.
    pub fn shutdown(&mut self, reason: &str) {
        info!("shutting down: {}", reason);
        self.expected_close = true;
        self.close(reason);
        self.connection_state = ConnectionState::ExpectedClose;

        for operation in self.operations.drain() {
            if let Some(OperationCallback::Reply(callback)) = operation.callback {
                self.dispatches.push(Dispatch::Reply { callback, result: Err(RequestError::Closed) });
            }
        }
        self.subscriptions.clear();
        self.link_signal.notify_one();
    }
}
