use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::envelope::OperationId;
use crate::session::connection::{run_connection_driver, SessionShared};
use crate::session::request_error::RequestError;
use crate::session::session_config::SessionConfig;
use crate::session::session_events::{SessionEvent, SessionInfo};
use crate::session::session_state::ConnectionState;
use crate::transport::Transport;

/// The public API of a pub/sub session. The client keeps itself connected in the background,
///  re-registering all subscriptions and persistent settings after every reconnect.
///
/// Cloning a client is cheap, all clones share the same session. The session is closed when
///  the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    shared: Arc<SessionShared>,
    driver: JoinHandle<()>,
}
impl Drop for ClientInner {
    fn drop(&mut self) {
        self.driver.abort();
        self.shared.with_state(|s| s.shutdown("Client dropped."));
    }
}

impl Client {
    /// Starts a session. Connecting happens in the background, operations issued before the
    ///  session is established are sent as soon as it is.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: SessionConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Client> {
        config.validate()?;

        let shared = Arc::new(SessionShared::new(Arc::new(config)));
        let driver = tokio::spawn(run_connection_driver(shared.clone(), transport));

        Ok(Client {
            inner: Arc::new(ClientInner {
                shared,
                driver,
            }),
        })
    }

    fn shared(&self) -> &Arc<SessionShared> {
        &self.inner.shared
    }

    /// Subscribes to deliveries matching `filter`. The callback is called with each delivery's
    ///  payload and config.
    pub fn subscribe(&self, filter: Value, config: Option<Value>, callback: impl Fn(&Value, &Value) + Send + Sync + 'static) -> SubscriptionHandle {
        let callback = Arc::new(callback);
        let id = self.shared().with_state(|s| s.subscribe(filter, config, callback, Instant::now()));
        SubscriptionHandle {
            id,
            shared: self.shared().clone(),
        }
    }

    pub fn publish(&self, filter: Value, data: Value, config: Option<Value>) {
        self.shared().with_state(|s| s.publish(filter, data, config, Instant::now()));
    }

    /// Sends a request that is answered by a single reply. The callback is called exactly once,
    ///  with the reply or with the reason there is none.
    pub fn request(&self, payload: Vec<Value>, callback: impl FnOnce(Result<Value, RequestError>) + Send + 'static) -> OperationId {
        self.shared().with_state(|s| s.request(payload, Box::new(callback), Instant::now()))
    }

    pub async fn request_reply(&self, payload: Vec<Value>) -> Result<Value, RequestError> {
        let (sender, receiver) = oneshot::channel();
        self.request(payload, move |result| {
            let _ = sender.send(result);
        });

        // the callback is dropped without being called if the client is dropped
        receiver.await
            .unwrap_or(Err(RequestError::Closed))
    }

    /// Sets the config the server applies to this client's operations by default. It replaces
    ///  any previous default config and is restored after every reconnect.
    pub fn set_default_config(&self, config: Value) {
        self.shared().with_state(|s| s.set_default_config(config, Instant::now()));
    }

    /// Registers a message the server publishes on the client's behalf when the client
    ///  disconnects. `None` as a filter removes it.
    pub fn set_disconnect_event(&self, filter: Option<Value>, data: Value, config: Option<Value>) {
        self.shared().with_state(|s| s.set_disconnect_event(filter, data, config, Instant::now()));
    }

    pub fn on_open(&self, callback: impl Fn(&SessionInfo) + Send + Sync + 'static) {
        self.shared().dispatcher().set_on_open(Some(Arc::new(callback)));
    }

    pub fn on_close(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.shared().dispatcher().set_on_close(Some(Arc::new(callback)));
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared().dispatcher().subscribe()
    }

    /// Closes the current connection. A new one is opened right away unless the server closed
    ///  the session for good.
    pub fn close(&self, reason: &str) {
        self.shared().with_state(|s| s.close(reason));
    }

    /// To be called when the host environment detects that the network went away
    pub fn network_unavailable(&self) {
        debug!("network unavailable");
        self.close("Lost connection.");
    }

    /// Closes the session for good, without reconnecting
    pub fn shutdown(&self) {
        self.shared().with_state(|s| s.shutdown("Client shut down."));
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared().with_state(|s| s.connection_state())
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.shared().with_state(|s| s.session_info().cloned())
    }
}

/// A subscription, valid until it is closed. Dropping the handle does not close the
///  subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: OperationId,
    shared: Arc<SessionShared>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Changes the subscription's filter. Nothing is sent if the new filter has the same hash
    ///  as the old one. Returns false if the subscription was closed.
    pub fn edit(&self, filter: Value) -> bool {
        self.shared.with_state(|s| s.edit_subscription(self.id, filter, Instant::now()))
    }

    /// Returns false if the subscription was closed already
    pub fn close(&self) -> bool {
        self.shared.with_state(|s| s.close_subscription(self.id, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::advance;

    use crate::protocol::filter_hash::FilterHash;
    use crate::test_util::transport::{settle, ScriptedTransport};
    use crate::transport::MockTransport;
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new("wss://example.net/socket", "p1", "t1")
    }

    async fn connected_client() -> (Client, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new();
        let client = Client::connect(config(), transport.clone()).unwrap();
        settle().await;

        let link = transport.last_link().unwrap();
        link.assert_sent(json!([11, "p1", "t1"]));
        link.push_frame(json!([1, 7, "srv-a", "x9"]));
        settle().await;
        (client, transport)
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut config = config();
            config.socket_url.clear();
            assert!(Client::connect(config, ScriptedTransport::new()).is_err());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_scenario() {
        let (client, transport) = connected_client().await;
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.session_info().unwrap().secure_id, "7-x9");

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let handle = client.subscribe(json!("room:42"), None, move |payload, config| {
            received2.lock().unwrap().push((payload.clone(), config.clone()));
        });

        let link = transport.last_link().unwrap();
        link.assert_sent(json!([handle.id().to_wire(), "room:42"]));

        link.push_frame(json!([22, FilterHash::of_str("room:42").to_wire(), {"msg": "hi"}]));
        settle().await;
        assert_eq!(*received.lock().unwrap(), vec![(json!({"msg": "hi"}), json!({}))]);
        link.assert_no_remaining_frames();
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_before_connect_are_sent_after_connect() {
        let transport = ScriptedTransport::new();
        let client = Client::connect(config(), transport.clone()).unwrap();
        client.publish(json!("topic"), json!({"v": 1}), None);
        let handle = client.subscribe(json!("room:42"), None, |_, _| ());
        settle().await;

        let link = transport.last_link().unwrap();
        link.assert_sent(json!([13, "p1", "t1"]));
        link.assert_no_remaining_frames();

        link.push_frame(json!([1, 7, "srv-a", "x9"]));
        settle().await;
        link.assert_sent(json!([31, "topic", {"v": 1}]));
        link.assert_sent(json!([handle.id().to_wire(), "room:42"]));
        link.assert_no_remaining_frames();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_subscriptions_with_original_ids() {
        let (client, transport) = connected_client().await;
        let opened = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let opened2 = opened.clone();
        let closed2 = closed.clone();
        client.on_open(move |info| opened2.lock().unwrap().push(info.client_id.clone()));
        client.on_close(move |reason| closed2.lock().unwrap().push(reason.to_string()));

        let handle = client.subscribe(json!("room:42"), None, |_, _| ());
        client.set_default_config(json!({"ordered": true}));
        client.publish(json!("topic"), json!(1), None);

        transport.last_link().unwrap().drop_connection("server restart");
        settle().await;
        assert_eq!(*closed.lock().unwrap(), vec!["server restart".to_string()]);
        assert_eq!(transport.opened_urls().len(), 2);

        let link = transport.last_link().unwrap();
        link.assert_sent(json!([15, "p1", "t1"]));
        link.push_frame(json!([1, 8, "srv-b", "y1"]));
        settle().await;

        assert_eq!(*opened.lock().unwrap(), vec!["8".to_string()]);
        link.assert_sent(json!([handle.id().to_wire(), "room:42"]));
        link.assert_sent(json!([73, {"ordered": true}]));
        link.assert_no_remaining_frames();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_are_retried_every_interval() {
        let transport = ScriptedTransport::new();
        transport.fail_next_opens(2);
        let _client = Client::connect(config(), transport.clone()).unwrap();
        settle().await;
        assert_eq!(transport.opened_urls().len(), 1);

        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(transport.opened_urls().len(), 2);

        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(transport.opened_urls().len(), 3);
        assert!(transport.last_link().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_attempt_is_abandoned() {
        let transport = ScriptedTransport::new();
        let _client = Client::connect(config(), transport.clone()).unwrap();
        settle().await;
        let first = transport.last_link().unwrap();

        advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(first.close_reason().as_deref(), Some("Closing old socket connection."));
        assert_eq!(transport.opened_urls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_silent_connection() {
        let (client, transport) = connected_client().await;
        let first = transport.last_link().unwrap();

        advance(Duration::from_secs(119)).await;
        settle().await;
        assert!(first.close_reason().is_none());
        first.push_frame(json!([]));
        settle().await;

        advance(Duration::from_secs(119)).await;
        settle().await;
        assert!(first.close_reason().is_none());

        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(first.close_reason().as_deref(), Some("no liveness"));
        assert_eq!(transport.opened_urls().len(), 2);
        assert_eq!(client.connection_state(), ConnectionState::Handshaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_stops_reconnecting() {
        let (client, transport) = connected_client().await;
        let mut events = client.events();

        let link = transport.last_link().unwrap();
        link.push_frame(json!([0, null, "project disabled", true]));
        link.drop_connection("closed by server");
        settle().await;
        advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(transport.opened_urls().len(), 1);
        assert_eq!(client.connection_state(), ConnectionState::ExpectedClose);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Closed { reason: "closed by server".to_string() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_unavailable_reconnects() {
        let (client, transport) = connected_client().await;
        client.network_unavailable();
        settle().await;

        assert_eq!(transport.links()[0].close_reason().as_deref(), Some("Lost connection."));
        assert_eq!(transport.opened_urls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_driver() {
        let (client, transport) = connected_client().await;
        client.shutdown();
        settle().await;
        advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(transport.opened_urls().len(), 1);
        assert_eq!(client.connection_state(), ConnectionState::ExpectedClose);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_reply() {
        let (client, transport) = connected_client().await;
        let link = transport.last_link().unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request_reply(vec![json!("sum"), json!([1, 2])]).await })
        };
        settle().await;

        let sent = link.sent_frames();
        assert_eq!(sent.len(), 1);
        link.push_frame(json!([3, sent[0][0], 3]));
        assert_eq!(pending.await.unwrap(), Ok(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_reply_times_out() {
        let (client, transport) = connected_client().await;
        let link = transport.last_link().unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.request_reply(vec![json!("slow")]).await })
        };
        settle().await;

        advance(Duration::from_secs(31)).await;
        link.push_frame(json!([]));
        assert_eq!(pending.await.unwrap(), Err(RequestError::Timeout(Duration::from_secs(30))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_can_call_back_into_client() {
        let (client, transport) = connected_client().await;
        let link = transport.last_link().unwrap();

        let client2 = client.clone();
        let handle = client.subscribe(json!("room:42"), None, move |payload, _| {
            client2.publish(json!("echo"), payload.clone(), None);
        });
        link.assert_sent(json!([handle.id().to_wire(), "room:42"]));

        link.push_frame(json!([22, FilterHash::of_str("room:42").to_wire(), "ping"]));
        settle().await;
        link.assert_sent(json!([33, "echo", "ping"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_closed_by_earlier_callback_gets_no_delivery() {
        let (client, transport) = connected_client().await;
        let link = transport.last_link().unwrap();

        let to_close: Arc<Mutex<Option<SubscriptionHandle>>> = Default::default();
        let to_close2 = to_close.clone();
        client.subscribe(json!("room:42"), None, move |_, _| {
            if let Some(other) = to_close2.lock().unwrap().take() {
                assert!(other.close());
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let b = client.subscribe(json!("room:42"), None, move |payload, _| {
            received2.lock().unwrap().push(payload.clone());
        });
        *to_close.lock().unwrap() = Some(b.clone());
        link.sent_frames();

        link.push_frame(json!([22, FilterHash::of_str("room:42").to_wire(), "first"]));
        settle().await;

        assert!(received.lock().unwrap().is_empty());
        assert!(!b.close());
        link.assert_sent(json!([54, FilterHash::of_str("room:42").to_wire()]));
        link.assert_no_remaining_frames();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_handle() {
        let (client, transport) = connected_client().await;
        let link = transport.last_link().unwrap();
        let handle = client.subscribe(json!({"room": 42}), Some(json!({"ordered": true})), |_, _| ());
        link.assert_sent(json!([22, {"room": 42}, {"ordered": true}]));

        assert!(handle.edit(json!({"room": 42})));
        link.assert_no_remaining_frames();

        let old_hash = FilterHash::of(&json!({"room": 42}));
        assert!(handle.edit(json!({"room": 43})));
        link.assert_sent(json!([43, 22, old_hash.to_wire(), {"room": 43}]));

        assert!(handle.close());
        link.assert_sent(json!([54, FilterHash::of(&json!({"room": 43})).to_wire()]));
        assert!(!handle.close());
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_mode() {
        let transport = ScriptedTransport::new();
        let mut config = config();
        config.use_binary = true;
        let _client = Client::connect(config, transport.clone()).unwrap();
        settle().await;

        assert_eq!(transport.opened_urls(), vec!["wss://example.net/socket?en=etf".to_string()]);
        assert!(transport.last_link().unwrap().sent_raw().iter().all(|f| matches!(f, crate::transport::WireFrame::Binary(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_error_from_transport() {
        let mut transport = MockTransport::new();
        transport.expect_open()
            .times(2)
            .returning(|_| Err(anyhow::anyhow!("unreachable")));
        let client = Client::connect(config(), Arc::new(transport)).unwrap();
        settle().await;
        advance(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(client.connection_state(), ConnectionState::Connecting);
        client.shutdown();
        advance(Duration::from_secs(10)).await;
        settle().await;
    }
}
