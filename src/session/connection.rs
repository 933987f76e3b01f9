//! The async part of a session: a driver task owning the transport's event stream and all
//!  timers, feeding everything into the (synchronous) [SessionState].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::session::session_config::SessionConfig;
use crate::session::session_events::Dispatcher;
use crate::session::session_state::SessionState;
use crate::transport::{Transport, TransportEvent, TransportLink};

/// Session state shared between the driver task and the client API
pub struct SessionShared {
    pub config: Arc<SessionConfig>,
    state: Mutex<SessionState>,
    dispatcher: Dispatcher,
    /// notified by the session state whenever it tears down its link
    link_signal: Arc<Notify>,
}

impl SessionShared {
    pub fn new(config: Arc<SessionConfig>) -> SessionShared {
        let link_signal = Arc::new(Notify::new());
        SessionShared {
            state: Mutex::new(SessionState::new(config.clone(), link_signal.clone(), Instant::now())),
            dispatcher: Dispatcher::new(config.event_channel_capacity),
            link_signal,
            config,
        }
    }

    /// Runs a state transition, and after releasing the lock, all callbacks it triggered
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let (result, dispatches) = {
            let mut state = self.lock_state();
            let result = f(&mut state);
            (result, state.take_dispatches())
        };
        self.dispatcher.run(dispatches, |id| self.lock_state().delivery_callback(id));
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Keeps the session connected until it is closed for good: opens links, re-opens them after
///  they are lost or stall, and watches liveness.
pub async fn run_connection_driver(shared: Arc<SessionShared>, transport: Arc<dyn Transport>) {
    let url = shared.config.effective_url();

    loop {
        if !shared.with_state(|s| s.begin_connecting()) {
            info!("session closed for good - stopping connection driver");
            return;
        }

        // NB: an attempt that does not get a response within the reconnect interval is
        //      abandoned, and the next attempt starts one interval after this one
        let retry_at = Instant::now() + shared.config.reconnect_interval;
        debug!("connecting to {}", url);

        let was_established = match timeout_at(retry_at, transport.open(&url)).await {
            Ok(Ok(link)) => drive_link(&shared, link, retry_at).await,
            Ok(Err(e)) => {
                warn!("failed to connect to {}: {}", url, e);
                false
            }
            Err(_) => {
                warn!("connecting to {} timed out", url);
                false
            }
        };

        // after losing an established session, reconnecting starts right away
        if !was_established {
            wait_for_retry(&shared, retry_at).await;
        }
    }
}

async fn wait_for_retry(shared: &SessionShared, retry_at: Instant) {
    loop {
        select! {
            _ = sleep_until(retry_at) => return,
            _ = shared.link_signal.notified() => {
                if shared.with_state(|s| s.is_expected_close()) {
                    return;
                }
            }
        }
    }
}

/// Processes a link's events until the link is gone. Returns true if a session was established
///  on the link.
async fn drive_link(shared: &SessionShared, link: TransportLink, connect_deadline: Instant) -> bool {
    let TransportLink { handle, mut events } = link;
    let Some(epoch) = shared.with_state(|s| s.on_link_opened(handle, Instant::now())) else {
        return false;
    };

    let liveness_timeout = shared.config.liveness_timeout;
    let mut confirmed = false;
    let mut established = false;

    let watchdog = sleep(liveness_timeout);
    tokio::pin!(watchdog);

    loop {
        select! {
            event = events.recv() => match event {
                Some(TransportEvent::Message(frame)) => {
                    confirmed = true;
                    watchdog.as_mut().reset(Instant::now() + liveness_timeout);
                    established |= shared.with_state(|s| {
                        s.on_frame(epoch, &frame, Instant::now());
                        s.session_info().is_some()
                    });
                }
                Some(TransportEvent::Closed { code, reason }) => {
                    debug!("transport closed the link: {} {}", code, reason);
                    shared.with_state(|s| s.on_link_closed(epoch, &reason));
                    return established;
                }
                None => {
                    shared.with_state(|s| s.on_link_closed(epoch, "Connection lost."));
                    return established;
                }
            },
            _ = shared.link_signal.notified() => {
                if shared.with_state(|s| s.link_epoch()) != epoch {
                    return established;
                }
            }
            _ = sleep_until(connect_deadline), if !confirmed => {
                debug!("no response on the new link - abandoning it");
                shared.with_state(|s| s.close_link(epoch, "Closing old socket connection."));
                return false;
            }
            _ = &mut watchdog => {
                warn!("no frame received for {:?} - closing the link", liveness_timeout);
                shared.with_state(|s| s.close_link(epoch, "no liveness"));
                return established;
            }
        }
    }
}
