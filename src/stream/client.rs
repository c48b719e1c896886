//! Realtime change stream client.
//!
//! The client owns one background worker that keeps a push stream open,
//! reconnecting with linear backoff when it drops. Inbound frames are parsed
//! into [`ChangeEvent`]s, checked against the [`EchoSuppressor`], and fanned
//! out to the subscribers of the event's topic.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::echo::EchoSuppressor;
use crate::retry::ReconnectPolicy;
use crate::stream::event::ChangeEvent;
use crate::stream::registry::{ChangeCallback, SubscriptionRegistry};
use crate::stream::transport::{
    is_websocket_url, EventTransport, FrameStream, SseTransport, TransportError,
    WebSocketTransport,
};

/// Default local change stream endpoint.
pub const DEFAULT_EVENTS_URL: &str = "http://localhost:8080/events";

/// Endpoint and reconnect settings for a [`StreamClient`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(DEFAULT_EVENTS_URL)
    }
}

/// Why a stream client stopped for good.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// [`StreamClient::disconnect`] was called.
    Disconnected,
    /// Every reconnection attempt failed; a new client is required.
    ReconnectExhausted,
}

/// Connection lifecycle as seen by the stream worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Waiting out the backoff before reconnection `attempt` (1-based).
    Reconnecting { attempt: u32 },
    /// Terminal.
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Live change stream with topic subscriptions.
pub struct StreamClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    url: String,
    policy: ReconnectPolicy,
    transport: Arc<dyn EventTransport>,
    echo: EchoSuppressor,
    registry: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
}

impl StreamClient {
    /// Opens the stream at `config.url`, picking the websocket transport for
    /// `ws://`/`wss://` endpoints and server-sent events otherwise.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn connect(config: StreamConfig, echo: EchoSuppressor) -> Result<Self, TransportError> {
        let transport: Arc<dyn EventTransport> = if is_websocket_url(&config.url) {
            Arc::new(WebSocketTransport)
        } else {
            Arc::new(SseTransport::new()?)
        };
        Ok(Self::connect_with_transport(config, echo, transport))
    }

    /// Opens the stream through a caller-supplied transport.
    ///
    /// The worker starts immediately; the returned client is in
    /// [`ConnectionState::Connecting`] until the transport opens.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn connect_with_transport(
        config: StreamConfig,
        echo: EchoSuppressor,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            url: config.url,
            policy: config.reconnect,
            transport,
            echo,
            registry: SubscriptionRegistry::default(),
            state,
        });
        let worker = tokio::spawn(stream_worker(Arc::clone(&shared)));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Waits until the client reaches its terminal state.
    pub async fn wait_closed(&self) -> CloseReason {
        let mut state = self.watch_state();
        let reason = match state.wait_for(ConnectionState::is_closed).await {
            Ok(current) => match *current {
                ConnectionState::Closed(reason) => reason,
                _ => CloseReason::Disconnected,
            },
            Err(_) => CloseReason::Disconnected,
        };
        reason
    }

    /// Registers `callback` for events on `topic`.
    ///
    /// Returns `false` if the pair was already registered; it is kept once.
    pub fn subscribe(&self, topic: impl Into<String>, callback: &ChangeCallback) -> bool {
        let topic = topic.into();
        debug!(event = "stream_subscribe", topic = %topic);
        self.shared.registry.insert(topic, callback)
    }

    /// Removes `callback` from `topic`. Returns `false` if it was not
    /// registered.
    pub fn unsubscribe(&self, topic: &str, callback: &ChangeCallback) -> bool {
        let removed = self.shared.registry.remove(topic, callback);
        if removed {
            debug!(event = "stream_unsubscribe", topic = %topic);
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.registry.count(topic)
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> Vec<String> {
        self.shared.registry.topics()
    }

    /// Closes the connection, cancels any pending reconnect and drops every
    /// subscription. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let changed = self.shared.state.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = ConnectionState::Closed(CloseReason::Disconnected);
            true
        });
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.shared.registry.clear();
        if changed {
            info!(event = "stream_disconnected", url = %self.shared.url);
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }

    /// Moves to `next` unless the client already reached a terminal state.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if state.is_closed() || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Reads frames until the connection fails or ends.
    async fn consume(&self, mut frames: FrameStream) -> Option<TransportError> {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => self.handle_frame(&text),
                Err(err) => return Some(err),
            }
        }
        None
    }

    fn handle_frame(&self, text: &str) {
        if self.is_closed() {
            return;
        }
        let event = match ChangeEvent::from_text(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = "stream_frame_discarded", error = %err);
                return;
            }
        };
        if self.echo.should_suppress(&event) {
            return;
        }
        self.dispatch(&event);
    }

    /// Invokes every current subscriber of the event's topic. A panicking
    /// subscriber is logged and skipped.
    fn dispatch(&self, event: &ChangeEvent) {
        for subscriber in self.registry.snapshot(&event.topic) {
            if self.is_closed() {
                break;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                error!(
                    event = "stream_subscriber_panicked",
                    topic = %event.topic,
                    operation_id = %event.operation_id,
                );
            }
        }
    }
}

async fn stream_worker(shared: Arc<Shared>) {
    let mut attempts: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);
        match shared.transport.open(&shared.url).await {
            Ok(frames) => {
                shared.set_state(ConnectionState::Open);
                attempts = 0;
                info!(event = "stream_opened", url = %shared.url);
                match shared.consume(frames).await {
                    Some(err) => warn!(event = "stream_connection_error", error = %err),
                    None => warn!(event = "stream_connection_ended"),
                }
            }
            Err(err) => {
                warn!(event = "stream_connect_failed", url = %shared.url, error = %err);
            }
        }

        if shared.is_closed() {
            return;
        }

        attempts = attempts.saturating_add(1);
        let Some(delay) = shared.policy.delay_for_attempt(attempts) else {
            error!(
                event = "stream_reconnect_exhausted",
                max_attempts = shared.policy.max_attempts,
                "max reconnection attempts reached"
            );
            shared.set_state(ConnectionState::Closed(CloseReason::ReconnectExhausted));
            return;
        };

        shared.set_state(ConnectionState::Reconnecting { attempt: attempts });
        debug!(
            event = "stream_reconnect_scheduled",
            attempt = attempts,
            delay_ms = delay.as_millis() as u64
        );
        tokio::time::sleep(delay).await;
    }
}
