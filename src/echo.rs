//! Echo suppression for locally issued mutations.
//!
//! Every mutation sent by this client is tagged with an operation id and
//! registered here first. When the server broadcasts the resulting change
//! event back to us, [`EchoSuppressor::should_suppress`] consumes the entry
//! and the stream drops the event instead of fanning it out. Entries that
//! never see their echo are swept once they outlive the TTL; a late echo is
//! then delivered like any foreign change.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::stream::event::{ChangeAction, ChangeEvent};

const OPERATION_ID_SUFFIX_LEN: usize = 7;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lifetime and sweep cadence of pending operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EchoConfig {
    /// Age after which an unmatched pending operation is dropped.
    pub ttl: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl EchoConfig {
    pub const TTL: Duration = Duration::from_secs(30);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            ttl: Self::TTL,
            sweep_interval: Self::SWEEP_INTERVAL,
        }
    }
}

/// A local mutation waiting for its echo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingOperation {
    pub operation_id: String,
    pub topic: String,
    pub action: ChangeAction,
    pub created_at: Instant,
}

/// Produces a new operation id: unix millis plus a random base36 suffix.
pub fn new_operation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..OPERATION_ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{millis}-{suffix}")
}

/// Shared registry of in-flight local mutations.
///
/// Cloning is cheap and every clone sees the same pending set, so one
/// instance can be handed to both the database client and the stream client.
#[derive(Clone)]
pub struct EchoSuppressor {
    inner: Arc<Inner>,
}

struct Inner {
    config: EchoConfig,
    pending: Mutex<HashMap<String, PendingOperation>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EchoSuppressor {
    /// Creates a suppressor with the default 30s TTL and 10s sweep.
    pub fn new() -> Self {
        Self::with_config(EchoConfig::default())
    }

    /// Creates a suppressor and starts its sweep task.
    ///
    /// The sweep is only started when called inside a Tokio runtime;
    /// otherwise [`EchoSuppressor::sweep_expired`] has to be driven by the
    /// caller.
    pub fn with_config(config: EchoConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            pending: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        });
        start_sweeper(&inner);
        Self { inner }
    }

    pub fn config(&self) -> &EchoConfig {
        &self.inner.config
    }

    /// Returns a fresh operation id for an outbound mutation.
    pub fn generate_operation_id(&self) -> String {
        new_operation_id()
    }

    /// Records that a mutation tagged `operation_id` is in flight.
    ///
    /// Without a running sweep task (after [`EchoSuppressor::reset`], or when
    /// built outside a runtime) expired entries are dropped here instead.
    pub fn register_pending(
        &self,
        operation_id: impl Into<String>,
        topic: impl Into<String>,
        action: ChangeAction,
    ) {
        let now = Instant::now();
        if !self.is_sweeping() {
            self.inner.sweep_expired(now);
        }
        let operation = PendingOperation {
            operation_id: operation_id.into(),
            topic: topic.into(),
            action,
            created_at: now,
        };
        debug!(
            event = "echo_operation_registered",
            operation_id = %operation.operation_id,
            topic = %operation.topic,
            action = %action,
        );
        let mut pending = self.inner.pending.lock();
        if let Some(previous) = pending.insert(operation.operation_id.clone(), operation) {
            debug!(
                event = "echo_operation_replaced",
                operation_id = %previous.operation_id,
            );
        }
    }

    /// Returns `true` when `event` is the echo of a pending local mutation.
    ///
    /// A match consumes the pending entry, so a repeated frame with the same
    /// operation id is delivered.
    pub fn should_suppress(&self, event: &ChangeEvent) -> bool {
        let removed = self.inner.pending.lock().remove(&event.operation_id);
        match removed {
            Some(operation) => {
                debug!(
                    event = "echo_suppressed",
                    operation_id = %operation.operation_id,
                    topic = %event.topic,
                    action = %event.action(),
                );
                true
            }
            None => false,
        }
    }

    /// Drops every pending operation older than the TTL. Returns how many
    /// were dropped.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired(Instant::now())
    }

    /// Clears all pending operations and stops the sweep.
    pub fn reset(&self) {
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        self.inner.pending.lock().clear();
        debug!(event = "echo_suppressor_reset");
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn list_pending(&self) -> Vec<PendingOperation> {
        self.inner.pending.lock().values().cloned().collect()
    }

    /// Whether the background sweep task is currently scheduled.
    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeper.lock().is_some()
    }
}

impl Default for EchoSuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EchoSuppressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoSuppressor")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Inner {
    fn sweep_expired(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|operation_id, operation| {
            let expired = now.saturating_duration_since(operation.created_at) > ttl;
            if expired {
                debug!(
                    event = "echo_operation_expired",
                    operation_id = %operation_id,
                    topic = %operation.topic,
                );
            }
            !expired
        });
        let removed = before - pending.len();
        if removed > 0 {
            info!(event = "echo_operations_expired", removed);
        }
        removed
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

fn start_sweeper(inner: &Arc<Inner>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!(event = "echo_sweeper_not_started", reason = "no tokio runtime");
        return;
    };
    let period = inner.config.sweep_interval.max(Duration::from_millis(1));
    let task = runtime.spawn(sweep_loop(Arc::downgrade(inner), period));
    *inner.sweeper.lock() = Some(task);
}

async fn sweep_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep_expired(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use serde_json::json;

    use super::{new_operation_id, EchoConfig, EchoSuppressor};
    use crate::stream::event::{ChangeAction, ChangeEvent, ChangePayload, InsertData};

    fn insert_event(topic: &str, operation_id: &str) -> ChangeEvent {
        ChangeEvent {
            topic: topic.to_string(),
            operation_id: operation_id.to_string(),
            payload: ChangePayload::Insert(InsertData {
                affected: Some(vec![json!({"id": "1"})]),
                ..InsertData::default()
            }),
        }
    }

    #[test]
    fn operation_ids_have_time_prefix_and_random_suffix() {
        let id = new_operation_id();
        let (millis, suffix) = id.split_once('-').expect("dash separator");
        assert!(millis.parse::<u128>().is_ok());
        assert_eq!(suffix.len(), 7);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn operation_ids_do_not_collide() {
        let ids: HashSet<String> = (0..1_000).map(|_| new_operation_id()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn works_without_a_runtime() {
        let echo = EchoSuppressor::new();
        assert!(!echo.is_sweeping());

        echo.register_pending("op-1", "users", ChangeAction::Insert);
        assert!(echo.should_suppress(&insert_event("users", "op-1")));
    }

    #[tokio::test]
    async fn suppresses_exactly_once_per_operation() {
        let echo = EchoSuppressor::new();
        echo.register_pending("op-1", "users", ChangeAction::Insert);

        let event = insert_event("users", "op-1");
        assert!(echo.should_suppress(&event));
        assert!(!echo.should_suppress(&event));
        assert_eq!(echo.pending_count(), 0);
    }

    #[tokio::test]
    async fn foreign_events_are_delivered() {
        let echo = EchoSuppressor::new();
        echo.register_pending("op-1", "users", ChangeAction::Insert);

        assert!(!echo.should_suppress(&insert_event("users", "op-other")));
        assert_eq!(echo.pending_count(), 1);
    }

    #[tokio::test]
    async fn list_pending_reports_metadata() {
        let echo = EchoSuppressor::new();
        echo.register_pending("op-1", "posts", ChangeAction::Delete);

        let pending = echo.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, "op-1");
        assert_eq!(pending[0].topic, "posts");
        assert_eq!(pending[0].action, ChangeAction::Delete);
        assert_eq!(echo.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_sweep_drops_only_expired_entries() {
        let echo = EchoSuppressor::with_config(EchoConfig {
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3_600),
        });
        echo.register_pending("old", "users", ChangeAction::Insert);
        tokio::time::advance(Duration::from_secs(20)).await;
        echo.register_pending("young", "users", ChangeAction::Update);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(echo.sweep_expired(), 1);
        assert!(!echo.should_suppress(&insert_event("users", "old")));
        assert_eq!(echo.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_expires_unmatched_operations() {
        let echo = EchoSuppressor::new();
        assert!(echo.is_sweeping());
        echo.register_pending("op-1", "users", ChangeAction::Insert);

        // Sweeps at 10s, 20s and 30s see an age of at most exactly the TTL.
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(echo.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(echo.pending_count(), 0);
        assert!(!echo.should_suppress(&insert_event("users", "op-1")));
    }

    #[tokio::test]
    async fn reset_clears_and_stops_sweep_idempotently() {
        let echo = EchoSuppressor::new();
        echo.register_pending("op-1", "users", ChangeAction::Insert);
        echo.register_pending("op-2", "posts", ChangeAction::Update);

        echo.reset();
        assert_eq!(echo.pending_count(), 0);
        assert!(!echo.is_sweeping());

        echo.reset();
        assert_eq!(echo.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn registrations_after_reset_stay_bounded_by_ttl() {
        let echo = EchoSuppressor::new();
        echo.reset();

        for n in 0..1000 {
            echo.register_pending(format!("op-{n}"), "users", ChangeAction::Insert);
        }
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!echo.is_sweeping());

        echo.register_pending("op-late", "users", ChangeAction::Insert);
        let pending = echo.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, "op-late");
    }

    #[tokio::test]
    async fn clones_share_pending_state() {
        let echo = EchoSuppressor::new();
        let other = echo.clone();
        echo.register_pending("op-1", "users", ChangeAction::Insert);

        assert!(other.should_suppress(&insert_event("users", "op-1")));
        assert_eq!(echo.pending_count(), 0);
    }
}
