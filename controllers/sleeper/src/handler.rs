//! Sleeper reaction handler.
//!
//! A Sleeper seen in state `New` is moved to `Sleeping` and gets a timer;
//! when the timer fires the Sleeper is moved to `Awake` with its wake up
//! message. At most one timer runs per Sleeper. Timers are tracked so
//! shutdown can cancel and wait for them.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use crds::{Sleeper, SleeperState, SleeperStatus};
use kindstore::{ObjectKey, ReactionHandler, Scheme};
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::Client;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Writes Sleeper status.
#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    /// Replace the status of the Sleeper at `key`
    async fn write_status(&self, key: &ObjectKey, status: &SleeperStatus) -> Result<(), ControllerError>;
}

/// Status writer using the status subresource.
#[derive(Clone)]
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    /// Writer patching through `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for KubeStatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStatusWriter").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write_status(&self, key: &ObjectKey, status: &SleeperStatus) -> Result<(), ControllerError> {
        let api: Api<Sleeper> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

struct Timer {
    id: u64,
    cancel: CancellationToken,
    /// `Awake` was written; kept until that write is seen so late echoes of
    /// `Sleeping` do not start another timer.
    fired: bool,
}

/// Reacts to Sleeper events by scheduling wake ups.
pub struct SleeperHandler {
    writer: Arc<dyn StatusWriter>,
    timers: Arc<Mutex<HashMap<ObjectKey, Timer>>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl std::fmt::Debug for SleeperHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SleeperHandler")
            .field("pending_timers", &self.pending())
            .finish_non_exhaustive()
    }
}

impl SleeperHandler {
    /// Timers stop early when `token` is cancelled.
    pub fn new(writer: Arc<dyn StatusWriter>, token: CancellationToken) -> Self {
        Self {
            writer,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            token,
        }
    }

    /// Number of timers not yet fired or cancelled
    pub fn pending(&self) -> usize {
        self.timers.lock().values().filter(|timer| !timer.fired).count()
    }

    async fn reconcile(&self, obj: &DynamicObject) {
        let key = match ObjectKey::from_object(obj) {
            Ok(key) => key,
            Err(e) => {
                warn!("Ignoring Sleeper event: {}", e);
                return;
            }
        };
        let sleeper: Sleeper = match Scheme::decode(obj) {
            Ok(sleeper) => sleeper,
            Err(e) => {
                if raw_state(obj) == Some("Error") {
                    return;
                }
                warn!("Sleeper {} is malformed: {}", key, e);
                let status = SleeperStatus {
                    state: SleeperState::Error,
                    message: Some(e.to_string()),
                    last_transition: Some(Utc::now()),
                };
                if let Err(e) = self.writer.write_status(&key, &status).await {
                    error!("Failed to report error on Sleeper {}: {}", key, e);
                }
                return;
            }
        };

        let state = sleeper.state();
        let waiting = matches!(state, SleeperState::New | SleeperState::Sleeping);
        if waiting && self.timers.lock().contains_key(&key) {
            debug!("Sleeper {} already has a timer", key);
            return;
        }

        match state {
            SleeperState::New => {
                let status = SleeperStatus {
                    state: SleeperState::Sleeping,
                    message: None,
                    last_transition: Some(Utc::now()),
                };
                if let Err(e) = self.writer.write_status(&key, &status).await {
                    // Still New, so the next resync retries
                    warn!("Failed to put Sleeper {} to sleep: {}", key, e);
                    return;
                }
                info!("Sleeper {} sleeping for {:?}", key, sleeper.sleep_duration());
                self.schedule(key, &sleeper, sleeper.sleep_duration());
            }
            SleeperState::Sleeping => {
                let remaining = remaining_sleep(&sleeper, Utc::now());
                info!("Sleeper {} resumed with {:?} left", key, remaining);
                self.schedule(key, &sleeper, remaining);
            }
            SleeperState::Awake | SleeperState::Error => {
                debug!("Sleeper {} is {:?}, nothing to do", key, state);
                self.cancel(&key);
            }
        }
    }

    fn schedule(&self, key: ObjectKey, sleeper: &Sleeper, delay: Duration) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.token.child_token();
        self.timers.lock().insert(
            key.clone(),
            Timer {
                id,
                cancel: cancel.clone(),
                fired: false,
            },
        );

        let writer = Arc::clone(&self.writer);
        let timers = Arc::clone(&self.timers);
        let message = sleeper.spec.wakeup_message.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Timer for Sleeper {} cancelled", key);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            let status = SleeperStatus {
                state: SleeperState::Awake,
                message: Some(message),
                last_transition: Some(Utc::now()),
            };
            let written = writer.write_status(&key, &status).await;
            let mut timers = timers.lock();
            let current = timers.get_mut(&key).filter(|timer| timer.id == id);
            match written {
                Ok(()) => {
                    info!("Sleeper {} is awake", key);
                    if let Some(timer) = current {
                        timer.fired = true;
                    }
                }
                // Still Sleeping, so the next resync reschedules with nothing left
                Err(e) => {
                    warn!("Failed to wake Sleeper {}: {}", key, e);
                    if current.is_some() {
                        timers.remove(&key);
                    }
                }
            }
        });
    }

    fn cancel(&self, key: &ObjectKey) {
        if let Some(timer) = self.timers.lock().remove(key) {
            if !timer.fired {
                debug!("Cancelling timer for Sleeper {}", key);
                timer.cancel.cancel();
            }
        }
    }
}

/// Time still to sleep, measured from the last transition into `Sleeping`.
fn remaining_sleep(sleeper: &Sleeper, now: DateTime<Utc>) -> Duration {
    let total = sleeper.sleep_duration();
    let Some(since) = sleeper.status.as_ref().and_then(|s| s.last_transition) else {
        return total;
    };
    let elapsed = (now - since).to_std().unwrap_or_default();
    total.saturating_sub(elapsed)
}

fn raw_state(obj: &DynamicObject) -> Option<&str> {
    obj.data.get("status")?.get("state")?.as_str()
}

#[async_trait::async_trait]
impl ReactionHandler for SleeperHandler {
    async fn on_add(&self, obj: &DynamicObject) {
        self.reconcile(obj).await;
    }

    async fn on_update(&self, _old: &DynamicObject, new: &DynamicObject) {
        self.reconcile(new).await;
    }

    async fn on_delete(&self, obj: &DynamicObject) {
        if let Ok(key) = ObjectKey::from_object(obj) {
            self.cancel(&key);
        }
    }

    async fn shutdown(&self) {
        info!("Draining {} Sleeper timer(s)", self.pending());
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::SleeperSpec;

    #[derive(Default)]
    struct RecordingWriter {
        writes: Mutex<Vec<(ObjectKey, SleeperStatus)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl StatusWriter for RecordingWriter {
        async fn write_status(&self, key: &ObjectKey, status: &SleeperStatus) -> Result<(), ControllerError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ControllerError::InvalidConfig("write refused".to_string()));
            }
            self.writes.lock().push((key.clone(), status.clone()));
            Ok(())
        }
    }

    impl RecordingWriter {
        fn states(&self) -> Vec<SleeperState> {
            self.writes.lock().iter().map(|(_, s)| s.state).collect()
        }
    }

    fn sleeper(name: &str, sleep_for: u64, status: Option<SleeperStatus>) -> DynamicObject {
        let mut sleeper = Sleeper::new(
            name,
            SleeperSpec {
                sleep_for,
                wakeup_message: format!("{name} is up"),
            },
        );
        sleeper.metadata.namespace = Some("default".to_string());
        sleeper.status = status;
        Scheme::encode(&sleeper).unwrap()
    }

    fn sleeping_since(since: DateTime<Utc>) -> Option<SleeperStatus> {
        Some(SleeperStatus {
            state: SleeperState::Sleeping,
            message: None,
            last_transition: Some(since),
        })
    }

    fn handler() -> (Arc<RecordingWriter>, SleeperHandler) {
        let writer = Arc::new(RecordingWriter::default());
        let handler = SleeperHandler::new(writer.clone(), CancellationToken::new());
        (writer, handler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_sleeper_sleeps_then_wakes() {
        let (writer, handler) = handler();
        handler.on_add(&sleeper("nap", 5, None)).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping]);
        assert_eq!(handler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping, SleeperState::Awake]);
        let (key, awake) = writer.writes.lock()[1].clone();
        assert_eq!(key, ObjectKey::namespaced("default", "nap"));
        assert_eq!(awake.message.as_deref(), Some("nap is up"));
        assert_eq!(handler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_deliveries_schedule_one_timer() {
        let (writer, handler) = handler();
        let obj = sleeper("nap", 5, None);
        handler.on_add(&obj).await;
        handler.on_update(&obj, &obj).await;
        // Our own status write coming back
        let echoed = sleeper("nap", 5, sleeping_since(Utc::now()));
        handler.on_update(&obj, &echoed).await;
        assert_eq!(handler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping, SleeperState::Awake]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_sleeping_echo_does_not_wake_twice() {
        let (writer, handler) = handler();
        let obj = sleeper("nap", 0, None);
        handler.on_add(&obj).await;

        // Timer fires before our Sleeping write is seen
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping, SleeperState::Awake]);
        assert_eq!(handler.pending(), 0);

        let sleeping = sleeper("nap", 0, sleeping_since(Utc::now()));
        handler.on_update(&obj, &sleeping).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping, SleeperState::Awake]);

        let awake = sleeper(
            "nap",
            0,
            Some(SleeperStatus {
                state: SleeperState::Awake,
                message: Some("nap is up".to_string()),
                last_transition: Some(Utc::now()),
            }),
        );
        handler.on_update(&sleeping, &awake).await;
        assert!(handler.timers.lock().is_empty());
        assert_eq!(writer.states(), vec![SleeperState::Sleeping, SleeperState::Awake]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_after_restart_is_rescheduled() {
        let (writer, handler) = handler();
        let overdue = sleeper("nap", 5, sleeping_since(Utc::now() - chrono::Duration::seconds(60)));
        handler.on_add(&overdue).await;
        assert!(writer.states().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.states(), vec![SleeperState::Awake]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_timer() {
        let (writer, handler) = handler();
        let obj = sleeper("nap", 5, None);
        handler.on_add(&obj).await;
        handler.on_delete(&obj).await;
        assert_eq!(handler.pending(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_awake_sleeper_is_left_alone() {
        let (writer, handler) = handler();
        let awake = SleeperStatus {
            state: SleeperState::Awake,
            message: Some("done".to_string()),
            last_transition: None,
        };
        handler.on_add(&sleeper("nap", 5, Some(awake))).await;
        assert!(writer.states().is_empty());
        assert_eq!(handler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sleep_write_schedules_nothing() {
        let (writer, handler) = handler();
        writer.fail.store(true, Ordering::SeqCst);
        handler.on_add(&sleeper("nap", 5, None)).await;
        assert_eq!(handler.pending(), 0);

        // Retried on the next delivery
        writer.fail.store(false, Ordering::SeqCst);
        let obj = sleeper("nap", 5, None);
        handler.on_update(&obj, &obj).await;
        assert_eq!(writer.states(), vec![SleeperState::Sleeping]);
        assert_eq!(handler.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_sleeper_reports_error_once() {
        let (writer, handler) = handler();
        let mut broken = sleeper("nap", 5, None);
        broken.data = json!({ "spec": { "sleepFor": "a while" } });
        handler.on_add(&broken).await;
        assert_eq!(writer.states(), vec![SleeperState::Error]);

        broken.data["status"] = json!({ "state": "Error" });
        handler.on_update(&broken, &broken).await;
        assert_eq!(writer.states(), vec![SleeperState::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_pending_timers() {
        let (writer, handler) = handler();
        handler.on_add(&sleeper("a", 30, None)).await;
        handler.on_add(&sleeper("b", 60, None)).await;
        assert_eq!(handler.pending(), 2);

        tokio::time::timeout(Duration::from_secs(1), handler.shutdown())
            .await
            .unwrap();
        assert!(handler.tracker.is_empty());
        assert_eq!(writer.states(), vec![SleeperState::Sleeping, SleeperState::Sleeping]);
    }

    #[test]
    fn test_remaining_sleep() {
        let now = Utc::now();
        let obj = sleeper("nap", 10, sleeping_since(now - chrono::Duration::seconds(4)));
        let sleeper: Sleeper = Scheme::decode(&obj).unwrap();
        assert_eq!(remaining_sleep(&sleeper, now), Duration::from_secs(6));

        let future = sleeper_at(now + chrono::Duration::seconds(30));
        assert_eq!(remaining_sleep(&future, now), Duration::from_secs(10));
    }

    fn sleeper_at(since: DateTime<Utc>) -> Sleeper {
        Scheme::decode(&sleeper("nap", 10, sleeping_since(since))).unwrap()
    }
}
