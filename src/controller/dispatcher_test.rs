//! Tests for the reconciliation dispatcher
//!
//! These tests drive the dispatcher on a paused clock with ConfigMaps and an
//! in-memory finalizer client:
//! - Retry timing and status after recovery
//! - Per-entity mutual exclusion
//! - Leadership gating and loss
//! - Finalizer ordering, auto-attach and detach
//! - Fault isolation between entities

#[cfg(test)]
mod tests {
    use super::super::backoff::RequeuePolicy;
    use super::super::client::ResourceClient;
    use super::super::dispatcher::*;
    use super::super::entity::{EntityId, WatchEvent, WatchEventKind};
    use super::super::finalizers::{with_finalizers, Finalizer, FinalizerSet};
    use super::super::lock::EntityLockProvider;
    use super::super::status::{EntityStatus, StatusHook};
    use crate::error::{Error, Result};
    use crate::leader::LeaderState;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use kube::ResourceExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(format!("uid-{}", name)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn terminating(name: &str, finalizers: &[&str]) -> ConfigMap {
        let mut cm = config_map(name);
        cm.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        cm.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        cm
    }

    fn event(cm: ConfigMap, kind: WatchEventKind) -> WatchEvent<ConfigMap> {
        WatchEvent::new(cm, kind).unwrap()
    }

    fn id(name: &str) -> EntityId {
        EntityId::from_resource(&config_map(name)).unwrap()
    }

    /// Virtual-clock timings may round up to the next millisecond tick.
    fn assert_near(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    struct Call {
        name: String,
        at: Instant,
        finalizers: Vec<String>,
    }

    /// Controller failing a configured number of times per object name
    #[derive(Default)]
    struct ScriptedController {
        failures: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<Call>>,
        deleted: Mutex<Vec<String>>,
        work: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedController {
        fn failing(name: &str, times: u32) -> Self {
            let controller = Self::default();
            controller
                .failures
                .lock()
                .unwrap()
                .insert(name.to_string(), times);
            controller
        }

        fn calls_for(&self, name: &str) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.name == name)
                .map(|c| c.at)
                .collect()
        }
    }

    #[async_trait]
    impl Controller<ConfigMap> for ScriptedController {
        async fn reconcile(&self, obj: Arc<ConfigMap>) -> Result<()> {
            let name = obj.name_any();
            self.calls.lock().unwrap().push(Call {
                name: name.clone(),
                at: Instant::now(),
                finalizers: obj.finalizers().to_vec(),
            });

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if !self.work.is_zero() {
                sleep(self.work).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&name) {
                    Some(left) if *left > 0 => {
                        if *left != u32::MAX {
                            *left -= 1;
                        }
                        true
                    }
                    _ => false,
                }
            };
            if fail {
                Err(Error::reconcile(format!("{} not ready", name)))
            } else {
                Ok(())
            }
        }

        async fn deleted(&self, obj: Arc<ConfigMap>) -> Result<()> {
            self.deleted.lock().unwrap().push(obj.name_any());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeClient {
        added: Mutex<Vec<(String, Vec<String>)>>,
        removed: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl ResourceClient<ConfigMap> for FakeClient {
        async fn add_finalizers(&self, obj: &ConfigMap, names: &[String]) -> Result<ConfigMap> {
            self.added
                .lock()
                .unwrap()
                .push((obj.name_any(), names.to_vec()));
            let mut updated = obj.clone();
            updated.metadata.finalizers = Some(with_finalizers(obj, names));
            Ok(updated)
        }

        async fn remove_finalizers(&self, obj: &ConfigMap, names: &[String]) -> Result<()> {
            self.removed
                .lock()
                .unwrap()
                .push((obj.name_any(), names.to_vec()));
            Ok(())
        }
    }

    type Runs = Arc<Mutex<Vec<(&'static str, Instant)>>>;

    struct StepFinalizer {
        name: &'static str,
        failures: AtomicU32,
        runs: Runs,
    }

    impl StepFinalizer {
        fn new(name: &'static str, failures: u32, runs: &Runs) -> Self {
            Self {
                name,
                failures: AtomicU32::new(failures),
                runs: Arc::clone(runs),
            }
        }
    }

    #[async_trait]
    impl Finalizer<ConfigMap> for StepFinalizer {
        fn name(&self) -> &str {
            self.name
        }

        async fn finalize(&self, _obj: Arc<ConfigMap>) -> Result<()> {
            self.runs.lock().unwrap().push((self.name, Instant::now()));
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::reconcile("cleanup pending"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct ForgetRecorder {
        forgotten: Mutex<Vec<EntityId>>,
    }

    impl StatusHook for ForgetRecorder {
        fn status_changed(&self, _id: &EntityId, _status: &EntityStatus) {}

        fn entity_forgotten(&self, id: &EntityId) {
            self.forgotten.lock().unwrap().push(id.clone());
        }
    }

    /// Keeps every published status in order
    #[derive(Default)]
    struct StatusLog {
        updates: Mutex<Vec<EntityStatus>>,
    }

    impl StatusHook for StatusLog {
        fn status_changed(&self, _id: &EntityId, status: &EntityStatus) {
            self.updates.lock().unwrap().push(status.clone());
        }
    }

    fn options() -> DispatcherOptions {
        DispatcherOptions {
            policy: RequeuePolicy::new(Duration::from_secs(1), Duration::from_secs(5)),
            ..Default::default()
        }
    }

    fn dispatcher(
        controller: &Arc<ScriptedController>,
        finalizers: FinalizerSet<ConfigMap>,
        client: &Arc<FakeClient>,
        leader: LeaderState,
        options: DispatcherOptions,
    ) -> ReconciliationDispatcher<ConfigMap> {
        ReconciliationDispatcher::new(
            Arc::clone(controller) as Arc<dyn Controller<ConfigMap>>,
            finalizers,
            Arc::clone(client) as Arc<dyn ResourceClient<ConfigMap>>,
            EntityLockProvider::default(),
            leader,
            options,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_retried_with_linear_backoff() {
        let controller = Arc::new(ScriptedController::failing("bar", 3));
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            options(),
        );

        assert!(d.handle_event(event(config_map("bar"), WatchEventKind::Added)));

        sleep(Duration::from_millis(500)).await;
        let status = d.status(&id("bar")).unwrap();
        assert_eq!(status.attempt, 1);
        assert!(status.next_fire_at.is_some());
        assert!(status.last_error.unwrap().contains("bar not ready"));
        assert!(d.is_queued(&id("bar")));
        assert_eq!(d.retrying().len(), 1);

        sleep(Duration::from_secs(10)).await;
        let calls = controller.calls_for("bar");
        assert_eq!(calls.len(), 4);
        assert_near(calls[1] - calls[0], Duration::from_secs(1));
        assert_near(calls[2] - calls[1], Duration::from_secs(2));
        assert_near(calls[3] - calls[2], Duration::from_secs(3));

        assert_eq!(
            d.status(&id("bar")),
            Some(EntityStatus {
                attempt: 0,
                next_fire_at: None,
                last_error: None,
                error_kind: None,
            })
        );
        assert!(!d.is_queued(&id("bar")));
        assert!(d.retrying().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_entity_never_runs_concurrently() {
        let controller = Arc::new(ScriptedController {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            options(),
        );

        d.handle_event(event(config_map("a"), WatchEventKind::Added));
        sleep(Duration::from_millis(10)).await;
        // queued behind the running reconcile
        assert!(d.handle_event(event(config_map("a"), WatchEventKind::Modified)));

        sleep(Duration::from_millis(500)).await;
        let calls = controller.calls_for("a");
        assert_eq!(calls.len(), 2);
        assert_eq!(controller.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(calls[1] - calls[0] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_entities_run_in_parallel() {
        let controller = Arc::new(ScriptedController {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            options(),
        );

        d.handle_event(event(config_map("a"), WatchEventKind::Added));
        d.handle_event(event(config_map("b"), WatchEventKind::Added));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(controller.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_ignored_while_not_leader() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let leader = LeaderState::new();
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            leader.clone(),
            options(),
        );

        assert!(!d.handle_event(event(config_map("foo"), WatchEventKind::Modified)));
        sleep(Duration::from_secs(1)).await;
        assert!(controller.calls_for("foo").is_empty());
        assert_eq!(d.queued(), 0);

        leader.set_leader(true);
        assert!(d.handle_event(event(config_map("foo"), WatchEventKind::Modified)));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.calls_for("foo").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_leadership_stops_pending_retries() {
        let controller = Arc::new(ScriptedController::failing("foo", u32::MAX));
        let client = Arc::new(FakeClient::default());
        let leader = LeaderState::always_leader();
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            leader.clone(),
            options(),
        );

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let runner = {
            let d = d.clone();
            let term = leader.term();
            tokio::spawn(async move { d.run(rx, term).await })
        };

        tx.unbounded_send(event(config_map("foo"), WatchEventKind::Added))
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.calls_for("foo").len(), 1);
        assert!(d.is_queued(&id("foo")));

        leader.set_leader(false);
        runner.await.unwrap();
        assert_eq!(d.queued(), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.calls_for("foo").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_the_stream_ends() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let leader = LeaderState::always_leader();
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            leader.clone(),
            options(),
        );

        let events = futures::stream::iter(vec![
            event(config_map("a"), WatchEventKind::Added),
            event(config_map("b"), WatchEventKind::Added),
        ]);
        d.run(events, leader.term()).await;

        sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.calls_for("a").len(), 1);
        assert_eq!(controller.calls_for("b").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalizers_run_in_order_until_all_succeed() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let runs: Runs = Arc::new(Mutex::new(Vec::new()));
        let mut finalizers = FinalizerSet::new();
        finalizers
            .register(StepFinalizer::new("test/first", 0, &runs))
            .unwrap();
        finalizers
            .register(StepFinalizer::new("test/second", 2, &runs))
            .unwrap();
        let d = dispatcher(
            &controller,
            finalizers,
            &client,
            LeaderState::always_leader(),
            options(),
        );

        let doomed = terminating("gone", &["test/first", "test/second"]);
        d.handle_event(event(doomed, WatchEventKind::Modified));

        sleep(Duration::from_millis(500)).await;
        let status = d.status(&id("gone")).unwrap();
        assert_eq!(status.attempt, 1);
        assert!(status
            .last_error
            .unwrap()
            .contains("Finalizer test/second failed"));
        assert!(client.removed.lock().unwrap().is_empty());

        sleep(Duration::from_secs(10)).await;
        let runs = runs.lock().unwrap();
        let order: Vec<&str> = runs.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            order,
            vec![
                "test/first",
                "test/second",
                "test/first",
                "test/second",
                "test/first",
                "test/second",
            ]
        );
        assert_near(runs[2].1 - runs[0].1, Duration::from_secs(1));
        assert_near(runs[4].1 - runs[2].1, Duration::from_secs(2));

        let removed = client.removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(
            removed[0],
            (
                "gone".to_string(),
                vec!["test/first".to_string(), "test/second".to_string()]
            )
        );

        // reconcile never runs for an object being deleted
        assert!(controller.calls_for("gone").is_empty());
        assert!(d.status(&id("gone")).is_none());
        assert!(!d.is_queued(&id("gone")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_pending_finalizers_run() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let runs: Runs = Arc::new(Mutex::new(Vec::new()));
        let mut finalizers = FinalizerSet::new();
        finalizers
            .register(StepFinalizer::new("test/first", 0, &runs))
            .unwrap();
        finalizers
            .register(StepFinalizer::new("test/second", 0, &runs))
            .unwrap();
        let d = dispatcher(
            &controller,
            finalizers,
            &client,
            LeaderState::always_leader(),
            options(),
        );

        let doomed = terminating("half", &["other.io/keep", "test/second"]);
        d.handle_event(event(doomed, WatchEventKind::Modified));
        sleep(Duration::from_secs(1)).await;

        let order: Vec<&str> = runs.lock().unwrap().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec!["test/second"]);
        assert_eq!(
            client.removed.lock().unwrap()[0].1,
            vec!["test/second".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_finalizers_are_left_alone() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let runs: Runs = Arc::new(Mutex::new(Vec::new()));
        let mut finalizers = FinalizerSet::new();
        finalizers
            .register(StepFinalizer::new("test/first", 0, &runs))
            .unwrap();
        let d = dispatcher(
            &controller,
            finalizers,
            &client,
            LeaderState::always_leader(),
            options(),
        );

        let doomed = terminating("foreign", &["other.io/keep"]);
        d.handle_event(event(doomed, WatchEventKind::Modified));
        sleep(Duration::from_secs(1)).await;

        assert!(runs.lock().unwrap().is_empty());
        assert!(controller.calls_for("foreign").is_empty());
        assert!(client.removed.lock().unwrap().is_empty());
        assert!(!d.is_queued(&id("foreign")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_finalizers_are_attached_before_reconcile() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let runs: Runs = Arc::new(Mutex::new(Vec::new()));
        let mut finalizers = FinalizerSet::new();
        finalizers
            .register(StepFinalizer::new("test/cleanup", 0, &runs))
            .unwrap();
        let d = dispatcher(
            &controller,
            finalizers,
            &client,
            LeaderState::always_leader(),
            options(),
        );

        d.handle_event(event(config_map("fresh"), WatchEventKind::Added));
        sleep(Duration::from_secs(1)).await;

        let added = client.added.lock().unwrap();
        assert_eq!(
            added[0],
            ("fresh".to_string(), vec!["test/cleanup".to_string()])
        );
        let calls = controller.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].finalizers, vec!["test/cleanup".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_attach_can_be_disabled() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let runs: Runs = Arc::new(Mutex::new(Vec::new()));
        let mut finalizers = FinalizerSet::new();
        finalizers
            .register(StepFinalizer::new("test/cleanup", 0, &runs))
            .unwrap();
        let d = dispatcher(
            &controller,
            finalizers,
            &client,
            LeaderState::always_leader(),
            DispatcherOptions {
                auto_attach_finalizers: false,
                ..options()
            },
        );

        d.handle_event(event(config_map("plain"), WatchEventKind::Added));
        sleep(Duration::from_secs(1)).await;

        assert!(client.added.lock().unwrap().is_empty());
        assert!(controller.calls.lock().unwrap()[0].finalizers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_object_without_finalizers_notifies_controller() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let recorder = Arc::new(ForgetRecorder::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            DispatcherOptions {
                status_hooks: vec![Arc::clone(&recorder) as Arc<dyn StatusHook>],
                ..options()
            },
        );

        d.handle_event(event(config_map("old"), WatchEventKind::Added));
        sleep(Duration::from_secs(1)).await;
        assert!(d.status(&id("old")).is_some());

        d.handle_event(event(config_map("old"), WatchEventKind::Deleted));
        sleep(Duration::from_secs(1)).await;

        assert_eq!(*controller.deleted.lock().unwrap(), vec!["old".to_string()]);
        assert_eq!(controller.calls_for("old").len(), 1);
        assert!(d.status(&id("old")).is_none());
        assert_eq!(*recorder.forgotten.lock().unwrap(), vec![id("old")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_entity_does_not_block_others() {
        let controller = Arc::new(ScriptedController::failing("bad", u32::MAX));
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            options(),
        );

        d.handle_event(event(config_map("bad"), WatchEventKind::Added));
        d.handle_event(event(config_map("good"), WatchEventKind::Added));
        sleep(Duration::from_secs(4)).await;

        assert_eq!(controller.calls_for("good").len(), 1);
        assert!(controller.calls_for("bad").len() >= 3);

        let retrying = d.retrying();
        assert_eq!(retrying.len(), 1);
        assert_eq!(retrying[0].0, id("bad"));
        assert!(d.status(&id("good")).is_some_and(|s| !s.is_retrying()));

        d.shutdown();
        assert_eq!(d.queued(), 0);
        assert!(d.locks().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_uses_the_newest_object() {
        let controller = Arc::new(ScriptedController::failing("cfg", 1));
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            DispatcherOptions {
                auto_attach_finalizers: false,
                ..options()
            },
        );

        d.handle_event(event(config_map("cfg"), WatchEventKind::Added));
        sleep(Duration::from_millis(100)).await;

        // debounced behind the pending retry, but its object wins
        let mut updated = config_map("cfg");
        updated.metadata.finalizers = Some(vec!["marker".to_string()]);
        assert!(!d.handle_event(event(updated, WatchEventKind::Modified)));

        sleep(Duration::from_secs(2)).await;
        let calls = controller.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].finalizers.is_empty());
        assert_eq!(calls[1].finalizers, vec!["marker".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_during_a_reconcile_runs_it_once_more() {
        let controller = Arc::new(ScriptedController {
            work: Duration::from_secs(1),
            ..Default::default()
        });
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            options(),
        );

        d.handle_event(event(config_map("a"), WatchEventKind::Added));
        sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            d.handle_event(event(config_map("a"), WatchEventKind::Modified));
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(d.queued(), 1);

        sleep(Duration::from_secs(5)).await;
        let calls = controller.calls_for("a");
        assert_eq!(calls.len(), 2);
        assert_near(calls[1] - calls[0], Duration::from_secs(1));
        assert_eq!(controller.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!d.is_queued(&id("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_keeps_growing_under_steady_watch_traffic() {
        let controller = Arc::new(ScriptedController {
            work: Duration::from_millis(200),
            ..ScriptedController::failing("busy", u32::MAX)
        });
        let client = Arc::new(FakeClient::default());
        let log = Arc::new(StatusLog::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            DispatcherOptions {
                status_hooks: vec![Arc::clone(&log) as Arc<dyn StatusHook>],
                ..options()
            },
        );

        // an update every 100ms for 20s
        for _ in 0..200 {
            d.handle_event(event(config_map("busy"), WatchEventKind::Modified));
            sleep(Duration::from_millis(100)).await;
        }

        // fires at 0, 1.2, 3.4, 6.6, 10.8 and 16s
        let calls = controller.calls_for("busy");
        assert_eq!(calls.len(), 6);
        assert_near(calls[2] - calls[1], Duration::from_millis(2_200));
        assert_near(calls[5] - calls[4], Duration::from_millis(5_200));

        let attempts: Vec<u32> = log.updates.lock().unwrap().iter().map(|s| s.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(d.status(&id("busy")).map(|s| s.attempt), Some(6));
        assert!(d.is_queued(&id("busy")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_status_reports_the_real_schedule() {
        let controller = Arc::new(ScriptedController {
            work: Duration::from_millis(500),
            ..ScriptedController::failing("slow", 1)
        });
        let client = Arc::new(FakeClient::default());
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            LeaderState::always_leader(),
            options(),
        );

        d.handle_event(event(config_map("slow"), WatchEventKind::Added));
        sleep(Duration::from_millis(100)).await;
        // merged into the retry, which keeps its 1s backoff
        d.handle_event(event(config_map("slow"), WatchEventKind::Modified));
        sleep(Duration::from_millis(450)).await;

        let status = d.status(&id("slow")).unwrap();
        assert_eq!(status.attempt, 1);
        let wait = status.next_fire_at.unwrap() - chrono::Utc::now();
        assert!(wait > chrono::Duration::milliseconds(800));

        sleep(Duration::from_secs(5)).await;
        let calls = controller.calls_for("slow");
        assert_eq!(calls.len(), 2);
        assert_near(calls[1] - calls[0], Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_loss_forgets_cached_entities() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let recorder = Arc::new(ForgetRecorder::default());
        let leader = LeaderState::always_leader();
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            leader.clone(),
            DispatcherOptions {
                status_hooks: vec![Arc::clone(&recorder) as Arc<dyn StatusHook>],
                ..options()
            },
        );

        let (tx, rx) = futures::channel::mpsc::unbounded();
        let runner = {
            let d = d.clone();
            let term = leader.term();
            tokio::spawn(async move { d.run(rx, term).await })
        };
        tx.unbounded_send(event(config_map("gone"), WatchEventKind::Added))
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(d.tracked(), 1);
        assert!(d.status(&id("gone")).is_some());

        leader.set_leader(false);
        runner.await.unwrap();
        // deleted while following; never dispatched
        assert!(!d.handle_event(event(config_map("gone"), WatchEventKind::Deleted)));
        leader.set_leader(true);

        assert_eq!(d.tracked(), 0);
        assert!(d.status(&id("gone")).is_none());
        assert!(d.retrying().is_empty());
        assert_eq!(*recorder.forgotten.lock().unwrap(), vec![id("gone")]);
        assert!(controller.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_waiter_is_abandoned_when_leadership_is_lost() {
        let controller = Arc::new(ScriptedController::default());
        let client = Arc::new(FakeClient::default());
        let leader = LeaderState::always_leader();
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            leader.clone(),
            options(),
        );

        let held = d.locks().acquire(&id("a")).await.unwrap();
        d.handle_event(event(config_map("a"), WatchEventKind::Added));
        sleep(Duration::from_millis(100)).await;
        assert!(controller.calls_for("a").is_empty());

        leader.set_leader(false);
        sleep(Duration::from_millis(10)).await;
        drop(held);

        sleep(Duration::from_secs(5)).await;
        assert!(controller.calls_for("a").is_empty());
        assert!(!d.is_queued(&id("a")));
        assert!(d.status(&id("a")).is_none());
        assert_eq!(d.locks().active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_leadership_loss_is_not_retried() {
        let controller = Arc::new(ScriptedController {
            work: Duration::from_secs(1),
            ..ScriptedController::failing("late", u32::MAX)
        });
        let client = Arc::new(FakeClient::default());
        let leader = LeaderState::always_leader();
        let d = dispatcher(
            &controller,
            FinalizerSet::new(),
            &client,
            leader.clone(),
            options(),
        );

        d.handle_event(event(config_map("late"), WatchEventKind::Added));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(controller.calls_for("late").len(), 1);

        // the callback body finishes, but its failure is dropped
        leader.set_leader(false);
        sleep(Duration::from_secs(10)).await;

        assert_eq!(controller.calls_for("late").len(), 1);
        assert!(!d.is_queued(&id("late")));
        assert!(d.status(&id("late")).is_none());
        assert!(d.retrying().is_empty());
    }
}
