//! The background worker runtime.
//!
//! Workers drain the task queue from the store: claiming the oldest PENDING
//! row is the only pickup path, so no two workers ever receive the same
//! task, and all mutual exclusion between workers is mediated by the store
//! and the admission check; there are no in-process locks coordinating
//! across workers.
//!
//! A claimed task synchronizes in STARTED, recording a human-readable
//! blockage cause while it waits. It enters RUNNING only once admission
//! clears, and then runs under its hard timeout. External revocation is
//! honored at suspension points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::TaskRowId;
use crate::metrics::BrokerMetrics;
use crate::store::{BrokerStore, TaskDraft};
use crate::tasks::registry::{TaskContext, TaskRegistry};
use crate::tasks::{admission_blockage, TaskRecord, TaskState};

/// Execution outcome labels for the metrics taxonomy.
mod outcomes {
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
    pub const TIMEOUT: &str = "timeout";
    pub const REVOKED: &str = "revoked";
    pub const BLOCKED: &str = "blocked";
}

/// Publishes tasks of registered types.
///
/// Cheap to clone; the runtime injects one into every task context so
/// handlers can enqueue follow-up work.
#[derive(Clone)]
pub struct TaskPublisher {
    store: Arc<dyn BrokerStore>,
    registry: Arc<TaskRegistry>,
}

impl TaskPublisher {
    /// Creates a publisher over the given store and registry.
    #[must_use]
    pub fn new(store: Arc<dyn BrokerStore>, registry: Arc<TaskRegistry>) -> Self {
        Self { store, registry }
    }

    /// Publishes a task of a registered type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] for an unregistered name.
    pub async fn publish(&self, name: &str, args: Value) -> Result<TaskRecord> {
        let registration = self
            .registry
            .get(name)
            .ok_or_else(|| Error::admission_denied(format!("unregistered task {name:?}")))?;
        let record = self
            .store
            .insert_task(TaskDraft {
                name: registration.name.clone(),
                task_id: Uuid::new_v4().to_string(),
                args,
                soft_timeout: registration.soft_timeout,
                hard_timeout: registration.hard_timeout,
            })
            .await?;
        tracing::debug!(task = %record, "published task");
        Ok(record)
    }
}

/// Publishes, executes, and revokes tasks.
pub struct TaskRuntime {
    store: Arc<dyn BrokerStore>,
    registry: Arc<TaskRegistry>,
    metrics: BrokerMetrics,
    poll_interval: Duration,
}

impl TaskRuntime {
    /// Creates a runtime over the given store and registry.
    #[must_use]
    pub fn new(store: Arc<dyn BrokerStore>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            store,
            registry,
            metrics: BrokerMetrics::new(),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Sets the admission/idle poll interval. Mostly useful in tests.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The store this runtime executes against.
    #[must_use]
    pub fn store(&self) -> Arc<dyn BrokerStore> {
        Arc::clone(&self.store)
    }

    /// A publisher over this runtime's store and registry.
    #[must_use]
    pub fn publisher(&self) -> TaskPublisher {
        TaskPublisher::new(Arc::clone(&self.store), Arc::clone(&self.registry))
    }

    /// Publishes a task of a registered type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] for an unregistered name.
    pub async fn publish(&self, name: &str, args: Value) -> Result<TaskRecord> {
        self.publisher().publish(name, args).await
    }

    /// Revokes a task by its opaque wire id.
    ///
    /// A task already in a ready state is left as is. A revoked task must
    /// not produce side effects attributable to success; running handlers
    /// observe the revocation at their next suspension point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the task id does not resolve.
    pub async fn revoke(&self, task_id: &str, terminate: bool) -> Result<()> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        self.revoke_row(task.row_id, terminate).await
    }

    /// Revokes a task by row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn revoke_row(&self, row: TaskRowId, terminate: bool) -> Result<()> {
        loop {
            let Some(current) = self.store.get_task(row).await? else {
                return Ok(());
            };
            if current.state.is_ready() {
                return Ok(());
            }
            if current.state == TaskState::Running && !terminate {
                // Without terminate, a running task is allowed to finish.
                return Ok(());
            }
            let result = self
                .store
                .cas_task_state(row, current.state, TaskState::Revoked)
                .await?;
            if result.is_success() {
                tracing::info!(task = %current, "revoked task");
                return Ok(());
            }
            // The state moved under us; re-read and try again.
        }
    }

    /// Claims and executes at most one pending task.
    ///
    /// Returns the executed row id, or `None` when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while claiming.
    pub async fn run_pending_once(&self) -> Result<Option<TaskRowId>> {
        let Some(record) = self.store.claim_next_pending().await? else {
            return Ok(None);
        };
        let row = record.row_id;
        self.execute(record).await;
        Ok(Some(row))
    }

    /// Drains the queue, executing pending tasks until it is empty.
    ///
    /// Tasks published by handlers along the way are executed too.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while claiming.
    pub async fn run_all_pending(&self) -> Result<usize> {
        let mut executed = 0;
        while self.run_pending_once().await?.is_some() {
            executed += 1;
        }
        Ok(executed)
    }

    /// Spawns `count` workers that drain the queue forever.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let runtime = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        match runtime.run_pending_once().await {
                            Ok(Some(_)) => {}
                            Ok(None) => tokio::time::sleep(runtime.poll_interval).await,
                            Err(error) => {
                                tracing::warn!(worker, %error, "worker claim failed");
                                tokio::time::sleep(runtime.poll_interval).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    #[tracing::instrument(
        name = "task",
        skip(self, record),
        fields(name = %record.name, task_id = %record.task_id)
    )]
    async fn execute(&self, record: TaskRecord) {
        let Some(registration) = self.registry.get(&record.name).cloned() else {
            tracing::warn!(task = %record, "claimed task has no registration");
            let _ = self
                .store
                .set_task_failure(record.row_id, Some("unregistered task".to_string()))
                .await;
            let _ = self
                .store
                .cas_task_state(record.row_id, TaskState::Started, TaskState::Failure)
                .await;
            self.metrics
                .record_task_execution(&record.name, outcomes::FAILURE, Duration::ZERO);
            return;
        };

        // Synchronize: wait in STARTED until admission clears.
        let started_at = Instant::now();
        loop {
            let Ok(Some(current)) = self.store.get_task(record.row_id).await else {
                return;
            };
            if current.state == TaskState::Revoked {
                self.metrics.record_task_execution(
                    &record.name,
                    outcomes::REVOKED,
                    started_at.elapsed(),
                );
                return;
            }

            let (pre_running, running) = match (
                self.store.pre_running_tasks().await,
                self.store.running_tasks().await,
            ) {
                (Ok(pre), Ok(running)) => (pre, running),
                _ => return,
            };

            match admission_blockage(&current, registration.discipline, &pre_running, &running) {
                None => {
                    let _ = self.store.set_task_blockage(record.row_id, None).await;
                    break;
                }
                Some(cause) => {
                    if started_at.elapsed() > registration.max_starting {
                        tracing::warn!(task = %record, %cause, "timed out waiting to start");
                        let _ = self
                            .store
                            .set_task_failure(
                                record.row_id,
                                Some(format!("timed out waiting to start: {cause}")),
                            )
                            .await;
                        let _ = self
                            .store
                            .cas_task_state(record.row_id, TaskState::Started, TaskState::Failure)
                            .await;
                        self.metrics.record_task_execution(
                            &record.name,
                            outcomes::BLOCKED,
                            started_at.elapsed(),
                        );
                        return;
                    }
                    let _ = self
                        .store
                        .set_task_blockage(record.row_id, Some(cause))
                        .await;
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        let Ok(result) = self
            .store
            .cas_task_state(record.row_id, TaskState::Started, TaskState::Running)
            .await
        else {
            return;
        };
        if !result.is_success() {
            // Revoked between admission and start.
            self.metrics
                .record_task_execution(&record.name, outcomes::REVOKED, started_at.elapsed());
            return;
        }

        let ctx = TaskContext {
            store: Arc::clone(&self.store),
            record: record.clone(),
            publisher: self.publisher(),
        };

        let run_start = Instant::now();
        let outcome = match registration.hard_timeout {
            Some(hard) => tokio::time::timeout(hard, registration.handler().run(ctx)).await,
            None => Ok(registration.handler().run(ctx).await),
        };
        let duration = run_start.elapsed();

        if let Some(soft) = registration.soft_timeout {
            if duration > soft {
                tracing::warn!(
                    task = %record,
                    soft_timeout = ?soft,
                    elapsed = ?duration,
                    "task exceeded its soft timeout"
                );
            }
        }

        match outcome {
            // Hard timeout: forced revoke with a recorded failure. The
            // sweeper recovers any item the task was holding.
            Err(_elapsed) => {
                tracing::warn!(task = %record, "task exceeded its hard timeout; revoking");
                let _ = self
                    .store
                    .set_task_failure(
                        record.row_id,
                        Some(format!(
                            "hard timeout of {:?} exceeded",
                            registration.hard_timeout.unwrap_or_default()
                        )),
                    )
                    .await;
                let _ = self
                    .store
                    .cas_task_state(record.row_id, TaskState::Running, TaskState::Revoked)
                    .await;
                self.metrics
                    .record_task_execution(&record.name, outcomes::TIMEOUT, duration);
            }
            Ok(Ok(())) => {
                let result = self
                    .store
                    .cas_task_state(record.row_id, TaskState::Running, TaskState::Success)
                    .await;
                match result {
                    Ok(cas) if cas.is_success() => {
                        self.metrics
                            .record_task_execution(&record.name, outcomes::SUCCESS, duration);
                    }
                    _ => {
                        // Revoked while running; success is not recorded.
                        self.metrics.record_task_execution(
                            &record.name,
                            outcomes::REVOKED,
                            duration,
                        );
                    }
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(task = %record, %error, "task failed");
                let _ = self
                    .store
                    .set_task_failure(record.row_id, Some(error.to_string()))
                    .await;
                let _ = self
                    .store
                    .cas_task_state(record.row_id, TaskState::Running, TaskState::Failure)
                    .await;
                let outcome = match error {
                    Error::Timeout { .. } => outcomes::TIMEOUT,
                    _ => outcomes::FAILURE,
                };
                self.metrics
                    .record_task_execution(&record.name, outcome, duration);
            }
        }
    }
}

/// Enqueues the periodic cycles at fixed intervals.
///
/// Each entry publishes its task on a timer; the task's own GLOBAL
/// discipline keeps overlapping cycles from running concurrently.
pub struct PeriodicScheduler {
    runtime: Arc<TaskRuntime>,
    entries: Vec<(String, Duration)>,
}

impl PeriodicScheduler {
    /// Creates a scheduler with no entries.
    #[must_use]
    pub fn new(runtime: Arc<TaskRuntime>) -> Self {
        Self {
            runtime,
            entries: Vec::new(),
        }
    }

    /// Adds a periodic entry.
    #[must_use]
    pub fn every(mut self, name: impl Into<String>, interval: Duration) -> Self {
        self.entries.push((name.into(), interval));
        self
    }

    /// Spawns one timer per entry.
    #[must_use]
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.entries
            .into_iter()
            .map(|(name, interval)| {
                let runtime = Arc::clone(&self.runtime);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        if let Err(error) =
                            runtime.publish(&name, serde_json::Value::Null).await
                        {
                            tracing::warn!(task = %name, %error, "periodic publish failed");
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::registry::{names, FnHandler, TaskRegistration};
    use crate::tasks::SyncDiscipline;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime_with(registrations: Vec<TaskRegistration>) -> Arc<TaskRuntime> {
        let store = Arc::new(MemoryStore::new(b"test-secret"));
        let mut registry = TaskRegistry::new();
        for registration in registrations {
            registry.register(registration);
        }
        Arc::new(
            TaskRuntime::new(store, Arc::new(registry))
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn publish_and_execute_success() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let runtime = runtime_with(vec![TaskRegistration::new(
            names::PROCESS_ITEMS_CLEANUP,
            SyncDiscipline::Global,
            Arc::new(FnHandler(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            })),
        )]);

        let record = runtime
            .publish(names::PROCESS_ITEMS_CLEANUP, json!(null))
            .await
            .unwrap();
        assert_eq!(record.state, TaskState::Pending);

        runtime.run_pending_once().await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let task = runtime.store().get_task(record.row_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Success);
    }

    #[tokio::test]
    async fn publish_rejects_unregistered_names() {
        let runtime = runtime_with(vec![]);
        let err = runtime.publish("NoSuchTask", json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
    }

    #[tokio::test]
    async fn failure_records_detail() {
        let runtime = runtime_with(vec![TaskRegistration::new(
            names::GROW_ITEM,
            SyncDiscipline::Global,
            Arc::new(FnHandler(|_ctx| {
                async { Err(Error::provisioning("farm quota exhausted")) }.boxed()
            })),
        )]);

        let record = runtime.publish(names::GROW_ITEM, json!(null)).await.unwrap();
        runtime.run_pending_once().await.unwrap();

        let task = runtime.store().get_task(record.row_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failure);
        assert!(task.failure.unwrap().contains("farm quota exhausted"));
    }

    #[tokio::test]
    async fn revoked_task_never_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let runtime = runtime_with(vec![TaskRegistration::new(
            names::DESTROY_ITEM,
            SyncDiscipline::SingleItem,
            Arc::new(FnHandler(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            })),
        )]);

        let record = runtime
            .publish(names::DESTROY_ITEM, json!({"item_sid": "aaa-bbb"}))
            .await
            .unwrap();
        runtime.revoke(&record.task_id, true).await.unwrap();
        runtime.run_all_pending().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        let task = runtime.store().get_task(record.row_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Revoked);
    }

    #[tokio::test]
    async fn hard_timeout_forces_revoke_with_failure() {
        let runtime = runtime_with(vec![TaskRegistration::new(
            names::GROW_ITEM,
            SyncDiscipline::Global,
            Arc::new(FnHandler(|_ctx| {
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                .boxed()
            })),
        )
        .with_hard_timeout(Duration::from_millis(20))]);

        let record = runtime.publish(names::GROW_ITEM, json!(null)).await.unwrap();
        runtime.run_pending_once().await.unwrap();

        let task = runtime.store().get_task(record.row_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Revoked);
        assert!(task.failure.unwrap().contains("hard timeout"));
    }

    #[tokio::test]
    async fn blocked_task_fails_past_start_deadline() {
        let runtime = runtime_with(vec![TaskRegistration::new(
            names::FULFILL_OPEN_ORDERS,
            SyncDiscipline::Global,
            Arc::new(FnHandler(|_ctx| async { Ok(()) }.boxed())),
        )
        .with_max_starting(Duration::from_millis(20))]);

        // Wedge a competitor into RUNNING by hand.
        let competitor = runtime
            .publish(names::FULFILL_OPEN_ORDERS, json!(null))
            .await
            .unwrap();
        let store = runtime.store();
        store.claim_next_pending().await.unwrap().unwrap();
        store
            .cas_task_state(competitor.row_id, TaskState::Started, TaskState::Running)
            .await
            .unwrap();

        let blocked = runtime
            .publish(names::FULFILL_OPEN_ORDERS, json!(null))
            .await
            .unwrap();
        runtime.run_pending_once().await.unwrap();

        let task = store.get_task(blocked.row_id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failure);
        assert!(task.failure.unwrap().contains("timed out waiting to start"));
    }

    #[tokio::test]
    async fn line_order_follows_row_ids() {
        let order: Arc<std::sync::Mutex<Vec<u64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let runtime = runtime_with(vec![TaskRegistration::new(
            names::HANDLE_ITEM_CLEANUP,
            SyncDiscipline::Global,
            Arc::new(FnHandler(move |ctx: crate::tasks::registry::TaskContext| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(ctx.record.row_id.value());
                    Ok(())
                }
                .boxed()
            })),
        )]);

        let first = runtime
            .publish(names::HANDLE_ITEM_CLEANUP, json!(null))
            .await
            .unwrap();
        let second = runtime
            .publish(names::HANDLE_ITEM_CLEANUP, json!(null))
            .await
            .unwrap();
        assert!(first.row_id < second.row_id);

        runtime.run_all_pending().await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec![first.row_id.value(), second.row_id.value()]
        );
    }
}
