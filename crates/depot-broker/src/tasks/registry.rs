//! The explicit task registry.
//!
//! Task types are registered at startup, keyed by name, with their
//! synchronization discipline and timeouts as plain data. The worker
//! runtime looks tasks up here when it picks them off the queue; nothing is
//! registered as a side effect of imports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::store::BrokerStore;
use crate::tasks::runtime::TaskPublisher;
use crate::tasks::{SyncDiscipline, TaskRecord, TaskState};

/// Names of the built-in task types.
pub mod names {
    /// The periodic fulfillment cycle.
    pub const FULFILL_OPEN_ORDERS: &str = "FulfillOpenOrders";
    /// The periodic lifecycle sweep.
    pub const PROCESS_ITEMS_CLEANUP: &str = "ProcessItemsCleanup";
    /// Elastic provisioning of one item.
    pub const GROW_ITEM: &str = "GrowItem";
    /// Teardown of one item.
    pub const DESTROY_ITEM: &str = "DestroyItem";
    /// Recovery/cleanup of one item.
    pub const HANDLE_ITEM_CLEANUP: &str = "HandleItemCleanup";
    /// Quarantine of one item for a maintenance order.
    pub const SET_ITEM_MAINTENANCE: &str = "SetItemMaintenance";
}

/// Everything a handler needs while processing one task.
pub struct TaskContext {
    /// The store.
    pub store: Arc<dyn BrokerStore>,
    /// The task row as of pickup.
    pub record: TaskRecord,
    /// Publishes follow-up tasks on the handler's behalf.
    pub publisher: TaskPublisher,
}

impl TaskContext {
    /// The task's JSON arguments.
    #[must_use]
    pub fn args(&self) -> &Value {
        &self.record.args
    }

    /// One string argument by key.
    #[must_use]
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.record.args.get(key).and_then(Value::as_str)
    }

    /// Re-reads the task row and reports whether it has been revoked.
    ///
    /// Handlers call this at suspension points; a revoked task must stop
    /// without producing side effects attributable to success.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn is_revoked(&self) -> Result<bool> {
        let current = self.store.get_task(self.record.row_id).await?;
        Ok(current.is_some_and(|t| t.state == TaskState::Revoked))
    }
}

/// A task implementation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the main functionality of one task instance.
    async fn run(&self, ctx: TaskContext) -> Result<()>;
}

/// Adapts a closure into a [`TaskHandler`]. Mostly useful in tests.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    async fn run(&self, ctx: TaskContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Default limit on how long a picked-up task may wait for its
/// synchronization condition. Fairly low to fail fast: a waiting task still
/// burns down its own timeouts.
pub const DEFAULT_MAX_STARTING: Duration = Duration::from_secs(5);

/// One registered task type: metadata plus the handler.
#[derive(Clone)]
pub struct TaskRegistration {
    /// Task name; the publish key.
    pub name: String,
    /// Synchronization discipline.
    pub discipline: SyncDiscipline,
    /// Soft timeout; exceeding it logs a warning.
    pub soft_timeout: Option<Duration>,
    /// Hard timeout; exceeding it forces a revoke with failure.
    pub hard_timeout: Option<Duration>,
    /// Limit on waiting for the synchronization condition.
    pub max_starting: Duration,
    handler: Arc<dyn TaskHandler>,
}

impl TaskRegistration {
    /// Creates a registration with default timeouts.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        discipline: SyncDiscipline,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            discipline,
            soft_timeout: None,
            hard_timeout: None,
            max_starting: DEFAULT_MAX_STARTING,
            handler,
        }
    }

    /// Sets the soft timeout.
    #[must_use]
    pub const fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    /// Sets the hard timeout.
    #[must_use]
    pub const fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }

    /// Sets the starting-wait limit.
    #[must_use]
    pub const fn with_max_starting(mut self, limit: Duration) -> Self {
        self.max_starting = limit;
        self
    }

    /// The handler.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::clone(&self.handler)
    }
}

impl std::fmt::Debug for TaskRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistration")
            .field("name", &self.name)
            .field("discipline", &self.discipline)
            .field("soft_timeout", &self.soft_timeout)
            .field("hard_timeout", &self.hard_timeout)
            .finish_non_exhaustive()
    }
}

/// Registry of task types keyed by name, populated at startup.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskRegistration>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task type. Later registrations replace earlier ones with
    /// the same name.
    pub fn register(&mut self, registration: TaskRegistration) {
        self.tasks.insert(registration.name.clone(), registration);
    }

    /// Looks up a registration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TaskRegistration> {
        self.tasks.get(name)
    }

    /// Returns all registered names in sorted order.
    #[must_use]
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }
}
