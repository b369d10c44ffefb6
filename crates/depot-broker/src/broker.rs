//! Broker assembly.
//!
//! Wires the store, catalog, farms, task registry, and orchestration
//! surface into one running broker. All built-in task types are registered
//! here at startup with their synchronization disciplines and timeouts;
//! nothing registers itself as a side effect of being linked in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::catalog::KindRegistry;
use crate::error::Result;
use crate::farm::{DestroyItemHandler, FarmRegistry, GrowItemHandler};
use crate::fulfillment::FulfillmentEngine;
use crate::order::UpdateCreator;
use crate::store::BrokerStore;
use crate::surface::BrokerSurface;
use crate::sweeper::{HandleItemCleanupHandler, LifecycleSweeper, SetItemMaintenanceHandler};
use crate::tasks::registry::{names, TaskContext, TaskHandler, TaskRegistration, TaskRegistry};
use crate::tasks::runtime::{PeriodicScheduler, TaskRuntime};
use crate::tasks::SyncDiscipline;

/// Deployment knobs for a running broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How many workers drain the task queue.
    pub worker_count: usize,
    /// How often the fulfillment cycle is enqueued.
    pub fulfill_interval: Duration,
    /// How often the cleanup sweep is enqueued.
    pub cleanup_interval: Duration,
    /// How many grow tasks may run concurrently.
    pub grow_concurrency: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            fulfill_interval: Duration::from_secs(15),
            cleanup_interval: Duration::from_secs(60),
            grow_concurrency: 4,
        }
    }
}

/// A fully wired broker: engine, sweeper, task runtime, and surface over
/// one store.
pub struct Broker {
    store: Arc<dyn BrokerStore>,
    runtime: Arc<TaskRuntime>,
    surface: BrokerSurface,
    config: BrokerConfig,
}

impl Broker {
    /// Assembles a broker over the given store, catalog, and farms.
    #[must_use]
    pub fn new(
        store: Arc<dyn BrokerStore>,
        catalog: Arc<KindRegistry>,
        farms: FarmRegistry,
        config: BrokerConfig,
    ) -> Self {
        let engine = Arc::new(FulfillmentEngine::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            farms.clone(),
        ));
        let sweeper = Arc::new(LifecycleSweeper::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
        ));

        let mut registry = TaskRegistry::new();
        registry.register(
            TaskRegistration::new(
                names::FULFILL_OPEN_ORDERS,
                SyncDiscipline::Global,
                Arc::new(FulfillCycleHandler { engine }),
            )
            .with_soft_timeout(Duration::from_secs(60))
            .with_hard_timeout(Duration::from_secs(300)),
        );
        registry.register(
            TaskRegistration::new(
                names::PROCESS_ITEMS_CLEANUP,
                SyncDiscipline::Global,
                Arc::new(SweepCycleHandler { sweeper }),
            )
            .with_soft_timeout(Duration::from_secs(60))
            .with_hard_timeout(Duration::from_secs(300)),
        );
        registry.register(
            TaskRegistration::new(
                names::GROW_ITEM,
                SyncDiscipline::Throttled(config.grow_concurrency),
                Arc::new(GrowItemHandler::new(farms.clone())),
            )
            .with_soft_timeout(Duration::from_secs(600))
            .with_hard_timeout(Duration::from_secs(1_800)),
        );
        registry.register(
            TaskRegistration::new(
                names::DESTROY_ITEM,
                SyncDiscipline::SingleItem,
                Arc::new(DestroyItemHandler::new(farms)),
            )
            .with_soft_timeout(Duration::from_secs(600))
            .with_hard_timeout(Duration::from_secs(1_800)),
        );
        registry.register(
            TaskRegistration::new(
                names::SET_ITEM_MAINTENANCE,
                SyncDiscipline::SingleItem,
                Arc::new(SetItemMaintenanceHandler),
            )
            .with_soft_timeout(Duration::from_secs(30))
            .with_hard_timeout(Duration::from_secs(120)),
        );
        registry.register(
            TaskRegistration::new(
                names::HANDLE_ITEM_CLEANUP,
                SyncDiscipline::SingleItem,
                Arc::new(HandleItemCleanupHandler::new(Arc::clone(&catalog))),
            )
            .with_soft_timeout(Duration::from_secs(30))
            .with_hard_timeout(Duration::from_secs(120)),
        );

        let runtime = Arc::new(TaskRuntime::new(Arc::clone(&store), Arc::new(registry)));
        let surface = BrokerSurface::new(Arc::clone(&store), catalog);

        Self {
            store,
            runtime,
            surface,
            config,
        }
    }

    /// The store everything runs against.
    #[must_use]
    pub fn store(&self) -> Arc<dyn BrokerStore> {
        Arc::clone(&self.store)
    }

    /// The task runtime, for publishing and revoking tasks.
    #[must_use]
    pub fn runtime(&self) -> Arc<TaskRuntime> {
        Arc::clone(&self.runtime)
    }

    /// The orchestration surface the HTTP layer calls into.
    #[must_use]
    pub fn surface(&self) -> &BrokerSurface {
        &self.surface
    }

    /// Spawns the worker pool and the periodic cycle timers.
    ///
    /// Workers run until the returned handles are aborted. The GLOBAL
    /// discipline on the cycle tasks keeps overlapping ticks from running
    /// concurrently.
    #[must_use]
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.runtime.spawn_workers(self.config.worker_count);
        handles.extend(
            PeriodicScheduler::new(Arc::clone(&self.runtime))
                .every(names::FULFILL_OPEN_ORDERS, self.config.fulfill_interval)
                .every(names::PROCESS_ITEMS_CLEANUP, self.config.cleanup_interval)
                .spawn(),
        );
        handles
    }

    /// Publishes one fulfillment cycle and drains the queue.
    ///
    /// Follow-up tasks enqueued by the cycle (grow, quarantine) run too.
    /// Mostly useful in tests and embeddings without a worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing or claiming fails.
    pub async fn run_fulfillment_cycle(&self) -> Result<()> {
        self.runtime
            .publish(names::FULFILL_OPEN_ORDERS, serde_json::Value::Null)
            .await?;
        self.runtime.run_all_pending().await?;
        Ok(())
    }

    /// Publishes one cleanup sweep and drains the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing or claiming fails.
    pub async fn run_cleanup_cycle(&self) -> Result<()> {
        self.runtime
            .publish(names::PROCESS_ITEMS_CLEANUP, serde_json::Value::Null)
            .await?;
        self.runtime.run_all_pending().await?;
        Ok(())
    }
}

/// Task handler running one fulfillment cycle.
struct FulfillCycleHandler {
    engine: Arc<FulfillmentEngine>,
}

#[async_trait]
impl TaskHandler for FulfillCycleHandler {
    async fn run(&self, ctx: TaskContext) -> Result<()> {
        let creator = UpdateCreator::Task(ctx.record.row_id);
        let (summary, tasks) = self.engine.fulfill_open_orders(creator).await?;
        for task in tasks {
            ctx.publisher.publish(&task.name, task.args).await?;
        }
        tracing::info!(
            fulfilled = summary.fulfilled,
            conflicts = summary.conflicts,
            tab_blocked = summary.tab_blocked,
            grow_tasks = summary.grow_tasks,
            expired = summary.expired,
            starved = summary.starved,
            "fulfillment cycle finished"
        );
        Ok(())
    }
}

/// Task handler running one cleanup sweep.
struct SweepCycleHandler {
    sweeper: Arc<LifecycleSweeper>,
}

#[async_trait]
impl TaskHandler for SweepCycleHandler {
    async fn run(&self, ctx: TaskContext) -> Result<()> {
        let creator = UpdateCreator::Task(ctx.record.row_id);
        let (summary, tasks) = self.sweeper.process_items_cleanup(creator).await?;
        for task in tasks {
            ctx.publisher.publish(&task.name, task.args).await?;
        }
        tracing::info!(
            closed_expired = summary.closed_expired,
            closed_ejected = summary.closed_ejected,
            notices = summary.notices,
            destroy_tasks = summary.destroy_tasks,
            recovery_tasks = summary.recovery_tasks,
            "cleanup sweep finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_catalog, CatalogConfig, Requirement, RequirementsMap};
    use crate::item::ItemDraft;
    use crate::order::OrderStatus;
    use crate::store::MemoryStore;
    use crate::surface::{PlaceOrderRequest, Verbosity};

    async fn broker() -> Broker {
        let store = Arc::new(MemoryStore::new(b"test-secret"));
        store.register_location("COLO").await.unwrap();
        store.register_network("COLO", "native").await.unwrap();
        let catalog = Arc::new(default_catalog(&CatalogConfig::default()));
        Broker::new(
            store,
            catalog,
            FarmRegistry::new(),
            BrokerConfig::default(),
        )
    }

    #[tokio::test]
    async fn place_cycle_fulfill_describe() {
        let broker = broker().await;
        let alice = broker.surface().create_user("alice").await.unwrap();
        broker
            .store()
            .insert_item(
                ItemDraft::new("rktest_yml", "COLO", "native").with_attribute("platform", "DYNAPOD"),
            )
            .await
            .unwrap();

        let mut requirements = RequirementsMap::new();
        requirements.insert(
            "n0".to_string(),
            Requirement::new("rktest_yml").with("platform", "DYNAPOD"),
        );
        let placed = broker
            .surface()
            .place_order(PlaceOrderRequest {
                owner: alice.id,
                requirements,
                time_limit: chrono::Duration::hours(2),
                expiration_time_limit: chrono::Duration::days(1),
                maintenance: false,
            })
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Open);

        broker.run_fulfillment_cycle().await.unwrap();

        let described = broker
            .surface()
            .describe_order(&placed.sid, Verbosity::Summary)
            .await
            .unwrap();
        assert_eq!(described.status, OrderStatus::Fulfilled);
        assert!(described.ejection_time.is_some());
        assert_eq!(described.items.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_cycle_runs_end_to_end() {
        let broker = broker().await;
        broker.run_cleanup_cycle().await.unwrap();
    }
}
