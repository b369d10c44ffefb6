//! The periodic lifecycle sweep.
//!
//! `process_items_cleanup` drives everything that ends a reservation: orders
//! past their lease or expiration are closed and their items released,
//! elastic items idle past their shelf life are destroyed, and items left
//! held by finished tasks are recovered. The sweep itself never mutates an
//! item directly; per-item work goes through SINGLE-ITEM tasks so the
//! item-level mutex stays with the task admission check.
//!
//! Owners of fulfilled orders are warned before ejection: a schedule of
//! shrinking time-left thresholds produces `time_limit_notice` updates, with
//! an urgent prefix once less than an hour remains. The deadline itself is
//! authoritative: the first sweep at or after the deadline closes
//! the order whether or not every notice went out.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::catalog::KindRegistry;
use crate::error::Result;
use crate::fulfillment::{revoke_grow_tasks_for_order, PendingTask};
use crate::item::{HeldBy, Item, ItemState};
use crate::metrics::{BrokerMetrics, TimingGuard};
use crate::order::{self, Order, OrderStatus, OrderUpdate, OrderUpdateDraft, UpdateCreator};
use crate::store::BrokerStore;
use crate::tasks::registry::names;

/// Time-left thresholds at which an ejection notice is due, largest first.
fn notice_schedule() -> [Duration; 4] {
    [
        Duration::hours(24),
        Duration::hours(4),
        Duration::hours(1),
        Duration::minutes(15),
    ]
}

/// Below this much time left, notices carry the urgent prefix.
fn urgent_threshold() -> Duration {
    Duration::hours(1)
}

/// How often a maintenance order's owner is reminded that it still holds
/// items.
fn maintenance_reminder_interval() -> Duration {
    Duration::days(7)
}

/// What one cleanup sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Orders closed for passing their expiration deadline.
    pub closed_expired: usize,
    /// Orders closed for passing their lease deadline.
    pub closed_ejected: usize,
    /// Ejection notices appended.
    pub notices: usize,
    /// Maintenance-order reminders appended.
    pub reminders: usize,
    /// Destroy tasks enqueued for idle elastic items.
    pub destroy_tasks: usize,
    /// Recovery tasks enqueued for items held by finished tasks.
    pub recovery_tasks: usize,
}

/// The periodic reaper of leases, idle inventory, and stale holders.
pub struct LifecycleSweeper {
    store: Arc<dyn BrokerStore>,
    catalog: Arc<KindRegistry>,
    metrics: BrokerMetrics,
}

impl LifecycleSweeper {
    /// Creates a sweeper over the given store and catalog.
    #[must_use]
    pub fn new(store: Arc<dyn BrokerStore>, catalog: Arc<KindRegistry>) -> Self {
        Self {
            store,
            catalog,
            metrics: BrokerMetrics::new(),
        }
    }

    /// Runs one cleanup sweep.
    ///
    /// Returns the sweep summary and the follow-up tasks to publish
    /// (destroy and recovery work). A failure on one order or item never
    /// aborts the sweep.
    ///
    /// # Errors
    ///
    /// Returns an error only if the order or item listings themselves fail.
    #[tracing::instrument(name = "cycle", skip(self, creator), fields(cycle = "process_items_cleanup"))]
    pub async fn process_items_cleanup(
        &self,
        creator: UpdateCreator,
    ) -> Result<(SweepSummary, Vec<PendingTask>)> {
        let metrics = self.metrics.clone();
        let _timer = TimingGuard::new(move |elapsed| metrics.observe_cleanup_cycle(elapsed));

        let mut summary = SweepSummary::default();
        let mut tasks = Vec::new();

        let mut live_orders = self.store.orders_with_status(OrderStatus::Open).await?;
        live_orders.extend(self.store.orders_with_status(OrderStatus::Fulfilled).await?);
        for order in live_orders {
            let updates = self.store.order_updates(order.id).await?;
            if let Err(error) = self
                .sweep_order(&order, &updates, creator, &mut summary)
                .await
            {
                tracing::warn!(order = %order.sid, %error, "skipping order this sweep");
            }
        }

        for item in self.store.list_items().await? {
            if item.state == ItemState::Destroyed {
                continue;
            }
            match self.sweep_item(&item).await {
                Ok(Some(task)) => {
                    match task.name.as_str() {
                        names::DESTROY_ITEM => summary.destroy_tasks += 1,
                        names::HANDLE_ITEM_CLEANUP => summary.recovery_tasks += 1,
                        _ => {}
                    }
                    tasks.push(task);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(item = %item.sid, %error, "skipping item this sweep");
                }
            }
        }

        Ok((summary, tasks))
    }

    async fn sweep_order(
        &self,
        order: &Order,
        updates: &[OrderUpdate],
        creator: UpdateCreator,
        summary: &mut SweepSummary,
    ) -> Result<()> {
        let now = Utc::now();

        if order.maintenance {
            if self.maintenance_reminder_due(order, updates, now) {
                self.store
                    .append_order_update(
                        OrderUpdateDraft::new(order.id, creator)
                            .as_notice()
                            .with_comment(format!(
                                "Reminder: maintenance order {} still holds its items. \
                                 Close it when the maintenance work is done.",
                                order.sid
                            )),
                    )
                    .await?;
                summary.reminders += 1;
            }
            return Ok(());
        }

        let expiration = order::expiration_time(order, updates);
        let ejection = order::ejection_time(updates);

        if now > expiration {
            self.close_order(order, creator, "expired", format!(
                "This order placed at {} has gone past its expiration time limit and has \
                 automatically been closed.",
                order.time_created.to_rfc3339()
            ))
            .await?;
            summary.closed_expired += 1;
            return Ok(());
        }

        if let Some(ejection) = ejection {
            if now > ejection {
                self.close_order(order, creator, "ejected", format!(
                    "The lease on this order ran out at {} and its items have been \
                     released back to the pool.",
                    ejection.to_rfc3339()
                ))
                .await?;
                summary.closed_ejected += 1;
                return Ok(());
            }

            let time_left = ejection - now;
            let due = notice_schedule()
                .iter()
                .filter(|threshold| time_left <= **threshold)
                .count();
            let sent = updates.iter().filter(|u| u.time_limit_notice).count();
            if sent < due {
                let prefix = if time_left <= urgent_threshold() {
                    "URGENT: "
                } else {
                    ""
                };
                self.store
                    .append_order_update(
                        OrderUpdateDraft::new(order.id, creator)
                            .as_notice()
                            .with_comment(format!(
                                "{prefix}This order will be ejected at {} (in {}). Extend \
                                 the order if its items are still needed.",
                                ejection.to_rfc3339(),
                                depot_core::format_duration(time_left),
                            )),
                    )
                    .await?;
                summary.notices += 1;
            }
        }

        Ok(())
    }

    fn maintenance_reminder_due(
        &self,
        _order: &Order,
        updates: &[OrderUpdate],
        now: DateTime<Utc>,
    ) -> bool {
        let Some(fulfilled) = order::fulfillment_time(updates) else {
            return false;
        };
        let last = order::last_notice_time(updates).unwrap_or(fulfilled);
        now - last > maintenance_reminder_interval()
    }

    async fn close_order(
        &self,
        order: &Order,
        creator: UpdateCreator,
        reason: &str,
        comment: String,
    ) -> Result<()> {
        self.store
            .append_order_update(
                OrderUpdateDraft::new(order.id, creator)
                    .with_status(OrderStatus::Closed)
                    .with_comment(comment.clone()),
            )
            .await?;
        let revoked = revoke_grow_tasks_for_order(&self.store, &order.sid).await?;
        if revoked > 0 {
            tracing::info!(order = %order.sid, revoked, "revoked in-flight grow tasks");
        }
        self.metrics.record_order_closed(reason);
        tracing::info!(order = %order.sid, reason, "{comment}");
        Ok(())
    }

    /// Decides the follow-up task for one item, if any.
    async fn sweep_item(&self, item: &Item) -> Result<Option<PendingTask>> {
        match item.held_by {
            HeldBy::Task(holder) => {
                let finished = match self.store.get_task(holder).await? {
                    Some(task) => task.state.is_ready(),
                    // The holding row is gone; treat the holder as dead.
                    None => true,
                };
                if finished && !self.task_in_flight(names::HANDLE_ITEM_CLEANUP, &item.sid).await? {
                    return Ok(Some(PendingTask {
                        name: names::HANDLE_ITEM_CLEANUP.to_string(),
                        args: json!({ "item_sid": item.sid }),
                    }));
                }
                Ok(None)
            }
            HeldBy::Nobody if item.state == ItemState::Active => {
                let Some(kind) = self.catalog.get(&item.kind) else {
                    return Ok(None);
                };
                let Some(shelf_life) = kind.shelf_life() else {
                    return Ok(None);
                };
                let idle = Utc::now() - item.time_held_by_updated;
                if idle > shelf_life
                    && !self.task_in_flight(names::DESTROY_ITEM, &item.sid).await?
                {
                    tracing::info!(
                        item = %item.sid,
                        kind = %item.kind,
                        "item idle past its shelf life; destroying"
                    );
                    return Ok(Some(PendingTask {
                        name: names::DESTROY_ITEM.to_string(),
                        args: json!({ "item_sid": item.sid }),
                    }));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn task_in_flight(&self, name: &str, item_sid: &str) -> Result<bool> {
        let mut tasks = self.store.pre_running_tasks().await?;
        tasks.extend(self.store.running_tasks().await?);
        Ok(tasks
            .iter()
            .any(|task| task.name == name && task.mentions(item_sid)))
    }
}

/// Handler for quarantine tasks: flips one item into MAINTENANCE.
///
/// The item keeps its holder; a holding order releases it on close, after
/// which only maintenance orders can select it.
pub struct SetItemMaintenanceHandler;

#[async_trait::async_trait]
impl crate::tasks::registry::TaskHandler for SetItemMaintenanceHandler {
    async fn run(&self, ctx: crate::tasks::registry::TaskContext) -> Result<()> {
        let Some(item_sid) = ctx.arg_str("item_sid") else {
            return Err(crate::error::Error::admission_denied(
                "quarantine task missing item_sid",
            ));
        };
        let Some(item) = ctx.store.find_item_by_sid(item_sid).await? else {
            return Ok(());
        };
        if item.state != ItemState::Active {
            return Ok(());
        }
        if ctx.is_revoked().await? {
            return Ok(());
        }
        ctx.store
            .set_item_state(item.id, ItemState::Maintenance)
            .await?;
        tracing::info!(item = %item.sid, "item quarantined for maintenance");
        Ok(())
    }
}

/// Handler for recovery tasks: frees one item whose holder is a finished
/// task.
///
/// A healthy item goes back to the pool; an unhealthy one is quarantined so
/// it stops matching regular orders. Either way the dead holder is cleared:
/// an item must never stay pointed at a task that cannot release it.
pub struct HandleItemCleanupHandler {
    catalog: Arc<KindRegistry>,
}

impl HandleItemCleanupHandler {
    /// Creates a handler probing health through the given catalog.
    #[must_use]
    pub fn new(catalog: Arc<KindRegistry>) -> Self {
        Self { catalog }
    }
}

#[async_trait::async_trait]
impl crate::tasks::registry::TaskHandler for HandleItemCleanupHandler {
    async fn run(&self, ctx: crate::tasks::registry::TaskContext) -> Result<()> {
        let Some(item_sid) = ctx.arg_str("item_sid") else {
            return Err(crate::error::Error::admission_denied(
                "recovery task missing item_sid",
            ));
        };
        let Some(item) = ctx.store.find_item_by_sid(item_sid).await? else {
            return Ok(());
        };
        let HeldBy::Task(holder) = item.held_by else {
            return Ok(());
        };
        let still_working = match ctx.store.get_task(holder).await? {
            Some(task) => !task.state.is_ready(),
            None => false,
        };
        if still_working || ctx.is_revoked().await? {
            return Ok(());
        }

        let healthy = self
            .catalog
            .get(&item.kind)
            .is_none_or(|kind| kind.is_healthy(&item));
        if !healthy && item.state == ItemState::Active {
            ctx.store
                .set_item_state(item.id, ItemState::Maintenance)
                .await?;
            tracing::warn!(item = %item.sid, "recovered item failed its health probe; quarantined");
        }
        ctx.store
            .cas_item_holder(item.id, &HeldBy::Task(holder), HeldBy::Nobody)
            .await?;
        tracing::info!(item = %item.sid, "recovered item from finished task");
        Ok(())
    }
}
