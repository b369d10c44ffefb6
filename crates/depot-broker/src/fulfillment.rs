//! The periodic fulfillment cycle.
//!
//! `fulfill_open_orders` walks the open orders in fair order and, for each,
//! tries to assign a free matching item to every nickname. The strategy is
//! all-or-nothing: partially fulfilling an order risks deadlock on items,
//! so an order either reserves everything it asked for in one transaction
//! or reserves nothing.
//!
//! When inventory is insufficient and the order has not expired, the cycle
//! asks the farms whether the missing kinds can be grown and enqueues grow
//! tasks, at most one in flight per (order, nickname).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::catalog::{KindRegistry, Requirement, RequirementsMap};
use crate::error::{Error, Result};
use crate::farm::{FarmRegistry, GrowContext};
use crate::ids::{ItemId, UserId};
use crate::item::{Item, ItemState};
use crate::metrics::{BrokerMetrics, TimingGuard};
use crate::order::{
    self, Order, OrderStatus, OrderUpdate, OrderUpdateDraft, UpdateCreator,
};
use crate::store::BrokerStore;
use crate::tab::TabLedger;
use crate::tasks::registry::names;
use crate::tasks::TaskRecord;

/// What one fulfillment cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Orders transitioned to FULFILLED.
    pub fulfilled: usize,
    /// Reservations aborted by concurrent modification.
    pub conflicts: usize,
    /// Orders skipped because their tab no longer admits their cost.
    pub tab_blocked: usize,
    /// Grow tasks enqueued.
    pub grow_tasks: usize,
    /// Orders closed for passing their expiration.
    pub expired: usize,
    /// Orders left open for lack of inventory.
    pub starved: usize,
    /// Maintenance-quarantine tasks enqueued.
    pub maintenance_tasks: usize,
}

/// A task the cycle wants published on its behalf.
#[derive(Debug, Clone)]
pub struct PendingTask {
    /// Registered task name.
    pub name: String,
    /// JSON arguments.
    pub args: serde_json::Value,
}

/// The matchmaker for open orders.
pub struct FulfillmentEngine {
    store: Arc<dyn BrokerStore>,
    catalog: Arc<KindRegistry>,
    farms: FarmRegistry,
    ledger: TabLedger,
    metrics: BrokerMetrics,
}

impl FulfillmentEngine {
    /// Creates an engine over the given store, catalog, and farms.
    #[must_use]
    pub fn new(
        store: Arc<dyn BrokerStore>,
        catalog: Arc<KindRegistry>,
        farms: FarmRegistry,
    ) -> Self {
        let ledger = TabLedger::new(Arc::clone(&store), Arc::clone(&catalog));
        Self {
            store,
            catalog,
            farms,
            ledger,
            metrics: BrokerMetrics::new(),
        }
    }

    /// Runs one fulfillment cycle over all open orders.
    ///
    /// Returns the cycle summary and the follow-up tasks to publish (grow
    /// and quarantine work). A failure on one order never aborts the
    /// cycle; the order keeps its blockage cause and is retried next time.
    ///
    /// # Errors
    ///
    /// Returns an error only if the open-order listing itself fails.
    #[tracing::instrument(name = "cycle", skip(self, creator), fields(cycle = "fulfill_open_orders"))]
    pub async fn fulfill_open_orders(
        &self,
        creator: UpdateCreator,
    ) -> Result<(CycleSummary, Vec<PendingTask>)> {
        let metrics = self.metrics.clone();
        let _timer = TimingGuard::new(move |elapsed| metrics.observe_fulfillment_cycle(elapsed));

        let open_orders = self.open_orders_in_fair_order().await?;
        self.metrics.set_open_orders(open_orders.len());
        if let Ok(free) = self.store.free_items().await {
            self.metrics.set_free_items(free.len());
        }

        let mut summary = CycleSummary::default();
        let mut tasks = Vec::new();
        // Items tentatively assigned earlier in this cycle; later orders
        // must not select them even though the store still shows them free.
        let mut assigned = BTreeSet::new();

        for (order, updates) in open_orders {
            let result = self
                .process_open_order(&order, &updates, creator, &mut assigned, &mut summary)
                .await;
            match result {
                Ok(mut order_tasks) => tasks.append(&mut order_tasks),
                Err(error) => {
                    tracing::warn!(order = %order.sid, %error, "skipping order this cycle");
                    let _ = self
                        .store
                        .set_order_blockage(order.id, Some(error.to_string()))
                        .await;
                }
            }
        }

        summary.grow_tasks = tasks
            .iter()
            .filter(|t| t.name == names::GROW_ITEM)
            .count();
        summary.maintenance_tasks = tasks
            .iter()
            .filter(|t| t.name == names::SET_ITEM_MAINTENANCE)
            .count();
        Ok((summary, tasks))
    }

    /// Open orders with their updates, in processing order.
    ///
    /// Maintenance orders come first. The rest are sorted
    /// expiration-earliest then id-earliest, and then interleaved
    /// owner-by-owner so one owner placing hundreds of orders cannot
    /// monopolize inventory or grow capacity.
    async fn open_orders_in_fair_order(&self) -> Result<Vec<(Order, Vec<OrderUpdate>)>> {
        let mut loaded = Vec::new();
        for order in self.store.orders_with_status(OrderStatus::Open).await? {
            let updates = self.store.order_updates(order.id).await?;
            loaded.push((order, updates));
        }

        let (maintenance, regular): (Vec<_>, Vec<_>) =
            loaded.into_iter().partition(|(order, _)| order.maintenance);

        let mut regular: Vec<_> = regular
            .into_iter()
            .map(|(order, updates)| {
                let expiration = order::expiration_time(&order, &updates);
                (expiration, order, updates)
            })
            .collect();
        regular.sort_by(|a, b| (a.0, a.1.id).cmp(&(b.0, b.1.id)));

        // Owner round-robin over the sorted list, owners rotating in order
        // of their earliest order.
        let mut queues: BTreeMap<UserId, VecDeque<(Order, Vec<OrderUpdate>)>> = BTreeMap::new();
        let mut rotation: Vec<UserId> = Vec::new();
        for (_, order, updates) in regular {
            if !queues.contains_key(&order.owner) {
                rotation.push(order.owner);
            }
            queues.entry(order.owner).or_default().push_back((order, updates));
        }

        let mut ordered: Vec<(Order, Vec<OrderUpdate>)> = maintenance;
        loop {
            let mut drained = true;
            for owner in &rotation {
                if let Some(entry) = queues.get_mut(owner).and_then(VecDeque::pop_front) {
                    ordered.push(entry);
                    drained = false;
                }
            }
            if drained {
                break;
            }
        }
        Ok(ordered)
    }

    async fn process_open_order(
        &self,
        order: &Order,
        updates: &[OrderUpdate],
        creator: UpdateCreator,
        assigned: &mut BTreeSet<ItemId>,
        summary: &mut CycleSummary,
    ) -> Result<Vec<PendingTask>> {
        let now = Utc::now();
        if !order.maintenance && now > order::expiration_time(order, updates) {
            self.expire_order(order, creator).await?;
            summary.expired += 1;
            return Ok(Vec::new());
        }

        let requirements = order::fold_requirements(updates)?;
        if requirements.is_empty() {
            self.store
                .set_order_blockage(order.id, Some("order has no requirements".to_string()))
                .await?;
            return Ok(Vec::new());
        }

        if order.maintenance {
            return self
                .process_maintenance_order(order, updates, &requirements, assigned, summary)
                .await;
        }

        // Re-check the tab: placement admitted the order against the credit
        // available then, but sibling orders fulfilled since may have eaten
        // it. Held prices must never exceed the limit, so a no-longer-
        // affordable order waits with a recorded cause.
        let cost = self.catalog.order_price(&requirements)?;
        if let Err(error) = self.ledger.admit(order.owner, cost).await {
            if !matches!(error, Error::AdmissionDenied { .. }) {
                return Err(error);
            }
            summary.tab_blocked += 1;
            self.store
                .set_order_blockage(order.id, Some(error.to_string()))
                .await?;
            return Ok(Vec::new());
        }

        let candidate_state = ItemState::Active;
        let pools = self
            .candidate_pools(&requirements, candidate_state, true, assigned)
            .await?;

        match solve_assignment(&requirements, &pools) {
            Assignment::Complete(selection) => {
                let comment = fulfillment_comment(&selection, &pools);
                let item_ids: BTreeMap<String, ItemId> = selection;
                let result = self
                    .store
                    .fulfill_order(order.id, &item_ids, creator, &comment)
                    .await?;
                if result.is_success() {
                    assigned.extend(item_ids.values().copied());
                    self.metrics.record_order_fulfilled();
                    summary.fulfilled += 1;
                    tracing::info!(order = %order.sid, "fulfilled order");
                } else {
                    self.metrics.record_reservation_conflict();
                    summary.conflicts += 1;
                    self.store
                        .set_order_blockage(
                            order.id,
                            Some("reservation aborted by a concurrent update; retrying".into()),
                        )
                        .await?;
                }
                Ok(Vec::new())
            }
            Assignment::Unsatisfied(nicknames) => {
                summary.starved += 1;
                let mut tasks = Vec::new();
                let mut waiting = Vec::new();
                for nickname in &nicknames {
                    let requirement = &requirements[nickname];
                    if let Some(task) = self.request_growth(order, nickname, requirement).await? {
                        waiting.push(format!("{nickname}: growing {}", requirement.kind));
                        tasks.push(task);
                    } else {
                        waiting.push(format!(
                            "{nickname}: no free {} matching",
                            requirement.kind
                        ));
                    }
                }
                self.store
                    .set_order_blockage(order.id, Some(format!("waiting for items: {}", waiting.join(", "))))
                    .await?;
                Ok(tasks)
            }
        }
    }

    /// Maintenance orders run in two phases: quarantine the matching items
    /// (whoever holds them), then fulfill the order from quarantined free
    /// items on a later cycle.
    async fn process_maintenance_order(
        &self,
        order: &Order,
        updates: &[OrderUpdate],
        requirements: &RequirementsMap,
        assigned: &mut BTreeSet<ItemId>,
        summary: &mut CycleSummary,
    ) -> Result<Vec<PendingTask>> {
        if !order::marked_for_maintenance(updates) {
            // Phase one: select targets from any holder and mark them.
            let pools = self
                .candidate_pools(requirements, ItemState::Active, false, assigned)
                .await?;
            return match solve_assignment(requirements, &pools) {
                Assignment::Complete(selection) => {
                    let described: Vec<String> = selection
                        .iter()
                        .map(|(nickname, item)| {
                            format!("`{nickname}` => `{}`", item_sid(&pools, item))
                        })
                        .collect();
                    self.store
                        .append_order_update(
                            OrderUpdateDraft::new(order.id, UpdateCreator::System)
                                .as_maintenance()
                                .with_comment(format!(
                                    "These items have been selected for maintenance: {}",
                                    described.join(", ")
                                )),
                        )
                        .await?;
                    let mut tasks = Vec::new();
                    for item in selection.values() {
                        assigned.insert(*item);
                        tasks.push(PendingTask {
                            name: names::SET_ITEM_MAINTENANCE.to_string(),
                            args: json!({ "item_sid": item_sid(&pools, item) }),
                        });
                    }
                    Ok(tasks)
                }
                Assignment::Unsatisfied(nicknames) => {
                    self.store
                        .set_order_blockage(
                            order.id,
                            Some(format!(
                                "maintenance targets not found: {}",
                                nicknames.join(", ")
                            )),
                        )
                        .await?;
                    Ok(Vec::new())
                }
            };
        }

        // Phase two: fulfill from quarantined free items.
        let pools = self
            .candidate_pools(requirements, ItemState::Maintenance, true, assigned)
            .await?;
        match solve_assignment(requirements, &pools) {
            Assignment::Complete(selection) => {
                let comment = fulfillment_comment(&selection, &pools);
                let result = self
                    .store
                    .fulfill_order(order.id, &selection, UpdateCreator::System, &comment)
                    .await?;
                if result.is_success() {
                    assigned.extend(selection.values().copied());
                    self.metrics.record_order_fulfilled();
                    summary.fulfilled += 1;
                } else {
                    self.metrics.record_reservation_conflict();
                    summary.conflicts += 1;
                }
            }
            Assignment::Unsatisfied(nicknames) => {
                self.store
                    .set_order_blockage(
                        order.id,
                        Some(format!(
                            "waiting for quarantine of: {}",
                            nicknames.join(", ")
                        )),
                    )
                    .await?;
            }
        }
        Ok(Vec::new())
    }

    /// Candidate pool per nickname: items in the wanted state, matching the
    /// requirement, not tentatively assigned this cycle, and free unless
    /// `free_only` is false. Pools are sorted by item id.
    async fn candidate_pools(
        &self,
        requirements: &RequirementsMap,
        state: ItemState,
        free_only: bool,
        assigned: &BTreeSet<ItemId>,
    ) -> Result<BTreeMap<String, Vec<Item>>> {
        let items = self.store.list_items().await?;
        let mut pools = BTreeMap::new();
        for (nickname, requirement) in requirements {
            let mut pool: Vec<Item> = items
                .iter()
                .filter(|item| item.state == state)
                .filter(|item| !free_only || item.held_by.is_nobody())
                .filter(|item| !assigned.contains(&item.id))
                .filter(|item| self.catalog.matches(item, requirement))
                .cloned()
                .collect();
            pool.sort_by_key(|item| item.id);
            pools.insert(nickname.clone(), pool);
        }
        Ok(pools)
    }

    async fn expire_order(&self, order: &Order, creator: UpdateCreator) -> Result<()> {
        let comment = format!(
            "This order placed at {} has gone past its expiration time limit and has \
             automatically been closed.",
            order.time_created.to_rfc3339()
        );
        self.store
            .append_order_update(
                OrderUpdateDraft::new(order.id, creator)
                    .with_status(OrderStatus::Closed)
                    .with_comment(comment.clone()),
            )
            .await?;
        revoke_grow_tasks_for_order(&self.store, &order.sid).await?;
        self.metrics.record_order_closed("expired");
        tracing::info!(order = %order.sid, "{comment}");
        Ok(())
    }

    /// Asks the farms to grow inventory for one unsatisfied nickname.
    ///
    /// Returns the grow task to publish, or `None` when the kind is not
    /// elastic, a grow is already in flight for this (order, nickname), or
    /// no farm has capacity.
    async fn request_growth(
        &self,
        order: &Order,
        nickname: &str,
        requirement: &Requirement,
    ) -> Result<Option<PendingTask>> {
        let elastic = self
            .catalog
            .get(&requirement.kind)
            .is_some_and(|kind| kind.is_elastic());
        if !elastic {
            return Ok(None);
        }

        let in_flight = self.grow_tasks_in_flight().await?;
        let duplicate = in_flight.iter().any(|task| {
            task.mentions(&order.sid)
                && task.args.get("nickname").and_then(serde_json::Value::as_str)
                    == Some(nickname)
        });
        if duplicate {
            tracing::debug!(order = %order.sid, nickname, "grow already in flight");
            return Ok(None);
        }

        let pending_grows = in_flight
            .iter()
            .filter(|task| {
                task.args
                    .get("requirement")
                    .and_then(|r| r.get("type"))
                    .and_then(serde_json::Value::as_str)
                    == Some(requirement.kind.as_str())
            })
            .count();

        for farm in self.farms.serving_kind(&requirement.kind) {
            let active_items = self
                .store
                .list_items()
                .await?
                .iter()
                .filter(|item| {
                    item.kind == requirement.kind
                        && item.state != ItemState::Destroyed
                        && item.location == farm.location()
                })
                .count();
            let context = GrowContext {
                active_items,
                pending_grows,
            };
            if farm.can_grow(requirement, &context).await {
                self.metrics.record_grow_task(&requirement.kind);
                tracing::info!(
                    order = %order.sid,
                    nickname,
                    farm = farm.name(),
                    kind = %requirement.kind,
                    "requesting growth"
                );
                return Ok(Some(PendingTask {
                    name: names::GROW_ITEM.to_string(),
                    args: json!({
                        "order_sid": order.sid,
                        "nickname": nickname,
                        "farm": farm.name(),
                        "requirement": requirement,
                    }),
                }));
            }
        }
        Ok(None)
    }

    async fn grow_tasks_in_flight(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks = self.store.pre_running_tasks().await?;
        tasks.extend(self.store.running_tasks().await?);
        tasks.retain(|task| task.name == names::GROW_ITEM);
        Ok(tasks)
    }
}

/// Revokes every in-flight grow task attributed to an order.
///
/// Called when an order leaves OPEN for CLOSED so abandoned provisioning
/// stops before it creates inventory nobody asked for. Returns how many
/// tasks were revoked.
///
/// # Errors
///
/// Returns an error if the store fails.
pub async fn revoke_grow_tasks_for_order(
    store: &Arc<dyn BrokerStore>,
    order_sid: &str,
) -> Result<usize> {
    let mut tasks = store.pre_running_tasks().await?;
    tasks.extend(store.running_tasks().await?);
    let mut revoked = 0;
    for task in tasks {
        if task.name != names::GROW_ITEM || !task.mentions(order_sid) {
            continue;
        }
        loop {
            let Some(current) = store.get_task(task.row_id).await? else {
                break;
            };
            if current.state.is_ready() {
                break;
            }
            if store
                .cas_task_state(task.row_id, current.state, crate::tasks::TaskState::Revoked)
                .await?
                .is_success()
            {
                revoked += 1;
                break;
            }
        }
    }
    Ok(revoked)
}

/// The outcome of the assignment solver.
#[derive(Debug)]
enum Assignment {
    /// Every nickname got an item.
    Complete(BTreeMap<String, ItemId>),
    /// These nicknames could not be satisfied.
    Unsatisfied(Vec<String>),
}

/// Deterministic bipartite assignment.
///
/// Nicknames are processed in lexicographic order. Each takes the
/// minimum-id candidate that preserves feasibility under a one-step
/// lookahead: after the tentative pick, every remaining nickname must still
/// have at least one candidate left. When no candidate preserves
/// feasibility the minimum id is taken anyway; the infeasibility then
/// surfaces on the starved nickname, which keeps the report precise.
fn solve_assignment(
    requirements: &RequirementsMap,
    pools: &BTreeMap<String, Vec<Item>>,
) -> Assignment {
    let mut used: BTreeSet<ItemId> = BTreeSet::new();
    let mut selection: BTreeMap<String, ItemId> = BTreeMap::new();
    let mut unsatisfied = Vec::new();

    let nicknames: Vec<&String> = requirements.keys().collect();
    for (position, nickname) in nicknames.iter().enumerate() {
        let empty = Vec::new();
        let candidates: Vec<&Item> = pools
            .get(*nickname)
            .unwrap_or(&empty)
            .iter()
            .filter(|item| !used.contains(&item.id))
            .collect();

        if candidates.is_empty() {
            unsatisfied.push((*nickname).clone());
            continue;
        }

        let remaining = &nicknames[position + 1..];
        let feasible = candidates.iter().find(|candidate| {
            remaining.iter().all(|later| {
                pools.get(*later).is_some_and(|pool| {
                    pool.iter()
                        .any(|item| item.id != candidate.id && !used.contains(&item.id))
                })
            })
        });

        let picked = feasible.unwrap_or(&candidates[0]);
        used.insert(picked.id);
        selection.insert((*nickname).clone(), picked.id);
    }

    if unsatisfied.is_empty() {
        Assignment::Complete(selection)
    } else {
        Assignment::Unsatisfied(unsatisfied)
    }
}

fn item_sid(pools: &BTreeMap<String, Vec<Item>>, id: &ItemId) -> String {
    pools
        .values()
        .flatten()
        .find(|item| item.id == *id)
        .map_or_else(|| id.to_string(), |item| item.sid.clone())
}

fn fulfillment_comment(
    selection: &BTreeMap<String, ItemId>,
    pools: &BTreeMap<String, Vec<Item>>,
) -> String {
    let bindings: Vec<String> = selection
        .iter()
        .map(|(nickname, item)| format!("`{nickname}` => `{}`", item_sid(pools, item)))
        .collect();
    format!(
        "These order items have been fulfilled and are ready to consume: {}",
        bindings.join(", ")
    )
}
