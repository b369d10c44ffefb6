//! In-memory store implementation.
//!
//! Provides a simple, thread-safe implementation of [`BrokerStore`] using
//! one `RwLock` over the whole state, which gives every store call
//! serializable semantics. Suitable for tests and single-process
//! deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: state is not shared across process boundaries
//! - **No durability**: all state is lost when the process exits

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::{BrokerStore, CasResult, OrderDraft, TaskDraft};
use crate::error::{Error, Result};
use crate::ids::{ItemId, OrderId, OrderUpdateId, SidRegistry, TabId, TaskRowId, UserId};
use crate::item::{HeldBy, Item, ItemDraft, ItemState, Location, Network};
use crate::order::{
    ItemFulfillment, Order, OrderStatus, OrderUpdate, OrderUpdateDraft, UpdateCreator,
};
use crate::tab::Tab;
use crate::tasks::{TaskRecord, TaskState};
use crate::user::User;

/// Converts a lock poison error to an infrastructure error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::infrastructure("store lock poisoned")
}

#[derive(Debug, Default)]
struct Counters {
    users: u64,
    tabs: u64,
    items: u64,
    orders: u64,
    updates: u64,
    fulfillments: u64,
    tasks: u64,
}

impl Counters {
    fn next(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

#[derive(Debug, Default)]
struct Inner {
    locations: BTreeMap<String, Location>,
    networks: BTreeMap<(String, String), Network>,
    users: BTreeMap<u64, User>,
    tabs: BTreeMap<u64, Tab>,
    tab_by_owner: BTreeMap<u64, u64>,
    items: BTreeMap<u64, Item>,
    orders: BTreeMap<u64, Order>,
    updates: BTreeMap<u64, OrderUpdate>,
    fulfillments: Vec<ItemFulfillment>,
    tasks: BTreeMap<u64, TaskRecord>,
    counters: Counters,
}

impl Inner {
    fn release_items_of_order(&mut self, order: OrderId) {
        let now = Utc::now();
        for item in self.items.values_mut() {
            if item.held_by == HeldBy::Order(order) && item.state != ItemState::Destroyed {
                item.set_holder(HeldBy::Nobody, now);
            }
        }
    }
}

/// In-memory broker store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    sids: SidRegistry,
}

impl MemoryStore {
    /// Creates an empty store keyed by the deployment secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            sids: SidRegistry::new(secret),
        }
    }

    /// The SID registry this store stamps records with.
    #[must_use]
    pub fn sids(&self) -> &SidRegistry {
        &self.sids
    }
}

#[async_trait]
impl BrokerStore for MemoryStore {
    async fn register_location(&self, name: &str) -> Result<Location> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let location = inner
            .locations
            .entry(name.to_string())
            .or_insert_with(|| Location {
                name: name.to_string(),
            })
            .clone();
        Ok(location)
    }

    async fn register_network(&self, location: &str, name: &str) -> Result<Network> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.locations.contains_key(location) {
            return Err(Error::admission_denied(format!(
                "unknown location {location:?}"
            )));
        }
        let key = (location.to_string(), name.to_string());
        let network = inner
            .networks
            .entry(key)
            .or_insert_with(|| Network {
                location: location.to_string(),
                name: name.to_string(),
            })
            .clone();
        Ok(network)
    }

    async fn network_exists(&self, location: &str, name: &str) -> Result<bool> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .networks
            .contains_key(&(location.to_string(), name.to_string())))
    }

    async fn insert_user(&self, username: &str, token: &str) -> Result<User> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.users.values().any(|u| u.username == username) {
            return Err(Error::admission_denied(format!(
                "username {username:?} already exists"
            )));
        }
        let id = Counters::next(&mut inner.counters.users);
        let user = User {
            id: UserId(id),
            sid: self.sids.user_sid(UserId(id)),
            username: username.to_string(),
            token: token.to_string(),
        };
        inner.users.insert(id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.users.get(&id.value()).cloned())
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn insert_tab(&self, owner: UserId, limit: f64) -> Result<Tab> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if !inner.users.contains_key(&owner.value()) {
            return Err(Error::not_found("user", owner.to_string()));
        }
        if inner.tab_by_owner.contains_key(&owner.value()) {
            return Err(Error::admission_denied(format!(
                "user {owner} already has a tab"
            )));
        }
        let id = Counters::next(&mut inner.counters.tabs);
        let tab = Tab {
            id: TabId(id),
            sid: self.sids.tab_sid(TabId(id)),
            owner,
            limit,
        };
        inner.tabs.insert(id, tab.clone());
        inner.tab_by_owner.insert(owner.value(), id);
        Ok(tab)
    }

    async fn tab_for_owner(&self, owner: UserId) -> Result<Option<Tab>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tab_by_owner
            .get(&owner.value())
            .and_then(|tab_id| inner.tabs.get(tab_id))
            .cloned())
    }

    async fn insert_item(&self, draft: ItemDraft) -> Result<Item> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let key = (draft.location.clone(), draft.network.clone());
        if !inner.networks.contains_key(&key) {
            return Err(Error::admission_denied(format!(
                "unknown network {}/{}",
                draft.location, draft.network
            )));
        }
        let id = Counters::next(&mut inner.counters.items);
        let item = Item {
            id: ItemId(id),
            sid: self.sids.item_sid(ItemId(id)),
            kind: draft.kind,
            location: draft.location,
            network: draft.network,
            state: ItemState::Active,
            held_by: HeldBy::Nobody,
            time_held_by_updated: Utc::now(),
            attributes: draft.attributes,
        };
        inner.items.insert(id, item.clone());
        Ok(item)
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.items.get(&id.value()).cloned())
    }

    async fn find_item_by_sid(&self, sid: &str) -> Result<Option<Item>> {
        match self.sids.parse_item_sid(sid) {
            Ok(id) => {
                let inner = self.inner.read().map_err(poison_err)?;
                Ok(inner.items.get(&id.value()).cloned())
            }
            Err(_) => Ok(None),
        }
    }

    async fn list_items(&self) -> Result<Vec<Item>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.items.values().cloned().collect())
    }

    async fn free_items(&self) -> Result<Vec<Item>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.is_free())
            .cloned()
            .collect())
    }

    async fn items_held_by(&self, holder: HeldBy) -> Result<Vec<Item>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.held_by == holder && item.state != ItemState::Destroyed)
            .cloned()
            .collect())
    }

    async fn cas_item_holder(
        &self,
        id: ItemId,
        expected: &HeldBy,
        target: HeldBy,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(item) = inner.items.get_mut(&id.value()) else {
            return Ok(CasResult::NotFound);
        };
        if item.held_by != *expected {
            return Ok(CasResult::Conflict {
                actual: item.held_by.to_string(),
            });
        }
        item.set_holder(target, Utc::now());
        Ok(CasResult::Success)
    }

    async fn update_item_attributes(
        &self,
        id: ItemId,
        attributes: BTreeMap<String, serde_json::Value>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(item) = inner.items.get_mut(&id.value()) else {
            return Ok(CasResult::NotFound);
        };
        item.attributes.extend(attributes);
        Ok(CasResult::Success)
    }

    async fn set_item_state(&self, id: ItemId, target: ItemState) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(item) = inner.items.get_mut(&id.value()) else {
            return Ok(CasResult::NotFound);
        };
        item.transition_state(target)?;
        Ok(CasResult::Success)
    }

    async fn create_order(&self, draft: OrderDraft) -> Result<(Order, OrderUpdate)> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let tab_owner = inner
            .tabs
            .get(&draft.tab.value())
            .map(|tab| tab.owner)
            .ok_or_else(|| Error::not_found("tab", draft.tab.to_string()))?;
        if tab_owner != draft.owner {
            return Err(Error::admission_denied(format!(
                "tab {} does not belong to user {}",
                draft.tab, draft.owner
            )));
        }

        let now = Utc::now();
        let order_id = Counters::next(&mut inner.counters.orders);
        let order = Order {
            id: OrderId(order_id),
            sid: self.sids.order_sid(OrderId(order_id)),
            owner: draft.owner,
            tab: draft.tab,
            status: OrderStatus::Open,
            maintenance: draft.maintenance,
            blockage_cause: None,
            time_created: now,
        };

        let update_id = Counters::next(&mut inner.counters.updates);
        let update = OrderUpdate {
            id: OrderUpdateId(update_id),
            order: order.id,
            creator: draft.creator,
            time_created: now,
            items_delta: Some(draft.requirements),
            new_status: Some(OrderStatus::Open),
            new_owner: None,
            time_limit_delta: draft.time_limit,
            expiration_time_limit_delta: draft.expiration_time_limit,
            comment: "Order placed.".to_string(),
            time_limit_notice: false,
            maintenance: false,
        };

        inner.orders.insert(order_id, order.clone());
        inner.updates.insert(update_id, update.clone());
        Ok((order, update))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.orders.get(&id.value()).cloned())
    }

    async fn find_order_by_sid(&self, sid: &str) -> Result<Option<Order>> {
        match self.sids.parse_order_sid(sid) {
            Ok(id) => {
                let inner = self.inner.read().map_err(poison_err)?;
                Ok(inner.orders.get(&id.value()).cloned())
            }
            Err(_) => Ok(None),
        }
    }

    async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .orders
            .values()
            .filter(|order| order.status == status)
            .cloned()
            .collect())
    }

    async fn orders_of_owner(&self, owner: UserId) -> Result<Vec<Order>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .orders
            .values()
            .filter(|order| order.owner == owner)
            .cloned()
            .collect())
    }

    async fn order_updates(&self, order: OrderId) -> Result<Vec<OrderUpdate>> {
        let inner = self.inner.read().map_err(poison_err)?;
        // BTreeMap iteration is id-ascending, which matches
        // (time_created, id) since ids are assigned under the write lock.
        Ok(inner
            .updates
            .values()
            .filter(|update| update.order == order)
            .cloned()
            .collect())
    }

    async fn append_order_update(&self, draft: OrderUpdateDraft) -> Result<OrderUpdate> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let order = inner
            .orders
            .get(&draft.order.value())
            .cloned()
            .ok_or_else(|| Error::not_found("order", draft.order.to_string()))?;

        if let Some(target) = draft.new_status {
            if !order.status.can_transition_to(target) {
                return Err(Error::InvalidStateTransition {
                    from: order.status.to_string(),
                    to: target.to_string(),
                    reason: format!("order {}", order.sid),
                });
            }
        }

        let new_tab = match draft.new_owner {
            Some(new_owner) => {
                let tab_id = inner.tab_by_owner.get(&new_owner.value()).copied().ok_or_else(
                    || {
                        Error::admission_denied(format!(
                            "transfer target user {new_owner} has no tab"
                        ))
                    },
                )?;
                Some((new_owner, TabId(tab_id)))
            }
            None => None,
        };

        let update_id = Counters::next(&mut inner.counters.updates);
        let update = OrderUpdate {
            id: OrderUpdateId(update_id),
            order: draft.order,
            creator: draft.creator,
            time_created: Utc::now(),
            items_delta: draft.items_delta,
            new_status: draft.new_status,
            new_owner: draft.new_owner,
            time_limit_delta: draft.time_limit_delta,
            expiration_time_limit_delta: draft.expiration_time_limit_delta,
            comment: draft.comment,
            time_limit_notice: draft.time_limit_notice,
            maintenance: draft.maintenance,
        };
        inner.updates.insert(update_id, update.clone());

        {
            let order = inner
                .orders
                .get_mut(&draft.order.value())
                .ok_or_else(|| Error::not_found("order", draft.order.to_string()))?;
            if let Some(target) = draft.new_status {
                order.status = target;
            }
            if let Some((new_owner, new_tab)) = new_tab {
                order.owner = new_owner;
                order.tab = new_tab;
            }
            if draft.new_status == Some(OrderStatus::Closed) {
                order.blockage_cause = None;
            }
        }

        if draft.new_status == Some(OrderStatus::Closed) {
            inner.release_items_of_order(draft.order);
        }

        Ok(update)
    }

    async fn fulfillments_for_order(&self, order: OrderId) -> Result<Vec<ItemFulfillment>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .fulfillments
            .iter()
            .filter(|f| f.order == order)
            .cloned()
            .collect())
    }

    async fn fulfill_order(
        &self,
        order_id: OrderId,
        assignments: &BTreeMap<String, ItemId>,
        creator: UpdateCreator,
        comment: &str,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let Some(order) = inner.orders.get(&order_id.value()).cloned() else {
            return Ok(CasResult::NotFound);
        };
        if order.status != OrderStatus::Open {
            return Ok(CasResult::Conflict {
                actual: format!("order status {}", order.status),
            });
        }

        // Maintenance orders consume quarantined items; everything else
        // consumes active ones.
        let required_state = if order.maintenance {
            ItemState::Maintenance
        } else {
            ItemState::Active
        };

        // Re-check every candidate under the write lock before mutating
        // anything; any row changed under us aborts the whole reservation.
        for (nickname, item_id) in assignments {
            let Some(item) = inner.items.get(&item_id.value()) else {
                return Ok(CasResult::Conflict {
                    actual: format!("item for {nickname:?} no longer exists"),
                });
            };
            if item.state != required_state || !item.held_by.is_nobody() {
                return Ok(CasResult::Conflict {
                    actual: format!(
                        "item {} is {} and held by {}",
                        item.sid, item.state, item.held_by
                    ),
                });
            }
        }

        let now = Utc::now();
        let update_id = Counters::next(&mut inner.counters.updates);
        let update = OrderUpdate {
            id: OrderUpdateId(update_id),
            order: order_id,
            creator,
            time_created: now,
            items_delta: None,
            new_status: Some(OrderStatus::Fulfilled),
            new_owner: None,
            time_limit_delta: chrono::Duration::zero(),
            expiration_time_limit_delta: chrono::Duration::zero(),
            comment: comment.to_string(),
            time_limit_notice: false,
            maintenance: false,
        };
        inner.updates.insert(update_id, update);

        for (nickname, item_id) in assignments {
            let fulfillment_id = Counters::next(&mut inner.counters.fulfillments);
            inner.fulfillments.push(ItemFulfillment {
                id: fulfillment_id,
                order_update: OrderUpdateId(update_id),
                order: order_id,
                nickname: nickname.clone(),
                item: *item_id,
            });
            if let Some(item) = inner.items.get_mut(&item_id.value()) {
                item.set_holder(HeldBy::Order(order_id), now);
            }
        }

        if let Some(order) = inner.orders.get_mut(&order_id.value()) {
            order.status = OrderStatus::Fulfilled;
            order.blockage_cause = None;
        }

        Ok(CasResult::Success)
    }

    async fn set_order_blockage(&self, order: OrderId, cause: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(order) = inner.orders.get_mut(&order.value()) {
            order.blockage_cause = cause;
        }
        Ok(())
    }

    async fn insert_task(&self, draft: TaskDraft) -> Result<TaskRecord> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let id = Counters::next(&mut inner.counters.tasks);
        let now = Utc::now();
        let record = TaskRecord {
            row_id: TaskRowId(id),
            sid: self.sids.task_sid(TaskRowId(id)),
            task_id: draft.task_id,
            name: draft.name,
            args: draft.args,
            state: TaskState::Pending,
            publish_time: now,
            time_updated: now,
            soft_timeout: draft.soft_timeout,
            hard_timeout: draft.hard_timeout,
            blockage_cause: None,
            failure: None,
        };
        inner.tasks.insert(id, record.clone());
        Ok(record)
    }

    async fn get_task(&self, row: TaskRowId) -> Result<Option<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.tasks.get(&row.value()).cloned())
    }

    async fn find_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tasks
            .values()
            .find(|t| t.task_id == task_id)
            .cloned())
    }

    async fn claim_next_pending(&self) -> Result<Option<TaskRecord>> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(row_id) = inner
            .tasks
            .values()
            .find(|t| t.state == TaskState::Pending)
            .map(|t| t.row_id.value())
        else {
            return Ok(None);
        };
        let task = inner
            .tasks
            .get_mut(&row_id)
            .ok_or_else(|| Error::infrastructure("claimed task row vanished"))?;
        task.state = TaskState::Started;
        task.time_updated = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn cas_task_state(
        &self,
        row: TaskRowId,
        expected: TaskState,
        target: TaskState,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(task) = inner.tasks.get_mut(&row.value()) else {
            return Ok(CasResult::NotFound);
        };
        if task.state != expected {
            return Ok(CasResult::Conflict {
                actual: task.state.as_label().to_string(),
            });
        }
        if !task.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: task.state.to_string(),
                to: target.to_string(),
                reason: format!("task {}", task.sid),
            });
        }
        task.state = target;
        task.time_updated = Utc::now();
        Ok(CasResult::Success)
    }

    async fn set_task_blockage(&self, row: TaskRowId, cause: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(task) = inner.tasks.get_mut(&row.value()) {
            task.blockage_cause = cause;
        }
        Ok(())
    }

    async fn set_task_failure(&self, row: TaskRowId, failure: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(task) = inner.tasks.get_mut(&row.value()) {
            task.failure = failure;
        }
        Ok(())
    }

    async fn pre_running_tasks(&self) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.state.is_pre_running())
            .cloned()
            .collect())
    }

    async fn running_tasks(&self) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .cloned()
            .collect())
    }

    async fn tasks_with_state(&self, state: TaskState) -> Result<Vec<TaskRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_network() -> MemoryStore {
        let store = MemoryStore::new(b"test-secret");
        store.register_location("COLO").await.unwrap();
        store.register_network("COLO", "native").await.unwrap();
        store
    }

    async fn place_order(store: &MemoryStore) -> Order {
        let user = store.insert_user("alice", "token").await.unwrap();
        let tab = store.insert_tab(user.id, 1.0).await.unwrap();
        let (order, _) = store
            .create_order(OrderDraft {
                owner: user.id,
                tab: tab.id,
                maintenance: false,
                requirements: "n0:\n  type: rktest_yml\n".to_string(),
                time_limit: chrono::Duration::hours(2),
                expiration_time_limit: chrono::Duration::days(1),
                creator: UpdateCreator::User(user.id),
            })
            .await
            .unwrap();
        order
    }

    #[tokio::test]
    async fn insert_item_requires_registered_network() {
        let store = MemoryStore::new(b"test-secret");
        let err = store
            .insert_item(ItemDraft::new("rktest_yml", "COLO", "native"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
    }

    #[tokio::test]
    async fn order_creation_writes_initial_update() {
        let store = store_with_network().await;
        let order = place_order(&store).await;

        assert_eq!(order.status, OrderStatus::Open);
        let updates = store.order_updates(order.id).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].items_delta.is_some());
        assert_eq!(updates[0].time_limit_delta, chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn fulfill_order_is_atomic_and_exclusive() {
        let store = store_with_network().await;
        let order = place_order(&store).await;
        let item = store
            .insert_item(ItemDraft::new("rktest_yml", "COLO", "native"))
            .await
            .unwrap();

        let mut assignments = BTreeMap::new();
        assignments.insert("n0".to_string(), item.id);
        let result = store
            .fulfill_order(order.id, &assignments, UpdateCreator::System, "done")
            .await
            .unwrap();
        assert!(result.is_success());

        let item = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(item.held_by, HeldBy::Order(order.id));

        let fulfillments = store.fulfillments_for_order(order.id).await.unwrap();
        assert_eq!(fulfillments.len(), 1);
        assert_eq!(fulfillments[0].nickname, "n0");

        // A second reservation attempt conflicts: the order is no longer
        // open and the item is held.
        let result = store
            .fulfill_order(order.id, &assignments, UpdateCreator::System, "again")
            .await
            .unwrap();
        assert!(matches!(result, CasResult::Conflict { .. }));
    }

    #[tokio::test]
    async fn fulfill_aborts_when_item_is_held() {
        let store = store_with_network().await;
        let order = place_order(&store).await;
        let item = store
            .insert_item(ItemDraft::new("rktest_yml", "COLO", "native"))
            .await
            .unwrap();
        store
            .cas_item_holder(item.id, &HeldBy::Nobody, HeldBy::Task(TaskRowId(9)))
            .await
            .unwrap();

        let mut assignments = BTreeMap::new();
        assignments.insert("n0".to_string(), item.id);
        let result = store
            .fulfill_order(order.id, &assignments, UpdateCreator::System, "done")
            .await
            .unwrap();
        assert!(matches!(result, CasResult::Conflict { .. }));

        // Nothing was applied.
        assert!(store
            .fulfillments_for_order(order.id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Open
        );
    }

    #[tokio::test]
    async fn closing_releases_held_items() {
        let store = store_with_network().await;
        let order = place_order(&store).await;
        let item = store
            .insert_item(ItemDraft::new("rktest_yml", "COLO", "native"))
            .await
            .unwrap();
        let mut assignments = BTreeMap::new();
        assignments.insert("n0".to_string(), item.id);
        store
            .fulfill_order(order.id, &assignments, UpdateCreator::System, "done")
            .await
            .unwrap();

        store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::System)
                    .with_status(OrderStatus::Closed)
                    .with_comment("closing"),
            )
            .await
            .unwrap();

        let item = store.get_item(item.id).await.unwrap().unwrap();
        assert!(item.held_by.is_nobody());
        assert_eq!(
            store.get_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Closed
        );
    }

    #[tokio::test]
    async fn backward_status_transition_is_rejected() {
        let store = store_with_network().await;
        let order = place_order(&store).await;
        store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::System)
                    .with_status(OrderStatus::Closed),
            )
            .await
            .unwrap();

        let err = store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::System)
                    .with_status(OrderStatus::Open),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn folding_the_update_log_reproduces_the_cached_order() {
        let store = store_with_network().await;
        let order = place_order(&store).await;
        let bob = store.insert_user("bob", "token-b").await.unwrap();
        store.insert_tab(bob.id, 1.0).await.unwrap();

        store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::System)
                    .with_new_owner(bob.id)
                    .with_comment("transferred"),
            )
            .await
            .unwrap();
        store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::System)
                    .with_status(OrderStatus::Closed),
            )
            .await
            .unwrap();

        let cached = store.get_order(order.id).await.unwrap().unwrap();
        let updates = store.order_updates(order.id).await.unwrap();

        let folded_status = updates
            .iter()
            .filter_map(|u| u.new_status)
            .last()
            .unwrap();
        let folded_owner = updates
            .iter()
            .filter_map(|u| u.new_owner)
            .last()
            .unwrap_or(order.owner);
        assert_eq!(cached.status, folded_status);
        assert_eq!(cached.owner, folded_owner);
    }

    #[tokio::test]
    async fn cas_item_holder_reports_conflict() {
        let store = store_with_network().await;
        let item = store
            .insert_item(ItemDraft::new("rktest_yml", "COLO", "native"))
            .await
            .unwrap();

        let result = store
            .cas_item_holder(item.id, &HeldBy::Nobody, HeldBy::Order(OrderId(5)))
            .await
            .unwrap();
        assert!(result.is_success());

        let result = store
            .cas_item_holder(item.id, &HeldBy::Nobody, HeldBy::Order(OrderId(6)))
            .await
            .unwrap();
        assert!(matches!(result, CasResult::Conflict { .. }));
    }

    #[tokio::test]
    async fn claim_next_pending_takes_minimum_row_id() {
        let store = store_with_network().await;
        for name in ["A", "B"] {
            store
                .insert_task(TaskDraft {
                    name: name.to_string(),
                    task_id: format!("uuid-{name}"),
                    args: json!({}),
                    soft_timeout: None,
                    hard_timeout: None,
                })
                .await
                .unwrap();
        }

        let first = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(first.name, "A");
        assert_eq!(first.state, TaskState::Started);
        let second = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(second.name, "B");
        assert!(store.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_task_state_guards_transitions() {
        let store = store_with_network().await;
        let task = store
            .insert_task(TaskDraft {
                name: "A".to_string(),
                task_id: "uuid-a".to_string(),
                args: json!({}),
                soft_timeout: None,
                hard_timeout: None,
            })
            .await
            .unwrap();

        // Wrong expected state is a conflict.
        let result = store
            .cas_task_state(task.row_id, TaskState::Running, TaskState::Success)
            .await
            .unwrap();
        assert!(matches!(result, CasResult::Conflict { .. }));

        // Pending -> Revoked is a valid forced transition.
        let result = store
            .cas_task_state(task.row_id, TaskState::Pending, TaskState::Revoked)
            .await
            .unwrap();
        assert!(result.is_success());
    }
}
