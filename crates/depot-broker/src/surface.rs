//! The orchestration surface.
//!
//! [`BrokerSurface`] is the command contract the HTTP layer calls into:
//! place, describe, extend, transfer, close, and consume, plus the
//! administrative one-shots (user creation, pending-task cleanup, inventory
//! registration). Authentication, routing, and wire encoding live with the
//! HTTP layer; everything here speaks domain types and SIDs.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::catalog::{KindRegistry, RequirementsMap};
use crate::error::{Error, Result};
use crate::fulfillment::revoke_grow_tasks_for_order;
use crate::ids::UserId;
use crate::item::{Item, ItemState};
use crate::metrics::BrokerMetrics;
use crate::order::{self, Order, OrderStatus, OrderUpdateDraft, UpdateCreator};
use crate::store::{BrokerStore, OrderDraft};
use crate::tab::{TabLedger, DEFAULT_LIMIT};
use crate::tasks::TaskState;
use crate::user::User;

/// Largest address range one `register_ip_addresses` call may insert.
const MAX_IP_RANGE: u32 = 65_536;

/// How much of an order's history a describe includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Current state only.
    #[default]
    Summary,
    /// Current state plus the full update history.
    Detailed,
}

/// One entry of an order's update history, as exposed by describe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// When the update was appended.
    pub time_created: DateTime<Utc>,
    /// Who appended it.
    pub creator: String,
    /// Status transition carried by the update, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<OrderStatus>,
    /// The update's comment.
    pub comment: String,
}

/// A point-in-time view of one order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    /// The order's SID.
    pub sid: String,
    /// Current status.
    pub status: OrderStatus,
    /// Username of the current owner.
    pub owner: String,
    /// Whether this is a maintenance order.
    pub maintenance: bool,
    /// The folded requirements map.
    pub requirements: RequirementsMap,
    /// When the order was placed.
    pub time_created: DateTime<Utc>,
    /// When the order expires if never fulfilled.
    pub expiration_time: DateTime<Utc>,
    /// When the lease runs out; absent until fulfilled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ejection_time: Option<DateTime<Utc>>,
    /// Why fulfillment is not progressing, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockage_cause: Option<String>,
    /// Fulfilled items by nickname.
    pub items: BTreeMap<String, String>,
    /// Update history; populated for detailed describes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

/// The deadlines of an order after an extension.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDeadlines {
    /// When the order expires if never fulfilled.
    pub expiration_time: DateTime<Utc>,
    /// When the lease runs out; absent until fulfilled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ejection_time: Option<DateTime<Utc>>,
}

/// A request to place one order.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    /// The owning user.
    pub owner: UserId,
    /// Requirements by nickname.
    pub requirements: RequirementsMap,
    /// Lease length once fulfilled.
    pub time_limit: Duration,
    /// How long the order may stay open before it is abandoned.
    pub expiration_time_limit: Duration,
    /// Whether this is a maintenance order.
    pub maintenance: bool,
}

/// Commands callable by the external HTTP handlers.
#[derive(Clone)]
pub struct BrokerSurface {
    store: Arc<dyn BrokerStore>,
    catalog: Arc<KindRegistry>,
    ledger: TabLedger,
    metrics: BrokerMetrics,
}

impl BrokerSurface {
    /// Creates a surface over the given store and catalog.
    #[must_use]
    pub fn new(store: Arc<dyn BrokerStore>, catalog: Arc<KindRegistry>) -> Self {
        let ledger = TabLedger::new(Arc::clone(&store), Arc::clone(&catalog));
        Self {
            store,
            catalog,
            ledger,
            metrics: BrokerMetrics::new(),
        }
    }

    /// The ledger this surface admits placements through.
    #[must_use]
    pub fn ledger(&self) -> &TabLedger {
        &self.ledger
    }

    /// Places a new order.
    ///
    /// Validates that every requirement names a known kind, that the order
    /// is conceivably fulfillable, and that the owner's tab admits the
    /// cost. Maintenance orders bypass the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] for an empty or unpriceable
    /// order or insufficient credit, and [`Error::Unfulfillable`] when no
    /// inventory could ever match a nickname.
    pub async fn place_order(&self, request: PlaceOrderRequest) -> Result<OrderSnapshot> {
        if request.requirements.is_empty() {
            return Err(Error::admission_denied("order has no requirements"));
        }
        let cost = self.catalog.order_price(&request.requirements)?;
        self.check_fulfillable(&request.requirements).await?;
        if !request.maintenance {
            self.ledger.admit(request.owner, cost).await?;
        }
        let tab = self
            .store
            .tab_for_owner(request.owner)
            .await?
            .ok_or_else(|| {
                Error::admission_denied(format!("user {} has no tab", request.owner))
            })?;

        let requirements = serde_yaml::to_string(&request.requirements)
            .map_err(|e| Error::serialization(format!("requirements: {e}")))?;
        let (order, _) = self
            .store
            .create_order(OrderDraft {
                owner: request.owner,
                tab: tab.id,
                maintenance: request.maintenance,
                requirements,
                time_limit: request.time_limit,
                expiration_time_limit: request.expiration_time_limit,
                creator: UpdateCreator::User(request.owner),
            })
            .await?;
        tracing::info!(order = %order.sid, cost, "placed order");
        self.snapshot(&order, Verbosity::Summary).await
    }

    /// Describes an order.
    ///
    /// Always succeeds for an extant SID, whatever the order's state, and
    /// reports the most recent blockage cause attached to pending
    /// fulfillment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the SID does not resolve.
    pub async fn describe_order(&self, sid: &str, verbosity: Verbosity) -> Result<OrderSnapshot> {
        let order = self.resolve_order(sid).await?;
        self.snapshot(&order, verbosity).await
    }

    /// Extends an order's lease and expiration deadlines by `delta`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the SID does not resolve and
    /// [`Error::AdmissionDenied`] on a CLOSED order.
    pub async fn extend_order(
        &self,
        sid: &str,
        delta: Duration,
        comment: &str,
    ) -> Result<OrderDeadlines> {
        let order = self.resolve_order(sid).await?;
        if order.status == OrderStatus::Closed {
            return Err(Error::admission_denied(format!(
                "order {sid} is closed and cannot be extended"
            )));
        }
        self.store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::User(order.owner))
                    .with_time_limit_delta(delta)
                    .with_expiration_delta(delta)
                    .with_comment(comment),
            )
            .await?;

        let updates = self.store.order_updates(order.id).await?;
        Ok(OrderDeadlines {
            expiration_time: order::expiration_time(&order, &updates),
            ejection_time: order::ejection_time(&updates),
        })
    }

    /// Transfers an order to a new owner, re-checking the destination tab.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown order or username and
    /// [`Error::AdmissionDenied`] when the order is closed or the
    /// destination tab cannot absorb the order's cost.
    pub async fn transfer_order(
        &self,
        sid: &str,
        new_owner: &str,
        comment: &str,
    ) -> Result<OrderSnapshot> {
        let order = self.resolve_order(sid).await?;
        if order.status == OrderStatus::Closed {
            return Err(Error::admission_denied(format!(
                "order {sid} is closed and cannot be transferred"
            )));
        }
        let destination = self
            .store
            .find_user(new_owner)
            .await?
            .ok_or_else(|| Error::not_found("user", new_owner))?;

        if !order.maintenance {
            let updates = self.store.order_updates(order.id).await?;
            let requirements = order::fold_requirements(&updates)?;
            let cost = self.catalog.order_price(&requirements)?;
            self.ledger.admit(destination.id, cost).await?;
        }

        self.store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::User(order.owner))
                    .with_new_owner(destination.id)
                    .with_comment(format!(
                        "Order transferred to {new_owner}. {comment}"
                    )),
            )
            .await?;
        let order = self
            .store
            .get_order(order.id)
            .await?
            .ok_or_else(|| Error::not_found("order", sid))?;
        self.snapshot(&order, Verbosity::Summary).await
    }

    /// Closes an order, releasing its items and revoking in-flight grow
    /// tasks.
    ///
    /// Closing an already-closed order is a no-op returning the same
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the SID does not resolve.
    pub async fn close_order(&self, sid: &str, comment: &str) -> Result<OrderSnapshot> {
        let order = self.resolve_order(sid).await?;
        if order.status == OrderStatus::Closed {
            return self.snapshot(&order, Verbosity::Summary).await;
        }
        self.store
            .append_order_update(
                OrderUpdateDraft::new(order.id, UpdateCreator::User(order.owner))
                    .with_status(OrderStatus::Closed)
                    .with_comment(comment),
            )
            .await?;
        revoke_grow_tasks_for_order(&self.store, &order.sid).await?;
        self.metrics.record_order_closed("client");
        tracing::info!(order = %order.sid, "closed order");

        let order = self
            .store
            .get_order(order.id)
            .await?
            .ok_or_else(|| Error::not_found("order", sid))?;
        self.snapshot(&order, Verbosity::Summary).await
    }

    /// Returns the materialized items map of a fulfilled order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the SID does not resolve and
    /// [`Error::AdmissionDenied`] unless the order is FULFILLED.
    pub async fn consume_order(&self, sid: &str) -> Result<BTreeMap<String, Item>> {
        let order = self.resolve_order(sid).await?;
        if order.status != OrderStatus::Fulfilled {
            return Err(Error::admission_denied(format!(
                "order {sid} is {} and cannot be consumed",
                order.status
            )));
        }
        let mut manifest = BTreeMap::new();
        for fulfillment in self.store.fulfillments_for_order(order.id).await? {
            let item = self
                .store
                .get_item(fulfillment.item)
                .await?
                .ok_or_else(|| Error::not_found("item", fulfillment.item.to_string()))?;
            manifest.insert(fulfillment.nickname, item);
        }
        Ok(manifest)
    }

    // --- Administrative one-shots ---

    /// Creates a user together with its auth token and default tab.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] if the username is taken.
    pub async fn create_user(&self, username: &str) -> Result<User> {
        let token = Uuid::new_v4().simple().to_string();
        let user = self.store.insert_user(username, &token).await?;
        self.store.insert_tab(user.id, DEFAULT_LIMIT).await?;
        tracing::info!(user = %user.sid, username, "created user with tab and token");
        Ok(user)
    }

    /// Fails every PENDING task.
    ///
    /// Run after a broker restart: tasks that were queued in the previous
    /// incarnation will never be picked up by this one. Returns how many
    /// tasks were failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn fail_pending_tasks(&self) -> Result<usize> {
        let mut failed = 0;
        for task in self.store.tasks_with_state(TaskState::Pending).await? {
            self.store
                .set_task_failure(
                    task.row_id,
                    Some("failed administratively while pending".to_string()),
                )
                .await?;
            let started = self
                .store
                .cas_task_state(task.row_id, TaskState::Pending, TaskState::Started)
                .await?;
            if !started.is_success() {
                continue;
            }
            if self
                .store
                .cas_task_state(task.row_id, TaskState::Started, TaskState::Failure)
                .await?
                .is_success()
            {
                failed += 1;
            }
        }
        tracing::info!(failed, "failed pending tasks");
        Ok(failed)
    }

    /// Registers a contiguous range of reserved IP addresses as inventory.
    ///
    /// Addresses already registered on the (location, network) are skipped.
    /// Returns the newly created items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] for an inverted or oversized
    /// range or an unregistered network.
    pub async fn register_ip_addresses(
        &self,
        location: &str,
        network: &str,
        first: Ipv4Addr,
        last: Ipv4Addr,
    ) -> Result<Vec<Item>> {
        let (start, end) = (u32::from(first), u32::from(last));
        if start > end {
            return Err(Error::admission_denied(format!(
                "inverted address range {first}..{last}"
            )));
        }
        if end - start >= MAX_IP_RANGE {
            return Err(Error::admission_denied(format!(
                "address range {first}..{last} exceeds {MAX_IP_RANGE} addresses"
            )));
        }

        let existing: Vec<String> = self
            .store
            .list_items()
            .await?
            .into_iter()
            .filter(|item| {
                item.kind == "ip_address"
                    && item.state != ItemState::Destroyed
                    && item.location == location
                    && item.network == network
            })
            .filter_map(|item| {
                item.attributes
                    .get("address")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            })
            .collect();

        let mut created = Vec::new();
        for raw in start..=end {
            let address = Ipv4Addr::from(raw).to_string();
            if existing.contains(&address) {
                continue;
            }
            let item = self
                .store
                .insert_item(
                    crate::item::ItemDraft::new("ip_address", location, network)
                        .with_attribute("address", address),
                )
                .await?;
            created.push(item);
        }
        tracing::info!(location, network, created = created.len(), "registered ip addresses");
        Ok(created)
    }

    /// Adds or updates one vSphere-backed inventory item, keyed by its
    /// `name` attribute within the kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] for kinds that are not
    /// vSphere-backed or an unregistered network.
    pub async fn register_vsphere_item(
        &self,
        location: &str,
        network: &str,
        kind: &str,
        name: &str,
        attributes: BTreeMap<String, Value>,
    ) -> Result<Item> {
        if !matches!(kind, "esx_host" | "vsphere_vm") {
            return Err(Error::admission_denied(format!(
                "kind {kind:?} is not vSphere-backed"
            )));
        }

        let existing = self
            .store
            .list_items()
            .await?
            .into_iter()
            .find(|item| {
                item.kind == kind
                    && item.state != ItemState::Destroyed
                    && item.attributes.get("name").and_then(Value::as_str) == Some(name)
            });

        if let Some(item) = existing {
            self.store
                .update_item_attributes(item.id, attributes)
                .await?;
            let item = self
                .store
                .get_item(item.id)
                .await?
                .ok_or_else(|| Error::not_found("item", item.sid.clone()))?;
            tracing::info!(item = %item.sid, kind, name, "updated vsphere item");
            return Ok(item);
        }

        let mut draft = crate::item::ItemDraft::new(kind, location, network)
            .with_attribute("name", name);
        draft.attributes.extend(attributes);
        let item = self.store.insert_item(draft).await?;
        tracing::info!(item = %item.sid, kind, name, "registered vsphere item");
        Ok(item)
    }

    // --- Internals ---

    async fn resolve_order(&self, sid: &str) -> Result<Order> {
        self.store
            .find_order_by_sid(sid)
            .await?
            .ok_or_else(|| Error::not_found("order", sid))
    }

    /// An order is conceivably fulfillable when every nickname could be
    /// matched by some existing non-destroyed item or grown on demand.
    async fn check_fulfillable(&self, requirements: &RequirementsMap) -> Result<()> {
        let items = self.store.list_items().await?;
        let mut dead = Vec::new();
        for (nickname, requirement) in requirements {
            let elastic = self
                .catalog
                .get(&requirement.kind)
                .is_some_and(|kind| kind.is_elastic());
            if elastic {
                continue;
            }
            let conceivable = items.iter().any(|item| {
                item.state != ItemState::Destroyed && self.catalog.matches(item, requirement)
            });
            if !conceivable {
                dead.push(nickname.clone());
            }
        }
        if dead.is_empty() {
            Ok(())
        } else {
            Err(Error::unfulfillable(format!(
                "no inventory could ever match: {}",
                dead.join(", ")
            )))
        }
    }

    async fn snapshot(&self, order: &Order, verbosity: Verbosity) -> Result<OrderSnapshot> {
        let updates = self.store.order_updates(order.id).await?;
        let requirements = order::fold_requirements(&updates)?;

        let mut items = BTreeMap::new();
        for fulfillment in self.store.fulfillments_for_order(order.id).await? {
            if let Some(item) = self.store.get_item(fulfillment.item).await? {
                items.insert(fulfillment.nickname, item.sid);
            }
        }

        let owner = self
            .store
            .get_user(order.owner)
            .await?
            .map_or_else(|| order.owner.to_string(), |user| user.username);

        let history = match verbosity {
            Verbosity::Summary => Vec::new(),
            Verbosity::Detailed => updates
                .iter()
                .map(|update| HistoryEntry {
                    time_created: update.time_created,
                    creator: update.creator.to_string(),
                    new_status: update.new_status,
                    comment: update.comment.clone(),
                })
                .collect(),
        };

        Ok(OrderSnapshot {
            sid: order.sid.clone(),
            status: order.status,
            owner,
            maintenance: order.maintenance,
            requirements,
            time_created: order.time_created,
            expiration_time: order::expiration_time(order, &updates),
            ejection_time: order::ejection_time(&updates),
            blockage_cause: order.blockage_cause.clone(),
            items,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_catalog, CatalogConfig, Requirement};
    use crate::item::ItemDraft;
    use crate::store::{MemoryStore, TaskDraft};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        surface: BrokerSurface,
        alice: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new(b"test-secret"));
        store.register_location("COLO").await.unwrap();
        store.register_network("COLO", "native").await.unwrap();
        let catalog = Arc::new(default_catalog(&CatalogConfig::default()));
        let surface = BrokerSurface::new(store.clone(), catalog);
        let alice = surface.create_user("alice").await.unwrap();
        Fixture {
            store,
            surface,
            alice,
        }
    }

    fn dynapod_request(owner: UserId) -> PlaceOrderRequest {
        let mut requirements = RequirementsMap::new();
        requirements.insert(
            "n0".to_string(),
            Requirement::new("rktest_yml").with("platform", "DYNAPOD"),
        );
        PlaceOrderRequest {
            owner,
            requirements,
            time_limit: Duration::hours(2),
            expiration_time_limit: Duration::days(1),
            maintenance: false,
        }
    }

    async fn insert_pod(fixture: &Fixture) -> Item {
        fixture
            .store
            .insert_item(
                ItemDraft::new("rktest_yml", "COLO", "native").with_attribute("platform", "DYNAPOD"),
            )
            .await
            .unwrap()
    }

    async fn fulfill(fixture: &Fixture, snapshot: &OrderSnapshot, item: &Item) {
        let order = fixture
            .store
            .find_order_by_sid(&snapshot.sid)
            .await
            .unwrap()
            .unwrap();
        let mut assignments = BTreeMap::new();
        assignments.insert("n0".to_string(), item.id);
        assert!(fixture
            .store
            .fulfill_order(order.id, &assignments, UpdateCreator::System, "fulfilled")
            .await
            .unwrap()
            .is_success());
    }

    #[tokio::test]
    async fn create_user_provisions_tab_and_token() {
        let fixture = fixture().await;
        assert!(!fixture.alice.token.is_empty());
        let tab = fixture
            .store
            .tab_for_owner(fixture.alice.id)
            .await
            .unwrap()
            .unwrap();
        assert!((tab.limit - DEFAULT_LIMIT).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn place_and_describe_round_trip() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;

        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();
        assert_eq!(placed.status, OrderStatus::Open);
        assert_eq!(placed.owner, "alice");

        let described = fixture
            .surface
            .describe_order(&placed.sid, Verbosity::Detailed)
            .await
            .unwrap();
        assert_eq!(described.sid, placed.sid);
        assert_eq!(described.history.len(), 1);
        assert_eq!(described.requirements["n0"].kind, "rktest_yml");
    }

    #[tokio::test]
    async fn place_rejects_empty_and_unknown_kinds() {
        let fixture = fixture().await;
        let empty = PlaceOrderRequest {
            owner: fixture.alice.id,
            requirements: RequirementsMap::new(),
            time_limit: Duration::hours(2),
            expiration_time_limit: Duration::days(1),
            maintenance: false,
        };
        assert!(matches!(
            fixture.surface.place_order(empty).await.unwrap_err(),
            Error::AdmissionDenied { .. }
        ));

        let mut requirements = RequirementsMap::new();
        requirements.insert("n0".to_string(), Requirement::new("warp_drive"));
        let unknown = PlaceOrderRequest {
            owner: fixture.alice.id,
            requirements,
            time_limit: Duration::hours(2),
            expiration_time_limit: Duration::days(1),
            maintenance: false,
        };
        assert!(matches!(
            fixture.surface.place_order(unknown).await.unwrap_err(),
            Error::AdmissionDenied { .. }
        ));
    }

    #[tokio::test]
    async fn place_dead_on_arrival_is_unfulfillable() {
        let fixture = fixture().await;
        // rktest_yml is not elastic and no pod exists.
        let err = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unfulfillable { .. }));
        assert!(err.to_string().contains("n0"));
    }

    #[tokio::test]
    async fn place_over_tab_limit_is_denied() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;
        // Five pods at 0.25 each exceed the 1.0 default limit.
        let mut requirements = RequirementsMap::new();
        for n in 0..5 {
            requirements.insert(format!("n{n}"), Requirement::new("rktest_yml"));
        }
        let request = PlaceOrderRequest {
            owner: fixture.alice.id,
            requirements,
            time_limit: Duration::hours(2),
            expiration_time_limit: Duration::days(1),
            maintenance: false,
        };
        let err = fixture.surface.place_order(request).await.unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
        assert!(err.to_string().contains("tab"));
    }

    #[tokio::test]
    async fn maintenance_orders_bypass_the_ledger() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;
        let mut requirements = RequirementsMap::new();
        for n in 0..5 {
            requirements.insert(format!("n{n}"), Requirement::new("rktest_yml"));
        }
        let request = PlaceOrderRequest {
            owner: fixture.alice.id,
            requirements,
            time_limit: Duration::hours(2),
            expiration_time_limit: Duration::days(1),
            maintenance: true,
        };
        fixture.surface.place_order(request).await.unwrap();
    }

    #[tokio::test]
    async fn describe_unknown_sid_is_not_found() {
        let fixture = fixture().await;
        let err = fixture
            .surface
            .describe_order("nosuch-sid", Verbosity::Summary)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn extend_pushes_both_deadlines() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();

        let deadlines = fixture
            .surface
            .extend_order(&placed.sid, Duration::days(1), "need it longer")
            .await
            .unwrap();
        assert_eq!(
            deadlines.expiration_time,
            placed.expiration_time + Duration::days(1)
        );
        assert!(deadlines.ejection_time.is_none());
    }

    #[tokio::test]
    async fn extend_closed_order_fails() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();
        fixture.surface.close_order(&placed.sid, "done").await.unwrap();

        let err = fixture
            .surface
            .extend_order(&placed.sid, Duration::days(1), "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
    }

    #[tokio::test]
    async fn transfer_rechecks_destination_tab() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();

        // bob's tab has no headroom at all.
        let bob = fixture.store.insert_user("bob", "token-b").await.unwrap();
        fixture.store.insert_tab(bob.id, 0.0).await.unwrap();
        let err = fixture
            .surface
            .transfer_order(&placed.sid, "bob", "take over")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));

        // carol can absorb it.
        fixture.surface.create_user("carol").await.unwrap();
        let transferred = fixture
            .surface
            .transfer_order(&placed.sid, "carol", "take over")
            .await
            .unwrap();
        assert_eq!(transferred.owner, "carol");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let fixture = fixture().await;
        let pod = insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();
        fulfill(&fixture, &placed, &pod).await;

        let first = fixture.surface.close_order(&placed.sid, "done").await.unwrap();
        assert_eq!(first.status, OrderStatus::Closed);
        let pod = fixture.store.get_item(pod.id).await.unwrap().unwrap();
        assert!(pod.held_by.is_nobody());

        let second = fixture.surface.close_order(&placed.sid, "again").await.unwrap();
        assert_eq!(second.status, OrderStatus::Closed);
        // No extra update was appended by the second close.
        let order = fixture
            .store
            .find_order_by_sid(&placed.sid)
            .await
            .unwrap()
            .unwrap();
        let updates = fixture.store.order_updates(order.id).await.unwrap();
        let closes = updates
            .iter()
            .filter(|u| u.new_status == Some(OrderStatus::Closed))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn consume_requires_fulfillment() {
        let fixture = fixture().await;
        let pod = insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();

        let err = fixture.surface.consume_order(&placed.sid).await.unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));

        fulfill(&fixture, &placed, &pod).await;
        let manifest = fixture.surface.consume_order(&placed.sid).await.unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest["n0"].sid, pod.sid);
    }

    #[tokio::test]
    async fn fail_pending_tasks_clears_the_queue() {
        let fixture = fixture().await;
        for n in 0..3 {
            fixture
                .store
                .insert_task(TaskDraft {
                    name: "GrowItem".to_string(),
                    task_id: format!("uuid-{n}"),
                    args: json!({}),
                    soft_timeout: None,
                    hard_timeout: None,
                })
                .await
                .unwrap();
        }

        let failed = fixture.surface.fail_pending_tasks().await.unwrap();
        assert_eq!(failed, 3);
        assert!(fixture
            .store
            .tasks_with_state(TaskState::Pending)
            .await
            .unwrap()
            .is_empty());
        let failures = fixture
            .store
            .tasks_with_state(TaskState::Failure)
            .await
            .unwrap();
        assert_eq!(failures.len(), 3);
        assert!(failures[0]
            .failure
            .as_deref()
            .unwrap()
            .contains("administratively"));
    }

    #[tokio::test]
    async fn register_ip_addresses_skips_existing() {
        let fixture = fixture().await;
        let first = fixture
            .surface
            .register_ip_addresses(
                "COLO",
                "native",
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 4),
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].attributes["address"], "10.0.0.1");

        // Overlapping range only adds the new tail.
        let second = fixture
            .surface
            .register_ip_addresses(
                "COLO",
                "native",
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 6),
            )
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn register_ip_addresses_rejects_bad_ranges() {
        let fixture = fixture().await;
        assert!(fixture
            .surface
            .register_ip_addresses(
                "COLO",
                "native",
                Ipv4Addr::new(10, 0, 0, 9),
                Ipv4Addr::new(10, 0, 0, 1),
            )
            .await
            .is_err());
        assert!(fixture
            .surface
            .register_ip_addresses(
                "COLO",
                "native",
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(10, 255, 255, 255),
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn register_vsphere_item_adds_then_updates() {
        let fixture = fixture().await;
        let mut attributes = BTreeMap::new();
        attributes.insert("cpu_cores".to_string(), Value::from(16));
        let added = fixture
            .surface
            .register_vsphere_item("COLO", "native", "esx_host", "esx-01", attributes)
            .await
            .unwrap();
        assert_eq!(added.attributes["name"], "esx-01");
        assert_eq!(added.attributes["cpu_cores"], 16);

        let mut updated_attributes = BTreeMap::new();
        updated_attributes.insert("cpu_cores".to_string(), Value::from(32));
        let updated = fixture
            .surface
            .register_vsphere_item("COLO", "native", "esx_host", "esx-01", updated_attributes)
            .await
            .unwrap();
        assert_eq!(updated.id, added.id);
        assert_eq!(updated.attributes["cpu_cores"], 32);

        assert!(fixture
            .surface
            .register_vsphere_item("COLO", "native", "rktest_yml", "pod-1", BTreeMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn blockage_cause_surfaces_in_describe() {
        let fixture = fixture().await;
        insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();
        // The engine records why fulfillment is not progressing; simulate
        // its bookkeeping here.
        let order = fixture
            .store
            .find_order_by_sid(&placed.sid)
            .await
            .unwrap()
            .unwrap();
        fixture
            .store
            .set_order_blockage(order.id, Some("waiting for items: n0".to_string()))
            .await
            .unwrap();

        let described = fixture
            .surface
            .describe_order(&placed.sid, Verbosity::Summary)
            .await
            .unwrap();
        assert_eq!(
            described.blockage_cause.as_deref(),
            Some("waiting for items: n0")
        );
    }

    #[tokio::test]
    async fn transfer_moves_billing_to_the_new_tab() {
        let fixture = fixture().await;
        let pod = insert_pod(&fixture).await;
        let placed = fixture
            .surface
            .place_order(dynapod_request(fixture.alice.id))
            .await
            .unwrap();
        fulfill(&fixture, &placed, &pod).await;
        fixture.surface.create_user("carol").await.unwrap();

        fixture
            .surface
            .transfer_order(&placed.sid, "carol", "handing off")
            .await
            .unwrap();

        let carol = fixture.store.find_user("carol").await.unwrap().unwrap();
        let consumed = fixture.surface.ledger().consumed(carol.id).await.unwrap();
        assert!((consumed - 0.25).abs() < f64::EPSILON);
        let alice_consumed = fixture
            .surface
            .ledger()
            .consumed(fixture.alice.id)
            .await
            .unwrap();
        assert!(alice_consumed.abs() < f64::EPSILON);
    }
}
