//! Pluggable persistence for broker state.
//!
//! The [`BrokerStore`] trait is the narrow query surface the rest of the
//! core uses. The core assumes transactional updates with row-level
//! locking; every mutation of a holder, order status, or item state happens
//! inside one store call that is atomic from the caller's point of view.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: holder and task-state transitions use
//!   compare-and-swap so concurrent workers cannot double-assign an item or
//!   double-run a task
//! - **Audit preserved**: order updates and item fulfillments are
//!   append-only and never deleted
//! - **Testability**: in-memory implementation for tests and
//!   single-process deployments; a SQL implementation plugs in behind the
//!   same trait

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Duration;

use crate::error::Result;
use crate::ids::{ItemId, OrderId, TabId, TaskRowId, UserId};
use crate::item::{HeldBy, Item, ItemDraft, ItemState, Location, Network};
use crate::order::{ItemFulfillment, Order, OrderStatus, OrderUpdate, OrderUpdateDraft, UpdateCreator};
use crate::tab::Tab;
use crate::tasks::{TaskRecord, TaskState};
use crate::user::User;

pub use memory::MemoryStore;

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Entity not found.
    NotFound,
    /// The row changed under us; the caller retries.
    Conflict {
        /// Description of the actual state that was found.
        actual: String,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the entity was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Fields for creating an order together with its initial update.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    /// The owning user.
    pub owner: UserId,
    /// The tab to charge.
    pub tab: TabId,
    /// Whether this is a maintenance order.
    pub maintenance: bool,
    /// Initial requirements as a YAML patch.
    pub requirements: String,
    /// Initial lease limit.
    pub time_limit: Duration,
    /// Initial expiration limit.
    pub expiration_time_limit: Duration,
    /// Who is placing the order.
    pub creator: UpdateCreator,
}

/// Fields for publishing a task; the store assigns row id and SID.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    /// Registered task name.
    pub name: String,
    /// Opaque wire task id.
    pub task_id: String,
    /// JSON arguments.
    pub args: serde_json::Value,
    /// Soft timeout.
    pub soft_timeout: Option<std::time::Duration>,
    /// Hard timeout.
    pub hard_timeout: Option<std::time::Duration>,
}

/// Storage abstraction for broker state.
///
/// All methods are `Send + Sync` to support concurrent access from worker
/// tasks. Mutating methods are transactional: they either apply fully or
/// not at all.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    // --- Locations and networks ---

    /// Registers a location. Idempotent.
    async fn register_location(&self, name: &str) -> Result<Location>;

    /// Registers a network within a location. Idempotent.
    async fn register_network(&self, location: &str, name: &str) -> Result<Network>;

    /// Returns true if the (location, network) pair is registered.
    async fn network_exists(&self, location: &str, name: &str) -> Result<bool>;

    // --- Users and tabs ---

    /// Inserts a user with its opaque auth token.
    async fn insert_user(&self, username: &str, token: &str) -> Result<User>;

    /// Gets a user by id.
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// Finds a user by username.
    async fn find_user(&self, username: &str) -> Result<Option<User>>;

    /// Inserts a tab for an owner. At most one tab per owner.
    async fn insert_tab(&self, owner: UserId, limit: f64) -> Result<Tab>;

    /// Gets the tab of an owner.
    async fn tab_for_owner(&self, owner: UserId) -> Result<Option<Tab>>;

    // --- Items ---

    /// Inserts a new item in ACTIVE, free state.
    async fn insert_item(&self, draft: ItemDraft) -> Result<Item>;

    /// Gets an item by id.
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>>;

    /// Finds an item by its SID.
    async fn find_item_by_sid(&self, sid: &str) -> Result<Option<Item>>;

    /// Lists all items, destroyed included, ordered by id.
    async fn list_items(&self) -> Result<Vec<Item>>;

    /// Lists ACTIVE, free items ordered by id.
    async fn free_items(&self) -> Result<Vec<Item>>;

    /// Lists non-destroyed items held by the given holder.
    async fn items_held_by(&self, holder: HeldBy) -> Result<Vec<Item>>;

    /// Atomically replaces an item's holder if the current holder matches.
    async fn cas_item_holder(
        &self,
        id: ItemId,
        expected: &HeldBy,
        target: HeldBy,
    ) -> Result<CasResult>;

    /// Merges the given attributes into an item's declared attributes.
    async fn update_item_attributes(
        &self,
        id: ItemId,
        attributes: BTreeMap<String, serde_json::Value>,
    ) -> Result<CasResult>;

    /// Transitions an item's lifecycle state.
    async fn set_item_state(&self, id: ItemId, target: ItemState) -> Result<CasResult>;

    // --- Orders ---

    /// Creates an order and its initial update in one transaction.
    async fn create_order(&self, draft: OrderDraft) -> Result<(Order, OrderUpdate)>;

    /// Gets an order by id.
    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// Finds an order by its SID.
    async fn find_order_by_sid(&self, sid: &str) -> Result<Option<Order>>;

    /// Lists orders with the given status, ordered by id.
    async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<Order>>;

    /// Lists all orders of an owner, ordered by id.
    async fn orders_of_owner(&self, owner: UserId) -> Result<Vec<Order>>;

    /// Lists an order's updates ordered by (time_created, id).
    async fn order_updates(&self, order: OrderId) -> Result<Vec<OrderUpdate>>;

    /// Appends an update, folding it into the order's cached state.
    ///
    /// A transition into CLOSED releases every item held by the order back
    /// to free. Status transitions must be monotone.
    async fn append_order_update(&self, draft: OrderUpdateDraft) -> Result<OrderUpdate>;

    /// Lists the fulfillment bindings of an order.
    async fn fulfillments_for_order(&self, order: OrderId) -> Result<Vec<ItemFulfillment>>;

    /// Atomically reserves the assigned items and fulfills the order.
    ///
    /// Inside one transaction: re-checks the order is OPEN and every
    /// candidate is still free in the required state (ACTIVE, or
    /// MAINTENANCE for maintenance orders), sets each item's holder to the
    /// order, writes the fulfillment rows, and transitions the order to
    /// FULFILLED. If any row changed under us, nothing is applied and
    /// [`CasResult::Conflict`] is returned for retry on the next cycle.
    async fn fulfill_order(
        &self,
        order: OrderId,
        assignments: &BTreeMap<String, ItemId>,
        creator: UpdateCreator,
        comment: &str,
    ) -> Result<CasResult>;

    /// Records why an order is not progressing, surfaced by describe.
    async fn set_order_blockage(&self, order: OrderId, cause: Option<String>) -> Result<()>;

    // --- Tasks ---

    /// Publishes a task in PENDING state.
    async fn insert_task(&self, draft: TaskDraft) -> Result<TaskRecord>;

    /// Gets a task by row id.
    async fn get_task(&self, row: TaskRowId) -> Result<Option<TaskRecord>>;

    /// Finds a task by its opaque wire id.
    async fn find_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Claims the oldest PENDING task (minimum row id), transitioning it to
    /// STARTED. The claim is atomic: no two workers receive the same task.
    async fn claim_next_pending(&self) -> Result<Option<TaskRecord>>;

    /// Atomically transitions a task's state if the current state matches.
    async fn cas_task_state(
        &self,
        row: TaskRowId,
        expected: TaskState,
        target: TaskState,
    ) -> Result<CasResult>;

    /// Records a task's blockage cause (None clears it).
    async fn set_task_blockage(&self, row: TaskRowId, cause: Option<String>) -> Result<()>;

    /// Records a task's failure detail.
    async fn set_task_failure(&self, row: TaskRowId, failure: Option<String>) -> Result<()>;

    /// Lists tasks that have not yet entered RUNNING, ordered by row id.
    async fn pre_running_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Lists RUNNING tasks ordered by row id.
    async fn running_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// Lists tasks in the given state, ordered by row id.
    async fn tasks_with_state(&self, state: TaskState) -> Result<Vec<TaskRecord>>;
}
