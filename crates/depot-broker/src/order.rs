//! Orders, their append-only update log, and fulfillment bindings.
//!
//! Clients mutate order state only by appending [`OrderUpdate`] rows; the
//! authoritative state of an order is the fold of its updates. Updates and
//! [`ItemFulfillment`] rows are never deleted; they are the audit log.
//!
//! Folds aggregate by update id, never by comparing wall-clock timestamps
//! of near-simultaneous rows: the auto-increment id is guaranteed monotone
//! where timestamps are not.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::RequirementsMap;
use crate::error::{Error, Result};
use crate::ids::{ItemId, OrderId, OrderUpdateId, TabId, TaskRowId, UserId};

/// Order lifecycle states.
///
/// Transitions are monotone: OPEN → FULFILLED → CLOSED, or OPEN → CLOSED.
/// There are no backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed and waiting to be fulfilled.
    Open,
    /// All items are reserved and ready to consume.
    Fulfilled,
    /// Finished; items have been released for cleanup.
    Closed,
}

impl OrderStatus {
    /// Returns true if this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Open => matches!(target, Self::Fulfilled | Self::Closed),
            Self::Fulfilled => matches!(target, Self::Closed),
            Self::Closed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Fulfilled => "fulfilled",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Fulfilled => write!(f, "FULFILLED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Who created an order update. The creator of an update can differ from
/// the owner of the order; for auditability every update records its
/// creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateCreator {
    /// A user acting through the orchestration surface.
    User(UserId),
    /// A broker task (fulfiller, sweeper, grow/destroy).
    Task(TaskRowId),
    /// The broker itself, outside any task context.
    System,
}

impl fmt::Display for UpdateCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user {id}"),
            Self::Task(id) => write!(f, "task {id}"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A request for a set of items to be consumed in one sitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Auto-increment row id.
    pub id: OrderId,
    /// Externally-visible identifier.
    pub sid: String,
    /// Current owner. May change through transfer updates.
    pub owner: UserId,
    /// The tab charged for this order.
    pub tab: TabId,
    /// Current status (cached fold of the updates).
    pub status: OrderStatus,
    /// Maintenance orders bypass the tab ledger and expiration, and select
    /// items for quarantine rather than consumption.
    pub maintenance: bool,
    /// Why fulfillment is not progressing, if known. Surfaced by describe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockage_cause: Option<String>,
    /// When the order was placed.
    pub time_created: DateTime<Utc>,
}

/// One append-only event in an order's history.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    /// Auto-increment row id; the fold order.
    pub id: OrderUpdateId,
    /// The order this update belongs to.
    pub order: OrderId,
    /// Who created the update.
    pub creator: UpdateCreator,
    /// When the update was appended.
    pub time_created: DateTime<Utc>,
    /// YAML patch over the requirements map (nickname → requirement).
    pub items_delta: Option<String>,
    /// Status to transition to, if any.
    pub new_status: Option<OrderStatus>,
    /// New owner, if this update transfers the order.
    pub new_owner: Option<UserId>,
    /// Extension of the lease (time limit after fulfillment).
    pub time_limit_delta: Duration,
    /// Extension of the expiration deadline.
    pub expiration_time_limit_delta: Duration,
    /// Free-form comment.
    pub comment: String,
    /// Whether this update is an impending-ejection notice.
    pub time_limit_notice: bool,
    /// Whether this update marked the order's items for maintenance.
    pub maintenance: bool,
}

/// Fields for appending an update; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct OrderUpdateDraft {
    /// The order to update.
    pub order: OrderId,
    /// Who is appending.
    pub creator: UpdateCreator,
    /// YAML patch over the requirements map.
    pub items_delta: Option<String>,
    /// Status to transition to.
    pub new_status: Option<OrderStatus>,
    /// New owner for a transfer.
    pub new_owner: Option<UserId>,
    /// Lease extension.
    pub time_limit_delta: Duration,
    /// Expiration extension.
    pub expiration_time_limit_delta: Duration,
    /// Free-form comment.
    pub comment: String,
    /// Ejection-notice flag.
    pub time_limit_notice: bool,
    /// Maintenance-marking flag.
    pub maintenance: bool,
}

impl OrderUpdateDraft {
    /// Creates an empty draft for the given order and creator.
    #[must_use]
    pub fn new(order: OrderId, creator: UpdateCreator) -> Self {
        Self {
            order,
            creator,
            items_delta: None,
            new_status: None,
            new_owner: None,
            time_limit_delta: Duration::zero(),
            expiration_time_limit_delta: Duration::zero(),
            comment: String::new(),
            time_limit_notice: false,
            maintenance: false,
        }
    }

    /// Sets the items patch.
    #[must_use]
    pub fn with_items_delta(mut self, delta: impl Into<String>) -> Self {
        self.items_delta = Some(delta.into());
        self
    }

    /// Sets the status transition.
    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.new_status = Some(status);
        self
    }

    /// Sets the new owner.
    #[must_use]
    pub fn with_new_owner(mut self, owner: UserId) -> Self {
        self.new_owner = Some(owner);
        self
    }

    /// Sets the lease extension.
    #[must_use]
    pub fn with_time_limit_delta(mut self, delta: Duration) -> Self {
        self.time_limit_delta = delta;
        self
    }

    /// Sets the expiration extension.
    #[must_use]
    pub fn with_expiration_delta(mut self, delta: Duration) -> Self {
        self.expiration_time_limit_delta = delta;
        self
    }

    /// Sets the comment.
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Marks the update as an ejection notice.
    #[must_use]
    pub fn as_notice(mut self) -> Self {
        self.time_limit_notice = true;
        self
    }

    /// Marks the update as having set items to maintenance.
    #[must_use]
    pub fn as_maintenance(mut self) -> Self {
        self.maintenance = true;
        self
    }
}

/// The binding of one nickname in one order update to one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFulfillment {
    /// Auto-increment row id.
    pub id: u64,
    /// The fulfillment update this binding is part of.
    pub order_update: OrderUpdateId,
    /// The order being fulfilled.
    pub order: OrderId,
    /// The customer's nickname for the required item.
    pub nickname: String,
    /// The item used to fulfill the slot.
    pub item: ItemId,
}

/// Folds the requirements map from the update log.
///
/// Each `items_delta` is a YAML mapping of nickname to requirement; later
/// updates override earlier ones key by key.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if any patch is not valid YAML.
pub fn fold_requirements(updates: &[OrderUpdate]) -> Result<RequirementsMap> {
    let mut requirements = RequirementsMap::new();
    for update in updates {
        let Some(delta) = update.items_delta.as_deref() else {
            continue;
        };
        let patch: RequirementsMap = serde_yaml::from_str(delta).map_err(|e| {
            Error::serialization(format!("items_delta of update {}: {e}", update.id))
        })?;
        requirements.extend(patch);
    }
    Ok(requirements)
}

/// Folds the lease time limit: the sum of all lease deltas.
#[must_use]
pub fn fold_time_limit(updates: &[OrderUpdate]) -> Duration {
    updates
        .iter()
        .fold(Duration::zero(), |acc, u| acc + u.time_limit_delta)
}

/// Folds the expiration time limit: the sum of all expiration deltas.
#[must_use]
pub fn fold_expiration_time_limit(updates: &[OrderUpdate]) -> Duration {
    updates.iter().fold(Duration::zero(), |acc, u| {
        acc + u.expiration_time_limit_delta
    })
}

/// When the order was fulfilled, if it has been: the time of the latest
/// update that set the FULFILLED status.
#[must_use]
pub fn fulfillment_time(updates: &[OrderUpdate]) -> Option<DateTime<Utc>> {
    updates
        .iter()
        .filter(|u| u.new_status == Some(OrderStatus::Fulfilled))
        .max_by_key(|u| u.id)
        .map(|u| u.time_created)
}

/// When the order will expire: placement time plus the folded expiration
/// limit.
#[must_use]
pub fn expiration_time(order: &Order, updates: &[OrderUpdate]) -> DateTime<Utc> {
    order.time_created + fold_expiration_time_limit(updates)
}

/// When the order's lease runs out: fulfillment time plus the folded time
/// limit. `None` until the order is fulfilled.
#[must_use]
pub fn ejection_time(updates: &[OrderUpdate]) -> Option<DateTime<Utc>> {
    fulfillment_time(updates).map(|fulfilled| fulfilled + fold_time_limit(updates))
}

/// Counts ejection notices appended at or after the given time.
#[must_use]
pub fn notices_since(updates: &[OrderUpdate], time: DateTime<Utc>) -> usize {
    updates
        .iter()
        .filter(|u| u.time_limit_notice && u.time_created >= time)
        .count()
}

/// The time of the most recent ejection notice, if any.
#[must_use]
pub fn last_notice_time(updates: &[OrderUpdate]) -> Option<DateTime<Utc>> {
    updates
        .iter()
        .filter(|u| u.time_limit_notice)
        .max_by_key(|u| u.id)
        .map(|u| u.time_created)
}

/// Whether the order's items were already marked for maintenance.
#[must_use]
pub fn marked_for_maintenance(updates: &[OrderUpdate]) -> bool {
    updates.iter().any(|u| u.maintenance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: u64, minutes: i64) -> OrderUpdate {
        OrderUpdate {
            id: OrderUpdateId(id),
            order: OrderId(1),
            creator: UpdateCreator::System,
            time_created: Utc::now() + Duration::minutes(minutes),
            items_delta: None,
            new_status: None,
            new_owner: None,
            time_limit_delta: Duration::zero(),
            expiration_time_limit_delta: Duration::zero(),
            comment: String::new(),
            time_limit_notice: false,
            maintenance: false,
        }
    }

    #[test]
    fn status_transitions_are_monotone() {
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::Fulfilled));
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::Closed));
        assert!(OrderStatus::Fulfilled.can_transition_to(OrderStatus::Closed));

        assert!(!OrderStatus::Fulfilled.can_transition_to(OrderStatus::Open));
        assert!(!OrderStatus::Closed.can_transition_to(OrderStatus::Open));
        assert!(!OrderStatus::Closed.can_transition_to(OrderStatus::Fulfilled));
    }

    #[test]
    fn requirements_fold_merges_patches_in_order() {
        let mut first = update(1, 0);
        first.items_delta = Some(
            "n0:\n  type: rktest_yml\n  requirements:\n    platform: DYNAPOD\n".to_string(),
        );
        let mut second = update(2, 1);
        second.items_delta =
            Some("n1:\n  type: ip_address\nn0:\n  type: rktest_yml\n".to_string());

        let requirements = fold_requirements(&[first, second]).unwrap();
        assert_eq!(requirements.len(), 2);
        // The later patch replaced n0 wholesale.
        assert!(requirements["n0"].requirements.is_empty());
        assert_eq!(requirements["n1"].kind, "ip_address");
    }

    #[test]
    fn requirements_fold_rejects_bad_yaml() {
        let mut bad = update(1, 0);
        bad.items_delta = Some(": not yaml {".to_string());
        assert!(fold_requirements(&[bad]).is_err());
    }

    #[test]
    fn time_limits_fold_by_sum() {
        let mut first = update(1, 0);
        first.time_limit_delta = Duration::hours(2);
        first.expiration_time_limit_delta = Duration::days(1);
        let mut second = update(2, 1);
        second.time_limit_delta = Duration::hours(1);

        let updates = [first, second];
        assert_eq!(fold_time_limit(&updates), Duration::hours(3));
        assert_eq!(fold_expiration_time_limit(&updates), Duration::days(1));
    }

    #[test]
    fn ejection_time_requires_fulfillment() {
        let mut first = update(1, 0);
        first.time_limit_delta = Duration::hours(2);
        assert!(ejection_time(&[first.clone()]).is_none());

        let mut fulfilled = update(2, 5);
        fulfilled.new_status = Some(OrderStatus::Fulfilled);
        let updates = [first, fulfilled.clone()];
        assert_eq!(
            ejection_time(&updates),
            Some(fulfilled.time_created + Duration::hours(2))
        );
    }

    #[test]
    fn notice_accounting() {
        let base = update(1, 0);
        let mut notice_early = update(2, 1);
        notice_early.time_limit_notice = true;
        let mut notice_late = update(3, 10);
        notice_late.time_limit_notice = true;

        let updates = [base, notice_early.clone(), notice_late.clone()];
        assert_eq!(last_notice_time(&updates), Some(notice_late.time_created));
        assert_eq!(notices_since(&updates, notice_early.time_created), 2);
        assert_eq!(
            notices_since(&updates, notice_late.time_created + Duration::seconds(1)),
            0
        );
    }
}
