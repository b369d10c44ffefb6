//! Item records and their state machine.
//!
//! An item is any reservable unit of lab inventory: a test pod, a physical
//! cluster node, a cloud VM, an IP address. All kinds share one common
//! record with a kind discriminator and a per-kind attribute map; the
//! polymorphic behavior lives behind the capability trait in
//! [`crate::catalog`], not behind inheritance.
//!
//! The purpose of tracking who holds an item is to cooperatively ensure the
//! holder has exclusive control. This is similar to a lock, but there is no
//! queueing: a potential holder that finds the item taken looks for other
//! items instead. If something believes it holds an item and the record
//! says otherwise, it must abort.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::{ItemId, OrderId, TaskRowId};

/// A named administrative zone (e.g. `"COLO"`, `"AWS-US-WEST-1"`).
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Unique location name.
    pub name: String,
}

/// A network within one location. Items belong to exactly one
/// (location, network) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// The owning location's name.
    pub location: String,
    /// Network name, unique within the location.
    pub name: String,
}

/// Item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    /// The item exists and can fulfill orders.
    Active,
    /// The item needs attention and only fulfills maintenance orders.
    Maintenance,
    /// The item was removed from the underlying infrastructure. The record
    /// is kept for auditing; this state is terminal.
    Destroyed,
}

impl ItemState {
    /// Returns true if this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Returns true if the transition from self to target is valid.
    ///
    /// Active and Maintenance flip back and forth; any non-destroyed state
    /// may transition to Destroyed; Destroyed is terminal.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Active => matches!(target, Self::Maintenance | Self::Destroyed),
            Self::Maintenance => matches!(target, Self::Active | Self::Destroyed),
            Self::Destroyed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Maintenance => "maintenance",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Maintenance => write!(f, "MAINTENANCE"),
            Self::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// The current exclusive holder of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeldBy {
    /// The item is free.
    Nobody,
    /// Assigned to an order it is fulfilling.
    Order(OrderId),
    /// Exclusively held by a task operating on it (grow, destroy, recover).
    Task(TaskRowId),
}

impl HeldBy {
    /// Returns true if the item is free.
    #[must_use]
    pub const fn is_nobody(&self) -> bool {
        matches!(self, Self::Nobody)
    }
}

impl fmt::Display for HeldBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nobody => write!(f, "nobody"),
            Self::Order(id) => write!(f, "order {id}"),
            Self::Task(id) => write!(f, "task {id}"),
        }
    }
}

/// One reservable unit of inventory.
///
/// Invariant: a non-destroyed item is either free, assigned to exactly one
/// order, or exclusively held by exactly one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Auto-increment row id.
    pub id: ItemId,
    /// Externally-visible identifier.
    pub sid: String,
    /// Kind discriminator (e.g. `"rktest_yml"`, `"ec2_instance"`).
    pub kind: String,
    /// Administrative zone.
    pub location: String,
    /// Network within the location.
    pub network: String,
    /// Lifecycle state.
    pub state: ItemState,
    /// Current exclusive holder.
    pub held_by: HeldBy,
    /// When the holder last changed.
    pub time_held_by_updated: DateTime<Utc>,
    /// Per-kind declared attributes, matched against requirements.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Item {
    /// Returns true if the item is free to fulfill an order.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.state == ItemState::Active && self.held_by.is_nobody()
    }

    /// Replaces the holder, stamping the update time.
    pub fn set_holder(&mut self, holder: HeldBy, now: DateTime<Utc>) {
        self.held_by = holder;
        self.time_held_by_updated = now;
    }

    /// Transitions to a new lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is
    /// invalid.
    pub fn transition_state(&mut self, target: ItemState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("item {}", self.sid),
            });
        }
        self.state = target;
        Ok(())
    }
}

/// Fields for inserting a new item; the store assigns id and SID.
#[derive(Debug, Clone)]
pub struct ItemDraft {
    /// Kind discriminator.
    pub kind: String,
    /// Administrative zone.
    pub location: String,
    /// Network within the location.
    pub network: String,
    /// Declared attributes.
    pub attributes: BTreeMap<String, Value>,
}

impl ItemDraft {
    /// Creates a draft with no attributes.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        location: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
            network: network.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds one declared attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> Item {
        Item {
            id: ItemId(1),
            sid: "aaaaaa-bbbbbbb".to_string(),
            kind: "rktest_yml".to_string(),
            location: "COLO".to_string(),
            network: "native".to_string(),
            state: ItemState::Active,
            held_by: HeldBy::Nobody,
            time_held_by_updated: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn state_machine_allows_maintenance_flip() {
        assert!(ItemState::Active.can_transition_to(ItemState::Maintenance));
        assert!(ItemState::Maintenance.can_transition_to(ItemState::Active));
    }

    #[test]
    fn destroyed_is_terminal() {
        assert!(ItemState::Active.can_transition_to(ItemState::Destroyed));
        assert!(ItemState::Maintenance.can_transition_to(ItemState::Destroyed));
        assert!(!ItemState::Destroyed.can_transition_to(ItemState::Active));
        assert!(!ItemState::Destroyed.can_transition_to(ItemState::Maintenance));
    }

    #[test]
    fn invalid_transition_fails() {
        let mut item = item();
        item.state = ItemState::Destroyed;
        assert!(item.transition_state(ItemState::Active).is_err());
    }

    #[test]
    fn set_holder_stamps_time() {
        let mut item = item();
        let before = item.time_held_by_updated;
        let later = before + chrono::Duration::seconds(10);
        item.set_holder(HeldBy::Order(OrderId(7)), later);
        assert_eq!(item.held_by, HeldBy::Order(OrderId(7)));
        assert_eq!(item.time_held_by_updated, later);
        assert!(!item.is_free());
    }

    #[test]
    fn free_requires_active_and_unheld() {
        let mut item = item();
        assert!(item.is_free());
        item.state = ItemState::Maintenance;
        assert!(!item.is_free());
    }
}
