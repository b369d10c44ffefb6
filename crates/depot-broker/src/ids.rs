//! Strongly-typed row identifiers and the SID registry.
//!
//! Every entity row carries an auto-increment integer id assigned by the
//! store. The integer id is authoritative for ordering (task line position,
//! update folds) and never leaves the process; externally-visible addressing
//! always goes through the SID codec in [`depot_core::sid`].

use std::fmt;

use serde::{Deserialize, Serialize};

use depot_core::SidCodec;

use crate::error::{Error, Result};

macro_rules! row_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw integer value.
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

row_id!(
    /// Row id of an [`crate::item::Item`].
    ItemId
);
row_id!(
    /// Row id of an [`crate::order::Order`].
    OrderId
);
row_id!(
    /// Row id of an [`crate::order::OrderUpdate`].
    OrderUpdateId
);
row_id!(
    /// Row id of a [`crate::tab::Tab`].
    TabId
);
row_id!(
    /// Row id of a [`crate::user::User`].
    UserId
);
row_id!(
    /// Row id of a [`crate::tasks::TaskRecord`].
    ///
    /// This is the line-ordering key for synchronized task admission: among
    /// competing tasks the smallest row id goes first. Publish timestamps
    /// are never used for ordering since clock drift between publishers
    /// would let a task jump the queue.
    TaskRowId
);

/// SID codecs for every externally-addressable entity kind.
///
/// One codec per entity label so equal integer ids of different kinds yield
/// unrelated SIDs.
#[derive(Debug, Clone)]
pub struct SidRegistry {
    items: SidCodec,
    orders: SidCodec,
    tabs: SidCodec,
    users: SidCodec,
    tasks: SidCodec,
}

impl SidRegistry {
    /// Creates the registry from the deployment secret.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            items: SidCodec::new(secret, "depot.Item"),
            orders: SidCodec::new(secret, "depot.Order"),
            tabs: SidCodec::new(secret, "depot.Tab"),
            users: SidCodec::new(secret, "depot.User"),
            tasks: SidCodec::new(secret, "depot.Task"),
        }
    }

    /// Encodes an item id.
    #[must_use]
    pub fn item_sid(&self, id: ItemId) -> String {
        self.items.encode(id.value())
    }

    /// Encodes an order id.
    #[must_use]
    pub fn order_sid(&self, id: OrderId) -> String {
        self.orders.encode(id.value())
    }

    /// Encodes a tab id.
    #[must_use]
    pub fn tab_sid(&self, id: TabId) -> String {
        self.tabs.encode(id.value())
    }

    /// Encodes a user id.
    #[must_use]
    pub fn user_sid(&self, id: UserId) -> String {
        self.users.encode(id.value())
    }

    /// Encodes a task row id.
    #[must_use]
    pub fn task_sid(&self, id: TaskRowId) -> String {
        self.tasks.encode(id.value())
    }

    /// Resolves an item SID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the text is not a decodable SID.
    pub fn parse_item_sid(&self, sid: &str) -> Result<ItemId> {
        self.items
            .decode(sid)
            .map(ItemId)
            .map_err(|_| Error::not_found("item", sid))
    }

    /// Resolves an order SID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the text is not a decodable SID.
    pub fn parse_order_sid(&self, sid: &str) -> Result<OrderId> {
        self.orders
            .decode(sid)
            .map(OrderId)
            .map_err(|_| Error::not_found("order", sid))
    }

    /// Resolves a task SID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the text is not a decodable SID.
    pub fn parse_task_sid(&self, sid: &str) -> Result<TaskRowId> {
        self.tasks
            .decode(sid)
            .map(TaskRowId)
            .map_err(|_| Error::not_found("task", sid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_registry_roundtrips_per_entity() {
        let registry = SidRegistry::new(b"test-secret");
        let item_sid = registry.item_sid(ItemId(41));
        let order_sid = registry.order_sid(OrderId(41));

        assert_ne!(item_sid, order_sid);
        assert_eq!(registry.parse_item_sid(&item_sid).unwrap(), ItemId(41));
        assert_eq!(registry.parse_order_sid(&order_sid).unwrap(), OrderId(41));
    }

    #[test]
    fn parse_rejects_garbage_as_not_found() {
        let registry = SidRegistry::new(b"test-secret");
        let err = registry.parse_order_sid("not-a-sid").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn row_ids_order_by_value() {
        assert!(TaskRowId(100) < TaskRowId(101));
    }
}
