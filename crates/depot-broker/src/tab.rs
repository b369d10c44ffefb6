//! Per-owner credit accounting.
//!
//! Each user has one tab with a float limit. Open and fulfilled orders
//! consume credit equal to the summed price of the items they hold; an
//! order is admitted only if its cost fits in the remaining credit.
//! Maintenance orders bypass the ledger entirely.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::KindRegistry;
use crate::error::{Error, Result};
use crate::ids::{TabId, UserId};
use crate::item::HeldBy;
use crate::order::OrderStatus;
use crate::store::BrokerStore;

/// Default credit limit for a newly created tab.
pub const DEFAULT_LIMIT: f64 = 1.0;

/// A user's credit tab. The limit is relative to other tabs' limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    /// Auto-increment row id.
    pub id: TabId,
    /// Externally-visible identifier.
    pub sid: String,
    /// The owning user.
    pub owner: UserId,
    /// Credit limit.
    pub limit: f64,
}

/// Computes consumed credit and admits placements against tab limits.
#[derive(Clone)]
pub struct TabLedger {
    store: Arc<dyn BrokerStore>,
    catalog: Arc<KindRegistry>,
}

impl TabLedger {
    /// Creates a ledger over the given store and catalog.
    #[must_use]
    pub fn new(store: Arc<dyn BrokerStore>, catalog: Arc<KindRegistry>) -> Self {
        Self { store, catalog }
    }

    /// Credit currently consumed by an owner: the summed price of items
    /// held by the owner's non-closed orders.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn consumed(&self, owner: UserId) -> Result<f64> {
        let mut total = 0.0;
        for order in self.store.orders_of_owner(owner).await? {
            if order.status == OrderStatus::Closed || order.maintenance {
                continue;
            }
            for item in self.store.items_held_by(HeldBy::Order(order.id)).await? {
                // Items of unpriced kinds cost nothing rather than failing
                // the whole ledger.
                total += self.catalog.price_of(&item.kind).unwrap_or(0.0);
            }
        }
        Ok(total)
    }

    /// Admits a placement of the given cost against the owner's tab.
    ///
    /// Placement at exactly the limit succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] if the owner has no tab or the
    /// cost exceeds the remaining credit.
    pub async fn admit(&self, owner: UserId, cost: f64) -> Result<()> {
        let tab = self
            .store
            .tab_for_owner(owner)
            .await?
            .ok_or_else(|| Error::admission_denied(format!("user {owner} has no tab")))?;

        let consumed = self.consumed(owner).await?;
        let remaining = tab.limit - consumed;
        if cost > remaining {
            return Err(Error::admission_denied(format!(
                "tab: cost {cost:.2} exceeds remaining credit {remaining:.2} \
                 (limit {:.2}, consumed {consumed:.2})",
                tab.limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{default_catalog, CatalogConfig, Requirement};
    use crate::item::ItemDraft;
    use crate::order::{OrderStatus, UpdateCreator};
    use crate::store::{MemoryStore, OrderDraft};
    use std::collections::BTreeMap;

    async fn ledger_with_setup() -> (TabLedger, Arc<MemoryStore>, UserId) {
        let store = Arc::new(MemoryStore::new(b"test-secret"));
        let catalog = Arc::new(default_catalog(&CatalogConfig::default()));
        store.register_location("COLO").await.unwrap();
        store.register_network("COLO", "native").await.unwrap();
        let user = store.insert_user("alice", "token").await.unwrap();
        store.insert_tab(user.id, 1.0).await.unwrap();
        let ledger = TabLedger::new(store.clone(), catalog);
        (ledger, store, user.id)
    }

    async fn fulfilled_order_holding_pod(store: &Arc<MemoryStore>, owner: UserId) {
        let tab = store.tab_for_owner(owner).await.unwrap().unwrap();
        let item = store
            .insert_item(
                ItemDraft::new("rktest_yml", "COLO", "native").with_attribute("platform", "DYNAPOD"),
            )
            .await
            .unwrap();
        let mut requirements = BTreeMap::new();
        requirements.insert(
            "n0".to_string(),
            Requirement::new("rktest_yml").with("platform", "DYNAPOD"),
        );
        let (order, _) = store
            .create_order(OrderDraft {
                owner,
                tab: tab.id,
                maintenance: false,
                requirements: serde_yaml::to_string(&requirements).unwrap(),
                time_limit: chrono::Duration::hours(2),
                expiration_time_limit: chrono::Duration::days(1),
                creator: UpdateCreator::User(owner),
            })
            .await
            .unwrap();
        let mut assignments = BTreeMap::new();
        assignments.insert("n0".to_string(), item.id);
        let result = store
            .fulfill_order(order.id, &assignments, UpdateCreator::System, "fulfilled")
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(
            store.get_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Fulfilled
        );
    }

    #[tokio::test]
    async fn consumed_is_zero_without_held_items() {
        let (ledger, _store, owner) = ledger_with_setup().await;
        assert!(ledger.consumed(owner).await.unwrap().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn consumed_sums_held_item_prices() {
        let (ledger, store, owner) = ledger_with_setup().await;
        fulfilled_order_holding_pod(&store, owner).await;
        let consumed = ledger.consumed(owner).await.unwrap();
        assert!((consumed - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn admission_at_exact_limit_succeeds() {
        let (ledger, _store, owner) = ledger_with_setup().await;
        ledger.admit(owner, 1.0).await.unwrap();
    }

    #[tokio::test]
    async fn admission_over_limit_fails() {
        let (ledger, store, owner) = ledger_with_setup().await;
        fulfilled_order_holding_pod(&store, owner).await;

        // 0.25 consumed, 0.75 remaining: 0.75 fits, 0.76 does not.
        ledger.admit(owner, 0.75).await.unwrap();
        let err = ledger.admit(owner, 0.76).await.unwrap_err();
        assert!(matches!(err, Error::AdmissionDenied { .. }));
        assert!(err.to_string().contains("tab"));
    }

    #[tokio::test]
    async fn missing_tab_is_admission_denied() {
        let store = Arc::new(MemoryStore::new(b"test-secret"));
        let catalog = Arc::new(default_catalog(&CatalogConfig::default()));
        let user = store.insert_user("bob", "token").await.unwrap();
        let ledger = TabLedger::new(store, catalog);
        assert!(ledger.admit(user.id, 0.1).await.is_err());
    }
}
