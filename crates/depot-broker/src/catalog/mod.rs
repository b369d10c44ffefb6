//! The item registry: a polymorphic catalog of item kinds.
//!
//! Every kind exposes one uniform capability surface (matching, pricing,
//! elasticity, health) and registers itself in a [`KindRegistry`] populated
//! at startup. The fulfillment engine and sweeper are polymorphic over this
//! trait and never hard-code kinds.

pub mod kinds;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::item::Item;

pub use kinds::{default_catalog, CatalogConfig};

/// One nickname's requirement within an order: a kind tag plus the
/// attributes the assigned item must declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// The item kind tag this slot must be fulfilled with.
    #[serde(rename = "type")]
    pub kind: String,
    /// Required attributes; matching is subset match over the item's
    /// declared attributes.
    #[serde(default)]
    pub requirements: BTreeMap<String, Value>,
}

impl Requirement {
    /// Creates a requirement with no attribute constraints.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            requirements: BTreeMap::new(),
        }
    }

    /// Adds one required attribute.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }
}

/// An order's full requirements: nickname to requirement.
pub type RequirementsMap = BTreeMap<String, Requirement>;

/// The uniform capability surface every item kind implements.
pub trait ItemKind: Send + Sync {
    /// The kind tag (e.g. `"rktest_yml"`).
    fn tag(&self) -> &str;

    /// Cost against the owner's tab while an item of this kind is held.
    fn price(&self) -> f64;

    /// Whether inventory of this kind can be provisioned on demand by a
    /// farm.
    fn is_elastic(&self) -> bool;

    /// How long a free item of this kind may sit idle before the sweeper
    /// destroys it. `None` means unperishable.
    fn shelf_life(&self) -> Option<Duration>;

    /// Does this item satisfy the requirement?
    ///
    /// Matching is equality on the kind tag plus subset match over the
    /// item's declared attributes.
    fn matches(&self, item: &Item, requirement: &Requirement) -> bool {
        item.kind == requirement.kind
            && self.tag() == requirement.kind
            && requirement
                .requirements
                .iter()
                .all(|(key, want)| item.attributes.get(key) == Some(want))
    }

    /// Soft health probe used by the sweeper to decide whether to recover
    /// an item or quarantine it.
    ///
    /// The default consults the recorded `health` attribute; probes that
    /// reach the physical item live behind the provider glue.
    fn is_healthy(&self, item: &Item) -> bool {
        item.attributes.get("health").map_or(true, |v| v != "failed")
    }
}

/// Registry of item kinds keyed by tag, populated at startup.
#[derive(Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, Arc<dyn ItemKind>>,
}

impl KindRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind. Later registrations replace earlier ones with the
    /// same tag.
    pub fn register(&mut self, kind: Arc<dyn ItemKind>) {
        self.kinds.insert(kind.tag().to_string(), kind);
    }

    /// Looks up a kind by tag.
    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&Arc<dyn ItemKind>> {
        self.kinds.get(tag)
    }

    /// Returns true if a kind with this tag is registered.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.kinds.contains_key(tag)
    }

    /// Returns all registered tags in sorted order.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    /// Price of one item of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] for an unknown kind.
    pub fn price_of(&self, tag: &str) -> Result<f64> {
        self.get(tag)
            .map(|kind| kind.price())
            .ok_or_else(|| Error::admission_denied(format!("unknown item kind {tag:?}")))
    }

    /// Total price of an order's requirements, one item per nickname.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdmissionDenied`] if any nickname names an unknown
    /// kind.
    pub fn order_price(&self, requirements: &RequirementsMap) -> Result<f64> {
        requirements
            .values()
            .map(|requirement| self.price_of(&requirement.kind))
            .sum()
    }

    /// Does the item satisfy the requirement, per its kind's matcher?
    ///
    /// Items of unregistered kinds never match.
    #[must_use]
    pub fn matches(&self, item: &Item, requirement: &Requirement) -> bool {
        self.get(&item.kind)
            .is_some_and(|kind| kind.matches(item, requirement))
    }
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
