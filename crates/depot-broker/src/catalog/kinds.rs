//! The concrete item kinds served by a stock deployment.
//!
//! Each kind is one [`CatalogKind`] record: a tag, a price, elasticity, and
//! an idle shelf life. Prices are deployment configuration, not a table in
//! code; [`CatalogConfig`] carries the defaults and any overrides.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;

use super::{ItemKind, KindRegistry};

/// Deployment configuration for the default catalog: price and shelf-life
/// overrides keyed by kind tag.
#[derive(Debug, Clone, Default)]
pub struct CatalogConfig {
    /// Price overrides, keyed by kind tag.
    pub prices: BTreeMap<String, f64>,
    /// Shelf-life overrides for elastic kinds, keyed by kind tag.
    pub shelf_lives: BTreeMap<String, Duration>,
}

impl CatalogConfig {
    /// Sets a price override for one kind.
    #[must_use]
    pub fn with_price(mut self, tag: impl Into<String>, price: f64) -> Self {
        self.prices.insert(tag.into(), price);
        self
    }

    /// Sets a shelf-life override for one kind.
    #[must_use]
    pub fn with_shelf_life(mut self, tag: impl Into<String>, shelf_life: Duration) -> Self {
        self.shelf_lives.insert(tag.into(), shelf_life);
        self
    }
}

/// A catalog kind described by plain data.
#[derive(Debug, Clone)]
pub struct CatalogKind {
    tag: String,
    price: f64,
    elastic: bool,
    shelf_life: Option<Duration>,
}

impl CatalogKind {
    /// Creates a static (non-elastic, unperishable) kind.
    #[must_use]
    pub fn fixed(tag: impl Into<String>, price: f64) -> Self {
        Self {
            tag: tag.into(),
            price,
            elastic: false,
            shelf_life: None,
        }
    }

    /// Creates an elastic kind with an idle shelf life.
    #[must_use]
    pub fn elastic(tag: impl Into<String>, price: f64, shelf_life: Duration) -> Self {
        Self {
            tag: tag.into(),
            price,
            elastic: true,
            shelf_life: Some(shelf_life),
        }
    }
}

impl ItemKind for CatalogKind {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn is_elastic(&self) -> bool {
        self.elastic
    }

    fn shelf_life(&self) -> Option<Duration> {
        self.shelf_life
    }
}

/// Builds the registry of stock kinds, applying configuration overrides.
///
/// Default prices are relative to the default tab limit of 1.0; cloud-backed
/// kinds perish after a few idle hours because leaked instances cost money,
/// while physical inventory is unperishable.
#[must_use]
pub fn default_catalog(config: &CatalogConfig) -> KindRegistry {
    let stock: Vec<CatalogKind> = vec![
        CatalogKind::fixed("rktest_yml", 0.25),
        CatalogKind::fixed("cdm_cluster", 0.5),
        CatalogKind::fixed("cdm_node", 0.25),
        CatalogKind::fixed("brik_node", 0.25),
        CatalogKind::fixed("esx_host", 0.25),
        CatalogKind::fixed("ip_address", 0.01),
        CatalogKind::fixed("mssql_server", 0.25),
        CatalogKind::elastic("ec2_instance", 0.1, Duration::hours(4)),
        CatalogKind::elastic("vsphere_vm", 0.1, Duration::hours(4)),
        CatalogKind::elastic("ubuntu_machine", 0.1, Duration::hours(8)),
    ];

    let mut registry = KindRegistry::new();
    for mut kind in stock {
        if let Some(price) = config.prices.get(&kind.tag) {
            kind.price = *price;
        }
        if let Some(shelf_life) = config.shelf_lives.get(&kind.tag) {
            kind.shelf_life = Some(*shelf_life);
        }
        registry.register(Arc::new(kind));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_registers_stock_kinds() {
        let registry = default_catalog(&CatalogConfig::default());
        for tag in [
            "rktest_yml",
            "cdm_cluster",
            "ec2_instance",
            "vsphere_vm",
            "ip_address",
        ] {
            assert!(registry.contains(tag), "missing {tag}");
        }
    }

    #[test]
    fn rktest_yml_price_is_a_quarter_tab() {
        let registry = default_catalog(&CatalogConfig::default());
        assert!((registry.price_of("rktest_yml").unwrap() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn cloud_kinds_are_elastic_and_perishable() {
        let registry = default_catalog(&CatalogConfig::default());
        let ec2 = registry.get("ec2_instance").unwrap();
        assert!(ec2.is_elastic());
        assert!(ec2.shelf_life().is_some());

        let pod = registry.get("rktest_yml").unwrap();
        assert!(!pod.is_elastic());
        assert!(pod.shelf_life().is_none());
    }

    #[test]
    fn config_overrides_apply() {
        let config = CatalogConfig::default()
            .with_price("rktest_yml", 0.5)
            .with_shelf_life("ec2_instance", Duration::minutes(30));
        let registry = default_catalog(&config);

        assert!((registry.price_of("rktest_yml").unwrap() - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            registry.get("ec2_instance").unwrap().shelf_life(),
            Some(Duration::minutes(30))
        );
    }
}
