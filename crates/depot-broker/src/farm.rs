//! Farms: providers of elastic inventory.
//!
//! A farm is tied to one location and serves a set of elastic item kinds.
//! The provider SDK glue (launching an EC2 instance, cloning a vSphere VM)
//! lives behind [`Farm::provision`] and [`Farm::teardown`]; the stock farm
//! records here carry the provider configuration and the quota logic, and
//! record the inventory rows the glue's success callbacks would register.
//!
//! Grow failures are retried with exponential backoff up to a per-kind
//! budget, then surface as a terminal provisioning failure while the order
//! stays open. Destroy failures are retried without a budget since leaked
//! cloud resources cost money.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::catalog::Requirement;
use crate::error::{Error, Result};
use crate::item::{Item, ItemDraft};

/// Inventory pressure the fulfillment engine hands to quota checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrowContext {
    /// Non-destroyed items of the requested kind in the farm's location.
    pub active_items: usize,
    /// Grow tasks already in flight for this kind.
    pub pending_grows: usize,
}

/// A task to be published on the requester's behalf.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Registered task name.
    pub name: String,
    /// JSON arguments.
    pub args: Value,
}

/// A provider of elastic inventory for a location.
#[async_trait]
pub trait Farm: Send + Sync {
    /// Unique farm name, referenced from task arguments.
    fn name(&self) -> &str;

    /// The location this farm provisions into.
    fn location(&self) -> &str;

    /// The network new items land on.
    fn network(&self) -> &str;

    /// Whether this farm can provision items of the given kind.
    fn serves_kind(&self, kind: &str) -> bool;

    /// Whether elastic provisioning is possible right now (quota, region
    /// capacity).
    async fn can_grow(&self, requirement: &Requirement, context: &GrowContext) -> bool;

    /// Provisions one item satisfying the requirement, returning the
    /// inventory row to register. This is the provider-SDK seam.
    async fn provision(&self, requirement: &Requirement) -> Result<ItemDraft>;

    /// Tears one item down. This is the provider-SDK seam.
    async fn teardown(&self, item: &Item) -> Result<()>;
}

/// Exponential backoff with an optional attempt budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First-retry delay.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Total attempts allowed; `None` retries forever.
    pub budget: Option<u32>,
}

impl RetryPolicy {
    /// The stock policy for grow attempts: bounded, since the order can
    /// wait for the next cycle.
    #[must_use]
    pub const fn grow() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            budget: Some(5),
        }
    }

    /// The stock policy for destroy attempts: unbounded.
    #[must_use]
    pub const fn destroy() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            budget: None,
        }
    }

    /// The delay before the given 0-indexed retry attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        self.budget.is_none_or(|budget| attempts < budget)
    }
}

/// An AWS region farm provisioning EC2-backed kinds.
#[derive(Debug, Clone)]
pub struct AwsFarm {
    name: String,
    location: String,
    network: String,
    /// AWS region, recorded on provisioned items.
    pub region: String,
    /// Subnet new instances attach to.
    pub subnet_id: String,
    /// Security group new instances attach to.
    pub security_group_id: String,
    /// Quota on concurrently existing instances.
    pub max_instances: usize,
}

impl AwsFarm {
    /// Creates a farm for one region.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        network: impl Into<String>,
        region: impl Into<String>,
        subnet_id: impl Into<String>,
        security_group_id: impl Into<String>,
        max_instances: usize,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            network: network.into(),
            region: region.into(),
            subnet_id: subnet_id.into(),
            security_group_id: security_group_id.into(),
            max_instances,
        }
    }
}

#[async_trait]
impl Farm for AwsFarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn serves_kind(&self, kind: &str) -> bool {
        matches!(kind, "ec2_instance" | "ubuntu_machine")
    }

    async fn can_grow(&self, requirement: &Requirement, context: &GrowContext) -> bool {
        self.serves_kind(&requirement.kind)
            && context.active_items + context.pending_grows < self.max_instances
    }

    async fn provision(&self, requirement: &Requirement) -> Result<ItemDraft> {
        if !self.serves_kind(&requirement.kind) {
            return Err(Error::provisioning(format!(
                "farm {} does not serve kind {:?}",
                self.name, requirement.kind
            )));
        }
        let mut attributes: BTreeMap<String, Value> = requirement.requirements.clone();
        attributes.insert("region".to_string(), Value::from(self.region.clone()));
        attributes
            .entry("instance_type".to_string())
            .or_insert_with(|| Value::from("m4.large"));
        Ok(ItemDraft {
            kind: requirement.kind.clone(),
            location: self.location.clone(),
            network: self.network.clone(),
            attributes,
        })
    }

    async fn teardown(&self, _item: &Item) -> Result<()> {
        Ok(())
    }
}

/// A vCenter farm provisioning VM-backed kinds.
#[derive(Debug, Clone)]
pub struct VSphereFarm {
    name: String,
    location: String,
    network: String,
    /// vCenter endpoint host.
    pub endpoint: String,
    /// Datacenter new VMs land in.
    pub datacenter: String,
    /// Quota on concurrently existing VMs.
    pub max_vms: usize,
}

impl VSphereFarm {
    /// Creates a farm for one vCenter.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        network: impl Into<String>,
        endpoint: impl Into<String>,
        datacenter: impl Into<String>,
        max_vms: usize,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            network: network.into(),
            endpoint: endpoint.into(),
            datacenter: datacenter.into(),
            max_vms,
        }
    }
}

#[async_trait]
impl Farm for VSphereFarm {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn serves_kind(&self, kind: &str) -> bool {
        kind == "vsphere_vm"
    }

    async fn can_grow(&self, requirement: &Requirement, context: &GrowContext) -> bool {
        self.serves_kind(&requirement.kind)
            && context.active_items + context.pending_grows < self.max_vms
    }

    async fn provision(&self, requirement: &Requirement) -> Result<ItemDraft> {
        if !self.serves_kind(&requirement.kind) {
            return Err(Error::provisioning(format!(
                "farm {} does not serve kind {:?}",
                self.name, requirement.kind
            )));
        }
        let mut attributes: BTreeMap<String, Value> = requirement.requirements.clone();
        attributes.insert(
            "datacenter".to_string(),
            Value::from(self.datacenter.clone()),
        );
        Ok(ItemDraft {
            kind: requirement.kind.clone(),
            location: self.location.clone(),
            network: self.network.clone(),
            attributes,
        })
    }

    async fn teardown(&self, _item: &Item) -> Result<()> {
        Ok(())
    }
}

/// The farms available to the broker.
#[derive(Clone, Default)]
pub struct FarmRegistry {
    farms: Vec<Arc<dyn Farm>>,
}

impl FarmRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a farm.
    pub fn register(&mut self, farm: Arc<dyn Farm>) {
        self.farms.push(farm);
    }

    /// Looks up a farm by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Farm>> {
        self.farms.iter().find(|f| f.name() == name).cloned()
    }

    /// All farms serving the given kind, in registration order.
    #[must_use]
    pub fn serving_kind(&self, kind: &str) -> Vec<Arc<dyn Farm>> {
        self.farms
            .iter()
            .filter(|f| f.serves_kind(kind))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for FarmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmRegistry")
            .field(
                "farms",
                &self.farms.iter().map(|farm| farm.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Handler for grow tasks: provisions one item through the named farm.
///
/// Transient provisioning failures back off and retry within the task, up
/// to the policy budget; exhausting the budget is a terminal provisioning
/// failure and the requesting order stays open awaiting the next cycle.
pub struct GrowItemHandler {
    farms: FarmRegistry,
    policy: RetryPolicy,
}

impl GrowItemHandler {
    /// Creates a handler with the stock grow retry policy.
    #[must_use]
    pub fn new(farms: FarmRegistry) -> Self {
        Self {
            farms,
            policy: RetryPolicy::grow(),
        }
    }

    /// Overrides the retry policy. Mostly useful in tests.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl crate::tasks::registry::TaskHandler for GrowItemHandler {
    async fn run(&self, ctx: crate::tasks::registry::TaskContext) -> Result<()> {
        let farm_name = ctx
            .arg_str("farm")
            .ok_or_else(|| Error::provisioning("grow task missing farm argument"))?;
        let requirement: Requirement = serde_json::from_value(
            ctx.args()
                .get("requirement")
                .cloned()
                .unwrap_or(Value::Null),
        )
        .map_err(|e| Error::serialization(format!("grow task requirement: {e}")))?;
        let farm = self
            .farms
            .by_name(farm_name)
            .ok_or_else(|| Error::provisioning(format!("unknown farm {farm_name:?}")))?;

        let mut attempts = 0u32;
        loop {
            if ctx.is_revoked().await? {
                return Ok(());
            }
            match farm.provision(&requirement).await {
                Ok(draft) => {
                    // Revocation must not register inventory.
                    if ctx.is_revoked().await? {
                        return Ok(());
                    }
                    let item = ctx.store.insert_item(draft).await?;
                    tracing::info!(
                        item = %item.sid,
                        kind = %item.kind,
                        farm = farm.name(),
                        "grew item"
                    );
                    return Ok(());
                }
                Err(error) => {
                    attempts += 1;
                    if !self.policy.allows(attempts) {
                        return Err(Error::provisioning(format!(
                            "giving up after {attempts} attempts: {error}"
                        )));
                    }
                    tracing::warn!(farm = farm.name(), %error, attempts, "grow attempt failed");
                    tokio::time::sleep(self.policy.delay(attempts - 1)).await;
                }
            }
        }
    }
}

/// Handler for destroy tasks: tears one item down and marks it DESTROYED.
///
/// The handler holds the item while it works so nothing else can select
/// it. Failures within one run back off and retry a bounded number of
/// times; the terminal failure releases the item, and the sweeper
/// re-enqueues destruction on a later pass, so destroy is effectively
/// retried forever.
pub struct DestroyItemHandler {
    farms: FarmRegistry,
    policy: RetryPolicy,
    attempts_per_run: u32,
}

impl DestroyItemHandler {
    /// Creates a handler with the stock destroy retry policy.
    #[must_use]
    pub fn new(farms: FarmRegistry) -> Self {
        Self {
            farms,
            policy: RetryPolicy::destroy(),
            attempts_per_run: 5,
        }
    }
}

#[async_trait]
impl crate::tasks::registry::TaskHandler for DestroyItemHandler {
    async fn run(&self, ctx: crate::tasks::registry::TaskContext) -> Result<()> {
        let Some(item_sid) = ctx.arg_str("item_sid") else {
            return Err(Error::provisioning("destroy task missing item_sid"));
        };
        let Some(item) = ctx.store.find_item_by_sid(item_sid).await? else {
            return Ok(());
        };
        if item.state == crate::item::ItemState::Destroyed {
            return Ok(());
        }

        // Take the item; if something grabbed it first, leave it alone.
        let holder = crate::item::HeldBy::Task(ctx.record.row_id);
        let claimed = ctx
            .store
            .cas_item_holder(item.id, &crate::item::HeldBy::Nobody, holder)
            .await?;
        if !claimed.is_success() {
            tracing::debug!(item = %item.sid, "item taken before destroy; skipping");
            return Ok(());
        }

        let farm = self
            .farms
            .serving_kind(&item.kind)
            .into_iter()
            .find(|farm| farm.location() == item.location);

        let mut attempts = 0u32;
        loop {
            if ctx.is_revoked().await? {
                let _ = ctx
                    .store
                    .cas_item_holder(item.id, &holder, crate::item::HeldBy::Nobody)
                    .await;
                return Ok(());
            }
            let torn_down = match &farm {
                Some(farm) => farm.teardown(&item).await,
                // No farm serves this kind here; nothing physical to tear down.
                None => Ok(()),
            };
            match torn_down {
                Ok(()) => {
                    ctx.store
                        .set_item_state(item.id, crate::item::ItemState::Destroyed)
                        .await?;
                    let _ = ctx
                        .store
                        .cas_item_holder(item.id, &holder, crate::item::HeldBy::Nobody)
                        .await;
                    tracing::info!(item = %item.sid, kind = %item.kind, "destroyed item");
                    return Ok(());
                }
                Err(error) => {
                    attempts += 1;
                    if attempts >= self.attempts_per_run {
                        let _ = ctx
                            .store
                            .cas_item_holder(item.id, &holder, crate::item::HeldBy::Nobody)
                            .await;
                        return Err(Error::provisioning(format!(
                            "teardown failed after {attempts} attempts, will retry later: {error}"
                        )));
                    }
                    tracing::warn!(item = %item.sid, %error, attempts, "teardown attempt failed");
                    tokio::time::sleep(self.policy.delay(attempts - 1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aws_farm(max_instances: usize) -> AwsFarm {
        AwsFarm::new(
            "aws-us-west-1",
            "AWS-US-WEST-1",
            "default",
            "us-west-1",
            "subnet-1234",
            "sg-5678",
            max_instances,
        )
    }

    #[tokio::test]
    async fn aws_farm_grows_within_quota() {
        let farm = aws_farm(2);
        let requirement = Requirement::new("ec2_instance");

        let roomy = GrowContext {
            active_items: 1,
            pending_grows: 0,
        };
        assert!(farm.can_grow(&requirement, &roomy).await);

        let full = GrowContext {
            active_items: 1,
            pending_grows: 1,
        };
        assert!(!farm.can_grow(&requirement, &full).await);
    }

    #[tokio::test]
    async fn aws_farm_rejects_foreign_kinds() {
        let farm = aws_farm(10);
        let requirement = Requirement::new("rktest_yml");
        assert!(!farm.can_grow(&requirement, &GrowContext::default()).await);
        assert!(farm.provision(&requirement).await.is_err());
    }

    #[tokio::test]
    async fn provision_stamps_provider_attributes() {
        let farm = aws_farm(10);
        let requirement = Requirement::new("ec2_instance").with("ami_id", "ami-42");
        let draft = farm.provision(&requirement).await.unwrap();

        assert_eq!(draft.kind, "ec2_instance");
        assert_eq!(draft.location, "AWS-US-WEST-1");
        assert_eq!(draft.attributes["ami_id"], "ami-42");
        assert_eq!(draft.attributes["region"], "us-west-1");
        assert!(draft.attributes.contains_key("instance_type"));
    }

    #[test]
    fn retry_policy_backs_off_exponentially_with_cap() {
        let policy = RetryPolicy::grow();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(60));

        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn destroy_policy_retries_forever() {
        let policy = RetryPolicy::destroy();
        assert!(policy.allows(0));
        assert!(policy.allows(10_000));
    }

    #[test]
    fn registry_finds_farms_by_kind() {
        let mut registry = FarmRegistry::new();
        registry.register(Arc::new(aws_farm(10)));
        registry.register(Arc::new(VSphereFarm::new(
            "vc-colo", "COLO", "native", "vc.example", "dc1", 10,
        )));

        assert_eq!(registry.serving_kind("ec2_instance").len(), 1);
        assert_eq!(registry.serving_kind("vsphere_vm").len(), 1);
        assert!(registry.serving_kind("rktest_yml").is_empty());
        assert!(registry.by_name("vc-colo").is_some());
    }
}
