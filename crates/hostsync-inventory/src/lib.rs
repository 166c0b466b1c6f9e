//! Inventory service contract plus REST and fixture-backed implementations.

use async_trait::async_trait;
use hostsync_core::{
    normalize_hypervisor_name, EntityId, Entitlement, EntitlementQuantity, FactMap, Host,
    HostPage, InstalledProduct, Organization,
};
use hostsync_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod rest;

pub use memory::{InventoryCall, InventoryFixture, MemoryInventory};
pub use rest::RestInventory;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("unexpected {what} payload: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl InventoryError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn decode(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Decode { what, source }
    }
}

pub type InventoryResult<T> = Result<T, InventoryError>;

/// Attributes for registering a new content host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCreate {
    pub organization_id: EntityId,
    pub name: String,
    pub facts: FactMap,
    pub lifecycle_environment_id: Option<EntityId>,
    pub content_view_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_products: Option<Vec<InstalledProduct>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_level: Option<String>,
}

/// Partial host update; unset facets and fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_facet_attributes: Option<ContentFacetUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_facet_attributes: Option<SubscriptionFacetUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFacetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_environment_id: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_view_id: Option<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFacetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_products: Option<Vec<InstalledProduct>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoheal: Option<bool>,
    /// Full guest list (`organization/name`) for a hypervisor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypervisor_guest_uuids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementScope {
    /// Entitlements currently attached to a host.
    Host(EntityId),
    /// Pools available in an organization.
    Organization(EntityId),
}

/// Entitlement search criteria. Unset fields do not constrain the search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementQuery {
    /// Restrict organization pools to those attachable to this host.
    pub host_id: Option<EntityId>,
    pub sku: Option<String>,
    pub name: Option<String>,
    /// Type label as exported (`Red Hat`, `Custom Guest`, ...).
    pub kind: Option<String>,
    pub account: Option<String>,
    pub contract: Option<String>,
    /// Minimum quantity that must still be available.
    pub quantity: Option<u64>,
    pub hypervisor: Option<String>,
    pub sla: Option<String>,
}

impl EntitlementQuery {
    /// Server-side search expression for the criteria the remote can filter on.
    pub fn search_expression(&self) -> Option<String> {
        let terms = [
            ("product_id", &self.sku),
            ("name", &self.name),
            ("contract_number", &self.contract),
            ("account_number", &self.account),
        ]
        .into_iter()
        .filter_map(|(field, value)| {
            value
                .as_deref()
                .map(|v| format!("{field} = \"{}\"", v.replace('"', "\\\"")))
        })
        .collect::<Vec<_>>();
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(" and "))
        }
    }

    /// Local evaluation of every criterion; results keep their remote order.
    pub fn accepts(&self, entitlement: &Entitlement) -> bool {
        fn same(want: &Option<String>, have: Option<&str>) -> bool {
            want.as_deref().map_or(true, |w| have == Some(w))
        }

        let name_ok = self.name.as_deref().map_or(true, |want| {
            entitlement.product_name.as_deref() == Some(want)
                || entitlement.name.as_deref() == Some(want)
        });
        let kind_ok = self
            .kind
            .as_deref()
            .map_or(true, |want| entitlement.type_label() == want);
        let quantity_ok = match (self.quantity, entitlement.available) {
            (Some(want), Some(available)) if want > 0 && available >= 0 => {
                available as u64 >= want
            }
            _ => true,
        };
        let hypervisor_ok = self.hypervisor.as_deref().map_or(true, |want| {
            entitlement
                .owning_host_name()
                .map(normalize_hypervisor_name)
                == Some(want)
        });
        let sla_ok = self.sla.as_deref().map_or(true, |want| {
            entitlement
                .support_level
                .as_deref()
                .is_some_and(|have| have.eq_ignore_ascii_case(want))
        });

        same(&self.sku, entitlement.product_id.as_deref())
            && name_ok
            && kind_ok
            && same(&self.account, entitlement.account_number.as_deref())
            && same(&self.contract, entitlement.contract_number.as_deref())
            && quantity_ok
            && hypervisor_ok
            && sla_ok
    }
}

/// The remote inventory/entitlement service the engine reconciles against.
#[async_trait]
pub trait InventoryService: Send + Sync {
    async fn list_organizations(&self) -> InventoryResult<Vec<Organization>>;

    async fn list_hosts(
        &self,
        organization_id: EntityId,
        search: Option<&str>,
        page: u64,
        per_page: u64,
    ) -> InventoryResult<HostPage>;

    /// Full host detail, including the reported fact tree.
    async fn get_host(&self, id: EntityId) -> InventoryResult<Host>;

    async fn create_host(&self, attrs: &HostCreate) -> InventoryResult<Host>;

    async fn update_host(&self, id: EntityId, attrs: &HostUpdate) -> InventoryResult<Host>;

    async fn list_entitlements(
        &self,
        scope: EntitlementScope,
        query: &EntitlementQuery,
    ) -> InventoryResult<Vec<Entitlement>>;

    async fn attach_entitlements(
        &self,
        host_id: EntityId,
        items: &[EntitlementQuantity],
    ) -> InventoryResult<()>;

    async fn remove_entitlements(
        &self,
        host_id: EntityId,
        items: &[EntitlementQuantity],
    ) -> InventoryResult<()>;

    /// Live fact map, read through the lower-level consumer channel.
    async fn get_host_facts(&self, host_id: EntityId) -> InventoryResult<FactMap>;

    async fn put_host_facts(&self, host_id: EntityId, facts: &FactMap) -> InventoryResult<()>;

    async fn find_lifecycle_environment(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>>;

    async fn find_content_view(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>>;

    async fn find_host_collection(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>>;

    async fn add_hosts_to_collection(
        &self,
        collection_id: EntityId,
        host_ids: &[EntityId],
    ) -> InventoryResult<()>;
}
