//! Fixture-seeded in-memory inventory that records every call it serves.
//!
//! Used for offline runs (`--fixture`) and as the test double for the engine.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use hostsync_core::{
    ContentFacet, EntityId, Entitlement, EntitlementQuantity, FactMap, Host, HostPage, NamedRef,
    Organization, SubscriptionFacet,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    EntitlementQuery, EntitlementScope, HostCreate, HostUpdate, InventoryError, InventoryResult,
    InventoryService,
};

/// A named entity scoped to one organization (environment, content view, host collection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedName {
    pub id: EntityId,
    pub organization_id: EntityId,
    pub name: String,
}

/// A subscription pool available in an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub organization_id: EntityId,
    #[serde(flatten)]
    pub entitlement: Entitlement,
}

/// Seed data for [`MemoryInventory`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryFixture {
    #[serde(default)]
    pub organizations: Vec<Organization>,
    /// Host records in API shape; unknown fields are kept for custom columns.
    #[serde(default)]
    pub hosts: Vec<JsonValue>,
    /// Live consumer facts keyed by host id.
    #[serde(default)]
    pub facts: BTreeMap<EntityId, FactMap>,
    #[serde(default)]
    pub lifecycle_environments: Vec<ScopedName>,
    #[serde(default)]
    pub content_views: Vec<ScopedName>,
    #[serde(default)]
    pub host_collections: Vec<ScopedName>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    /// Entitlements attached per host id.
    #[serde(default)]
    pub attachments: BTreeMap<EntityId, Vec<Entitlement>>,
}

/// One served call, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryCall {
    ListOrganizations,
    ListHosts {
        organization_id: EntityId,
        search: Option<String>,
        page: u64,
        per_page: u64,
    },
    GetHost(EntityId),
    CreateHost(HostCreate),
    UpdateHost {
        id: EntityId,
        update: HostUpdate,
    },
    ListEntitlements {
        scope: EntitlementScope,
        query: EntitlementQuery,
    },
    AttachEntitlements {
        host_id: EntityId,
        items: Vec<EntitlementQuantity>,
    },
    RemoveEntitlements {
        host_id: EntityId,
        items: Vec<EntitlementQuantity>,
    },
    GetHostFacts(EntityId),
    PutHostFacts {
        host_id: EntityId,
        facts: FactMap,
    },
    FindLifecycleEnvironment {
        organization_id: EntityId,
        name: String,
    },
    FindContentView {
        organization_id: EntityId,
        name: String,
    },
    FindHostCollection {
        organization_id: EntityId,
        name: String,
    },
    AddHostsToCollection {
        collection_id: EntityId,
        host_ids: Vec<EntityId>,
    },
}

impl InventoryCall {
    /// True for calls that change remote state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::CreateHost(_)
                | Self::UpdateHost { .. }
                | Self::AttachEntitlements { .. }
                | Self::RemoveEntitlements { .. }
                | Self::PutHostFacts { .. }
                | Self::AddHostsToCollection { .. }
        )
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    organizations: Vec<Organization>,
    hosts: BTreeMap<EntityId, Host>,
    facts: BTreeMap<EntityId, FactMap>,
    lifecycle_environments: Vec<ScopedName>,
    content_views: Vec<ScopedName>,
    host_collections: Vec<ScopedName>,
    pools: Vec<Pool>,
    attachments: BTreeMap<EntityId, Vec<Entitlement>>,
    next_id: EntityId,
    calls: Vec<InventoryCall>,
}

impl MemoryState {
    fn host_mut(&mut self, id: EntityId) -> InventoryResult<&mut Host> {
        self.hosts
            .get_mut(&id)
            .ok_or_else(|| InventoryError::not_found("host", id))
    }

    fn named_ref(names: &[ScopedName], id: EntityId) -> NamedRef {
        let name = names
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.name.clone())
            .unwrap_or_default();
        NamedRef { id, name }
    }

    fn find(names: &[ScopedName], organization_id: EntityId, name: &str) -> Option<EntityId> {
        names
            .iter()
            .find(|entry| entry.organization_id == organization_id && entry.name == name)
            .map(|entry| entry.id)
    }

    fn host_by_guest_uuid(&self, uuid: &str) -> Option<NamedRef> {
        let (organization, name) = uuid.split_once('/')?;
        self.hosts
            .values()
            .find(|host| host.name == name && host.organization_name.as_deref() == Some(organization))
            .map(|host| NamedRef {
                id: host.id,
                name: host.name.clone(),
            })
    }
}

/// In-memory [`InventoryService`].
#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: Mutex<MemoryState>,
}

impl MemoryInventory {
    pub fn new(fixture: InventoryFixture) -> anyhow::Result<Self> {
        let mut hosts = BTreeMap::new();
        for value in fixture.hosts {
            let host = Host::from_value(value).context("parsing fixture host")?;
            hosts.insert(host.id, host);
        }
        let next_id = [
            hosts.keys().copied().max(),
            fixture.organizations.iter().map(|o| o.id).max(),
            fixture.pools.iter().map(|p| p.entitlement.id).max(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
            + 1000;

        Ok(Self {
            state: Mutex::new(MemoryState {
                organizations: fixture.organizations,
                hosts,
                facts: fixture.facts,
                lifecycle_environments: fixture.lifecycle_environments,
                content_views: fixture.content_views,
                host_collections: fixture.host_collections,
                pools: fixture.pools,
                attachments: fixture.attachments,
                next_id,
                calls: Vec::new(),
            }),
        })
    }

    pub fn from_fixture_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let fixture: InventoryFixture =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Self::new(fixture)
    }

    pub async fn calls(&self) -> Vec<InventoryCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn host_named(&self, organization_id: EntityId, name: &str) -> Option<Host> {
        self.state
            .lock()
            .await
            .hosts
            .values()
            .find(|host| host.organization_id == Some(organization_id) && host.name == name)
            .cloned()
    }

    pub async fn facts_of(&self, host_id: EntityId) -> FactMap {
        self.state
            .lock()
            .await
            .facts
            .get(&host_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn attachments_of(&self, host_id: EntityId) -> Vec<Entitlement> {
        self.state
            .lock()
            .await
            .attachments
            .get(&host_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Minimal search support: `name = x`, `name ~ x`, otherwise a name substring.
fn matches_search(host: &Host, search: Option<&str>) -> bool {
    let Some(search) = search.map(str::trim).filter(|s| !s.is_empty()) else {
        return true;
    };
    let unquote = |s: &str| s.trim().trim_matches('"').to_string();
    if let Some(exact) = search.strip_prefix("name =") {
        host.name == unquote(exact)
    } else if let Some(partial) = search.strip_prefix("name ~") {
        host.name.contains(&unquote(partial))
    } else {
        host.name.contains(search)
    }
}

/// Reported facts surface on the host record with `::` separators.
fn mirrored_facts(facts: &FactMap) -> FactMap {
    facts
        .iter()
        .map(|(key, value)| (key.replacen('.', "::", 1), value.clone()))
        .collect()
}

/// Re-serialize typed fields over the raw tree so the two views agree.
fn refreshed(host: &Host) -> Host {
    let mut out = host.clone();
    let typed = serde_json::to_value(host).unwrap_or(JsonValue::Null);
    match (&mut out.raw, typed) {
        (JsonValue::Object(raw), JsonValue::Object(typed)) => {
            for (key, value) in typed {
                raw.insert(key, value);
            }
        }
        (raw, typed) => *raw = typed,
    }
    out
}

#[async_trait]
impl InventoryService for MemoryInventory {
    async fn list_organizations(&self) -> InventoryResult<Vec<Organization>> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::ListOrganizations);
        Ok(state.organizations.clone())
    }

    async fn list_hosts(
        &self,
        organization_id: EntityId,
        search: Option<&str>,
        page: u64,
        per_page: u64,
    ) -> InventoryResult<HostPage> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::ListHosts {
            organization_id,
            search: search.map(ToString::to_string),
            page,
            per_page,
        });

        let in_org = state
            .hosts
            .values()
            .filter(|host| host.organization_id == Some(organization_id))
            .collect::<Vec<_>>();
        let total = in_org.len() as u64;
        let matched = in_org
            .into_iter()
            .filter(|host| matches_search(host, search))
            .collect::<Vec<_>>();
        let subtotal = matched.len() as u64;
        let skip = page.saturating_sub(1).saturating_mul(per_page) as usize;
        let results = matched
            .into_iter()
            .skip(skip)
            .take(per_page as usize)
            .map(|host| refreshed(host).raw)
            .collect();

        Ok(HostPage {
            total,
            subtotal: Some(subtotal),
            results,
        })
    }

    async fn get_host(&self, id: EntityId) -> InventoryResult<Host> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::GetHost(id));
        let host = state.host_mut(id)?;
        Ok(refreshed(host))
    }

    async fn create_host(&self, attrs: &HostCreate) -> InventoryResult<Host> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::CreateHost(attrs.clone()));

        let id = state.next_id;
        state.next_id += 1;
        let organization_name = state
            .organizations
            .iter()
            .find(|org| org.id == attrs.organization_id)
            .map(|org| org.name.clone());
        let content_facet = ContentFacet {
            lifecycle_environment: attrs
                .lifecycle_environment_id
                .map(|env| MemoryState::named_ref(&state.lifecycle_environments, env)),
            content_view: attrs
                .content_view_id
                .map(|cv| MemoryState::named_ref(&state.content_views, cv)),
            host_collections: Vec::new(),
        };
        let host = Host {
            id,
            name: attrs.name.clone(),
            organization_id: Some(attrs.organization_id),
            organization_name,
            content_facet_attributes: Some(content_facet),
            subscription_facet_attributes: Some(SubscriptionFacet {
                uuid: Some(format!("consumer-{id}")),
                installed_products: attrs.installed_products.clone().unwrap_or_default(),
                service_level: attrs.service_level.clone(),
                ..Default::default()
            }),
            facts: mirrored_facts(&attrs.facts),
            raw: JsonValue::Null,
        };
        state.facts.insert(id, attrs.facts.clone());
        state.hosts.insert(id, host.clone());
        Ok(refreshed(&host))
    }

    async fn update_host(&self, id: EntityId, attrs: &HostUpdate) -> InventoryResult<Host> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::UpdateHost {
            id,
            update: attrs.clone(),
        });

        let environment = attrs
            .content_facet_attributes
            .as_ref()
            .and_then(|c| c.lifecycle_environment_id)
            .map(|env| MemoryState::named_ref(&state.lifecycle_environments, env));
        let content_view = attrs
            .content_facet_attributes
            .as_ref()
            .and_then(|c| c.content_view_id)
            .map(|cv| MemoryState::named_ref(&state.content_views, cv));
        let guests = attrs
            .subscription_facet_attributes
            .as_ref()
            .and_then(|s| s.hypervisor_guest_uuids.as_ref())
            .map(|uuids| {
                uuids
                    .iter()
                    .filter_map(|uuid| state.host_by_guest_uuid(uuid))
                    .collect::<Vec<_>>()
            });

        let host = state.host_mut(id)?;
        let hypervisor = NamedRef {
            id: host.id,
            name: host.name.clone(),
        };
        if environment.is_some() || content_view.is_some() {
            let facet = host.content_facet_attributes.get_or_insert_with(Default::default);
            if environment.is_some() {
                facet.lifecycle_environment = environment;
            }
            if content_view.is_some() {
                facet.content_view = content_view;
            }
        }
        if let Some(update) = &attrs.subscription_facet_attributes {
            let facet = host
                .subscription_facet_attributes
                .get_or_insert_with(Default::default);
            if let Some(products) = &update.installed_products {
                facet.installed_products = products.clone();
            }
            if let Some(level) = &update.service_level {
                facet.service_level = Some(level.clone());
            }
            if let Some(autoheal) = update.autoheal {
                facet.autoheal = Some(autoheal);
            }
            if let Some(guests) = &guests {
                facet.virtual_guests = guests.clone();
            }
        }
        let updated = refreshed(host);

        for guest in guests.unwrap_or_default() {
            if let Some(guest_host) = state.hosts.get_mut(&guest.id) {
                guest_host
                    .subscription_facet_attributes
                    .get_or_insert_with(Default::default)
                    .virtual_host = Some(hypervisor.clone());
            }
        }
        Ok(updated)
    }

    async fn list_entitlements(
        &self,
        scope: EntitlementScope,
        query: &EntitlementQuery,
    ) -> InventoryResult<Vec<Entitlement>> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::ListEntitlements {
            scope,
            query: query.clone(),
        });
        let candidates = match scope {
            EntitlementScope::Host(host_id) => {
                state.host_mut(host_id)?;
                state.attachments.get(&host_id).cloned().unwrap_or_default()
            }
            EntitlementScope::Organization(organization_id) => state
                .pools
                .iter()
                .filter(|pool| pool.organization_id == organization_id)
                .map(|pool| pool.entitlement.clone())
                .collect(),
        };
        Ok(candidates
            .into_iter()
            .filter(|entitlement| query.accepts(entitlement))
            .collect())
    }

    async fn attach_entitlements(
        &self,
        host_id: EntityId,
        items: &[EntitlementQuantity],
    ) -> InventoryResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::AttachEntitlements {
            host_id,
            items: items.to_vec(),
        });
        state.host_mut(host_id)?;

        let mut attached = Vec::with_capacity(items.len());
        for item in items {
            let pool = state
                .pools
                .iter()
                .find(|pool| pool.entitlement.id == item.id)
                .ok_or_else(|| InventoryError::not_found("subscription", item.id))?;
            let mut entitlement = pool.entitlement.clone();
            entitlement.quantity_consumed = Some(item.quantity.max(1));
            attached.push(entitlement);
        }
        state.attachments.entry(host_id).or_default().extend(attached);
        Ok(())
    }

    async fn remove_entitlements(
        &self,
        host_id: EntityId,
        items: &[EntitlementQuantity],
    ) -> InventoryResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::RemoveEntitlements {
            host_id,
            items: items.to_vec(),
        });
        state.host_mut(host_id)?;
        if let Some(attached) = state.attachments.get_mut(&host_id) {
            attached.retain(|entitlement| items.iter().all(|item| item.id != entitlement.id));
        }
        Ok(())
    }

    async fn get_host_facts(&self, host_id: EntityId) -> InventoryResult<FactMap> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::GetHostFacts(host_id));
        state.host_mut(host_id)?;
        Ok(state.facts.get(&host_id).cloned().unwrap_or_default())
    }

    async fn put_host_facts(&self, host_id: EntityId, facts: &FactMap) -> InventoryResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::PutHostFacts {
            host_id,
            facts: facts.clone(),
        });
        let host = state.host_mut(host_id)?;
        host.facts.extend(mirrored_facts(facts));
        state.facts.insert(host_id, facts.clone());
        Ok(())
    }

    async fn find_lifecycle_environment(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::FindLifecycleEnvironment {
            organization_id,
            name: name.to_string(),
        });
        Ok(MemoryState::find(&state.lifecycle_environments, organization_id, name))
    }

    async fn find_content_view(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::FindContentView {
            organization_id,
            name: name.to_string(),
        });
        Ok(MemoryState::find(&state.content_views, organization_id, name))
    }

    async fn find_host_collection(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::FindHostCollection {
            organization_id,
            name: name.to_string(),
        });
        Ok(MemoryState::find(&state.host_collections, organization_id, name))
    }

    async fn add_hosts_to_collection(
        &self,
        collection_id: EntityId,
        host_ids: &[EntityId],
    ) -> InventoryResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(InventoryCall::AddHostsToCollection {
            collection_id,
            host_ids: host_ids.to_vec(),
        });
        let collection = MemoryState::named_ref(&state.host_collections, collection_id);
        for host_id in host_ids {
            let host = state.host_mut(*host_id)?;
            let facet = host.content_facet_attributes.get_or_insert_with(Default::default);
            if !facet.host_collections.iter().any(|c| c.id == collection_id) {
                facet.host_collections.push(collection.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn fixture() -> InventoryFixture {
        serde_json::from_value(json!({
            "organizations": [{"id": 1, "name": "ACME"}],
            "hosts": [
                {"id": 10, "name": "hv1", "organization_id": 1, "organization_name": "ACME",
                 "subscription_facet_attributes": {"uuid": "c-10"}},
                {"id": 11, "name": "guest1", "organization_id": 1, "organization_name": "ACME",
                 "subscription_facet_attributes": {"uuid": "c-11"}},
                {"id": 12, "name": "bare-metal", "organization_id": 1}
            ],
            "pools": [
                {"organization_id": 1, "id": 500, "product_id": "RH00004",
                 "product_name": "RHEL Server", "available": 10}
            ]
        }))
        .expect("fixture")
    }

    #[tokio::test]
    async fn paging_reports_total_and_slices_results() {
        let inventory = MemoryInventory::new(fixture()).expect("inventory");
        let first = inventory.list_hosts(1, None, 1, 2).await.expect("page 1");
        let second = inventory.list_hosts(1, None, 2, 2).await.expect("page 2");
        assert_eq!(first.matched_total(), 3);
        assert_eq!(first.results.len(), 2);
        assert_eq!(second.results.len(), 1);

        let searched = inventory
            .list_hosts(1, Some("name = guest1"), 1, 20)
            .await
            .expect("search");
        assert_eq!(searched.total, 3);
        assert_eq!(searched.matched_total(), 1);
    }

    #[tokio::test]
    async fn hypervisor_guest_update_links_both_sides() {
        let inventory = MemoryInventory::new(fixture()).expect("inventory");
        let update = HostUpdate {
            subscription_facet_attributes: Some(crate::SubscriptionFacetUpdate {
                autoheal: Some(false),
                hypervisor_guest_uuids: Some(vec!["ACME/guest1".into()]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let hv = inventory.update_host(10, &update).await.expect("update");
        assert!(hv.is_hypervisor());
        let guest = inventory.get_host(11).await.expect("guest");
        let facet = guest.subscription_facet_attributes.expect("facet");
        assert_eq!(facet.virtual_host.map(|h| h.name).as_deref(), Some("hv1"));
    }

    #[tokio::test]
    async fn attach_and_remove_track_host_entitlements() {
        let inventory = MemoryInventory::new(fixture()).expect("inventory");
        inventory
            .attach_entitlements(11, &[EntitlementQuantity { id: 500, quantity: 0 }])
            .await
            .expect("attach");
        let attached = inventory
            .list_entitlements(EntitlementScope::Host(11), &EntitlementQuery::default())
            .await
            .expect("list");
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].quantity_consumed, Some(1));

        inventory
            .remove_entitlements(11, &[EntitlementQuantity { id: 500, quantity: 1 }])
            .await
            .expect("remove");
        assert!(inventory.attachments_of(11).await.is_empty());

        let err = inventory
            .attach_entitlements(11, &[EntitlementQuantity { id: 999, quantity: 1 }])
            .await
            .expect_err("unknown pool");
        assert!(matches!(err, InventoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn fixture_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "{}",
            serde_json::to_string(&json!({
                "organizations": [{"id": 3, "name": "Lab"}],
                "facts": {"7": {"uname.machine": "x86_64"}},
                "hosts": [{"id": 7, "name": "n7", "organization_id": 3}]
            }))
            .expect("json")
        )
        .expect("write");

        let inventory = MemoryInventory::from_fixture_file(file.path()).expect("load");
        let facts = inventory.get_host_facts(7).await.expect("facts");
        assert_eq!(facts["uname.machine"], json!("x86_64"));
        assert_eq!(
            inventory.calls().await,
            vec![InventoryCall::GetHostFacts(7)]
        );
    }
}
