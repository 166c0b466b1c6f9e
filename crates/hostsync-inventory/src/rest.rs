//! Inventory service over the Foreman/Katello REST API.

use async_trait::async_trait;
use hostsync_core::{
    EntityId, Entitlement, EntitlementQuantity, FactMap, Host, HostPage, NamedRef, Organization,
};
use hostsync_transport::{JsonClient, TransportConfig};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{
    EntitlementQuery, EntitlementScope, HostCreate, HostUpdate, InventoryError, InventoryResult,
    InventoryService,
};

#[derive(Debug)]
pub struct RestInventory {
    client: JsonClient,
}

impl RestInventory {
    pub fn new(client: JsonClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(JsonClient::new(TransportConfig::from_env())?))
    }

    async fn consumer_uuid(&self, host_id: EntityId) -> InventoryResult<String> {
        let host = self.get_host(host_id).await?;
        host.subscription_facet_attributes
            .and_then(|facet| facet.uuid)
            .ok_or_else(|| InventoryError::not_found("content host consumer", host_id))
    }

    async fn find_named(
        &self,
        path: String,
        name: &str,
        what: &'static str,
    ) -> InventoryResult<Option<EntityId>> {
        let value = self
            .client
            .get(&path, &[("name", name.to_string()), ("full_result", "true".to_string())])
            .await?;
        let candidates: Vec<NamedRef> = results(value, what)?;
        Ok(candidates
            .into_iter()
            .find(|candidate| candidate.name == name)
            .map(|candidate| candidate.id))
    }
}

fn results<T: DeserializeOwned>(mut value: JsonValue, what: &'static str) -> InventoryResult<Vec<T>> {
    match value.get_mut("results").map(JsonValue::take) {
        Some(JsonValue::Null) | None => Ok(Vec::new()),
        Some(items) => serde_json::from_value(items).map_err(InventoryError::decode(what)),
    }
}

#[async_trait]
impl InventoryService for RestInventory {
    async fn list_organizations(&self) -> InventoryResult<Vec<Organization>> {
        let value = self
            .client
            .get("/katello/api/organizations", &[("full_result", "true".to_string())])
            .await?;
        results(value, "organization list")
    }

    async fn list_hosts(
        &self,
        organization_id: EntityId,
        search: Option<&str>,
        page: u64,
        per_page: u64,
    ) -> InventoryResult<HostPage> {
        let mut query = vec![
            ("organization_id", organization_id.to_string()),
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
        ];
        if let Some(search) = search {
            query.push(("search", search.to_string()));
        }
        let value = self.client.get("/api/hosts", &query).await?;
        serde_json::from_value(value).map_err(InventoryError::decode("host list"))
    }

    async fn get_host(&self, id: EntityId) -> InventoryResult<Host> {
        let value = self.client.get(&format!("/api/hosts/{id}"), &[]).await?;
        Host::from_value(value).map_err(InventoryError::decode("host"))
    }

    async fn create_host(&self, attrs: &HostCreate) -> InventoryResult<Host> {
        let value = self.client.post("/katello/api/host_subscriptions", attrs).await?;
        Host::from_value(value).map_err(InventoryError::decode("created host"))
    }

    async fn update_host(&self, id: EntityId, attrs: &HostUpdate) -> InventoryResult<Host> {
        let value = self
            .client
            .put(&format!("/api/hosts/{id}"), &json!({ "id": id, "host": attrs }))
            .await?;
        Host::from_value(value).map_err(InventoryError::decode("updated host"))
    }

    async fn list_entitlements(
        &self,
        scope: EntitlementScope,
        query: &EntitlementQuery,
    ) -> InventoryResult<Vec<Entitlement>> {
        let value = match scope {
            EntitlementScope::Host(host_id) => {
                self.client
                    .get(
                        &format!("/katello/api/hosts/{host_id}/subscriptions"),
                        &[("full_result", "true".to_string())],
                    )
                    .await?
            }
            EntitlementScope::Organization(organization_id) => {
                let mut params = vec![
                    ("organization_id", organization_id.to_string()),
                    ("full_result", "true".to_string()),
                ];
                if let Some(search) = query.search_expression() {
                    params.push(("search", search));
                }
                if let Some(host_id) = query.host_id {
                    params.push(("host_id", host_id.to_string()));
                    params.push(("available_for", "host".to_string()));
                    params.push(("match_host", "true".to_string()));
                }
                self.client.get("/katello/api/subscriptions", &params).await?
            }
        };
        let entitlements: Vec<Entitlement> = results(value, "subscription list")?;
        let total = entitlements.len();
        let accepted = entitlements
            .into_iter()
            .filter(|entitlement| query.accepts(entitlement))
            .collect::<Vec<_>>();
        debug!(?scope, total, accepted = accepted.len(), "listed entitlements");
        Ok(accepted)
    }

    async fn attach_entitlements(
        &self,
        host_id: EntityId,
        items: &[EntitlementQuantity],
    ) -> InventoryResult<()> {
        self.client
            .put(
                &format!("/katello/api/hosts/{host_id}/subscriptions/add_subscriptions"),
                &json!({ "host_id": host_id, "subscriptions": items }),
            )
            .await?;
        Ok(())
    }

    async fn remove_entitlements(
        &self,
        host_id: EntityId,
        items: &[EntitlementQuantity],
    ) -> InventoryResult<()> {
        self.client
            .put(
                &format!("/katello/api/hosts/{host_id}/subscriptions/remove_subscriptions"),
                &json!({ "host_id": host_id, "subscriptions": items }),
            )
            .await?;
        Ok(())
    }

    async fn get_host_facts(&self, host_id: EntityId) -> InventoryResult<FactMap> {
        let uuid = self.consumer_uuid(host_id).await?;
        let mut value = self.client.get(&format!("/rhsm/consumers/{uuid}"), &[]).await?;
        match value.get_mut("facts").map(JsonValue::take) {
            Some(JsonValue::Null) | None => Ok(FactMap::new()),
            Some(facts) => serde_json::from_value(facts).map_err(InventoryError::decode("consumer facts")),
        }
    }

    async fn put_host_facts(&self, host_id: EntityId, facts: &FactMap) -> InventoryResult<()> {
        let uuid = self.consumer_uuid(host_id).await?;
        self.client
            .put(&format!("/rhsm/consumers/{uuid}"), &json!({ "facts": facts }))
            .await?;
        Ok(())
    }

    async fn find_lifecycle_environment(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>> {
        self.find_named(
            format!("/katello/api/organizations/{organization_id}/environments"),
            name,
            "lifecycle environment list",
        )
        .await
    }

    async fn find_content_view(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>> {
        self.find_named(
            format!("/katello/api/organizations/{organization_id}/content_views"),
            name,
            "content view list",
        )
        .await
    }

    async fn find_host_collection(
        &self,
        organization_id: EntityId,
        name: &str,
    ) -> InventoryResult<Option<EntityId>> {
        self.find_named(
            format!("/katello/api/organizations/{organization_id}/host_collections"),
            name,
            "host collection list",
        )
        .await
    }

    async fn add_hosts_to_collection(
        &self,
        collection_id: EntityId,
        host_ids: &[EntityId],
    ) -> InventoryResult<()> {
        self.client
            .put(
                &format!("/katello/api/host_collections/{collection_id}/add_hosts"),
                &json!({ "host_ids": host_ids }),
            )
            .await?;
        Ok(())
    }
}
