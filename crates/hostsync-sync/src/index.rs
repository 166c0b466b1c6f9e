//! Existing-state index: content host name -> id, per organization.

use std::collections::HashMap;

use hostsync_core::{EntityId, Host};
use hostsync_inventory::{InventoryResult, InventoryService};
use tracing::{debug, info};

pub const PAGE_SIZE: u64 = 20;

/// Page through every host of an organization matching `search`.
///
/// One `per_page = 1` call discovers the total, then `ceil(total / PAGE_SIZE)`
/// pages are fetched, stopping early at the first empty page. Only registered
/// content hosts are returned.
pub async fn list_all_hosts(
    inventory: &dyn InventoryService,
    organization_id: EntityId,
    search: Option<&str>,
) -> InventoryResult<Vec<Host>> {
    let total = inventory
        .list_hosts(organization_id, search, 1, 1)
        .await?
        .matched_total();
    let pages = total.div_ceil(PAGE_SIZE);
    debug!(organization_id, total, pages, "listing hosts");

    let mut hosts = Vec::new();
    for page in 1..=pages {
        let listing = inventory
            .list_hosts(organization_id, search, page, PAGE_SIZE)
            .await?;
        if listing.results.is_empty() {
            debug!(organization_id, page, "listing ended before reported total");
            break;
        }
        let decoded = listing
            .hosts()
            .map_err(|err| anyhow::Error::new(err).context("decoding host listing"))?;
        hosts.extend(decoded.into_iter().filter(Host::is_content_host));
    }
    Ok(hosts)
}

/// Lazily loaded, never invalidated within a run. Hosts created during the run
/// are added with [`ExistingIndex::record`].
#[derive(Debug, Default)]
pub struct ExistingIndex {
    organizations: HashMap<EntityId, HashMap<String, EntityId>>,
}

impl ExistingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, organization_id: EntityId) -> bool {
        self.organizations.contains_key(&organization_id)
    }

    pub async fn ensure_loaded(
        &mut self,
        inventory: &dyn InventoryService,
        organization_id: EntityId,
        search: Option<&str>,
    ) -> InventoryResult<()> {
        if self.is_loaded(organization_id) {
            return Ok(());
        }
        let hosts = list_all_hosts(inventory, organization_id, search).await?;
        info!(organization_id, hosts = hosts.len(), "indexed existing content hosts");
        self.organizations.insert(
            organization_id,
            hosts.into_iter().map(|host| (host.name, host.id)).collect(),
        );
        Ok(())
    }

    pub fn lookup(&self, organization_id: EntityId, name: &str) -> Option<EntityId> {
        self.organizations
            .get(&organization_id)
            .and_then(|names| names.get(name))
            .copied()
    }

    pub fn record(&mut self, organization_id: EntityId, name: impl Into<String>, id: EntityId) {
        self.organizations
            .entry(organization_id)
            .or_default()
            .insert(name.into(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hostsync_inventory::{InventoryCall, InventoryFixture, MemoryInventory, RestInventory};
    use hostsync_transport::{BackoffPolicy, JsonClient, TransportConfig};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn inventory_with(hosts: u64) -> MemoryInventory {
        let hosts = (1..=hosts)
            .map(|id| {
                json!({
                    "id": id,
                    "name": format!("host{id:02}"),
                    "organization_id": 1,
                    "subscription_facet_attributes": {"uuid": format!("c-{id}")}
                })
            })
            .chain([json!({"id": 900, "name": "unregistered", "organization_id": 1})])
            .collect::<Vec<_>>();
        let fixture: InventoryFixture = serde_json::from_value(json!({
            "organizations": [{"id": 1, "name": "ACME"}],
            "hosts": hosts
        }))
        .expect("fixture");
        MemoryInventory::new(fixture).expect("inventory")
    }

    #[tokio::test]
    async fn index_loads_once_per_organization() {
        let inventory = inventory_with(3);
        let mut index = ExistingIndex::new();
        index.ensure_loaded(&inventory, 1, None).await.expect("load");
        index.ensure_loaded(&inventory, 1, None).await.expect("cached");

        assert_eq!(index.lookup(1, "host02"), Some(2));
        assert_eq!(index.lookup(1, "unregistered"), None);
        assert_eq!(index.lookup(2, "host02"), None);
        // one discovery call + one page
        assert_eq!(inventory.calls().await.len(), 2);

        index.record(1, "fresh", 77);
        assert_eq!(index.lookup(1, "fresh"), Some(77));
    }

    #[tokio::test]
    async fn page_count_is_ceiling_of_total() {
        // 40 content hosts + 1 unregistered host = 41 matching records
        let inventory = inventory_with(40);
        let hosts = list_all_hosts(&inventory, 1, None).await.expect("list");
        assert_eq!(hosts.len(), 40);

        let pages = inventory
            .calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                InventoryCall::ListHosts { page, per_page, .. } => Some((page, per_page)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(pages, vec![(1, 1), (1, 20), (2, 20), (3, 20)]);
    }

    #[tokio::test]
    async fn inflated_total_stops_at_first_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/hosts"))
            .and(query_param("per_page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": u64::MAX,
                "subtotal": u64::MAX,
                "results": []
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/hosts"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": u64::MAX,
                "results": [{"id": 3, "name": "web03", "organization_id": 1,
                             "subscription_facet_attributes": {"uuid": "c-3"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/hosts"))
            .and(query_param("page", "2"))
            .and(query_param("per_page", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": u64::MAX,
                "results": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = JsonClient::new(TransportConfig {
            base_url: server.uri(),
            backoff: BackoffPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            ..Default::default()
        })
        .expect("client");
        let hosts = list_all_hosts(&RestInventory::new(client), 1, None)
            .await
            .expect("list");
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "web03");
    }
}
