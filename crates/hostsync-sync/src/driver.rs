//! Import driver: per-row reconciliation plus the deferred hypervisor/guest flush.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostsync_core::{
    columns, namify, parse_count, EntityId, Entitlement, EntitlementQuantity, FactMap, Host,
    Organization, Row,
};
use hostsync_inventory::{
    ContentFacetUpdate, EntitlementQuery, EntitlementScope, HostCreate, HostUpdate,
    InventoryService, SubscriptionFacetUpdate,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::ImportOptions;
use crate::index::{list_all_hosts, ExistingIndex};
use crate::matcher::{acquire, csv_split, match_attached, parse_subscription_field, SubscriptionCriteria};
use crate::projector::{derive_facts, installed_products};
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NamedKind {
    LifecycleEnvironment,
    ContentView,
    HostCollection,
}

impl NamedKind {
    fn label(self) -> &'static str {
        match self {
            Self::LifecycleEnvironment => "lifecycle environment",
            Self::ContentView => "content view",
            Self::HostCollection => "host collection",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OrgRef<'a> {
    id: EntityId,
    name: &'a str,
}

/// Guest identifiers (`organization/name`) per hypervisor id, in row order.
#[derive(Debug, Default)]
struct PendingGuests(BTreeMap<EntityId, Vec<String>>);

impl PendingGuests {
    fn push(&mut self, hypervisor_id: EntityId, guest: String) {
        let guests = self.0.entry(hypervisor_id).or_default();
        if !guests.contains(&guest) {
            guests.push(guest);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostAction {
    Created,
    Updated,
    SubscriptionsUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubscriptionResult {
    /// The row carried no subscriptions to apply.
    Unchanged,
    /// An attached entitlement already satisfied the line.
    AlreadyAttached(String),
    Attached(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionReport {
    pub removed: usize,
    pub result: SubscriptionResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostOutcome {
    pub name: String,
    pub host_id: EntityId,
    pub action: HostAction,
    pub facts_written: bool,
    pub subscriptions: Option<SubscriptionReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowOutcome {
    /// Filtered out by `--organization`.
    pub skipped: bool,
    pub hosts: Vec<HostOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub hypervisors_updated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows: usize,
    pub skipped: usize,
    pub failed: usize,
    pub created: usize,
    pub updated: usize,
    pub subscriptions_updated: usize,
    pub hypervisors_updated: usize,
}

impl ImportSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            rows: 0,
            skipped: 0,
            failed: 0,
            created: 0,
            updated: 0,
            subscriptions_updated: 0,
            hypervisors_updated: 0,
        }
    }

    pub fn record(&mut self, outcome: &RowOutcome) {
        self.rows += 1;
        if outcome.skipped {
            self.skipped += 1;
        }
        for host in &outcome.hosts {
            match host.action {
                HostAction::Created => self.created += 1,
                HostAction::Updated => self.updated += 1,
                HostAction::SubscriptionsUpdated => self.subscriptions_updated += 1,
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.rows += 1;
        self.failed += 1;
    }

    pub fn finish(&mut self, report: FinalizeReport) {
        self.hypervisors_updated = report.hypervisors_updated;
        self.finished_at = Some(Utc::now());
    }
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows={} created={} updated={} subscriptions_updated={} skipped={} failed={} hypervisors_updated={}",
            self.rows,
            self.created,
            self.updated,
            self.subscriptions_updated,
            self.skipped,
            self.failed,
            self.hypervisors_updated
        )
    }
}

/// One import pass. Rows may be processed concurrently through a shared
/// reference; [`ImportRun::finalize`] consumes the run once every row is done.
pub struct ImportRun {
    inventory: Arc<dyn InventoryService>,
    options: ImportOptions,
    run_id: Uuid,
    organizations: Mutex<Option<Vec<Organization>>>,
    index: Mutex<ExistingIndex>,
    pending: Mutex<PendingGuests>,
    cleared: Mutex<HashSet<String>>,
    named: Mutex<HashMap<(NamedKind, EntityId, String), EntityId>>,
}

impl ImportRun {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        options: ImportOptions,
    ) -> Result<Self, ReconcileError> {
        options.validate()?;
        Ok(Self {
            inventory,
            options,
            run_id: Uuid::new_v4(),
            organizations: Mutex::new(None),
            index: Mutex::new(ExistingIndex::new()),
            pending: Mutex::new(PendingGuests::default()),
            cleared: Mutex::new(HashSet::new()),
            named: Mutex::new(HashMap::new()),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn process_row(&self, row: &Row) -> Result<RowOutcome, ReconcileError> {
        let span = info_span!("row", run_id = %self.run_id, row = %row.key());
        self.reconcile_row(row).instrument(span).await
    }

    async fn reconcile_row(&self, row: &Row) -> Result<RowOutcome, ReconcileError> {
        let organization = row.get(columns::ORGANIZATION);
        if let Some(filter) = self.options.organization.as_deref() {
            if organization != Some(filter) {
                debug!("row outside --organization filter");
                return Ok(RowOutcome {
                    skipped: true,
                    hosts: Vec::new(),
                });
            }
        }
        let organization = organization.ok_or(ReconcileError::MissingColumn(columns::ORGANIZATION))?;
        let org = OrgRef {
            id: self.organization_id(organization).await?,
            name: organization,
        };
        self.index
            .lock()
            .await
            .ensure_loaded(self.inventory.as_ref(), org.id, self.options.search.as_deref())
            .await?;

        let count = parse_count(row.get(columns::COUNT)).map_err(ReconcileError::invalid_number(
            columns::COUNT,
            row.get(columns::COUNT),
        ))?;

        let mut hosts = Vec::new();
        for number in 0..count {
            if let Some(search) = row.get(columns::SEARCH) {
                let search = namify(search, number, 1);
                let matched =
                    list_all_hosts(self.inventory.as_ref(), org.id, Some(&search)).await?;
                debug!(%search, matched = matched.len(), "expanded search row");
                for host in matched {
                    // Search matches exist remotely even when the run-wide
                    // index was loaded with a narrower filter.
                    self.index.lock().await.record(org.id, host.name.clone(), host.id);
                    hosts.push(self.reconcile_named(&host.name, org, row).await?);
                }
            } else {
                let template = row
                    .get(columns::NAME)
                    .ok_or(ReconcileError::MissingColumn(columns::NAME))?;
                let name = namify(template, number, count);
                hosts.push(self.reconcile_named(&name, org, row).await?);
            }
        }
        Ok(RowOutcome {
            skipped: false,
            hosts,
        })
    }

    async fn reconcile_named(
        &self,
        name: &str,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<HostOutcome, ReconcileError> {
        if self.options.itemized_subscriptions {
            self.update_itemized_subscriptions(name, org, row).await
        } else {
            self.update_or_create(name, org, row).await
        }
    }

    async fn update_itemized_subscriptions(
        &self,
        name: &str,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<HostOutcome, ReconcileError> {
        let host_id = self
            .index
            .lock()
            .await
            .lookup(org.id, name)
            .ok_or_else(|| ReconcileError::HostMustExist {
                name: name.to_string(),
            })?;
        let host = self.inventory.get_host(host_id).await?;
        let clear = self.options.clear_subscriptions && self.claim_clear(org, name).await;
        let report = self.update_subscriptions(&host, org, row, clear).await?;
        Ok(HostOutcome {
            name: name.to_string(),
            host_id,
            action: HostAction::SubscriptionsUpdated,
            facts_written: false,
            subscriptions: Some(report),
        })
    }

    async fn update_or_create(
        &self,
        name: &str,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<HostOutcome, ReconcileError> {
        let lifecycle_environment_id = self
            .resolve_named(NamedKind::LifecycleEnvironment, org, row.get(columns::ENVIRONMENT))
            .await?;
        let content_view_id = self
            .resolve_named(NamedKind::ContentView, org, row.get(columns::CONTENT_VIEW))
            .await?;
        let products = installed_products(row)?;
        let service_level = row.get(columns::SLA).map(ToString::to_string);
        let hypervisor_id = self.resolve_hypervisor(name, org, row).await?;

        let mut index = self.index.lock().await;
        let existing = index.lookup(org.id, name);
        let (host, action) = match existing {
            None => {
                let attrs = HostCreate {
                    organization_id: org.id,
                    name: name.to_string(),
                    facts: derive_facts(name, org.name, row, FactMap::new()),
                    lifecycle_environment_id,
                    content_view_id,
                    installed_products: products,
                    service_level,
                };
                let host = self.inventory.create_host(&attrs).await?;
                index.record(org.id, name, host.id);
                drop(index);
                info!(host = name, id = host.id, "created content host");
                (host, HostAction::Created)
            }
            Some(id) => {
                drop(index);
                let update = HostUpdate {
                    content_facet_attributes: Some(ContentFacetUpdate {
                        lifecycle_environment_id,
                        content_view_id,
                    }),
                    subscription_facet_attributes: Some(SubscriptionFacetUpdate {
                        installed_products: products,
                        service_level,
                        autoheal: Some(true),
                        hypervisor_guest_uuids: None,
                    }),
                };
                let host = self.inventory.update_host(id, &update).await?;
                info!(host = name, id, "updated content host");
                (host, HostAction::Updated)
            }
        };

        let facts_written = self.update_facts(&host, org, row).await?;
        self.update_host_collections(&host, org, row).await?;

        let wants_subscriptions = carries_subscriptions(row);
        let clear = (self.options.clear_subscriptions || wants_subscriptions)
            && self.claim_clear(org, name).await;
        let subscriptions = if wants_subscriptions || clear {
            Some(self.update_subscriptions(&host, org, row, clear).await?)
        } else {
            None
        };

        if let Some(hypervisor_id) = hypervisor_id {
            self.pending
                .lock()
                .await
                .push(hypervisor_id, format!("{}/{name}", org.name));
        }

        Ok(HostOutcome {
            name: name.to_string(),
            host_id: host.id,
            action,
            facts_written,
            subscriptions,
        })
    }

    /// Read-modify-write of the live fact map; unchanged facts are not written back.
    async fn update_facts(
        &self,
        host: &Host,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<bool, ReconcileError> {
        if !host.is_content_host() {
            return Ok(false);
        }
        let current = self.inventory.get_host_facts(host.id).await?;
        let merged = derive_facts(&host.name, org.name, row, current.clone());
        if merged == current {
            debug!(host = %host.name, "facts already current");
            return Ok(false);
        }
        self.inventory.put_host_facts(host.id, &merged).await?;
        Ok(true)
    }

    async fn update_host_collections(
        &self,
        host: &Host,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<(), ReconcileError> {
        let Some(cell) = row.get(columns::HOST_COLLECTIONS) else {
            return Ok(());
        };
        let member_of = host
            .content_facet_attributes
            .iter()
            .flat_map(|facet| facet.host_collections.iter().map(|c| c.id))
            .collect::<HashSet<_>>();
        for collection in csv_split(cell, columns::HOST_COLLECTIONS)? {
            let Some(collection_id) = self
                .resolve_named(NamedKind::HostCollection, org, Some(collection.as_str()))
                .await?
            else {
                continue;
            };
            if member_of.contains(&collection_id) {
                continue;
            }
            self.inventory
                .add_hosts_to_collection(collection_id, &[host.id])
                .await?;
            debug!(host = %host.name, %collection, "added to host collection");
        }
        Ok(())
    }

    async fn update_subscriptions(
        &self,
        host: &Host,
        org: OrgRef<'_>,
        row: &Row,
        clear: bool,
    ) -> Result<SubscriptionReport, ReconcileError> {
        let mut attached = self
            .inventory
            .list_entitlements(EntitlementScope::Host(host.id), &EntitlementQuery::default())
            .await?;

        let mut removed = 0;
        if clear && !attached.is_empty() {
            info!(host = %host.name, count = attached.len(), "clearing existing subscriptions");
            for entitlement in attached.drain(..) {
                let item = EntitlementQuantity {
                    id: entitlement.id,
                    quantity: entitlement.quantity_consumed.unwrap_or(0),
                };
                self.inventory.remove_entitlements(host.id, &[item]).await?;
                removed += 1;
            }
        }

        let result = if row.has(columns::SUBS_SKU) || row.has(columns::SUBS_NAME) {
            self.single_subscription(host, org, row, &attached).await?
        } else {
            self.all_in_one_subscription(host, org, row).await?
        };
        Ok(SubscriptionReport { removed, result })
    }

    async fn single_subscription(
        &self,
        host: &Host,
        org: OrgRef<'_>,
        row: &Row,
        attached: &[Entitlement],
    ) -> Result<SubscriptionResult, ReconcileError> {
        let criteria = SubscriptionCriteria::from_itemized_row(row);
        if let Some(existing) = match_attached(&criteria, attached) {
            let name = existing.display_name();
            info!(host = %host.name, subscription = %name, "already attached");
            return Ok(SubscriptionResult::AlreadyAttached(name));
        }

        let organization_id = host.organization_id.unwrap_or(org.id);
        let pool = acquire(self.inventory.as_ref(), organization_id, Some(host.id), &criteria).await?;
        let quantity = criteria.resolved_quantity()?;
        self.inventory
            .attach_entitlements(host.id, &[EntitlementQuantity { id: pool.id, quantity }])
            .await?;
        let name = pool.display_name();
        info!(host = %host.name, subscription = %name, quantity, "attached subscription");
        Ok(SubscriptionResult::Attached(vec![name]))
    }

    /// Resolve every aggregate entry first; one unresolved entry fails the row
    /// before anything is attached.
    async fn all_in_one_subscription(
        &self,
        host: &Host,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<SubscriptionResult, ReconcileError> {
        let Some(cell) = row.get(columns::SUBSCRIPTIONS) else {
            return Ok(SubscriptionResult::Unchanged);
        };
        let hypervisor = row.hypervisor_reference();
        let mut items = Vec::new();
        let mut names = Vec::new();
        for line in parse_subscription_field(cell)? {
            let criteria =
                SubscriptionCriteria::from_line(&line, hypervisor.as_deref(), row.get(columns::SLA));
            let pool = acquire(self.inventory.as_ref(), org.id, None, &criteria).await?;
            items.push(EntitlementQuantity {
                id: pool.id,
                quantity: criteria.resolved_quantity()?,
            });
            names.push(pool.display_name());
        }
        if items.is_empty() {
            return Ok(SubscriptionResult::Unchanged);
        }
        self.inventory.attach_entitlements(host.id, &items).await?;
        info!(host = %host.name, count = items.len(), "attached subscriptions");
        Ok(SubscriptionResult::Attached(names))
    }

    /// The hypervisor a guest row points at must already be indexed.
    async fn resolve_hypervisor(
        &self,
        guest: &str,
        org: OrgRef<'_>,
        row: &Row,
    ) -> Result<Option<EntityId>, ReconcileError> {
        if !row.is_virtual() {
            return Ok(None);
        }
        let Some(hypervisor) = row.hypervisor_reference() else {
            return Ok(None);
        };
        let found = self.index.lock().await.lookup(org.id, &hypervisor);
        found
            .map(Some)
            .ok_or_else(|| ReconcileError::HypervisorNotFound {
                hypervisor,
                guest: guest.to_string(),
            })
    }

    /// True the first time a host is claimed for clearing in this run.
    async fn claim_clear(&self, org: OrgRef<'_>, name: &str) -> bool {
        self.cleared
            .lock()
            .await
            .insert(format!("{}/{name}", org.name))
    }

    async fn organization_id(&self, name: &str) -> Result<EntityId, ReconcileError> {
        let mut organizations = self.organizations.lock().await;
        if organizations.is_none() {
            *organizations = Some(self.inventory.list_organizations().await?);
        }
        organizations
            .iter()
            .flatten()
            .find(|org| org.name == name)
            .map(|org| org.id)
            .ok_or_else(|| ReconcileError::UnknownOrganization(name.to_string()))
    }

    async fn resolve_named(
        &self,
        kind: NamedKind,
        org: OrgRef<'_>,
        name: Option<&str>,
    ) -> Result<Option<EntityId>, ReconcileError> {
        let Some(name) = name else {
            return Ok(None);
        };
        let key = (kind, org.id, name.to_string());
        if let Some(id) = self.named.lock().await.get(&key) {
            return Ok(Some(*id));
        }
        let found = match kind {
            NamedKind::LifecycleEnvironment => {
                self.inventory.find_lifecycle_environment(org.id, name).await?
            }
            NamedKind::ContentView => self.inventory.find_content_view(org.id, name).await?,
            NamedKind::HostCollection => self.inventory.find_host_collection(org.id, name).await?,
        };
        let id = found.ok_or_else(|| ReconcileError::UnknownReference {
            kind: kind.label(),
            name: name.to_string(),
            organization: org.name.to_string(),
        })?;
        self.named.lock().await.insert(key, id);
        Ok(Some(id))
    }

    /// Flush accumulated guest lists: one update per hypervisor, after every row.
    pub async fn finalize(self) -> Result<FinalizeReport, ReconcileError> {
        let span = info_span!("finalize", run_id = %self.run_id);
        let pending = self.pending.into_inner();
        let inventory = self.inventory;
        async move {
            let mut report = FinalizeReport::default();
            for (hypervisor_id, guests) in pending.0 {
                let update = HostUpdate {
                    subscription_facet_attributes: Some(SubscriptionFacetUpdate {
                        autoheal: Some(false),
                        hypervisor_guest_uuids: Some(guests),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                inventory.update_host(hypervisor_id, &update).await?;
                report.hypervisors_updated += 1;
            }
            info!(hypervisors = report.hypervisors_updated, "updated hypervisor guest associations");
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

fn carries_subscriptions(row: &Row) -> bool {
    [columns::SUBS_SKU, columns::SUBS_NAME, columns::SUBSCRIPTIONS]
        .iter()
        .any(|column| row.has(column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostsync_inventory::{InventoryFixture, MemoryInventory};
    use serde_json::json;

    fn inventory() -> Arc<MemoryInventory> {
        let fixture: InventoryFixture = serde_json::from_value(json!({
            "organizations": [{"id": 1, "name": "ACME"}],
            "lifecycle_environments": [{"id": 5, "organization_id": 1, "name": "Library"}],
            "content_views": [{"id": 6, "organization_id": 1, "name": "Default Organization View"}],
            "host_collections": [{"id": 7, "organization_id": 1, "name": "web"}]
        }))
        .expect("fixture");
        Arc::new(MemoryInventory::new(fixture).expect("inventory"))
    }

    fn run(inventory: &Arc<MemoryInventory>, options: ImportOptions) -> ImportRun {
        ImportRun::new(inventory.clone(), options).expect("run")
    }

    #[tokio::test]
    async fn count_rows_create_templated_hosts() {
        let inventory = inventory();
        let run = run(&inventory, ImportOptions::default());
        let row = Row::new()
            .with(columns::NAME, "web%02d")
            .with(columns::COUNT, "3")
            .with(columns::ORGANIZATION, "ACME")
            .with(columns::ENVIRONMENT, "Library")
            .with(columns::CONTENT_VIEW, "Default Organization View")
            .with(columns::HOST_COLLECTIONS, "web");
        let outcome = run.process_row(&row).await.expect("row");
        let names = outcome.hosts.iter().map(|h| h.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["web00", "web01", "web02"]);
        assert!(outcome.hosts.iter().all(|h| h.action == HostAction::Created));

        let host = inventory.host_named(1, "web01").await.expect("created");
        let facet = host.content_facet_attributes.expect("content facet");
        assert_eq!(facet.lifecycle_environment.map(|e| e.id), Some(5));
        assert_eq!(facet.host_collections.len(), 1);
    }

    #[tokio::test]
    async fn unknown_references_fail_the_row() {
        let inventory = inventory();
        let run = run(&inventory, ImportOptions::default());

        let row = Row::new()
            .with(columns::NAME, "a")
            .with(columns::ORGANIZATION, "Nowhere");
        assert!(matches!(
            run.process_row(&row).await,
            Err(ReconcileError::UnknownOrganization(_))
        ));

        let row = Row::new()
            .with(columns::NAME, "a")
            .with(columns::ORGANIZATION, "ACME")
            .with(columns::ENVIRONMENT, "Prod");
        let err = run.process_row(&row).await.expect_err("unknown env");
        assert!(err.is_row_scoped());
        assert!(err.to_string().contains("lifecycle environment 'Prod'"));

        let row = Row::new()
            .with(columns::NAME, "guest")
            .with(columns::ORGANIZATION, "ACME")
            .with(columns::VIRTUAL, "Yes")
            .with(columns::GUEST_OF, "missing-hv");
        assert!(matches!(
            run.process_row(&row).await,
            Err(ReconcileError::HypervisorNotFound { .. })
        ));
        assert!(inventory.host_named(1, "guest").await.is_none());
    }

    #[tokio::test]
    async fn organization_filter_skips_rows() {
        let inventory = inventory();
        let run = run(
            &inventory,
            ImportOptions {
                organization: Some("Other".into()),
                ..Default::default()
            },
        );
        let row = Row::new()
            .with(columns::NAME, "a")
            .with(columns::ORGANIZATION, "ACME");
        let outcome = run.process_row(&row).await.expect("row");
        assert!(outcome.skipped);
        assert!(inventory.calls().await.is_empty());
    }

    #[tokio::test]
    async fn summary_counts_outcomes() {
        let mut summary = ImportSummary::new(Uuid::new_v4());
        summary.record(&RowOutcome {
            skipped: false,
            hosts: vec![HostOutcome {
                name: "a".into(),
                host_id: 1,
                action: HostAction::Created,
                facts_written: false,
                subscriptions: None,
            }],
        });
        summary.record(&RowOutcome {
            skipped: true,
            hosts: Vec::new(),
        });
        summary.record_failure();
        summary.finish(FinalizeReport {
            hypervisors_updated: 2,
        });
        assert_eq!(
            summary.to_string(),
            "rows=3 created=1 updated=0 subscriptions_updated=0 skipped=1 failed=1 hypervisors_updated=2"
        );
        assert!(summary.finished_at.is_some());
    }
}
