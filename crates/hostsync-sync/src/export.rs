//! Export walker: live content hosts flattened into rows, hypervisors first.

use std::collections::HashSet;
use std::sync::Arc;

use hostsync_core::{columns, Entitlement, Host};
use hostsync_inventory::{EntitlementQuery, EntitlementScope, InventoryService};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ExportOptions;
use crate::index::list_all_hosts;
use crate::matcher::format_subscription_field;
use crate::projector::{custom_columns, itemized_columns, project_row, shared_columns};
use crate::ReconcileError;

const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// One message per distinct unrecognized column.
    pub warnings: Vec<String>,
    pub hosts: usize,
}

pub struct ExportWalker {
    inventory: Arc<dyn InventoryService>,
    options: ExportOptions,
}

impl ExportWalker {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        options: ExportOptions,
    ) -> Result<Self, ReconcileError> {
        options.validate()?;
        Ok(Self { inventory, options })
    }

    /// Explicit columns, else the settings' export list, else the defaults for the mode.
    pub fn columns(&self) -> Vec<String> {
        if let Some(columns) = self
            .options
            .columns
            .as_ref()
            .or(self.options.settings_columns.as_ref())
        {
            return columns.clone();
        }
        let mut defaults = columns::SHARED.iter().map(ToString::to_string).collect::<Vec<_>>();
        if self.options.itemized_subscriptions {
            defaults.extend(columns::ITEMIZED_SUBSCRIPTION.iter().map(ToString::to_string));
        } else {
            defaults.push(columns::SUBSCRIPTIONS.to_string());
        }
        defaults
    }

    fn known_columns(&self) -> Vec<&str> {
        let mut known = columns::SHARED.to_vec();
        if self.options.itemized_subscriptions {
            known.extend(columns::ITEMIZED_SUBSCRIPTION);
        } else {
            known.push(columns::SUBSCRIPTIONS);
        }
        known.extend(self.options.custom_columns.iter().map(|c| c.name.as_str()));
        known
    }

    /// Warnings for requested columns nothing will fill, each logged once.
    pub fn unmatched_warnings(&self, requested: &[String]) -> Vec<String> {
        let known = self.known_columns();
        let mut seen = HashSet::new();
        let mut warnings = Vec::new();
        for column in requested {
            if known.contains(&column.as_str()) || !seen.insert(column.as_str()) {
                continue;
            }
            let mut message = format!(
                "column '{column}' does not match any field, be sure to check spelling"
            );
            if let Some(suggestion) = closest(column, &known) {
                message.push_str(&format!(" (did you mean '{suggestion}'?)"));
            }
            warn!("{message}");
            warnings.push(message);
        }
        warnings
    }

    /// Every content host of the selected organizations, split into
    /// `(hypervisors, others)`.
    pub async fn collect_hosts(&self) -> Result<(Vec<Host>, Vec<Host>), ReconcileError> {
        let mut hypervisors = Vec::new();
        let mut others = Vec::new();
        for organization in self.inventory.list_organizations().await? {
            if let Some(filter) = self.options.organization.as_deref() {
                if organization.name != filter {
                    continue;
                }
            }
            let listed = list_all_hosts(
                self.inventory.as_ref(),
                organization.id,
                self.options.search.as_deref(),
            )
            .await?;
            debug!(organization = %organization.name, hosts = listed.len(), "walking hosts");
            for summary in listed {
                let host = self.inventory.get_host(summary.id).await?;
                if !host.is_content_host() {
                    continue;
                }
                if host.is_hypervisor() {
                    hypervisors.push(host);
                } else {
                    others.push(host);
                }
            }
        }
        Ok((hypervisors, others))
    }

    pub async fn export(&self) -> Result<ExportTable, ReconcileError> {
        let span = info_span!("export", itemized = self.options.itemized_subscriptions);
        self.walk().instrument(span).await
    }

    async fn walk(&self) -> Result<ExportTable, ReconcileError> {
        let header = self.columns();
        let warnings = self.unmatched_warnings(&header);
        let wants_subscriptions = header.iter().any(|column| {
            column == columns::SUBSCRIPTIONS
                || columns::ITEMIZED_SUBSCRIPTION.contains(&column.as_str())
        });

        let (hypervisors, others) = self.collect_hosts().await?;
        let hosts = hypervisors.len() + others.len();
        let mut rows = Vec::with_capacity(hosts);
        for host in hypervisors.iter().chain(others.iter()) {
            let mut values = shared_columns(host)?;
            custom_columns(host, &self.options.custom_columns, &mut values);

            if self.options.itemized_subscriptions {
                let attached = self.attached(host).await?;
                if attached.is_empty() {
                    itemized_columns(None, &mut values);
                    rows.push(project_row(&header, &values));
                }
                for entitlement in &attached {
                    itemized_columns(Some(entitlement), &mut values);
                    rows.push(project_row(&header, &values));
                }
            } else {
                let field = if wants_subscriptions {
                    Some(format_subscription_field(&self.attached(host).await?)?)
                } else {
                    None
                };
                values.insert(columns::SUBSCRIPTIONS.to_string(), field);
                rows.push(project_row(&header, &values));
            }
        }
        info!(hosts, rows = rows.len(), "export complete");
        Ok(ExportTable {
            columns: header,
            rows,
            warnings,
            hosts,
        })
    }

    async fn attached(&self, host: &Host) -> Result<Vec<Entitlement>, ReconcileError> {
        Ok(self
            .inventory
            .list_entitlements(EntitlementScope::Host(host.id), &EntitlementQuery::default())
            .await?)
    }
}

fn closest<'a>(column: &str, known: &[&'a str]) -> Option<&'a str> {
    known
        .iter()
        .map(|candidate| (*candidate, strsim::jaro_winkler(column, candidate)))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomColumn;
    use hostsync_inventory::{InventoryFixture, MemoryInventory};
    use serde_json::json;

    fn walker(options: ExportOptions) -> ExportWalker {
        let inventory = MemoryInventory::new(InventoryFixture::default()).expect("inventory");
        ExportWalker::new(Arc::new(inventory), options).expect("walker")
    }

    #[test]
    fn default_columns_follow_mode() {
        let aggregate = walker(ExportOptions::default()).columns();
        assert_eq!(aggregate.len(), columns::SHARED.len() + 1);
        assert_eq!(aggregate.last().map(String::as_str), Some(columns::SUBSCRIPTIONS));

        let itemized = walker(ExportOptions {
            itemized_subscriptions: true,
            ..Default::default()
        })
        .columns();
        assert_eq!(itemized.last().map(String::as_str), Some(columns::SUBS_GUEST_OF));

        let explicit = walker(ExportOptions {
            columns: Some(vec!["Name".into()]),
            settings_columns: Some(vec!["Organization".into()]),
            ..Default::default()
        })
        .columns();
        assert_eq!(explicit, vec!["Name".to_string()]);
    }

    #[test]
    fn warnings_are_distinct_with_hints() {
        let walker = walker(ExportOptions {
            custom_columns: vec![CustomColumn {
                name: "UUID".into(),
                json: vec!["subscription_facet_attributes".into(), "uuid".into()],
            }],
            ..Default::default()
        });
        let requested = ["Name", "Organisation", "UUID", "Organisation", "Zzz"]
            .map(String::from)
            .to_vec();
        let warnings = walker.unmatched_warnings(&requested);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("did you mean 'Organization'"));
        assert!(!warnings[1].contains("did you mean"));
    }

    #[test]
    fn clear_subscriptions_is_rejected() {
        let inventory = MemoryInventory::new(InventoryFixture::default()).expect("inventory");
        let result = ExportWalker::new(
            Arc::new(inventory),
            ExportOptions {
                clear_subscriptions: true,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ReconcileError::Precondition(_))));
    }

    #[tokio::test]
    async fn subscriptions_are_only_fetched_when_requested() {
        let fixture: InventoryFixture = serde_json::from_value(json!({
            "organizations": [{"id": 1, "name": "ACME"}],
            "hosts": [{"id": 2, "name": "h", "organization_id": 1, "organization_name": "ACME",
                       "subscription_facet_attributes": {"uuid": "u"}}]
        }))
        .expect("fixture");
        let inventory = Arc::new(MemoryInventory::new(fixture).expect("inventory"));
        let walker = ExportWalker::new(
            inventory.clone(),
            ExportOptions {
                columns: Some(vec!["Name".into(), "Organization".into()]),
                ..Default::default()
            },
        )
        .expect("walker");

        let table = walker.export().await.expect("export");
        assert_eq!(table.rows, vec![vec!["h".to_string(), "ACME".to_string()]]);
        assert!(!inventory
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, hostsync_inventory::InventoryCall::ListEntitlements { .. })));
    }
}
