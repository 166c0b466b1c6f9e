//! Subscription matching: already-attached checks and pool acquisition.

use csv::{ReaderBuilder, Terminator, WriterBuilder};
use hostsync_core::{
    columns, normalize_hypervisor_name, resolve_quantity, EntityId, Entitlement, Row,
};
use hostsync_inventory::{EntitlementQuery, EntitlementScope, InventoryService};
use tracing::debug;

use crate::ReconcileError;

/// Desired subscription, as described by an itemized row or an aggregate entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionCriteria {
    pub sku: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub account: Option<String>,
    pub contract: Option<String>,
    /// Raw quantity cell; see [`resolve_quantity`].
    pub quantity: Option<String>,
    /// Owning hypervisor name, already normalized.
    pub hypervisor: Option<String>,
    pub sla: Option<String>,
}

fn owned(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(ToString::to_string)
}

impl SubscriptionCriteria {
    pub fn from_itemized_row(row: &Row) -> Self {
        Self {
            sku: owned(row.get(columns::SUBS_SKU)),
            name: owned(row.get(columns::SUBS_NAME)),
            kind: owned(row.get(columns::SUBS_TYPE)),
            account: owned(row.get(columns::SUBS_ACCOUNT)),
            contract: owned(row.get(columns::SUBS_CONTRACT)),
            quantity: owned(row.get(columns::SUBS_QUANTITY)),
            hypervisor: row
                .get(columns::SUBS_GUEST_OF)
                .map(|name| normalize_hypervisor_name(name).to_string()),
            sla: owned(row.get(columns::SLA)),
        }
    }

    pub fn from_line(line: &SubscriptionLine, hypervisor: Option<&str>, sla: Option<&str>) -> Self {
        Self {
            sku: line.sku.clone(),
            name: line.name.clone(),
            kind: None,
            account: line.account.clone(),
            contract: line.contract.clone(),
            quantity: line.quantity.clone(),
            hypervisor: owned(hypervisor).map(|name| normalize_hypervisor_name(&name).to_string()),
            sla: owned(sla),
        }
    }

    pub fn resolved_quantity(&self) -> Result<u64, ReconcileError> {
        resolve_quantity(self.quantity.as_deref()).map_err(ReconcileError::invalid_number(
            columns::SUBS_QUANTITY,
            self.quantity.as_deref(),
        ))
    }

    pub fn to_query(&self, host_id: Option<EntityId>) -> Result<EntitlementQuery, ReconcileError> {
        let quantity = self.resolved_quantity()?;
        Ok(EntitlementQuery {
            host_id,
            sku: self.sku.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            account: self.account.clone(),
            contract: self.contract.clone(),
            quantity: (quantity > 0).then_some(quantity),
            hypervisor: self.hypervisor.clone(),
            sla: self.sla.clone(),
        })
    }

    /// `sku=RH00004, name=...` for diagnostics.
    pub fn describe(&self) -> String {
        let parts = [
            ("sku", &self.sku),
            ("name", &self.name),
            ("type", &self.kind),
            ("contract", &self.contract),
            ("account", &self.account),
            ("quantity", &self.quantity),
            ("hypervisor", &self.hypervisor),
            ("sla", &self.sla),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.as_deref().map(|v| format!("{label}={v}")))
        .collect::<Vec<_>>();
        if parts.is_empty() {
            "any subscription".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// First attached entitlement that already satisfies `criteria`.
///
/// SKU and name must match exactly when given, and the owning hypervisor must
/// agree, including both being absent.
pub fn match_attached<'a>(
    criteria: &SubscriptionCriteria,
    attached: &'a [Entitlement],
) -> Option<&'a Entitlement> {
    attached.iter().find(|entitlement| {
        let sku_ok = criteria
            .sku
            .as_deref()
            .map_or(true, |sku| entitlement.product_id.as_deref() == Some(sku));
        let name_ok = criteria.name.as_deref().map_or(true, |name| {
            entitlement.product_name.as_deref() == Some(name)
                || entitlement.name.as_deref() == Some(name)
        });
        let owner = entitlement.owning_host_name().map(normalize_hypervisor_name);
        sku_ok && name_ok && owner == criteria.hypervisor.as_deref()
    })
}

/// Search the organization's pools and take the first result in remote order.
pub async fn acquire(
    inventory: &dyn InventoryService,
    organization_id: EntityId,
    host_id: Option<EntityId>,
    criteria: &SubscriptionCriteria,
) -> Result<Entitlement, ReconcileError> {
    let query = criteria.to_query(host_id)?;
    let found = inventory
        .list_entitlements(EntitlementScope::Organization(organization_id), &query)
        .await?;
    debug!(candidates = found.len(), criteria = %criteria.describe(), "subscription search");
    found
        .into_iter()
        .next()
        .ok_or_else(|| ReconcileError::NoMatchingSubscription {
            criteria: criteria.describe(),
        })
}

/// One `quantity|sku|name|contract|account` entry of the aggregate column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionLine {
    pub quantity: Option<String>,
    pub sku: Option<String>,
    pub name: Option<String>,
    pub contract: Option<String>,
    pub account: Option<String>,
}

impl SubscriptionLine {
    pub fn parse(entry: &str) -> Result<Self, ReconcileError> {
        let parts = entry.split('|').collect::<Vec<_>>();
        if parts.len() < 5 {
            return Err(ReconcileError::Malformed {
                column: columns::SUBSCRIPTIONS,
                value: entry.to_string(),
                reason: "expected quantity|sku|name|contract|account".to_string(),
            });
        }
        let last = parts.len() - 1;
        // A '|' inside the subscription name splits it across the middle fields.
        let name = parts[2..last - 1].join("|");
        Ok(Self {
            quantity: owned(Some(parts[0].trim())),
            sku: owned(Some(parts[1])),
            name: owned(Some(&name)),
            contract: owned(Some(parts[last - 1])),
            account: owned(Some(parts[last])),
        })
    }

    pub fn from_entitlement(entitlement: &Entitlement) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            entitlement.quantity_consumed.map(|q| q.to_string()).unwrap_or_default(),
            entitlement.product_id.as_deref().unwrap_or_default(),
            entitlement.product_name.as_deref().unwrap_or_default(),
            entitlement.contract_number.as_deref().unwrap_or_default(),
            entitlement.account_number.as_deref().unwrap_or_default(),
        )
    }
}

/// Split a comma-separated cell, honouring CSV quoting; blank entries are dropped.
pub fn csv_split(cell: &str, column: &'static str) -> Result<Vec<String>, ReconcileError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(cell.as_bytes());
    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ReconcileError::Malformed {
            column,
            value: cell.to_string(),
            reason: err.to_string(),
        })?;
        entries.extend(
            record
                .iter()
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(ToString::to_string),
        );
    }
    Ok(entries)
}

/// Join entries into one CSV line, quoting where needed.
pub fn csv_join<I, S>(entries: I, column: &'static str) -> Result<String, ReconcileError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let entries = entries
        .into_iter()
        .map(|entry| entry.as_ref().to_string())
        .collect::<Vec<_>>();
    if entries.is_empty() {
        return Ok(String::new());
    }
    let malformed = |reason: String| ReconcileError::Malformed {
        column,
        value: entries.join(","),
        reason,
    };
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(&entries)
        .map_err(|err| malformed(err.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|err| malformed(err.to_string()))?;
    let line = String::from_utf8(bytes).map_err(|err| malformed(err.to_string()))?;
    Ok(line.trim_end_matches('\n').to_string())
}

pub fn parse_subscription_field(cell: &str) -> Result<Vec<SubscriptionLine>, ReconcileError> {
    csv_split(cell, columns::SUBSCRIPTIONS)?
        .iter()
        .map(|entry| SubscriptionLine::parse(entry))
        .collect()
}

pub fn format_subscription_field(attached: &[Entitlement]) -> Result<String, ReconcileError> {
    csv_join(
        attached.iter().map(SubscriptionLine::from_entitlement),
        columns::SUBSCRIPTIONS,
    )
}
