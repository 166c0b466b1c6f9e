//! Row <-> remote attribute projection.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use hostsync_core::{
    columns, dig, os_name_version, render_value, Entitlement, FactMap, Host, InstalledProduct,
    Row,
};
use serde_json::json;

use crate::config::CustomColumn;
use crate::matcher::{csv_join, csv_split};
use crate::ReconcileError;

pub const CERTIFICATE_VERSION: &str = "3.2";

/// Overlay the row's explicitly supplied fields onto `base`.
///
/// Blank cells never clear an existing fact. `cpu.cpu(s)` and
/// `cpu.core(s)_per_socket` both default to 1 when absent.
pub fn derive_facts(name: &str, organization: &str, row: &Row, mut base: FactMap) -> FactMap {
    base.entry("system.certificate_version".to_string())
        .or_insert_with(|| json!(CERTIFICATE_VERSION));
    base.insert("network.hostname".to_string(), json!(name));

    let direct = [
        (columns::CORES, "cpu.core(s)_per_socket"),
        (columns::SOCKETS, "cpu.cpu_socket(s)"),
        (columns::RAM, "memory.memtotal"),
        (columns::ARCHITECTURE, "uname.machine"),
    ];
    for (column, fact) in direct {
        if let Some(value) = row.get(column) {
            base.insert(fact.to_string(), json!(value));
        }
    }

    if let Some(os) = row.get(columns::OPERATING_SYSTEM) {
        let (distribution, version) = os_name_version(os);
        base.insert("distribution.name".to_string(), json!(distribution));
        base.insert("distribution.version".to_string(), json!(version));
    }

    if row.has(columns::VIRTUAL) {
        let guest = row.is_virtual();
        base.insert("virt.is_guest".to_string(), json!(guest));
        if guest {
            base.entry("virt.uuid".to_string())
                .or_insert_with(|| json!(format!("{organization}/{name}")));
        }
    }

    base.entry("cpu.cpu(s)".to_string()).or_insert_with(|| json!(1));
    base.entry("cpu.core(s)_per_socket".to_string())
        .or_insert_with(|| json!(1));
    base
}

/// `Products` cell (`sku|name,sku|name`) as installed products; `None` when unset.
pub fn installed_products(row: &Row) -> Result<Option<Vec<InstalledProduct>>, ReconcileError> {
    let Some(cell) = row.get(columns::PRODUCTS) else {
        return Ok(None);
    };
    let version = row
        .get(columns::OPERATING_SYSTEM)
        .map(|os| os_name_version(os).1);
    let arch = row.get(columns::ARCHITECTURE).map(ToString::to_string);

    csv_split(cell, columns::PRODUCTS)?
        .into_iter()
        .map(|entry| {
            let (sku, name) = match entry.split_once('|') {
                Some((sku, name)) => (sku.to_string(), Some(name.to_string())),
                None => (entry.clone(), None),
            };
            if sku.is_empty() {
                return Err(ReconcileError::Malformed {
                    column: columns::PRODUCTS,
                    value: entry,
                    reason: "missing product id".to_string(),
                });
            }
            Ok(InstalledProduct {
                product_id: sku,
                product_name: name,
                arch: arch.clone(),
                version: version.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Export cell values keyed by column name; `None` renders as an empty cell.
pub type ColumnValues = HashMap<String, Option<String>>;

pub fn shared_columns(host: &Host) -> Result<ColumnValues, ReconcileError> {
    let content = host.content_facet_attributes.as_ref();
    let subscription = host.subscription_facet_attributes.as_ref();

    let environment = content
        .and_then(|facet| facet.lifecycle_environment.as_ref())
        .map(|env| env.name.clone());
    let content_view = content
        .and_then(|facet| facet.content_view.as_ref())
        .map(|cv| cv.name.clone());
    let host_collections = content
        .map(|facet| {
            csv_join(
                facet.host_collections.iter().map(|collection| &collection.name),
                columns::HOST_COLLECTIONS,
            )
        })
        .transpose()?;
    let guest_of = subscription
        .and_then(|facet| facet.virtual_host.as_ref())
        .map(|hv| hv.name.clone());
    let products = subscription
        .map(|facet| {
            csv_join(
                facet.installed_products.iter().map(|product| {
                    format!(
                        "{}|{}",
                        product.product_id,
                        product.product_name.as_deref().unwrap_or_default()
                    )
                }),
                columns::PRODUCTS,
            )
        })
        .transpose()?;

    let virtual_flag = if host.fact("virt::is_guest").as_deref() == Some("true") {
        columns::YES
    } else {
        columns::NO
    };
    let operating_system = match (
        host.fact("distribution::name"),
        host.fact("distribution::version"),
    ) {
        (Some(name), Some(version)) => Some(format!("{name} {version}")),
        (name, version) => name.or(version),
    };

    Ok([
        (columns::NAME, Some(host.name.clone())),
        (columns::ORGANIZATION, host.organization_name.clone()),
        (columns::ENVIRONMENT, environment),
        (columns::CONTENT_VIEW, content_view),
        (columns::HOST_COLLECTIONS, host_collections),
        (columns::VIRTUAL, Some(virtual_flag.to_string())),
        (columns::GUEST_OF, guest_of),
        (columns::OPERATING_SYSTEM, operating_system),
        (columns::ARCHITECTURE, host.fact("uname::machine")),
        (columns::SOCKETS, host.fact("cpu::cpu_socket(s)")),
        (columns::RAM, host.fact("memory::memtotal")),
        (
            columns::CORES,
            Some(host.fact("cpu::core(s)_per_socket").unwrap_or_else(|| "1".to_string())),
        ),
        (
            columns::SLA,
            subscription.and_then(|facet| facet.service_level.clone()),
        ),
        (columns::PRODUCTS, products),
    ]
    .into_iter()
    .map(|(column, value)| (column.to_string(), value))
    .collect())
}

pub fn custom_columns(host: &Host, definitions: &[CustomColumn], values: &mut ColumnValues) {
    for definition in definitions {
        let value = dig(&host.raw, &definition.json).and_then(render_value);
        values.insert(definition.name.clone(), value);
    }
}

/// Itemized subscription cells; `None` yields the empty "no subscriptions" row.
pub fn itemized_columns(entitlement: Option<&Entitlement>, values: &mut ColumnValues) {
    for column in columns::ITEMIZED_SUBSCRIPTION {
        values.insert(column.to_string(), None);
    }
    let Some(entitlement) = entitlement else {
        return;
    };
    let cells = [
        (columns::SUBS_NAME, entitlement.product_name.clone()),
        (columns::SUBS_TYPE, Some(entitlement.type_label())),
        (
            columns::SUBS_QUANTITY,
            entitlement.quantity_consumed.map(|q| q.to_string()),
        ),
        (columns::SUBS_SKU, entitlement.product_id.clone()),
        (columns::SUBS_CONTRACT, entitlement.contract_number.clone()),
        (columns::SUBS_ACCOUNT, entitlement.account_number.clone()),
        (
            columns::SUBS_START,
            entitlement.start_date.as_deref().map(export_date),
        ),
        (
            columns::SUBS_END,
            entitlement.end_date.as_deref().map(export_date),
        ),
        (
            columns::SUBS_GUEST_OF,
            entitlement.owning_host_name().map(ToString::to_string),
        ),
    ];
    for (column, value) in cells {
        values.insert(column.to_string(), value);
    }
}

/// `MM/DD/YYYY`; unparseable dates pass through unchanged.
pub fn export_date(raw: &str) -> String {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.format("%m/%d/%Y").to_string();
    }
    raw.get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
        .map(|day| day.format("%m/%d/%Y").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Render one output record in `columns` order.
pub fn project_row(columns: &[String], values: &ColumnValues) -> Vec<String> {
    columns
        .iter()
        .map(|column| values.get(column).cloned().flatten().unwrap_or_default())
        .collect()
}
