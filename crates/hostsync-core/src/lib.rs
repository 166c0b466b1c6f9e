//! Core domain model and row rules for hostsync.

use std::collections::BTreeMap;
use std::num::ParseIntError;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub type EntityId = u64;

/// Live machine facts keyed by dotted path (`cpu.cpu_socket(s)`, `virt.is_guest`, ...).
pub type FactMap = BTreeMap<String, JsonValue>;

/// Column names understood by the import and export paths.
pub mod columns {
    pub const NAME: &str = "Name";
    pub const COUNT: &str = "Count";
    pub const SEARCH: &str = "Search";
    pub const ORGANIZATION: &str = "Organization";
    pub const ENVIRONMENT: &str = "Environment";
    pub const CONTENT_VIEW: &str = "Content View";
    pub const HOST_COLLECTIONS: &str = "Host Collections";
    pub const VIRTUAL: &str = "Virtual";
    /// Deprecated spelling of [`GUEST_OF`].
    pub const HOST: &str = "Host";
    pub const GUEST_OF: &str = "Guest of Host";
    pub const OPERATING_SYSTEM: &str = "OS";
    pub const ARCHITECTURE: &str = "Arch";
    pub const SOCKETS: &str = "Sockets";
    pub const RAM: &str = "RAM";
    pub const CORES: &str = "Cores";
    pub const SLA: &str = "SLA";
    pub const PRODUCTS: &str = "Products";
    pub const SUBSCRIPTIONS: &str = "Subscriptions";

    pub const SUBS_NAME: &str = "Subscription Name";
    pub const SUBS_TYPE: &str = "Subscription Type";
    pub const SUBS_QUANTITY: &str = "Subscription Quantity";
    pub const SUBS_SKU: &str = "Subscription SKU";
    pub const SUBS_CONTRACT: &str = "Subscription Contract";
    pub const SUBS_ACCOUNT: &str = "Subscription Account";
    pub const SUBS_START: &str = "Subscription Start";
    pub const SUBS_END: &str = "Subscription End";
    pub const SUBS_GUEST_OF: &str = "Subscription Guest";

    pub const YES: &str = "Yes";
    pub const NO: &str = "No";

    pub const SHARED: [&str; 14] = [
        NAME,
        ORGANIZATION,
        ENVIRONMENT,
        CONTENT_VIEW,
        HOST_COLLECTIONS,
        VIRTUAL,
        GUEST_OF,
        OPERATING_SYSTEM,
        ARCHITECTURE,
        SOCKETS,
        RAM,
        CORES,
        SLA,
        PRODUCTS,
    ];

    pub const ITEMIZED_SUBSCRIPTION: [&str; 9] = [
        SUBS_NAME,
        SUBS_TYPE,
        SUBS_QUANTITY,
        SUBS_SKU,
        SUBS_CONTRACT,
        SUBS_ACCOUNT,
        SUBS_START,
        SUBS_END,
        SUBS_GUEST_OF,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// `{id, name}` reference embedded in remote records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentFacet {
    #[serde(default)]
    pub lifecycle_environment: Option<NamedRef>,
    #[serde(default)]
    pub content_view: Option<NamedRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub host_collections: Vec<NamedRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledProduct {
    #[serde(alias = "productId", deserialize_with = "string_or_number")]
    pub product_id: String,
    #[serde(default, alias = "productName")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFacet {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub installed_products: Vec<InstalledProduct>,
    #[serde(default)]
    pub service_level: Option<String>,
    #[serde(default)]
    pub virtual_host: Option<NamedRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub virtual_guests: Vec<NamedRef>,
    #[serde(default)]
    pub autoheal: Option<bool>,
}

/// Remote content host. Only the fields the engine reads are typed; the full
/// response tree is kept in `raw` for custom column extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub organization_id: Option<EntityId>,
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub content_facet_attributes: Option<ContentFacet>,
    #[serde(default)]
    pub subscription_facet_attributes: Option<SubscriptionFacet>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub facts: FactMap,
    #[serde(skip)]
    pub raw: JsonValue,
}

impl Host {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        let mut host: Host = serde_json::from_value(value.clone())?;
        host.raw = value;
        Ok(host)
    }

    /// Registered content hosts are the ones carrying a subscription facet.
    pub fn is_content_host(&self) -> bool {
        self.subscription_facet_attributes.is_some()
    }

    pub fn is_hypervisor(&self) -> bool {
        self.subscription_facet_attributes
            .as_ref()
            .map(|facet| !facet.virtual_guests.is_empty())
            .unwrap_or(false)
    }

    pub fn fact(&self, key: &str) -> Option<String> {
        self.facts.get(key).and_then(render_value)
    }
}

/// One page of a host listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostPage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub subtotal: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub results: Vec<JsonValue>,
}

impl HostPage {
    /// Count of hosts matching the listing's search, falling back to the unfiltered total.
    pub fn matched_total(&self) -> u64 {
        self.subtotal.unwrap_or(self.total)
    }

    pub fn hosts(&self) -> Result<Vec<Host>, serde_json::Error> {
        self.results.iter().cloned().map(Host::from_value).collect()
    }
}

pub const UNMAPPED_GUEST: &str = "UNMAPPED_GUEST";

/// Remote subscription pool or host attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: EntityId,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub available: Option<i64>,
    #[serde(default)]
    pub quantity_consumed: Option<u64>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub contract_number: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub account_number: Option<String>,
    #[serde(default)]
    pub support_level: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// Owning host for derived (guest) entitlements.
    #[serde(default)]
    pub host: Option<NamedRef>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl Entitlement {
    /// Product name, then subscription name, then the id. Never empty.
    pub fn display_name(&self) -> String {
        self.product_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.name.as_deref().filter(|s| !s.is_empty()))
            .map(ToString::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn is_custom(&self) -> bool {
        leading_integer(self.product_id.as_deref().unwrap_or_default()) != 0
    }

    pub fn is_temporary(&self) -> bool {
        self.kind.as_deref() == Some(UNMAPPED_GUEST)
    }

    /// `Red Hat`/`Custom`, then ` Guest` when derived, then ` Temporary` for unmapped guests.
    pub fn type_label(&self) -> String {
        let mut label = if self.is_custom() { "Custom" } else { "Red Hat" }.to_string();
        if self.host.is_some() {
            label.push_str(" Guest");
        }
        if self.is_temporary() {
            label.push_str(" Temporary");
        }
        label
    }

    pub fn owning_host_name(&self) -> Option<&str> {
        self.host.as_ref().map(|h| h.name.as_str())
    }
}

/// `{id, quantity}` pair used by attach/remove calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementQuantity {
    pub id: EntityId,
    pub quantity: u64,
}

/// A desired-state row: column name to cell value. Empty cells count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: BTreeMap<String, String>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    /// Non-empty cell value.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn has(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    /// Label used in diagnostics: `Search`, else `Name`, else `<unnamed>`.
    pub fn key(&self) -> String {
        self.get(columns::SEARCH)
            .or_else(|| self.get(columns::NAME))
            .unwrap_or("<unnamed>")
            .to_string()
    }

    pub fn is_virtual(&self) -> bool {
        self.get(columns::VIRTUAL) == Some(columns::YES)
    }

    /// Hypervisor name for a guest row; `Guest of Host` wins over the deprecated `Host`.
    pub fn hypervisor_reference(&self) -> Option<String> {
        self.get(columns::GUEST_OF)
            .or_else(|| self.get(columns::HOST))
            .map(|name| namify(name, 1, 1))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Attach quantity for a subscription cell: unset or `Automatic` means 0 (auto-attach).
pub fn resolve_quantity(raw: Option<&str>) -> Result<u64, ParseIntError> {
    match raw {
        None | Some("") | Some("Automatic") => Ok(0),
        Some(amount) => amount.trim().parse(),
    }
}

/// Repeat count for a row; unset means 1.
pub fn parse_count(raw: Option<&str>) -> Result<u32, ParseIntError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(1),
        Some(value) => value.parse(),
    }
}

/// Derive the name of repetition `number` (0-based) out of `count`.
///
/// A printf-style integer placeholder (`%d`, `%3d`, `%03d`) receives `number`.
/// Without a placeholder the 1-based index is appended, but only when `count > 1`.
pub fn namify(template: &str, number: u32, count: u32) -> String {
    if let Some(expanded) = expand_placeholder(template, number) {
        return expanded;
    }
    if count > 1 {
        format!("{template}{}", number + 1)
    } else {
        template.to_string()
    }
}

fn expand_placeholder(template: &str, number: u32) -> Option<String> {
    let start = template.find('%')?;
    let rest = &template[start + 1..];
    let zero_pad = rest.starts_with('0');
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let tail = rest[digits.len()..].strip_prefix('d')?;
    let width: usize = digits.parse().unwrap_or(0);
    let formatted = if zero_pad {
        format!("{number:0width$}")
    } else {
        format!("{number:width$}")
    };
    Some(format!("{}{formatted}{tail}", &template[..start]))
}

/// Split a combined OS cell into `(distribution name, version)`.
///
/// `"CentOS 7"` splits on the first space; a value with no space is a RHEL version.
pub fn os_name_version(operating_system: &str) -> (String, String) {
    match operating_system.split_once(' ') {
        Some((name, version)) => (name.to_string(), version.to_string()),
        None => ("RHEL".to_string(), operating_system.to_string()),
    }
}

/// Strip the `virt-who-` prefix and `-<org id>` suffix reported for hypervisors
/// registered by virt-who.
pub fn normalize_hypervisor_name(name: &str) -> &str {
    let Some(stripped) = name.strip_prefix("virt-who-") else {
        return name;
    };
    match stripped.rsplit_once('-') {
        Some((base, suffix))
            if !base.is_empty()
                && !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => stripped,
    }
}

/// Integer value of the leading digits, 0 when there are none (`"RH00001"` -> 0).
pub fn leading_integer(value: &str) -> i64 {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Walk `path` through mappings (and sequences, by numeric index).
/// Returns `None` as soon as a step is absent or not traversable.
pub fn dig<'a, S: AsRef<str>>(value: &'a JsonValue, path: &[S]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |location, key| {
        let key = key.as_ref();
        match location {
            JsonValue::Object(map) => map.get(key),
            JsonValue::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}

/// Cell text for a JSON value; `null` renders as unset.
pub fn render_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantity_defaults_to_auto_attach() {
        assert_eq!(resolve_quantity(None), Ok(0));
        assert_eq!(resolve_quantity(Some("")), Ok(0));
        assert_eq!(resolve_quantity(Some("Automatic")), Ok(0));
        assert_eq!(resolve_quantity(Some("5")), Ok(5));
        assert!(resolve_quantity(Some("automatic")).is_err());
        assert!(resolve_quantity(Some("five")).is_err());
    }

    #[test]
    fn count_defaults_to_one() {
        assert_eq!(parse_count(None), Ok(1));
        assert_eq!(parse_count(Some("")), Ok(1));
        assert_eq!(parse_count(Some("3")), Ok(3));
        assert!(parse_count(Some("x")).is_err());
    }

    #[test]
    fn namify_expands_placeholders_and_appends_index() {
        assert_eq!(namify("host%03d", 4, 10), "host004");
        assert_eq!(namify("host%d.example.com", 2, 3), "host2.example.com");
        assert_eq!(namify("web", 0, 1), "web");
        assert_eq!(namify("web", 0, 3), "web1");
        assert_eq!(namify("web", 2, 3), "web3");
        assert_eq!(namify("100%", 0, 1), "100%");
    }

    #[test]
    fn os_split_rule() {
        assert_eq!(
            os_name_version("CentOS 7"),
            ("CentOS".to_string(), "7".to_string())
        );
        assert_eq!(
            os_name_version("7Server"),
            ("RHEL".to_string(), "7Server".to_string())
        );
        assert_eq!(
            os_name_version("Red Hat 7.2"),
            ("Red".to_string(), "Hat 7.2".to_string())
        );
    }

    #[test]
    fn hypervisor_reference_prefers_current_column() {
        let row = Row::new()
            .with(columns::HOST, "old-hv")
            .with(columns::GUEST_OF, "hv%02d");
        assert_eq!(row.hypervisor_reference().as_deref(), Some("hv01"));

        let row = Row::new().with(columns::HOST, "old-hv").with(columns::GUEST_OF, "");
        assert_eq!(row.hypervisor_reference().as_deref(), Some("old-hv"));

        assert_eq!(Row::new().hypervisor_reference(), None);
    }

    #[test]
    fn virt_who_names_are_normalized() {
        assert_eq!(normalize_hypervisor_name("virt-who-esx01-3"), "esx01");
        assert_eq!(normalize_hypervisor_name("virt-who-esx-a"), "esx-a");
        assert_eq!(normalize_hypervisor_name("esx01"), "esx01");
    }

    #[test]
    fn entitlement_type_labels() {
        let mut ent = Entitlement {
            id: 7,
            product_id: Some("RH00001".into()),
            ..Default::default()
        };
        assert_eq!(ent.type_label(), "Red Hat");
        ent.host = Some(NamedRef { id: 1, name: "hv".into() });
        ent.kind = Some(UNMAPPED_GUEST.into());
        assert_eq!(ent.type_label(), "Red Hat Guest Temporary");

        let custom = Entitlement {
            id: 8,
            product_id: Some("1445962342567".into()),
            ..Default::default()
        };
        assert_eq!(custom.type_label(), "Custom");
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let ent = Entitlement {
            id: 42,
            product_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(ent.display_name(), "42");
        let named = Entitlement {
            id: 42,
            name: Some("Pool".into()),
            ..Default::default()
        };
        assert_eq!(named.display_name(), "Pool");
    }

    #[test]
    fn dig_short_circuits_on_missing_or_scalar_steps() {
        let tree = json!({
            "subscription_facet_attributes": {"uuid": "abc", "virtual_guests": [{"name": "g1"}]},
            "name": "h1"
        });
        assert_eq!(
            dig(&tree, &["subscription_facet_attributes", "uuid"]),
            Some(&json!("abc"))
        );
        assert_eq!(
            dig(&tree, &["subscription_facet_attributes", "virtual_guests", "0", "name"]),
            Some(&json!("g1"))
        );
        assert_eq!(dig(&tree, &["name", "first"]), None);
        assert_eq!(dig(&tree, &["missing", "uuid"]), None);
    }

    #[test]
    fn host_decodes_loose_records() {
        let host = Host::from_value(json!({
            "id": 5,
            "name": "h1",
            "extra": {"ignored": true},
            "facts": null,
            "subscription_facet_attributes": {
                "uuid": "u-1",
                "installed_products": [{"productId": 69, "productName": "RHEL Server"}],
                "virtual_guests": null
            }
        }))
        .expect("host");
        assert!(host.is_content_host());
        assert!(!host.is_hypervisor());
        assert!(host.facts.is_empty());
        let facet = host.subscription_facet_attributes.as_ref().expect("facet");
        assert_eq!(facet.installed_products[0].product_id, "69");
        assert_eq!(host.raw["extra"]["ignored"], json!(true));
    }
}
