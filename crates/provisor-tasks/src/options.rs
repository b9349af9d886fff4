//! Flattening a service into the string map sent with `CreateService`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::store::ServiceRecord;

/// Build the `options` map for a service.
///
/// Sources are applied in order and later ones overwrite earlier keys:
/// config selection, assigned IP (`ip_address`, `gateway`, `netmask`),
/// plugin `region` and `node_id`, then plugin extra options.
#[must_use]
pub fn flatten_options(service: &ServiceRecord) -> BTreeMap<String, String> {
    let mut options: BTreeMap<String, String> = service
        .config_selection
        .iter()
        .map(|(k, v)| (k.clone(), stringify_value(v)))
        .collect();

    if let Some(ip) = &service.ip {
        options.insert("ip_address".to_owned(), ip.address.clone());
        options.insert("gateway".to_owned(), ip.gateway.clone());
        options.insert("netmask".to_owned(), ip.netmask.clone());
    }

    if let Some(settings) = &service.plugin_settings {
        if let Some(region) = &settings.region {
            options.insert("region".to_owned(), region.clone());
        }
        if let Some(node_id) = &settings.node_id {
            options.insert("node_id".to_owned(), node_id.clone());
        }
        options.extend(
            settings
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    options
}

/// Render a JSON value as an option string.
///
/// Strings pass through, booleans become `true`/`false`, numbers use their
/// canonical decimal form, `null` becomes empty and arrays or objects are
/// JSON-encoded.
#[must_use]
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
