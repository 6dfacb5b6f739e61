//! ConfigMap payload parsing
//!
//! The `bindings` data key holds YAML mapping binding names to a role and a
//! list of users:
//!
//! ```yaml
//! admins:
//!   roleName: cluster-admin
//!   defaultUserType: subAccountId
//!   users:
//!     - type: email
//!       value: a@x.com
//!     - value: "100000000001"
//! ```
//!
//! A user without `type` takes the binding's `defaultUserType`, else the
//! ConfigMap-wide `defaultUserType` data key.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::{Deserialize, Deserializer};

use crate::binding::{DesiredBinding, UserIdentifier};
use crate::{Error, Result};

/// Data key holding the bindings YAML
pub const BINDINGS_KEY: &str = "bindings";

/// Data key holding the ConfigMap-wide default identifier type
pub const DEFAULT_USER_TYPE_KEY: &str = "defaultUserType";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BindingEntry {
    role_name: String,
    #[serde(default)]
    default_user_type: Option<String>,
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UserEntry {
    #[serde(rename = "type", default)]
    value_type: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    value: String,
}

/// Accept unquoted numeric ids as well as strings
fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar value, found {other:?}"
        ))),
    }
}

/// `namespace/name` of a ConfigMap, used in logs and errors
pub fn source_name(cm: &ConfigMap) -> String {
    format!(
        "{}/{}",
        cm.namespace().unwrap_or_default(),
        cm.name_any()
    )
}

/// Parse the bindings declared by one ConfigMap
///
/// Fails when the `bindings` key is missing, when its YAML does not match the
/// schema, or when an entry is missing its role or a user's type cannot be
/// determined. Bindings come back ordered by name.
pub fn parse_config_map(cm: &ConfigMap) -> Result<Vec<DesiredBinding>> {
    let source = source_name(cm);
    let data = cm.data.as_ref();

    let raw = data
        .and_then(|d| d.get(BINDINGS_KEY))
        .ok_or_else(|| Error::parse(&source, format!("missing data key {BINDINGS_KEY}")))?;
    let config_default = data
        .and_then(|d| d.get(DEFAULT_USER_TYPE_KEY))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty());

    let entries: BTreeMap<String, BindingEntry> = serde_yaml::from_str(raw)
        .map_err(|e| Error::parse(&source, format!("invalid {BINDINGS_KEY}: {e}")))?;

    entries
        .into_iter()
        .map(|(name, entry)| to_desired(&source, name, entry, config_default))
        .collect()
}

fn to_desired(
    source: &str,
    binding_name: String,
    entry: BindingEntry,
    config_default: Option<&str>,
) -> Result<DesiredBinding> {
    if binding_name.trim().is_empty() {
        return Err(Error::parse(source, "binding name must not be empty"));
    }
    if entry.role_name.trim().is_empty() {
        return Err(Error::parse(
            source,
            format!("binding {binding_name} has an empty roleName"),
        ));
    }

    let default_type = entry
        .default_user_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(config_default);

    let users = entry
        .users
        .into_iter()
        .map(|user| {
            if user.value.trim().is_empty() {
                return Err(Error::parse(
                    source,
                    format!("binding {binding_name} has a user with an empty value"),
                ));
            }
            let value_type = user
                .value_type
                .filter(|t| !t.is_empty())
                .or_else(|| default_type.map(str::to_string))
                .ok_or_else(|| {
                    Error::parse(
                        source,
                        format!(
                            "user {} in binding {binding_name} has no type and no {DEFAULT_USER_TYPE_KEY}",
                            user.value
                        ),
                    )
                })?;
            Ok(UserIdentifier::new(value_type, user.value))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(DesiredBinding {
        binding_name,
        role_name: entry.role_name,
        users,
        source: source.to_string(),
    })
}

/// Parse a ConfigMap manifest (YAML) and the bindings it declares
pub fn parse_manifest(manifest: &str) -> Result<Vec<DesiredBinding>> {
    let cm: ConfigMap = serde_yaml::from_str(manifest)
        .map_err(|e| Error::serialization(format!("not a ConfigMap manifest: {e}")))?;
    parse_config_map(&cm)
}
