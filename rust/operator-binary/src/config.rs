//! Global, process-wide configuration, refreshed from the operator secret.
//!
//! Refreshed every tick from the operator secret. Never persisted to disk by
//! this operator: the `Secret` object already persists it in the
//! orchestrator, and that's the only copy of record.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{api::Api, Client, ResourceExt};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::credentials::PasswordConstraints;

pub const OPERATOR_SECRET_NAME: &str = "vcenter-operator";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read operator secret {name} in namespace {namespace}"))]
    ReadSecret {
        source: kube::Error,
        name: String,
        namespace: String,
    },
    #[snafu(display("operator secret is missing required key {key}"))]
    MissingKey { key: String },
    #[snafu(display("operator secret key {key} is not valid UTF-8"))]
    NotUtf8 { key: String },
    #[snafu(display("operator secret key {key} is not a valid integer"))]
    NotInteger { key: String },
    #[snafu(display(
        "password constraints are degenerate: length={length}, digits={digits}, symbols={symbols}"
    ))]
    DegeneratePasswordConstraints {
        length: u32,
        digits: u32,
        symbols: u32,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Parses and validates the length/digit/symbol policy enforced on generated
/// service-user passwords; all-zero is a hard startup error.
fn validated_password_constraints(length: u32, digits: u32, symbols: u32) -> Result<PasswordConstraints> {
    if length == 0 && digits == 0 && symbols == 0 {
        return DegeneratePasswordConstraintsSnafu {
            length,
            digits,
            symbols,
        }
        .fail();
    }
    Ok(PasswordConstraints {
        length: length as usize,
        digits: digits as usize,
        symbols: symbols as usize,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VaultSettings {
    pub url: String,
    pub mount_point_read: String,
    pub mount_point_write: String,
    pub role_id: String,
    pub secret_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdCredentials {
    pub username: String,
    pub password: String,
}

/// Process-wide config, refreshed each tick.
#[derive(Clone, Debug)]
pub struct GlobalConfig {
    pub domain: String,
    pub region: String,
    pub own_namespace: String,
    pub in_cluster: bool,
    pub master_password: String,
    pub vault: Option<VaultSettings>,
    pub ad_credentials: Option<AdCredentials>,
    pub manage_service_user_passwords: bool,
    pub max_time_not_seen: chrono::Duration,
    pub vault_check_interval: chrono::Duration,
    pub password_constraints: PasswordConstraints,
    /// Every remaining secret key, JSON-decoded where possible, else the raw
    /// string — these become template rendering options.
    pub extra: BTreeMap<String, Value>,
}

fn decode_key(data: &BTreeMap<String, k8s_openapi::ByteString>, key: &str) -> Result<String> {
    let bytes = data
        .get(key)
        .with_context(|| MissingKeySnafu { key })?
        .0
        .clone();
    String::from_utf8(bytes).ok().with_context(|| NotUtf8Snafu { key })
}

fn decode_optional(data: &BTreeMap<String, k8s_openapi::ByteString>, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
}

fn decode_u32(data: &BTreeMap<String, k8s_openapi::ByteString>, key: &str, default: u32) -> Result<u32> {
    match decode_optional(data, key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| NotIntegerSnafu { key }),
    }
}

impl GlobalConfig {
    /// Parses the operator secret's raw byte map into a `GlobalConfig`.
    pub fn from_secret_data(
        domain: String,
        region: String,
        own_namespace: String,
        in_cluster: bool,
        data: &BTreeMap<String, k8s_openapi::ByteString>,
    ) -> Result<Self> {
        let master_password = decode_key(data, "password")?;

        let manage_service_user_passwords = decode_optional(data, "manage_service_user_passwords")
            .map(|v| v == "true")
            .unwrap_or(false);

        let max_time_not_seen =
            chrono::Duration::seconds(decode_u32(data, "max_time_not_seen", 24 * 3600)? as i64);
        let vault_check_interval =
            chrono::Duration::seconds(decode_u32(data, "vault_check_interval", 300)? as i64);

        let password_constraints = validated_password_constraints(
            decode_u32(data, "password_length", 0)?,
            decode_u32(data, "password_digits", 0)?,
            decode_u32(data, "password_symbols", 0)?,
        )?;

        let vault = match (
            decode_optional(data, "vault_url"),
            decode_optional(data, "mount_point_read"),
            decode_optional(data, "mount_point_write"),
            decode_optional(data, "role_id"),
            decode_optional(data, "secret_id"),
        ) {
            (Some(url), Some(mount_point_read), Some(mount_point_write), Some(role_id), Some(secret_id)) => {
                Some(VaultSettings {
                    url,
                    mount_point_read,
                    mount_point_write,
                    role_id,
                    secret_id,
                })
            }
            _ => None,
        };

        let ad_credentials = match (
            decode_optional(data, "ad_ttu_username"),
            decode_optional(data, "ad_ttu_password"),
        ) {
            (Some(username), Some(password)) => Some(AdCredentials { username, password }),
            _ => None,
        };

        let reserved = [
            "password",
            "manage_service_user_passwords",
            "max_time_not_seen",
            "vault_check_interval",
            "password_length",
            "password_digits",
            "password_symbols",
            "vault_url",
            "mount_point_read",
            "mount_point_write",
            "role_id",
            "secret_id",
            "ad_ttu_username",
            "ad_ttu_password",
            "active_directory",
        ];

        let mut extra = BTreeMap::new();
        for (key, value) in data {
            if reserved.contains(&key.as_str()) {
                continue;
            }
            let Ok(raw) = String::from_utf8(value.0.clone()) else {
                continue;
            };
            let decoded = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
            extra.insert(key.clone(), decoded);
        }

        Ok(Self {
            domain,
            region,
            own_namespace,
            in_cluster,
            master_password,
            vault,
            ad_credentials,
            manage_service_user_passwords,
            max_time_not_seen,
            vault_check_interval,
            password_constraints,
            extra,
        })
    }

    /// Re-reads the operator secret from the orchestrator.
    pub async fn refresh(
        client: &Client,
        domain: String,
        region: String,
        own_namespace: String,
        in_cluster: bool,
    ) -> Result<Self> {
        let api: Api<Secret> = Api::namespaced(client.clone(), &own_namespace);
        let secret = api
            .get(OPERATOR_SECRET_NAME)
            .await
            .with_context(|_| ReadSecretSnafu {
                name: OPERATOR_SECRET_NAME.to_string(),
                namespace: own_namespace.clone(),
            })?;
        let data = secret.data.unwrap_or_default();
        tracing::debug!(secret = %secret.name_any(), "refreshed operator secret");
        Self::from_secret_data(domain, region, own_namespace, in_cluster, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn bytes(data: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        data.iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    #[test]
    fn rejects_all_zero_password_constraints() {
        let data = bytes(&[("password", "s3cr3t")]);
        let err = GlobalConfig::from_secret_data(
            "cc.example.com".into(),
            "eu-de-1".into(),
            "ns".into(),
            true,
            &data,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DegeneratePasswordConstraints { .. }));
    }

    #[test]
    fn parses_json_and_raw_extras() {
        let data = bytes(&[
            ("password", "s3cr3t"),
            ("password_length", "20"),
            ("password_digits", "2"),
            ("password_symbols", "1"),
            ("some_list", "[1,2,3]"),
            ("some_raw", "not-json"),
        ]);
        let cfg = GlobalConfig::from_secret_data(
            "cc.example.com".into(),
            "eu-de-1".into(),
            "ns".into(),
            true,
            &data,
        )
        .unwrap();
        assert_eq!(cfg.extra["some_list"], serde_json::json!([1, 2, 3]));
        assert_eq!(cfg.extra["some_raw"], Value::String("not-json".into()));
        assert!(!cfg.extra.contains_key("password"));
    }

    #[test]
    fn password_constraints_check_length_digits_symbols() {
        let constraints = PasswordConstraints {
            length: 8,
            digits: 2,
            symbols: 1,
        };
        assert!(constraints.satisfies("ab12cd3!"));
        assert!(!constraints.satisfies("short1!"));
        assert!(!constraints.satisfies("abcdefg!"));
        assert!(!constraints.satisfies("ab1cdefg"));
    }
}
