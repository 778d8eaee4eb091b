//! NSX-T User Client.
//!
//! Session-cookied, per-building-block HTTP client at
//! `https://nsx-ctl-bbNNN.cc.{region}.cloud.sap/...`. Authenticates via a
//! form POST to `api/session/create`; success captures the `X-XSRF-TOKEN`
//! header for subsequent writes. At most two active local users are
//! supported by the target; enforcing that limit is the reconciler's job,
//! not this client's.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub const ROLE_ENTERPRISE_ADMIN: &str = "enterprise_admin";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("not authorized against {host}"))]
    NotAuthorized { host: String },
    #[snafu(display("{name} already exists on {host}"))]
    ObjectAlreadyExists { host: String, name: String },
    #[snafu(display("{name} does not exist on {host}"))]
    ObjectDoesNotExist { host: String, name: String },
    #[snafu(display("login to {host} failed"))]
    LoginFailed { host: String, source: reqwest::Error },
    #[snafu(display("request to {host} failed"))]
    Transport { host: String, source: reqwest::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Derives the building-block-addressed NSX-T manager host for a cluster.
/// `cluster_number` is the cluster's numeric suffix, e.g. `"42"` from
/// `productionbb042`.
pub fn building_block_host(region: &str, cluster_number: &str) -> String {
    let padded: u32 = cluster_number.parse().unwrap_or(0);
    format!("nsx-ctl-bb{padded:03}.cc.{region}.cloud.sap")
}

fn map_status(host: &str, name: &str, method: &reqwest::Method, status: reqwest::StatusCode) -> Option<Error> {
    match status.as_u16() {
        403 => Some(Error::NotAuthorized {
            host: host.to_string(),
        }),
        404 => Some(Error::ObjectDoesNotExist {
            host: host.to_string(),
            name: name.to_string(),
        }),
        409 if *method == reqwest::Method::POST => Some(Error::ObjectAlreadyExists {
            host: host.to_string(),
            name: name.to_string(),
        }),
        _ => None,
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoleMapping {
    pub revision: String,
    pub roles: Vec<String>,
}

/// Capability set a connected NSX-T manager session exposes.
#[async_trait]
pub trait NsxtEndpoint: Send + Sync {
    async fn list_users(&self, prefix: &str) -> Result<Vec<User>>;
    async fn get_user_role_mapping(&self, username: &str) -> Result<Option<RoleMapping>>;
    async fn create_service_user(&self, username: &str, password: &str) -> Result<()>;
    async fn add_user_to_group(&self, username: &str, role: &str, mapping: &RoleMapping) -> Result<()>;
    async fn delete_service_user(&self, username: &str) -> Result<()>;
}

/// Pure role-set check, no network call.
pub fn check_users_in_group(mappings: &[(&str, &RoleMapping)], group: &str) -> BTreeSet<String> {
    mappings
        .iter()
        .filter(|(_, mapping)| mapping.roles.iter().any(|role| role == group))
        .map(|(username, _)| username.to_string())
        .collect()
}

pub struct ReqwestNsxtEndpoint {
    host: String,
    http: reqwest::Client,
    xsrf_token: String,
}

impl ReqwestNsxtEndpoint {
    pub async fn connect(host: &str, username: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .cookie_store(true)
            .build()
            .map_err(|source| Error::LoginFailed {
                host: host.to_string(),
                source,
            })?;

        let response = http
            .post(format!("https://{host}/api/session/create"))
            .form(&[("j_username", username), ("j_password", password)])
            .send()
            .await
            .map_err(|source| Error::LoginFailed {
                host: host.to_string(),
                source,
            })?;

        if let Some(error) = map_status(host, "session", &reqwest::Method::POST, response.status()) {
            return Err(error);
        }

        let xsrf_token = response
            .headers()
            .get("X-XSRF-TOKEN")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            host: host.to_string(),
            http,
            xsrf_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("https://{}{}", self.host, path))
            .header("X-XSRF-TOKEN", &self.xsrf_token)
    }

    async fn send_checked(&self, name: &str, builder: reqwest::RequestBuilder, method: reqwest::Method) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })?;
        if let Some(error) = map_status(&self.host, name, &method, response.status()) {
            return Err(error);
        }
        Ok(response)
    }
}

#[async_trait]
impl NsxtEndpoint for ReqwestNsxtEndpoint {
    async fn list_users(&self, prefix: &str) -> Result<Vec<User>> {
        let builder = self
            .request(reqwest::Method::GET, "/api/v1/node/users")
            .query(&[("prefix", prefix)]);
        let response = self.send_checked(prefix, builder, reqwest::Method::GET).await?;
        response.json::<Vec<User>>().await.map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })
    }

    async fn get_user_role_mapping(&self, username: &str) -> Result<Option<RoleMapping>> {
        let builder = self
            .request(reqwest::Method::GET, "/api/v1/aaa/role-bindings")
            .query(&[("name", username)]);
        let response = match self.send_checked(username, builder, reqwest::Method::GET).await {
            Ok(response) => response,
            Err(Error::ObjectDoesNotExist { .. }) => return Ok(None),
            Err(other) => return Err(other),
        };
        let mappings: Vec<RoleMapping> = response.json().await.map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })?;

        // Zero or more-than-one match is a soft failure: the caller treats
        // an ambiguous mapping the same as a missing one.
        if mappings.len() != 1 {
            tracing::warn!(
                host = %self.host,
                username,
                matches = mappings.len(),
                "role mapping lookup did not resolve to exactly one entry"
            );
            return Ok(None);
        }
        Ok(mappings.into_iter().next())
    }

    async fn create_service_user(&self, username: &str, password: &str) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, "/api/v1/node/users?action=create_user")
            .json(&serde_json::json!({ "username": username, "password": password }));
        self.send_checked(username, builder, reqwest::Method::POST).await?;
        Ok(())
    }

    async fn add_user_to_group(&self, username: &str, role: &str, mapping: &RoleMapping) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PUT, "/api/v1/aaa/role-bindings")
            .json(&serde_json::json!({
                "name": username,
                "role": role,
                "_revision": mapping.revision,
            }));
        self.send_checked(username, builder, reqwest::Method::PUT).await?;
        Ok(())
    }

    async fn delete_service_user(&self, username: &str) -> Result<()> {
        let builder = self.request(reqwest::Method::DELETE, &format!("/api/v1/node/users/{username}"));
        match self.send_checked(username, builder, reqwest::Method::DELETE).await {
            Ok(_) => Ok(()),
            Err(Error::ObjectDoesNotExist { .. }) => Ok(()),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn building_block_host_zero_pads_to_three_digits() {
        assert_eq!(
            building_block_host("eu-de-1", "42"),
            "nsx-ctl-bb042.cc.eu-de-1.cloud.sap"
        );
    }

    #[test]
    fn check_users_in_group_filters_by_role() {
        let admin = RoleMapping {
            revision: "1".to_string(),
            roles: vec![ROLE_ENTERPRISE_ADMIN.to_string()],
        };
        let auditor = RoleMapping {
            revision: "1".to_string(),
            roles: vec!["auditor".to_string()],
        };
        let mappings = vec![("svc0001", &admin), ("svc0002", &auditor)];
        let members = check_users_in_group(&mappings, ROLE_ENTERPRISE_ADMIN);
        assert_eq!(members, BTreeSet::from(["svc0001".to_string()]));
    }

    #[test]
    fn maps_status_codes_per_operation() {
        assert!(matches!(
            map_status("host", "u", &reqwest::Method::POST, reqwest::StatusCode::FORBIDDEN),
            Some(Error::NotAuthorized { .. })
        ));
        assert!(matches!(
            map_status("host", "u", &reqwest::Method::GET, reqwest::StatusCode::NOT_FOUND),
            Some(Error::ObjectDoesNotExist { .. })
        ));
        assert!(matches!(
            map_status("host", "u", &reqwest::Method::POST, reqwest::StatusCode::CONFLICT),
            Some(Error::ObjectAlreadyExists { .. })
        ));
        assert!(map_status("host", "u", &reqwest::Method::DELETE, reqwest::StatusCode::CONFLICT).is_none());
    }
}
