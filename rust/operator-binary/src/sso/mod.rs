//! vCenter SSO Client.
//!
//! Per-host connection sharing the inventory client's backoff shape.
//! Authenticates against the host's STS endpoint with AD credentials to
//! obtain a bearer SAML assertion, opens an SSO session, then drops the
//! assertion — only the session survives past `connect`. Any operation
//! failure drops the cached session and reports [`Error::Skipped`] so the
//! caller aborts the tick for that host.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use snafu::Snafu;

use crate::backoff::Backoff;

pub const ADMINISTRATORS_GROUP: &str = "Administrators";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("SSO session for {host} is skipped by backoff or was just dropped"))]
    Skipped { host: String },
    #[snafu(display("SSO authentication against {host} failed"))]
    AuthenticationFailed { host: String, source: reqwest::Error },
    #[snafu(display("SSO operation against {host} failed"))]
    Transport { host: String, source: reqwest::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Capability set a connected SSO session exposes.
#[async_trait]
pub trait SsoEndpoint: Send + Sync {
    async fn list_users(&self, search: &str) -> Result<Vec<String>>;
    async fn is_member_of_group(&self, username: &str, group: &str) -> Result<bool>;
    async fn create_person_user(&self, username: &str, password: &str) -> Result<()>;
    async fn add_user_to_group(&self, username: &str, group: &str) -> Result<()>;
    async fn delete_user(&self, username: &str) -> Result<()>;
}

/// `reqwest`-backed SSO session. Holds only the session cookie/token after
/// construction; the SAML assertion used to obtain it is never retained.
pub struct ReqwestSsoEndpoint {
    host: String,
    http: reqwest::Client,
    session_token: String,
}

impl ReqwestSsoEndpoint {
    pub async fn connect(host: &str, domain: &str, ad_username: &str, ad_password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|source| Error::AuthenticationFailed {
                host: host.to_string(),
                source,
            })?;

        let sts_url = format!("https://{host}/sts/STSService/{domain}");
        let assertion_response = http
            .post(&sts_url)
            .basic_auth(ad_username, Some(ad_password))
            .send()
            .await
            .map_err(|source| Error::AuthenticationFailed {
                host: host.to_string(),
                source,
            })?;
        let assertion: String = assertion_response
            .text()
            .await
            .map_err(|source| Error::AuthenticationFailed {
                host: host.to_string(),
                source,
            })?;

        let session_url = format!("https://{host}/sso-adminserver/sdk/vsphere.local");
        let session_response = http
            .post(&session_url)
            .bearer_auth(&assertion)
            .send()
            .await
            .map_err(|source| Error::AuthenticationFailed {
                host: host.to_string(),
                source,
            })?;
        let session_token = session_response
            .headers()
            .get("X-Session-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        // The SAML assertion is intentionally not retained past this point.

        Ok(Self {
            host: host.to_string(),
            http,
            session_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("https://{}{}", self.host, path))
            .header("Cookie", format!("vmware-session-token={}", self.session_token))
    }
}

#[async_trait]
impl SsoEndpoint for ReqwestSsoEndpoint {
    async fn list_users(&self, search: &str) -> Result<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, "/sso-adminserver/sdk/vsphere.local/users")
            .query(&[("search", search)])
            .send()
            .await
            .map_err(|source| Error::Transport {
                host: self.host.clone(),
                source,
            })?;
        response.json::<Vec<String>>().await.map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })
    }

    async fn is_member_of_group(&self, username: &str, group: &str) -> Result<bool> {
        let members = self.list_group_members(group).await?;
        Ok(members.contains(&username.to_string()))
    }

    async fn create_person_user(&self, username: &str, password: &str) -> Result<()> {
        self.request(reqwest::Method::POST, "/sso-adminserver/sdk/vsphere.local/users")
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|source| Error::Transport {
                host: self.host.clone(),
                source,
            })?;
        Ok(())
    }

    async fn add_user_to_group(&self, username: &str, group: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/sso-adminserver/sdk/vsphere.local/groups/{group}/users"),
        )
        .json(&serde_json::json!({ "username": username }))
        .send()
        .await
        .map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })?;
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/sso-adminserver/sdk/vsphere.local/users/{username}"),
        )
        .send()
        .await
        .map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })?;
        Ok(())
    }
}

impl ReqwestSsoEndpoint {
    async fn list_group_members(&self, group: &str) -> Result<Vec<String>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/sso-adminserver/sdk/vsphere.local/groups/{group}/users"),
            )
            .send()
            .await
            .map_err(|source| Error::Transport {
                host: self.host.clone(),
                source,
            })?;
        response.json::<Vec<String>>().await.map_err(|source| Error::Transport {
            host: self.host.clone(),
            source,
        })
    }
}

/// Per-host SSO connection state, the same backoff shape as the inventory
/// client.
pub struct SsoHost {
    pub backoff: Backoff,
    endpoint: Option<Arc<dyn SsoEndpoint>>,
}

impl Default for SsoHost {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(),
            endpoint: None,
        }
    }
}

impl SsoHost {
    /// The cached session, if one is connected.
    pub fn endpoint(&self) -> Option<Arc<dyn SsoEndpoint>> {
        self.endpoint.clone()
    }

    /// Ensures a session is connected, gated by the shared backoff. Leaves
    /// any existing cached session untouched.
    pub async fn ensure_connected(
        &mut self,
        host: &str,
        connect: impl std::future::Future<Output = Result<Arc<dyn SsoEndpoint>>>,
    ) -> Result<Arc<dyn SsoEndpoint>> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }
        let now = Utc::now();
        if !self.backoff.may_attempt(now) {
            return SkippedSnafu {
                host: host.to_string(),
            }
            .fail();
        }
        match connect.await {
            Ok(endpoint) => {
                self.endpoint = Some(endpoint.clone());
                self.backoff.reset();
                Ok(endpoint)
            }
            Err(error) => {
                self.backoff.record_failure(now);
                Err(error)
            }
        }
    }

    /// Drops the cached session, e.g. after a multi-step reconciliation
    /// against it failed.
    pub fn clear(&mut self) {
        self.endpoint = None;
    }

    /// Runs `op` against the cached session, connecting first if necessary.
    /// Any failure — connect or operation — drops the cached session and
    /// surfaces [`Error::Skipped`].
    pub async fn call<T>(
        &mut self,
        host: &str,
        connect: impl std::future::Future<Output = Result<Arc<dyn SsoEndpoint>>>,
        op: impl FnOnce(Arc<dyn SsoEndpoint>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send>>,
    ) -> Result<T> {
        let now = Utc::now();
        if self.endpoint.is_none() {
            if !self.backoff.may_attempt(now) {
                return SkippedSnafu {
                    host: host.to_string(),
                }
                .fail();
            }
            match connect.await {
                Ok(endpoint) => {
                    self.endpoint = Some(endpoint);
                    self.backoff.reset();
                }
                Err(error) => {
                    self.backoff.record_failure(now);
                    return Err(error);
                }
            }
        }

        let endpoint = self.endpoint.clone().expect("just connected or already connected");
        match op(endpoint).await {
            Ok(value) => Ok(value),
            Err(error) => {
                self.endpoint = None;
                tracing::warn!(host, error = %error, "SSO operation failed, session dropped");
                Err(error)
            }
        }
    }
}

/// Per-host table, keyed by fully-qualified host name (mirrors
/// [`crate::inventory::HostTable`]'s shape).
#[derive(Default)]
pub struct SsoTable {
    hosts: BTreeMap<String, SsoHost>,
}

impl SsoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, host: &str) -> &mut SsoHost {
        self.hosts.entry(host.to_string()).or_default()
    }

    pub fn retain_discovered(&mut self, discovered: &std::collections::BTreeSet<String>) {
        self.hosts.retain(|host, _| discovered.contains(host));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEndpoint {
        users: Vec<String>,
        members: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl SsoEndpoint for FakeEndpoint {
        async fn list_users(&self, _search: &str) -> Result<Vec<String>> {
            if self.fail {
                return Err(Error::Skipped {
                    host: "fake".to_string(),
                });
            }
            Ok(self.users.clone())
        }
        async fn is_member_of_group(&self, username: &str, _group: &str) -> Result<bool> {
            Ok(self.members.contains(&username.to_string()))
        }
        async fn create_person_user(&self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }
        async fn add_user_to_group(&self, _username: &str, _group: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_user(&self, _username: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_failed_operation_drops_the_cached_session() {
        let mut host = SsoHost::default();
        let endpoint: Arc<dyn SsoEndpoint> = Arc::new(FakeEndpoint {
            users: vec![],
            members: vec![],
            fail: true,
        });
        host.endpoint = Some(endpoint);

        let result = host
            .call(
                "vc-ba123",
                async { unreachable!("already connected") },
                |endpoint| Box::pin(async move { endpoint.list_users("svc").await }),
            )
            .await;

        assert!(result.is_err());
        assert!(host.endpoint.is_none());
    }

    #[tokio::test]
    async fn a_successful_operation_keeps_the_session_cached() {
        let mut host = SsoHost::default();
        let endpoint: Arc<dyn SsoEndpoint> = Arc::new(FakeEndpoint {
            users: vec!["svc0001".to_string()],
            members: vec![],
            fail: false,
        });
        host.endpoint = Some(endpoint);

        let result = host
            .call(
                "vc-ba123",
                async { unreachable!("already connected") },
                |endpoint| Box::pin(async move { endpoint.list_users("svc").await }),
            )
            .await;

        assert_eq!(result.unwrap(), vec!["svc0001".to_string()]);
        assert!(host.endpoint.is_some());
    }
}
