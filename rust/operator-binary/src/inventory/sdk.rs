//! Virtualization SDK client.
//!
//! vCenter's SOAP property-collector protocol is an external collaborator,
//! not something this operator's reconciliation logic owns, so
//! `ReqwestVsphereClient` only gets as far as session liveness; it never
//! speaks the property-collector wire format. This is the capability-set
//! trait callers program against, plus a `reqwest`-backed implementation
//! skeleton that speaks to a vCenter host over HTTPS with certificate
//! verification disabled, matching how internally issued vCenter
//! certificates are usually handled. The Deployment State Engine is
//! exercised end to end only via fake/mock `VsphereClient` implementations
//! injected in tests; `ReqwestVsphereClient::list_clusters` never returns
//! real inventory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid login to vCenter host {host}"))]
    InvalidLogin { host: String },
    #[snafu(display("transport error talking to vCenter host {host}"))]
    Transport { host: String, source: reqwest::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterObject {
    pub name: String,
    /// `cluster.parent.parent.name`, pre-lowercased by the SDK stand-in so
    /// `poll.rs` does not need to walk the object hierarchy itself.
    pub availability_zone: String,
    pub datastores: Vec<String>,
    pub networks: Vec<String>,
    pub policy_based_management: bool,
    pub nsx_t_enabled: bool,
}

/// Capability set a connected vCenter session exposes.
#[async_trait]
pub trait VsphereClient: Send + Sync {
    /// Cheap liveness call used to decide whether a reconnect is needed
    /// (`CurrentTime`).
    async fn current_time(&self) -> Result<()>;

    /// Property-collector listing with path-set `{name, parent, datastore,
    /// network}`.
    async fn list_clusters(&self) -> Result<Vec<ClusterObject>>;
}

/// `reqwest`-backed vSphere session. Certificate verification is disabled to
/// tolerate internally issued vCenter certificates.
pub struct ReqwestVsphereClient {
    host: String,
    http: reqwest::Client,
}

impl ReqwestVsphereClient {
    /// Opens the HTTP client and authenticates against the SDK endpoint's
    /// `Login` operation. A 401 response maps to [`Error::InvalidLogin`] so
    /// the caller's backoff counter advances on bad credentials, not just on
    /// transport failures.
    pub async fn connect(host: impl Into<String>, username: &str, password: &str) -> Result<Self> {
        let host = host.into();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|source| Error::Transport {
                host: host.clone(),
                source,
            })?;

        let response = http
            .post(format!("https://{host}/sdk/vimService"))
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(|source| Error::Transport {
                host: host.clone(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::InvalidLogin { host });
        }

        Ok(Self { host, http })
    }
}

#[async_trait]
impl VsphereClient for ReqwestVsphereClient {
    async fn current_time(&self) -> Result<()> {
        self.http
            .get(format!("https://{}/sdk/vimService.wsdl", self.host))
            .send()
            .await
            .map_err(|source| Error::Transport {
                host: self.host.clone(),
                source,
            })?;
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterObject>> {
        // Deliberately never implemented: the property-collector exchange is
        // out of scope for this client. Real inventory only ever reaches
        // `derive_inventory`/`render_and_apply` through a `VsphereClient`
        // fake injected in tests; against a live host this always yields an
        // empty cluster set.
        Ok(Vec::new())
    }
}
