//! Virtualization Inventory Client.
//!
//! Owns the host record table: one entry per discovered vCenter host, its
//! derived-or-AD password, retry/backoff state, and lazily-(re)established
//! connection handle.

pub mod poll;
pub mod sdk;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use snafu::Snafu;

use crate::backoff::Backoff;
use crate::inventory::sdk::{ReqwestVsphereClient, VsphereClient};
use crate::templates::derive_site_password;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("connection to {host} failed"))]
    ConnectionFailed { host: String, source: sdk::Error },
    #[snafu(display("connection to {host} is skipped by backoff"))]
    ConnectSkipped { host: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// One discovered vCenter host. Created on first discovery, never destroyed
/// while the host stays in the discovered set — only its connection handle
/// is dropped on failure.
pub struct HostRecord {
    pub username: String,
    pub password: String,
    pub backoff: Backoff,
    connection: Option<Arc<dyn VsphereClient>>,
}

impl HostRecord {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            backoff: Backoff::new(),
            connection: None,
        }
    }

    /// Derives the per-host password from the master password, slash-free
    /// by construction so it is safe to embed in a credential path.
    pub fn derive_password(username: &str, master_password: &str, host: &str) -> String {
        derive_site_password(username, master_password, host)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Issues a cheap liveness call against the cached connection,
    /// reconnecting on error.
    pub async fn reconnect_if_necessary(&mut self, host: &str) -> Result<()> {
        if let Some(connection) = &self.connection {
            if connection.current_time().await.is_ok() {
                return Ok(());
            }
            self.connection = None;
        }
        self.connect(host).await
    }

    /// Opens a fresh connection, gated by the shared backoff: once the
    /// retry counter is nonzero, the next attempt waits
    /// `min(retries, 10) * 60s`. An `InvalidLogin` outcome still records a
    /// failure and consumes a retry, the same as a transport error.
    pub async fn connect(&mut self, host: &str) -> Result<()> {
        let now = Utc::now();
        if !self.backoff.may_attempt(now) {
            return ConnectSkippedSnafu {
                host: host.to_string(),
            }
            .fail();
        }

        match ReqwestVsphereClient::connect(host, &self.username, &self.password).await {
            Ok(client) => {
                self.connection = Some(Arc::new(client));
                self.backoff.reset();
                Ok(())
            }
            Err(source) => {
                self.backoff.record_failure(now);
                Err(Error::ConnectionFailed {
                    host: host.to_string(),
                    source,
                })
            }
        }
    }

    pub fn connection(&self) -> Option<&Arc<dyn VsphereClient>> {
        self.connection.as_ref()
    }
}

/// Per-host record table, keyed by fully-qualified host name.
#[derive(Default)]
pub struct HostTable {
    hosts: BTreeMap<String, HostRecord>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a record exists for `host`, creating one with a freshly
    /// derived password if this is the first time it was seen.
    pub fn ensure(&mut self, host: &str, username: &str, master_password: &str) -> &mut HostRecord {
        self.hosts.entry(host.to_string()).or_insert_with(|| {
            let password = HostRecord::derive_password(username, master_password, host);
            HostRecord::new(username, password)
        })
    }

    /// Drops records for hosts no longer in the discovered set.
    pub fn retain_discovered(&mut self, discovered: &std::collections::BTreeSet<String>) {
        self.hosts.retain(|host, _| discovered.contains(host));
    }

    pub fn get(&self, host: &str) -> Option<&HostRecord> {
        self.hosts.get(host)
    }

    pub fn get_mut(&mut self, host: &str) -> Option<&mut HostRecord> {
        self.hosts.get_mut(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_derives_the_same_password_for_the_same_host() {
        let mut table = HostTable::new();
        let a = table.ensure("vc-ba123.cc.eu-de-1.cloud.sap", "svc", "hunter2").password.clone();
        let b = table.ensure("vc-ba123.cc.eu-de-1.cloud.sap", "svc", "hunter2").password.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn retain_discovered_drops_stale_hosts() {
        let mut table = HostTable::new();
        table.ensure("a", "svc", "pw");
        table.ensure("b", "svc", "pw");
        let discovered = std::collections::BTreeSet::from(["a".to_string()]);
        table.retain_discovered(&discovered);
        assert!(table.get("a").is_some());
        assert!(table.get("b").is_none());
    }
}
