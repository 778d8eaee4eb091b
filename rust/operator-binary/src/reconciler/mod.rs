//! Service-User Reconciler.
//!
//! Three-party reconciliation between the credential store, vCenter SSO, and
//! NSX-T: rotation on expiry, parallel-version coexistence, last-seen
//! tracking driven by workload labels, and bounded deletion of stale
//! versions. Runs per host, per declared service, guarded by a per-path
//! throttle.

pub mod tracker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use snafu::Snafu;

use crate::credentials::{Mount, PasswordConstraints, VaultClient};
use crate::deployment::render::service_user_path;
use crate::nsxt::{self, NsxtEndpoint, RoleMapping, ROLE_ENTERPRISE_ADMIN};
use crate::reconciler::tracker::LastSeenTracker;
use crate::sso::{self, SsoEndpoint, ADMINISTRATORS_GROUP};

const EXPIRY_ROTATION_WINDOW_DAYS: i64 = 90;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("credential store unavailable while reconciling {path}"))]
    VaultUnavailable {
        path: String,
        source: crate::credentials::Error,
    },
    #[snafu(display("read/write mounts out of sync for {path}, replication triggered"))]
    VaultSecretNotReplicated { path: String },
    #[snafu(display("SSO session for {host} was skipped or dropped"))]
    SsoSkipped { host: String, source: sso::Error },
    #[snafu(display("NSX-T operation for {username} failed"))]
    Nsxt {
        username: String,
        source: nsxt::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Process-wide service-user bookkeeping: the version list per credential
/// path, and the per-path `vaultCheckInterval` throttle.
#[derive(Default)]
pub struct ServiceUserState {
    pub service_users: BTreeMap<String, Vec<String>>,
    vault_last_checked: BTreeMap<String, DateTime<Utc>>,
}

impl ServiceUserState {
    pub fn new() -> Self {
        Self::default()
    }

    fn due_for_vault_check(&self, path: &str, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        match self.vault_last_checked.get(path) {
            Some(last) => now - *last >= interval,
            None => true,
        }
    }

    fn mark_checked(&mut self, path: &str, now: DateTime<Utc>) {
        self.vault_last_checked.insert(path.to_string(), now);
    }
}

fn format_username(template: &str, version: &str) -> String {
    let padded: u32 = version.parse().unwrap_or(0);
    format!("{template}{padded:04}")
}

fn version_from_username(template: &str, username: &str) -> Option<String> {
    let suffix = username.strip_prefix(template)?;
    let number: u32 = suffix.parse().ok()?;
    Some(number.to_string())
}

/// Vault phase. Returns `None` if the per-path throttle is not yet due.
#[allow(clippy::too_many_arguments)]
pub async fn reconcile_vault_phase(
    vault: &VaultClient,
    state: &mut ServiceUserState,
    path: &str,
    service: &str,
    template: &str,
    constraints: &PasswordConstraints,
    dry_run: bool,
    now: DateTime<Utc>,
    vault_check_interval: chrono::Duration,
) -> Result<Option<String>> {
    if !state.due_for_vault_check(path, now, vault_check_interval) {
        return Ok(state.service_users.get(path).and_then(|v| v.last()).cloned());
    }
    state.mark_checked(path, now);

    let metadata_write = vault
        .get_metadata(path, Mount::Write)
        .await
        .map_err(|source| Error::VaultUnavailable {
            path: path.to_string(),
            source,
        })?;

    if metadata_write.is_none() {
        let (version, _, _) = vault
            .create_service_user(template, path, service, None, dry_run, constraints)
            .await
            .map_err(|source| Error::VaultUnavailable {
                path: path.to_string(),
                source,
            })?;
        state.service_users.insert(path.to_string(), vec![version.clone()]);
        return Ok(Some(version));
    }
    let metadata_write = metadata_write.unwrap();

    let metadata_read = vault
        .get_metadata(path, Mount::Read)
        .await
        .map_err(|source| Error::VaultUnavailable {
            path: path.to_string(),
            source,
        })?;
    let Some(metadata_read) = metadata_read else {
        let _ = vault.trigger_replicate(path).await;
        return VaultSecretNotReplicatedSnafu { path }.fail();
    };

    let latest_write = metadata_write.latest_live_version().unwrap_or(0);
    let latest_read = metadata_read.latest_live_version().unwrap_or(0);
    if latest_write > latest_read {
        let _ = vault.trigger_replicate(path).await;
        return VaultSecretNotReplicatedSnafu { path }.fail();
    }

    let today = now.date_naive();
    let expires_soon = NaiveDate::parse_from_str(&metadata_read.custom.expiry_date, "%Y-%m-%d")
        .map(|expiry| expiry - today <= chrono::Duration::days(EXPIRY_ROTATION_WINDOW_DAYS))
        .unwrap_or(false);

    if expires_soon {
        let (version, _, _) = vault
            .create_service_user(
                template,
                path,
                service,
                Some(&latest_write.to_string()),
                dry_run,
                constraints,
            )
            .await
            .map_err(|source| Error::VaultUnavailable {
                path: path.to_string(),
                source,
            })?;
        state
            .service_users
            .entry(path.to_string())
            .or_default()
            .push(version.clone());
        return Ok(Some(version));
    }

    let latest_read_str = latest_read.to_string();
    if !state.service_users.contains_key(path) {
        let version = vault
            .check_and_update_username_if_necessary(path, service, template, &latest_read_str, constraints)
            .await
            .map_err(|source| Error::VaultUnavailable {
                path: path.to_string(),
                source,
            })?;
        state.service_users.insert(path.to_string(), vec![version.clone()]);
        return Ok(Some(version));
    }

    let list = state.service_users.get_mut(path).expect("checked above");
    if list.last().map(String::as_str) != Some(latest_read_str.as_str()) {
        let version = vault
            .check_and_update_username_if_necessary(path, service, template, &latest_read_str, constraints)
            .await
            .map_err(|source| Error::VaultUnavailable {
                path: path.to_string(),
                source,
            })?;
        list.push(version.clone());
        return Ok(Some(version));
    }

    Ok(list.last().cloned())
}

/// vCenter phase.
#[allow(clippy::too_many_arguments)]
pub async fn reconcile_vcenter_phase(
    vault: &VaultClient,
    sso: &dyn SsoEndpoint,
    path: &str,
    service: &str,
    host: &str,
    template: &str,
    current_version: &str,
    tracker: &LastSeenTracker,
    now_unix: i64,
    now: DateTime<Utc>,
    max_time_not_seen: chrono::Duration,
) -> Result<()> {
    let current = format_username(template, current_version);

    let users = sso
        .list_users(template)
        .await
        .map_err(|source| Error::SsoSkipped {
            host: host.to_string(),
            source,
        })?;

    if !users.contains(&current) {
        let credential = vault
            .get_secret(path)
            .await
            .map_err(|source| Error::VaultUnavailable {
                path: path.to_string(),
                source,
            })?;
        match credential {
            Some(credential) if credential.username == current => {
                sso.create_person_user(&current, &credential.password)
                    .await
                    .map_err(|source| Error::SsoSkipped {
                        host: host.to_string(),
                        source,
                    })?;
                sso.add_user_to_group(&current, ADMINISTRATORS_GROUP)
                    .await
                    .map_err(|source| Error::SsoSkipped {
                        host: host.to_string(),
                        source,
                    })?;
                tracker.observe(service, host, current_version, now_unix);
            }
            _ => {
                let _ = vault.trigger_replicate(path).await;
                return VaultSecretNotReplicatedSnafu { path }.fail();
            }
        }
    } else if !sso
        .is_member_of_group(&current, ADMINISTRATORS_GROUP)
        .await
        .map_err(|source| Error::SsoSkipped {
            host: host.to_string(),
            source,
        })?
    {
        sso.add_user_to_group(&current, ADMINISTRATORS_GROUP)
            .await
            .map_err(|source| Error::SsoSkipped {
                host: host.to_string(),
                source,
            })?;
    }

    for username in &users {
        let Some(version) = version_from_username(template, username) else {
            continue;
        };
        if tracker.last_seen(service, host, &version).is_none() {
            tracker.observe(service, host, &version, now_unix);
        }
        if version == current_version {
            continue;
        }
        if users.len() == 1 {
            continue;
        }
        if tracker.is_stale(
            service,
            host,
            &version,
            now.timestamp(),
            max_time_not_seen.num_seconds(),
        ) {
            sso.delete_user(username).await.map_err(|source| Error::SsoSkipped {
                host: host.to_string(),
                source,
            })?;
            tracker.remove(service, host, &version);
        }
    }

    Ok(())
}

/// NSX-T phase: the same rotate-add-delete shape as the vCenter phase, plus
/// the two-active-user limit NSX-T enforces.
pub const NSXT_MAX_ACTIVE_USERS: usize = 2;

#[allow(clippy::too_many_arguments)]
pub async fn reconcile_nsxt_phase(
    vault: &VaultClient,
    nsxt: &dyn NsxtEndpoint,
    path: &str,
    service: &str,
    host: &str,
    template: &str,
    current_version: &str,
    tracker: &LastSeenTracker,
    now_unix: i64,
    now: DateTime<Utc>,
    max_time_not_seen: chrono::Duration,
) -> Result<()> {
    let current = format_username(template, current_version);

    let users = nsxt
        .list_users(template)
        .await
        .map_err(|source| Error::Nsxt {
            username: current.clone(),
            source,
        })?;
    let mut usernames: BTreeSet<String> = users.iter().map(|u| u.username.clone()).collect();

    // Sweep stale versions before checking the active-user budget, so a full
    // budget can still free a slot for the current version in the same tick.
    // Checking the budget first would let a full two-user table permanently
    // block rotation even once a prior version is no longer seen anywhere.
    for username in users.iter().map(|u| &u.username) {
        let Some(version) = version_from_username(template, username) else {
            continue;
        };
        if tracker.last_seen(service, host, &version).is_none() {
            tracker.observe(service, host, &version, now_unix);
        }
        if version == current_version || usernames.len() == 1 {
            continue;
        }
        if tracker.is_stale(
            service,
            host,
            &version,
            now.timestamp(),
            max_time_not_seen.num_seconds(),
        ) {
            nsxt.delete_service_user(username).await.map_err(|source| Error::Nsxt {
                username: username.clone(),
                source,
            })?;
            tracker.remove(service, host, &version);
            usernames.remove(username);
        }
    }

    if !usernames.contains(&current) {
        if usernames.len() >= NSXT_MAX_ACTIVE_USERS {
            tracing::warn!(host, service, "NSX-T active-user limit reached, skipping create");
            return Ok(());
        }
        let credential = vault
            .get_secret(path)
            .await
            .map_err(|source| Error::VaultUnavailable {
                path: path.to_string(),
                source,
            })?;
        match credential {
            Some(credential) if credential.username == current => {
                nsxt.create_service_user(&current, &credential.password)
                    .await
                    .map_err(|source| Error::Nsxt {
                        username: current.clone(),
                        source,
                    })?;
                if let Some(mapping) = nsxt
                    .get_user_role_mapping(&current)
                    .await
                    .map_err(|source| Error::Nsxt {
                        username: current.clone(),
                        source,
                    })?
                {
                    nsxt.add_user_to_group(&current, ROLE_ENTERPRISE_ADMIN, &mapping)
                        .await
                        .map_err(|source| Error::Nsxt {
                            username: current.clone(),
                            source,
                        })?;
                }
                tracker.observe(service, host, current_version, now_unix);
            }
            _ => {
                let _ = vault.trigger_replicate(path).await;
                return VaultSecretNotReplicatedSnafu { path }.fail();
            }
        }
    }

    Ok(())
}

/// Observes a workload carrying all three labels/annotations.
pub fn observe_workload(
    tracker: &LastSeenTracker,
    uses_service_user: Option<&str>,
    vcenter: Option<&str>,
    secret_version: Option<&str>,
    now_unix: i64,
) {
    if let (Some(service), Some(host), Some(version)) = (uses_service_user, vcenter, secret_version) {
        tracker.observe(service, host, version, now_unix);
    }
}

/// Convenience constructor mirroring `render.rs`'s path shape, since
/// rendering and reconciliation derive the same credential path.
pub fn credential_path(region: &str, service: &str, vcenter_name: &str) -> String {
    service_user_path(region, service, vcenter_name)
}

pub use crate::sso::SsoHost;
pub type SharedNsxtEndpoint = Arc<dyn NsxtEndpoint>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_username_pads_to_four_digits() {
        assert_eq!(format_username("svc", "7"), "svc0007");
    }

    #[test]
    fn version_from_username_strips_the_template_prefix() {
        assert_eq!(version_from_username("svc", "svc0042"), Some("42".to_string()));
        assert_eq!(version_from_username("svc", "other0042"), None);
    }

    #[test]
    fn due_for_vault_check_respects_the_throttle() {
        let mut state = ServiceUserState::new();
        let now = Utc::now();
        let interval = chrono::Duration::seconds(60);
        assert!(state.due_for_vault_check("p", now, interval));
        state.mark_checked("p", now);
        assert!(!state.due_for_vault_check("p", now + chrono::Duration::seconds(30), interval));
        assert!(state.due_for_vault_check("p", now + chrono::Duration::seconds(61), interval));
    }

    #[test]
    fn observe_workload_requires_all_three_labels() {
        let tracker = LastSeenTracker::new();
        observe_workload(&tracker, Some("nova"), None, Some("1"), 100);
        assert_eq!(tracker.last_seen("nova", "vc-ba123", "1"), None);

        observe_workload(&tracker, Some("nova"), Some("vc-ba123"), Some("1"), 100);
        assert_eq!(tracker.last_seen("nova", "vc-ba123", "1"), Some(100));
    }
}
