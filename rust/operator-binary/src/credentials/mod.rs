//! Credential Store Client.
//!
//! Stateful HTTP client with bearer-token session, refreshed once
//! `now > loginTime + leaseDuration - 300s`. All 5xx responses surface as
//! [`Error::Unavailable`]; 404 on reads returns `Ok(None)`; everything else
//! propagates.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;

const RENEW_MARGIN_SECONDS: i64 = 300;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("credential store at {url} is unavailable"))]
    Unavailable { url: String },
    #[snafu(display("credential store login failed"))]
    Login { source: reqwest::Error },
    #[snafu(display("credential store request to {url} failed"))]
    Request { url: String, source: reqwest::Error },
    #[snafu(display("credential store response from {url} could not be decoded"))]
    Decode { url: String, source: reqwest::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub url: String,
    pub mount_point_read: String,
    pub mount_point_write: String,
    pub role_id: String,
    pub secret_id: String,
}

/// Password-constraint contract: exact total length, minimum digits,
/// minimum punctuation symbols.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordConstraints {
    pub length: usize,
    pub digits: usize,
    pub symbols: usize,
}

const SYMBOLS: &[char] = &['!', '@', '#', '$', '%', '^', '&', '*', '-', '_', '='];
const LETTERS: &[char] = &[
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L',
    'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
];

impl PasswordConstraints {
    /// Fails any password that doesn't meet the length/digit/symbol minimums,
    /// without attempting a rewrite.
    pub fn satisfies(&self, password: &str) -> bool {
        if password.chars().count() != self.length {
            return false;
        }
        let digits = password.chars().filter(|c| c.is_ascii_digit()).count();
        let symbols = password.chars().filter(|c| SYMBOLS.contains(c)).count();
        digits >= self.digits && symbols >= self.symbols
    }

    /// Local password generator used as the store-backed `/v1/gen/password`
    /// endpoint's client-side fallback and in tests.
    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let letters_needed = self.length.saturating_sub(self.digits + self.symbols);

        let mut chars: Vec<char> = Vec::with_capacity(self.length);
        chars.extend((0..self.digits).map(|_| char::from_digit(rng.gen_range(0..10), 10).unwrap()));
        chars.extend((0..self.symbols).map(|_| *SYMBOLS.choose(&mut rng).unwrap()));
        chars.extend((0..letters_needed).map(|_| *LETTERS.choose(&mut rng).unwrap()));
        chars.shuffle(&mut rng);
        chars.into_iter().collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VersionMetadata {
    pub deletion_time: String,
}

impl VersionMetadata {
    pub fn is_deleted(&self) -> bool {
        !self.deletion_time.is_empty()
    }
}

/// Custom metadata schema the credential store attaches to each secret.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CustomMetadata {
    #[serde(default)]
    pub accessed_resource: String,
    #[serde(default)]
    pub application_criticality: String,
    #[serde(default)]
    pub expiry_date: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub review_date: String,
    #[serde(default)]
    pub support_group: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub replica_dest_secrets: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretMetadata {
    pub versions: BTreeMap<String, VersionMetadata>,
    pub custom: CustomMetadata,
}

impl SecretMetadata {
    /// Highest version number whose metadata lacks `deletion_time`.
    pub fn latest_live_version(&self) -> Option<u32> {
        self.versions
            .iter()
            .filter(|(_, meta)| !meta.is_deleted())
            .filter_map(|(version, _)| version.parse::<u32>().ok())
            .max()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mount {
    Read,
    Write,
}

struct Session {
    token: String,
    login_time: DateTime<Utc>,
    lease_duration: Duration,
}

impl Session {
    fn next_renew(&self) -> DateTime<Utc> {
        self.login_time + self.lease_duration - Duration::seconds(RENEW_MARGIN_SECONDS)
    }

    fn needs_renew(&self, now: DateTime<Utc>) -> bool {
        now > self.next_renew()
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: i64,
}

pub struct VaultClient {
    http: reqwest::Client,
    config: VaultConfig,
    session: Mutex<Option<Session>>,
}

impl VaultClient {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            session: Mutex::new(None),
        }
    }

    fn mount(&self, mount: Mount) -> &str {
        match mount {
            Mount::Read => &self.config.mount_point_read,
            Mount::Write => &self.config.mount_point_write,
        }
    }

    async fn login(&self) -> Result<(String, Duration)> {
        let url = format!("{}/v1/auth/approle/login", self.config.url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "role_id": self.config.role_id,
                "secret_id": self.config.secret_id,
            }))
            .send()
            .await
            .context(LoginSnafu)?;

        if response.status().is_server_error() {
            return UnavailableSnafu {
                url: self.config.url.clone(),
            }
            .fail();
        }

        let body: LoginResponse = response.json().await.context(DecodeSnafu { url })?;
        Ok((body.auth.client_token, Duration::seconds(body.auth.lease_duration)))
    }

    /// Returns a live bearer token, logging in (or renewing) as needed.
    async fn token(&self, now: DateTime<Utc>) -> Result<String> {
        let mut session = self.session.lock().await;
        if session.as_ref().map(|s| s.needs_renew(now)).unwrap_or(true) {
            let (token, lease_duration) = self.login().await?;
            *session = Some(Session {
                token: token.clone(),
                login_time: now,
                lease_duration,
            });
        }
        Ok(session.as_ref().unwrap().token.clone())
    }

    /// Reads `{username, password}` from the read mount, or `None` on 404.
    pub async fn get_secret(&self, path: &str) -> Result<Option<Credential>> {
        let url = format!(
            "{}/v1/{}/data/{}",
            self.config.url,
            self.mount(Mount::Read),
            path
        );
        let token = self.token(Utc::now()).await?;
        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status().is_server_error() {
            return UnavailableSnafu {
                url: self.config.url.clone(),
            }
            .fail();
        }

        #[derive(Deserialize)]
        struct Envelope {
            data: Inner,
        }
        #[derive(Deserialize)]
        struct Inner {
            data: Credential,
        }

        let body: Envelope = response.json().await.context(DecodeSnafu { url })?;
        Ok(Some(body.data.data))
    }

    /// Reads the versions map and custom metadata for `path` on the given
    /// mount, or `None` on 404.
    pub async fn get_metadata(&self, path: &str, mount: Mount) -> Result<Option<SecretMetadata>> {
        let url = format!("{}/v1/{}/metadata/{}", self.config.url, self.mount(mount), path);
        let token = self.token(Utc::now()).await?;
        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status().is_server_error() {
            return UnavailableSnafu {
                url: self.config.url.clone(),
            }
            .fail();
        }

        #[derive(Deserialize)]
        struct Envelope {
            data: Inner,
        }
        #[derive(Deserialize)]
        struct Inner {
            #[serde(default)]
            versions: BTreeMap<String, VersionMetadata>,
            #[serde(default)]
            custom_metadata: CustomMetadata,
        }

        let body: Envelope = response.json().await.context(DecodeSnafu { url })?;
        Ok(Some(SecretMetadata {
            versions: body.data.versions,
            custom: body.data.custom_metadata,
        }))
    }

    /// Posts to the replication endpoint for the write mount.
    pub async fn trigger_replicate(&self, path: &str) -> Result<()> {
        let url = format!("{}/v1/gen/replicate", self.config.url);
        let token = self.token(Utc::now()).await?;
        let response = self
            .http
            .post(&url)
            .header("X-Vault-Token", token)
            .json(&serde_json::json!({
                "mount": self.config.mount_point_write,
                "path": path,
            }))
            .send()
            .await
            .context(RequestSnafu { url: url.clone() })?;

        if response.status().is_server_error() {
            return UnavailableSnafu {
                url: self.config.url.clone(),
            }
            .fail();
        }
        Ok(())
    }

    /// Requests a generated password from the store; falls back to local
    /// generation if the store-side generator is unreachable, since the
    /// constraint contract is identical either way.
    pub async fn gen_password(&self, constraints: &PasswordConstraints) -> Result<String> {
        let url = format!("{}/v1/gen/password", self.config.url);
        let token = self.token(Utc::now()).await?;
        let response = self
            .http
            .post(&url)
            .header("X-Vault-Token", token)
            .json(&serde_json::json!({
                "length": constraints.length,
                "digits": constraints.digits,
                "symbols": constraints.symbols,
            }))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                #[derive(Deserialize)]
                struct Envelope {
                    password: String,
                }
                let body: Envelope = response.json().await.context(DecodeSnafu { url })?;
                Ok(body.password)
            }
            _ => Ok(constraints.generate()),
        }
    }

    /// Allocates the next version for `template`, generates a password
    /// under `constraints`, writes it at `path` plus its metadata, and
    /// triggers replication. `service` is used only for tracing context;
    /// the write targets `path` directly. Dry-run returns the generated
    /// credential without writing anything.
    pub async fn create_service_user(
        &self,
        template: &str,
        path: &str,
        service: &str,
        last_version: Option<&str>,
        dry_run: bool,
        constraints: &PasswordConstraints,
    ) -> Result<(String, String, String)> {
        let next_version_num: u32 = match last_version {
            Some(v) => v.parse::<u32>().unwrap_or(0) + 1,
            None => 1,
        };
        let version = next_version_num.to_string();
        let username = format_username(template, next_version_num);
        let password = self.gen_password(constraints).await?;

        if dry_run {
            tracing::info!(service, path, username, "dry-run: not writing service user");
            return Ok((version, username, password));
        }

        let data_url = format!(
            "{}/v1/{}/data/{}",
            self.config.url,
            self.mount(Mount::Write),
            path
        );
        let token = self.token(Utc::now()).await?;
        let response = self
            .http
            .post(&data_url)
            .header("X-Vault-Token", &token)
            .json(&serde_json::json!({
                "data": { "username": username, "password": password },
            }))
            .send()
            .await
            .context(RequestSnafu { url: data_url.clone() })?;
        if response.status().is_server_error() {
            return UnavailableSnafu {
                url: self.config.url.clone(),
            }
            .fail();
        }

        let today = Utc::now().date_naive();
        let expiry = today + Duration::days(365);
        let metadata_url = format!(
            "{}/v1/{}/metadata/{}",
            self.config.url,
            self.mount(Mount::Write),
            path
        );
        let response = self
            .http
            .post(&metadata_url)
            .header("X-Vault-Token", &token)
            .json(&serde_json::json!({
                "custom_metadata": {
                    "accessed_resource": path,
                    "application_criticality": "",
                    "expiry_date": expiry.format("%Y-%m-%d").to_string(),
                    "owner": "",
                    "review_date": today.format("%Y-%m-%d").to_string(),
                    "support_group": "",
                    "type": service,
                    "username": username,
                    "replica_dest_secrets": [],
                },
            }))
            .send()
            .await
            .context(RequestSnafu { url: metadata_url.clone() })?;
        if response.status().is_server_error() {
            return UnavailableSnafu {
                url: self.config.url.clone(),
            }
            .fail();
        }

        self.trigger_replicate(path).await?;
        Ok((version, username, password))
    }

    /// Re-validates the live username AND password strength, not just the
    /// username shape, so a policy change (e.g. raising `digits`) is
    /// honored on the next tick rather than only on expiry. Rewrites a
    /// fresh version if either check fails.
    pub async fn check_and_update_username_if_necessary(
        &self,
        path: &str,
        service: &str,
        template: &str,
        version: &str,
        constraints: &PasswordConstraints,
    ) -> Result<String> {
        let expected_version: u32 = version.parse().unwrap_or(0);
        let expected_username = format_username(template, expected_version);

        if let Some(credential) = self.get_secret(path).await? {
            if credential.username == expected_username && constraints.satisfies(&credential.password)
            {
                return Ok(version.to_string());
            }
        }

        let (new_version, _, _) = self
            .create_service_user(template, path, service, Some(version), false, constraints)
            .await?;
        Ok(new_version)
    }
}

fn format_username(template: &str, version: u32) -> String {
    format!("{template}{version:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_username_zero_pads_to_four_digits() {
        assert_eq!(format_username("svc", 1), "svc0001");
        assert_eq!(format_username("svc", 42), "svc0042");
    }

    #[test]
    fn constraints_reject_wrong_length() {
        let constraints = PasswordConstraints {
            length: 12,
            digits: 2,
            symbols: 1,
        };
        assert!(!constraints.satisfies("short"));
    }

    #[test]
    fn constraints_reject_insufficient_digits_or_symbols() {
        let constraints = PasswordConstraints {
            length: 10,
            digits: 2,
            symbols: 1,
        };
        assert!(!constraints.satisfies("aaaaaaaaaa"));
    }

    #[test]
    fn generate_satisfies_its_own_constraints() {
        let constraints = PasswordConstraints {
            length: 16,
            digits: 3,
            symbols: 2,
        };
        let password = constraints.generate();
        assert!(constraints.satisfies(&password));
    }

    #[test]
    fn latest_live_version_skips_deleted_versions() {
        let mut versions = BTreeMap::new();
        versions.insert(
            "1".to_string(),
            VersionMetadata {
                deletion_time: String::new(),
            },
        );
        versions.insert(
            "2".to_string(),
            VersionMetadata {
                deletion_time: "2024-01-01T00:00:00Z".to_string(),
            },
        );
        let metadata = SecretMetadata {
            versions,
            custom: CustomMetadata::default(),
        };
        assert_eq!(metadata.latest_live_version(), Some(1));
    }

    #[test]
    fn session_renews_past_the_five_minute_margin() {
        let now = Utc::now();
        let session = Session {
            token: "t".to_string(),
            login_time: now,
            lease_duration: Duration::seconds(1000),
        };
        assert!(!session.needs_renew(now + Duration::seconds(699)));
        assert!(session.needs_renew(now + Duration::seconds(701)));
    }
}
