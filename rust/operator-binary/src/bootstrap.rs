//! One-shot startup.
//!
//! Resolves orchestrator access, region/domain, and the operator secret
//! exactly once before the root loop (`controller::run`) starts ticking.
//! Any failure here is a startup configuration error and terminates the
//! process with a non-zero exit code.

use kube::Client;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::Level;

use crate::config::{self, GlobalConfig};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize Kubernetes client"))]
    ClientInit { source: kube::Error },
    #[snafu(display("SERVICE_DOMAIN is not set; cannot resolve the operator's region/domain"))]
    UnresolvableRegion,
    #[snafu(display("invalid LOG_LEVEL {value}"))]
    InvalidLogLevel { value: String },
    #[snafu(display("failed to load operator secret"))]
    LoadConfig { source: config::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Bootstrap {
    pub client: Client,
    pub config: GlobalConfig,
}

/// Parses `LOG_LEVEL`, defaulting to `info`; an unparseable value is a
/// startup configuration error.
pub fn parse_log_level(raw: Option<&str>) -> Result<Level> {
    match raw {
        None => Ok(Level::INFO),
        Some(value) => value
            .parse()
            .ok()
            .context(InvalidLogLevelSnafu { value: value.to_string() }),
    }
}

/// Splits `SERVICE_DOMAIN` (e.g. `cc.eu-de-1.cloud.sap`) into `(region,
/// domain)`: region is the first label after the leading `cc` tag, domain
/// is the whole string.
fn split_region_and_domain(service_domain: &str) -> Result<(String, String)> {
    let mut parts = service_domain.splitn(2, '.');
    let _cc = parts.next().context(UnresolvableRegionSnafu)?;
    let region_and_rest = parts.next().context(UnresolvableRegionSnafu)?;
    let mut rest_parts = region_and_rest.splitn(2, '.');
    let region = rest_parts.next().context(UnresolvableRegionSnafu)?;
    Ok((region.to_string(), service_domain.to_string()))
}

pub async fn bootstrap() -> Result<Bootstrap> {
    let service_domain =
        std::env::var("SERVICE_DOMAIN").map_err(|_| Error::UnresolvableRegion)?;
    let (region, domain) = split_region_and_domain(&service_domain)?;
    let in_cluster = std::env::var("KUBERNETES_SERVICE_HOST").is_ok();

    let client = Client::try_default().await.context(ClientInitSnafu)?;
    let own_namespace = client.default_namespace().to_string();

    let config = GlobalConfig::refresh(&client, domain, region, own_namespace, in_cluster)
        .await
        .context(LoadConfigSnafu)?;

    Ok(Bootstrap { client, config })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_region_from_service_domain() {
        let (region, domain) = split_region_and_domain("cc.eu-de-1.cloud.sap").unwrap();
        assert_eq!(region, "eu-de-1");
        assert_eq!(domain, "cc.eu-de-1.cloud.sap");
    }

    #[test]
    fn rejects_a_domain_with_too_few_labels() {
        assert!(split_region_and_domain("cloud").is_err());
    }

    #[test]
    fn parses_known_log_levels() {
        assert_eq!(parse_log_level(Some("debug")).unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(None).unwrap(), Level::INFO);
    }

    #[test]
    fn rejects_unknown_log_level() {
        assert!(parse_log_level(Some("not-a-level")).is_err());
    }
}
