//! Root reconciliation loop.
//!
//! Drives one tick every [`TICK_INTERVAL`]: refresh global config and cell
//! list, refresh the template environment, discover the vCenter host fleet,
//! observe workloads for the last-seen tracker, then for each discovered
//! host poll inventory, reconcile service users, render and apply — each
//! host isolated so one host's failure cannot block another. The tick timer
//! drives this loop, not orchestrator watch events: none of the CRDs this
//! operator owns describe a single reconcilable object, so there is no
//! natural `kube::runtime::Controller` target.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use hickory_client::rr::Name;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use regex::Regex;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::backoff::Backoff;
use crate::bootstrap::Bootstrap;
use crate::config::{self, AdCredentials, GlobalConfig};
use crate::credentials::{VaultClient, VaultConfig};
use crate::deployment::{self, render, DeploymentState};
use crate::discovery::DnsDiscovery;
use crate::inventory::{self, poll::derive_inventory, poll::ClusterParameters, HostTable};
use crate::nsxt::{self, building_block_host, NsxtEndpoint, ReqwestNsxtEndpoint};
use crate::reconciler::{
    self, reconcile_nsxt_phase, reconcile_vault_phase, reconcile_vcenter_phase, tracker::LastSeenTracker,
    ServiceUserState,
};
use crate::sso::{self, ReqwestSsoEndpoint, SsoEndpoint, SsoTable};
use crate::templates::{
    loader::{self, ServiceUserLoader, TemplateLoader},
    TemplateEnvironment,
};

/// Nominal tick period.
pub const TICK_INTERVAL: StdDuration = StdDuration::from_secs(10);

const NOVA_CELL_LABEL_SELECTOR: &str = "system=openstack,component=nova,type=nova-cell";
const MDNS_LABEL_SELECTOR: &str = "component=mdns,type=backend";
const WORKLOAD_VERSION_LABEL: &str = "vcenter-operator-secret-version";
const WORKLOAD_VCENTER_LABEL: &str = "vcenter";
const WORKLOAD_SERVICE_ANNOTATION: &str = "uses-service-user";
const DEFAULT_USERNAME: &str = "svc_vcenter-operator";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to refresh global config"))]
    RefreshConfig { source: config::Error },
    #[snafu(display("failed to refresh templates, skipping this tick"))]
    RefreshTemplates { source: loader::Error },
    #[snafu(display("failed to refresh service-user declarations, skipping this tick"))]
    RefreshServiceUsers { source: loader::Error },
    #[snafu(display("{host}: connection failed"))]
    VcConnection { host: String, source: inventory::Error },
    #[snafu(display("{host}: service-user reconciliation failed"))]
    ServiceUser { host: String, source: reconciler::Error },
    #[snafu(display("{host}: SSO connection failed"))]
    Sso { host: String, source: sso::Error },
    #[snafu(display("{host}: NSX-T connection failed"))]
    Nsxt { host: String, source: nsxt::Error },
    #[snafu(display("{host}: rendering failed"))]
    Render { host: String, source: render::Error },
    #[snafu(display("{host}: apply failed"))]
    Apply { host: String, source: deployment::apply::Error },
}

impl Error {
    pub fn category(&self) -> &'static str {
        let discriminant: ErrorDiscriminants = self.into();
        discriminant.into()
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Host-name pattern the DNS discovery loop watches. Exactly one pattern is
/// registered, not one per cell.
fn host_pattern() -> Regex {
    Regex::new(r"^vc-[a-z]+-\d+$").expect("static regex is valid")
}

fn strip_trailing_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// `vcenterName` — the short discovered label before the domain, e.g.
/// `vc-ba123` from `vc-ba123.cc.eu-de-1.cloud.sap`.
fn vcenter_name(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

/// Per-building-block NSX-T manager connection state, the same backoff
/// shape as [`crate::inventory::HostRecord`] and [`crate::sso::SsoHost`].
#[derive(Default)]
struct NsxtHost {
    backoff: Backoff,
    endpoint: Option<Arc<dyn NsxtEndpoint>>,
}

#[derive(Default)]
struct NsxtTable {
    hosts: BTreeMap<String, NsxtHost>,
}

impl NsxtTable {
    fn ensure(&mut self, host: &str) -> &mut NsxtHost {
        self.hosts.entry(host.to_string()).or_default()
    }
}

/// Everything the root loop carries across ticks: the template environment,
/// per-host connection tables, and the global service-user/tracker/
/// deployment-state maps.
pub struct State {
    client: Client,
    dry_run: bool,
    domain: String,
    region: String,
    own_namespace: String,
    in_cluster: bool,
    config: Option<GlobalConfig>,
    environment: TemplateEnvironment,
    template_loader: TemplateLoader,
    service_user_loader: ServiceUserLoader,
    discovery: Option<DnsDiscovery>,
    discovered_hosts: BTreeSet<String>,
    host_table: HostTable,
    sso_table: SsoTable,
    nsxt_table: NsxtTable,
    vault: Option<VaultClient>,
    service_user_state: ServiceUserState,
    tracker: LastSeenTracker,
    deployment_states: BTreeMap<String, DeploymentState>,
    cells: BTreeMap<String, BTreeMap<String, String>>,
}

impl State {
    pub fn new(bootstrap: Bootstrap, dry_run: bool) -> Self {
        let client = bootstrap.client;
        Self {
            template_loader: TemplateLoader::new(client.clone()),
            service_user_loader: ServiceUserLoader::new(client.clone()),
            domain: bootstrap.config.domain.clone(),
            region: bootstrap.config.region.clone(),
            own_namespace: bootstrap.config.own_namespace.clone(),
            in_cluster: bootstrap.config.in_cluster,
            config: Some(bootstrap.config),
            client,
            dry_run,
            environment: TemplateEnvironment::new(),
            discovery: None,
            discovered_hosts: BTreeSet::new(),
            host_table: HostTable::new(),
            sso_table: SsoTable::new(),
            nsxt_table: NsxtTable::default(),
            vault: None,
            service_user_state: ServiceUserState::new(),
            tracker: LastSeenTracker::new(),
            deployment_states: BTreeMap::new(),
            cells: BTreeMap::new(),
        }
    }

    /// Runs the reconciliation loop until cancelled. Best-effort: in-flight
    /// operations are simply dropped when the signal future resolves, no
    /// persistent state is flushed.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received termination signal, disconnecting and exiting");
                    return;
                }
            }
        }
    }

    /// One full tick. Never propagates an error to the caller: every
    /// failure is logged, and the appropriate scope (tick or host) is
    /// skipped.
    async fn tick(&mut self) {
        if let Err(error) = self.refresh_config().await {
            tracing::error!(error = %error, category = error.category(), "skipping tick");
            return;
        }

        self.refresh_cells().await;

        if let Err(error) = self.refresh_templates().await {
            tracing::error!(error = %error, category = error.category(), "skipping tick");
            return;
        }

        self.refresh_discovery().await;
        self.observe_workloads().await;

        let hosts: Vec<String> = self.discovered_hosts.iter().cloned().collect();
        for host in hosts {
            if let Err(error) = self.reconcile_host(&host).await {
                tracing::warn!(host = %host, error = %error, category = error.category(), "host tick aborted");
            }
        }
    }

    async fn refresh_config(&mut self) -> Result<()> {
        let config = GlobalConfig::refresh(
            &self.client,
            self.domain.clone(),
            self.region.clone(),
            self.own_namespace.clone(),
            self.in_cluster,
        )
        .await
        .context(RefreshConfigSnafu)?;

        self.vault = config.vault.clone().map(|settings| {
            VaultClient::new(VaultConfig {
                url: settings.url,
                mount_point_read: settings.mount_point_read,
                mount_point_write: settings.mount_point_write,
                role_id: settings.role_id,
                secret_id: settings.secret_id,
            })
        });
        self.config = Some(config);
        Ok(())
    }

    /// Refreshes the cell list by listing ConfigMaps labeled
    /// `system=openstack,component=nova,type=nova-cell` across all
    /// namespaces — an in-cluster stand-in for an OpenStack `/os-cells`
    /// lookup, since a full OpenStack client is out of scope here.
    /// Non-fatal: a failure here just leaves the previous cell list in
    /// place.
    async fn refresh_cells(&mut self) {
        let api: Api<ConfigMap> = Api::all(self.client.clone());
        let params = ListParams::default().labels(NOVA_CELL_LABEL_SELECTOR);
        match api.list(&params).await {
            Ok(list) => {
                let mut cells = BTreeMap::new();
                for config_map in list {
                    let name = config_map.metadata.name.clone().unwrap_or_else(|| "unnamed-cell".to_string());
                    cells.insert(name, config_map.data.unwrap_or_default());
                }
                self.cells = cells;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to refresh nova-cell config maps, keeping prior list");
            }
        }
    }

    async fn refresh_templates(&mut self) -> Result<()> {
        self.template_loader.poll(&self.environment).await.context(RefreshTemplatesSnafu)?;
        self.service_user_loader.poll(&self.environment).await.context(RefreshServiceUsersSnafu)?;
        Ok(())
    }

    /// Finds the mDNS backend (an orchestrator Service labeled
    /// `component=mdns,type=backend`) and lazily builds the discovery loop,
    /// then runs one discovery round.
    async fn refresh_discovery(&mut self) {
        if self.discovery.is_none() {
            match self.locate_mdns_backend().await {
                Ok(addr) => {
                    let Ok(domain) = Name::from_ascii(format!("{}.", self.domain)) else {
                        tracing::error!(domain = %self.domain, "domain is not a valid DNS name");
                        return;
                    };
                    let tsig_key = self
                        .config
                        .as_ref()
                        .and_then(|config| config.extra.get("dns_tsig_key"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let mut discovery = DnsDiscovery::new(domain, addr, tsig_key.as_deref());
                    discovery.register(host_pattern());
                    self.discovery = Some(discovery);
                }
                Err(error) => {
                    tracing::warn!(%error, "could not locate the mDNS backend, skipping discovery this tick");
                    return;
                }
            }
        }

        let diffs = self.discovery.as_mut().expect("just ensured").discover().await;
        if let Some(diff) = diffs.get(host_pattern().as_str()) {
            for name in &diff.added {
                self.discovered_hosts.insert(strip_trailing_dot(name).to_string());
            }
            for name in &diff.gone {
                self.discovered_hosts.remove(strip_trailing_dot(name));
            }
            self.host_table.retain_discovered(&self.discovered_hosts);
            self.sso_table.retain_discovered(&self.discovered_hosts);
            let discovered = self.discovered_hosts.clone();
            self.deployment_states.retain(|host, _| discovered.contains(host));
        }
    }

    async fn locate_mdns_backend(&self) -> anyhow::Result<SocketAddr> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.own_namespace);
        let params = ListParams::default().labels(MDNS_LABEL_SELECTOR);
        let services = api.list(&params).await?;
        for service in services {
            let Some(spec) = service.spec else { continue };
            let Some(ports) = spec.ports else { continue };
            for port in ports {
                if self.in_cluster {
                    if let Some(cluster_ip) = &spec.cluster_ip {
                        return Ok(format!("{cluster_ip}:{}", port.port).parse()?);
                    }
                } else if let Some(external_ips) = &spec.external_i_ps {
                    if let Some(ip) = external_ips.first() {
                        return Ok(format!("{ip}:{}", port.port).parse()?);
                    }
                }
            }
        }
        anyhow::bail!("no Service labeled {MDNS_LABEL_SELECTOR} found in {}", self.own_namespace)
    }

    /// Observes workloads carrying all three labels/annotations, feeding
    /// the last-seen tracker before rendering and deletion decisions use it
    /// this tick.
    async fn observe_workloads(&mut self) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.own_namespace);
        let params = ListParams::default().labels(WORKLOAD_VERSION_LABEL);
        let pods = match api.list(&params).await {
            Ok(pods) => pods,
            Err(error) => {
                tracing::warn!(%error, "failed to list workloads for last-seen tracking");
                return;
            }
        };

        let now = Utc::now().timestamp();
        for pod in pods {
            let labels = pod.metadata.labels.unwrap_or_default();
            let annotations = pod.metadata.annotations.unwrap_or_default();
            reconciler::observe_workload(
                &self.tracker,
                annotations.get(WORKLOAD_SERVICE_ANNOTATION).map(String::as_str),
                labels.get(WORKLOAD_VCENTER_LABEL).map(String::as_str),
                labels.get(WORKLOAD_VERSION_LABEL).map(String::as_str),
                now,
            );
        }
    }

    /// One host's inventory-poll → service-user-reconcile → render/apply
    /// pass, isolated from every other host.
    async fn reconcile_host(&mut self, host: &str) -> Result<()> {
        let config = self.config.clone().expect("refreshed before any host tick");

        let username = config
            .extra
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_USERNAME)
            .to_string();
        self.host_table.ensure(host, &username, &config.master_password);

        let connection = {
            let record = self.host_table.get_mut(host).expect("just ensured");
            record.reconnect_if_necessary(host).await.context(VcConnectionSnafu { host })?;
            record.connection().expect("reconnect_if_necessary succeeded").clone()
        };

        let raw_clusters = connection
            .list_clusters()
            .await
            .map_err(|source| inventory::Error::ConnectionFailed {
                host: host.to_string(),
                source,
            })
            .context(VcConnectionSnafu { host })?;
        let (clusters, availability_zones) = derive_inventory(&raw_clusters);

        if config.manage_service_user_passwords {
            self.reconcile_service_users(host, &clusters, &config).await?;
        }

        self.render_and_apply(host, &config, &clusters, &availability_zones).await
    }

    /// Per-declared-service vault/vCenter/NSX-T reconciliation for one
    /// host. No-op if no credential store is configured.
    async fn reconcile_service_users(
        &mut self,
        host: &str,
        clusters: &BTreeMap<String, ClusterParameters>,
        config: &GlobalConfig,
    ) -> Result<()> {
        if self.vault.is_none() {
            return Ok(());
        }

        let vcenter_name = vcenter_name(host).to_string();
        let declarations = self.environment.service_user_declarations();
        let now = Utc::now();
        let now_unix = now.timestamp();

        for (service, declaration) in &declarations {
            let path = render::service_user_path(&self.region, service, &vcenter_name);

            let version = {
                let vault = self.vault.as_ref().expect("checked above");
                reconcile_vault_phase(
                    vault,
                    &mut self.service_user_state,
                    &path,
                    service,
                    &declaration.username_template,
                    &config.password_constraints,
                    self.dry_run,
                    now,
                    config.vault_check_interval,
                )
                .await
                .context(ServiceUserSnafu { host })?
            };

            let Some(version) = version else { continue };

            let Some(ad) = config.ad_credentials.clone() else {
                tracing::debug!(host, "no AD credentials configured, skipping vCenter/NSX-T phases");
                continue;
            };
            let domain = self.domain.clone();

            let sso_host = self.sso_table.ensure(host);
            let host_owned = host.to_string();
            let connect_future = {
                let ad = ad.clone();
                async move {
                    ReqwestSsoEndpoint::connect(&host_owned, &domain, &ad.username, &ad.password)
                        .await
                        .map(|endpoint| Arc::new(endpoint) as Arc<dyn SsoEndpoint>)
                }
            };
            let endpoint = sso_host.ensure_connected(host, connect_future).await.context(SsoSnafu { host })?;

            let vcenter_result = {
                let vault = self.vault.as_ref().expect("checked above");
                reconcile_vcenter_phase(
                    vault,
                    endpoint.as_ref(),
                    &path,
                    service,
                    host,
                    &declaration.username_template,
                    &version,
                    &self.tracker,
                    now_unix,
                    now,
                    config.max_time_not_seen,
                )
                .await
            };

            if let Err(error) = vcenter_result {
                if matches!(error, reconciler::Error::SsoSkipped { .. }) {
                    self.sso_table.ensure(host).clear();
                }
                return Err(Error::ServiceUser {
                    host: host.to_string(),
                    source: error,
                });
            }

            self.reconcile_nsxt_for_host(host, clusters, &ad, service, &declaration.username_template, &path, &version)
                .await?;
        }

        Ok(())
    }

    /// NSX-T phase, run once per building block the host's NSX-T-enabled
    /// clusters belong to. Stale versions are pruned before a new one is
    /// created when the two-active-user budget is exhausted, see
    /// `reconciler::reconcile_nsxt_phase`. Authenticates with the same AD
    /// credentials as the vCenter SSO phase, since the AD service account is
    /// the only shared identity this operator already holds.
    #[allow(clippy::too_many_arguments)]
    async fn reconcile_nsxt_for_host(
        &mut self,
        host: &str,
        clusters: &BTreeMap<String, ClusterParameters>,
        ad: &AdCredentials,
        service: &str,
        template: &str,
        path: &str,
        version: &str,
    ) -> Result<()> {
        let building_blocks: BTreeSet<String> = clusters
            .values()
            .filter(|params| params.nsx_t_enabled)
            .map(|params| params.name.clone())
            .collect();

        for number in &building_blocks {
            let bb_host = building_block_host(&self.region, number);

            let now = Utc::now();
            let connected = {
                let nsxt_host = self.nsxt_table.ensure(&bb_host);
                if nsxt_host.endpoint.is_none() {
                    if !nsxt_host.backoff.may_attempt(now) {
                        continue;
                    }
                    match ReqwestNsxtEndpoint::connect(&bb_host, &ad.username, &ad.password).await {
                        Ok(endpoint) => {
                            nsxt_host.endpoint = Some(Arc::new(endpoint));
                            nsxt_host.backoff.reset();
                        }
                        Err(error) => {
                            nsxt_host.backoff.record_failure(now);
                            return Err(Error::Nsxt {
                                host: bb_host,
                                source: error,
                            });
                        }
                    }
                }
                nsxt_host.endpoint.clone().expect("just connected or cached")
            };

            let result = {
                let vault = self.vault.as_ref().expect("caller gated on vault presence");
                reconcile_nsxt_phase(
                    vault,
                    connected.as_ref(),
                    path,
                    service,
                    host,
                    template,
                    version,
                    &self.tracker,
                    now.timestamp(),
                    now,
                    self.config
                        .as_ref()
                        .expect("refreshed before any host tick")
                        .max_time_not_seen,
                )
                .await
            };

            if let Err(error) = result {
                self.nsxt_table.ensure(&bb_host).endpoint = None;
                return Err(Error::ServiceUser {
                    host: host.to_string(),
                    source: error,
                });
            }
        }
        Ok(())
    }

    /// Renders every matching template for this host's clusters and
    /// availability zones, computes the delta against the previous tick, and
    /// applies it.
    async fn render_and_apply(
        &mut self,
        host: &str,
        config: &GlobalConfig,
        clusters: &BTreeMap<String, ClusterParameters>,
        availability_zones: &BTreeMap<String, ()>,
    ) -> Result<()> {
        let record = self.host_table.get(host).expect("reconcile_host ensured this");
        let vcenter_name_str = vcenter_name(host).to_string();

        let mut base = config.extra.clone();
        base.insert("host".to_string(), Value::String(host.to_string()));
        base.insert("name".to_string(), Value::String(vcenter_name_str.clone()));
        base.insert("domain".to_string(), Value::String(self.domain.clone()));
        base.insert("region".to_string(), Value::String(self.region.clone()));
        base.insert("username".to_string(), Value::String(record.username.clone()));
        base.insert("password".to_string(), Value::String(record.password.clone()));
        base.insert("cells".to_string(), serde_json::to_value(&self.cells).unwrap_or(Value::Null));

        let declarations_map: BTreeMap<String, String> = self
            .environment
            .service_user_declarations()
            .into_iter()
            .map(|(service, decl)| (service, decl.username_template))
            .collect();

        let mut new_state = DeploymentState::new();
        for params in clusters.values() {
            let mut options = base.clone();
            options.insert("name".to_string(), Value::String(params.name.clone()));
            options.insert("cluster_name".to_string(), Value::String(params.cluster_name.clone()));
            options.insert("availability_zone".to_string(), Value::String(params.availability_zone.clone()));
            options.insert("nsx_t_enabled".to_string(), Value::Bool(params.nsx_t_enabled));
            if let Some(bridge) = &params.bridge {
                options.insert("bridge".to_string(), Value::String(bridge.clone()));
            }
            if let Some(physical) = &params.physical {
                options.insert("physical".to_string(), Value::String(physical.clone()));
            }
            if let Some(regex) = &params.datastore_regex {
                options.insert("datastore_regex".to_string(), Value::String(regex.clone()));
            }
            if let Some(regex) = &params.ha_group_regex {
                options.insert("ha_group_regex".to_string(), Value::String(regex.clone()));
            }

            render::render_scope(
                &self.environment,
                "cluster",
                &options,
                &self.region,
                &vcenter_name_str,
                &self.service_user_state.service_users,
                &declarations_map,
                &self.tracker,
                &mut new_state,
            )
            .context(RenderSnafu { host })?;
        }

        for az in availability_zones.keys() {
            let mut options = base.clone();
            options.insert("availability_zone".to_string(), Value::String(az.clone()));

            render::render_scope(
                &self.environment,
                "datacenter",
                &options,
                &self.region,
                &vcenter_name_str,
                &self.service_user_state.service_users,
                &declarations_map,
                &self.tracker,
                &mut new_state,
            )
            .context(RenderSnafu { host })?;
        }

        let previous = self.deployment_states.entry(host.to_string()).or_default();
        let delta = previous.delta(&new_state);

        if !self.dry_run {
            deployment::apply::apply(&self.client, &delta).await.context(ApplySnafu { host })?;
        } else if !delta.is_empty() {
            tracing::info!(host, items = delta.items().len(), "dry-run: not applying delta");
        }

        self.deployment_states.insert(host.to_string(), new_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pattern_matches_discovered_style_names() {
        let pattern = host_pattern();
        assert!(pattern.is_match("vc-ba-123"));
        assert!(!pattern.is_match("VC-BA-123"));
        assert!(!pattern.is_match("not-a-vcenter"));
    }

    #[test]
    fn vcenter_name_strips_the_domain_suffix() {
        assert_eq!(vcenter_name("vc-ba123.cc.eu-de-1.cloud.sap"), "vc-ba123");
    }

    #[test]
    fn strip_trailing_dot_removes_the_fqdn_root_dot() {
        assert_eq!(strip_trailing_dot("vc-ba123.cc.eu-de-1.cloud.sap."), "vc-ba123.cc.eu-de-1.cloud.sap");
        assert_eq!(strip_trailing_dot("vc-ba123.cc.eu-de-1.cloud.sap"), "vc-ba123.cc.eu-de-1.cloud.sap");
    }
}
