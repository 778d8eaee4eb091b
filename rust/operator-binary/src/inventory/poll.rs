//! Cluster/datastore/network → `ClusterParameters`.

use std::collections::BTreeMap;

use regex::Regex;

use crate::inventory::sdk::ClusterObject;

/// Matches the production building-block cluster naming scheme,
/// capturing the numeric suffix, e.g. `productionbb042` -> `42`.
fn cluster_name_regex() -> Regex {
    Regex::new(r"^productionbb0*([1-9][0-9]*)$").expect("static regex is valid")
}

/// Matches ephemeral datastore names.
fn datastore_prefix_regex() -> Regex {
    Regex::new(r"^eph.*$").expect("static regex is valid")
}

/// Matches high-availability-group datastore suffixes.
fn ha_group_suffix_regex() -> Regex {
    Regex::new(r".*_hg[ab]$").expect("static regex is valid")
}

/// Matches bridge network names, capturing the physical network name.
fn bridge_network_regex() -> Regex {
    Regex::new(r"^br-(.*)$").expect("static regex is valid")
}

/// Derived per-cluster rendering parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterParameters {
    pub name: String,
    pub cluster_name: String,
    pub availability_zone: String,
    pub bridge: Option<String>,
    pub physical: Option<String>,
    pub datastore_regex: Option<String>,
    pub ha_group_regex: Option<String>,
    pub nsx_t_enabled: bool,
}

fn longest_common_prefix(values: &[&str]) -> String {
    let Some(first) = values.first() else {
        return String::new();
    };
    let mut prefix = first.to_string();
    for value in &values[1..] {
        while !value.starts_with(&prefix) {
            prefix.pop();
            if prefix.is_empty() {
                return prefix;
            }
        }
    }
    prefix
}

/// Derives [`ClusterParameters`] for one cluster object, or `None` if the
/// cluster name does not match the naming scheme or no bridge network can be
/// found for a non-NSX-T cluster.
pub fn derive_cluster_parameters(cluster: &ClusterObject) -> Option<ClusterParameters> {
    let name_match = cluster_name_regex().captures(&cluster.name)?;
    let name = name_match.get(1)?.as_str().to_lowercase();

    let (datastore_regex, ha_group_regex) = if cluster.policy_based_management {
        (None, None)
    } else {
        let matching: Vec<&str> = cluster
            .datastores
            .iter()
            .filter(|d| datastore_prefix_regex().is_match(d))
            .map(String::as_str)
            .collect();
        let prefix = longest_common_prefix(&matching);
        let datastore_regex = Some(format!("^{prefix}.*"));

        let has_a = cluster
            .datastores
            .iter()
            .any(|d| ha_group_suffix_regex().is_match(d) && d.ends_with("_hga"));
        let has_b = cluster
            .datastores
            .iter()
            .any(|d| ha_group_suffix_regex().is_match(d) && d.ends_with("_hgb"));
        let ha_group_regex = (has_a && has_b).then(|| ".*_hg[ab]$".to_string());

        (datastore_regex, ha_group_regex)
    };

    let mut bridge = None;
    let mut physical = None;
    for network in &cluster.networks {
        if let Some(captures) = bridge_network_regex().captures(network) {
            bridge = Some(captures.get(0)?.as_str().to_lowercase());
            physical = Some(captures.get(1)?.as_str().to_lowercase());
            break;
        }
    }

    if bridge.is_none() && !cluster.nsx_t_enabled {
        tracing::warn!(
            cluster = %cluster.name,
            "skipping cluster, cannot find bridge matching naming scheme"
        );
        return None;
    }

    Some(ClusterParameters {
        name,
        cluster_name: cluster.name.clone(),
        availability_zone: cluster.availability_zone.to_lowercase(),
        bridge,
        physical,
        datastore_regex,
        ha_group_regex,
        nsx_t_enabled: cluster.nsx_t_enabled,
    })
}

/// Polls every cluster and groups the results into per-cluster and
/// per-availability-zone option maps.
pub fn derive_inventory(
    clusters: &[ClusterObject],
) -> (BTreeMap<String, ClusterParameters>, BTreeMap<String, ()>) {
    let mut by_cluster = BTreeMap::new();
    let mut availability_zones = BTreeMap::new();

    for cluster in clusters {
        if let Some(parameters) = derive_cluster_parameters(cluster) {
            availability_zones.insert(parameters.availability_zone.clone(), ());
            by_cluster.insert(parameters.cluster_name.clone(), parameters);
        }
    }

    (by_cluster, availability_zones)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str, datastores: &[&str], networks: &[&str]) -> ClusterObject {
        ClusterObject {
            name: name.to_string(),
            availability_zone: "QDE1".to_string(),
            datastores: datastores.iter().map(|s| s.to_string()).collect(),
            networks: networks.iter().map(|s| s.to_string()).collect(),
            policy_based_management: false,
            nsx_t_enabled: false,
        }
    }

    #[test]
    fn ignores_clusters_not_matching_naming_scheme() {
        let c = cluster("not-a-production-cluster", &[], &["br-mgmt"]);
        assert!(derive_cluster_parameters(&c).is_none());
    }

    #[test]
    fn derives_name_datastore_regex_and_bridge() {
        let c = cluster(
            "productionbb042",
            &["eph001", "eph002", "other"],
            &["br-mgmt", "vmotion"],
        );
        let params = derive_cluster_parameters(&c).unwrap();
        assert_eq!(params.name, "42");
        assert_eq!(params.availability_zone, "qde1");
        assert_eq!(params.datastore_regex.as_deref(), Some("^eph00.*"));
        assert_eq!(params.bridge.as_deref(), Some("br-mgmt"));
        assert_eq!(params.physical.as_deref(), Some("mgmt"));
    }

    #[test]
    fn enables_ha_group_regex_when_both_variants_present() {
        let c = cluster(
            "productionbb001",
            &["eph001_hga", "eph001_hgb"],
            &["br-mgmt"],
        );
        let params = derive_cluster_parameters(&c).unwrap();
        assert_eq!(params.ha_group_regex.as_deref(), Some(".*_hg[ab]$"));
    }

    #[test]
    fn skips_cluster_without_bridge_when_not_nsx_t() {
        let c = cluster("productionbb001", &[], &["vmotion"]);
        assert!(derive_cluster_parameters(&c).is_none());
    }

    #[test]
    fn nsx_t_enabled_cluster_survives_missing_bridge() {
        let mut c = cluster("productionbb001", &[], &["vmotion"]);
        c.nsx_t_enabled = true;
        assert!(derive_cluster_parameters(&c).is_some());
    }
}
