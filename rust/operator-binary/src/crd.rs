//! The two custom resources this operator owns.
//!
//! `VCenterTemplate` feeds the template environment; `VCenterServiceUser`
//! declares the service-user prefixes the reconciler manages.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResource, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

pub const GROUP: &str = "vcenter-operator.stable.sap.cc";
pub const VERSION: &str = "v1alpha1";
pub const APP_NAME: &str = "vcenter-operator";

/// Which rendering pass (per host) a template participates in.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TemplateScope {
    Cluster,
    Datacenter,
}

#[derive(Clone, Debug, CustomResource, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "vcenter-operator.stable.sap.cc",
    version = "v1alpha1",
    kind = "VCenterTemplate",
    plural = "vcentertemplates",
    shortname = "vct",
    namespaced
)]
pub struct VCenterTemplateSpec {
    /// Which rendering pass this template participates in.
    pub scope: TemplateScope,
    /// Per-template overrides for the rendering engine (e.g.
    /// `uses-service-user: nova`).
    #[serde(default)]
    pub options: std::collections::BTreeMap<String, serde_json::Value>,
    /// The Jinja2-like template source, rendered once per matching host/AZ.
    pub template: String,
}

#[derive(Clone, Debug, CustomResource, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "vcenter-operator.stable.sap.cc",
    version = "v1alpha1",
    kind = "VCenterServiceUser",
    plural = "vcenterserviceusers",
    shortname = "vcsu",
    namespaced
)]
pub struct VCenterServiceUserSpec {
    /// Prefix template for this service's technical user, e.g.
    /// `svc_nova_`. No other declaration's username may equal this or be a
    /// prefix of it.
    pub username: String,
}

/// Creates both CRDs if they don't already exist, best effort. A 409
/// (already exists, e.g. a concurrent bootstrap) is not an error.
pub async fn ensure_crds(client: &Client) -> kube::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in [VCenterTemplate::crd(), VCenterServiceUser::crd()] {
        match api.create(&Default::default(), &crd).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 409 => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_scope_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(TemplateScope::Cluster).unwrap(),
            serde_json::json!("cluster")
        );
        assert_eq!(
            serde_json::to_value(TemplateScope::Datacenter).unwrap(),
            serde_json::json!("datacenter")
        );
    }
}
