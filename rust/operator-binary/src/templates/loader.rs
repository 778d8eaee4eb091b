//! Template Loader and Service-User Loader.
//!
//! Both poll a `kube::Api<T>` for one CRD kind and feed
//! [`super::TemplateEnvironment`]; the environment does the atomic swap and
//! the prefix-uniqueness check, so these loaders only translate CRs into the
//! environment's key/value shape.

use std::collections::BTreeMap;

use kube::{Api, Client, ResourceExt};
use snafu::{ResultExt, Snafu};

use crate::crd::{VCenterServiceUser, VCenterTemplate};
use crate::templates::{
    entry_key, Error as EnvError, OwnerRef, ServiceUserDeclaration, TemplateEntry,
    TemplateEnvironment,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list VCenterTemplate custom resources"))]
    ListTemplates { source: kube::Error },
    #[snafu(display("failed to list VCenterServiceUser custom resources"))]
    ListServiceUsers { source: kube::Error },
    #[snafu(display("failed to apply loaded templates"))]
    ApplyTemplates { source: EnvError },
    #[snafu(display("failed to apply loaded service-user declarations"))]
    ApplyServiceUsers { source: EnvError },
    #[snafu(display("custom resource {name} is missing a namespace"))]
    MissingNamespace { name: String },
    #[snafu(display("custom resource {name} is missing a uid"))]
    MissingUid { name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub struct TemplateLoader {
    api: Api<VCenterTemplate>,
}

impl TemplateLoader {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Polls every `VCenterTemplate` and atomically replaces the
    /// environment's template map. Any failure leaves the prior map
    /// untouched, skipping the tick entirely.
    pub async fn poll(&self, environment: &TemplateEnvironment) -> Result<()> {
        let templates = self.api.list(&Default::default()).await.context(ListTemplatesSnafu)?;

        let mut entries = BTreeMap::new();
        for template in templates {
            let name = template.name_any();
            let namespace = template
                .namespace()
                .with_context(|| MissingNamespaceSnafu { name: name.clone() })?;
            let uid = template
                .uid()
                .with_context(|| MissingUidSnafu { name: name.clone() })?;
            let resource_version = template.resource_version().unwrap_or_default();

            let key = entry_key(&template.spec.scope.to_string(), &namespace, &name);
            let entry = TemplateEntry {
                resource_version,
                source: template.spec.template.clone(),
                options: template.spec.options.clone(),
                owner: OwnerRef {
                    api_version: format!("{}/{}", crate::crd::GROUP, crate::crd::VERSION),
                    kind: "VCenterTemplate".to_string(),
                    name,
                    uid,
                },
            };
            if entries.insert(key.clone(), entry).is_some() {
                tracing::warn!(key = %key, "duplicate template entry, later one wins");
            }
        }

        environment.replace_templates(entries).context(ApplyTemplatesSnafu)
    }
}

pub struct ServiceUserLoader {
    api: Api<VCenterServiceUser>,
}

impl ServiceUserLoader {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Polls every `VCenterServiceUser` and atomically replaces the
    /// environment's declaration map, enforcing prefix-uniqueness. A
    /// rejected refresh retains the prior map.
    pub async fn poll(&self, environment: &TemplateEnvironment) -> Result<()> {
        let declarations = self
            .api
            .list(&Default::default())
            .await
            .context(ListServiceUsersSnafu)?;

        let mut decls = BTreeMap::new();
        for declaration in declarations {
            let name = declaration.name_any();
            let namespace = declaration
                .namespace()
                .with_context(|| MissingNamespaceSnafu { name: name.clone() })?;
            let resource_version = declaration.resource_version().unwrap_or_default();

            decls.insert(
                name,
                ServiceUserDeclaration {
                    resource_version,
                    username_template: declaration.spec.username.clone(),
                    namespace,
                },
            );
        }

        environment.replace_service_users(decls).context(ApplyServiceUsersSnafu)
    }
}
