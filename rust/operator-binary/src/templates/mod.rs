//! Template Environment & Loaders.
//!
//! A single [`TemplateEnvironment`] backs both polling loaders
//! ([`loader::TemplateLoader`], [`loader::ServiceUserLoader`]): a template
//! map swapped atomically on every successful poll, and a service-user
//! declaration map that enforces prefix-uniqueness.

pub mod filters;
pub mod loader;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};
use tera::Tera;

use crate::masterpassword;

/// Identity of the CR that produced a rendered resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateEntry {
    pub resource_version: String,
    pub source: String,
    pub options: BTreeMap<String, Value>,
    pub owner: OwnerRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceUserDeclaration {
    pub resource_version: String,
    pub username_template: String,
    pub namespace: String,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display(
        "username template {template:?} conflicts with existing declaration {existing:?}"
    ))]
    UsernameTemplateDuplicate { template: String, existing: String },
    #[snafu(display("failed to render template {key}"))]
    Render { key: String, source: tera::Error },
    #[snafu(display("template {key} not found"))]
    NotFound { key: String },
}

impl Error {
    pub fn category(&self) -> &'static str {
        let discriminant: ErrorDiscriminants = self.into();
        discriminant.into()
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds the map key: `scope/namespace/name.yaml.j2`.
pub fn entry_key(scope: &str, namespace: &str, name: &str) -> String {
    format!("vcenter_{scope}/{namespace}/{name}.yaml.j2")
}

/// Checks the prefix-uniqueness invariant: `template` must not equal, nor be
/// a prefix of, nor have as a prefix, any `existing` template.
fn conflicts(template: &str, existing: &str) -> bool {
    template == existing || template.starts_with(existing) || existing.starts_with(template)
}

pub struct TemplateEnvironment {
    tera: Arc<Mutex<Tera>>,
    entries: RwLock<BTreeMap<String, TemplateEntry>>,
    service_users: RwLock<BTreeMap<String, ServiceUserDeclaration>>,
    render_scope: Arc<Mutex<Value>>,
}

impl TemplateEnvironment {
    pub fn new() -> Self {
        let tera = Arc::new(Mutex::new(Tera::default()));
        let render_scope = Arc::new(Mutex::new(Value::Null));

        {
            let mut engine = tera.lock().expect("fresh lock cannot be poisoned");
            engine.register_filter("ini_escape", filters::ini_escape);
            engine.register_filter("quote", filters::quote);
            engine.register_filter("sha256sum", filters::sha256sum);
            engine.register_filter("base64", filters::base64_encode);
            engine.register_function("derive_password", filters::DerivePassword);
            engine.register_function("render", filters::RenderByName::new(tera.clone()));
            engine.register_function(
                "context",
                filters::RenderContext::new(render_scope.clone()),
            );
        }

        Self {
            tera,
            entries: RwLock::new(BTreeMap::new()),
            service_users: RwLock::new(BTreeMap::new()),
            render_scope,
        }
    }

    /// Atomically replaces the template map. Any entry whose
    /// `resourceVersion` changed invalidates its compiled form.
    pub fn replace_templates(&self, entries: BTreeMap<String, TemplateEntry>) -> Result<()> {
        let mut tera = self.tera.lock().expect("template engine lock poisoned");
        let previous = self.entries.read().expect("entries lock poisoned");

        for (key, entry) in &entries {
            let changed = previous
                .get(key)
                .map(|prior| prior.resource_version != entry.resource_version)
                .unwrap_or(true);
            if changed {
                tera.add_raw_template(key, &entry.source)
                    .map_err(|source| Error::Render {
                        key: key.clone(),
                        source,
                    })?;
            }
        }
        drop(previous);
        // Templates removed from `entries` are simply no longer looked up;
        // Tera has no public API to evict a single compiled template, and a
        // stale, unreferenced compiled entry is harmless.
        drop(tera);
        *self.entries.write().expect("entries lock poisoned") = entries;
        Ok(())
    }

    /// Enforces the service-user prefix-uniqueness invariant; on conflict
    /// the prior map is retained unchanged.
    pub fn replace_service_users(
        &self,
        declarations: BTreeMap<String, ServiceUserDeclaration>,
    ) -> Result<()> {
        for (service, decl) in &declarations {
            for (other_service, other) in &declarations {
                if other_service != service && conflicts(&decl.username_template, &other.username_template) {
                    return UsernameTemplateDuplicateSnafu {
                        template: decl.username_template.clone(),
                        existing: other.username_template.clone(),
                    }
                    .fail();
                }
            }
        }
        *self.service_users.write().expect("service users lock poisoned") = declarations;
        Ok(())
    }

    pub fn service_user_declarations(&self) -> BTreeMap<String, ServiceUserDeclaration> {
        self.service_users
            .read()
            .expect("service users lock poisoned")
            .clone()
    }

    pub fn keys_for_scope<'a>(&'a self, scope: &str) -> Vec<String> {
        let prefix = format!("vcenter_{scope}/");
        self.entries
            .read()
            .expect("entries lock poisoned")
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn owner_of(&self, key: &str) -> Option<OwnerRef> {
        self.entries
            .read()
            .expect("entries lock poisoned")
            .get(key)
            .map(|entry| entry.owner.clone())
    }

    pub fn engine_options(&self, key: &str) -> Option<BTreeMap<String, Value>> {
        self.entries
            .read()
            .expect("entries lock poisoned")
            .get(key)
            .map(|entry| entry.options.clone())
    }

    /// Renders `key` with `options`, capturing them in the per-render scope
    /// object used by the `context()` global.
    pub fn render(&self, key: &str, options: &Value) -> Result<String> {
        if !self
            .entries
            .read()
            .expect("entries lock poisoned")
            .contains_key(key)
        {
            return NotFoundSnafu { key }.fail();
        }

        let context = tera::Context::from_value(options.clone()).map_err(|source| Error::Render {
            key: key.to_string(),
            source,
        })?;

        *self.render_scope.lock().expect("render scope lock poisoned") = options.clone();
        let result = self
            .tera
            .lock()
            .expect("template engine lock poisoned")
            .render(key, &context)
            .map_err(|source| Error::Render {
                key: key.to_string(),
                source,
            });
        *self.render_scope.lock().expect("render scope lock poisoned") = Value::Null;

        result
    }
}

impl Default for TemplateEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives a site password the same way the `derive_password` template
/// function does, for call sites outside the template engine (the
/// service-user injection helper in `deployment::render`).
pub fn derive_site_password(username: &str, master_password: &str, site: &str) -> String {
    masterpassword::MasterPassword::new(username, master_password)
        .derive(masterpassword::Strength::Long, site)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(template: &str) -> ServiceUserDeclaration {
        ServiceUserDeclaration {
            resource_version: "1".into(),
            username_template: template.into(),
            namespace: "openstack".into(),
        }
    }

    #[test]
    fn entry_key_matches_scope_namespace_name_shape() {
        assert_eq!(
            entry_key("cluster", "openstack", "nova"),
            "vcenter_cluster/openstack/nova.yaml.j2"
        );
    }

    #[test]
    fn rejects_prefix_conflicting_service_user_declarations() {
        let env = TemplateEnvironment::new();
        let mut decls = BTreeMap::new();
        decls.insert("nova".to_string(), decl("svc_nova_"));
        decls.insert("cinder".to_string(), decl("svc_nova_extra"));
        let err = env.replace_service_users(decls).unwrap_err();
        assert!(matches!(err, Error::UsernameTemplateDuplicate { .. }));
    }

    #[test]
    fn accepts_disjoint_service_user_declarations() {
        let env = TemplateEnvironment::new();
        let mut decls = BTreeMap::new();
        decls.insert("nova".to_string(), decl("svc_nova_"));
        decls.insert("cinder".to_string(), decl("svc_cinder_"));
        env.replace_service_users(decls).unwrap();
        assert_eq!(env.service_user_declarations().len(), 2);
    }

    #[test]
    fn renders_a_loaded_template_with_filters() {
        let env = TemplateEnvironment::new();
        let mut entries = BTreeMap::new();
        entries.insert(
            entry_key("cluster", "openstack", "nova"),
            TemplateEntry {
                resource_version: "1".into(),
                source: "value = {{ secret | ini_escape }}".into(),
                options: BTreeMap::new(),
                owner: OwnerRef {
                    api_version: "vcenter-operator.stable.sap.cc/v1alpha1".into(),
                    kind: "VCenterTemplate".into(),
                    name: "nova".into(),
                    uid: "uid-1".into(),
                },
            },
        );
        env.replace_templates(entries).unwrap();

        let rendered = env
            .render(
                &entry_key("cluster", "openstack", "nova"),
                &serde_json::json!({"secret": "a$b"}),
            )
            .unwrap();
        assert_eq!(rendered, "value = \"a$$b\"");
    }

    #[test]
    fn rendering_an_unknown_key_fails() {
        let env = TemplateEnvironment::new();
        let err = env
            .render("vcenter_cluster/openstack/missing.yaml.j2", &Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
