//! Per-scope rendering and service-user injection.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use serde_yaml::Deserializer as YamlDeserializer;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::deployment::{DeploymentState, ItemId};
use crate::reconciler::tracker::LastSeenTracker;
use crate::templates::{self, OwnerRef, TemplateEnvironment};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("template engine declares `uses-service-user: {service}` but no VCenterServiceUser declares it"))]
    ServiceUserNotFound { service: String },
    #[snafu(display("no service_users entry for path {path}"))]
    ServiceUserPathNotFound { path: String },
    #[snafu(display("failed to render template {key}"))]
    Render { key: String, source: templates::Error },
    #[snafu(display("rendered output of {key} is not valid YAML"))]
    InvalidYaml {
        key: String,
        source: serde_yaml::Error,
    },
    #[snafu(display("rendered document in {key} is missing apiVersion/kind/metadata.name"))]
    MalformedDocument { key: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// `path = "{region}/vcenter-operator/{service}/{vcenter_name}"`.
pub fn service_user_path(region: &str, service: &str, vcenter_name: &str) -> String {
    format!("{region}/vcenter-operator/{service}/{vcenter_name}")
}

/// Picks the latest version that also has a last-seen entry, iterating
/// newest-to-oldest.
pub fn pick_visible_version<'a>(
    versions: &'a [String],
    service: &str,
    host: &str,
    tracker: &LastSeenTracker,
) -> Option<&'a str> {
    versions
        .iter()
        .rev()
        .find(|v| tracker.last_seen(service, host, v).is_some())
        .map(String::as_str)
}

/// Injects `username`/`password`/`service_user_version` into `options` for a
/// template declaring `uses-service-user: S`, then renders and parses it.
/// After rendering the injected keys are removed so they cannot leak into a
/// later template on the same scope.
#[allow(clippy::too_many_arguments)]
pub fn render_template(
    environment: &TemplateEnvironment,
    key: &str,
    mut options: BTreeMap<String, Value>,
    region: &str,
    vcenter_name: &str,
    service_users: &BTreeMap<String, Vec<String>>,
    service_user_declarations: &BTreeMap<String, String>,
    tracker: &LastSeenTracker,
) -> Result<(Vec<(ItemId, Value)>, OwnerRef)> {
    let engine_options = environment.engine_options(key).unwrap_or_default();

    if let Some(Value::String(service)) = engine_options.get("uses-service-user") {
        if !service_user_declarations.contains_key(service) {
            return ServiceUserNotFoundSnafu {
                service: service.clone(),
            }
            .fail();
        }

        let path = service_user_path(region, service, vcenter_name);
        let versions = service_users
            .get(&path)
            .with_context(|| ServiceUserPathNotFoundSnafu { path: path.clone() })?;

        let version = pick_visible_version(versions, service, vcenter_name, tracker)
            .or_else(|| versions.last().map(String::as_str))
            .with_context(|| ServiceUserPathNotFoundSnafu { path: path.clone() })?
            .to_string();

        options.insert(
            "service_user_version".to_string(),
            Value::String(version.clone()),
        );
        options.insert(
            "username".to_string(),
            Value::String(format!(
                "{{{{ resolve \"vault+kvv2:///secrets/{path}/username?version={version}\" }}}}@vsphere.local"
            )),
        );
        options.insert(
            "password".to_string(),
            Value::String(format!(
                "{{{{ resolve \"vault+kvv2:///secrets/{path}/password?version={version}\" }}}}"
            )),
        );
    }

    let rendered = environment
        .render(key, &Value::Object(options.into_iter().collect()))
        .map_err(|source| Error::Render {
            key: key.to_string(),
            source,
        })?;

    let owner = environment
        .owner_of(key)
        .expect("engine_options returned Some implies the key still exists");

    let mut items = Vec::new();
    for document in YamlDeserializer::from_str(&rendered) {
        let value = Value::deserialize(document).context(InvalidYamlSnafu {
            key: key.to_string(),
        })?;
        if value.is_null() {
            continue;
        }

        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .with_context(|| MalformedDocumentSnafu {
                key: key.to_string(),
            })?
            .to_string();
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .with_context(|| MalformedDocumentSnafu {
                key: key.to_string(),
            })?
            .to_string();
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .with_context(|| MalformedDocumentSnafu {
                key: key.to_string(),
            })?
            .to_string();
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        items.push((
            ItemId {
                api_version,
                kind,
                name,
                namespace,
            },
            value,
        ));
    }

    Ok((items, owner))
}

/// Renders every template in `scope`, stamping each document's owner
/// reference and inserting into `state`.
#[allow(clippy::too_many_arguments)]
pub fn render_scope(
    environment: &TemplateEnvironment,
    scope: &str,
    base_options: &BTreeMap<String, Value>,
    region: &str,
    vcenter_name: &str,
    service_users: &BTreeMap<String, Vec<String>>,
    service_user_declarations: &BTreeMap<String, String>,
    tracker: &LastSeenTracker,
    state: &mut DeploymentState,
) -> Result<()> {
    for key in environment.keys_for_scope(scope) {
        let (items, owner) = render_template(
            environment,
            &key,
            base_options.clone(),
            region,
            vcenter_name,
            service_users,
            service_user_declarations,
            tracker,
        )?;

        for (id, mut body) in items {
            stamp_owner_reference(&mut body, &owner);
            state.insert(id, body);
        }
    }
    Ok(())
}

fn stamp_owner_reference(body: &mut Value, owner: &OwnerRef) {
    if let Some(map) = body.as_object_mut() {
        let metadata = map
            .entry("metadata".to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(metadata) = metadata.as_object_mut() {
            let owner_references = metadata
                .entry("ownerReferences".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(list) = owner_references.as_array_mut() {
                list.push(serde_json::json!({
                    "apiVersion": owner.api_version,
                    "kind": owner.kind,
                    "name": owner.name,
                    "uid": owner.uid,
                    "blockOwnerDeletion": false,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_user_path_matches_spec_shape() {
        assert_eq!(
            service_user_path("eu-de-1", "nova", "vc-ba123"),
            "eu-de-1/vcenter-operator/nova/vc-ba123"
        );
    }

    #[test]
    fn picks_newest_version_visible_in_tracker() {
        let tracker = LastSeenTracker::new();
        tracker.observe("nova", "vc-ba123", "1", 100);
        tracker.observe("nova", "vc-ba123", "2", 200);
        let versions = vec!["1".to_string(), "2".to_string()];
        assert_eq!(
            pick_visible_version(&versions, "nova", "vc-ba123", &tracker),
            Some("2")
        );
    }

    #[test]
    fn falls_back_to_older_version_when_newer_unseen() {
        let tracker = LastSeenTracker::new();
        tracker.observe("nova", "vc-ba123", "1", 100);
        let versions = vec!["1".to_string(), "2".to_string()];
        assert_eq!(
            pick_visible_version(&versions, "nova", "vc-ba123", &tracker),
            Some("1")
        );
    }

    #[test]
    fn owner_reference_is_stamped_with_block_owner_deletion_false() {
        let mut body = serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        let owner = OwnerRef {
            api_version: "vcenter-operator.stable.sap.cc/v1alpha1".to_string(),
            kind: "VCenterTemplate".to_string(),
            name: "nova".to_string(),
            uid: "uid-1".to_string(),
        };
        stamp_owner_reference(&mut body, &owner);
        let refs = body.pointer("/metadata/ownerReferences").unwrap().as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["blockOwnerDeletion"], Value::Bool(false));
    }
}
