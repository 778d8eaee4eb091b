//! Server-side apply / replace-on-conflict / delete.
//!
//! One pass of creates/updates with a single retry queue for unprocessable
//! entities, then a delete pass where 404 is benign.

use kube::api::{DynamicObject, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Api, Client};
use snafu::{ResultExt, Snafu};

use crate::deployment::{Delta, ItemId};

pub const FIELD_MANAGER: &str = "vcenter-operator";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to apply {kind}/{name} in {namespace}"))]
    Apply {
        kind: String,
        name: String,
        namespace: String,
        source: kube::Error,
    },
    #[snafu(display("failed to replace {kind}/{name} in {namespace} after conflicting apply"))]
    Replace {
        kind: String,
        name: String,
        namespace: String,
        source: kube::Error,
    },
    #[snafu(display("failed to delete {kind}/{name} in {namespace}"))]
    Delete {
        kind: String,
        name: String,
        namespace: String,
        source: kube::Error,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

fn api_for(client: &Client, id: &ItemId) -> Api<DynamicObject> {
    let (group, version) = match id.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), id.api_version.clone()),
    };
    let gvk = GroupVersionKind::gvk(&group, &version, &id.kind);
    let resource = ApiResource::from_gvk(&gvk);

    if id.namespace.is_empty() {
        Api::all_with(client.clone(), &resource)
    } else {
        Api::namespaced_with(client.clone(), &id.namespace, &resource)
    }
}

fn is_unprocessable(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 422)
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 409)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 404)
}

async fn apply_one(
    client: &Client,
    id: &ItemId,
    body: &serde_json::Value,
) -> std::result::Result<(), kube::Error> {
    let api = api_for(client, id);

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let dynamic_object: DynamicObject =
        serde_json::from_value(body.clone()).expect("render.rs only produces object documents");

    match api.patch(&id.name, &params, &Patch::Apply(&dynamic_object)).await {
        Ok(_) => Ok(()),
        Err(error) if is_conflict(&error) => {
            api.replace(&id.name, &Default::default(), &dynamic_object)
                .await
                .map(|_| ())
        }
        Err(error) => Err(error),
    }
}

/// Applies every create/update in `delta`, retrying HTTP 422s once, then
/// processes deletes with 404 treated as benign.
pub async fn apply(client: &Client, delta: &Delta) -> Result<()> {
    let mut retry = Vec::new();

    for (id, body) in delta.items() {
        match apply_one(client, id, body).await {
            Ok(()) => {}
            Err(error) if is_unprocessable(&error) => {
                tracing::debug!(?id, "apply returned 422, queued for retry");
                retry.push((id.clone(), body.clone()));
            }
            Err(source) => {
                return ApplySnafu {
                    kind: id.kind.clone(),
                    name: id.name.clone(),
                    namespace: id.namespace.clone(),
                    source,
                }
                .fail()
            }
        }
    }

    for (id, body) in retry {
        if let Err(source) = apply_one(client, &id, &body).await {
            tracing::error!(?id, error = %source, "retry of unprocessable apply failed");
            return ApplySnafu {
                kind: id.kind,
                name: id.name,
                namespace: id.namespace,
                source,
            }
            .fail();
        }
    }

    for id in delta.deletes() {
        let api = api_for(client, id);
        match api.delete(&id.name, &Default::default()).await {
            Ok(_) => {}
            Err(error) if is_not_found(&error) => {}
            Err(source) => {
                return DeleteSnafu {
                    kind: id.kind.clone(),
                    name: id.name.clone(),
                    namespace: id.namespace.clone(),
                    source,
                }
                .fail()
            }
        }
    }

    Ok(())
}
