//! Synchronization of the registry Deployment and Service
//!
//! Drift is computed only on the fields this operator owns. Everything else
//! on the live objects (annotations from other controllers, extra env vars,
//! sidecars) is left alone, and patches only carry owned fields.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EnvVar, Service, Volume};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Api;
use kube::api::{Patch, PatchParams, PostParams};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::controller::error::Result;
use crate::controller::secret_sync::SyncOutcome;
use crate::crd::Config;
use crate::resources::FIELD_MANAGER;
use crate::resources::common::{REGISTRY_NAME, is_owned_by, pod_labels, standard_labels};
use crate::resources::deployment::{
    CONTAINER_NAME, FILESYSTEM_ROOT, MANAGED_ENV_PREFIX, STORAGE_VOLUME_NAME,
    generate_registry_deployment, registry_container,
};
use crate::resources::service::generate_registry_service;
use crate::storage::StorageDescriptor;

fn labels_cover(
    observed: Option<&BTreeMap<String, String>>,
    wanted: &BTreeMap<String, String>,
) -> bool {
    wanted
        .iter()
        .all(|(k, v)| observed.and_then(|l| l.get(k)) == Some(v))
}

fn managed_env(container: &Container) -> BTreeMap<&str, &EnvVar> {
    container
        .env
        .iter()
        .flatten()
        .filter(|e| e.name.starts_with(MANAGED_ENV_PREFIX))
        .map(|e| (e.name.as_str(), e))
        .collect()
}

fn env_matches(desired: &EnvVar, observed: &EnvVar) -> bool {
    let value = |e: &EnvVar| e.value.clone().filter(|v| !v.is_empty());
    if value(desired) != value(observed) {
        return false;
    }
    let secret_ref = |e: &EnvVar| {
        e.value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .map(|s| (s.name.clone(), s.key.clone()))
    };
    secret_ref(desired) == secret_ref(observed)
        && desired.value_from.is_some() == observed.value_from.is_some()
}

fn storage_volume_of(deployment: &Deployment) -> Option<&Volume> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == STORAGE_VOLUME_NAME)
}

fn volume_source(volume: Option<&Volume>) -> Option<(bool, Option<String>)> {
    volume.map(|v| {
        (
            v.empty_dir.is_some(),
            v.persistent_volume_claim.as_ref().map(|p| p.claim_name.clone()),
        )
    })
}

fn has_storage_mount(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == STORAGE_VOLUME_NAME && m.mount_path == FILESYSTEM_ROOT)
}

type QuantityMaps = (BTreeMap<String, String>, BTreeMap<String, String>);

fn resource_maps(container: &Container) -> QuantityMaps {
    let to_map = |m: Option<&BTreeMap<String, Quantity>>| {
        m.map(|m| m.iter().map(|(k, q)| (k.clone(), q.0.clone())).collect())
            .unwrap_or_default()
    };
    let resources = container.resources.as_ref();
    (
        to_map(resources.and_then(|r| r.limits.as_ref())),
        to_map(resources.and_then(|r| r.requests.as_ref())),
    )
}

fn node_selector(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.node_selector.clone())
        .unwrap_or_default()
}

fn template_labels(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .labels
        .as_ref()
}

/// Owned Deployment fields that differ between `desired` and `observed`
pub fn deployment_drift(
    config: &Config,
    desired: &Deployment,
    observed: &Deployment,
) -> Vec<&'static str> {
    let mut drift = Vec::new();

    let Some(want) = registry_container(desired) else {
        return drift;
    };
    let Some(have) = registry_container(observed) else {
        drift.push("container");
        return drift;
    };

    if want.image != have.image {
        drift.push("image");
    }

    let want_env = managed_env(want);
    let have_env = managed_env(have);
    let env_drift = want_env.len() != have_env.len()
        || want_env
            .iter()
            .any(|(name, e)| have_env.get(name).is_none_or(|h| !env_matches(e, h)));
    if env_drift {
        drift.push("env");
    }

    let ports_ok = want.ports.iter().flatten().all(|p| {
        have.ports
            .iter()
            .flatten()
            .any(|h| h.container_port == p.container_port && h.name == p.name)
    });
    if !ports_ok {
        drift.push("ports");
    }

    if volume_source(storage_volume_of(desired)) != volume_source(storage_volume_of(observed)) {
        drift.push("volumes");
    }
    if has_storage_mount(want) != has_storage_mount(have) {
        drift.push("volumeMounts");
    }

    if !labels_cover(observed.metadata.labels.as_ref(), &standard_labels())
        || !labels_cover(template_labels(observed), &pod_labels())
    {
        drift.push("labels");
    }

    if node_selector(desired) != node_selector(observed) {
        drift.push("nodeSelector");
    }

    if resource_maps(want) != resource_maps(have) {
        drift.push("resources");
    }

    if let Some(replicas) = config.spec.replicas
        && observed.spec.as_ref().and_then(|s| s.replicas) != Some(replicas)
    {
        drift.push("replicas");
    }

    drift
}

/// Map patch that sets `desired` and nulls keys only present in `observed`
fn map_patch(desired: &BTreeMap<String, String>, observed: &BTreeMap<String, String>) -> Value {
    let mut map = Map::new();
    for key in observed.keys() {
        map.insert(key.clone(), Value::Null);
    }
    for (key, value) in desired {
        map.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(map)
}

fn env_patch(desired: &EnvVar) -> Result<Value> {
    let mut value = serde_json::to_value(desired)?;
    if let Value::Object(map) = &mut value {
        // Switching between a literal and a secret reference must clear the other side
        if desired.value_from.is_some() {
            map.insert("value".to_string(), Value::Null);
        } else {
            map.insert("valueFrom".to_string(), Value::Null);
        }
    }
    Ok(value)
}

fn volume_patch(volume: &Volume) -> Result<Value> {
    let mut value = serde_json::to_value(volume)?;
    if let Value::Object(map) = &mut value {
        if volume.empty_dir.is_some() {
            map.insert("persistentVolumeClaim".to_string(), Value::Null);
        } else {
            map.insert("emptyDir".to_string(), Value::Null);
        }
    }
    Ok(value)
}

/// Strategic merge patch carrying every owned Deployment field
pub fn deployment_patch(
    config: &Config,
    desired: &Deployment,
    observed: &Deployment,
) -> Result<Value> {
    let empty = Container::default();
    let want = registry_container(desired).unwrap_or(&empty);
    let have = registry_container(observed).unwrap_or(&empty);

    let mut env = Vec::new();
    for var in want.env.iter().flatten() {
        env.push(env_patch(var)?);
    }
    let wanted: BTreeSet<&str> = want.env.iter().flatten().map(|e| e.name.as_str()).collect();
    for stale in managed_env(have).keys().filter(|n| !wanted.contains(*n)) {
        env.push(json!({ "name": stale, "$patch": "delete" }));
    }

    let desired_volume = storage_volume_of(desired);
    let (volumes, mounts) = match desired_volume {
        Some(volume) => (
            json!([volume_patch(volume)?]),
            serde_json::to_value(want.volume_mounts.clone().unwrap_or_default())?,
        ),
        None if storage_volume_of(observed).is_some() || has_storage_mount(have) => (
            json!([{ "name": STORAGE_VOLUME_NAME, "$patch": "delete" }]),
            json!([{ "mountPath": FILESYSTEM_ROOT, "$patch": "delete" }]),
        ),
        None => (json!([]), json!([])),
    };

    let (want_limits, want_requests) = resource_maps(want);
    let (have_limits, have_requests) = resource_maps(have);

    let mut container = json!({
        "name": CONTAINER_NAME,
        "image": want.image,
        "ports": want.ports,
        "env": env,
        "resources": {
            "limits": map_patch(&want_limits, &have_limits),
            "requests": map_patch(&want_requests, &have_requests),
        },
    });
    if mounts.as_array().is_some_and(|m| !m.is_empty()) {
        container["volumeMounts"] = mounts;
    }

    let mut pod_spec = json!({
        "containers": [container],
        "nodeSelector": map_patch(&node_selector(desired), &node_selector(observed)),
    });
    if volumes.as_array().is_some_and(|v| !v.is_empty()) {
        pod_spec["volumes"] = volumes;
    }

    let mut spec = json!({
        "template": {
            "metadata": { "labels": pod_labels() },
            "spec": pod_spec,
        },
    });
    if let Some(replicas) = config.spec.replicas {
        spec["replicas"] = json!(replicas);
    }

    Ok(json!({
        "metadata": { "labels": standard_labels() },
        "spec": spec,
    }))
}

/// Whether the Deployment's latest generation is fully rolled out
pub fn rollout_complete(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let generation = deployment.metadata.generation.unwrap_or(0);
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);

    status.observed_generation.unwrap_or(0) >= generation
        && status.updated_replicas.unwrap_or(0) >= replicas
        && status.available_replicas.unwrap_or(0) >= replicas
}

/// Owned Service fields that differ between `desired` and `observed`
pub fn service_drift(desired: &Service, observed: &Service) -> Vec<&'static str> {
    let mut drift = Vec::new();
    let (Some(want), Some(have)) = (desired.spec.as_ref(), observed.spec.as_ref()) else {
        drift.push("spec");
        return drift;
    };

    let ports_ok = want.ports.iter().flatten().all(|p| {
        have.ports.iter().flatten().any(|h| {
            h.port == p.port
                && h.name == p.name
                && h.target_port == p.target_port
                && h.protocol.as_deref().unwrap_or("TCP") == p.protocol.as_deref().unwrap_or("TCP")
        })
    });
    if !ports_ok {
        drift.push("ports");
    }
    if want.selector != have.selector {
        drift.push("selector");
    }
    if want.type_.as_deref().unwrap_or("ClusterIP") != have.type_.as_deref().unwrap_or("ClusterIP") {
        drift.push("type");
    }
    if !labels_cover(observed.metadata.labels.as_ref(), &standard_labels()) {
        drift.push("labels");
    }
    drift
}

/// Merge patch carrying every owned Service field
pub fn service_patch(desired: &Service, observed: &Service) -> Value {
    let want = desired.spec.clone().unwrap_or_default();
    let have_selector = observed
        .spec
        .as_ref()
        .and_then(|s| s.selector.clone())
        .unwrap_or_default();

    json!({
        "metadata": { "labels": standard_labels() },
        "spec": {
            "ports": want.ports,
            "selector": map_patch(&want.selector.unwrap_or_default(), &have_selector),
            "type": want.type_,
        },
    })
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Converge the registry Deployment; also reports whether it has rolled out
pub async fn sync_deployment(
    api: &Api<Deployment>,
    config: &Config,
    namespace: &str,
    descriptor: &StorageDescriptor,
    default_image: &str,
) -> Result<(SyncOutcome, bool)> {
    let desired = generate_registry_deployment(config, namespace, descriptor, default_image);

    let Some(observed) = api.get_opt(REGISTRY_NAME).await? else {
        api.create(&post_params(), &desired).await?;
        info!(deployment = REGISTRY_NAME, "Created registry deployment");
        return Ok((SyncOutcome::Created, false));
    };

    if !is_owned_by(&observed.metadata, config) {
        warn!(deployment = REGISTRY_NAME, "Registry deployment is not controlled by this Config");
    }

    let drift = deployment_drift(config, &desired, &observed);
    if drift.is_empty() {
        return Ok((SyncOutcome::Unchanged, rollout_complete(&observed)));
    }

    info!(deployment = REGISTRY_NAME, ?drift, "Correcting registry deployment drift");
    let patch = deployment_patch(config, &desired, &observed)?;
    let patched = api
        .patch(
            REGISTRY_NAME,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Strategic(&patch),
        )
        .await?;

    Ok((SyncOutcome::Updated, rollout_complete(&patched)))
}

/// Converge the registry Service
pub async fn sync_service(
    api: &Api<Service>,
    config: &Config,
    namespace: &str,
) -> Result<SyncOutcome> {
    let desired = generate_registry_service(config, namespace);

    let Some(observed) = api.get_opt(REGISTRY_NAME).await? else {
        api.create(&post_params(), &desired).await?;
        info!(service = REGISTRY_NAME, "Created registry service");
        return Ok(SyncOutcome::Created);
    };

    if !is_owned_by(&observed.metadata, config) {
        warn!(service = REGISTRY_NAME, "Registry service is not controlled by this Config");
    }

    let drift = service_drift(&desired, &observed);
    if drift.is_empty() {
        return Ok(SyncOutcome::Unchanged);
    }

    info!(service = REGISTRY_NAME, ?drift, "Correcting registry service drift");
    api.patch(
        REGISTRY_NAME,
        &PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        },
        &Patch::Merge(&service_patch(&desired, &observed)),
    )
    .await?;

    Ok(SyncOutcome::Updated)
}
