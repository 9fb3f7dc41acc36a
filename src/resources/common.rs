//! Common utilities for Kubernetes resource generation
//!
//! Shared names, labels and owner references used by every child
//! object of a Config.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::Config;

/// API version of the Config CRD
pub const API_VERSION: &str = "imageregistry.operator.openshift.io/v1";

/// Kind of the Config CRD
pub const KIND: &str = "Config";

/// Field manager name for API writes
pub const FIELD_MANAGER: &str = "image-registry-operator";

/// Name shared by the registry Deployment, Service and container
pub const REGISTRY_NAME: &str = "image-registry";

/// Port the registry listens on
pub const REGISTRY_PORT: i32 = 5000;

/// Generate an owner reference for a Config
///
/// Every child carries exactly this reference, so deleting the Config
/// garbage-collects the Deployment, Service and private secret.
pub fn owner_reference(config: &Config) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: config.name_any(),
        uid: config.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Check that `meta` has exactly one controller reference and that it points
/// at `config`
pub fn is_owned_by(meta: &ObjectMeta, config: &Config) -> bool {
    let Some(uid) = config.metadata.uid.as_deref() else {
        return false;
    };
    let controllers: Vec<&OwnerReference> = meta
        .owner_references
        .iter()
        .flatten()
        .filter(|r| r.controller == Some(true))
        .collect();

    matches!(controllers.as_slice(), [only] if only.uid == uid && only.kind == KIND)
}

/// Name of the Config controlling an object, if it is one of ours
pub fn controlling_config(meta: &ObjectMeta) -> Option<String> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true) && r.kind == KIND && r.api_version == API_VERSION)
        .map(|r| r.name.clone())
}

/// Standard labels for all resources belonging to the registry
pub fn standard_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            REGISTRY_NAME.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "registry".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Labels used to select registry pods
pub fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "docker-registry".to_string(),
        "default".to_string(),
    )])
}

/// Labels carried by the registry pod template
pub fn pod_labels() -> BTreeMap<String, String> {
    let mut labels = standard_labels();
    labels.extend(selector_labels());
    labels
}

/// Object metadata for a child of `config` in `namespace`
pub fn child_metadata(config: &Config, name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(standard_labels()),
        owner_references: Some(vec![owner_reference(config)]),
        ..Default::default()
    }
}
