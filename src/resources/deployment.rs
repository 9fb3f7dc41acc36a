//! Registry Deployment generation
//!
//! Storage settings reach the registry through `REGISTRY_*` environment
//! variables. Credentials are never written as literals; they are sourced
//! from the private configuration secret by key.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{Config, ResourceList, StorageBackend};
use crate::resources::common::{
    REGISTRY_NAME, REGISTRY_PORT, child_metadata, pod_labels, selector_labels,
};
use crate::resources::secret::{
    AZURE_ACCOUNT_KEY, HTTP_SECRET_KEY, PRIVATE_SECRET_NAME, S3_ACCESS_KEY, S3_SECRET_KEY,
};
use crate::storage::StorageDescriptor;

/// Name of the registry container
pub const CONTAINER_NAME: &str = "registry";

/// Volume backing filesystem storage
pub const STORAGE_VOLUME_NAME: &str = "registry-storage";

/// Mount point of the filesystem storage volume
pub const FILESYSTEM_ROOT: &str = "/registry";

/// Prefix of every environment variable the operator owns
pub const MANAGED_ENV_PREFIX: &str = "REGISTRY_";

fn literal(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn from_secret(name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: PRIVATE_SECRET_NAME.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Environment variables for the registry container
pub fn registry_env_vars(config: &Config, descriptor: &StorageDescriptor) -> Vec<EnvVar> {
    let mut env = vec![literal("REGISTRY_STORAGE", descriptor.backend.driver())];

    match descriptor.backend {
        StorageBackend::S3 => {
            env.push(literal("REGISTRY_STORAGE_S3_BUCKET", &descriptor.bucket));
            env.push(literal("REGISTRY_STORAGE_S3_REGION", &descriptor.region));
            if let Some(endpoint) = &descriptor.region_endpoint {
                env.push(literal("REGISTRY_STORAGE_S3_REGIONENDPOINT", endpoint));
            }
            let encrypt = config
                .spec
                .storage
                .s3
                .as_ref()
                .map(|s3| s3.encrypt)
                .unwrap_or(true);
            env.push(literal("REGISTRY_STORAGE_S3_ENCRYPT", encrypt.to_string()));
            env.push(from_secret("REGISTRY_STORAGE_S3_ACCESSKEY", S3_ACCESS_KEY));
            env.push(from_secret("REGISTRY_STORAGE_S3_SECRETKEY", S3_SECRET_KEY));
        }
        StorageBackend::Azure => {
            env.push(literal("REGISTRY_STORAGE_AZURE_CONTAINER", &descriptor.bucket));
            env.push(literal(
                "REGISTRY_STORAGE_AZURE_ACCOUNTNAME",
                &descriptor.account_name,
            ));
            env.push(from_secret(
                "REGISTRY_STORAGE_AZURE_ACCOUNTKEY",
                AZURE_ACCOUNT_KEY,
            ));
        }
        StorageBackend::EmptyDir | StorageBackend::Pvc => {
            env.push(literal(
                "REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY",
                FILESYSTEM_ROOT,
            ));
        }
    }

    env.push(literal("REGISTRY_HTTP_ADDR", format!(":{}", REGISTRY_PORT)));
    env.push(literal("REGISTRY_HTTP_NET", "tcp"));
    env.push(from_secret("REGISTRY_HTTP_SECRET", HTTP_SECRET_KEY));
    env.push(literal("REGISTRY_LOG_LEVEL", &config.spec.log_level));
    if config.spec.read_only {
        env.push(literal(
            "REGISTRY_STORAGE_MAINTENANCE_READONLY",
            r#"{"enabled":true}"#,
        ));
    }

    env
}

/// Volume for filesystem-backed storage
pub fn storage_volume(descriptor: &StorageDescriptor) -> Option<Volume> {
    match descriptor.backend {
        StorageBackend::EmptyDir => Some(Volume {
            name: STORAGE_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }),
        StorageBackend::Pvc => Some(Volume {
            name: STORAGE_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: descriptor.claim.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        StorageBackend::S3 | StorageBackend::Azure => None,
    }
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Container resources from the Config
pub fn container_resources(config: &Config) -> Option<ResourceRequirements> {
    config
        .spec
        .resources
        .as_ref()
        .map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(quantities),
            requests: r.requests.as_ref().map(quantities),
            ..Default::default()
        })
}

fn http_health_check(initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(REGISTRY_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        timeout_seconds: Some(5),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Generate the registry Deployment
///
/// `spec.replicas` is only set when the Config sets it.
pub fn generate_registry_deployment(
    config: &Config,
    namespace: &str,
    descriptor: &StorageDescriptor,
    default_image: &str,
) -> Deployment {
    let image = config
        .spec
        .image
        .clone()
        .unwrap_or_else(|| default_image.to_string());

    let volume = storage_volume(descriptor);
    let volume_mounts = volume.as_ref().map(|v| {
        vec![VolumeMount {
            name: v.name.clone(),
            mount_path: FILESYSTEM_ROOT.to_string(),
            ..Default::default()
        }]
    });

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image),
        ports: Some(vec![ContainerPort {
            container_port: REGISTRY_PORT,
            name: Some("registry".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(registry_env_vars(config, descriptor)),
        volume_mounts,
        resources: container_resources(config),
        readiness_probe: Some(http_health_check(1)),
        liveness_probe: Some(http_health_check(10)),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let node_selector = if config.spec.node_selector.is_empty() {
        None
    } else {
        Some(config.spec.node_selector.clone())
    };

    Deployment {
        metadata: child_metadata(config, REGISTRY_NAME, namespace),
        spec: Some(DeploymentSpec {
            replicas: config.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: volume.map(|v| vec![v]),
                    node_selector,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The registry container of a Deployment, if present
pub fn registry_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
}
