use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Config is the cluster-wide description of the image registry
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "imageregistry.operator.openshift.io",
    version = "v1",
    kind = "Config",
    plural = "configs",
    status = "ConfigStatus",
    printcolumn = r#"{"name":"Management", "type":"string", "jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Storage", "type":"string", "jsonPath":".status.storage.backend"}"#,
    printcolumn = r#"{"name":"Bucket", "type":"string", "jsonPath":".status.storage.bucket"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Whether the operator manages the registry at all
    #[serde(default)]
    pub management_state: ManagementState,

    /// Storage backend for registry blobs (exactly one backend must be set)
    #[serde(default)]
    pub storage: StorageSpec,

    /// Registry replica count. The operator leaves the Deployment's replicas
    /// alone when this is unset so an autoscaler can own them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Registry image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Registry log level (error, warn, info, debug)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Put the registry into read-only maintenance mode
    #[serde(default)]
    pub read_only: bool,

    /// Resource requirements for the registry container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Node selector for registry pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl Default for ConfigSpec {
    fn default() -> Self {
        Self {
            management_state: ManagementState::default(),
            storage: StorageSpec::default(),
            replicas: None,
            image: None,
            log_level: default_log_level(),
            read_only: false,
            resources: None,
            node_selector: BTreeMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_encrypt() -> bool {
    true
}

/// Management state of the registry
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ManagementState {
    /// Operator converges all resources
    #[default]
    Managed,
    /// Operator leaves everything untouched
    Unmanaged,
    /// Registry is switched off; existing resources are left for garbage collection
    Removed,
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementState::Managed => write!(f, "Managed"),
            ManagementState::Unmanaged => write!(f, "Unmanaged"),
            ManagementState::Removed => write!(f, "Removed"),
        }
    }
}

/// Storage configuration. Exactly one field is expected to be set.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirStorageSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcStorageSpec>,
}

impl StorageSpec {
    /// Number of backends configured
    pub fn configured_backends(&self) -> usize {
        [
            self.s3.is_some(),
            self.azure.is_some(),
            self.empty_dir.is_some(),
            self.pvc.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// S3 bucket storage
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageSpec {
    /// Bucket name. Empty means the operator picks a name and creates the bucket.
    #[serde(default)]
    pub bucket: String,

    /// Bucket region. Empty means the operator default, or the region an
    /// existing bucket lives in.
    #[serde(default)]
    pub region: String,

    /// Custom S3-compatible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_endpoint: Option<String>,

    /// Server-side encryption for stored blobs
    #[serde(default = "default_encrypt")]
    pub encrypt: bool,
}

/// Azure blob container storage
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorageSpec {
    /// Storage account that holds the container
    pub account_name: String,

    /// Container name. Empty means the operator picks a name and creates it.
    #[serde(default)]
    pub container: String,
}

/// Pod-local scratch storage (data is lost with the pod)
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct EmptyDirStorageSpec {}

/// Storage on an existing PersistentVolumeClaim
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcStorageSpec {
    /// Name of the claim in the operator namespace
    pub claim: String,
}

/// Resource requirements for the registry container
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "100m", "1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "256Mi", "1Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Status of the Config resource
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ConfigPhase,

    /// Storage the operator actually provisioned or adopted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageStatus>,

    /// Last observed generation of the spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions, always in the order Available, Progressing, Degraded, Removed
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Consecutive failed reconciliations, drives the backoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<String>,

    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,
}

/// Non-secret part of the provisioned storage
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub backend: StorageBackend,

    /// S3 bucket or Azure container
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claim: String,

    /// Whether the bucket was created by the operator
    #[serde(default)]
    pub managed: bool,
}

/// Storage backend kind
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum StorageBackend {
    #[default]
    S3,
    Azure,
    EmptyDir,
    Pvc,
}

impl StorageBackend {
    /// Value of the registry's `REGISTRY_STORAGE` driver setting
    pub fn driver(&self) -> &'static str {
        match self {
            StorageBackend::S3 => "s3",
            StorageBackend::Azure => "azure",
            StorageBackend::EmptyDir | StorageBackend::Pvc => "filesystem",
        }
    }

    /// Whether the backend is an object store the operator provisions
    pub fn is_bucket(&self) -> bool {
        matches!(self, StorageBackend::S3 | StorageBackend::Azure)
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::S3 => write!(f, "S3"),
            StorageBackend::Azure => write!(f, "Azure"),
            StorageBackend::EmptyDir => write!(f, "EmptyDir"),
            StorageBackend::Pvc => write!(f, "PVC"),
        }
    }
}

/// Registry lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ConfigPhase {
    /// Nothing has been reconciled yet
    #[default]
    Pending,
    /// Storage is being provisioned or verified
    Provisioning,
    /// Secret, Deployment and Service are being converged
    Syncing,
    /// Everything converged and the registry rolled out
    Available,
    /// A fatal error stopped progress
    Degraded,
    /// Management state is Removed
    Removed,
}

impl ConfigPhase {
    pub const ALL: [ConfigPhase; 6] = [
        ConfigPhase::Pending,
        ConfigPhase::Provisioning,
        ConfigPhase::Syncing,
        ConfigPhase::Available,
        ConfigPhase::Degraded,
        ConfigPhase::Removed,
    ];
}

impl fmt::Display for ConfigPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigPhase::Pending => write!(f, "Pending"),
            ConfigPhase::Provisioning => write!(f, "Provisioning"),
            ConfigPhase::Syncing => write!(f, "Syncing"),
            ConfigPhase::Available => write!(f, "Available"),
            ConfigPhase::Degraded => write!(f, "Degraded"),
            ConfigPhase::Removed => write!(f, "Removed"),
        }
    }
}

/// Well-known condition types. Declaration order is the order in status.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ConditionType {
    Available,
    Progressing,
    Degraded,
    Removed,
}

impl ConditionType {
    pub const ALL: [ConditionType; 4] = [
        ConditionType::Available,
        ConditionType::Progressing,
        ConditionType::Degraded,
        ConditionType::Removed,
    ];
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Available => write!(f, "Available"),
            ConditionType::Progressing => write!(f, "Progressing"),
            ConditionType::Degraded => write!(f, "Degraded"),
            ConditionType::Removed => write!(f, "Removed"),
        }
    }
}

/// Condition status values
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    pub reason: String,

    pub message: String,

    pub last_transition_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
