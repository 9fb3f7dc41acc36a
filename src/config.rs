//! Operator process configuration
//!
//! Everything is read from environment variables with defaults, so the
//! operator runs unconfigured in the conventional namespace layout.

use std::time::Duration;

/// Default namespace for the registry and its children
pub const DEFAULT_NAMESPACE: &str = "openshift-image-registry";

/// Default registry image
pub const DEFAULT_REGISTRY_IMAGE: &str = "docker.io/library/registry:2.8.3";

/// Default region used when neither the spec nor the cluster names one
pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Runtime settings shared by all reconciles
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace holding the registry Deployment, Service and secrets
    pub namespace: String,
    /// Registry image used when the Config does not set one
    pub registry_image: String,
    /// Region for new buckets when the Config leaves it empty
    pub default_region: String,
    /// S3-compatible endpoint used for every bucket call (e.g. MinIO)
    pub s3_endpoint_override: Option<String>,
    /// Namespace of the cluster-wide cloud credential secrets
    pub credentials_namespace: String,
    pub aws_credentials_secret: String,
    pub azure_credentials_secret: String,
    /// Per-request bound for Kubernetes API calls
    pub api_timeout: Duration,
    /// Per-request bound for bucket API calls
    pub storage_timeout: Duration,
    /// Requeue interval once the registry is available
    pub resync_interval: Duration,
    /// Port for health and metrics endpoints
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let secs_or = |key: &str, default: u64| {
            Duration::from_secs(parse_or_default(lookup(key), default))
        };

        Self {
            namespace: var_or("OPERATOR_NAMESPACE", DEFAULT_NAMESPACE),
            registry_image: var_or("REGISTRY_IMAGE", DEFAULT_REGISTRY_IMAGE),
            default_region: var_or("DEFAULT_AWS_REGION", DEFAULT_AWS_REGION),
            s3_endpoint_override: lookup("S3_ENDPOINT_OVERRIDE").filter(|v| !v.trim().is_empty()),
            credentials_namespace: var_or("CLOUD_CREDENTIALS_NAMESPACE", "kube-system"),
            aws_credentials_secret: var_or("AWS_CREDENTIALS_SECRET", "aws-creds"),
            azure_credentials_secret: var_or("AZURE_CREDENTIALS_SECRET", "azure-credentials"),
            api_timeout: secs_or("API_TIMEOUT_SECS", 30),
            storage_timeout: secs_or("STORAGE_TIMEOUT_SECS", 60),
            resync_interval: secs_or("RESYNC_INTERVAL_SECS", 300),
            health_port: parse_or_default(lookup("HEALTH_PORT"), 8080),
        }
    }
}

fn parse_or_default<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
