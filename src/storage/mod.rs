//! Registry storage backends
//!
//! The reconciler selects a [`DesiredStorage`] once per cycle and hands it to
//! the [`StorageProvisioner`], which creates, adopts or verifies the bucket
//! through a [`BucketApi`] obtained from the context's [`BucketApiFactory`].

pub mod azure;
pub mod credentials;
pub mod memory;
pub mod provisioner;
pub mod s3;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::{StorageBackend, StorageSpec, StorageStatus};

pub use provisioner::{StorageProvisioner, generate_bucket_name, generate_container_name};

/// Storage backend errors, classified by how the operator should react
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Credentials were rejected
    #[error("storage authentication failed: {0}")]
    Authentication(String),

    /// Network trouble, throttling, timeouts, server errors
    #[error("storage backend unavailable: {0}")]
    Transient(String),

    /// The spec asks for something the backend cannot satisfy
    #[error("invalid storage configuration: {0}")]
    Configuration(String),

    /// The request would silently change established storage identity
    #[error("storage identity change rejected: {0}")]
    InvariantViolation(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage requested by the Config, one variant per backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DesiredStorage {
    S3 {
        bucket: String,
        region: String,
        region_endpoint: Option<String>,
        encrypt: bool,
    },
    Azure {
        account_name: String,
        container: String,
    },
    EmptyDir,
    Pvc {
        claim: String,
    },
}

impl DesiredStorage {
    /// Select the backend from the spec. Exactly one backend must be set.
    pub fn from_spec(spec: &StorageSpec) -> StorageResult<Self> {
        if spec.configured_backends() != 1 {
            return Err(StorageError::Configuration(format!(
                "exactly one storage backend must be configured, found {}",
                spec.configured_backends()
            )));
        }

        if let Some(s3) = &spec.s3 {
            return Ok(DesiredStorage::S3 {
                bucket: s3.bucket.trim().to_string(),
                region: s3.region.trim().to_string(),
                region_endpoint: s3
                    .region_endpoint
                    .as_ref()
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty()),
                encrypt: s3.encrypt,
            });
        }
        if let Some(azure) = &spec.azure {
            return Ok(DesiredStorage::Azure {
                account_name: azure.account_name.trim().to_string(),
                container: azure.container.trim().to_string(),
            });
        }
        if let Some(pvc) = &spec.pvc {
            return Ok(DesiredStorage::Pvc {
                claim: pvc.claim.trim().to_string(),
            });
        }
        Ok(DesiredStorage::EmptyDir)
    }

    pub fn backend(&self) -> StorageBackend {
        match self {
            DesiredStorage::S3 { .. } => StorageBackend::S3,
            DesiredStorage::Azure { .. } => StorageBackend::Azure,
            DesiredStorage::EmptyDir => StorageBackend::EmptyDir,
            DesiredStorage::Pvc { .. } => StorageBackend::Pvc,
        }
    }
}

/// Credential material for a backend
#[derive(Clone, Default, PartialEq, Eq)]
pub enum StorageCredentials {
    #[default]
    None,
    S3 {
        access_key_id: String,
        secret_access_key: String,
    },
    Azure {
        account_key: String,
    },
}

impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageCredentials::None => write!(f, "None"),
            StorageCredentials::S3 { access_key_id, .. } => f
                .debug_struct("S3")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"***")
                .finish(),
            StorageCredentials::Azure { .. } => f
                .debug_struct("Azure")
                .field("account_key", &"***")
                .finish(),
        }
    }
}

/// What the provisioner actually established
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub backend: StorageBackend,
    /// S3 bucket or Azure container
    pub bucket: String,
    pub region: String,
    pub region_endpoint: Option<String>,
    pub account_name: String,
    pub claim: String,
    /// Bucket was created (or re-adopted) by the operator
    pub managed: bool,
    pub credentials: StorageCredentials,
}

impl StorageDescriptor {
    /// Rebuild a descriptor from persisted status and freshly loaded credentials
    pub fn from_status(status: &StorageStatus, credentials: StorageCredentials) -> Self {
        Self {
            backend: status.backend,
            bucket: status.bucket.clone(),
            region: status.region.clone(),
            region_endpoint: status.region_endpoint.clone(),
            account_name: status.account_name.clone(),
            claim: status.claim.clone(),
            managed: status.managed,
            credentials,
        }
    }

    /// The non-secret part, as persisted in `status.storage`
    pub fn to_status(&self) -> StorageStatus {
        StorageStatus {
            backend: self.backend,
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            region_endpoint: self.region_endpoint.clone(),
            account_name: self.account_name.clone(),
            claim: self.claim.clone(),
            managed: self.managed,
        }
    }
}

/// Result of looking a bucket up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketLocation {
    /// Bucket exists; region when the backend reports one
    Exists { region: Option<String> },
    Missing,
    /// Bucket exists but the credentials cannot use it
    Forbidden,
}

/// Result of a create call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The bucket already existed and belongs to these credentials
    AlreadyOwned,
}

/// Settings applied to buckets the operator creates or adopts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hardening {
    /// Default server-side encryption
    pub encrypt: bool,
    /// UID of the owning Config, recorded on the bucket
    pub owner_uid: String,
}

/// Bucket operations against one account/region
#[async_trait]
pub trait BucketApi: Send + Sync {
    async fn locate(&self, name: &str) -> StorageResult<BucketLocation>;

    async fn create(&self, name: &str, region: &str) -> StorageResult<CreateOutcome>;

    /// Block public access, enable encryption and tag the bucket
    async fn harden(&self, name: &str, hardening: &Hardening) -> StorageResult<()>;
}

/// Where bucket calls are sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketEndpoint {
    S3 {
        region: String,
        endpoint: Option<String>,
    },
    Azure {
        account_name: String,
    },
}

/// Builds [`BucketApi`] clients; swapped for an in-memory one in tests
#[async_trait]
pub trait BucketApiFactory: Send + Sync {
    async fn connect(
        &self,
        endpoint: &BucketEndpoint,
        credentials: &StorageCredentials,
    ) -> StorageResult<Box<dyn BucketApi>>;
}

/// Production factory: AWS SDK for S3, Blob REST for Azure
#[derive(Clone, Default)]
pub struct CloudBucketFactory {
    http: reqwest::Client,
}

impl CloudBucketFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketApiFactory for CloudBucketFactory {
    async fn connect(
        &self,
        endpoint: &BucketEndpoint,
        credentials: &StorageCredentials,
    ) -> StorageResult<Box<dyn BucketApi>> {
        match endpoint {
            BucketEndpoint::S3 { region, endpoint } => {
                let api = s3::S3Buckets::connect(region, endpoint.as_deref(), credentials).await?;
                Ok(Box::new(api))
            }
            BucketEndpoint::Azure { account_name } => {
                let api = azure::AzureContainers::new(self.http.clone(), account_name, credentials)?;
                Ok(Box::new(api))
            }
        }
    }
}
