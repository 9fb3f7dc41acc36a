//! Storage provisioning
//!
//! Decides whether the previously observed storage can be reused, and
//! otherwise verifies, creates or adopts the bucket. Every decision is
//! derived from the Config and its status, so repeating a cycle after a
//! crash converges on the same bucket.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::crd::StorageBackend;
use crate::storage::{
    BucketApiFactory, BucketEndpoint, BucketLocation, CreateOutcome, DesiredStorage, Hardening,
    StorageCredentials, StorageDescriptor, StorageError, StorageResult,
};

/// Prefix of generated bucket and container names
pub const BUCKET_PREFIX: &str = "image-registry";

/// Longest name S3 and Azure accept
const MAX_BUCKET_NAME_LEN: usize = 63;

/// Generate the S3 bucket name for a Config
///
/// The suffix is the Config UID, so the name is stable for one Config and
/// unique across clusters.
pub fn generate_bucket_name(region: &str, owner_uid: &str) -> String {
    sanitize_name(&format!("{}-{}-{}", BUCKET_PREFIX, region, compact_uid(owner_uid)))
}

/// Generate the Azure container name for a Config
pub fn generate_container_name(owner_uid: &str) -> String {
    sanitize_name(&format!("{}-{}", BUCKET_PREFIX, compact_uid(owner_uid)))
}

fn compact_uid(uid: &str) -> String {
    uid.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Lowercase, replace anything outside `[a-z0-9-]`, collapse dash runs and cap
/// the length without leaving a trailing dash
fn sanitize_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && name.ends_with('-') {
            continue;
        }
        name.push(c);
    }
    name.truncate(MAX_BUCKET_NAME_LEN);
    name.trim_matches('-').to_string()
}

/// One bucket-capable request, shared by S3 and Azure
struct BucketRequest<'a> {
    backend: StorageBackend,
    name: &'a str,
    region: &'a str,
    account_name: &'a str,
    region_endpoint: Option<String>,
    encrypt: bool,
}

/// Provisions storage for one Config
pub struct StorageProvisioner<'a> {
    buckets: &'a dyn BucketApiFactory,
    owner_uid: &'a str,
    default_region: String,
    endpoint_override: Option<String>,
    timeout: Duration,
}

impl<'a> StorageProvisioner<'a> {
    pub fn new(buckets: &'a dyn BucketApiFactory, owner_uid: &'a str) -> Self {
        Self {
            buckets,
            owner_uid,
            default_region: crate::config::DEFAULT_AWS_REGION.to_string(),
            endpoint_override: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_default_region(mut self, region: impl Into<String>) -> Self {
        self.default_region = region.into();
        self
    }

    pub fn with_endpoint_override(mut self, endpoint: Option<String>) -> Self {
        self.endpoint_override = endpoint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Produce a descriptor for `desired`, reusing `observed` when consistent
    #[instrument(skip_all, fields(backend = %desired.backend()))]
    pub async fn provision(
        &self,
        desired: &DesiredStorage,
        observed: Option<&StorageDescriptor>,
        credentials: StorageCredentials,
    ) -> StorageResult<StorageDescriptor> {
        match desired {
            DesiredStorage::EmptyDir => Ok(StorageDescriptor {
                backend: StorageBackend::EmptyDir,
                ..Default::default()
            }),
            DesiredStorage::Pvc { claim } => {
                if claim.is_empty() {
                    return Err(StorageError::Configuration(
                        "pvc storage requires a claim name".to_string(),
                    ));
                }
                Ok(StorageDescriptor {
                    backend: StorageBackend::Pvc,
                    claim: claim.clone(),
                    ..Default::default()
                })
            }
            DesiredStorage::S3 {
                bucket,
                region,
                region_endpoint,
                encrypt,
            } => {
                let request = BucketRequest {
                    backend: StorageBackend::S3,
                    name: bucket,
                    region,
                    account_name: "",
                    region_endpoint: region_endpoint
                        .clone()
                        .or_else(|| self.endpoint_override.clone()),
                    encrypt: *encrypt,
                };
                self.provision_bucket(request, observed, credentials).await
            }
            DesiredStorage::Azure {
                account_name,
                container,
            } => {
                if account_name.is_empty() {
                    return Err(StorageError::Configuration(
                        "azure storage requires an account name".to_string(),
                    ));
                }
                let request = BucketRequest {
                    backend: StorageBackend::Azure,
                    name: container,
                    region: "",
                    account_name,
                    region_endpoint: None,
                    encrypt: true,
                };
                self.provision_bucket(request, observed, credentials).await
            }
        }
    }

    async fn provision_bucket(
        &self,
        request: BucketRequest<'_>,
        observed: Option<&StorageDescriptor>,
        credentials: StorageCredentials,
    ) -> StorageResult<StorageDescriptor> {
        if let Some(previous) = reusable(&request, observed)? {
            debug!(bucket = %previous.bucket, "Storage already provisioned, reusing");
            let mut descriptor = previous.clone();
            descriptor.region_endpoint = request.region_endpoint;
            descriptor.credentials = credentials;
            return Ok(descriptor);
        }

        if self.owner_uid.is_empty() {
            return Err(StorageError::InvariantViolation(
                "cannot derive a bucket name for a Config without a UID".to_string(),
            ));
        }

        let region = match request.backend {
            StorageBackend::S3 if request.region.is_empty() => self.default_region.clone(),
            StorageBackend::S3 => request.region.to_string(),
            _ => String::new(),
        };
        let endpoint = match request.backend {
            StorageBackend::Azure => BucketEndpoint::Azure {
                account_name: request.account_name.to_string(),
            },
            _ => BucketEndpoint::S3 {
                region: region.clone(),
                endpoint: request.region_endpoint.clone(),
            },
        };
        let api = self
            .bounded("connect", self.buckets.connect(&endpoint, &credentials))
            .await?;

        let mut descriptor = StorageDescriptor {
            backend: request.backend,
            region,
            region_endpoint: request.region_endpoint.clone(),
            account_name: request.account_name.to_string(),
            credentials,
            ..Default::default()
        };

        if !request.name.is_empty() {
            // Administrator-owned bucket: verify, never create.
            let location = self.bounded("locate", api.locate(request.name)).await?;
            descriptor.bucket = request.name.to_string();
            descriptor.managed = false;
            match location {
                BucketLocation::Exists { region: actual } => {
                    if request.backend == StorageBackend::S3 {
                        descriptor.region =
                            resolve_region(request.name, request.region, actual, &descriptor.region)?;
                    }
                    info!(bucket = %descriptor.bucket, region = %descriptor.region, "Using existing bucket");
                    return Ok(descriptor);
                }
                BucketLocation::Missing => {
                    return Err(StorageError::Configuration(format!(
                        "bucket {} does not exist",
                        request.name
                    )));
                }
                BucketLocation::Forbidden => {
                    return Err(StorageError::Configuration(format!(
                        "bucket {} is not accessible with the configured credentials",
                        request.name
                    )));
                }
            }
        }

        let name = match request.backend {
            StorageBackend::Azure => generate_container_name(self.owner_uid),
            _ => generate_bucket_name(&descriptor.region, self.owner_uid),
        };

        match self
            .bounded("create", api.create(&name, &descriptor.region))
            .await?
        {
            CreateOutcome::Created => info!(bucket = %name, region = %descriptor.region, "Created bucket"),
            CreateOutcome::AlreadyOwned => info!(bucket = %name, "Adopted bucket created by an earlier cycle"),
        }

        let hardening = Hardening {
            encrypt: request.encrypt,
            owner_uid: self.owner_uid.to_string(),
        };
        self.bounded("harden", api.harden(&name, &hardening)).await?;

        descriptor.bucket = name;
        descriptor.managed = true;
        Ok(descriptor)
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Transient(format!(
                "{} timed out after {}s",
                operation,
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Return the observed descriptor when it already satisfies the request
///
/// A different bucket is only accepted when the request names it explicitly
/// or the backend changed. Asking an established bucket to move region is an
/// error.
fn reusable<'o>(
    request: &BucketRequest<'_>,
    observed: Option<&'o StorageDescriptor>,
) -> StorageResult<Option<&'o StorageDescriptor>> {
    let Some(previous) = observed else {
        return Ok(None);
    };
    if previous.backend != request.backend || previous.bucket.is_empty() {
        return Ok(None);
    }
    if !request.name.is_empty() && request.name != previous.bucket {
        return Ok(None);
    }
    if request.backend == StorageBackend::Azure && request.account_name != previous.account_name {
        return Ok(None);
    }
    if !request.region.is_empty() && !previous.region.is_empty() && request.region != previous.region
    {
        return Err(StorageError::InvariantViolation(format!(
            "bucket {} lives in region {}, cannot move it to {}",
            previous.bucket, previous.region, request.region
        )));
    }
    Ok(Some(previous))
}

fn resolve_region(
    bucket: &str,
    requested: &str,
    actual: Option<String>,
    fallback: &str,
) -> StorageResult<String> {
    match (requested.is_empty(), actual.filter(|r| !r.is_empty())) {
        (true, Some(actual)) => Ok(actual),
        (true, None) => Ok(fallback.to_string()),
        (false, Some(actual)) if actual != requested => Err(StorageError::Configuration(format!(
            "bucket {} is in region {}, not {}",
            bucket, actual, requested
        ))),
        (false, _) => Ok(requested.to_string()),
    }
}
