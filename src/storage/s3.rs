//! S3 bucket operations on top of the AWS SDK

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, PublicAccessBlockConfiguration,
    ServerSideEncryption, ServerSideEncryptionByDefault, ServerSideEncryptionConfiguration,
    ServerSideEncryptionRule, Tag, Tagging,
};
use tracing::{debug, instrument};

use crate::storage::{
    BucketApi, BucketLocation, CreateOutcome, Hardening, StorageCredentials, StorageError,
    StorageResult,
};

/// Tag key recording the owning Config on operator-created buckets
pub const OWNER_TAG_KEY: &str = "imageregistry.operator.openshift.io/config-uid";

/// Region S3 reports as an empty location constraint
const US_EAST_1: &str = "us-east-1";

/// Bucket client for one region
pub struct S3Buckets {
    client: Client,
    region: String,
}

impl std::fmt::Debug for S3Buckets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Buckets")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Buckets {
    /// Build a client from static keys, optionally against a custom endpoint
    pub async fn connect(
        region: &str,
        endpoint: Option<&str>,
        credentials: &StorageCredentials,
    ) -> StorageResult<Self> {
        let StorageCredentials::S3 {
            access_key_id,
            secret_access_key,
        } = credentials
        else {
            return Err(StorageError::Configuration(
                "s3 storage requires an access key pair".to_string(),
            ));
        };

        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "image-registry-operator",
        );
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials);
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        // S3-compatible endpoints rarely support virtual-hosted buckets.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            region: region.to_string(),
        })
    }
}

impl S3Buckets {
    /// HEAD responses carry no error body. A GET on the bucket location
    /// names the error, which tells rejected keys apart from a bucket the
    /// keys may not read.
    async fn explain_forbidden(&self, name: &str) -> StorageResult<BucketLocation> {
        match self.client.get_bucket_location().bucket(name).send().await {
            Ok(output) => Ok(BucketLocation::Exists {
                region: Some(
                    output
                        .location_constraint()
                        .map(|c| c.as_str())
                        .filter(|c| !c.is_empty())
                        .unwrap_or(US_EAST_1)
                        .to_string(),
                ),
            }),
            Err(err) => {
                let code = err
                    .as_service_error()
                    .and_then(|e| e.code())
                    .unwrap_or_default();
                if credentials_rejected(code) {
                    Err(classify("get bucket location", err))
                } else {
                    Ok(BucketLocation::Forbidden)
                }
            }
        }
    }
}

#[async_trait]
impl BucketApi for S3Buckets {
    #[instrument(skip(self), fields(region = %self.region))]
    async fn locate(&self, name: &str) -> StorageResult<BucketLocation> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(output) => Ok(BucketLocation::Exists {
                region: output.bucket_region().map(str::to_string),
            }),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                {
                    return Ok(BucketLocation::Missing);
                }
                let status = err.raw_response().map(|r| r.status().as_u16());
                match status {
                    Some(404) => Ok(BucketLocation::Missing),
                    Some(403) => self.explain_forbidden(name).await,
                    // Bucket lives in another region; S3 names it in a header.
                    Some(301) => Ok(BucketLocation::Exists {
                        region: err
                            .raw_response()
                            .and_then(|r| r.headers().get("x-amz-bucket-region"))
                            .map(str::to_string),
                    }),
                    _ => Err(classify("head bucket", err)),
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn create(&self, name: &str, region: &str) -> StorageResult<CreateOutcome> {
        let mut request = self.client.create_bucket().bucket(name);
        if region != US_EAST_1 {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(err) => {
                if let Some(service) = err.as_service_error() {
                    if service.is_bucket_already_owned_by_you() {
                        return Ok(CreateOutcome::AlreadyOwned);
                    }
                    if service.is_bucket_already_exists() {
                        return Err(StorageError::Configuration(format!(
                            "bucket name {} is owned by another account",
                            name
                        )));
                    }
                }
                Err(classify("create bucket", err))
            }
        }
    }

    #[instrument(skip(self, hardening))]
    async fn harden(&self, name: &str, hardening: &Hardening) -> StorageResult<()> {
        let block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();
        self.client
            .put_public_access_block()
            .bucket(name)
            .public_access_block_configuration(block)
            .send()
            .await
            .map_err(|e| classify("put public access block", e))?;
        debug!("Blocked public access");

        if hardening.encrypt {
            let default = ServerSideEncryptionByDefault::builder()
                .sse_algorithm(ServerSideEncryption::Aes256)
                .build()
                .map_err(|e| StorageError::Configuration(e.to_string()))?;
            let rule = ServerSideEncryptionRule::builder()
                .apply_server_side_encryption_by_default(default)
                .build();
            let encryption = ServerSideEncryptionConfiguration::builder()
                .rules(rule)
                .build()
                .map_err(|e| StorageError::Configuration(e.to_string()))?;
            self.client
                .put_bucket_encryption()
                .bucket(name)
                .server_side_encryption_configuration(encryption)
                .send()
                .await
                .map_err(|e| classify("put bucket encryption", e))?;
            debug!("Enabled default encryption");
        }

        let tag = Tag::builder()
            .key(OWNER_TAG_KEY)
            .value(&hardening.owner_uid)
            .build()
            .map_err(|e| StorageError::Configuration(e.to_string()))?;
        let tagging = Tagging::builder()
            .tag_set(tag)
            .build()
            .map_err(|e| StorageError::Configuration(e.to_string()))?;
        self.client
            .put_bucket_tagging()
            .bucket(name)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| classify("put bucket tagging", e))?;
        debug!("Tagged bucket with owner");

        Ok(())
    }
}

/// Map an SDK failure onto the operator's error classes
fn classify<E>(operation: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return StorageError::Transient(format!("{}: {}", operation, err));
        }
        SdkError::ConstructionFailure(_) => {
            return StorageError::Configuration(format!("{}: {}", operation, err));
        }
        _ => {}
    }

    let status = err.raw_response().map(|r| r.status().as_u16()).unwrap_or(0);
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .unwrap_or("Unknown")
        .to_string();
    let message = format!(
        "{} failed ({} {}): {}",
        operation,
        status,
        code,
        err.as_service_error()
            .and_then(|e| e.message())
            .unwrap_or_default()
    );

    classify_status(status, &code, message)
}

/// Whether an S3 error code means the key pair itself was rejected
pub(crate) fn credentials_rejected(code: &str) -> bool {
    matches!(
        code,
        "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken"
    )
}

/// Classify by HTTP status and S3 error code
pub(crate) fn classify_status(status: u16, code: &str, message: String) -> StorageError {
    match (status, code) {
        (_, code) if credentials_rejected(code) => StorageError::Authentication(message),
        (401 | 403, _) => StorageError::Authentication(message),
        (_, "SlowDown" | "Throttling" | "RequestTimeout" | "InternalError" | "OperationAborted") => {
            StorageError::Transient(message)
        }
        (408 | 429, _) => StorageError::Transient(message),
        (s, _) if s >= 500 => StorageError::Transient(message),
        _ => StorageError::Configuration(message),
    }
}
