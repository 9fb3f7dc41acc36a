//! Validation of the Config spec
//!
//! Runs at the start of every managed cycle. A failure is a configuration
//! error: the Config goes Degraded until the spec changes.

use crate::controller::error::{Error, Result};
use crate::crd::{AzureStorageSpec, Config, S3StorageSpec};

/// Maximum number of replicas (arbitrary limit for safety)
pub const MAX_REPLICAS: i32 = 100;

/// Log levels the registry accepts
pub const LOG_LEVELS: [&str; 4] = ["error", "warn", "info", "debug"];

/// Validate the Config spec
pub fn validate_spec(config: &Config) -> Result<()> {
    validate_replicas(config.spec.replicas)?;
    validate_log_level(&config.spec.log_level)?;

    let storage = &config.spec.storage;
    match storage.configured_backends() {
        0 => {
            return Err(Error::ValidationError(
                "spec.storage must configure a backend".to_string(),
            ));
        }
        1 => {}
        n => {
            return Err(Error::ValidationError(format!(
                "spec.storage configures {} backends, exactly one is allowed",
                n
            )));
        }
    }

    if let Some(s3) = &storage.s3 {
        validate_s3(s3)?;
    }
    if let Some(azure) = &storage.azure {
        validate_azure(azure)?;
    }
    if let Some(pvc) = &storage.pvc
        && pvc.claim.trim().is_empty()
    {
        return Err(Error::ValidationError(
            "spec.storage.pvc.claim must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_replicas(replicas: Option<i32>) -> Result<()> {
    match replicas {
        Some(r) if r < 0 => Err(Error::ValidationError(format!(
            "replica count {} must not be negative",
            r
        ))),
        Some(r) if r > MAX_REPLICAS => Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            r, MAX_REPLICAS
        ))),
        _ => Ok(()),
    }
}

fn validate_log_level(level: &str) -> Result<()> {
    if LOG_LEVELS.contains(&level) {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "logLevel {:?} must be one of {}",
            level,
            LOG_LEVELS.join(", ")
        )))
    }
}

fn validate_s3(s3: &S3StorageSpec) -> Result<()> {
    let bucket = s3.bucket.trim();
    if !bucket.is_empty() && !is_valid_bucket_name(bucket) {
        return Err(Error::ValidationError(format!(
            "spec.storage.s3.bucket {:?} is not a valid bucket name",
            bucket
        )));
    }
    if let Some(endpoint) = s3.region_endpoint.as_deref().map(str::trim)
        && !endpoint.is_empty()
        && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
    {
        return Err(Error::ValidationError(format!(
            "spec.storage.s3.regionEndpoint {:?} must be an http(s) URL",
            endpoint
        )));
    }
    Ok(())
}

fn validate_azure(azure: &AzureStorageSpec) -> Result<()> {
    if !is_valid_account_name(azure.account_name.trim()) {
        return Err(Error::ValidationError(format!(
            "spec.storage.azure.accountName {:?} must be 3-24 lowercase letters or digits",
            azure.account_name
        )));
    }
    let container = azure.container.trim();
    if !container.is_empty() && !is_valid_container_name(container) {
        return Err(Error::ValidationError(format!(
            "spec.storage.azure.container {:?} is not a valid container name",
            container
        )));
    }
    Ok(())
}

/// S3 bucket naming: 3-63 characters of lowercase letters, digits, dots and
/// hyphens, starting and ending with a letter or digit
pub fn is_valid_bucket_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
        && starts_and_ends_alphanumeric(name)
        && !name.contains("..")
}

/// Azure container naming: 3-63 characters of lowercase letters, digits and
/// single hyphens, starting and ending with a letter or digit
pub fn is_valid_container_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && starts_and_ends_alphanumeric(name)
        && !name.contains("--")
}

/// Azure storage account naming: 3-24 lowercase letters or digits
pub fn is_valid_account_name(name: &str) -> bool {
    (3..=24).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn starts_and_ends_alphanumeric(name: &str) -> bool {
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    alnum(name.chars().next()) && alnum(name.chars().last())
}
