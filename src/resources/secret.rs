use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use rand::Rng;

use crate::crd::Config;
use crate::resources::common::child_metadata;
use crate::storage::credentials::secret_value;
use crate::storage::{StorageCredentials, StorageDescriptor};

/// Secret holding the registry's credential material
pub const PRIVATE_SECRET_NAME: &str = "image-registry-private-configuration";

/// Administrator-provided secret with the same keys, read but never written
pub const USER_SECRET_NAME: &str = "image-registry-private-configuration-user";

pub const S3_ACCESS_KEY: &str = "REGISTRY_STORAGE_S3_ACCESSKEY";
pub const S3_SECRET_KEY: &str = "REGISTRY_STORAGE_S3_SECRETKEY";
pub const AZURE_ACCOUNT_KEY: &str = "REGISTRY_STORAGE_AZURE_ACCOUNTKEY";
pub const HTTP_SECRET_KEY: &str = "REGISTRY_HTTP_SECRET";

/// Generate the registry HTTP secret (signs upload state between replicas)
pub fn generate_http_secret() -> String {
    const CHARSET: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..64)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Desired payload of the private secret
///
/// The HTTP secret is taken from `existing` when present so it survives
/// every cycle.
pub fn desired_secret_data(
    descriptor: &StorageDescriptor,
    existing: Option<&Secret>,
) -> BTreeMap<String, ByteString> {
    let mut data = BTreeMap::new();
    let mut put = |key: &str, value: &str| {
        data.insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
    };

    match &descriptor.credentials {
        StorageCredentials::S3 {
            access_key_id,
            secret_access_key,
        } => {
            put(S3_ACCESS_KEY, access_key_id);
            put(S3_SECRET_KEY, secret_access_key);
        }
        StorageCredentials::Azure { account_key } => put(AZURE_ACCOUNT_KEY, account_key),
        StorageCredentials::None => {}
    }

    let http_secret = existing
        .and_then(|s| secret_value(s, HTTP_SECRET_KEY))
        .unwrap_or_else(generate_http_secret);
    put(HTTP_SECRET_KEY, &http_secret);

    data
}

/// Whether the observed secret's data differs from `desired`
pub fn secret_differs(existing: &Secret, desired: &BTreeMap<String, ByteString>) -> bool {
    existing.data.as_ref() != Some(desired)
}

/// Generate the private configuration Secret
pub fn generate_private_secret(
    config: &Config,
    namespace: &str,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: child_metadata(config, PRIVATE_SECRET_NAME, namespace),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}
