//! Cloud credential discovery
//!
//! The user secret in the operator namespace wins; otherwise the cluster's
//! cloud credential secret is used.

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::StorageBackend;
use crate::resources::secret::{
    AZURE_ACCOUNT_KEY, S3_ACCESS_KEY, S3_SECRET_KEY, USER_SECRET_NAME,
};
use crate::storage::StorageCredentials;

/// Keys of the cluster AWS credentials secret
pub const AWS_ACCESS_KEY_ID: &str = "aws_access_key_id";
pub const AWS_SECRET_ACCESS_KEY: &str = "aws_secret_access_key";

/// Key of the cluster Azure credentials secret
pub const AZURE_STORAGE_ACCOUNT_KEY: &str = "azure_storage_account_key";

/// Read a key from `data`, falling back to `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok());
    from_data
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key).cloned()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Pick credentials for `backend` from the user and cluster secrets
pub fn credentials_from_secrets(
    backend: StorageBackend,
    user: Option<&Secret>,
    cluster: Option<&Secret>,
) -> Option<StorageCredentials> {
    match backend {
        StorageBackend::S3 => {
            let pair = |secret: &Secret, id: &str, key: &str| {
                Some(StorageCredentials::S3 {
                    access_key_id: secret_value(secret, id)?,
                    secret_access_key: secret_value(secret, key)?,
                })
            };
            user.and_then(|s| pair(s, S3_ACCESS_KEY, S3_SECRET_KEY))
                .or_else(|| cluster.and_then(|s| pair(s, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY)))
        }
        StorageBackend::Azure => {
            let key = |secret: &Secret, name: &str| {
                secret_value(secret, name).map(|account_key| StorageCredentials::Azure { account_key })
            };
            user.and_then(|s| key(s, AZURE_ACCOUNT_KEY))
                .or_else(|| cluster.and_then(|s| key(s, AZURE_STORAGE_ACCOUNT_KEY)))
        }
        StorageBackend::EmptyDir | StorageBackend::Pvc => Some(StorageCredentials::None),
    }
}

/// Load credentials for `backend` from the cluster
pub async fn load_credentials(
    client: &Client,
    config: &OperatorConfig,
    backend: StorageBackend,
) -> Result<StorageCredentials> {
    if !backend.is_bucket() {
        return Ok(StorageCredentials::None);
    }

    let user_api: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let user = user_api.get_opt(USER_SECRET_NAME).await?;

    let cluster_secret_name = match backend {
        StorageBackend::Azure => &config.azure_credentials_secret,
        _ => &config.aws_credentials_secret,
    };
    let cluster_api: Api<Secret> = Api::namespaced(client.clone(), &config.credentials_namespace);
    let cluster = cluster_api.get_opt(cluster_secret_name).await?;

    debug!(
        user_secret = user.is_some(),
        cluster_secret = cluster.is_some(),
        "Resolving storage credentials"
    );

    credentials_from_secrets(backend, user.as_ref(), cluster.as_ref()).ok_or_else(|| {
        Error::MissingCredentials(format!(
            "no {} credentials in {}/{} or {}/{}",
            backend,
            config.namespace,
            USER_SECRET_NAME,
            config.credentials_namespace,
            cluster_secret_name
        ))
    })
}
