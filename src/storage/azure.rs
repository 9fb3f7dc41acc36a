//! Azure blob container operations over the Blob REST API
//!
//! Requests are signed with the storage account's shared key.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::storage::{
    BucketApi, BucketLocation, CreateOutcome, Hardening, StorageCredentials, StorageError,
    StorageResult,
};

/// Blob service REST version
const API_VERSION: &str = "2021-08-06";

/// Metadata key recording the owning Config
pub const OWNER_METADATA_KEY: &str = "x-ms-meta-imageregistryconfiguid";

/// Container client for one storage account
pub struct AzureContainers {
    http: reqwest::Client,
    account_name: String,
    account_key: Vec<u8>,
    endpoint: String,
}

impl std::fmt::Debug for AzureContainers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureContainers")
            .field("account_name", &self.account_name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl AzureContainers {
    pub fn new(
        http: reqwest::Client,
        account_name: &str,
        credentials: &StorageCredentials,
    ) -> StorageResult<Self> {
        let StorageCredentials::Azure { account_key } = credentials else {
            return Err(StorageError::Configuration(
                "azure storage requires an account key".to_string(),
            ));
        };
        let account_key = STANDARD.decode(account_key.trim()).map_err(|e| {
            StorageError::Configuration(format!("azure account key is not valid base64: {}", e))
        })?;

        Ok(Self {
            http,
            account_name: account_name.to_string(),
            account_key,
            endpoint: format!("https://{}.blob.core.windows.net", account_name),
        })
    }

    async fn send(
        &self,
        method: Method,
        container: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, &str)],
    ) -> StorageResult<reqwest::Response> {
        let mut ms_headers = BTreeMap::from([
            (
                "x-ms-date".to_string(),
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            ),
            ("x-ms-version".to_string(), API_VERSION.to_string()),
        ]);
        for (name, value) in extra_headers {
            ms_headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
        let query_map: BTreeMap<String, String> = query
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();

        let to_sign = string_to_sign(
            method.as_str(),
            &ms_headers,
            &self.account_name,
            container,
            &query_map,
        );
        let signature = sign(&self.account_key, &to_sign)?;

        let mut request = self
            .http
            .request(method.clone(), format!("{}/{}", self.endpoint, container))
            .query(query)
            .header(
                "Authorization",
                format!("SharedKey {}:{}", self.account_name, signature),
            );
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if method == Method::PUT {
            request = request.header("Content-Length", "0");
        }

        request.send().await.map_err(|e| {
            StorageError::Transient(format!("azure request to {} failed: {}", self.endpoint, e))
        })
    }
}

#[async_trait]
impl BucketApi for AzureContainers {
    #[instrument(skip(self), fields(account = %self.account_name))]
    async fn locate(&self, name: &str) -> StorageResult<BucketLocation> {
        let response = self
            .send(Method::HEAD, name, &[("restype", "container")], &[])
            .await?;
        locate_result(response.status(), error_code(&response))
    }

    #[instrument(skip(self, _region), fields(account = %self.account_name))]
    async fn create(&self, name: &str, _region: &str) -> StorageResult<CreateOutcome> {
        let response = self
            .send(Method::PUT, name, &[("restype", "container")], &[])
            .await?;
        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(CreateOutcome::Created);
        }
        let code = error_code(&response);
        match (status, code.as_str()) {
            // Container names are scoped to the account, so it is ours.
            (StatusCode::CONFLICT, "ContainerAlreadyExists") => Ok(CreateOutcome::AlreadyOwned),
            (StatusCode::CONFLICT, "ContainerBeingDeleted") => Err(StorageError::Transient(
                format!("container {} is being deleted", name),
            )),
            _ => Err(classify("create container", status, code)),
        }
    }

    /// Containers are created private and encrypted at rest by the service;
    /// only the owner metadata needs setting.
    #[instrument(skip(self, hardening), fields(account = %self.account_name))]
    async fn harden(&self, name: &str, hardening: &Hardening) -> StorageResult<()> {
        let response = self
            .send(
                Method::PUT,
                name,
                &[("comp", "metadata"), ("restype", "container")],
                &[(OWNER_METADATA_KEY, hardening.owner_uid.as_str())],
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify("set container metadata", status, error_code(&response)));
        }
        debug!("Recorded owner metadata on container");
        Ok(())
    }
}

fn error_code(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("Unknown")
        .to_string()
}

/// Error codes for a shared key the service rejected
const REJECTED_KEY_CODES: [&str; 2] = ["AuthenticationFailed", "InvalidAuthenticationInfo"];

/// Interpret a container HEAD response. A 403 only means "not accessible"
/// when the key itself was accepted.
fn locate_result(status: StatusCode, code: String) -> StorageResult<BucketLocation> {
    match status {
        s if s.is_success() => Ok(BucketLocation::Exists { region: None }),
        StatusCode::NOT_FOUND => Ok(BucketLocation::Missing),
        StatusCode::FORBIDDEN if !REJECTED_KEY_CODES.contains(&code.as_str()) => {
            Ok(BucketLocation::Forbidden)
        }
        s => Err(classify("get container properties", s, code)),
    }
}

fn classify(operation: &str, status: StatusCode, code: String) -> StorageError {
    let message = format!("{} failed ({} {})", operation, status.as_u16(), code);
    match status.as_u16() {
        401 | 403 => StorageError::Authentication(message),
        408 | 429 => StorageError::Transient(message),
        s if s >= 500 => StorageError::Transient(message),
        _ => StorageError::Configuration(message),
    }
}

/// Build the SharedKey string-to-sign for a request with no body
///
/// `ms_headers` and `query` must have lowercase keys.
pub(crate) fn string_to_sign(
    method: &str,
    ms_headers: &BTreeMap<String, String>,
    account: &str,
    container: &str,
    query: &BTreeMap<String, String>,
) -> String {
    // Content-Encoding .. Range: all empty for bodiless requests.
    let mut out = format!("{}\n\n\n\n\n\n\n\n\n\n\n\n", method);
    for (name, value) in ms_headers {
        out.push_str(&format!("{}:{}\n", name, value.trim()));
    }
    out.push_str(&format!("/{}/{}", account, container));
    for (name, value) in query {
        out.push_str(&format!("\n{}:{}", name, value));
    }
    out
}

fn sign(key: &[u8], to_sign: &str) -> StorageResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| StorageError::Configuration(format!("invalid azure account key: {}", e)))?;
    mac.update(to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
