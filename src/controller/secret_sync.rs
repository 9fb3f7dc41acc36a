//! Synchronization of the private configuration secret

use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kube::api::PostParams;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::crd::Config;
use crate::resources::FIELD_MANAGER;
use crate::resources::common::is_owned_by;
use crate::resources::secret::{
    PRIVATE_SECRET_NAME, desired_secret_data, generate_private_secret, secret_differs,
};
use crate::storage::StorageDescriptor;

/// Attempts before a persistent 409 is reported
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// What a synchronizer did to its object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

impl SyncOutcome {
    /// Whether a write was issued
    pub fn changed(&self) -> bool {
        !matches!(self, SyncOutcome::Unchanged)
    }
}

/// Write needed to bring the secret in line
#[derive(Debug, Clone)]
pub enum SecretPlan {
    Create(Secret),
    /// Full object to replace with; carries the observed `resourceVersion`
    Replace(Secret),
    Unchanged,
}

/// Decide what to write given the observed secret
pub fn plan_private_secret(
    config: &Config,
    namespace: &str,
    descriptor: &StorageDescriptor,
    existing: Option<&Secret>,
) -> SecretPlan {
    let desired = desired_secret_data(descriptor, existing);
    match existing {
        None => SecretPlan::Create(generate_private_secret(config, namespace, desired)),
        Some(secret) if secret_differs(secret, &desired) => {
            let mut updated = secret.clone();
            updated.data = Some(desired);
            updated.string_data = None;
            SecretPlan::Replace(updated)
        }
        Some(_) => SecretPlan::Unchanged,
    }
}

/// Ensure the private configuration secret holds the descriptor's credentials
pub async fn sync_private_secret(
    api: &Api<Secret>,
    config: &Config,
    namespace: &str,
    descriptor: &StorageDescriptor,
) -> Result<SyncOutcome> {
    let pp = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let existing = api.get_opt(PRIVATE_SECRET_NAME).await?;
        if let Some(secret) = &existing
            && !is_owned_by(&secret.metadata, config)
        {
            warn!(
                secret = PRIVATE_SECRET_NAME,
                "Private secret is not controlled by this Config; updating in place"
            );
        }

        let result = match plan_private_secret(config, namespace, descriptor, existing.as_ref()) {
            SecretPlan::Unchanged => return Ok(SyncOutcome::Unchanged),
            SecretPlan::Create(secret) => api
                .create(&pp, &secret)
                .await
                .map(|_| SyncOutcome::Created),
            SecretPlan::Replace(secret) => api
                .replace(PRIVATE_SECRET_NAME, &pp, &secret)
                .await
                .map(|_| SyncOutcome::Updated),
        };

        let err = match result {
            Ok(outcome) => {
                info!(secret = PRIVATE_SECRET_NAME, ?outcome, "Synced private secret");
                return Ok(outcome);
            }
            Err(e) => Error::from(e),
        };
        if !err.is_conflict() {
            return Err(err);
        }
        if attempt >= MAX_CONFLICT_ATTEMPTS {
            return Err(Error::ConflictError {
                name: PRIVATE_SECRET_NAME.to_string(),
                attempts: attempt,
            });
        }
        debug!(attempt, "Conflict writing private secret, re-reading");
    }
}
