//! Wait condition helpers for Config resources and registry children

use image_registry_operator::crd::{ConditionStatus, ConditionType, Config, ConfigPhase};
use kube::Api;
use kube::runtime::wait::{Condition, await_condition};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timeout waiting for condition")]
    Timeout,

    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::wait::Error),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Resource not found after wait")]
    ResourceNotFound,
}

/// Default timeout for wait operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

/// Short timeout for quick checks
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Condition that checks if the Config is in a specific phase
pub fn is_phase(expected: ConfigPhase) -> impl Condition<Config> {
    move |obj: Option<&Config>| {
        obj.and_then(|config| config.status.as_ref())
            .map(|status| status.phase == expected)
            .unwrap_or(false)
    }
}

/// Condition that checks if a condition type has a given status
pub fn has_condition(type_: ConditionType, expected: ConditionStatus) -> impl Condition<Config> {
    move |obj: Option<&Config>| {
        obj.and_then(|config| config.status.as_ref())
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == type_ && c.status == expected)
            })
            .unwrap_or(false)
    }
}

/// Condition that checks if status records provisioned storage
pub fn storage_recorded() -> impl Condition<Config> {
    |obj: Option<&Config>| {
        obj.and_then(|config| config.status.as_ref())
            .and_then(|status| status.storage.as_ref())
            .is_some()
    }
}

/// Condition that checks if observed_generation matches metadata.generation
pub fn generation_observed() -> impl Condition<Config> {
    |obj: Option<&Config>| {
        obj.map(|config| {
            config.metadata.generation.is_some()
                && config.status.as_ref().and_then(|s| s.observed_generation)
                    == config.metadata.generation
        })
        .unwrap_or(false)
    }
}

/// Wait for a Config to reach a condition with timeout
pub async fn wait_for_config<C>(
    api: &Api<Config>,
    name: &str,
    condition: C,
    timeout: Duration,
) -> Result<Config, WaitError>
where
    C: Condition<Config>,
{
    let cond = await_condition(api.clone(), name, condition);

    let result = tokio::time::timeout(timeout, cond)
        .await
        .map_err(|_| WaitError::Timeout)?
        .map_err(WaitError::Watch)?;

    result.ok_or(WaitError::ResourceNotFound)
}

// =============================================================================
// Generic Resource Watchers
// =============================================================================

/// Condition that checks if a resource exists (is not None)
pub fn exists<T>() -> impl Condition<T>
where
    T: kube::Resource,
{
    |obj: Option<&T>| obj.is_some()
}

/// Wait for any resource to satisfy `condition`
pub async fn wait_for_resource_matching<T, C>(
    api: &Api<T>,
    name: &str,
    condition: C,
    timeout: Duration,
) -> Result<T, WaitError>
where
    T: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: serde::de::DeserializeOwned,
    C: Condition<T>,
{
    let cond = await_condition(api.clone(), name, condition);

    let result = tokio::time::timeout(timeout, cond)
        .await
        .map_err(|_| WaitError::Timeout)?
        .map_err(WaitError::Watch)?;

    result.ok_or(WaitError::ResourceNotFound)
}

/// Wait for any resource to exist using watches
pub async fn wait_for_resource<T>(
    api: &Api<T>,
    name: &str,
    timeout: Duration,
) -> Result<T, WaitError>
where
    T: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: serde::de::DeserializeOwned,
{
    wait_for_resource_matching(api, name, exists::<T>(), timeout).await
}

/// Wait until the object with `uid` is gone
pub async fn wait_for_resource_deletion<T>(
    api: &Api<T>,
    name: &str,
    uid: &str,
    timeout: Duration,
) -> Result<(), WaitError>
where
    T: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: serde::de::DeserializeOwned,
{
    use kube::runtime::wait::conditions;

    let cond = await_condition(api.clone(), name, conditions::is_deleted(uid));

    tokio::time::timeout(timeout, cond)
        .await
        .map_err(|_| WaitError::Timeout)?
        .map_err(WaitError::Watch)?;

    Ok(())
}
