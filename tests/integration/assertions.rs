//! Resource assertion helpers for integration tests.
//!
//! This module provides [`ResourceAssertions`], a helper struct for verifying
//! Kubernetes resources exist, are deleted, or have expected properties.
//!
//! # Usage
//!
//! ```ignore
//! use k8s_openapi::api::apps::v1::Deployment;
//! use k8s_openapi::api::core::v1::Service;
//!
//! let assertions = ResourceAssertions::new(client.clone(), namespace);
//!
//! let svc: Service = assertions.resource_exists("image-registry").await?;
//! let deployment: Deployment = assertions.controlled_by("image-registry", &config_uid).await?;
//! assertions.secret_contains(PRIVATE_SECRET_NAME, S3_ACCESS_KEY, "AKIA...").await?;
//! assertions.resource_deleted::<Service>("image-registry").await?;
//! ```

use image_registry_operator::resources::KIND;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssertionError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Resource still exists: {0}")]
    ResourceStillExists(String),

    #[error("Missing owner reference on {resource}, expected owner: {expected_owner}")]
    MissingOwnerReference {
        resource: String,
        expected_owner: String,
    },

    #[error("Secret missing expected content: {0}")]
    SecretContentMissing(String),
}

/// Helper for asserting on Kubernetes resources in a specific namespace.
///
/// Provides convenient methods for verifying resource existence, deletion,
/// and properties. All methods return [`AssertionError`] on failure with
/// descriptive error messages.
pub struct ResourceAssertions {
    client: Client,
    namespace: String,
}

impl ResourceAssertions {
    /// Create a new assertions helper for the given namespace.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Assert that a namespaced resource exists and return it.
    ///
    /// Works with any Kubernetes resource type (Pod, Job, ConfigMap, etc.).
    ///
    /// # Example
    /// ```ignore
    /// let job: Job = assertions.resource_exists("my-job").await?;
    /// let pvc: PersistentVolumeClaim = assertions.resource_exists("data-0").await?;
    /// ```
    pub async fn resource_exists<T>(&self, name: &str) -> Result<T, AssertionError>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get(name).await?)
    }

    /// Assert that a namespaced resource does NOT exist (returns 404).
    ///
    /// Use this to verify cleanup after deletion.
    ///
    /// # Example
    /// ```ignore
    /// assertions.resource_deleted::<Job>("my-job").await?;
    /// assertions.resource_deleted::<Pod>("my-pod").await?;
    /// ```
    pub async fn resource_deleted<T>(&self, name: &str) -> Result<(), AssertionError>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(name).await {
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Ok(_) => Err(AssertionError::ResourceStillExists(name.to_string())),
            Err(e) => Err(AssertionError::KubeError(e)),
        }
    }

    /// Verify the resource carries exactly one controller reference, to `owner_uid`
    pub async fn controlled_by<T>(&self, name: &str, owner_uid: &str) -> Result<T, AssertionError>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <T as Resource>::DynamicType: Default,
    {
        let obj: T = self.resource_exists(name).await?;
        let controllers: Vec<_> = obj
            .meta()
            .owner_references
            .iter()
            .flatten()
            .filter(|r| r.controller == Some(true))
            .collect();

        let ok = controllers.len() == 1
            && controllers[0].uid == owner_uid
            && controllers[0].kind == KIND
            && controllers[0].block_owner_deletion == Some(true);
        if !ok {
            return Err(AssertionError::MissingOwnerReference {
                resource: name.to_string(),
                expected_owner: owner_uid.to_string(),
            });
        }

        Ok(obj)
    }

    /// Assert a Secret key holds `expected`
    pub async fn secret_contains(
        &self,
        name: &str,
        key: &str,
        expected: &str,
    ) -> Result<(), AssertionError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get(name).await?;

        let value = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).to_string())
            .ok_or_else(|| AssertionError::SecretContentMissing(format!("Key '{}' not found", key)))?;

        if value != expected {
            return Err(AssertionError::SecretContentMissing(format!(
                "Secret key '{}' does not hold the expected value",
                key
            )));
        }

        Ok(())
    }
}
