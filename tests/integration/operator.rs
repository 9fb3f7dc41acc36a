//! Operator spawning utilities for integration tests
//!
//! Each test gets its own operator instance that only sees Configs labelled
//! with the test namespace, since Config is cluster-scoped.

use std::sync::Arc;

use futures::StreamExt;
use image_registry_operator::resources::common::controlling_config;
use image_registry_operator::storage::BucketApiFactory;
use image_registry_operator::storage::memory::MemoryBuckets;
use image_registry_operator::{Config, Context, OperatorConfig, error_policy, reconcile};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Label tying a test Config to the operator instance of its test
pub const TEST_SCOPE_LABEL: &str = "image-registry-operator.test/namespace";

/// Operator configuration for a test namespace
///
/// Registry children, the user secret and the cluster credentials all live in
/// the test namespace.
pub fn test_operator_config(namespace: &str) -> OperatorConfig {
    OperatorConfig {
        namespace: namespace.to_string(),
        credentials_namespace: namespace.to_string(),
        ..Default::default()
    }
}

/// A scoped operator that runs for the duration of a test
pub struct ScopedOperator {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// In-memory buckets when the operator runs without a cloud backend
    pub buckets: Option<MemoryBuckets>,
}

impl ScopedOperator {
    /// Start an operator backed by in-memory buckets
    pub async fn start(client: Client, namespace: &str) -> Self {
        let buckets = MemoryBuckets::new();
        let mut operator =
            Self::start_with_buckets(client, namespace, Arc::new(buckets.clone())).await;
        operator.buckets = Some(buckets);
        operator
    }

    /// Start an operator with a specific bucket backend
    pub async fn start_with_buckets(
        client: Client,
        namespace: &str,
        buckets: Arc<dyn BucketApiFactory>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = Arc::new(Context::with_buckets(
            client,
            buckets,
            test_operator_config(namespace),
            None,
        ));

        tracing::info!(namespace, "Starting scoped operator controller...");

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = run_operator(ctx) => {
                    tracing::debug!("Operator exited normally");
                }
                _ = shutdown_rx => {
                    tracing::debug!("Operator received shutdown signal");
                }
            }
        });

        // Give the controller a moment to start watching
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            buckets: None,
        }
    }
}

impl Drop for ScopedOperator {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

/// Run the controller restricted to this test's Configs
async fn run_operator(ctx: Arc<Context>) {
    let namespace = ctx.config.namespace.clone();
    let client = ctx.client.clone();

    let configs: Api<Config> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(client, &namespace);

    let scoped = WatcherConfig::default()
        .any_semantic()
        .labels(&format!("{}={}", TEST_SCOPE_LABEL, namespace));
    let children = WatcherConfig::default().any_semantic();

    Controller::new(configs, scoped)
        .watches(deployments, children.clone(), |d: Deployment| {
            controlling_config(&d.metadata).map(|name| ObjectRef::<Config>::new(&name))
        })
        .watches(services, children.clone(), |s: Service| {
            controlling_config(&s.metadata).map(|name| ObjectRef::<Config>::new(&name))
        })
        .watches(secrets, children, |s: Secret| {
            controlling_config(&s.metadata).map(|name| ObjectRef::<Config>::new(&name))
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Reconciliation error: {:?}", e);
                }
            }
        })
        .await;
}
