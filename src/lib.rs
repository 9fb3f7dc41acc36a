pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod storage;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, ErrorClass, Result, error_policy, reconcile};
pub use crd::{Config, ConfigPhase, ConfigSpec, ConfigStatus};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};

use crate::resources::common::controlling_config;

/// Run the operator controller.
///
/// Watches Config resources cluster-wide plus the registry's children in the
/// operator namespace. Children are namespaced while the Config is
/// cluster-scoped, so they are mapped back through their controller
/// reference instead of `owns`.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let ctx = Arc::new(Context::new(client, config, health_state));
    run_controller_with_context(ctx).await
}

/// Run the controller with a prepared context (tests swap the bucket backend)
pub async fn run_controller_with_context(ctx: Arc<Context>) {
    let namespace = ctx.config.namespace.clone();
    tracing::info!(
        "Starting controller for Config resources (children in {})",
        namespace
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = ctx.health_state {
        state.set_ready(true).await;
    }

    let client = ctx.client.clone();
    let configs: Api<Config> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(client, &namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(configs, watcher_config.clone())
        .watches(deployments, watcher_config.clone(), |d: Deployment| {
            controlling_config(&d.metadata).map(|name| ObjectRef::<Config>::new(&name))
        })
        .watches(services, watcher_config.clone(), |s: Service| {
            controlling_config(&s.metadata).map(|name| ObjectRef::<Config>::new(&name))
        })
        .watches(secrets, watcher_config, |s: Secret| {
            controlling_config(&s.metadata).map(|name| ObjectRef::<Config>::new(&name))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // A deleted Config can still be queued by a child event
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    tracing::info!("Controller stream ended");
}
