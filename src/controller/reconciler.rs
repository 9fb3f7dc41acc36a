//! Reconciliation logic for Config resources
//!
//! One cycle runs validate, credentials, provision, secret sync, deployment
//! sync and service sync in that order, and always ends with a status write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, ErrorClass, Result};
use crate::controller::resource_sync::{sync_deployment, sync_service};
use crate::controller::secret_sync::sync_private_secret;
use crate::controller::state_machine::{
    ConfigEvent, ConfigStateMachine, TransitionContext, determine_entry_event,
};
use crate::controller::status::{CycleError, CycleReport, StatusManager, spec_changed};
use crate::controller::validation::validate_spec;
use crate::crd::{Config, ConfigPhase, ManagementState, StorageStatus};
use crate::storage::credentials::load_credentials;
use crate::storage::{DesiredStorage, StorageCredentials, StorageDescriptor, StorageProvisioner};

/// Requeue while the registry is still converging
pub const SHORT_REQUEUE: Duration = Duration::from_secs(10);

/// Default backoff configuration for error handling
fn default_backoff() -> BackoffConfig {
    BackoffConfig::default()
}

fn current_phase(config: &Config) -> ConfigPhase {
    config.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

/// Main reconciliation function
#[instrument(skip(config, ctx), fields(name = %config.name_any(), generation = config.metadata.generation))]
pub async fn reconcile(config: Arc<Config>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = config.name_any();

    let result = match config.spec.management_state {
        ManagementState::Unmanaged => {
            debug!("Config is Unmanaged, leaving cluster state alone");
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        ManagementState::Removed => reconcile_removed(&config, &ctx).await,
        ManagementState::Managed => reconcile_managed(&config, &ctx).await,
    };

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_reconcile(&name, start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            health.metrics.record_error(&name, e.class());
        }
        health.touch();
    }

    result
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(config: Arc<Config>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = config.name_any();
    let retry_count = config
        .status
        .as_ref()
        .and_then(|s| s.retry_count)
        .unwrap_or(0);

    let delay = default_backoff().delay_for_error(error, retry_count);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Time left before a failed Config may be retried
///
/// Writing the failure into status triggers a new reconcile at once; this
/// holds it back until the backoff recorded in status has elapsed.
pub fn retry_gate(config: &Config, backoff: &BackoffConfig, now: DateTime<Utc>) -> Option<Duration> {
    if spec_changed(config) {
        return None;
    }
    let status = config.status.as_ref()?;
    let failed_at = DateTime::parse_from_rfc3339(status.last_error_time.as_deref()?).ok()?;
    let attempt = status.retry_count.unwrap_or(1).saturating_sub(1);

    let delay = if status.phase == ConfigPhase::Degraded {
        backoff.max_delay
    } else {
        backoff.base_delay(attempt).mul_f64(1.0 - backoff.jitter)
    };

    let elapsed = (now - failed_at.with_timezone(&Utc)).to_std().unwrap_or_default();
    delay.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Record the Removed phase without touching any child object
async fn reconcile_removed(config: &Config, ctx: &Context) -> Result<Action> {
    let sm = ConfigStateMachine::new();
    let phase = sm.advance(
        current_phase(config),
        ConfigEvent::ManagementRemoved,
        &TransitionContext::default(),
    );

    StatusManager::new(config, ctx)
        .record(&CycleReport::new(phase))
        .await?;
    if let Some(health) = &ctx.health_state {
        health.metrics.set_phase(&config.name_any(), phase);
    }

    Ok(Action::requeue(ctx.config.resync_interval))
}

async fn reconcile_managed(config: &Config, ctx: &Context) -> Result<Action> {
    if let Some(wait) = retry_gate(config, &default_backoff(), Utc::now()) {
        debug!("Backing off for {:?} after the last failure", wait);
        return Ok(Action::requeue(wait));
    }

    let sm = ConfigStateMachine::new();
    let changed = spec_changed(config);
    if changed {
        info!(
            "Spec changed (generation: {:?} -> {:?})",
            config.status.as_ref().and_then(|s| s.observed_generation),
            config.metadata.generation
        );
    }

    let mut phase = current_phase(config);
    while let Some(event) = determine_entry_event(phase, changed) {
        let next = sm.advance(phase, event, &TransitionContext::default());
        if next == phase {
            break;
        }
        phase = next;
    }

    let mut report = CycleReport::new(phase);
    let result = run_cycle(config, ctx, &sm, &mut report).await;

    if let Err(e) = &result {
        let class = e.class();
        if class != ErrorClass::Transient {
            report.phase = sm.advance(
                report.phase,
                ConfigEvent::FatalError,
                &TransitionContext::default(),
            );
        }
        report.error = Some(CycleError {
            class,
            message: e.to_string(),
        });
    }

    let written = StatusManager::new(config, ctx).record(&report).await;
    if let Some(health) = &ctx.health_state {
        health.metrics.set_phase(&config.name_any(), report.phase);
        if let Some(storage) = &report.storage
            && newly_provisioned(config, storage)
        {
            health.metrics.record_bucket_provisioned(storage.backend);
        }
    }

    match (result, written) {
        (Err(e), Err(status_err)) => {
            warn!("Failed to record error status: {}", status_err);
            Err(e)
        }
        (Err(e), Ok(_)) => Err(e),
        (Ok(()), Err(status_err)) => Err(status_err),
        (Ok(()), Ok(_)) if report.phase == ConfigPhase::Available => {
            info!("Registry is available");
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        (Ok(()), Ok(_)) => Ok(Action::requeue(SHORT_REQUEUE)),
    }
}

fn newly_provisioned(config: &Config, storage: &StorageStatus) -> bool {
    let previous = config.status.as_ref().and_then(|s| s.storage.as_ref());
    storage.managed
        && !storage.bucket.is_empty()
        && previous.is_none_or(|p| p.backend != storage.backend || p.bucket != storage.bucket)
}

/// Run the ordered steps of one managed cycle, filling in `report`
async fn run_cycle(
    config: &Config,
    ctx: &Context,
    sm: &ConfigStateMachine,
    report: &mut CycleReport,
) -> Result<()> {
    validate_spec(config)?;

    let desired = DesiredStorage::from_spec(&config.spec.storage)?;
    let credentials = load_credentials(&ctx.client, &ctx.config, desired.backend()).await?;

    let uid = config
        .metadata
        .uid
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let observed = config
        .status
        .as_ref()
        .and_then(|s| s.storage.as_ref())
        .map(|s| StorageDescriptor::from_status(s, StorageCredentials::None));

    let descriptor = StorageProvisioner::new(ctx.buckets.as_ref(), uid)
        .with_default_region(ctx.config.default_region.clone())
        .with_endpoint_override(ctx.config.s3_endpoint_override.clone())
        .with_timeout(ctx.config.storage_timeout)
        .provision(&desired, observed.as_ref(), credentials)
        .await?;

    // Persist what was provisioned even if a later step fails
    report.storage = Some(descriptor.to_status());
    report.phase = sm.advance(
        report.phase,
        ConfigEvent::StorageReady,
        &TransitionContext::default(),
    );

    let ns = ctx.config.namespace.as_str();
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), ns);
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ns);
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), ns);

    let secret = sync_private_secret(&secrets, config, ns, &descriptor).await?;
    let (deployment, rolled_out) = sync_deployment(
        &deployments,
        config,
        ns,
        &descriptor,
        &ctx.config.registry_image,
    )
    .await?;
    let service = sync_service(&services, config, ns).await?;

    let drift = secret.changed() || deployment.changed() || service.changed();
    debug!(?secret, ?deployment, ?service, rolled_out, "Resources synced");

    report.drift_detected = drift;
    report.rollout_complete = rolled_out;
    let tctx = TransitionContext::new(rolled_out, drift);
    if drift {
        report.phase = sm.advance(report.phase, ConfigEvent::DriftDetected, &tctx);
    }
    report.phase = sm.advance(report.phase, ConfigEvent::ResourcesConverged, &tctx);

    Ok(())
}
