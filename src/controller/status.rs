//! Status and conditions management for Config resources
//!
//! A reconcile cycle produces a [`CycleReport`]; [`build_status`] turns it
//! into the full status object and [`StatusManager`] writes it through the
//! status subresource.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::{Map, Value, json};

use crate::controller::Context;
use crate::controller::error::{ErrorClass, Result};
use crate::crd::{
    Condition, ConditionStatus, ConditionType, Config, ConfigPhase, ConfigStatus, StorageStatus,
};
use crate::resources::FIELD_MANAGER;

/// Error that ended a cycle, already classified
#[derive(Debug, Clone, PartialEq)]
pub struct CycleError {
    pub class: ErrorClass,
    pub message: String,
}

/// What one reconcile cycle observed
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Phase after the cycle's transitions
    pub phase: ConfigPhase,
    /// Storage actually provisioned this cycle, if the provisioner ran
    pub storage: Option<StorageStatus>,
    pub error: Option<CycleError>,
    pub drift_detected: bool,
    pub rollout_complete: bool,
}

impl CycleReport {
    pub fn new(phase: ConfigPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    /// `lastTransitionTime` only moves when the status changes.
    pub fn set_condition(
        mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Build the conditions list in canonical order
    pub fn build(mut self) -> Vec<Condition> {
        self.conditions.sort_by_key(|c| c.type_);
        self.conditions
    }
}

/// Compute the full status for `config` after a cycle
pub fn build_status(config: &Config, report: &CycleReport) -> ConfigStatus {
    let previous = config.status.clone().unwrap_or_default();
    let generation = config.metadata.generation;
    let phase = report.phase;

    let transient = report
        .error
        .as_ref()
        .filter(|e| e.class == ErrorClass::Transient);
    let fatal = report
        .error
        .as_ref()
        .filter(|e| e.class != ErrorClass::Transient);

    let (available_reason, available_message) = match phase {
        ConfigPhase::Available => ("Ready", "The registry is ready"),
        ConfigPhase::Removed => ("Removed", "The registry is removed"),
        _ => ("NotReady", "The registry is not ready"),
    };

    let progressing = matches!(
        phase,
        ConfigPhase::Pending | ConfigPhase::Provisioning | ConfigPhase::Syncing
    ) || transient.is_some();
    let (progressing_reason, progressing_message) = match (transient, phase) {
        (Some(e), _) => ("TransientError", e.message.as_str()),
        (None, ConfigPhase::Pending) => ("Pending", "Waiting for the first reconcile"),
        (None, ConfigPhase::Provisioning) => ("Provisioning", "Provisioning registry storage"),
        (None, ConfigPhase::Syncing) if report.drift_detected => {
            ("Syncing", "Registry resources were updated")
        }
        (None, ConfigPhase::Syncing) => ("Syncing", "Waiting for the registry rollout"),
        (None, _) => ("AsExpected", "The registry is stable"),
    };

    let (degraded_reason, degraded_message) = match fatal {
        Some(e) if phase == ConfigPhase::Degraded => (e.class.reason(), e.message.as_str()),
        _ => ("AsExpected", ""),
    };

    let removed = phase == ConfigPhase::Removed;
    let (removed_reason, removed_message) = if removed {
        ("Removed", "Management state is Removed")
    } else {
        ("AsExpected", "")
    };

    let conditions = ConditionBuilder::from_existing(previous.conditions.clone(), generation)
        .set_condition(
            ConditionType::Available,
            (phase == ConfigPhase::Available).into(),
            available_reason,
            available_message,
        )
        .set_condition(
            ConditionType::Progressing,
            progressing.into(),
            progressing_reason,
            progressing_message,
        )
        .set_condition(
            ConditionType::Degraded,
            (phase == ConfigPhase::Degraded).into(),
            degraded_reason,
            degraded_message,
        )
        .set_condition(
            ConditionType::Removed,
            removed.into(),
            removed_reason,
            removed_message,
        )
        .build();

    let (retry_count, last_error, last_error_time) = match &report.error {
        Some(e) => (
            Some(previous.retry_count.unwrap_or(0).saturating_add(1)),
            Some(e.message.clone()),
            Some(Utc::now().to_rfc3339()),
        ),
        None => (Some(0), None, None),
    };

    ConfigStatus {
        phase,
        storage: report.storage.clone().or(previous.storage),
        observed_generation: generation,
        conditions,
        retry_count,
        last_error,
        last_error_time,
        phase_started_at: phase_started_at(config, phase),
    }
}

/// Whether the spec moved past the generation recorded in status
pub fn spec_changed(config: &Config) -> bool {
    let observed = config.status.as_ref().and_then(|s| s.observed_generation);
    match (observed, config.metadata.generation) {
        (Some(observed), Some(current)) => observed != current,
        _ => config.status.is_some(),
    }
}

/// Optional status fields, nulled in the patch when unset
const STATUS_FIELDS: [&str; 6] = [
    "storage",
    "observedGeneration",
    "retryCount",
    "lastError",
    "lastErrorTime",
    "phaseStartedAt",
];

/// Optional storage fields, nulled in the patch when unset
const STORAGE_FIELDS: [&str; 5] = ["bucket", "region", "regionEndpoint", "accountName", "claim"];

fn null_missing(fields: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        fields.entry(*key).or_insert(Value::Null);
    }
}

/// Merge patch that writes `status` in full
///
/// A merge patch keeps every key it omits, so fields the new status no
/// longer carries are sent as explicit nulls.
pub fn status_patch(status: &ConfigStatus) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(fields) = value.as_object_mut() {
        null_missing(fields, &STATUS_FIELDS);
        if let Some(storage) = fields.get_mut("storage").and_then(Value::as_object_mut) {
            null_missing(storage, &STORAGE_FIELDS);
        }
    }
    Ok(json!({ "status": value }))
}

/// Keep the previous timestamp while the phase is unchanged
pub fn phase_started_at(config: &Config, phase: ConfigPhase) -> Option<String> {
    match config.status.as_ref() {
        Some(s) if s.phase == phase && s.phase_started_at.is_some() => s.phase_started_at.clone(),
        _ => Some(Utc::now().to_rfc3339()),
    }
}

/// Status manager for Config resources
pub struct StatusManager<'a> {
    config: &'a Config,
    ctx: &'a Context,
}

impl<'a> StatusManager<'a> {
    /// Create a new status manager
    pub fn new(config: &'a Config, ctx: &'a Context) -> Self {
        Self { config, ctx }
    }

    /// Update the Config status with full status object
    pub async fn update(&self, status: &ConfigStatus) -> Result<()> {
        let api: Api<Config> = Api::all(self.ctx.client.clone());
        let name = self.config.name_any();

        let patch = status_patch(status)?;

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }

    /// Build and write the status for a finished cycle
    pub async fn record(&self, report: &CycleReport) -> Result<ConfigStatus> {
        let status = build_status(self.config, report);
        self.update(&status).await?;
        Ok(status)
    }
}
