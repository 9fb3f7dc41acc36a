//! Finite state machine for the registry lifecycle
//!
//! Every phase change a reconcile makes goes through the transition table,
//! so a cycle can only move the Config along the edges listed here.

use std::fmt;

use tracing::debug;

use crate::crd::ConfigPhase;

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigEvent {
    /// First cycle for a new Config
    ProvisioningStarted,
    /// Spec generation moved past the observed generation
    SpecChanged,
    /// A Degraded Config is being retried without a spec change
    RetryStarted,
    /// The storage provisioner returned a descriptor
    StorageReady,
    /// A synchronizer had to correct a child object
    DriftDetected,
    /// No drift and the Deployment has rolled out
    ResourcesConverged,
    /// A non-transient error stopped the cycle
    FatalError,
    /// Management state switched to Removed
    ManagementRemoved,
    /// Management state switched back from Removed
    ManagementRestored,
}

impl fmt::Display for ConfigEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigEvent::ProvisioningStarted => write!(f, "ProvisioningStarted"),
            ConfigEvent::SpecChanged => write!(f, "SpecChanged"),
            ConfigEvent::RetryStarted => write!(f, "RetryStarted"),
            ConfigEvent::StorageReady => write!(f, "StorageReady"),
            ConfigEvent::DriftDetected => write!(f, "DriftDetected"),
            ConfigEvent::ResourcesConverged => write!(f, "ResourcesConverged"),
            ConfigEvent::FatalError => write!(f, "FatalError"),
            ConfigEvent::ManagementRemoved => write!(f, "ManagementRemoved"),
            ConfigEvent::ManagementRestored => write!(f, "ManagementRestored"),
        }
    }
}

/// Facts the guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// The registry Deployment reports all replicas updated and available
    pub rollout_complete: bool,
    /// A synchronizer wrote a child object this cycle
    pub drift_detected: bool,
}

impl TransitionContext {
    pub fn new(rollout_complete: bool, drift_detected: bool) -> Self {
        Self {
            rollout_complete,
            drift_detected,
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: ConfigPhase,
    pub to: ConfigPhase,
    pub event: ConfigEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ConfigPhase,
        to: ConfigPhase,
        event: ConfigEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq)]
pub enum TransitionResult {
    Success {
        from: ConfigPhase,
        to: ConfigPhase,
        event: ConfigEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ConfigPhase,
        event: ConfigEvent,
    },
    GuardFailed {
        from: ConfigPhase,
        to: ConfigPhase,
        event: ConfigEvent,
        reason: String,
    },
}

/// State machine for the Config lifecycle
pub struct ConfigStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ConfigStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStateMachine {
    pub fn new() -> Self {
        use ConfigEvent::*;
        use ConfigPhase::*;

        let mut transitions = vec![
            // === Pending ===
            Transition::new(Pending, Provisioning, ProvisioningStarted, "Starting storage provisioning"),
            // === Provisioning ===
            Transition::new(Provisioning, Syncing, StorageReady, "Storage ready, syncing resources"),
            // === Syncing ===
            Transition::new(Syncing, Available, ResourcesConverged, "Resources converged and rolled out"),
            Transition::new(Syncing, Provisioning, SpecChanged, "Spec changed while syncing"),
            // === Available ===
            Transition::new(Available, Syncing, DriftDetected, "Drift corrected on a child resource"),
            Transition::new(Available, Provisioning, SpecChanged, "Spec changed, re-provisioning"),
            // === Degraded ===
            Transition::new(Degraded, Provisioning, SpecChanged, "Spec changed while degraded"),
            Transition::new(Degraded, Provisioning, RetryStarted, "Retrying after fatal error"),
            // === Removed ===
            Transition::new(Removed, Pending, ManagementRestored, "Management restored"),
        ];

        for from in [Pending, Provisioning, Syncing, Available] {
            transitions.push(Transition::new(from, Degraded, FatalError, "Fatal error"));
        }
        for from in [Pending, Provisioning, Syncing, Available, Degraded] {
            transitions.push(Transition::new(
                from,
                Removed,
                ManagementRemoved,
                "Management state set to Removed",
            ));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &ConfigPhase,
        event: ConfigEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Apply `event` and return the resulting phase; rejected events leave the
    /// phase unchanged
    pub fn advance(
        &self,
        current: ConfigPhase,
        event: ConfigEvent,
        ctx: &TransitionContext,
    ) -> ConfigPhase {
        match self.transition(&current, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                debug!(%from, %to, %event, "{}", description);
                to
            }
            TransitionResult::GuardFailed { reason, .. } => {
                debug!(phase = %current, %event, "Transition blocked: {}", reason);
                current
            }
            TransitionResult::InvalidTransition { .. } => current,
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &ConfigPhase, event: &ConfigEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &ConfigPhase) -> Vec<&ConfigEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            ConfigEvent::ResourcesConverged if ctx.drift_detected => {
                Some("resources were corrected this cycle".to_string())
            }
            ConfigEvent::ResourcesConverged if !ctx.rollout_complete => {
                Some("registry deployment has not rolled out".to_string())
            }
            _ => None,
        }
    }
}

/// Event that opens a managed reconcile cycle for a Config in `current`
pub fn determine_entry_event(current: ConfigPhase, spec_changed: bool) -> Option<ConfigEvent> {
    match current {
        ConfigPhase::Pending => Some(ConfigEvent::ProvisioningStarted),
        ConfigPhase::Removed => Some(ConfigEvent::ManagementRestored),
        ConfigPhase::Degraded if spec_changed => Some(ConfigEvent::SpecChanged),
        ConfigPhase::Degraded => Some(ConfigEvent::RetryStarted),
        ConfigPhase::Syncing | ConfigPhase::Available if spec_changed => {
            Some(ConfigEvent::SpecChanged)
        }
        _ => None,
    }
}
