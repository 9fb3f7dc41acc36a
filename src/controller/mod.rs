pub mod context;
pub mod error;
pub mod reconciler;
pub mod resource_sync;
pub mod secret_sync;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use context::Context;
pub use error::{BackoffConfig, Error, ErrorClass, Result};
pub use reconciler::{error_policy, reconcile};
pub use resource_sync::{sync_deployment, sync_service};
pub use secret_sync::{SyncOutcome, sync_private_secret};
pub use state_machine::{ConfigEvent, ConfigStateMachine, TransitionContext};
pub use status::{
    ConditionBuilder, CycleReport, StatusManager, build_status, spec_changed, status_patch,
};
pub use validation::validate_spec;
