pub mod common;
pub mod deployment;
pub mod secret;
pub mod service;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, REGISTRY_NAME, REGISTRY_PORT, is_owned_by, owner_reference,
    standard_labels,
};
