//! Registry Service generation

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::Config;
use crate::resources::common::{REGISTRY_NAME, REGISTRY_PORT, child_metadata, selector_labels};

/// Generate the ClusterIP Service in front of the registry pods
pub fn generate_registry_service(config: &Config, namespace: &str) -> Service {
    Service {
        metadata: child_metadata(config, REGISTRY_NAME, namespace),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some(format!("{}-tcp", REGISTRY_PORT)),
                port: REGISTRY_PORT,
                target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
