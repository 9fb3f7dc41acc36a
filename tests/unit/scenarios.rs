//! Whole reconcile cycles against a scripted API server and the in-memory
//! bucket backend
//!
//! The script fixes the order of requests, so each test also pins the
//! step order: credentials, secret, deployment, service, then status.

use std::sync::Arc;

use http::Method;
use image_registry_operator::config::OperatorConfig;
use image_registry_operator::controller::reconciler::SHORT_REQUEUE;
use image_registry_operator::controller::secret_sync::{SecretPlan, plan_private_secret};
use image_registry_operator::controller::{Context, ErrorClass, reconcile};
use image_registry_operator::crd::{Config, ConfigPhase, ManagementState, StorageStatus};
use image_registry_operator::resources::deployment::generate_registry_deployment;
use image_registry_operator::resources::secret::{PRIVATE_SECRET_NAME, S3_ACCESS_KEY};
use image_registry_operator::resources::service::generate_registry_service;
use image_registry_operator::storage::credentials::{AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY};
use image_registry_operator::storage::memory::MemoryBuckets;
use image_registry_operator::storage::{StorageDescriptor, generate_bucket_name};
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use serde_json::{Value, json};

use crate::api_server::*;
use crate::common::*;

fn context(client: Client, buckets: &MemoryBuckets) -> Arc<Context> {
    Arc::new(Context::with_buckets(
        client,
        Arc::new(buckets.clone()),
        OperatorConfig::default(),
        None,
    ))
}

/// Cluster credentials matching `s3_credentials()`
fn aws_creds() -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("aws-creds".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        data: Some(
            [
                (AWS_ACCESS_KEY_ID, "AKIAEXAMPLE"),
                (AWS_SECRET_ACCESS_KEY, "secret-example"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect(),
        ),
        ..Default::default()
    }
}

fn env_var<'a>(deployment: &'a Value, name: &str) -> &'a Value {
    deployment["spec"]["template"]["spec"]["containers"][0]["env"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == name)
        .unwrap_or_else(|| panic!("env var {} missing", name))
}

fn condition<'a>(status: &'a Value, type_: &str) -> &'a Value {
    status["conditions"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["type"] == type_)
        .unwrap()
}

#[tokio::test]
async fn test_generated_bucket_cycle() {
    let config = ConfigBuilder::s3("cluster").build();
    let buckets = MemoryBuckets::new();
    let (client, handle) = mock_client();
    let server = ApiServer::new()
        .get(USER_SECRET, Reply::not_found())
        .get(AWS_CREDS, Reply::object(&aws_creds()))
        .get(PRIVATE_SECRET, Reply::not_found())
        .create(SECRETS)
        .get(DEPLOYMENT, Reply::not_found())
        .create(DEPLOYMENTS)
        .get(SERVICE, Reply::not_found())
        .create(SERVICES)
        .expect(Method::PATCH, CONFIG_STATUS, Reply::object(&config))
        .run(handle);

    let action = reconcile(Arc::new(config.clone()), context(client, &buckets))
        .await
        .unwrap();
    let seen = finish(server).await;
    assert_eq!(action, Action::requeue(SHORT_REQUEUE));

    let bucket = generate_bucket_name("us-east-1", TEST_UID);
    assert_eq!(buckets.bucket_names(), vec![bucket.clone()]);
    assert!(buckets.bucket(&bucket).unwrap().hardening.is_some());

    let secret = &seen[3].body;
    assert_eq!(secret["metadata"]["ownerReferences"][0]["uid"], TEST_UID);
    assert_eq!(secret["metadata"]["ownerReferences"][0]["controller"], true);
    assert!(secret["data"][S3_ACCESS_KEY].is_string());

    let deployment = &seen[5].body;
    assert_eq!(env_var(deployment, "REGISTRY_STORAGE_S3_BUCKET")["value"], bucket);
    assert_eq!(env_var(deployment, "REGISTRY_STORAGE_S3_REGION")["value"], "us-east-1");
    assert_eq!(
        env_var(deployment, S3_ACCESS_KEY),
        &json!({
            "name": S3_ACCESS_KEY,
            "valueFrom": {
                "secretKeyRef": { "key": S3_ACCESS_KEY, "name": PRIVATE_SECRET_NAME }
            }
        })
    );

    let status = &seen[8].body["status"];
    assert_eq!(status["phase"], "Syncing");
    assert_eq!(status["storage"]["bucket"], bucket);
    assert_eq!(status["storage"]["region"], "us-east-1");
    assert_eq!(status["storage"]["managed"], true);
    assert_eq!(status["lastError"], Value::Null);
    assert_eq!(status["observedGeneration"], 1);
}

#[tokio::test]
async fn test_missing_admin_bucket_degrades_without_touching_children() {
    let config = ConfigBuilder::s3("cluster").with_bucket("team-registry").build();
    let buckets = MemoryBuckets::new();
    let (client, handle) = mock_client();
    let server = ApiServer::new()
        .get(USER_SECRET, Reply::not_found())
        .get(AWS_CREDS, Reply::object(&aws_creds()))
        .expect(Method::PATCH, CONFIG_STATUS, Reply::object(&config))
        .run(handle);

    let err = reconcile(Arc::new(config.clone()), context(client, &buckets))
        .await
        .unwrap_err();
    let seen = finish(server).await;

    assert_eq!(err.class(), ErrorClass::Configuration);
    assert_eq!(buckets.calls().create, 0);

    let status = &seen[2].body["status"];
    assert_eq!(status["phase"], "Degraded");
    assert_eq!(status["storage"], Value::Null);
    assert!(status["lastError"].as_str().unwrap().contains("team-registry"));
    let degraded = condition(status, "Degraded");
    assert_eq!(degraded["status"], "True");
    assert_eq!(degraded["reason"], "ConfigurationError");
}

#[tokio::test]
async fn test_status_records_bucket_when_secret_write_fails() {
    let config = ConfigBuilder::s3("cluster").build();
    let buckets = MemoryBuckets::new();
    let (client, handle) = mock_client();
    let server = ApiServer::new()
        .get(USER_SECRET, Reply::not_found())
        .get(AWS_CREDS, Reply::object(&aws_creds()))
        .get(PRIVATE_SECRET, Reply::not_found())
        .expect(Method::POST, SECRETS, Reply::Failure(500, "InternalError"))
        .expect(Method::PATCH, CONFIG_STATUS, Reply::object(&config))
        .run(handle);

    let err = reconcile(Arc::new(config.clone()), context(client, &buckets))
        .await
        .unwrap_err();
    let seen = finish(server).await;

    assert_eq!(err.class(), ErrorClass::Transient);
    let status = &seen[4].body["status"];
    // Transient failures keep the phase and still persist the bucket
    assert_eq!(status["phase"], "Syncing");
    assert_eq!(
        status["storage"]["bucket"],
        generate_bucket_name("us-east-1", TEST_UID)
    );
    assert_eq!(status["retryCount"], 1);
    assert_eq!(condition(status, "Progressing")["reason"], "TransientError");
    assert_eq!(condition(status, "Degraded")["status"], "False");
}

#[tokio::test]
async fn test_converged_cycle_only_writes_status() {
    let bucket = generate_bucket_name("us-east-1", TEST_UID);
    let storage = StorageStatus {
        bucket: bucket.clone(),
        region: "us-east-1".to_string(),
        managed: true,
        ..Default::default()
    };
    let config = ConfigBuilder::s3("cluster")
        .with_status(ConfigPhase::Available, Some(storage.clone()))
        .build();
    let buckets = MemoryBuckets::new().with_owned_bucket(&bucket, "us-east-1");

    let descriptor = StorageDescriptor::from_status(&storage, s3_credentials());
    let SecretPlan::Create(secret) = plan_private_secret(&config, NS, &descriptor, None) else {
        panic!("expected a fresh secret");
    };
    let mut deployment = generate_registry_deployment(
        &config,
        NS,
        &descriptor,
        &OperatorConfig::default().registry_image,
    );
    deployment.status = Some(DeploymentStatus {
        updated_replicas: Some(1),
        available_replicas: Some(1),
        ..Default::default()
    });
    let service = generate_registry_service(&config, NS);

    let (client, handle) = mock_client();
    let server = ApiServer::new()
        .get(USER_SECRET, Reply::not_found())
        .get(AWS_CREDS, Reply::object(&aws_creds()))
        .get(PRIVATE_SECRET, Reply::object(&secret))
        .get(DEPLOYMENT, Reply::object(&deployment))
        .get(SERVICE, Reply::object(&service))
        .expect(Method::PATCH, CONFIG_STATUS, Reply::object(&config))
        .run(handle);

    let action = reconcile(Arc::new(config.clone()), context(client, &buckets))
        .await
        .unwrap();
    let seen = finish(server).await;

    assert_eq!(
        action,
        Action::requeue(OperatorConfig::default().resync_interval)
    );
    assert_eq!(buckets.calls().total(), 0);
    let status = &seen[5].body["status"];
    assert_eq!(status["phase"], "Available");
    assert_eq!(status["storage"]["bucket"], bucket);
    assert_eq!(condition(status, "Available")["status"], "True");
}

#[tokio::test]
async fn test_removed_config_only_records_status() {
    let config = ConfigBuilder::s3("cluster")
        .with_management_state(ManagementState::Removed)
        .build();
    let buckets = MemoryBuckets::new();
    let (client, handle) = mock_client();
    let server = ApiServer::new()
        .expect(Method::PATCH, CONFIG_STATUS, Reply::object(&config))
        .run(handle);

    reconcile(Arc::new(config.clone()), context(client, &buckets))
        .await
        .unwrap();
    let seen = finish(server).await;

    assert_eq!(buckets.calls().total(), 0);
    let status = &seen[0].body["status"];
    assert_eq!(status["phase"], "Removed");
    assert_eq!(condition(status, "Removed")["status"], "True");
}

#[tokio::test]
async fn test_unmanaged_config_makes_no_requests() {
    let config: Config = ConfigBuilder::s3("cluster")
        .with_management_state(ManagementState::Unmanaged)
        .build();
    let buckets = MemoryBuckets::new();
    let (client, handle) = mock_client();
    let server = ApiServer::new().run(handle);

    let action = reconcile(Arc::new(config), context(client, &buckets))
        .await
        .unwrap();

    assert!(finish(server).await.is_empty());
    assert_eq!(
        action,
        Action::requeue(OperatorConfig::default().resync_interval)
    );
}
