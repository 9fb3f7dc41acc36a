//! Unit tests for private secret planning

use image_registry_operator::controller::secret_sync::{SecretPlan, plan_private_secret};
use image_registry_operator::crd::StorageBackend;
use image_registry_operator::resources::secret::{
    AZURE_ACCOUNT_KEY, HTTP_SECRET_KEY, S3_ACCESS_KEY, S3_SECRET_KEY,
};
use image_registry_operator::storage::{StorageCredentials, StorageDescriptor};
use k8s_openapi::api::core::v1::Secret;

use crate::common::*;

const NS: &str = "openshift-image-registry";

fn created(plan: SecretPlan) -> Secret {
    match plan {
        SecretPlan::Create(secret) => secret,
        other => panic!("expected Create, got {:?}", other),
    }
}

fn text(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|v| String::from_utf8_lossy(&v.0).to_string())
}

#[test]
fn test_s3_keys_written() {
    let config = ConfigBuilder::s3("cluster").build();
    let secret = created(plan_private_secret(
        &config,
        NS,
        &s3_descriptor("bucket-a", "us-east-1"),
        None,
    ));

    assert_eq!(text(&secret, S3_ACCESS_KEY).as_deref(), Some("AKIAEXAMPLE"));
    assert_eq!(text(&secret, S3_SECRET_KEY).as_deref(), Some("secret-example"));
    assert_eq!(text(&secret, HTTP_SECRET_KEY).map(|s| s.len()), Some(64));
    assert_eq!(secret.metadata.namespace.as_deref(), Some(NS));
}

#[test]
fn test_rotated_credentials_replace_secret() {
    let config = ConfigBuilder::s3("cluster").build();
    let mut existing = created(plan_private_secret(
        &config,
        NS,
        &s3_descriptor("bucket-a", "us-east-1"),
        None,
    ));
    existing.metadata.resource_version = Some("7".to_string());
    let http_secret = text(&existing, HTTP_SECRET_KEY);

    let mut rotated = s3_descriptor("bucket-a", "us-east-1");
    rotated.credentials = StorageCredentials::S3 {
        access_key_id: "AKIAROTATED".to_string(),
        secret_access_key: "rotated".to_string(),
    };

    match plan_private_secret(&config, NS, &rotated, Some(&existing)) {
        SecretPlan::Replace(secret) => {
            assert_eq!(text(&secret, S3_ACCESS_KEY).as_deref(), Some("AKIAROTATED"));
            assert_eq!(text(&secret, HTTP_SECRET_KEY), http_secret);
            assert_eq!(secret.metadata.resource_version.as_deref(), Some("7"));
        }
        other => panic!("expected Replace, got {:?}", other),
    }
}

#[test]
fn test_switch_to_filesystem_drops_cloud_keys() {
    let config = ConfigBuilder::s3("cluster").build();
    let existing = created(plan_private_secret(
        &config,
        NS,
        &s3_descriptor("bucket-a", "us-east-1"),
        None,
    ));
    let empty_dir = StorageDescriptor {
        backend: StorageBackend::EmptyDir,
        ..Default::default()
    };

    match plan_private_secret(&config, NS, &empty_dir, Some(&existing)) {
        SecretPlan::Replace(secret) => {
            assert!(text(&secret, S3_ACCESS_KEY).is_none());
            assert!(text(&secret, AZURE_ACCOUNT_KEY).is_none());
            assert!(text(&secret, HTTP_SECRET_KEY).is_some());
        }
        other => panic!("expected Replace, got {:?}", other),
    }
}

mod conflicts {
    use http::Method;
    use image_registry_operator::controller::secret_sync::{
        MAX_CONFLICT_ATTEMPTS, SyncOutcome, sync_private_secret,
    };
    use image_registry_operator::controller::{Error, ErrorClass};
    use kube::Api;

    use super::*;
    use crate::api_server::*;
    use crate::api_server::NS;

    fn versioned(secret: &Secret, version: &str) -> Secret {
        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(version.to_string());
        secret
    }

    #[tokio::test]
    async fn test_create_retries_after_conflicts() {
        let config = ConfigBuilder::s3("cluster").build();
        let descriptor = s3_descriptor("bucket", "us-east-1");
        let (client, handle) = mock_client();
        let server = ApiServer::new()
            .get(PRIVATE_SECRET, Reply::not_found())
            .expect(Method::POST, SECRETS, Reply::conflict())
            .get(PRIVATE_SECRET, Reply::not_found())
            .expect(Method::POST, SECRETS, Reply::conflict())
            .get(PRIVATE_SECRET, Reply::not_found())
            .create(SECRETS)
            .run(handle);

        let api: Api<Secret> = Api::namespaced(client, NS);
        let outcome = sync_private_secret(&api, &config, NS, &descriptor)
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Created);
        assert_eq!(finish(server).await.len(), 6);
    }

    #[tokio::test]
    async fn test_persistent_conflict_gives_up() {
        let config = ConfigBuilder::s3("cluster").build();
        let descriptor = s3_descriptor("bucket", "us-east-1");
        let (client, handle) = mock_client();
        let mut server = ApiServer::new();
        for _ in 0..MAX_CONFLICT_ATTEMPTS {
            server = server
                .get(PRIVATE_SECRET, Reply::not_found())
                .expect(Method::POST, SECRETS, Reply::conflict());
        }
        let server = server.run(handle);

        let api: Api<Secret> = Api::namespaced(client, NS);
        let err = sync_private_secret(&api, &config, NS, &descriptor)
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::ConflictError { attempts: 3, .. }),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(finish(server).await.len(), 6);
    }

    #[tokio::test]
    async fn test_replace_rereads_version_after_conflict() {
        let config = ConfigBuilder::s3("cluster").build();
        let stale = created(plan_private_secret(
            &config,
            NS,
            &s3_descriptor("bucket", "us-east-1"),
            None,
        ));
        let rotated = StorageDescriptor {
            credentials: StorageCredentials::S3 {
                access_key_id: "ROTATED".to_string(),
                secret_access_key: "rotated-secret".to_string(),
            },
            ..s3_descriptor("bucket", "us-east-1")
        };
        let (client, handle) = mock_client();
        let server = ApiServer::new()
            .get(PRIVATE_SECRET, Reply::object(&versioned(&stale, "1")))
            .expect(Method::PUT, PRIVATE_SECRET, Reply::conflict())
            .get(PRIVATE_SECRET, Reply::object(&versioned(&stale, "2")))
            .expect(
                Method::PUT,
                PRIVATE_SECRET,
                Reply::object(&versioned(&stale, "3")),
            )
            .run(handle);

        let api: Api<Secret> = Api::namespaced(client, NS);
        let outcome = sync_private_secret(&api, &config, NS, &rotated)
            .await
            .unwrap();
        let seen = finish(server).await;

        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(seen[1].body["metadata"]["resourceVersion"], "1");
        assert_eq!(seen[3].body["metadata"]["resourceVersion"], "2");
        assert_eq!(
            seen[3].body["data"][S3_ACCESS_KEY],
            "Uk9UQVRFRA=="
        );
    }

    #[tokio::test]
    async fn test_forbidden_write_is_not_retried() {
        let config = ConfigBuilder::s3("cluster").build();
        let (client, handle) = mock_client();
        let server = ApiServer::new()
            .get(PRIVATE_SECRET, Reply::not_found())
            .expect(Method::POST, SECRETS, Reply::Failure(403, "Forbidden"))
            .run(handle);

        let api: Api<Secret> = Api::namespaced(client, NS);
        let err = sync_private_secret(&api, &config, NS, &s3_descriptor("bucket", "us-east-1"))
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Authorization);
        assert_eq!(finish(server).await.len(), 2);
    }
}
