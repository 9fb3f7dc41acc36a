//! Scripted stand-in for the Kubernetes API server
//!
//! Requests must arrive in the scripted order. Each one is answered with its
//! canned reply and recorded for later assertions; once the script is done
//! the server hangs up, so any extra request fails.

use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use kube::Client;
use kube::client::Body;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

pub const NS: &str = "openshift-image-registry";
pub const USER_SECRET: &str =
    "/api/v1/namespaces/openshift-image-registry/secrets/image-registry-private-configuration-user";
pub const AWS_CREDS: &str = "/api/v1/namespaces/kube-system/secrets/aws-creds";
pub const PRIVATE_SECRET: &str =
    "/api/v1/namespaces/openshift-image-registry/secrets/image-registry-private-configuration";
pub const SECRETS: &str = "/api/v1/namespaces/openshift-image-registry/secrets";
pub const DEPLOYMENT: &str =
    "/apis/apps/v1/namespaces/openshift-image-registry/deployments/image-registry";
pub const DEPLOYMENTS: &str = "/apis/apps/v1/namespaces/openshift-image-registry/deployments";
pub const SERVICE: &str = "/api/v1/namespaces/openshift-image-registry/services/image-registry";
pub const SERVICES: &str = "/api/v1/namespaces/openshift-image-registry/services";
pub const CONFIG_STATUS: &str = "/apis/imageregistry.operator.openshift.io/v1/configs/cluster/status";

/// Client whose requests are served through the returned handle
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), handle)
}

/// Canned reply to one request
pub enum Reply {
    /// 200 with this object
    Object(Value),
    /// 201 echoing the request body
    Created,
    /// `Status` failure with this code and reason
    Failure(u16, &'static str),
}

impl Reply {
    pub fn object<T: Serialize>(obj: &T) -> Self {
        Reply::Object(serde_json::to_value(obj).unwrap())
    }

    pub fn not_found() -> Self {
        Reply::Failure(404, "NotFound")
    }

    pub fn conflict() -> Self {
        Reply::Failure(409, "Conflict")
    }
}

/// A request the server answered
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

struct Exchange {
    method: Method,
    path: String,
    reply: Reply,
}

#[derive(Default)]
pub struct ApiServer {
    script: Vec<Exchange>,
}

impl ApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, method: Method, path: &str, reply: Reply) -> Self {
        self.script.push(Exchange {
            method,
            path: path.to_string(),
            reply,
        });
        self
    }

    pub fn get(self, path: &str, reply: Reply) -> Self {
        self.expect(Method::GET, path, reply)
    }

    pub fn create(self, path: &str) -> Self {
        self.expect(Method::POST, path, Reply::Created)
    }

    /// Serve the script in order on a background task
    pub fn run(self, mut handle: ApiServerHandle) -> JoinHandle<Vec<Recorded>> {
        tokio::spawn(async move {
            let mut seen: Vec<Recorded> = Vec::new();
            for exchange in self.script {
                let (request, send) = handle
                    .next_request()
                    .await
                    .unwrap_or_else(|| panic!("client hung up before {}", exchange.path));
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                assert_eq!(
                    (&method, path.as_str()),
                    (&exchange.method, exchange.path.as_str()),
                    "out of order after {:?}",
                    seen.iter().map(|r| &r.path).collect::<Vec<_>>()
                );

                let bytes = request.into_body().collect_bytes().await.unwrap();
                let body: Value = if bytes.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&bytes).unwrap()
                };

                let (status, reply) = match exchange.reply {
                    Reply::Object(obj) => (StatusCode::OK, obj),
                    Reply::Created => (StatusCode::CREATED, body.clone()),
                    Reply::Failure(code, reason) => (
                        StatusCode::from_u16(code).unwrap(),
                        json!({
                            "kind": "Status",
                            "apiVersion": "v1",
                            "metadata": {},
                            "status": "Failure",
                            "message": format!("{} {}", reason, path),
                            "reason": reason,
                            "code": code,
                        }),
                    ),
                };
                send.send_response(
                    Response::builder()
                        .status(status)
                        .body(Body::from(serde_json::to_vec(&reply).unwrap()))
                        .unwrap(),
                );
                seen.push(Recorded { method, path, body });
            }
            seen
        })
    }
}

/// Wait for the server to work through its script
pub async fn finish(server: JoinHandle<Vec<Recorded>>) -> Vec<Recorded> {
    tokio::time::timeout(Duration::from_secs(1), server)
        .await
        .expect("scripted requests never arrived")
        .expect("API server task panicked")
}
