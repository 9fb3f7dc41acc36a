use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::health::HealthState;
use crate::storage::{BucketApiFactory, CloudBucketFactory};

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Bucket clients for the storage backends
    pub buckets: Arc<dyn BucketApiFactory>,
    /// Process configuration
    pub config: OperatorConfig,
    /// Metrics sink, absent in tests
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self::with_buckets(client, Arc::new(CloudBucketFactory::new()), config, health_state)
    }

    /// Build a context with a specific bucket backend
    pub fn with_buckets(
        client: Client,
        buckets: Arc<dyn BucketApiFactory>,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            buckets,
            config,
            health_state,
        }
    }
}
