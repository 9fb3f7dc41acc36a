//! Health server for Kubernetes liveness checks and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness (is the process alive?)
//! - `/readyz` - Readiness (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::controller::error::ErrorClass;
use crate::crd::{ConfigPhase, StorageBackend};

/// Labels identifying a Config
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConfigLabels {
    pub name: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ConfigLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for failed reconciliations
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub name: String,
    pub class: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ErrorLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("class", self.class.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the per-Config phase gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub name: String,
    pub phase: String,
}

impl prometheus_client::encoding::EncodeLabelSet for PhaseLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for storage provisioning
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BackendLabels {
    pub backend: String,
}

impl prometheus_client::encoding::EncodeLabelSet for BackendLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("backend", self.backend.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ConfigLabels, Counter>,
    /// Failed reconciliations by error class
    pub reconciliation_errors_total: Family<ErrorLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ConfigLabels, Histogram>,
    /// Buckets or containers provisioned for a Config, by backend
    pub buckets_provisioned_total: Family<BackendLabels, Counter>,
    /// 1 for the phase each Config is in, 0 for the others
    pub config_phase: Family<PhaseLabels, Gauge>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ConfigLabels, Counter>::default();
        registry.register(
            "image_registry_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "image_registry_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ConfigLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "image_registry_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let buckets_provisioned_total = Family::<BackendLabels, Counter>::default();
        registry.register(
            "image_registry_operator_buckets_provisioned",
            "Total number of buckets or containers created or adopted",
            buckets_provisioned_total.clone(),
        );

        let config_phase = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "image_registry_operator_config_phase",
            "Current phase of each Config",
            config_phase.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            buckets_provisioned_total,
            config_phase,
            registry,
        }
    }

    /// Record a finished reconciliation
    pub fn record_reconcile(&self, name: &str, duration_secs: f64) {
        let labels = ConfigLabels {
            name: name.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, name: &str, class: ErrorClass) {
        let labels = ErrorLabels {
            name: name.to_string(),
            class: class.reason().to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record newly provisioned storage
    pub fn record_bucket_provisioned(&self, backend: StorageBackend) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.buckets_provisioned_total.get_or_create(&labels).inc();
    }

    /// Set the phase gauge of a Config
    pub fn set_phase(&self, name: &str, phase: ConfigPhase) {
        for candidate in ConfigPhase::ALL {
            let labels = PhaseLabels {
                name: name.to_string(),
                phase: candidate.to_string(),
            };
            self.config_phase
                .get_or_create(&labels)
                .set(i64::from(candidate == phase));
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (connected to K8s API)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember when the last reconcile finished
    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
///
/// Returns Prometheus-formatted metrics.
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0 on `port` and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Health server listening on 0.0.0.0:{}", port);

    axum::serve(listener, app).await
}
