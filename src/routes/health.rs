use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::app_state::AppState;
use crate::db;
use crate::models::job::JobWeight;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub jobs: JobCapacity,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    pub extractor: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_result<E>(result: Result<(), E>, start: Instant) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(_) => Self {
                status: "error".to_string(),
                latency_ms: None,
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Serialize)]
pub struct JobCapacity {
    pub running: usize,
    pub heavy_in_use: usize,
    pub heavy_capacity: usize,
    pub light_in_use: usize,
    pub light_capacity: usize,
}

/// GET /health: Dependency status and job slot usage.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let database = ComponentHealth::from_result(db::ping(&state.db).await, start);

    let start = Instant::now();
    let redis = ComponentHealth::from_result(state.cache.health_check().await, start);

    let extractor = ComponentHealth::from_result(
        if state.extractor.is_available() { Ok(()) } else { Err(()) },
        Instant::now(),
    );

    let all_healthy = database.is_ok() && redis.is_ok() && extractor.is_ok();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let limiter = state.orchestrator.limiter();
    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            redis,
            extractor,
        },
        jobs: JobCapacity {
            running: state.orchestrator.registry().len(),
            heavy_in_use: limiter.in_use(JobWeight::Heavy),
            heavy_capacity: limiter.capacity(JobWeight::Heavy),
            light_in_use: limiter.in_use(JobWeight::Light),
            light_capacity: limiter.capacity(JobWeight::Light),
        },
    };

    (status_code, Json(response))
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
