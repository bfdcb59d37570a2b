//! Health check endpoints.
//!
//! The daemon is unhealthy once the storage API has been unreachable for a
//! configured number of consecutive reconciliation ticks. The counter is
//! fed by the loop; this module only reports it.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    });
}

/// Storage API reachability, recorded once per tick.
pub struct HealthState {
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
}

impl HealthState {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            failure_threshold,
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < self.failure_threshold
    }
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let uptime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - START_TIME.get().unwrap_or(&0);

    let healthy = state.is_healthy();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "status": if healthy { "ok" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "consecutive_api_failures": state.consecutive_failures(),
    }));
    (code, body)
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
