//! Health probe and metrics endpoints.
//!
//! The health probe doubles as the warm-up trigger: the first call after boot
//! (or after a failed load) starts loading the model in the background and
//! returns immediately.

use crate::state::AppState;
use crate::transcription::WarmupState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// `GET /health`. Always 200; readiness is reported in the body.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let status = state.warmup.probe();

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "ready": status.ready,
        "loading": status.loading,
        "error": status.error,
    }))
}

/// `GET /api/v1/metrics`. Pure read; does not trigger warm-up.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let warmup_state = state.warmup.state();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "transcriptions": {
            "in_flight": metrics.inflight_transcriptions,
            "completed": metrics.completed_transcriptions
        },
        "warmup": {
            "state": warmup_state.name(),
            "attempts": state.warmup.attempts(),
            "last_error": warmup_state.last_error(),
            "ready": matches!(warmup_state, WarmupState::Ready(_))
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transcription::model::{ConstructionOptions, ModelBackend};
    use crate::transcription::testing::{wait_for, Gate, StubBackend};
    use crate::transcription::{InferenceOptions, TranscriptionService, WarmupCoordinator};
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    fn state_with(backend: StubBackend) -> (AppState, Arc<StubBackend>) {
        let backend = Arc::new(backend);
        let loader = backend.clone();
        let warmup = Arc::new(WarmupCoordinator::new(Arc::new(move || {
            loader.construct(&ConstructionOptions::default().backend_config("ms", "iic/SenseVoiceSmall", "cpu"))
        })));
        let transcriber = Arc::new(TranscriptionService::new(warmup, InferenceOptions::default()));
        (AppState::new(AppConfig::default(), transcriber), backend)
    }

    #[actix_web::test]
    async fn test_health_triggers_warmup_and_reports_loading() {
        let gate = Gate::new();
        let (state, backend) = state_with(StubBackend::new().gated(gate.clone()));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "status": "ok", "ready": false, "loading": true, "error": null }));

        gate.open();
        assert!(wait_for(Duration::from_secs(5), || state.warmup.probe_status().ready));

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["loading"], false);
        assert_eq!(backend.constructions(), 1);
    }

    #[actix_web::test]
    async fn test_health_is_200_after_failed_load() {
        let (state, _backend) = state_with(StubBackend::new().failing_hub("ms", "repo not found"));
        state.warmup.ensure_loading();
        assert!(wait_for(Duration::from_secs(5), || state.warmup.probe_status().error.is_some()));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ready"], false);
        assert_eq!(body["error"], "repo not found");
    }

    #[actix_web::test]
    async fn test_metrics_does_not_trigger_warmup() {
        let (state, backend) = state_with(StubBackend::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["warmup"]["state"], "idle");
        assert_eq!(body["warmup"]["attempts"], 0);
        assert_eq!(backend.constructions(), 0);
    }
}
