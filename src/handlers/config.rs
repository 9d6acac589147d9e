use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the effective configuration this process runs with.
///
/// Read-only. The recognizer is built once from these values, so changing
/// them requires a restart.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port,
                "eager_warmup": config.server.eager_warmup
            },
            "model": {
                "model_id": config.model.model_id,
                "model_dir": config.model.model_dir,
                "device": config.model.device,
                "hubs": config.hub_list(),
                "vad_model": config.model.vad_model,
                "max_single_segment_ms": config.model.max_single_segment_ms,
                "trust_remote_code": config.model.trust_remote_code
            },
            "backend": {
                "command": config.backend.command,
                "args": config.backend.args
            },
            "inference": {
                "batch_size_s": config.inference.batch_size_s,
                "use_itn": config.inference.use_itn,
                "max_upload_mb": config.inference.max_upload_mb
            }
        }
    })))
}
