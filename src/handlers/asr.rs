//! Transcription endpoint.

use crate::{
    error::{AppError, AppResult},
    state::AppState,
    transcription::TranscriptionRequest,
};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;

/// Multipart field names accepted for the audio payload.
const AUDIO_FIELDS: &[&str] = &["file", "audio"];

/// Upper bound for text fields such as `language`.
const MAX_TEXT_FIELD_BYTES: usize = 1024;

struct AsrUpload {
    audio: Vec<u8>,
    filename: Option<String>,
    language: Option<String>,
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /api/v1/asr`
///
/// ## Request:
/// Multipart form data with the audio in a field named `file` (or `audio`)
/// and an optional `language` text field (`auto` when omitted).
///
/// ## Responses:
/// - `200 {"text": "..."}`
/// - `503` while the model is loading or after a failed load; retry later
/// - `500` when inference fails for this request
/// - `400` for a malformed form or a missing file
/// - `413` when the upload exceeds the configured limit
pub async fn transcribe_audio(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let upload = read_upload(payload, state.get_config().max_upload_bytes()).await?;

    tracing::debug!(
        bytes = upload.audio.len(),
        filename = upload.filename.as_deref().unwrap_or("-"),
        language = upload.language.as_deref().unwrap_or("auto"),
        "Audio upload received"
    );

    let request = TranscriptionRequest {
        audio_bytes: upload.audio,
        filename_hint: upload.filename,
        language_hint: upload.language,
    };

    let service = state.transcriber.clone();
    let inflight = state.track_transcription();
    let text = web::block(move || service.transcribe(request)).await??;
    inflight.complete();

    Ok(HttpResponse::Ok().json(json!({ "text": text })))
}

async fn read_upload(mut payload: Multipart, max_bytes: usize) -> AppResult<AsrUpload> {
    let mut audio: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut language: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::BadRequest("Missing field name".to_string()))?
            .to_string();
        let field_filename = content_disposition.get_filename().map(str::to_string);

        if AUDIO_FIELDS.contains(&field_name.as_str()) {
            if audio.is_some() {
                drain(&mut field).await?;
                continue;
            }
            filename = field_filename;
            audio = Some(read_field(&mut field, max_bytes, |limit| {
                AppError::PayloadTooLarge(format!("File too large (max: {} bytes)", limit))
            })
            .await?);
        } else if field_name == "language" {
            let bytes = read_field(&mut field, MAX_TEXT_FIELD_BYTES, |_| {
                AppError::ValidationError("language field is too long".to_string())
            })
            .await?;
            let value = String::from_utf8(bytes)
                .map_err(|_| AppError::BadRequest("language must be UTF-8 text".to_string()))?;
            language = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        } else {
            drain(&mut field).await?;
        }
    }

    let audio = audio.ok_or_else(|| AppError::BadRequest("No audio file provided (expected field \"file\")".to_string()))?;
    if audio.is_empty() {
        return Err(AppError::BadRequest("Uploaded audio file is empty".to_string()));
    }

    Ok(AsrUpload { audio, filename, language })
}

async fn read_field(
    field: &mut Field,
    limit: usize,
    too_large: impl Fn(usize) -> AppError,
) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
        if bytes.len() + chunk.len() > limit {
            return Err(too_large(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn drain(field: &mut Field) -> Result<(), AppError> {
    while let Some(chunk) = field.next().await {
        chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
    }
    Ok(())
}
