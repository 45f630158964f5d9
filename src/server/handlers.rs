use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::pipeline::{FuseImageRequest, GenerateBackgroundRequest, MattingOutcome};
use crate::tracing_config::spans;
use crate::types::{AspectRatio, ColorMatch};
use axum::{
    extract::{rejection::JsonRejection, multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::Instrument;

/// Body of `POST /api/ai-fuse`
///
/// Fields are optional at the type level so that a missing one turns into a
/// descriptive 400 instead of a generic deserialization failure.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiFuseRequest {
    pub action: Option<String>,
    pub prompt: Option<String>,
    pub matting_url: Option<String>,
    pub background_url: Option<String>,
    pub aspect_ratio: Option<String>,
    pub color_match: Option<String>,
    pub strength: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub generator: &'static str,
    pub timestamp: String,
}

/// Upload a photo and remove its background
pub async fn matting(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<MattingOutcome>> {
    let mut multipart = multipart?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            tracing::debug!(field = ?field.name(), "Ignoring multipart field");
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await?.to_vec();
        upload = Some((file_name, content_type, data));
        break;
    }

    let (file_name, content_type, data) =
        upload.ok_or_else(|| ApiError::BadRequest("No file provided".to_string()))?;
    if data.is_empty() {
        return Err(ApiError::BadRequest("Empty file provided".to_string()));
    }

    tracing::info!(
        file_name = %file_name,
        size = data.len(),
        content_type = ?content_type,
        "Matting request received"
    );

    let outcome = state
        .service
        .matting(&file_name, content_type.as_deref(), data)
        .instrument(spans::request("matting", &uuid::Uuid::new_v4().to_string()))
        .await?;
    Ok(Json(outcome))
}

/// Generate a background or fuse layers, depending on `action`
pub async fn ai_fuse(
    State(state): State<AppState>,
    body: Result<Json<AiFuseRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = body?;
    let action = request.action.as_deref().unwrap_or_default().to_string();
    let span = spans::request(&action, &uuid::Uuid::new_v4().to_string());

    match action.as_str() {
        "generate-background" => {
            let request = GenerateBackgroundRequest {
                prompt: request.prompt.unwrap_or_default(),
                matting_url: request.matting_url.unwrap_or_default(),
                aspect_ratio: parse_aspect_ratio(request.aspect_ratio.as_deref())?,
            };
            let backgrounds = state
                .service
                .generate_background(request)
                .instrument(span)
                .await?;
            Ok(Json(json!({ "backgrounds": backgrounds })))
        },
        "fuse-image" => {
            let request = FuseImageRequest {
                matting_url: request.matting_url.unwrap_or_default(),
                background_url: request.background_url.unwrap_or_default(),
                aspect_ratio: parse_aspect_ratio(request.aspect_ratio.as_deref())?,
                color_match: request
                    .color_match
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .map(str::parse::<ColorMatch>)
                    .transpose()?,
                strength: request.strength,
            };
            let fused_url = state.service.fuse_image(request).instrument(span).await?;
            Ok(Json(json!({ "fusedUrl": fused_url })))
        },
        "" => Err(ApiError::BadRequest("Missing action".to_string())),
        other => Err(ApiError::BadRequest(format!("Invalid action: {}", other))),
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        generator: state.service.generator_name(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// Empty strings count as absent
fn parse_aspect_ratio(value: Option<&str>) -> ApiResult<Option<AspectRatio>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => Ok(Some(text.parse()?)),
    }
}
