//! roomie REST API server

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use core_pipeline::{DesignResult, RawImage};
use llm_bridge::{DesignPipeline, GeminiClient, InferenceTarget, PipelineConfig, PipelineError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:3000";

/// Base64 photos from phones run well past axum's 2 MiB default
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<DesignPipeline>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("ROOMIE_CONFIG") {
        Ok(path) => PipelineConfig::from_file(&path)?,
        Err(_) => PipelineConfig::default(),
    };
    let backend = Arc::new(GeminiClient::from_env()?);
    let state = AppState {
        pipeline: Arc::new(DesignPipeline::new(backend, config)?),
    };

    let addr = std::env::var("ROOMIE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state))
        .await
        .context("Server error")?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/targets", get(list_targets))
        .route("/api/design", post(create_design))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_targets(State(state): State<AppState>) -> Json<TargetsResponse> {
    Json(TargetsResponse {
        targets: state.pipeline.config().targets.clone(),
    })
}

async fn create_design(
    State(state): State<AppState>,
    Json(body): Json<DesignBody>,
) -> Result<Json<DesignResult>, ApiError> {
    let bytes = STANDARD
        .decode(body.image_base64.trim())
        .map_err(|e| ApiError::bad_request("invalid_base64", format!("image_base64: {}", e)))?;
    let image = RawImage::from_bytes(bytes).map_err(PipelineError::from)?;

    // Dropping this future when the client disconnects abandons the run.
    let result = state
        .pipeline
        .run(&image, &body.area, &body.furniture, &body.mood)
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct DesignBody {
    image_base64: String,
    #[serde(default)]
    area: String,
    #[serde(default)]
    furniture: String,
    #[serde(default)]
    mood: String,
}

#[derive(Serialize)]
struct TargetsResponse {
    targets: Vec<InferenceTarget>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn bad_request(kind: &str, message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: kind.to_string(),
                message,
            },
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        let kind = error.kind();
        let status = match kind {
            "image_decode" => StatusCode::BAD_REQUEST,
            "overloaded" => StatusCode::SERVICE_UNAVAILABLE,
            "cancelled" | "no_targets" | "internal" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!(kind, "design failed: {}", error);
        } else {
            tracing::warn!(kind, "design rejected: {}", error);
        }
        Self {
            status,
            body: ErrorBody {
                error: kind.to_string(),
                message: error.user_message(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use image::{ImageBuffer, ImageFormat, Rgb};
    use llm_bridge::{BackendError, RetryPolicy, ScriptedBackend, TargetTier};
    use std::io::Cursor;
    use tower::ServiceExt;

    const VALID_PAYLOAD: &str = r##"{
        "analysis": "Compact room with one window.",
        "colors": [{"hex": "#DDE3D5", "name": "Mist", "desc": "Soft daylight tone"}],
        "layout": "Desk by the window, bed along the back wall.",
        "items": [{"name": "Daybed", "style": "Scandinavian", "reason": "Doubles as seating"}]
    }"##;

    fn test_app(backend: ScriptedBackend) -> Router {
        let config = PipelineConfig {
            targets: vec![InferenceTarget::new("lite", TargetTier::Economy, 1024 * 1024)],
            retry: RetryPolicy {
                max_attempts_per_target: 2,
                pacing_delay_ms: 0,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                attempt_timeout_ms: 1_000,
            },
            ..Default::default()
        };
        app(AppState {
            pipeline: Arc::new(DesignPipeline::new(Arc::new(backend), config).unwrap()),
        })
    }

    fn photo_base64() -> String {
        let pixels = ImageBuffer::from_fn(64, 48, |x, y| Rgb([x as u8 * 4, y as u8 * 5, 90]));
        let mut bytes = Vec::new();
        pixels
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        STANDARD.encode(bytes)
    }

    fn design_request(image_base64: &str) -> Request<Body> {
        let body = serde_json::json!({
            "image_base64": image_base64,
            "area": "3m x 3m",
            "furniture": "bed, desk",
            "mood": "calm",
        });
        Request::builder()
            .method("POST")
            .uri("/api/design")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app(ScriptedBackend::new())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_targets_lists_configuration() {
        let response = test_app(ScriptedBackend::new())
            .oneshot(Request::get("/api/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = read_json(response).await;
        assert_eq!(body["targets"][0]["name"], "lite");
        assert_eq!(body["targets"][0]["tier"], "economy");
    }

    #[tokio::test]
    async fn test_design_returns_result() {
        let backend = ScriptedBackend::new().always("lite", Ok(VALID_PAYLOAD.to_string()));
        let response = test_app(backend)
            .oneshot(design_request(&photo_base64()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let result: DesignResult = read_json(response).await;
        assert_eq!(result.colors[0].hex, "#DDE3D5");
        assert_eq!(result.items[0].name, "Daybed");
    }

    #[tokio::test]
    async fn test_invalid_base64_is_bad_request() {
        let response = test_app(ScriptedBackend::new())
            .oneshot(design_request("not base64!!"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error, "invalid_base64");
    }

    #[tokio::test]
    async fn test_undecodable_image_is_bad_request() {
        let response = test_app(ScriptedBackend::new())
            .oneshot(design_request(&STANDARD.encode(b"definitely not an image")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error, "image_decode");
    }

    #[tokio::test]
    async fn test_processing_failure_is_server_error() {
        let error = PipelineError::from(core_pipeline::NormalizeError::InvalidOptions(
            "min_edge must be greater than zero".to_string(),
        ));
        let response = ApiError::from(error).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error, "internal");
        assert!(!body.message.contains("upload"));
    }

    #[tokio::test]
    async fn test_overload_is_service_unavailable() {
        let backend = ScriptedBackend::new()
            .always("lite", Err(BackendError::rate_limited("RESOURCE_EXHAUSTED")));
        let response = test_app(backend)
            .oneshot(design_request(&photo_base64()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error, "overloaded");
        assert!(body.message.contains("overloaded"));
    }

    #[tokio::test]
    async fn test_schema_violation_is_bad_gateway() {
        let backend = ScriptedBackend::new()
            .always("lite", Ok(r#"{"analysis": "x", "layout": "y"}"#.to_string()));
        let response = test_app(backend)
            .oneshot(design_request(&photo_base64()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body: ErrorBody = read_json(response).await;
        assert_eq!(body.error, "schema_violation");
    }
}
