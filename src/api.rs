//! HTTP API surface of the fraud classification gateway.
//!
//! This module owns request parsing, input validation, and response
//! formatting while delegating classification to a [`FraudClassifier`].

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::audio::{sniff_mime, validate_upload, MAX_AUDIO_FILE_SIZE, SUPPORTED_EXTENSIONS};
use crate::backend::{FraudClassifier, FragmentStream};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::formats::{log_preview, TextPredictionResponse, STREAM_SENTINEL};

/// Human-readable service name returned by the root endpoint.
pub const APP_NAME: &str = "FraudSense API";
/// Service version string returned by the root endpoint.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Longest accepted `/predict/text` input, in characters.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Request body cap for audio uploads: the file limit plus multipart framing.
const AUDIO_BODY_LIMIT: usize = MAX_AUDIO_FILE_SIZE + 1024 * 1024;

/// Shared state injected into all route handlers.
pub struct AppState {
    /// Runtime configuration loaded at startup.
    pub cfg: AppConfig,
    /// Upstream classification adapter.
    pub backend: Arc<dyn FraudClassifier>,
}

impl AppState {
    /// Constructs shared handler state.
    pub fn new(cfg: AppConfig, backend: Arc<dyn FraudClassifier>) -> Self {
        Self { cfg, backend }
    }
}

/// Builds the Axum router for all public endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/predict/text", post(predict_text))
        .route(
            "/predict/audio",
            post(predict_audio).layer(DefaultBodyLimit::max(AUDIO_BODY_LIMIT)),
        )
        .with_state(state)
}

/// Capability descriptor (`GET /`).
pub async fn root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "message": format!("{APP_NAME} - Fraud Detection with ML Models"),
        "version": APP_VERSION,
        "endpoints": {
            "health": "/health",
            "text_prediction": "/predict/text (1=Normal, 2=Fraud)",
            "audio_prediction": "/predict/audio (0=Normal, 1=Scam)",
        },
        "models": {
            (state.cfg.text_backend.name): state.cfg.text_backend.model,
            (state.cfg.audio_backend.name): state.cfg.audio_backend.model,
        },
        "supported_audio_formats": SUPPORTED_EXTENSIONS,
        "max_audio_size_mb": MAX_AUDIO_FILE_SIZE / (1024 * 1024),
    }))
}

/// Upstream health (`GET /health`).
///
/// A degraded backend still answers `200`; only a probe that cannot run
/// yields `503`.
pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let report = state.backend.health_check().await.map_err(|err| {
        error!(error = %err, "health check failed");
        AppError::service_unavailable("Service unavailable")
    })?;

    Ok(Json(json!({
        "status": report.overall(),
        "message": format!("{APP_NAME} is running"),
        "models": report.backends,
    })))
}

/// Body of `POST /predict/text`.
#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

/// Classifies a conversation transcript (`POST /predict/text`).
pub async fn predict_text(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TextRequest>, JsonRejection>,
) -> Result<Json<TextPredictionResponse>, AppError> {
    let Json(request) = payload.map_err(|rejection| {
        AppError::invalid_request(format!("Validation error: {}", rejection.body_text()))
    })?;
    let text = validate_text(&request.text)?;

    info!(text = %log_preview(text, 50), "processing text prediction request");
    let label = state.backend.classify_text(text).await;
    info!(prediction = label.code(), "text prediction result");

    Ok(Json(label.into()))
}

/// Returns the trimmed text if it is within bounds.
fn validate_text(raw: &str) -> Result<&str, AppError> {
    let chars = raw.chars().count();
    if chars == 0 || chars > MAX_TEXT_CHARS {
        return Err(AppError::invalid_request(format!(
            "Validation error: text must be between 1 and {MAX_TEXT_CHARS} characters"
        )));
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_request(
            "Validation error: Text cannot be empty or only whitespace",
        ));
    }
    Ok(trimmed)
}

struct AudioUpload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

/// Streams an audio analysis (`POST /predict/audio`).
///
/// Validation failures answer `400` before any upstream call. Accepted
/// uploads get an SSE stream of analysis fragments, a label fragment, and
/// the `[DONE]` sentinel, after which the response ends.
pub async fn predict_audio(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let mut multipart = multipart.map_err(|rejection| {
        AppError::invalid_request(format!("invalid multipart body: {}", rejection.body_text()))
    })?;
    let AudioUpload { filename, bytes } = read_audio_upload(&mut multipart).await?;

    let (validated, bytes) = tokio::task::spawn_blocking(move || {
        let result = validate_upload(filename.as_deref(), bytes.len(), || sniff_mime(&bytes));
        (result, bytes)
    })
    .await
    .map_err(|err| AppError::internal(format!("audio validation task failed: {err}")))?;
    let upload = validated.map_err(AppError::invalid_request)?;

    info!(
        filename = %upload.filename,
        extension = %upload.extension,
        size_bytes = bytes.len(),
        "starting audio streaming response"
    );
    let fragments = state
        .backend
        .classify_audio_stream(bytes, &upload.filename)
        .await;

    Ok(sse_response(fragments))
}

/// Extracts the `file` field from the multipart body.
async fn read_audio_upload(multipart: &mut Multipart) -> Result<AudioUpload, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        AppError::invalid_request(format!("invalid multipart body: {}", err.body_text()))
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(ToOwned::to_owned);
        let bytes = field.bytes().await.map_err(|err| {
            if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::invalid_request(format!(
                    "File too large. Maximum size: {}MB",
                    MAX_AUDIO_FILE_SIZE / (1024 * 1024)
                ))
            } else {
                AppError::invalid_request(format!("failed to read file bytes: {}", err.body_text()))
            }
        })?;

        return Ok(AudioUpload {
            filename,
            bytes: bytes.to_vec(),
        });
    }

    Err(AppError::invalid_request(
        "missing required multipart field: file",
    ))
}

/// Relays fragments as SSE events and appends the completion sentinel.
fn sse_response(fragments: FragmentStream) -> Response {
    let events = fragments
        .map(|fragment| sse_event(&fragment))
        .chain(stream::once(async { Event::default().data(STREAM_SENTINEL) }))
        .map(Ok::<_, Infallible>);

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// SSE fields cannot carry carriage returns; line breaks become `data:` lines.
fn sse_event(fragment: &str) -> Event {
    let normalized = fragment.replace("\r\n", "\n").replace('\r', "\n");
    Event::default().data(normalized)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::audio::{tiny_flac, tiny_ogg_opus, tiny_wav};
    use crate::backend::{BackendHealth, FraudClassifier, FragmentStream, HealthReport};
    use crate::config::{AppConfig, BackendConfig, AUDIO_BACKEND_NAME, TEXT_BACKEND_NAME};
    use crate::error::AppError;
    use crate::formats::TextLabel;

    use super::{build_router, AppState, MAX_TEXT_CHARS};

    #[derive(Default)]
    struct MockBackend {
        text_label: TextLabel,
        fragments: Vec<String>,
        /// Keep the fragment stream open after the last fragment.
        hold_open: bool,
        health: Option<HealthReport>,
        text_calls: AtomicUsize,
        audio_calls: AtomicUsize,
        last_text: Mutex<Option<String>>,
    }

    #[async_trait]
    impl FraudClassifier for MockBackend {
        async fn classify_text(&self, text: &str) -> TextLabel {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_text.lock().unwrap() = Some(text.to_string());
            self.text_label
        }

        async fn classify_audio_stream(&self, _audio: Vec<u8>, _filename: &str) -> FragmentStream {
            self.audio_calls.fetch_add(1, Ordering::SeqCst);
            let fragments = stream::iter(self.fragments.clone());
            if self.hold_open {
                fragments.chain(stream::pending()).boxed()
            } else {
                fragments.boxed()
            }
        }

        async fn health_check(&self) -> Result<HealthReport, AppError> {
            self.health
                .clone()
                .ok_or_else(|| AppError::service_unavailable("probe task panicked"))
        }
    }

    fn backend_cfg(name: &'static str) -> BackendConfig {
        BackendConfig {
            name,
            base_url: "http://upstream.test".to_string(),
            model: format!("{name}-model"),
            timeout: Duration::from_secs(60),
        }
    }

    fn test_cfg() -> AppConfig {
        AppConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            text_backend: backend_cfg(TEXT_BACKEND_NAME),
            audio_backend: backend_cfg(AUDIO_BACKEND_NAME),
            health_timeout: Duration::from_secs(5),
        }
    }

    fn app(mock: MockBackend) -> (axum::Router, Arc<MockBackend>) {
        let mock = Arc::new(mock);
        let state = Arc::new(AppState::new(test_cfg(), mock.clone()));
        (build_router(state), mock)
    }

    async fn parse_json_response(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), 1024 * 1024)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    /// Data payloads of each SSE event, ignoring comments.
    fn sse_data(body: &[u8]) -> Vec<String> {
        String::from_utf8(body.to_vec())
            .expect("utf-8 body")
            .split("\n\n")
            .filter_map(|event| {
                let lines: Vec<&str> = event
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(|data| data.strip_prefix(' ').unwrap_or(data))
                    .collect();
                (!lines.is_empty()).then(|| lines.join("\n"))
            })
            .collect()
    }

    fn text_request(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .uri("/predict/text")
            .method("POST")
            .header("Content-Type", "application/json")
            .body(body.into())
            .expect("request")
    }

    fn audio_request(filename: &str, content: &[u8]) -> Request<Body> {
        let boundary = "X-BOUNDARY";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .uri("/predict/audio")
            .method("POST")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn root_describes_capabilities() {
        let (app, _) = app(MockBackend::default());
        let req = Request::builder()
            .uri("/")
            .body(Body::empty())
            .expect("request");

        let res = app.oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["max_audio_size_mb"], 50);
        assert_eq!(payload["supported_audio_formats"][0], ".flac");
        assert_eq!(payload["models"]["sailor2"], "sailor2-model");
    }

    #[tokio::test]
    async fn text_prediction_returns_backend_label() {
        let (app, mock) = app(MockBackend {
            text_label: TextLabel::Fraud,
            ..Default::default()
        });

        let res = app
            .oneshot(text_request(r#"{"text": "  transfer the OTP now  "}"#))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(parse_json_response(res).await["prediction"], 2);
        assert_eq!(
            mock.last_text.lock().unwrap().as_deref(),
            Some("transfer the OTP now")
        );
    }

    #[tokio::test]
    async fn text_prediction_is_repeatable() {
        let (app, mock) = app(MockBackend::default());
        for _ in 0..3 {
            let res = app
                .clone()
                .oneshot(text_request(r#"{"text": "halo apa kabar"}"#))
                .await
                .expect("response");
            assert_eq!(parse_json_response(res).await["prediction"], 1);
        }
        assert_eq!(mock.text_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn text_prediction_rejects_invalid_bodies() {
        let too_long = serde_json::json!({ "text": "a".repeat(MAX_TEXT_CHARS + 1) }).to_string();
        let bodies = [
            r#"{"text": ""}"#.to_string(),
            r#"{"text": "   \n\t "}"#.to_string(),
            r#"{"message": "hi"}"#.to_string(),
            "not json".to_string(),
            too_long,
        ];

        let (app, mock) = app(MockBackend::default());
        for body in bodies {
            let res = app.clone().oneshot(text_request(body.clone())).await.expect("response");
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{body:.40}");
            assert_eq!(parse_json_response(res).await["error_type"], "VALIDATION_ERROR");
        }
        assert_eq!(mock.text_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn text_prediction_accepts_max_length() {
        let body = serde_json::json!({ "text": "é".repeat(MAX_TEXT_CHARS) }).to_string();
        let (app, _) = app(MockBackend::default());
        let res = app.oneshot(text_request(body)).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn audio_rejects_unsupported_extension_before_upstream() {
        let (app, mock) = app(MockBackend::default());
        for name in ["call.mp3", "call.wav", "call"] {
            let res = app
                .clone()
                .oneshot(audio_request(name, &tiny_wav()))
                .await
                .expect("response");
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);

            let payload = parse_json_response(res).await;
            assert!(payload["detail"]
                .as_str()
                .unwrap()
                .starts_with("Unsupported file format"));
        }
        assert_eq!(mock.audio_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn audio_rejects_non_audio_content() {
        let (app, mock) = app(MockBackend::default());
        let res = app
            .oneshot(audio_request("call.ogg", b"just some plain text, not audio"))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let payload = parse_json_response(res).await;
        assert!(payload["detail"]
            .as_str()
            .unwrap()
            .starts_with("Invalid file format"));
        assert_eq!(mock.audio_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn audio_rejects_oversized_upload() {
        let (app, mock) = app(MockBackend::default());
        let mut content = tiny_wav();
        content.resize(50 * 1024 * 1024 + 1, 0);

        let res = app
            .oneshot(audio_request("call.flac", &content))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let payload = parse_json_response(res).await;
        assert!(payload["detail"]
            .as_str()
            .unwrap()
            .starts_with("File too large"));
        assert_eq!(mock.audio_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn audio_requires_file_field() {
        let (app, _) = app(MockBackend::default());
        let boundary = "X-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nqwen2\r\n--{boundary}--\r\n"
        );
        let req = Request::builder()
            .uri("/predict/audio")
            .method("POST")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request");

        let res = app.oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn audio_relays_fragments_then_sentinel_and_closes() {
        let (app, mock) = app(MockBackend {
            fragments: vec![
                "anal".to_string(),
                "isis".to_string(),
                "Error processing audio: stream interrupted".to_string(),
                "0".to_string(),
            ],
            ..Default::default()
        });

        let res = app
            .oneshot(audio_request("call.ogg", &tiny_ogg_opus()))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(res.into_body(), 1024 * 1024),
        )
        .await
        .expect("stream ends")
        .expect("body bytes");
        assert_eq!(
            sse_data(&body),
            vec![
                "anal",
                "isis",
                "Error processing audio: stream interrupted",
                "0",
                "[DONE]"
            ]
        );
        assert_eq!(mock.audio_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn audio_fragments_with_line_breaks_stay_well_formed() {
        let (app, _) = app(MockBackend {
            fragments: vec!["baris satu\r\nbaris dua".to_string(), "1".to_string()],
            ..Default::default()
        });

        let res = app
            .oneshot(audio_request("call.opus", &tiny_ogg_opus()))
            .await
            .expect("response");
        let body = to_bytes(res.into_body(), 1024 * 1024)
            .await
            .expect("body bytes");
        assert_eq!(sse_data(&body), vec!["baris satu\nbaris dua", "1", "[DONE]"]);
    }

    #[tokio::test]
    async fn audio_accepts_flac_recording() {
        let (app, mock) = app(MockBackend {
            fragments: vec!["percakapan biasa, kelas 0".to_string(), "0".to_string()],
            ..Default::default()
        });

        let res = app
            .oneshot(audio_request("Rekaman.FLAC", &tiny_flac()))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let body = to_bytes(res.into_body(), 1024 * 1024)
            .await
            .expect("body bytes");
        assert_eq!(
            sse_data(&body),
            vec!["percakapan biasa, kelas 0", "0", "[DONE]"]
        );
        assert_eq!(mock.audio_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn audio_fragments_are_flushed_while_stream_is_open() {
        let (app, _) = app(MockBackend {
            fragments: vec!["anal".to_string()],
            hold_open: true,
            ..Default::default()
        });

        let res = app
            .oneshot(audio_request("call.ogg", &tiny_ogg_opus()))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let mut body = res.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("first fragment arrives before the stream ends")
            .expect("body frame")
            .expect("body bytes");
        assert_eq!(sse_data(&first), vec!["anal"]);
    }

    #[tokio::test]
    async fn health_reports_degraded_with_attribution() {
        let mut report = HealthReport::default();
        report.insert(TEXT_BACKEND_NAME, BackendHealth::healthy());
        report.insert(AUDIO_BACKEND_NAME, BackendHealth::unhealthy("connection refused"));
        let (app, _) = app(MockBackend {
            health: Some(report),
            ..Default::default()
        });

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let res = app.oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["status"], "degraded");
        assert_eq!(payload["models"]["sailor2"]["status"], "healthy");
        assert!(payload["models"]["sailor2"]["error"].is_null());
        assert_eq!(payload["models"]["qwen2"]["status"], "unhealthy");
        assert_eq!(payload["models"]["qwen2"]["error"], "connection refused");
    }

    #[tokio::test]
    async fn health_reports_healthy_when_all_backends_are_up() {
        let mut report = HealthReport::default();
        report.insert(TEXT_BACKEND_NAME, BackendHealth::healthy());
        report.insert(AUDIO_BACKEND_NAME, BackendHealth::healthy());
        let (app, _) = app(MockBackend {
            health: Some(report),
            ..Default::default()
        });

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let res = app.oneshot(req).await.expect("response");
        assert_eq!(parse_json_response(res).await["status"], "healthy");
    }

    #[tokio::test]
    async fn health_returns_503_when_probe_cannot_run() {
        let (app, _) = app(MockBackend::default());
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");

        let res = app.oneshot(req).await.expect("response");
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            parse_json_response(res).await["error_type"],
            "SERVICE_UNAVAILABLE"
        );
    }
}
