//! HTTP handlers and the per-request recognition pipeline.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::{
        multipart::{Field, MultipartError},
        ConnectInfo, DefaultBodyLimit, Multipart, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tempfile::NamedTempFile;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink, FileAuditSink, UploadDigest};
use crate::config::{EngineSettings, ServerConfig};
use crate::error::ApiError;
use crate::normalize;
use crate::ocr::registry::EngineRegistry;
use crate::ocr::EngineFactory;
use crate::rate_limit::RateLimiter;
use crate::response::{self, RequestMeta};
use crate::stats::{round_to, unix_now, StatsAggregator, StatsSnapshot};
use crate::validation::{self, ALLOWED_EXTENSIONS};

/// Headroom above the file ceiling for the other multipart fields.
const BODY_OVERHEAD: usize = 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<EngineRegistry>,
    pub stats: Arc<StatsAggregator>,
    pub limiter: Arc<RateLimiter>,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    pub fn new(config: ServerConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let registry = EngineRegistry::new(factory, &config);
        let limiter = RateLimiter::new(config.rate_limit_window(), config.rate_limit_requests);
        let audit = FileAuditSink::new(config.audit_dir.clone());
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            stats: Arc::new(StatsAggregator::new()),
            limiter: Arc::new(limiter),
            audit: Arc::new(audit),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_OVERHEAD);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/process", post(process_file))
        .route("/analyze", post(analyze_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Health and stats
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ocr_ready: bool,
    models_loaded: bool,
    version: &'static str,
    uptime_seconds: f64,
    supported_languages: Vec<String>,
    loaded_languages: Vec<String>,
    timestamp: f64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let ready = state.registry.is_ready();
    let loaded = state.registry.loaded_languages();
    Json(HealthResponse {
        status: if ready { "healthy" } else { "initializing" },
        ocr_ready: ready,
        models_loaded: !loaded.is_empty(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: round_to(state.stats.uptime_seconds(), 2),
        supported_languages: state.registry.supported_languages().to_vec(),
        loaded_languages: loaded,
        timestamp: unix_now(),
    })
}

#[derive(Serialize)]
struct StatsResponse {
    server_stats: ServerStatsView,
    engine_config: EngineSettings,
    system_info: SystemInfo,
}

#[derive(Serialize)]
struct ServerStatsView {
    #[serde(flatten)]
    snapshot: StatsSnapshot,
    models_loaded: bool,
}

#[derive(Serialize)]
struct SystemInfo {
    version: &'static str,
    ocr_version: String,
    supported_formats: Vec<&'static str>,
    supported_languages: Vec<String>,
    default_language: String,
    max_file_size: u64,
    rate_limit_window_seconds: u64,
    rate_limit_requests: usize,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let config = &state.config;
    Json(StatsResponse {
        server_stats: ServerStatsView {
            snapshot: state.stats.snapshot(),
            models_loaded: state.registry.is_ready(),
        },
        engine_config: state.registry.settings().clone(),
        system_info: SystemInfo {
            version: env!("CARGO_PKG_VERSION"),
            ocr_version: config.engine.ocr_version.clone(),
            supported_formats: ALLOWED_EXTENSIONS.to_vec(),
            supported_languages: config.supported_languages.clone(),
            default_language: config.default_language.clone(),
            max_file_size: config.max_file_size,
            rate_limit_window_seconds: config.rate_limit_window_secs,
            rate_limit_requests: config.rate_limit_requests,
        },
    })
}

// ============================================================================
// Recognition pipeline
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Process,
    Analyze,
}

/// Recognize an uploaded file and return text, confidences and orientations.
async fn process_file(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let key = client_key(&headers, connect, state.config.trust_forwarded_for);
    handle(state, key, multipart, Mode::Process).await
}

/// Recognize an uploaded file and return a numbered block listing.
async fn analyze_file(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let key = client_key(&headers, connect, state.config.trust_forwarded_for);
    handle(state, key, multipart, Mode::Analyze).await
}

/// Every request is counted once on arrival. Only requests that reach the
/// engine record a success or failure outcome.
async fn handle(state: AppState, client: String, multipart: Multipart, mode: Mode) -> Response {
    let started = Instant::now();
    let request_id = Uuid::new_v4().simple().to_string();
    state.stats.record_attempt();

    match run_pipeline(&state, &client, &request_id, started, multipart, mode).await {
        Ok(response) => response,
        Err(e) => {
            let elapsed = started.elapsed().as_secs_f64();
            if e.is_pipeline_failure() {
                state.stats.record_outcome(false, elapsed);
            } else {
                debug!("Request {} rejected: {}", request_id, e);
            }
            e.with_time(elapsed).into_response()
        }
    }
}

async fn run_pipeline(
    state: &AppState,
    client: &str,
    request_id: &str,
    started: Instant,
    mut multipart: Multipart,
    mode: Mode,
) -> Result<Response, ApiError> {
    if !state.limiter.admit(client, Instant::now()) {
        return Err(ApiError::RateLimited {
            window_seconds: state.limiter.window().as_secs(),
        });
    }

    let upload = read_upload(&mut multipart, state.config.max_file_size).await?;
    let resolved = state.registry.resolve(upload.language.as_deref()).await?;

    info!(
        "Processing {} ({} bytes, language: {}, request: {})",
        upload.filename, upload.bytes, resolved.language, request_id
    );

    let raw = state.registry.recognize(&resolved, upload.file.path()).await?;
    let Upload {
        filename,
        file,
        sha256,
        bytes,
        detailed,
        save_result,
        ..
    } = upload;
    // Remove the temp file as soon as the engine is done with it.
    drop(file);

    let batch = normalize::normalize(&raw, state.config.min_confidence);
    let meta = RequestMeta {
        request_id: request_id.to_string(),
        filename: filename.clone(),
        language: resolved.language.clone(),
        processing_time: started.elapsed().as_secs_f64(),
        ocr_version: state.config.engine.ocr_version.clone(),
    };

    let mut body = match mode {
        Mode::Process => serde_json::to_value(response::build(&batch, meta, detailed)),
        Mode::Analyze => serde_json::to_value(response::analysis(&batch, meta)),
    }
    .context("Failed to serialize response")?;

    if save_result {
        let record = AuditRecord::new(request_id, sha256, bytes, body.clone());
        match state.audit.save(&record).await {
            Ok(location) => body["saved_to"] = serde_json::Value::String(location),
            Err(e) => warn!("Failed to save result for {}: {:#}", request_id, e),
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    state.stats.record_outcome(true, elapsed);
    info!(
        "Processed {}: {} blocks in {:.2}s",
        filename,
        batch.len(),
        elapsed
    );

    Ok((StatusCode::OK, Json(body)).into_response())
}

// ============================================================================
// Upload handling
// ============================================================================

/// A validated upload, stored in a temp file deleted on drop.
struct Upload {
    filename: String,
    file: NamedTempFile,
    sha256: String,
    bytes: u64,
    language: Option<String>,
    detailed: bool,
    save_result: bool,
}

async fn read_upload(multipart: &mut Multipart, max_bytes: u64) -> Result<Upload, ApiError> {
    let mut stored: Option<(String, NamedTempFile, UploadDigest)> = None;
    let mut language = None;
    let mut detailed = false;
    let mut save_result = false;
    let field_error = multipart_error(max_bytes);

    while let Some(field) = multipart.next_field().await.map_err(&field_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                stored = Some(store_file(field, max_bytes).await?);
            }
            Some("language") => {
                let value = field.text().await.map_err(&field_error)?;
                language = Some(value.trim().to_string()).filter(|l| !l.is_empty());
            }
            Some("detailed") => {
                detailed = parse_flag(&field.text().await.map_err(&field_error)?);
            }
            Some("save_result") => {
                save_result = parse_flag(&field.text().await.map_err(&field_error)?);
            }
            _ => {}
        }
    }

    let (filename, file, digest) = stored.ok_or(ApiError::MissingFile)?;
    let bytes = digest.bytes();
    Ok(Upload {
        filename,
        file,
        sha256: digest.finish(),
        bytes,
        language,
        detailed,
        save_result,
    })
}

/// Validate the file field's name, then stream it to a temp file and check
/// its size.
async fn store_file(
    mut field: Field<'_>,
    max_bytes: u64,
) -> Result<(String, NamedTempFile, UploadDigest), ApiError> {
    let original = field.file_name().unwrap_or_default().trim().to_string();
    if original.is_empty() {
        return Err(ApiError::InvalidFile("missing filename".to_string()));
    }
    if !validation::is_allowed_extension(&original) {
        return Err(ApiError::UnsupportedFormat(original));
    }
    let filename = validation::sanitize_filename(&original);
    let suffix = validation::extension_of(&original)
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();

    let mut file = tempfile::Builder::new()
        .prefix("ocr_")
        .suffix(&suffix)
        .tempfile()
        .context("Failed to create temp file")?;
    let mut digest = UploadDigest::default();

    while let Some(chunk) = field.chunk().await.map_err(multipart_error(max_bytes))? {
        digest.update(&chunk);
        file.write_all(&chunk).context("Failed to write temp file")?;
        if digest.bytes() > max_bytes {
            break;
        }
    }
    file.flush().context("Failed to flush temp file")?;

    if !validation::is_within_size_limit(file.as_file_mut(), max_bytes) {
        return Err(ApiError::FileTooLarge { max_bytes });
    }
    if digest.bytes() == 0 {
        return Err(ApiError::InvalidFile("empty file".to_string()));
    }

    Ok((filename, file, digest))
}

/// Body-limit hits surface as multipart errors; report them as oversize.
fn multipart_error(max_bytes: u64) -> impl Fn(MultipartError) -> ApiError {
    move |e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::FileTooLarge { max_bytes }
        } else {
            ApiError::InvalidFile(format!("Multipart error: {}", e))
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// The peer address, or the first `X-Forwarded-For` hop when the proxy header
/// is trusted.
fn client_key(
    headers: &HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> String {
    let forwarded = trust_forwarded_for
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    forwarded
        .or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::testing::{FakeEngine, FakeFactory};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "ocr-test-boundary";

    fn payload() -> Value {
        json!([[
            [[[10, 10], [110, 10], [110, 40], [10, 40]], ["Factura 001", 0.97]],
            [[[10, 50], [20, 50], [20, 150], [10, 150]], ["TOTAL", 0.8]],
            [[[10, 50], [20, 50]], ["broken"]]
        ]])
    }

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            audit_dir: dir.to_path_buf(),
            ..ServerConfig::default()
        }
    }

    fn state_with(config: ServerConfig, factory: Arc<FakeFactory>) -> AppState {
        AppState::new(config, factory)
    }

    enum Part<'a> {
        File(&'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn multipart_request(uri: &str, parts: &[Part]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::File(filename, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            filename
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}",
                            name, value
                        )
                        .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(state, request).await
    }

    #[tokio::test]
    async fn test_process_summary() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(payload()));
        let state = state_with(test_config(dir.path()), factory.clone());

        let request = multipart_request(
            "/process",
            &[Part::Text("language", "en"), Part::File("scan.PNG", b"fake image")],
        );
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["total_blocks"], 2);
        assert_eq!(body["text"], "Factura 001\nTOTAL");
        assert_eq!(body["language"], "en");
        assert_eq!(body["filename"], "scan.PNG");
        assert_eq!(body["avg_confidence"], 0.885);
        assert_eq!(body["text_orientations"]["horizontal"], 1);
        assert_eq!(body["text_orientations"]["vertical"], 1);
        assert!(body.get("blocks").is_none());
        assert_eq!(factory.calls(), 1);

        let snap = state.stats.snapshot();
        assert_eq!(snap.counters.total_requests, 1);
        assert_eq!(snap.counters.successful_requests, 1);
        assert_eq!(snap.counters.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_process_detailed() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(test_config(dir.path()), Arc::new(FakeFactory::new(payload())));

        let request = multipart_request(
            "/process",
            &[Part::File("scan.jpg", b"fake"), Part::Text("detailed", "TRUE")],
        );
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["language"], "es");
        assert_eq!(body["blocks"].as_array().unwrap().len(), 2);
        assert_eq!(body["blocks"][0]["block_id"], 0);
        assert_eq!(body["blocks"][1]["orientation"], "vertical");
        assert_eq!(body["blocks"][0]["coordinates"][2], json!([110.0, 40.0]));
        assert_eq!(body["min_confidence"], 0.8);
        assert_eq!(body["max_confidence"], 0.97);
        assert_eq!(body["quality"], json!({"high": 1, "medium": 1, "low": 0}));
    }

    #[tokio::test]
    async fn test_temp_file_removed_after_recognition() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(payload()));
        let state = state_with(test_config(dir.path()), factory.clone());

        let request = multipart_request("/process", &[Part::File("doc.pdf", b"%PDF-1.4")]);
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);

        let seen = factory.seen_paths();
        assert_eq!(seen.len(), 1);
        let (path, existed) = &seen[0];
        assert!(existed);
        assert_eq!(path.extension().unwrap(), "pdf");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_rejected_before_engine() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(payload()));
        let state = state_with(test_config(dir.path()), factory.clone());

        let request = multipart_request("/process", &[Part::File("setup.exe", b"MZ")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("Unsupported format"));
        assert_eq!(factory.calls(), 0);

        let snap = state.stats.snapshot();
        assert_eq!(snap.counters.total_requests, 1);
        assert_eq!(snap.counters.failed_requests, 0);
        assert_eq!(snap.counters.successful_requests, 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(test_config(dir.path()), Arc::new(FakeFactory::new(payload())));

        let request = multipart_request("/process", &[Part::Text("language", "es")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file provided");
    }

    #[tokio::test]
    async fn test_oversize_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            max_file_size: 16,
            ..test_config(dir.path())
        };
        let factory = Arc::new(FakeFactory::new(payload()));
        let state = state_with(config, factory.clone());

        let request = multipart_request("/process", &[Part::File("big.png", &[0u8; 64])]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body["error"].as_str().unwrap().contains("File too large"));
        assert_eq!(factory.calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            rate_limit_requests: 2,
            ..test_config(dir.path())
        };
        let state = state_with(config, Arc::new(FakeFactory::new(payload())));

        for _ in 0..2 {
            let request = multipart_request("/process", &[Part::File("a.png", b"x")]);
            assert_eq!(send(&state, request).await.0, StatusCode::OK);
        }
        let request = multipart_request("/process", &[Part::File("a.png", b"x")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["window_seconds"], 60);

        let snap = state.stats.snapshot();
        assert_eq!(snap.counters.total_requests, 3);
        assert_eq!(snap.counters.successful_requests, 2);
        assert_eq!(snap.counters.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_reset_limit() {
        let dir = tempfile::tempdir().unwrap();
        let send_from = |state: AppState, hop: &'static str| async move {
            let mut request = multipart_request("/process", &[Part::File("a.png", b"x")]);
            request
                .headers_mut()
                .insert("x-forwarded-for", hop.parse().unwrap());
            send(&state, request).await.0
        };

        let config = ServerConfig {
            rate_limit_requests: 2,
            ..test_config(dir.path())
        };
        let state = state_with(config, Arc::new(FakeFactory::new(payload())));
        assert_eq!(send_from(state.clone(), "198.51.100.1").await, StatusCode::OK);
        assert_eq!(send_from(state.clone(), "198.51.100.2").await, StatusCode::OK);
        assert_eq!(
            send_from(state.clone(), "198.51.100.3").await,
            StatusCode::TOO_MANY_REQUESTS
        );

        let trusted = ServerConfig {
            rate_limit_requests: 2,
            trust_forwarded_for: true,
            ..test_config(dir.path())
        };
        let state = state_with(trusted, Arc::new(FakeFactory::new(payload())));
        assert_eq!(send_from(state.clone(), "198.51.100.1").await, StatusCode::OK);
        assert_eq!(send_from(state.clone(), "198.51.100.1").await, StatusCode::OK);
        assert_eq!(send_from(state.clone(), "198.51.100.2").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_engine_is_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new(payload()).failing("en").failing("es"));
        let state = state_with(test_config(dir.path()), factory.clone());

        let request = multipart_request("/process", &[Part::File("scan.png", b"img")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "OCR not available");
        assert_eq!(factory.calls(), 0);
        assert_eq!(state.stats.snapshot().counters.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_engine_failure_counts_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::with_engine(|lang| {
            FakeEngine::new(lang, json!([])).failing()
        }));
        let state = state_with(test_config(dir.path()), factory.clone());

        let request = multipart_request("/process", &[Part::File("scan.png", b"img")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("model crashed"));
        assert!(body["processing_time"].is_number());

        let snap = state.stats.snapshot();
        assert_eq!(snap.counters.total_requests, 1);
        assert_eq!(snap.counters.failed_requests, 1);

        // Temp file is cleaned up on the failure path too.
        let (path, _) = &factory.seen_paths()[0];
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_engine_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.engine.recognize_timeout_secs = 0;
        let factory = Arc::new(FakeFactory::with_engine(|lang| {
            FakeEngine::new(lang, json!([])).with_delay(Duration::from_secs(5))
        }));
        let state = state_with(config, factory);

        let request = multipart_request("/process", &[Part::File("scan.png", b"img")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(state.stats.snapshot().counters.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_save_result_writes_audit_record() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(test_config(dir.path()), Arc::new(FakeFactory::new(payload())));

        let request = multipart_request(
            "/process",
            &[Part::File("scan.png", b"img"), Part::Text("save_result", "true")],
        );
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        let saved_to = body["saved_to"].as_str().unwrap();
        let record: Value =
            serde_json::from_str(&std::fs::read_to_string(saved_to).unwrap()).unwrap();
        assert_eq!(record["response"]["total_blocks"], 2);
        assert_eq!(record["upload_bytes"], 3);
    }

    #[tokio::test]
    async fn test_analyze_listing() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(test_config(dir.path()), Arc::new(FakeFactory::new(payload())));

        let request = multipart_request("/analyze", &[Part::File("scan.png", b"img")]);
        let (status, body) = send(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        let listing = body["analysis"].as_str().unwrap();
        assert!(listing.contains(" 1. [H] \"Factura 001\" (0.970)"));
        assert!(listing.contains(" 2. [V] \"TOTAL\" (0.800)"));
        assert_eq!(body["raw_data"]["total_blocks"], 2);
    }

    #[tokio::test]
    async fn test_health_reports_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(test_config(dir.path()), Arc::new(FakeFactory::new(payload())));

        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ocr_ready"], false);
        assert_eq!(body["status"], "initializing");

        assert!(state.registry.initialize().await);
        let (_, body) = get_json(&state, "/health").await;
        assert_eq!(body["ocr_ready"], true);
        assert_eq!(body["models_loaded"], true);
        assert_eq!(body["supported_languages"], json!(["en", "es"]));
        assert_eq!(body["loaded_languages"], json!(["en", "es"]));
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(test_config(dir.path()), Arc::new(FakeFactory::new(payload())));

        let request = multipart_request("/process", &[Part::File("scan.png", b"img")]);
        send(&state, request).await;
        let request = multipart_request("/process", &[Part::File("bad.txt", b"img")]);
        send(&state, request).await;

        let (status, body) = get_json(&state, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_stats"]["total_requests"], 2);
        assert_eq!(body["server_stats"]["successful_requests"], 1);
        assert_eq!(body["server_stats"]["failed_requests"], 0);
        assert_eq!(body["server_stats"]["success_rate"], 50.0);
        assert_eq!(body["server_stats"]["models_loaded"], true);
        assert_eq!(body["engine_config"]["det_db_thresh"], 0.1);
        assert_eq!(body["system_info"]["default_language"], "es");
        assert_eq!(
            body["system_info"]["supported_formats"].as_array().unwrap().len(),
            7
        );
    }

    #[test]
    fn test_client_key() {
        let mut headers = HeaderMap::new();
        let peer = || Some(ConnectInfo(SocketAddr::from(([192, 168, 1, 5], 4000))));
        assert_eq!(client_key(&headers, peer(), true), "192.168.1.5");
        assert_eq!(client_key(&headers, None, false), "unknown");

        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.1".parse().unwrap());
        assert_eq!(client_key(&headers, peer(), true), "198.51.100.1");
        assert_eq!(client_key(&headers, peer(), false), "192.168.1.5");
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" True "));
        assert!(!parse_flag("1"));
        assert!(!parse_flag("false"));
    }
}
