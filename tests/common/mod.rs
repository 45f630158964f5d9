//! Shared test infrastructure: an in-process stand-in for every upstream API
//!
//! One axum server plays Stability AI, PiAPI and Supabase Storage, and also
//! hosts arbitrary image files. Behaviour is chosen per test with `StubConfig`
//! and observed through `Counters`.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use bgfuse::{
    config::{GenerationBackend, PiApiConfig},
    RetryPolicy, ServiceConfig, ServiceConfigBuilder,
};
use http_body_util::BodyExt;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

pub const BUCKET: &str = "fusion-images";
pub const MULTIPART_BOUNDARY: &str = "bgfuse-test-boundary";

/// How the PiAPI task endpoint behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiApiMode {
    /// Report `pending` for this many polls, then `completed`
    CompleteAfter(usize),
    /// Report `failed` on the first poll
    Fail,
    /// Stay `processing` forever
    Never,
}

#[derive(Debug, Clone, Copy)]
pub struct StubConfig {
    /// Number of 500 responses before background removal succeeds
    pub removal_server_errors: usize,
    /// Answer background removal with a permanent 400
    pub removal_client_error: bool,
    pub piapi: PiApiMode,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            removal_server_errors: 0,
            removal_client_error: false,
            piapi: PiApiMode::CompleteAfter(0),
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub removal_calls: AtomicUsize,
    pub sd3_calls: AtomicUsize,
    pub piapi_submits: AtomicUsize,
    pub piapi_polls: AtomicUsize,
    pub uploads: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct StubState {
    config: StubConfig,
    counters: Arc<Counters>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    last_prompt: Arc<Mutex<Option<String>>>,
    base_url: String,
}

/// A running stub server
pub struct Stub {
    pub base_url: String,
    pub counters: Arc<Counters>,
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    last_prompt: Arc<Mutex<Option<String>>>,
}

impl Stub {
    pub async fn spawn(config: StubConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));

        let objects = Arc::new(Mutex::new(HashMap::new()));
        objects.lock().unwrap().insert(
            "files/generated.png".to_string(),
            png_bytes(320, 240, [30, 60, 200, 255]),
        );

        let state = StubState {
            config,
            counters: Arc::new(Counters::default()),
            objects: Arc::clone(&objects),
            last_prompt: Arc::new(Mutex::new(None)),
            base_url: base_url.clone(),
        };
        let stub = Self {
            base_url,
            counters: Arc::clone(&state.counters),
            objects,
            last_prompt: Arc::clone(&state.last_prompt),
        };

        let app = Router::new()
            .route("/v2beta/stable-image/edit/remove-background", post(remove_background))
            .route("/v2beta/stable-image/generate/sd3", post(generate_sd3))
            .route("/api/v1/task", post(piapi_submit))
            .route("/api/v1/task/:id", get(piapi_status))
            .route("/storage/v1/object/*path", post(storage_upload).get(storage_download))
            .route("/files/*name", get(serve_file))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });
        stub
    }

    /// Host `bytes` at `/files/{name}` and return the URL
    pub fn host_file(&self, name: &str, bytes: Vec<u8>) -> String {
        self.objects
            .lock()
            .unwrap()
            .insert(format!("files/{}", name), bytes);
        format!("{}/files/{}", self.base_url, name)
    }

    /// Bytes of an object uploaded to storage, looked up by its public URL
    pub fn stored(&self, public_url: &str) -> Option<Vec<u8>> {
        let prefix = format!("{}/storage/v1/object/public/", self.base_url);
        let key = public_url.strip_prefix(&prefix)?;
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn stored_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| !k.starts_with("files/"))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }

    /// Service configuration pointing every upstream at this stub
    pub fn service_config(&self, generator: GenerationBackend) -> ServiceConfig {
        self.config_builder(generator)
            .build()
            .expect("stub config is valid")
    }

    /// Builder pre-filled for this stub, for tests that tweak limits
    pub fn config_builder(&self, generator: GenerationBackend) -> ServiceConfigBuilder {
        ServiceConfig::builder()
            .storage(&self.base_url, "service-role-key", BUCKET)
            .stability_api_key("sk-stub")
            .stability_base_url(&self.base_url)
            .piapi(PiApiConfig {
                api_key: "piapi-stub".to_string(),
                base_url: self.base_url.clone(),
                poll_interval_ms: 1,
                max_polls: 5,
                ..PiApiConfig::default()
            })
            .generator(generator)
            .retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }
}

async fn remove_background(State(state): State<StubState>, mut multipart: Multipart) -> Response {
    // drain the upload first so error replies never race the request body
    let mut image = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("image") {
            image = field.bytes().await.ok();
        }
    }

    let call = state.counters.removal_calls.fetch_add(1, Ordering::SeqCst);
    if state.config.removal_client_error {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"name": "bad_request", "errors": ["image: unsupported dimensions"]})),
        )
            .into_response();
    }
    if call < state.config.removal_server_errors {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream hiccup").into_response();
    }
    let Some(image) = image else {
        return (StatusCode::BAD_REQUEST, "missing image field").into_response();
    };

    // the "cutout" is the upload with a transparent left half
    let mut rgba = image::load_from_memory(&image).expect("stub got an image").to_rgba8();
    let half = rgba.width() / 2;
    for (x, _, pixel) in rgba.enumerate_pixels_mut() {
        if x < half {
            pixel.0[3] = 0;
        }
    }
    let png = encode_png(&DynamicImage::ImageRgba8(rgba));
    Json(json!({
        "image": general_purpose::STANDARD.encode(png),
        "finish_reason": "SUCCESS",
        "seed": 1
    }))
    .into_response()
}

async fn generate_sd3(State(state): State<StubState>, mut multipart: Multipart) -> Response {
    state.counters.sd3_calls.fetch_add(1, Ordering::SeqCst);
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("prompt") {
            let prompt = field.text().await.unwrap_or_default();
            *state.last_prompt.lock().unwrap() = Some(prompt);
        }
    }
    (
        [(header::CONTENT_TYPE, "image/png")],
        png_bytes(256, 192, [20, 120, 40, 255]),
    )
        .into_response()
}

async fn piapi_submit(State(state): State<StubState>, Json(body): Json<Value>) -> Json<Value> {
    state.counters.piapi_submits.fetch_add(1, Ordering::SeqCst);
    *state.last_prompt.lock().unwrap() = body["input"]["prompt"].as_str().map(str::to_string);
    Json(json!({
        "code": 200,
        "data": {"task_id": "task-42", "status": "pending"},
        "message": "success"
    }))
}

async fn piapi_status(State(state): State<StubState>, Path(id): Path<String>) -> Json<Value> {
    let poll = state.counters.piapi_polls.fetch_add(1, Ordering::SeqCst);
    let data = match state.config.piapi {
        PiApiMode::CompleteAfter(pending) if poll >= pending => json!({
            "task_id": id,
            "status": "completed",
            "output": {"image_url": format!("{}/files/generated.png", state.base_url)}
        }),
        PiApiMode::CompleteAfter(_) => json!({"task_id": id, "status": "pending"}),
        PiApiMode::Fail => json!({
            "task_id": id,
            "status": "failed",
            "error": {"code": 10000, "message": "generation rejected by safety filter"}
        }),
        PiApiMode::Never => json!({"task_id": id, "status": "processing"}),
    };
    Json(json!({"code": 200, "data": data, "message": "success"}))
}

async fn storage_upload(
    State(state): State<StubState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    state.counters.uploads.fetch_add(1, Ordering::SeqCst);
    let path = path.trim_start_matches('/').to_string();
    let mut objects = state.objects.lock().unwrap();
    if objects.contains_key(&path) {
        return (StatusCode::CONFLICT, Json(json!({"error": "Duplicate"}))).into_response();
    }
    objects.insert(path.clone(), body.to_vec());
    Json(json!({"Key": path})).into_response()
}

async fn storage_download(State(state): State<StubState>, Path(path): Path<String>) -> Response {
    let path = path.trim_start_matches('/');
    let Some(key) = path.strip_prefix("public/") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.objects.lock().unwrap().get(key) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_file(State(state): State<StubState>, Path(name): Path<String>) -> Response {
    let key = format!("files/{}", name.trim_start_matches('/'));
    match state.objects.lock().unwrap().get(&key) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .expect("encode png");
    buffer
}

pub fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width,
        height,
        Rgba(color),
    )))
}

/// Opaque square subject in the middle of a transparent canvas
pub fn cutout_png(width: u32, height: u32) -> Vec<u8> {
    let mut image = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    let (x0, y0) = (width / 4, height / 4);
    for y in y0..(height - y0) {
        for x in x0..(width - x0) {
            image.put_pixel(x, y, Rgba([220, 180, 140, 255]));
        }
    }
    encode_png(&DynamicImage::ImageRgba8(image))
}

pub fn multipart_upload(file_name: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: {c}\r\n\r\n",
            b = MULTIPART_BOUNDARY,
            f = file_name,
            c = content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/matting")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
        )
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .expect("request")
}

pub fn ai_fuse_request(body: Value) -> Request<Body> {
    let body = body.to_string();
    Request::builder()
        .method("POST")
        .uri("/api/ai-fuse")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .expect("request")
}

/// Drive one request through the router and decode the JSON reply
pub async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("router is infallible");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}
