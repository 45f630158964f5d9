//! Retry and job-polling behaviour against stubbed upstream services

mod common;

use axum::http::StatusCode;
use bgfuse::{
    config::GenerationBackend,
    retry::{send_with_retry, RetryPolicy},
    server::router,
    BackgroundGenerator, FuseError, FusionService, GenerationRequest, PiApiGenerator,
};
use common::{ai_fuse_request, call, cutout_png, Counters, PiApiMode, Stub, StubConfig};
use serde_json::json;
use std::time::Duration;

fn piapi_for(stub: &Stub) -> PiApiGenerator {
    let config = stub.service_config(GenerationBackend::PiApi);
    PiApiGenerator::new(reqwest::Client::new(), config.piapi)
}

fn request() -> GenerationRequest {
    GenerationRequest {
        prompt: "snowy mountain pass".to_string(),
        width: 768,
        height: 1024,
        aspect_ratio: None,
    }
}

#[tokio::test]
async fn piapi_polls_until_completed() {
    let stub = Stub::spawn(StubConfig {
        piapi: PiApiMode::CompleteAfter(2),
        ..StubConfig::default()
    })
    .await;

    let bytes = piapi_for(&stub).generate(&request()).await.unwrap();

    let image = image::load_from_memory(&bytes).unwrap();
    assert_eq!((image.width(), image.height()), (320, 240));
    assert_eq!(Counters::get(&stub.counters.piapi_submits), 1);
    assert_eq!(Counters::get(&stub.counters.piapi_polls), 3);
    assert_eq!(stub.last_prompt().as_deref(), Some("snowy mountain pass"));
}

#[tokio::test]
async fn piapi_failed_task_is_upstream_error() {
    let stub = Stub::spawn(StubConfig {
        piapi: PiApiMode::Fail,
        ..StubConfig::default()
    })
    .await;

    let err = piapi_for(&stub).generate(&request()).await.unwrap_err();

    match err {
        FuseError::Upstream { service, body, .. } => {
            assert_eq!(service, "PiAPI");
            assert!(body.contains("safety filter"));
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(Counters::get(&stub.counters.piapi_polls), 1);
}

#[tokio::test]
async fn piapi_exhausting_polls_is_timeout() {
    let stub = Stub::spawn(StubConfig {
        piapi: PiApiMode::Never,
        ..StubConfig::default()
    })
    .await;

    let err = piapi_for(&stub).generate(&request()).await.unwrap_err();

    assert!(matches!(err, FuseError::Timeout(_)), "got {err}");
    assert!(err.to_string().contains("task-42"));
    assert_eq!(Counters::get(&stub.counters.piapi_polls), 5);
}

#[tokio::test]
async fn generate_route_maps_polling_outcomes_to_status_codes() {
    for (mode, expected) in [
        (PiApiMode::CompleteAfter(1), StatusCode::OK),
        (PiApiMode::Fail, StatusCode::BAD_GATEWAY),
        (PiApiMode::Never, StatusCode::GATEWAY_TIMEOUT),
    ] {
        let stub = Stub::spawn(StubConfig {
            piapi: mode,
            ..StubConfig::default()
        })
        .await;
        let matting_url = stub.host_file("cutout.png", cutout_png(300, 300));
        let service = FusionService::from_config(stub.service_config(GenerationBackend::PiApi))
            .unwrap();

        let (status, body) = call(
            router(service),
            ai_fuse_request(json!({
                "action": "generate-background",
                "prompt": "city rooftop",
                "mattingUrl": matting_url,
                "aspectRatio": "3:2"
            })),
        )
        .await;

        assert_eq!(status, expected, "mode {mode:?}, body {body}");
        if expected == StatusCode::OK {
            // stored backgrounds are always PNG
            let url = body["backgrounds"][0].as_str().unwrap();
            let stored = stub.stored(url).unwrap();
            assert_eq!(image::guess_format(&stored).unwrap(), image::ImageFormat::Png);
        } else {
            assert!(body["error"].is_string());
        }
    }
}

#[tokio::test]
async fn retry_recovers_from_transient_server_error() {
    let stub = Stub::spawn(StubConfig {
        removal_server_errors: 2,
        ..StubConfig::default()
    })
    .await;
    let client = reqwest::Client::new();
    let url = format!("{}/v2beta/stable-image/edit/remove-background", stub.base_url);
    let image = common::png_bytes(8, 8, [0, 0, 0, 255]);

    let response = send_with_retry(
        "Stability AI",
        &RetryPolicy::new(3, Duration::from_millis(1)),
        || {
            let part = reqwest::multipart::Part::bytes(image.clone()).file_name("x.png");
            client
                .post(&url)
                .multipart(reqwest::multipart::Form::new().part("image", part))
        },
    )
    .await
    .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(Counters::get(&stub.counters.removal_calls), 3);
}
