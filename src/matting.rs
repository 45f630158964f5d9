//! Background removal through a third-party API

use crate::config::StabilityConfig;
use crate::error::{FuseError, Result};
use crate::retry::{ensure_success, send_with_retry, RetryPolicy};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{multipart, Client};
use serde::Deserialize;

pub(crate) const STABILITY_SERVICE: &str = "Stability AI";

/// Produces a foreground cutout with alpha transparency
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    /// Remove the background from an encoded image, returning encoded PNG bytes
    async fn remove_background(&self, image: Vec<u8>, file_name: &str) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Stability AI `remove-background` endpoint
#[derive(Debug, Clone)]
pub struct StabilityRemover {
    client: Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct RemoveBackgroundResponse {
    image: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl StabilityRemover {
    pub fn new(client: Client, config: &StabilityConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v2beta/stable-image/edit/remove-background", self.base_url)
    }
}

#[async_trait]
impl BackgroundRemover for StabilityRemover {
    async fn remove_background(&self, image: Vec<u8>, file_name: &str) -> Result<Vec<u8>> {
        let url = self.endpoint();
        let file_name = file_name.to_string();

        let response = send_with_retry(STABILITY_SERVICE, &self.retry, || {
            let part = multipart::Part::bytes(image.clone()).file_name(file_name.clone());
            let form = multipart::Form::new()
                .part("image", part)
                .text("output_format", "png");
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .header(reqwest::header::ACCEPT, "application/json")
                .multipart(form)
        })
        .await?;

        let response = ensure_success(STABILITY_SERVICE, response).await?;
        let payload: RemoveBackgroundResponse = response.json().await.map_err(|e| {
            FuseError::network_error("Failed to read background removal response", e)
        })?;

        if let Some(reason) = payload.finish_reason.as_deref() {
            if reason != "SUCCESS" {
                tracing::warn!(finish_reason = %reason, "Background removal finished abnormally");
            }
        }

        general_purpose::STANDARD.decode(payload.image.as_bytes()).map_err(|e| {
            FuseError::processing_stage_error("matting", &format!("invalid base64 image: {}", e), None)
        })
    }

    fn name(&self) -> &'static str {
        "stability"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn remover(base_url: String) -> StabilityRemover {
        StabilityRemover::new(
            Client::new(),
            &StabilityConfig {
                api_key: "sk-test".to_string(),
                base_url,
            },
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_decodes_base64_image() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "image": general_purpose::STANDARD.encode(b"cutout-bytes"),
            "finish_reason": "SUCCESS",
            "seed": 42
        });
        let mock = server
            .mock("POST", "/v2beta/stable-image/edit/remove-background")
            .match_header("authorization", "Bearer sk-test")
            .match_header("accept", "application/json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let bytes = remover(server.url())
            .remove_background(b"input".to_vec(), "cat.jpg")
            .await
            .unwrap();
        assert_eq!(bytes, b"cutout-bytes");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_surfaces_upstream_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2beta/stable-image/edit/remove-background")
            .with_status(400)
            .with_body(r#"{"errors":["image: dimensions too small"]}"#)
            .expect(1)
            .create_async()
            .await;

        let err = remover(server.url())
            .remove_background(b"input".to_vec(), "tiny.png")
            .await
            .unwrap_err();
        match &err {
            FuseError::Upstream { status, body, .. } => {
                assert_eq!(*status, 400);
                assert!(body.contains("dimensions too small"));
            },
            other => panic!("unexpected error: {other}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_base64_is_processing_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2beta/stable-image/edit/remove-background")
            .with_status(200)
            .with_body(r#"{"image":"@@not-base64@@"}"#)
            .create_async()
            .await;

        let err = remover(server.url())
            .remove_background(b"input".to_vec(), "x.png")
            .await
            .unwrap_err();
        assert!(matches!(err, FuseError::Processing(_)));
    }
}
