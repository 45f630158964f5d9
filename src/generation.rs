//! Text-to-image background generation
//!
//! Two upstream flavors are supported: Stability AI SD3 answers the request
//! with image bytes directly, PiAPI accepts a task and has to be polled until
//! the task reports completion.

use crate::config::{PiApiConfig, StabilityConfig};
use crate::error::{FuseError, Result};
use crate::matting::STABILITY_SERVICE;
use crate::retry::ensure_success;
use crate::types::AspectRatio;
use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const PIAPI_SERVICE: &str = "PiAPI";

/// What to generate
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Final prompt, already enhanced
    pub prompt: String,
    /// Target width in pixels, a multiple of the configured dimension step
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Ratio the client asked for, if any
    pub aspect_ratio: Option<AspectRatio>,
}

/// Produces a background image from a prompt
#[async_trait]
pub trait BackgroundGenerator: Send + Sync {
    /// Generate one image and return its encoded bytes
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Stability AI SD3, synchronous
#[derive(Debug, Clone)]
pub struct StabilityGenerator {
    client: Client,
    api_key: String,
    base_url: String,
}

impl StabilityGenerator {
    pub fn new(client: Client, config: &StabilityConfig) -> Self {
        Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Ratio sent to SD3, which only accepts a fixed list
    pub fn aspect_ratio_for(request: &GenerationRequest) -> AspectRatio {
        match request.aspect_ratio {
            Some(ratio) if ratio.is_stability_supported() => ratio,
            _ => AspectRatio::nearest_stability(request.width, request.height),
        }
    }
}

#[async_trait]
impl BackgroundGenerator for StabilityGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>> {
        let aspect_ratio = Self::aspect_ratio_for(request);
        debug!(aspect_ratio = %aspect_ratio, "Requesting SD3 background");

        let form = multipart::Form::new()
            .text("prompt", request.prompt.clone())
            .text("output_format", "png")
            .text("aspect_ratio", aspect_ratio.to_string());

        let response = self
            .client
            .post(format!("{}/v2beta/stable-image/generate/sd3", self.base_url))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "image/*")
            .multipart(form)
            .send()
            .await
            .map_err(|e| FuseError::network_error("Stability AI generation request failed", e))?;

        let response = ensure_success(STABILITY_SERVICE, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FuseError::network_error("Failed to read generated image", e))?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &'static str {
        "stability"
    }
}

/// PiAPI task API, submit then poll
#[derive(Debug, Clone)]
pub struct PiApiGenerator {
    client: Client,
    config: PiApiConfig,
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    #[serde(default)]
    data: Option<TaskData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    task_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Option<TaskOutput>,
    #[serde(default)]
    error: Option<TaskError>,
}

#[derive(Debug, Deserialize)]
struct TaskOutput {
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    image_urls: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TaskError {
    #[serde(default)]
    message: String,
}

/// Lifecycle of a PiAPI task as far as the poller cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed(String),
    Failed(String),
}

impl TaskData {
    fn state(&self) -> Result<TaskState> {
        match self.status.to_ascii_lowercase().as_str() {
            "completed" => {
                let url = self
                    .output
                    .as_ref()
                    .and_then(|o| {
                        o.image_url
                            .clone()
                            .filter(|u| !u.is_empty())
                            .or_else(|| o.image_urls.as_ref().and_then(|v| v.first().cloned()))
                    })
                    .ok_or_else(|| {
                        FuseError::upstream(
                            PIAPI_SERVICE,
                            200,
                            format!("task {} completed without an image URL", self.task_id),
                        )
                    })?;
                Ok(TaskState::Completed(url))
            },
            "failed" => {
                let message = self
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "task failed without a message".to_string());
                Ok(TaskState::Failed(message))
            },
            _ => Ok(TaskState::Running),
        }
    }
}

impl PiApiGenerator {
    pub fn new(client: Client, config: PiApiConfig) -> Self {
        Self { client, config }
    }

    fn task_url(&self) -> String {
        format!("{}/api/v1/task", self.config.base_url.trim_end_matches('/'))
    }

    async fn read_task(response: reqwest::Response) -> Result<TaskData> {
        let response = ensure_success(PIAPI_SERVICE, response).await?;
        let envelope: TaskEnvelope = response
            .json()
            .await
            .map_err(|e| FuseError::network_error("Failed to read PiAPI response", e))?;
        envelope.data.ok_or_else(|| {
            FuseError::upstream(
                PIAPI_SERVICE,
                200,
                envelope
                    .message
                    .unwrap_or_else(|| "response carried no task data".to_string()),
            )
        })
    }

    /// Submit a txt2img task and return its id
    pub async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "task_type": "txt2img",
            "input": {
                "prompt": request.prompt,
                "width": request.width,
                "height": request.height,
            }
        });

        let response = self
            .client
            .post(self.task_url())
            .header("x-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FuseError::network_error("PiAPI task submission failed", e))?;

        let task = Self::read_task(response).await?;
        info!(task_id = %task.task_id, "PiAPI task submitted");
        Ok(task.task_id)
    }

    /// Poll a task until it completes, fails or the poll budget runs out
    ///
    /// Returns the result image URL.
    pub async fn wait_for(&self, task_id: &str) -> Result<String> {
        let url = format!("{}/{}", self.task_url(), task_id);
        let interval = self.config.poll_interval();

        for poll in 1..=self.config.max_polls {
            tokio::time::sleep(interval).await;

            let response = self
                .client
                .get(&url)
                .header("x-api-key", &self.config.api_key)
                .send()
                .await
                .map_err(|e| FuseError::network_error("PiAPI status request failed", e))?;
            let task = Self::read_task(response).await?;

            match task.state()? {
                TaskState::Completed(image_url) => {
                    info!(task_id = %task_id, poll, "PiAPI task completed");
                    return Ok(image_url);
                },
                TaskState::Failed(message) => {
                    warn!(task_id = %task_id, poll, error = %message, "PiAPI task failed");
                    return Err(FuseError::upstream(PIAPI_SERVICE, 200, message));
                },
                TaskState::Running => {
                    debug!(task_id = %task_id, poll, status = %task.status, "PiAPI task still running");
                },
            }
        }

        let waited = interval.saturating_mul(self.config.max_polls);
        Err(FuseError::timeout(format!(
            "PiAPI task {} did not complete after {} polls ({})",
            task_id,
            self.config.max_polls,
            format_duration(waited)
        )))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FuseError::network_error(format!("Failed to download {}", url), e))?;
        let response = ensure_success(PIAPI_SERVICE, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FuseError::network_error(format!("Failed to read {}", url), e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl BackgroundGenerator for PiApiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>> {
        let task_id = self.submit(request).await?;
        let image_url = self.wait_for(&task_id).await?;
        self.download(&image_url).await
    }

    fn name(&self) -> &'static str {
        "piapi"
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, duration.subsec_millis() / 100)
    }
}
