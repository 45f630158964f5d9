//! Request orchestration for matting, background generation and fusion
//!
//! `FusionService` owns the upstream clients behind trait objects and runs
//! the three user-facing operations. Network calls stay on the async runtime,
//! pixel work is moved to the blocking pool.

use crate::compositing::{self, FusionParams};
use crate::config::{GenerationBackend, ServiceConfig};
use crate::error::{FuseError, Result};
use crate::generation::{BackgroundGenerator, GenerationRequest, PiApiGenerator, StabilityGenerator};
use crate::matting::{BackgroundRemover, StabilityRemover};
use crate::prompt::{enhance_prompt, OpenRouterExpander, PromptExpander};
use crate::storage::{object_key, sanitize_file_name, ObjectStore, SupabaseStorage};
use crate::tracing_config::{events, spans};
use crate::types::{AspectRatio, ColorMatch};
use image::GenericImageView;
use instant::Instant;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// URLs produced by a matting run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MattingOutcome {
    pub matting_url: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateBackgroundRequest {
    pub prompt: String,
    pub matting_url: String,
    pub aspect_ratio: Option<AspectRatio>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuseImageRequest {
    pub matting_url: String,
    pub background_url: String,
    pub aspect_ratio: Option<AspectRatio>,
    /// Falls back to the configured default
    pub color_match: Option<ColorMatch>,
    /// Soft-light strength, falls back to the configured default
    pub strength: Option<f32>,
}

/// Orchestrates storage, background removal, generation and compositing
#[derive(Clone)]
pub struct FusionService {
    config: Arc<ServiceConfig>,
    client: Client,
    store: Arc<dyn ObjectStore>,
    remover: Arc<dyn BackgroundRemover>,
    generator: Arc<dyn BackgroundGenerator>,
    expander: Option<Arc<dyn PromptExpander>>,
}

impl std::fmt::Debug for FusionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionService")
            .field("store", &self.store.name())
            .field("remover", &self.remover.name())
            .field("generator", &self.generator.name())
            .field("expander", &self.expander.as_ref().map(|e| e.name()))
            .finish_non_exhaustive()
    }
}

impl FusionService {
    /// Assemble a service from explicit components
    pub fn new(
        config: ServiceConfig,
        client: Client,
        store: Arc<dyn ObjectStore>,
        remover: Arc<dyn BackgroundRemover>,
        generator: Arc<dyn BackgroundGenerator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            store,
            remover,
            generator,
            expander: None,
        }
    }

    #[must_use]
    pub fn with_expander(mut self, expander: Arc<dyn PromptExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    /// Build the production wiring described by a validated configuration
    ///
    /// # Errors
    /// - Configuration validation failures
    /// - HTTP client construction failures
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("bgfuse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FuseError::config(format!("Failed to build HTTP client: {}", e)))?;

        let store: Arc<dyn ObjectStore> =
            Arc::new(SupabaseStorage::new(client.clone(), &config.storage));
        let remover: Arc<dyn BackgroundRemover> = Arc::new(StabilityRemover::new(
            client.clone(),
            &config.stability,
            config.retry.clone(),
        ));
        let generator: Arc<dyn BackgroundGenerator> = match config.generator {
            GenerationBackend::Stability => {
                Arc::new(StabilityGenerator::new(client.clone(), &config.stability))
            },
            GenerationBackend::PiApi => {
                Arc::new(PiApiGenerator::new(client.clone(), config.piapi.clone()))
            },
        };
        let expander = config.openrouter.clone().map(|openrouter| {
            Arc::new(OpenRouterExpander::new(client.clone(), openrouter)) as Arc<dyn PromptExpander>
        });

        info!(
            store = store.name(),
            generator = generator.name(),
            prompt_expansion = expander.is_some(),
            "Fusion service configured"
        );

        let mut service = Self::new(config, client, store, remover, generator);
        service.expander = expander;
        Ok(service)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Name of the active background generator
    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    /// Remove the background of an uploaded image
    ///
    /// Stores the original upload and a PNG cutout with the original's
    /// dimensions. The removal API only sees a copy downscaled to the
    /// configured maximum side.
    ///
    /// # Errors
    /// - `InvalidRequest` for empty or undecodable uploads
    /// - `Upstream`/`Network` when the removal API fails after retries
    /// - `Storage` when an upload is rejected
    pub async fn matting(
        &self,
        file_name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<MattingOutcome> {
        if bytes.is_empty() {
            return Err(FuseError::invalid_request("Uploaded file is empty"));
        }
        let start = Instant::now();
        let safe_name = sanitize_file_name(file_name);
        let api_max_side = self.config.limits.api_max_side;

        let upload = bytes.clone();
        let (original_size, api_input) = blocking("prepare upload", move || {
            let image = compositing::decode_image(&upload).map_err(|e| {
                FuseError::invalid_request(format!("Uploaded file is not a supported image: {}", e))
            })?;
            let original_size = image.dimensions();
            let api_image = compositing::fit_within(&image, api_max_side);
            let forwardable = matches!(
                compositing::sniff_mime(&upload),
                "image/png" | "image/jpeg" | "image/webp"
            );
            let api_input = if forwardable && api_image.dimensions() == original_size {
                upload
            } else {
                compositing::encode_png(&api_image)?
            };
            Ok((original_size, api_input))
        })
        .await?;
        debug!(
            width = original_size.0,
            height = original_size.1,
            api_bytes = api_input.len(),
            "Upload decoded"
        );

        let content_type = match content_type {
            Some(ct) if ct.starts_with("image/") => ct.to_string(),
            _ => compositing::sniff_mime(&bytes).to_string(),
        };
        let original_key = object_key(&safe_name);
        let remover = Arc::clone(&self.remover);

        let (original_url, cutout) = tokio::try_join!(
            self.store_bytes("original", &original_key, bytes, &content_type),
            remover
                .remove_background(api_input, &safe_name)
                .instrument(spans::upstream(self.remover.name(), "remove-background")),
        )?;

        let matted = blocking("restore cutout", move || {
            let _span = spans::compositing("restore cutout", original_size).entered();
            let cutout = compositing::decode_image(&cutout)?;
            let (width, height) = original_size;
            let cutout = if cutout.dimensions() == original_size {
                cutout.to_rgba8()
            } else {
                cutout
                    .resize_exact(width, height, image::imageops::FilterType::Lanczos3)
                    .to_rgba8()
            };
            let canvas = compositing::center_on_canvas(&cutout, width, height);
            compositing::encode_png(&image::DynamicImage::ImageRgba8(canvas))
        })
        .await?;

        let matting_url = self
            .store_bytes("matting", &object_key("matted.png"), matted, "image/png")
            .await?;

        events::performance_metric("matting", elapsed_ms(start));
        Ok(MattingOutcome {
            matting_url,
            original_url,
        })
    }

    /// Generate a background sized for a stored cutout
    ///
    /// # Errors
    /// - `InvalidRequest` when prompt or matting URL is missing
    /// - `Network` when the cutout cannot be downloaded
    /// - `Upstream`/`Timeout` from the generator
    pub async fn generate_background(&self, request: GenerateBackgroundRequest) -> Result<Vec<String>> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() || request.matting_url.trim().is_empty() {
            return Err(FuseError::invalid_request("Missing prompt or mattingUrl"));
        }
        let start = Instant::now();

        let cutout = self.fetch_image(&request.matting_url).await?;
        let (width, height) = blocking("read cutout size", move || {
            Ok(compositing::decode_image(&cutout)?.dimensions())
        })
        .await?;

        let limits = &self.config.limits;
        let (gen_width, gen_height) = compositing::generation_size(
            width,
            height,
            request.aspect_ratio,
            limits.generation_max_side,
            limits.dimension_multiple,
        );
        debug!(
            cutout_width = width,
            cutout_height = height,
            gen_width,
            gen_height,
            "Generation size chosen"
        );

        let generation = GenerationRequest {
            prompt: self.prepare_prompt(prompt).await,
            width: gen_width,
            height: gen_height,
            aspect_ratio: request.aspect_ratio,
        };
        let generated = self
            .generator
            .generate(&generation)
            .instrument(spans::upstream(self.generator.name(), "generate"))
            .await?;

        // generators may answer with JPEG or WebP; everything stored is PNG
        let png = blocking("normalize background", move || {
            let image = compositing::decode_image(&generated)?;
            if image::guess_format(&generated).ok() == Some(image::ImageFormat::Png) {
                Ok(generated)
            } else {
                compositing::encode_png(&image)
            }
        })
        .await?;

        let url = self
            .store_bytes("background", &object_key("background.png"), png, "image/png")
            .await?;

        events::performance_metric("generate-background", elapsed_ms(start));
        Ok(vec![url])
    }

    /// Composite a stored cutout over a stored background
    ///
    /// # Errors
    /// - `InvalidRequest` for missing URLs or an out-of-range strength
    /// - `Network` when either image cannot be downloaded
    /// - `Processing`/`Image` when decoding or compositing fails
    pub async fn fuse_image(&self, request: FuseImageRequest) -> Result<String> {
        if request.matting_url.trim().is_empty() || request.background_url.trim().is_empty() {
            return Err(FuseError::invalid_request("Missing mattingUrl or backgroundUrl"));
        }
        let strength = request
            .strength
            .unwrap_or(self.config.fusion.soft_light_strength);
        if !(0.0..=1.0).contains(&strength) {
            return Err(FuseError::invalid_request(format!(
                "strength must be between 0 and 1, got {}",
                strength
            )));
        }
        let params = FusionParams {
            aspect_ratio: request.aspect_ratio,
            color_match: request.color_match.unwrap_or(self.config.fusion.color_match),
            strength,
            max_side: self.config.limits.fusion_max_side,
        };
        let start = Instant::now();

        let (foreground, background) = tokio::try_join!(
            self.fetch_image(&request.matting_url),
            self.fetch_image(&request.background_url),
        )?;

        let fused = blocking("fuse", move || {
            let foreground = compositing::decode_image(&foreground)?;
            let background = compositing::decode_image(&background)?;
            let _span = spans::compositing("fuse", foreground.dimensions()).entered();
            let fused = compositing::fuse_layers(&foreground, &background, params)?;
            debug!(dominant = ?fused.dominant.0, mode = %params.color_match, "Layers fused");
            compositing::encode_png(&image::DynamicImage::ImageRgba8(fused.image))
        })
        .await?;

        let url = self
            .store_bytes("fused", &object_key("fused.png"), fused, "image/png")
            .await?;

        events::performance_metric("fuse-image", elapsed_ms(start));
        Ok(url)
    }

    /// Download an image by URL
    ///
    /// # Errors
    /// - `Network` for transport failures and non-2xx responses, naming the URL
    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FuseError::network_error(format!("Failed to fetch {}", url), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FuseError::Network(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FuseError::network_error(format!("Failed to read {}", url), e))?;
        debug!(url = %url, bytes = bytes.len(), "Image fetched");
        Ok(bytes.to_vec())
    }

    /// Expanded prompt if an expander is configured and succeeds, else the
    /// user prompt with the quality suffix
    async fn prepare_prompt(&self, prompt: &str) -> String {
        if let Some(expander) = &self.expander {
            match expander
                .expand(prompt)
                .instrument(spans::upstream(expander.name(), "expand-prompt"))
                .await
            {
                Ok(expanded) if !expanded.trim().is_empty() => {
                    debug!(original = %prompt, expanded = %expanded, "Prompt expanded");
                    return expanded;
                },
                Ok(_) => warn!("Prompt expander returned empty text, using suffix enhancement"),
                Err(e) => events::warning_with_recommendation(
                    &format!("Prompt expansion failed: {}", e),
                    "falling back to suffix enhancement",
                ),
            }
        }
        enhance_prompt(prompt, &self.config.prompt_suffix)
    }

    async fn store_bytes(
        &self,
        kind: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let size = bytes.len();
        let url = self
            .store
            .put(key, bytes, content_type)
            .instrument(spans::storage_upload(self.store.name(), key))
            .await?;
        events::artifact_stored(kind, &url, size);
        Ok(url)
    }
}

/// Run CPU-bound work on the blocking pool
async fn blocking<T, F>(stage: &'static str, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| FuseError::internal(format!("{} task failed: {}", stage, e)))?
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
