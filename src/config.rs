//! Configuration types for the fusion service

use crate::error::{FuseError, Result};
use crate::retry::RetryPolicy;
pub use crate::types::ColorMatch;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which text-to-image backend produces replacement backgrounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    /// Stability AI SD3, answers synchronously with image bytes
    #[default]
    Stability,
    /// PiAPI task API, submit a job and poll it to completion
    PiApi,
}

impl std::fmt::Display for GenerationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stability => write!(f, "stability"),
            Self::PiApi => write!(f, "piapi"),
        }
    }
}

impl FromStr for GenerationBackend {
    type Err = FuseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stability" | "sd3" => Ok(Self::Stability),
            "piapi" | "flux" => Ok(Self::PiApi),
            other => Err(FuseError::config(format!(
                "Unknown generation backend '{}'. Expected 'stability' or 'piapi'",
                other
            ))),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:3000`
    pub bind: String,
    /// Maximum accepted request body in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Supabase Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Service role key used for uploads
    pub service_key: String,
    /// Public bucket that receives every artifact
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            service_key: String::new(),
            bucket: "fusion-images".to_string(),
        }
    }
}

/// Stability AI settings, used for background removal and SD3 generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub api_key: String,
    pub base_url: String,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.stability.ai".to_string(),
        }
    }
}

/// PiAPI task API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiApiConfig {
    pub api_key: String,
    pub base_url: String,
    /// Model identifier submitted with each task
    pub model: String,
    /// Delay between two status checks, in milliseconds
    pub poll_interval_ms: u64,
    /// Number of status checks before giving up
    pub max_polls: u32,
}

impl Default for PiApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.piapi.ai".to_string(),
            model: "Qubico/flux1-dev".to_string(),
            poll_interval_ms: 2000,
            max_polls: 60,
        }
    }
}

impl PiApiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// OpenRouter chat completion settings for prompt expansion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://openrouter.ai".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
        }
    }
}

/// Pixel dimension limits applied around upstream calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLimits {
    /// Longest side sent to the background removal API
    pub api_max_side: u32,
    /// Longest side requested from the generator
    pub generation_max_side: u32,
    /// Generated dimensions are rounded to a multiple of this value
    pub dimension_multiple: u32,
    /// Longest side of a fused image
    pub fusion_max_side: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            api_max_side: 1280,
            generation_max_side: 1536,
            dimension_multiple: 64,
            fusion_max_side: 4096,
        }
    }
}

/// Defaults for the fuse operation when the request does not override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionDefaults {
    pub color_match: ColorMatch,
    /// Soft-light mix factor in `[0, 1]`
    pub soft_light_strength: f32,
}

impl Default for FusionDefaults {
    fn default() -> Self {
        Self {
            color_match: ColorMatch::Tint,
            soft_light_strength: 0.5,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub stability: StabilityConfig,
    pub piapi: PiApiConfig,
    /// Prompt expansion is disabled when absent
    pub openrouter: Option<OpenRouterConfig>,
    pub generator: GenerationBackend,
    pub retry: RetryPolicy,
    pub limits: ImageLimits,
    pub fusion: FusionDefaults,
    /// Appended to user prompts when no expander is configured or it fails
    pub prompt_suffix: String,
    /// Timeout for any single upstream HTTP request, in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            stability: StabilityConfig::default(),
            piapi: PiApiConfig::default(),
            openrouter: None,
            generator: GenerationBackend::default(),
            retry: RetryPolicy::default(),
            limits: ImageLimits::default(),
            fusion: FusionDefaults::default(),
            prompt_suffix: crate::prompt::DEFAULT_PROMPT_SUFFIX.to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Load a JSON configuration file; absent fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FuseError::config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            FuseError::config(format!("Failed to parse config file '{}': {}", path.display(), e))
        })
    }

    /// Default configuration overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    ///
    /// Empty values are ignored so that an exported-but-blank variable does
    /// not wipe a value coming from a config file.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("SUPABASE_URL").or_else(|| get("NEXT_PUBLIC_SUPABASE_URL")) {
            self.storage.base_url = url;
        }
        if let Some(key) = get("SUPABASE_SERVICE_ROLE_KEY") {
            self.storage.service_key = key;
        }
        if let Some(bucket) = get("SUPABASE_BUCKET") {
            self.storage.bucket = bucket;
        }
        if let Some(key) = get("STABILITY_API_KEY") {
            self.stability.api_key = key;
        }
        if let Some(key) = get("PIAPI_API_KEY") {
            self.piapi.api_key = key;
        }
        if let Some(key) = get("OPENROUTER_API_KEY") {
            let mut openrouter = self.openrouter.take().unwrap_or_default();
            openrouter.api_key = key;
            if let Some(model) = get("OPENROUTER_MODEL") {
                openrouter.model = model;
            }
            self.openrouter = Some(openrouter);
        }
        if let Some(generator) = get("BGFUSE_GENERATOR") {
            self.generator = generator.parse()?;
        }
        if let Some(bind) = get("BGFUSE_BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }

    /// Validate all configuration parameters required to serve requests
    ///
    /// # Errors
    /// - Missing storage URL, key or bucket
    /// - Missing API key for Stability AI (always needed for matting)
    /// - Missing PiAPI key when the PiAPI generator is selected
    /// - Out-of-range retry, limit or blending values
    pub fn validate(&self) -> Result<()> {
        if !self.storage.base_url.starts_with("http://")
            && !self.storage.base_url.starts_with("https://")
        {
            return Err(FuseError::config(format!(
                "Storage base URL must be an http(s) URL, got '{}'. Set SUPABASE_URL",
                self.storage.base_url
            )));
        }
        if self.storage.service_key.is_empty() {
            return Err(FuseError::config(
                "Storage service key is empty. Set SUPABASE_SERVICE_ROLE_KEY",
            ));
        }
        if self.storage.bucket.is_empty() {
            return Err(FuseError::config("Storage bucket name is empty"));
        }
        if self.stability.api_key.is_empty() {
            return Err(FuseError::config(
                "Stability API key is empty. Set STABILITY_API_KEY",
            ));
        }
        if self.generator == GenerationBackend::PiApi && self.piapi.api_key.is_empty() {
            return Err(FuseError::config(
                "PiAPI generator selected but PIAPI_API_KEY is empty",
            ));
        }
        if let Some(openrouter) = &self.openrouter {
            if openrouter.api_key.is_empty() {
                return Err(FuseError::config("OpenRouter is configured without an API key"));
            }
        }

        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(FuseError::config_value_error(
                "retry attempts",
                self.retry.max_attempts,
                "1-10",
                Some(3),
            ));
        }
        if self.piapi.max_polls == 0 {
            return Err(FuseError::config_value_error(
                "PiAPI max polls",
                self.piapi.max_polls,
                "1 or more",
                Some(60),
            ));
        }
        if !(1..=512).contains(&self.limits.dimension_multiple) {
            return Err(FuseError::config_value_error(
                "dimension multiple",
                self.limits.dimension_multiple,
                "1-512",
                Some(64),
            ));
        }
        if self.limits.api_max_side < 64 {
            return Err(FuseError::config_value_error(
                "API max side",
                self.limits.api_max_side,
                "64 or more",
                Some(1280),
            ));
        }
        if self.limits.generation_max_side < self.limits.dimension_multiple {
            return Err(FuseError::config_value_error(
                "generation max side",
                self.limits.generation_max_side,
                "at least the dimension multiple",
                Some(1536),
            ));
        }
        if !(64..=16384).contains(&self.limits.fusion_max_side) {
            return Err(FuseError::config_value_error(
                "fusion max side",
                self.limits.fusion_max_side,
                "64-16384",
                Some(4096),
            ));
        }
        if !(0.0..=1.0).contains(&self.fusion.soft_light_strength) {
            return Err(FuseError::config_value_error(
                "soft-light strength",
                self.fusion.soft_light_strength,
                "0.0-1.0",
                Some(0.5),
            ));
        }
        Ok(())
    }

    /// Copy of the configuration with every secret masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.storage.service_key = redact(&copy.storage.service_key);
        copy.stability.api_key = redact(&copy.stability.api_key);
        copy.piapi.api_key = redact(&copy.piapi.api_key);
        if let Some(openrouter) = copy.openrouter.as_mut() {
            openrouter.api_key = redact(&openrouter.api_key);
        }
        copy
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        let tail: String = secret
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("****{}", tail)
    }
}

/// Builder for `ServiceConfig`
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    #[must_use]
    pub fn bind<S: Into<String>>(mut self, bind: S) -> Self {
        self.config.server.bind = bind.into();
        self
    }

    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.server.max_upload_bytes = bytes;
        self
    }

    /// Set Supabase URL, service key and bucket
    #[must_use]
    pub fn storage<U, K, B>(mut self, base_url: U, service_key: K, bucket: B) -> Self
    where
        U: Into<String>,
        K: Into<String>,
        B: Into<String>,
    {
        self.config.storage = StorageConfig {
            base_url: base_url.into(),
            service_key: service_key.into(),
            bucket: bucket.into(),
        };
        self
    }

    #[must_use]
    pub fn stability_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.stability.api_key = key.into();
        self
    }

    /// Override the Stability AI host, mainly for tests
    #[must_use]
    pub fn stability_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.stability.base_url = url.into();
        self
    }

    #[must_use]
    pub fn piapi(mut self, piapi: PiApiConfig) -> Self {
        self.config.piapi = piapi;
        self
    }

    #[must_use]
    pub fn openrouter(mut self, openrouter: Option<OpenRouterConfig>) -> Self {
        self.config.openrouter = openrouter;
        self
    }

    #[must_use]
    pub fn generator(mut self, generator: GenerationBackend) -> Self {
        self.config.generator = generator;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ImageLimits) -> Self {
        self.config.limits = limits;
        self
    }

    #[must_use]
    pub fn color_match(mut self, color_match: ColorMatch) -> Self {
        self.config.fusion.color_match = color_match;
        self
    }

    /// Set soft-light strength, clamped to `[0, 1]`
    #[must_use]
    pub fn soft_light_strength(mut self, strength: f32) -> Self {
        self.config.fusion.soft_light_strength = strength.clamp(0.0, 1.0);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ServiceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation, for offline commands that need no credentials
    #[must_use]
    pub fn build_unchecked(self) -> ServiceConfig {
        self.config
    }
}
