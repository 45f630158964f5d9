#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # bgfuse
//!
//! Backend for a photo fusion workflow: upload a photo, cut the subject out
//! through a background-removal API, generate a replacement background with a
//! text-to-image API and composite the two into one image. Every artifact is
//! stored as a PNG in an object store and handed back as a public URL.
//!
//! ## Features
//!
//! - **Matting**: Stability AI background removal with retry on 5xx and
//!   network failures; uploads are downscaled before the call and the cutout
//!   is restored to the original size
//! - **Generation**: Stability AI SD3 (synchronous) or PiAPI Flux (task
//!   polling), with optional OpenRouter prompt expansion
//! - **Fusion**: cover-fit background, dominant color extraction, Lab tint or
//!   soft-light color matching, centered alpha compositing
//! - **Storage**: Supabase Storage, or an in-memory store for tests
//! - **HTTP API**: axum router with `POST /api/matting`, `POST /api/ai-fuse`
//!   and `GET /health`
//! - **CLI**: `bgfuse serve`, offline `bgfuse fuse` (enable with `cli` feature)
//!
//! ## Library usage
//!
//! ```rust,no_run
//! use bgfuse::{FusionService, ServiceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::from_env()?;
//! let service = FusionService::from_config(config)?;
//! let app = bgfuse::server::router(service);
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Offline compositing needs no service at all:
//!
//! ```rust,no_run
//! use bgfuse::compositing::{decode_image, encode_png, fuse_layers, FusionParams};
//! use bgfuse::ColorMatch;
//!
//! # fn example() -> bgfuse::Result<()> {
//! let foreground = decode_image(&std::fs::read("cutout.png")?)?;
//! let background = decode_image(&std::fs::read("beach.jpg")?)?;
//! let params = FusionParams {
//!     aspect_ratio: Some("16:9".parse()?),
//!     color_match: ColorMatch::SoftLight,
//!     strength: 0.4,
//!     max_side: 4096,
//! };
//! let fused = fuse_layers(&foreground, &background, params)?;
//! std::fs::write("fused.png", encode_png(&image::DynamicImage::ImageRgba8(fused.image))?)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `cli` (default): command-line interface and tracing subscriber setup
//! - `webp-support` (default): WebP decoding for uploads and generated images
//! - `tracing-json`: JSON log output

#[cfg(feature = "cli")]
pub mod cli;
pub mod compositing;
pub mod config;
pub mod error;
pub mod generation;
pub mod matting;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod server;
pub mod storage;
pub mod tracing_config;
pub mod types;

pub use config::{GenerationBackend, ServiceConfig, ServiceConfigBuilder};
pub use error::{FuseError, Result};
pub use generation::{BackgroundGenerator, GenerationRequest, PiApiGenerator, StabilityGenerator};
pub use matting::{BackgroundRemover, StabilityRemover};
pub use pipeline::{FuseImageRequest, FusionService, GenerateBackgroundRequest, MattingOutcome};
pub use prompt::{OpenRouterExpander, PromptExpander};
pub use retry::RetryPolicy;
pub use storage::{MemoryStore, ObjectStore, SupabaseStorage};
pub use types::{AspectRatio, ColorMatch};
