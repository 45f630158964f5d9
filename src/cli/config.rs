//! Conversion of CLI arguments into service configuration

use crate::cli::main_impl::{Cli, FuseArgs, ServeArgs};
use crate::compositing::FusionParams;
use crate::config::{ColorMatch, ServiceConfig};
use crate::types::AspectRatio;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Config file (if any) overlaid with the process environment
    pub(crate) fn load(cli: &Cli) -> Result<ServiceConfig> {
        let mut config = match &cli.config {
            Some(path) => ServiceConfig::from_file(path)?,
            None => ServiceConfig::default(),
        };
        config
            .apply_env(|key| std::env::var(key).ok())
            .context("Invalid environment variable")?;
        Ok(config)
    }

    /// Loaded configuration with `serve` flags applied, validated
    pub(crate) fn for_serve(cli: &Cli, args: &ServeArgs) -> Result<ServiceConfig> {
        let mut config = Self::load(cli)?;
        Self::apply_serve_args(&mut config, args)?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn apply_serve_args(config: &mut ServiceConfig, args: &ServeArgs) -> Result<()> {
        if let Some(bind) = &args.bind {
            config.server.bind = bind.clone();
        }
        if let Some(generator) = &args.generator {
            config.generator = generator.parse().context("Invalid --generator")?;
        }
        if let Some(mb) = args.max_upload_mb {
            if mb == 0 {
                anyhow::bail!("--max-upload-mb must be at least 1");
            }
            config.server.max_upload_bytes = mb.saturating_mul(1024 * 1024);
        }
        Ok(())
    }

    pub(crate) fn fusion_params(args: &FuseArgs, config: &ServiceConfig) -> Result<FusionParams> {
        let defaults = &config.fusion;
        let aspect_ratio = args
            .aspect_ratio
            .as_deref()
            .map(str::parse::<AspectRatio>)
            .transpose()
            .context("Invalid --aspect-ratio")?;
        let color_match = args
            .color_match
            .as_deref()
            .map(str::parse::<ColorMatch>)
            .transpose()
            .context("Invalid --color-match")?
            .unwrap_or(defaults.color_match);
        let strength = args.strength.unwrap_or(defaults.soft_light_strength);
        if !(0.0..=1.0).contains(&strength) {
            anyhow::bail!("--strength must be between 0 and 1, got {}", strength);
        }
        Ok(FusionParams {
            aspect_ratio,
            color_match,
            strength,
            max_side: config.limits.fusion_max_side,
        })
    }

    /// `-o` if given, else `<foreground stem>-fused.png` next to the foreground
    pub(crate) fn fused_output_path(foreground: &Path, output: Option<&Path>) -> PathBuf {
        if let Some(output) = output {
            return output.to_path_buf();
        }
        let stem = foreground
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        foreground.with_file_name(format!("{}-fused.png", stem))
    }
}
