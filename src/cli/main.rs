//! Command-line entry point: run the HTTP service or fuse local files

use super::config::CliConfigBuilder;
use crate::{
    compositing,
    pipeline::FusionService,
    server,
    tracing_config::{init_cli_tracing, TracingFormat},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use instant::Instant;
use std::path::PathBuf;
use tracing::{debug, info};

/// Background matting and fusion service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgfuse")]
pub struct Cli {
    /// Enable verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console, global = true)]
    pub log_format: CliLogFormat,

    /// JSON configuration file; environment variables override its values
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP service
    Serve(ServeArgs),
    /// Composite a local cutout over a local background without any API call
    Fuse(FuseArgs),
    /// Print the effective configuration with secrets masked
    ShowConfig,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Socket address to listen on
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Background generator (stability, piapi)
    #[arg(short, long)]
    pub generator: Option<String>,

    /// Maximum upload size in MiB
    #[arg(long, value_name = "MIB")]
    pub max_upload_mb: Option<usize>,
}

#[derive(Args, Debug)]
pub struct FuseArgs {
    /// Foreground cutout with transparency
    #[arg(value_name = "FOREGROUND")]
    pub foreground: PathBuf,

    /// Background image
    #[arg(value_name = "BACKGROUND")]
    pub background: PathBuf,

    /// Output file (defaults to <FOREGROUND>-fused.png)
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    /// Output aspect ratio such as 16:9
    #[arg(short, long)]
    pub aspect_ratio: Option<String>,

    /// Color matching mode (none, tint, soft-light)
    #[arg(long)]
    pub color_match: Option<String>,

    /// Soft-light strength between 0 and 1
    #[arg(long)]
    pub strength: Option<f32>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => TracingFormat::Console,
            CliLogFormat::Compact => TracingFormat::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => TracingFormat::Json,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_cli_tracing(cli.verbose, cli.log_format.into()).context("Failed to initialize tracing")?;

    match &cli.command {
        Command::Serve(args) => serve(&cli, args).await,
        Command::Fuse(args) => fuse_files(&cli, args).await,
        Command::ShowConfig => show_config(&cli),
    }
}

async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let config = CliConfigBuilder::for_serve(cli, args).context("Invalid configuration")?;
    let service = FusionService::from_config(config).context("Failed to start fusion service")?;
    server::serve(service).await.context("Server error")?;
    Ok(())
}

async fn fuse_files(cli: &Cli, args: &FuseArgs) -> Result<()> {
    let config = CliConfigBuilder::load(cli).context("Failed to load configuration")?;
    let params = CliConfigBuilder::fusion_params(args, &config)?;
    let output = CliConfigBuilder::fused_output_path(&args.foreground, args.output.as_deref());

    let foreground = tokio::fs::read(&args.foreground)
        .await
        .with_context(|| format!("Failed to read {}", args.foreground.display()))?;
    let background = tokio::fs::read(&args.background)
        .await
        .with_context(|| format!("Failed to read {}", args.background.display()))?;

    let start = Instant::now();
    let (png, size, dominant) = tokio::task::spawn_blocking(move || -> crate::Result<_> {
        let foreground = compositing::decode_image(&foreground)?;
        let background = compositing::decode_image(&background)?;
        let fused = compositing::fuse_layers(&foreground, &background, params)?;
        let size = fused.image.dimensions();
        let dominant = fused.dominant;
        let png = compositing::encode_png(&image::DynamicImage::ImageRgba8(fused.image))?;
        Ok((png, size, dominant))
    })
    .await
    .context("Compositing task panicked")?
    .context("Failed to fuse images")?;
    debug!(dominant = ?dominant.0, "Dominant background color");

    tokio::fs::write(&output, &png)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        output = %output.display(),
        width = size.0,
        height = size.1,
        color_match = %params.color_match,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Fused image written"
    );
    println!("{}", output.display());
    Ok(())
}

fn show_config(cli: &Cli) -> Result<()> {
    let config = CliConfigBuilder::load(cli).context("Failed to load configuration")?;
    if let Err(e) = config.validate() {
        tracing::warn!(error = %e, "Configuration is not ready to serve requests");
    }
    let rendered = serde_json::to_string_pretty(&config.redacted())
        .context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
