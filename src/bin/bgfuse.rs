//! bgfuse command-line tool
//!
//! Runs the matting and fusion HTTP service, or fuses local files offline.

#[cfg(feature = "cli")]
use bgfuse::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(2);
}
