//! Tracing configuration for structured logging
//!
//! The binary configures the subscriber; library modules only emit spans and
//! events through the helpers below.

#[cfg(feature = "cli")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable output with colors (default for interactive use)
    Console,
    /// Compact output without colors, for CI and container logs
    Compact,
    /// JSON lines for log shippers
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Tracing configuration builder
#[derive(Debug)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    pub format: TracingFormat,
    /// Filter directive, overrides verbosity when set
    pub env_filter: Option<String>,
    /// Instance id logged at startup for correlation
    pub instance_id: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            env_filter: None,
            instance_id: None,
        }
    }
}

impl TracingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level (0-2+)
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    /// Set a custom filter directive such as `bgfuse=debug,tower_http=info`
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    pub fn with_instance_id<S: Into<String>>(mut self, instance_id: S) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Filter directive derived from the verbosity level
    ///
    /// HTTP plumbing crates stay one level quieter below `-vv`.
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info,hyper=warn,reqwest=warn",
            1 => "debug,hyper=info,reqwest=info,h2=info",
            _ => "trace",
        }
    }

    /// Install the global subscriber, writing to stderr
    #[cfg(feature = "cli")]
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::fmt;

        let filter = match &self.env_filter {
            Some(directive) => EnvFilter::try_new(directive)?,
            None => EnvFilter::try_new(self.verbosity_to_filter())?,
        };
        let registry = Registry::default().with(filter);

        match self.format {
            TracingFormat::Console => {
                let fmt_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            TracingFormat::Compact => {
                let fmt_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            TracingFormat::Json => {
                let fmt_layer = fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true);
                registry.with(fmt_layer).try_init()?;
            },
        }

        if let Some(instance_id) = &self.instance_id {
            tracing::info!(instance_id = %instance_id, "bgfuse starting");
        }

        Ok(())
    }
}

/// Initialize tracing with CLI defaults
///
/// `RUST_LOG` wins over the verbosity flag when it is set.
#[cfg(feature = "cli")]
pub fn init_cli_tracing(verbosity: u8, format: TracingFormat) -> anyhow::Result<()> {
    let mut config = TracingConfig::new()
        .with_verbosity(verbosity)
        .with_format(format)
        .with_instance_id(uuid::Uuid::new_v4().to_string());
    if let Ok(directive) = std::env::var("RUST_LOG") {
        if !directive.trim().is_empty() {
            config = config.with_env_filter(directive);
        }
    }
    config.init()
}

/// Span creation helpers
pub mod spans {
    use tracing::{Level, Span};

    /// One HTTP request against the service
    pub fn request(route: &str, request_id: &str) -> Span {
        tracing::span!(
            Level::INFO,
            "request",
            route = %route,
            request_id = %request_id
        )
    }

    /// A call to a third-party API
    pub fn upstream(service: &str, operation: &str) -> Span {
        tracing::span!(
            Level::INFO,
            "upstream",
            service = %service,
            operation = %operation
        )
    }

    /// CPU-bound image work
    pub fn compositing(operation: &str, dimensions: (u32, u32)) -> Span {
        tracing::span!(
            Level::DEBUG,
            "compositing",
            operation = %operation,
            width = %dimensions.0,
            height = %dimensions.1
        )
    }

    pub fn storage_upload(backend: &str, key: &str) -> Span {
        tracing::span!(
            Level::DEBUG,
            "storage_upload",
            backend = %backend,
            key = %key
        )
    }
}

/// Event helpers for common logging patterns
pub mod events {
    use tracing::{debug, error, warn};

    pub fn error_with_context(error: &dyn std::error::Error, context: &str) {
        error!(error = %error, context = %context, "Operation failed");
    }

    pub fn warning_with_recommendation(message: &str, recommendation: &str) {
        warn!(message = %message, recommendation = %recommendation, "Warning");
    }

    /// Log how long a stage took
    pub fn performance_metric(operation: &str, duration_ms: u64) {
        debug!(operation = %operation, duration_ms = %duration_ms, "Performance metric");
    }

    pub fn artifact_stored(kind: &str, url: &str, bytes: usize) {
        debug!(kind = %kind, url = %url, bytes = %bytes, "Artifact stored");
    }
}
