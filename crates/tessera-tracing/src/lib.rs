//! Shared tracing setup for the tessera workspace.
//!
//! Engines, benchmarks and integration tests install their `tracing`
//! subscriber through this crate so that negotiation diagnostics (why an
//! implementation rejected a request) and pipeline step timings look the
//! same everywhere.
//!
//! ```rust
//! use tessera_tracing::{build_subscriber, TracingConfig, TracingProfile};
//!
//! let config = TracingConfig::profile(TracingProfile::Ci).with_negotiation_diagnostics(true);
//! let subscriber = build_subscriber(&config).expect("valid default directives");
//! tracing::subscriber::with_default(subscriber, || {
//!     tracing::debug!(target: "tessera_core::engine", "implementation rejected");
//! });
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::str::FromStr;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Directive that surfaces every rejection logged during negotiation.
pub const NEGOTIATION_DIRECTIVE: &str = "tessera_core::engine=debug";

/// Preset bundles of output settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingProfile {
    /// Pretty, coloured output
    Local,
    /// JSON without colour codes
    Ci,
    /// JSON with debug-level primitive creation and step timing
    Performance,
}

impl FromStr for TracingProfile {
    type Err = TracingSetupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "ci" => Ok(Self::Ci),
            "performance" | "perf" => Ok(Self::Performance),
            other => Err(TracingSetupError::UnknownSetting {
                setting: "profile",
                value: other.to_string(),
            }),
        }
    }
}

/// Output format of the formatter layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl FromStr for TracingOutput {
    type Err = TracingSetupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(TracingSetupError::UnknownSetting {
                setting: "format",
                value: other.to_string(),
            }),
        }
    }
}

/// How the shared subscriber behaves.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit directives (e.g. `tessera_core=debug,info`). When absent,
    /// `RUST_LOG` is consulted, then `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    /// Append [`NEGOTIATION_DIRECTIVE`] to whatever filter is resolved.
    pub negotiation_diagnostics: bool,
    pub include_targets: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// Report pipeline step durations (see [`performance`]).
    pub step_timing: bool,
    /// Steps faster than this are not reported.
    pub step_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::profile(TracingProfile::Local)
    }
}

impl TracingConfig {
    pub fn profile(profile: TracingProfile) -> Self {
        let base = Self {
            directives: None,
            default_directive: "info".to_string(),
            negotiation_diagnostics: false,
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            step_timing: false,
            step_threshold_us: None,
        };
        match profile {
            TracingProfile::Local => Self {
                ansi: true,
                output: TracingOutput::Pretty,
                step_timing: cfg!(debug_assertions),
                ..base
            },
            TracingProfile::Ci => base,
            TracingProfile::Performance => Self {
                directives: Some("tessera_core=debug,tessera_backends=debug".to_string()),
                span_events: FmtSpan::CLOSE,
                step_timing: true,
                ..base
            },
        }
    }

    pub fn with_negotiation_diagnostics(mut self, enabled: bool) -> Self {
        self.negotiation_diagnostics = enabled;
        self
    }

    /// Profile and overrides from the environment.
    ///
    /// - `TESSERA_TRACING_PROFILE`: `local` (default), `ci` or `performance`
    /// - `TESSERA_TRACING_DIRECTIVES`: filter directives
    /// - `TESSERA_TRACING_FORMAT`: `pretty`, `compact` or `json`
    /// - `TESSERA_TRACE_NEGOTIATION`: log every rejected implementation
    /// - `TESSERA_PERF_TRACING`: report pipeline step durations
    /// - `TESSERA_PERF_THRESHOLD_US`: minimum step duration to report
    ///
    /// Unparseable values are ignored with a warning on stderr, since no
    /// subscriber exists yet to carry it.
    pub fn from_env() -> Self {
        let profile = parsed_var::<TracingProfile>("TESSERA_TRACING_PROFILE").unwrap_or(TracingProfile::Local);
        let mut config = Self::profile(profile);

        if let Some(directives) = var("TESSERA_TRACING_DIRECTIVES") {
            config.directives = Some(directives);
        }
        if let Some(output) = parsed_var::<TracingOutput>("TESSERA_TRACING_FORMAT") {
            config.output = output;
            config.ansi &= output != TracingOutput::Json;
        }
        if let Some(enabled) = flag_var("TESSERA_TRACE_NEGOTIATION") {
            config.negotiation_diagnostics = enabled;
        }
        if let Some(enabled) = flag_var("TESSERA_PERF_TRACING") {
            config.step_timing = enabled;
        }
        if let Some(threshold) = parsed_var::<u64>("TESSERA_PERF_THRESHOLD_US") {
            config.step_threshold_us = Some(threshold);
        }
        config
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        let mut directives = match &self.directives {
            Some(directives) => directives.clone(),
            None => env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| self.default_directive.clone()),
        };
        if self.negotiation_diagnostics {
            directives.push(',');
            directives.push_str(NEGOTIATION_DIRECTIVE);
        }
        EnvFilter::try_new(&directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed_var<T: FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let value = var(key)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            eprintln!("tessera-tracing: ignoring {key}={value}: {err}");
            None
        }
    }
}

fn flag_var(key: &str) -> Option<bool> {
    let value = var(key)?;
    Some(matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Failures while configuring the shared subscriber
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    #[error("unknown tracing {setting} `{value}`")]
    UnknownSetting { setting: &'static str, value: String },

    /// Usually a global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.filter()?;
    Ok(Registry::default().with(format_layer(config)).with(filter))
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());
    match config.output {
        TracingOutput::Compact => Box::new(layer.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(layer.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(layer.json().with_ansi(false)),
    }
}

/// Install the configured subscriber process-wide and apply its step
/// timing settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::configure(config.step_timing, config.step_threshold_us);
    Ok(())
}
