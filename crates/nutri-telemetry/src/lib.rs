use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "nutri_notify" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid filter directive: {0}")]
    Filter(String),

    #[error("subscriber already installed: {0}")]
    Init(String),
}

/// Build an `EnvFilter` directive string from a base level and overrides.
pub fn filter_directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Parse a `module=level` override, as accepted on the command line.
pub fn parse_module_level(s: &str) -> Result<(String, Level), TelemetryError> {
    let (module, level) = s
        .split_once('=')
        .ok_or_else(|| TelemetryError::Filter(format!("expected module=level, got {s:?}")))?;
    let module = module.trim();
    if module.is_empty() {
        return Err(TelemetryError::Filter(format!("missing module in {s:?}")));
    }
    let level = level
        .trim()
        .parse::<Level>()
        .map_err(|e| TelemetryError::Filter(format!("{s:?}: {e}")))?;
    Ok((module.to_string(), level))
}

/// Resolve the active filter. Directives from the environment replace the
/// configured level and overrides entirely.
pub fn build_filter(
    env_directives: Option<&str>,
    config: &TelemetryConfig,
) -> Result<EnvFilter, TelemetryError> {
    let directives = match env_directives.map(str::trim).filter(|d| !d.is_empty()) {
        Some(env) => env.to_string(),
        None => filter_directives(config.log_level, &config.module_levels),
    };
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter(e.to_string()))
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(env.as_deref(), config)?;

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}
