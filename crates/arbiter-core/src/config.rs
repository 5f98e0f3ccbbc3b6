//! Pipeline, resource-limit and output configuration.
//!
//! Everything deserializes from TOML with per-field defaults, so a config
//! file only needs to name what it changes:
//!
//! ```toml
//! [pipeline]
//! fast_mode = true
//!
//! [[pipeline.phases]]
//! name = "validate"
//! command = ["cue", "vet"]
//!
//! [[pipeline.phases]]
//! name = "ui"
//!
//! [output]
//! path = "reports/events.ndjson"
//! format = "table"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Quiet period after the last change event before a batch is formed.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// How long `stop()` waits for an in-flight batch before abandoning it.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Path that selects the standard output stream as the sink.
pub const STDOUT_PATH: &str = "-";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// PIPELINE
// ============================================================================

/// One configured validation phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Phase name; also the key executors are registered under.
    pub name: String,

    /// Whether a failure stops the remaining phases (outside fast mode).
    /// When no phase sets this, only the first phase is critical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,

    /// External command run by the CLI's command executor (first element is
    /// the executable). Phases without a command need a registered executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl PhaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            critical: None,
            command: None,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Phases in execution order.
    pub phases: Vec<PhaseConfig>,

    /// Reserved for cross-batch concurrency; batches currently run one at a time.
    pub parallelism: usize,

    /// Incremental mode: only files whose content fingerprint changed are
    /// revalidated, and a failing critical phase does not stop the batch.
    pub fast_mode: bool,

    /// Hard timeout for a single phase execution.
    pub phase_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phases: Vec::new(),
            parallelism: 1,
            fast_mode: false,
            phase_timeout_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    /// Pipeline over the given phase names with default settings.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            phases: names.iter().map(|n| PhaseConfig::new(n.as_ref())).collect(),
            ..Self::default()
        }
    }

    pub fn with_fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    /// Resolve the critical flag for the phase at `index`.
    pub fn is_critical(&self, index: usize) -> bool {
        let any_explicit = self.phases.iter().any(|p| p.critical.is_some());
        match self.phases.get(index) {
            None => false,
            Some(phase) if any_explicit => phase.critical.unwrap_or(false),
            Some(_) => index == 0,
        }
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

// ============================================================================
// RESOURCE LIMITS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Largest estimated payload a single request may carry.
    pub max_payload_bytes: u64,

    /// Hard ceiling for one batch's processing time.
    pub max_processing_time_ms: u64,

    /// Admissions allowed within any rolling one-second window.
    pub max_rate_per_second: u32,

    pub backoff_enabled: bool,

    /// Base delay is multiplied by `backoff_multiplier^k`, k drawn from {0, 1, 2}.
    pub backoff_multiplier: f64,

    pub max_backoff_ms: u64,

    /// Queue refused requests instead of failing them.
    pub batching_enabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1_048_576,
            max_processing_time_ms: 5_000,
            max_rate_per_second: 10,
            backoff_enabled: true,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            batching_enabled: true,
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Wire format of the event sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One compact JSON object per line
    #[default]
    Ndjson,
    /// A pretty-printed JSON array per flush
    Json,
    /// Human-readable lines
    Table,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Ndjson => "ndjson",
            OutputFormat::Json => "json",
            OutputFormat::Table => "table",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ndjson" | "jsonl" => Ok(OutputFormat::Ndjson),
            "json" => Ok(OutputFormat::Json),
            "table" => Ok(OutputFormat::Table),
            other => Err(ConfigError::Invalid(format!("unknown output format: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Sink path; `"-"` writes to stdout.
    pub path: String,

    pub format: OutputFormat,

    /// Buffered events that trigger an immediate flush.
    pub buffer_size: usize,

    pub flush_interval_ms: u64,

    /// Shape-check events before accepting them.
    pub validate_schema: bool,

    /// Emit a heartbeat event on this period when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: STDOUT_PATH.to_string(),
            format: OutputFormat::Ndjson,
            buffer_size: 50,
            flush_interval_ms: 1_000,
            validate_schema: true,
            heartbeat_interval_ms: None,
        }
    }
}

impl OutputConfig {
    pub fn is_stdout(&self) -> bool {
        self.path == STDOUT_PATH
    }
}

// ============================================================================
// TOP LEVEL
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub pipeline: PipelineConfig,
    pub limits: ResourceLimits,
    pub output: OutputConfig,
}

impl ArbiterConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ArbiterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the scheduler cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for phase in &self.pipeline.phases {
            if phase.name.trim().is_empty() {
                return Err(ConfigError::Invalid("phase name must not be empty".to_string()));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate phase: {}", phase.name)));
            }
            if let Some(command) = &phase.command {
                if command.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "phase {} has empty command",
                        phase.name
                    )));
                }
            }
        }
        if self.limits.max_rate_per_second == 0 {
            return Err(ConfigError::Invalid("max_rate_per_second must be positive".to_string()));
        }
        if self.limits.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid("backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.output.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}
