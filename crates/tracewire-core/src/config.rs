//! The `tracewire` TOML file
//!
//! One file describes the pipelines to build and how the process around
//! them behaves. `TRACEWIRE_*` variables patch it after parsing, and the
//! result is validated before any pipeline exists.

use crate::operator::ErrorPolicy;
use crate::params::Params;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Parsed config file; every table is optional
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sensor: SensorSettings,

    /// Shared process metadata cache
    pub local_manager: LocalManagerSettings,

    /// Generated events for `tracewire run`
    pub run: GeneratorSettings,

    /// Generated events for `tracewire demo`
    pub demo: GeneratorSettings,

    /// Pipelines to run
    pub pipelines: Vec<PipelineSettings>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensor: SensorSettings::default(),
            local_manager: LocalManagerSettings::default(),
            run: GeneratorSettings {
                interval_ms: 100,
                count: None,
            },
            demo: GeneratorSettings::default(),
            pipelines: vec![
                PipelineSettings {
                    name: "exec".to_string(),
                    gadget: "trace_exec".to_string(),
                    operators: vec!["args".to_string(), "local_manager".to_string()],
                    ..Default::default()
                },
                PipelineSettings {
                    name: "dns".to_string(),
                    gadget: "trace_dns".to_string(),
                    operators: vec!["dns".to_string(), "local_manager".to_string()],
                    ..Default::default()
                },
            ],
        }
    }
}

/// `[sensor]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Tracing level used when neither `-v` nor `RUST_LOG` is given
    pub log_level: String,

    /// Log line format on stderr
    pub log_format: LogFormat,

    /// Stop every pipeline after this many seconds
    pub run_timeout_secs: Option<u64>,

    /// Prometheus text file with the pipeline counters, written on exit
    pub metrics_path: Option<PathBuf>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            run_timeout_secs: Some(3600),
            metrics_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalManagerSettings {
    /// Register the process metadata cache
    pub enabled: bool,

    /// Procfs root
    pub proc_root: PathBuf,
}

impl Default for LocalManagerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Pace of the synthetic runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Delay between generated events (ms)
    pub interval_ms: u64,

    /// Events per stream; unlimited when unset
    pub count: Option<u64>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            count: None,
        }
    }
}

/// One pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Unique pipeline name
    pub name: String,

    /// Built-in gadget name or path to an image file
    pub gadget: String,

    /// Operators by name, in any order
    pub operators: Vec<String>,

    /// Invocation parameters (`operator.<Op>.<key>`)
    pub params: Params,

    /// How decoders treat undecodable records
    pub decode_errors: ErrorPolicy,

    /// Where records go
    pub export: ExportSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            gadget: String::new(),
            operators: Vec::new(),
            params: Params::new(),
            decode_errors: ErrorPolicy::FailFast,
            export: ExportSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Stdout,
    Jsonl,
    /// Records are decoded and enriched but not written anywhere
    #[serde(rename = "none")]
    Discard,
}

/// Export configuration of one pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub kind: ExportKind,

    /// Output file path (jsonl only)
    pub path: Option<PathBuf>,

    /// Append to an existing file (jsonl only)
    pub append: bool,

    /// Pretty-print JSON
    pub pretty: bool,

    /// Stop the pipeline when the sink fails
    pub fatal_sink_errors: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            kind: ExportKind::Stdout,
            path: None,
            append: true,
            pretty: false,
            fatal_sink_errors: false,
        }
    }
}

/// Locates the config file and turns it into a validated [`SensorConfig`]
pub struct ConfigLoader {
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Path given with `--config`; it must exist
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// The first file found wins, in this order: `--config`,
    /// `TRACEWIRE_CONFIG`, [`Self::default_config_path`] and
    /// `/etc/tracewire/config.toml`. Without one the defaults apply.
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                SensorConfig::default()
            }
        };

        self.apply_env_overrides(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// An explicit CLI path must exist; the others are optional
    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var("TRACEWIRE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("TRACEWIRE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Ok(Some(path));
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/tracewire/config.toml");
            if path.exists() {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// Parse a file as is, without overrides or validation
    pub fn load_from_file(path: &Path) -> ConfigResult<SensorConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut SensorConfig) {
        if let Ok(val) = std::env::var("TRACEWIRE_LOG_LEVEL") {
            config.sensor.log_level = val;
        }
        if let Ok(val) = std::env::var("TRACEWIRE_RUN_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(0) => config.sensor.run_timeout_secs = None,
                Ok(secs) => config.sensor.run_timeout_secs = Some(secs),
                Err(_) => warn!("Ignoring TRACEWIRE_RUN_TIMEOUT_SECS={}", val),
            }
        }
        if let Ok(val) = std::env::var("TRACEWIRE_METRICS_PATH") {
            config.sensor.metrics_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("TRACEWIRE_LOCAL_MANAGER") {
            config.local_manager.enabled = val.parse().unwrap_or(config.local_manager.enabled);
        }
    }

    pub fn validate(config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        let mut names = HashSet::new();
        for pipeline in &config.pipelines {
            if pipeline.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Pipeline name cannot be empty".to_string(),
                ));
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate pipeline name: {}",
                    pipeline.name
                )));
            }
            if pipeline.gadget.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Pipeline {} has no gadget",
                    pipeline.name
                )));
            }
            if pipeline.export.kind == ExportKind::Jsonl && pipeline.export.path.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Pipeline {} exports to jsonl without a path",
                    pipeline.name
                )));
            }
        }

        Ok(())
    }

    /// Write `config` as TOML, creating missing parent directories
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// `tracewire/config.toml` under the user's config directory
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tracewire").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
