//! Pipeline assembly from configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracewire_capture::{builtin_image, SyntheticConfig, SyntheticRuntime};
use tracewire_core::config::{
    ConfigError, ConfigLoader, ExportKind, ExportSettings, GeneratorSettings, PipelineSettings,
    SensorConfig,
};
use tracewire_core::metrics::to_prometheus;
use tracewire_core::{
    ExportSink, GadgetImage, GadgetRuntime, ImageError, Operator, PipelineConfig, PipelineStats,
    Registry, RegistryError,
};
use tracewire_decode::{ArgsOperator, DnsOperator};
use tracewire_enrich::{HostOperator, LocalManager, LocalManagerOperator};
use tracewire_export::{ExportOperator, JsonlSink, JsonlSinkConfig, StdoutSink};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Pipeline {pipeline}: unknown operator {operator}")]
    UnknownOperator { pipeline: String, operator: String },

    #[error("Pipeline {pipeline}: {source}")]
    Image {
        pipeline: String,
        #[source]
        source: ImageError,
    },

    #[error("Pipeline {pipeline}: jsonl export needs a path")]
    MissingExportPath { pipeline: String },

    #[error("Pipeline {pipeline}: failed to open {path}: {source}")]
    OpenSink {
        pipeline: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0} already exists")]
    ConfigExists(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Synthetic runtime paced by `settings`; a count of 0 means endless
pub fn synthetic_runtime(settings: &GeneratorSettings) -> Arc<dyn GadgetRuntime> {
    Arc::new(SyntheticRuntime::with_config(SyntheticConfig {
        interval: Duration::from_millis(settings.interval_ms),
        count: settings.count.filter(|n| *n > 0),
        ..Default::default()
    }))
}

/// Write the default configuration to `path`. An existing file is only
/// replaced with `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<(), SetupError> {
    if path.exists() && !force {
        return Err(SetupError::ConfigExists(path.to_path_buf()));
    }
    ConfigLoader::new().save(&SensorConfig::default(), path)?;
    Ok(())
}

/// Counters of every pipeline as a Prometheus text file
pub fn write_metrics(path: &Path, stats: &[(String, Arc<PipelineStats>)]) -> std::io::Result<()> {
    let snapshots: Vec<(&str, _)> = stats
        .iter()
        .map(|(name, stats)| (name.as_str(), stats.snapshot()))
        .collect();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, to_prometheus(&snapshots))?;
    debug!("Metrics written to {}", path.display());
    Ok(())
}

/// Built-in gadget by name, otherwise an image file named after its stem
pub fn resolve_image(gadget: &str) -> Result<GadgetImage, ImageError> {
    if let Some(image) = builtin_image(gadget) {
        return Ok(image);
    }
    let path = Path::new(gadget);
    let reference = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| gadget.to_string());
    GadgetImage::load(reference, path)
}

/// Build one registry holding every configured pipeline, all executed by
/// `runtime`
pub fn build_registry(
    config: &SensorConfig,
    runtime: Arc<dyn GadgetRuntime>,
) -> Result<Registry, SetupError> {
    let mut registry = Registry::new();

    let local_manager = if config.local_manager.enabled {
        let manager = Arc::new(LocalManager::new(config.local_manager.proc_root.clone()));
        registry.add_shared(manager.clone());
        Some(manager)
    } else {
        None
    };
    let mut stdout_sinks: [Option<Arc<dyn ExportSink>>; 2] = [None, None];

    for settings in &config.pipelines {
        let image = resolve_image(&settings.gadget).map_err(|source| SetupError::Image {
            pipeline: settings.name.clone(),
            source,
        })?;

        let mut pipeline = PipelineConfig::new(image, runtime.clone())
            .with_params(settings.params.clone());
        for name in &settings.operators {
            match operator(settings, name, local_manager.as_ref())? {
                Some(op) => pipeline = pipeline.with_operator(op),
                None => warn!(
                    "Pipeline {}: operator {} skipped, local manager is disabled",
                    settings.name, name
                ),
            }
        }

        if let Some(sink) = export_sink(settings, &mut stdout_sinks)? {
            let export = ExportOperator::new(sink)
                .with_fatal_sink_errors(settings.export.fatal_sink_errors);
            pipeline = pipeline.with_operator(Arc::new(export));
        }

        debug!("Pipeline {} configured: {:?}", settings.name, pipeline);
        registry.register(settings.name.clone(), pipeline)?;
    }

    info!("{} pipelines configured", registry.len());
    Ok(registry)
}

fn operator(
    settings: &PipelineSettings,
    name: &str,
    local_manager: Option<&Arc<LocalManager>>,
) -> Result<Option<Arc<dyn Operator>>, SetupError> {
    let op: Arc<dyn Operator> = match name {
        "args" => Arc::new(ArgsOperator::new(settings.decode_errors)),
        "dns" => Arc::new(DnsOperator::new(settings.decode_errors)),
        "host" => Arc::new(HostOperator::new()),
        "local_manager" => match local_manager {
            Some(manager) => Arc::new(LocalManagerOperator::new(manager.clone())),
            None => return Ok(None),
        },
        other => {
            return Err(SetupError::UnknownOperator {
                pipeline: settings.name.clone(),
                operator: other.to_string(),
            })
        }
    };
    Ok(Some(op))
}

/// Stdout sinks are shared between pipelines so lines never interleave
fn export_sink(
    settings: &PipelineSettings,
    stdout_sinks: &mut [Option<Arc<dyn ExportSink>>; 2],
) -> Result<Option<Arc<dyn ExportSink>>, SetupError> {
    let ExportSettings {
        kind,
        path,
        append,
        pretty,
        ..
    } = &settings.export;

    let sink: Arc<dyn ExportSink> = match kind {
        ExportKind::Discard => return Ok(None),
        ExportKind::Stdout => stdout_sinks[usize::from(*pretty)]
            .get_or_insert_with(|| Arc::new(StdoutSink::new(*pretty)) as Arc<dyn ExportSink>)
            .clone(),
        ExportKind::Jsonl => {
            let path = path.clone().ok_or_else(|| SetupError::MissingExportPath {
                pipeline: settings.name.clone(),
            })?;
            let config = JsonlSinkConfig {
                path: path.clone(),
                append: *append,
                pretty: *pretty,
                flush_each: true,
            };
            let sink = JsonlSink::open(config).map_err(|source| SetupError::OpenSink {
                pipeline: settings.name.clone(),
                path: path.display().to_string(),
                source,
            })?;
            Arc::new(sink)
        }
    };
    Ok(Some(sink))
}
