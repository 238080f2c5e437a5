//! Tracing subscriber setup for the `tracewire` binary

use tracewire_core::config::{LogFormat, SensorSettings};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TARGETS: [&str; 7] = [
    "tracewire",
    "tracewire_sensor",
    "tracewire_core",
    "tracewire_capture",
    "tracewire_decode",
    "tracewire_enrich",
    "tracewire_export",
];

/// Filter used when `RUST_LOG` is unset. Each `-v` raises the level,
/// otherwise the configured level applies.
pub fn default_directive(verbose: u8, settings: &SensorSettings) -> String {
    let level = match verbose {
        0 => settings.log_level.to_lowercase(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    // Dependencies stay at warn below debug
    if level == "trace" || level == "debug" {
        return level;
    }
    let mut directive = "warn".to_string();
    for target in TARGETS {
        directive.push_str(&format!(",{}={}", target, level));
    }
    directive
}

/// Install the global subscriber writing to stderr. `-v` overrides
/// `RUST_LOG`, which overrides the config file.
pub fn init(verbose: u8, settings: &SensorSettings) -> anyhow::Result<()> {
    let directive = default_directive(verbose, settings);
    let filter = if verbose > 0 {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match settings.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}
