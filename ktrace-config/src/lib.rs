//! # ktrace Configuration
//!
//! Process-wide tunables for the trace pipeline: queue bounds, wake-up delays,
//! the synchronous-wait timeout, and the telemetry switches.
//!
//! ## Features
//! - **Layered loading**: defaults, YAML files, then `KTRACE_*` environment variables
//! - **Validation**: every bound is range-checked before a tracer ever sees it
//! - **Plain data**: the loaded values are passed by reference to the tracer, never
//!   kept in ambient globals

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

mod error;
mod queue;
mod telemetry;
mod validation;

pub use error::ConfigError;
pub use queue::QueueConfig;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/ktrace.yaml";
const ENV_PREFIX: &str = "KTRACE_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct KtraceConfig {
    /// Queue and backpressure tunables applied to every sink descriptor.
    #[validate(nested)]
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging and metrics configuration.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl KtraceConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/ktrace.yaml`, if present
    /// 3. `config/<KTRACE_ENV>.yaml` (environment defaults to `production`)
    /// 4. `KTRACE_*` environment variables, `__` separating nested keys
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(KtraceConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        } else {
            debug!("{BASE_FILE} not found, using default configuration");
        }

        let env = std::env::var("KTRACE_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment)
    }

    /// Load configuration from a specific path, still honouring environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment =
            Figment::from(Serialized::defaults(KtraceConfig::default())).merge(Yaml::file(path));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}
