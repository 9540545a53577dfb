//! Layered configuration loading.
//!
//! Sources are merged in order, later ones winning:
//! 1. Built-in defaults ([`PipelineConfig::default`])
//! 2. `<config_dir>/base.toml`
//! 3. `<config_dir>/environments/<environment>.toml`
//! 4. `RELAY_` environment variables, `__` separating nested keys
//!    (for example `RELAY_LANES__MESSAGE__CONCURRENCY=8`)
//!
//! Loading is fail-fast: a malformed file or an invalid merged value is an error.

use crate::config::{ConfigResult, ConfigurationError, PipelineConfig};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the configuration directory
pub const CONFIG_DIR_ENV: &str = "RELAY_CONFIG_DIR";

/// Directory used when [`CONFIG_DIR_ENV`] is not set
pub const DEFAULT_CONFIG_DIR: &str = "config/relay";

const ENV_PREFIX: &str = "RELAY";

/// Get current environment from environment variables
pub fn detect_environment() -> String {
    std::env::var("RELAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Loaded, validated configuration plus the environment it was loaded for
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: PipelineConfig,
    environment: String,
    config_dir: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    /// Configuration manager holding built-in defaults
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            environment: detect_environment(),
            config_dir: None,
        }
    }

    /// Load configuration for the detected environment
    ///
    /// An explicitly configured directory must exist; the default directory
    /// is optional and its absence leaves defaults plus environment variables.
    pub fn load() -> ConfigResult<Self> {
        let environment = detect_environment();

        match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) => Self::load_from_directory(dir, &environment),
            Err(_) => {
                let dir = PathBuf::from(DEFAULT_CONFIG_DIR);
                if dir.is_dir() {
                    Self::load_from_directory(dir, &environment)
                } else {
                    debug!(
                        config_dir = DEFAULT_CONFIG_DIR,
                        "Default configuration directory missing, using built-in defaults"
                    );
                    Self::build(None, &environment, Self::env_source())
                }
            }
        }
    }

    /// Load configuration from a directory for a specific environment
    pub fn load_from_directory(dir: impl AsRef<Path>, environment: &str) -> ConfigResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ConfigurationError::ConfigDirNotFound {
                path: dir.to_path_buf(),
            });
        }
        Self::build(Some(dir), environment, Self::env_source())
    }

    /// Load from a directory with an explicit set of override variables
    ///
    /// Keys use the same form as process variables, e.g. `RELAY_DEAD_LETTER__BATCH_SIZE`.
    pub fn load_with_overrides(
        dir: impl AsRef<Path>,
        environment: &str,
        overrides: config::Map<String, String>,
    ) -> ConfigResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ConfigurationError::ConfigDirNotFound {
                path: dir.to_path_buf(),
            });
        }
        Self::build(Some(dir), environment, Self::env_source().source(Some(overrides)))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: PipelineConfig, environment: impl Into<String>) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment: environment.into(),
            config_dir: None,
        })
    }

    fn env_source() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn build(dir: Option<&Path>, environment: &str, env_source: Environment) -> ConfigResult<Self> {
        let defaults = Config::try_from(&PipelineConfig::default())
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(dir) = dir {
            let base = dir.join("base.toml");
            let overlay = dir.join("environments").join(format!("{environment}.toml"));
            debug!(
                base = %base.display(),
                overlay = %overlay.display(),
                "Loading layered configuration files"
            );
            builder = builder
                .add_source(File::new(&base.to_string_lossy(), FileFormat::Toml).required(false))
                .add_source(File::new(&overlay.to_string_lossy(), FileFormat::Toml).required(false));
        }

        let merged = builder
            .add_source(env_source)
            .build()
            .map_err(|e| ConfigurationError::load_error(environment, e))?;

        let config: PipelineConfig = merged.try_deserialize()?;
        config.validate()?;

        info!(
            environment = %environment,
            config_dir = ?dir.map(Path::display).map(|d| d.to_string()),
            "Configuration loaded successfully"
        );

        Ok(Self {
            config,
            environment: environment.to_string(),
            config_dir: dir.map(Path::to_path_buf),
        })
    }

    /// Get reference to the loaded configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get the current environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Directory the configuration was read from, if any
    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
