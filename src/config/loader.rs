//! Configuration Loader
//!
//! Environment-aware loading: base TOML file, optional per-environment TOML
//! override, then `CRM_SYNC__*` environment variables on top.

use super::error::{ConfigResult, ConfigurationError};
use super::CrmSyncConfig;
use config::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Base name of the configuration files inside the config directory
pub const CONFIG_FILE_STEM: &str = "crm-sync";
/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "CRM_SYNC";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug)]
pub struct ConfigManager {
    config: CrmSyncConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let process_env: HashMap<String, String> = env::vars().collect();
        Self::load_with_env_source(config_dir, environment, process_env)
    }

    /// Same as [`Self::load_from_directory_with_env`] but reading environment
    /// overrides from `env_vars` instead of the process environment
    pub fn load_with_env_source(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_vars: HashMap<String, String>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let mut config = Self::build(&config_directory, environment, &env_vars)?;

        // DATABASE_URL is honored when no explicit CRM_SYNC__DATABASE__URL is set
        let explicit_url_key = format!("{ENV_PREFIX}{ENV_SEPARATOR}DATABASE{ENV_SEPARATOR}URL");
        if !env_vars.contains_key(&explicit_url_key) {
            if let Some(url) = env_vars.get("DATABASE_URL").filter(|u| !u.is_empty()) {
                config.database.url = url.clone();
            }
        }

        config.validate()?;

        debug!(
            config = %config.sanitized(),
            "Configuration loaded"
        );
        info!(
            environment = environment,
            backend = ?config.datastore.backend,
            crm_base_url = %config.crm.base_url,
            workers = config.processor.worker_count,
            "✅ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: CrmSyncConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: PathBuf::from("config"),
        }))
    }

    fn build(
        config_directory: &Path,
        environment: &str,
        env_vars: &HashMap<String, String>,
    ) -> ConfigResult<CrmSyncConfig> {
        let base = config_directory.join(format!("{CONFIG_FILE_STEM}.toml"));
        let overlay = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.toml"));

        if !base.exists() {
            debug!(path = %base.display(), "Base configuration file not found, using defaults");
        }

        let built = Config::builder()
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(overlay).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("processor.job_types")
                    .source(Some(env_vars.clone())),
            )
            .build()?;

        built
            .try_deserialize::<CrmSyncConfig>()
            .map_err(|e| ConfigurationError::DeserializeError {
                error: e.to_string(),
            })
    }

    pub fn config(&self) -> &CrmSyncConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Current environment: CRM_SYNC_ENV || APP_ENV || "development"
    pub fn detect_environment() -> String {
        env::var("CRM_SYNC_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}
