//! Configuration management for the notification client.
//!
//! Values are merged from multiple sources, later sources win:
//! 1. Default values (hardcoded)
//! 2. Config file named by `CONFIG_PATH` (or passed to [`NotifyConfig::with_override_config`])
//! 3. Environment variables prefixed with `NOTIFY__`, e.g. `NOTIFY__STORE__ENDPOINTS`

mod checkpoint;
mod retry;
mod store;
mod watch;
pub use checkpoint::*;
pub use retry::*;
pub use store::*;
pub use watch::*;


//---
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

pub(crate) const ENV_PREFIX: &str = "NOTIFY";
pub(crate) const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotifyConfig {
    /// Namespace root shared by every producer and consumer of one deployment
    #[serde(default = "default_root")]
    pub root: String,
    /// Store connection parameters
    #[serde(default)]
    pub store: StoreConfig,
    /// Revision checkpoint behaviour
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Watch dispatcher behaviour
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            store: StoreConfig::default(),
            checkpoint: CheckpointConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("store.endpoints")
}

impl NotifyConfig {
    /// Builds the configuration from defaults, the optional `CONFIG_PATH`
    /// file and `NOTIFY__*` environment variables.
    ///
    /// Not validated; call [`validate()`](Self::validate) once all overrides
    /// are applied.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies overrides from `path`, then the latest environment variables.
    ///
    /// # Example
    /// ```ignore
    /// let cfg = NotifyConfig::new()?
    ///     .with_override_config("notify.toml")?
    ///     .validate()?;
    /// ```
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance
    pub fn validate(self) -> Result<Self> {
        if self.root.is_empty() {
            return Err(Error::InvalidConfig("root cannot be empty".into()));
        }
        if self.root.ends_with('/') {
            return Err(Error::InvalidConfig(format!(
                "root {:?} must not end with '/'",
                self.root
            )));
        }
        self.store.validate()?;
        self.checkpoint.validate()?;
        self.watch.validate()?;
        Ok(self)
    }
}

fn default_root() -> String {
    "notify".to_string()
}
