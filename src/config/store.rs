use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Store connection parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// etcd client endpoints, e.g. `http://127.0.0.1:2379`
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Maximum time to wait for the initial connection
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Maximum time to wait for a unary request
    /// Default: 5 seconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            username: None,
            password: None,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidConfig("store.endpoints cannot be empty".into()));
        }
        if let Some(bad) = self.endpoints.iter().find(|e| e.trim().is_empty()) {
            return Err(Error::InvalidConfig(format!("store.endpoints contains blank entry {bad:?}")));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig("store timeouts must be > 0".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::InvalidConfig(
                "store.username and store.password must be set together".into(),
            ));
        }
        Ok(())
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
