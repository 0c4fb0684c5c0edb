//! Application configuration loaded from TOML
//!
//! Every field has a default, so an empty or partial file is valid:
//!
//! ```toml
//! [session]
//! default_model = "llama3:8b"
//! voice_output_enabled = true
//!
//! [backend]
//! base_url = "http://localhost:8000"
//! ```

use crate::service::BackendConfig;
use crate::session::SessionConfig;
use crate::{ColloquyError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub backend: BackendConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ColloquyError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }
}
