//! JSON configuration loading.

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// Load a configuration value from a JSON file.
///
/// Missing fields fall back to the type's serde defaults.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    debug!("loading config from {}", path.display());
    from_json_str(&raw)
}

/// Parse a configuration value from a JSON string.
pub fn from_json_str<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(Error::serialization)
}
