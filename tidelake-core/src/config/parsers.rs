use serde::de::DeserializeOwned;

use crate::AnyResult;

/// Text serialization format accepted by [`RuntimeConfig::from_str`](super::RuntimeConfig::from_str).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

pub(crate) fn parse<T: DeserializeOwned>(format: ConfigFormat, raw: &str) -> AnyResult<T> {
    match format {
        ConfigFormat::Json => Ok(serde_json::from_str(raw)?),
        ConfigFormat::Toml => Ok(toml::from_str(raw)?),
    }
}
