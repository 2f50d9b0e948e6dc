//! Configuration error type.

use std::path::PathBuf;
use thiserror::Error;
use validator::ValidationErrors;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The user named a config file that does not exist. The default path is
    /// allowed to be absent; an explicit one is not.
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// One or more fields failed validation after merging all sources.
    #[error("invalid configuration: {}", flatten(.0))]
    Validation(#[source] ValidationErrors),

    /// TOML or environment-variable parsing failed.
    #[error("configuration parse error: {0}")]
    Parsing(#[from] figment::Error),
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Validation(errors)
    }
}

fn flatten(errors: &ValidationErrors) -> String {
    let mut parts: Vec<String> = errors
        .field_errors()
        .iter()
        .map(|(field, errors)| {
            let reasons: Vec<String> = errors
                .iter()
                .map(|e| match &e.message {
                    Some(msg) => msg.to_string(),
                    None => e.code.to_string(),
                })
                .collect();
            format!("{field} ({})", reasons.join(", "))
        })
        .collect();
    parts.sort();
    parts.join("; ")
}
