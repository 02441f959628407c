//! Settings error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value failed validation. `field` is the camelCase settings path.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: &'static str },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::InvalidValue { field, reason }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
