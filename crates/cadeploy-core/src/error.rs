//! Error types shared across the cadeploy crates.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Deployer configuration is missing, mistyped, or inconsistent.
///
/// Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Caller input rejected before any cluster I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("deployment id is empty")]
    EmptyId,

    #[error("deployment id `{id}` is {len} characters, max is {max}")]
    IdTooLong { id: String, len: usize, max: usize },

    #[error("malformed deployment id `{0}`: expected <owner>-<localName> in lowercase letters, digits and '-'")]
    MalformedId(String),

    #[error("malformed CA id `{0}`")]
    MalformedCaId(String),

    #[error("invalid image reference `{0}`")]
    InvalidImage(String),

    #[error("unknown plan `{0}`")]
    UnknownPlan(String),

    #[error("invalid environment variable name `{0}`")]
    InvalidEnvName(String),
}

/// The props annotation on a live Deployment could not be decoded.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("props annotation is not base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("props annotation is not valid props JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("props schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}
