use std::time::Duration;

use cadeploy_render::RenderError;
use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    #[error("orchestrator returned {code} {reason}: {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("orchestrator transport error: {0}")]
    Transport(String),

    #[error("orchestrator call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot connect to orchestrator: {0}")]
    Connect(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),
}

impl ClusterError {
    pub fn api(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.code() == Some(409)
    }

    /// 409 raised by a create whose object is already there.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Api { code: 409, reason, .. } if reason == "AlreadyExists")
    }

    /// Worth repeating unchanged: conflicts, throttling, server errors,
    /// transport failures and timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { code, .. } => *code == 409 || *code == 429 || *code >= 500,
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Connect(_) | Self::Manifest(_) => false,
        }
    }
}

impl From<RenderError> for ClusterError {
    fn from(err: RenderError) -> Self {
        Self::Manifest(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Manifest(err.to_string())
    }
}
