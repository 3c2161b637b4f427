//! Error types for the deployment manager.

use cadeploy_cluster::ClusterError;
use cadeploy_core::InputError;
use cadeploy_props::PropsError;
use thiserror::Error;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Props(#[from] PropsError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("unknown deployment `{0}`")]
    UnknownDeployment(String),
}

impl ManagerError {
    /// Worth retrying the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cluster(e) if e.is_retryable())
    }
}
