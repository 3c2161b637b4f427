use cadeploy_core::InputError;
use thiserror::Error;

pub type PropsResult<T> = Result<T, PropsError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropsError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("deployment `{0}` already has a dedicated volume")]
    AlreadyDedicated(String),

    #[error("dedicated volumes are disabled in this deployer")]
    DedicatedVolumesDisabled,
}
