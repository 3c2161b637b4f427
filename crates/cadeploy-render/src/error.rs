use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template rendering failed: {0}")]
    Template(#[from] askama::Error),

    #[error("rendered manifest is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rendered document has no `kind`")]
    MissingKind,

    #[error("rendered document has unsupported kind `{0}`")]
    UnknownKind(String),

    #[error("rendered stream has more than one `{0}`")]
    DuplicateKind(&'static str),

    #[error("rendered stream is missing a `{0}`")]
    Missing(&'static str),

    #[error("failed to encode template value: {0}")]
    Encode(#[from] serde_json::Error),
}
