//! Mutating requests a CA can buffer inside a transaction.

use cadeploy_core::{Cdn, DeploymentId, EnvVar, InputError};
use serde::{Deserialize, Serialize};

/// One buffered request. Names are CA-local; they are qualified with the
/// CA's owner when applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    CreateApp {
        app_local_name: String,
        image: String,
        #[serde(default)]
        is_untrusted: bool,
        plan: String,
        #[serde(default)]
        cdn: Option<Cdn>,
        #[serde(default)]
        env: Vec<EnvVar>,
    },
    DeleteApp {
        app_local_name: String,
        #[serde(default)]
        keep_data: bool,
    },
    RestartApp {
        app_local_name: String,
    },
    FlexApp {
        app_local_name: String,
        plan: String,
        number_of_cas: u32,
    },
    ChangeImage {
        app_local_name: String,
        image: String,
    },
}

impl Action {
    pub fn op(&self) -> &'static str {
        match self {
            Self::CreateApp { .. } => "create_app",
            Self::DeleteApp { .. } => "delete_app",
            Self::RestartApp { .. } => "restart_app",
            Self::FlexApp { .. } => "flex_app",
            Self::ChangeImage { .. } => "change_image",
        }
    }

    pub fn app_local_name(&self) -> &str {
        match self {
            Self::CreateApp { app_local_name, .. }
            | Self::DeleteApp { app_local_name, .. }
            | Self::RestartApp { app_local_name }
            | Self::FlexApp { app_local_name, .. }
            | Self::ChangeImage { app_local_name, .. } => app_local_name,
        }
    }

    /// Deployment id of the target app under `owner`.
    pub fn qualified_id(&self, owner: &str) -> Result<DeploymentId, InputError> {
        qualify(owner, self.app_local_name())
    }
}

/// `<owner>-<name>`; a name that already carries the owner prefix is kept.
pub fn qualify(owner: &str, name: &str) -> Result<DeploymentId, InputError> {
    let prefix = format!("{owner}-");
    match name.strip_prefix(&prefix) {
        Some(local) if !local.is_empty() => DeploymentId::new(owner, local),
        _ => DeploymentId::new(owner, name),
    }
}
