//! Deployment props, status snapshots and the option records accepted by the
//! deployment manager.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AnnotationError, InputError};
use crate::id::DeploymentId;

/// Current schema version of [`DeploymentProps`].
pub const PROPS_VERSION: u32 = 2;

/// Annotation on the app Deployment's metadata holding the encoded props.
pub const PROPS_ANNOTATION: &str = "cadeploy.io/props";

/// Pod-template annotation bumped to force a rolling restart.
pub const TOUCH_ANNOTATION: &str = "cadeploy.io/touch";

/// Label carried by every object created for a deployment.
pub const ID_LABEL: &str = "cadeploy.io/id";

/// Label distinguishing the app tier from the cache tier.
pub const TIER_LABEL: &str = "cadeploy.io/tier";

/// Cache instance timestamp, on the cache Deployment.
pub const TIMESTAMP_LABEL: &str = "cadeploy.io/timestamp";

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/:@-]*$").expect("valid image pattern")
});

static ENV_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env pattern"));

/// Authoritative record of a deployment, persisted on the live cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentProps {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub plan: String,
    #[serde(default)]
    pub number_of_cas: u32,
    pub app: AppProps,
    pub redis: RedisProps,
}

impl DeploymentProps {
    pub fn id(&self) -> &DeploymentId {
        &self.app.id
    }

    /// Encode as base64 JSON for the props annotation.
    pub fn to_annotation(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Decode the props annotation.
    ///
    /// Version 1 documents predate `args`, `env` and `cdn`, which then take
    /// their defaults.
    pub fn from_annotation(encoded: &str) -> Result<Self, AnnotationError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        let mut props: DeploymentProps = serde_json::from_slice(&bytes)?;
        if props.version > PROPS_VERSION {
            return Err(AnnotationError::UnsupportedVersion {
                found: props.version,
                supported: PROPS_VERSION,
            });
        }
        props.version = PROPS_VERSION;
        Ok(props)
    }
}

fn legacy_version() -> u32 {
    1
}

/// App-tier properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppProps {
    pub id: DeploymentId,
    pub namespace: String,
    pub redis_namespace: String,
    pub app_publisher: String,
    pub app_local_name: String,
    pub app_suffix: String,
    pub instances: u32,
    pub cpu_millis: u32,
    pub cpu_limit_millis: u32,
    pub memory_mb: u32,
    pub memory_limit_mb: u32,
    pub storage_mb: u32,
    pub storage_limit_mb: u32,
    pub egress_limit_mbps: u32,
    pub pool_key: String,
    pub pool_value: String,
    pub is_gvisor: bool,
    pub is_incubator: bool,
    pub is_untrusted: bool,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn: Option<Cdn>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub args: Vec<String>,
    pub touch: String,
}

impl AppProps {
    /// Public host name of the app.
    pub fn host(&self) -> String {
        format!("{}.{}", self.id, self.app_suffix)
    }
}

/// Cache-tier properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisProps {
    pub id: DeploymentId,
    pub namespace: String,
    pub image: String,
    pub cpu_millis: u32,
    pub cpu_limit_millis: u32,
    pub memory_mb: u32,
    pub memory_limit_mb: u32,
    pub pool_key: String,
    pub pool_value: String,
    pub is_gvisor: bool,
    pub timestamp: String,
    pub is_dedicated_volume: bool,
    pub dedicated_volume_size_gb: u32,
    pub is_untrusted: bool,
}

impl RedisProps {
    pub fn name(&self) -> String {
        self.id.redis_name()
    }

    pub fn volume_claim_name(&self) -> String {
        self.id.volume_claim_name(&self.timestamp)
    }
}

/// Static-content location override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdn {
    pub base_url: String,
    pub subdir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Last observed state of one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub id: String,
    pub tasks_running: u32,
    pub props: Option<DeploymentProps>,
    /// Value of the touch annotation on the pod template.
    pub version: Option<String>,
    /// `metadata.resourceVersion` of the app Deployment when it was listed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    pub id: DeploymentId,
    pub image: String,
    pub is_untrusted: bool,
    pub plan: String,
    /// Cache instance timestamp; generated when absent.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub cdn: Option<Cdn>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl CreateOptions {
    pub fn new(id: DeploymentId, image: impl Into<String>, is_untrusted: bool, plan: impl Into<String>) -> Self {
        Self {
            id,
            image: image.into(),
            is_untrusted,
            plan: plan.into(),
            timestamp: None,
            cdn: None,
            env: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), InputError> {
        validate_image(&self.image)?;
        for var in &self.env {
            validate_env_name(&var.name)?;
        }
        if let Some(ts) = &self.timestamp {
            // The timestamp becomes part of the volume claim name.
            let claim = self.id.volume_claim_name(ts);
            if ts.is_empty() || !ts.chars().all(|c| c.is_ascii_digit()) {
                return Err(InputError::MalformedId(claim));
            }
            if claim.len() > 63 {
                let len = claim.len();
                return Err(InputError::IdTooLong { id: claim, len, max: 63 });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOptions {
    pub id: DeploymentId,
    pub plan: String,
    pub number_of_cas: u32,
    /// Baseline to diff against; the manager's cache is used when absent.
    #[serde(default)]
    pub current_props: Option<DeploymentProps>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeImageOptions {
    pub id: DeploymentId,
    pub image: String,
    #[serde(default)]
    pub current_props: Option<DeploymentProps>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub id: DeploymentId,
    /// Cache instance timestamp, when known.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Leave the dedicated volume claim in place.
    #[serde(default)]
    pub keep_data: bool,
}

pub fn validate_image(image: &str) -> Result<(), InputError> {
    if image.len() > 255 || !IMAGE_PATTERN.is_match(image) {
        return Err(InputError::InvalidImage(image.to_string()));
    }
    Ok(())
}

pub fn validate_env_name(name: &str) -> Result<(), InputError> {
    if !ENV_NAME_PATTERN.is_match(name) {
        return Err(InputError::InvalidEnvName(name.to_string()));
    }
    Ok(())
}
