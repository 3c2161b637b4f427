//! Deployment identity: `<owner>-<localName>`.
//!
//! The owner never contains `-`, so splitting at the first `-` and joining
//! with `-` are exact inverses.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// Longest id that still leaves room for the `redis-` prefix inside a
/// 63-character DNS label.
pub const MAX_ID_LEN: usize = 57;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*-[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("valid id pattern")
});

static OWNER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*$").expect("valid owner pattern"));

/// Globally unique (per deployer) key of a paired app/cache deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId {
    raw: String,
    owner_len: usize,
}

impl DeploymentId {
    /// Validate and wrap a full `<owner>-<localName>` id.
    pub fn parse(raw: &str) -> Result<Self, InputError> {
        if raw.is_empty() {
            return Err(InputError::EmptyId);
        }
        if raw.len() > MAX_ID_LEN {
            return Err(InputError::IdTooLong {
                id: raw.to_string(),
                len: raw.len(),
                max: MAX_ID_LEN,
            });
        }
        if !ID_PATTERN.is_match(raw) {
            return Err(InputError::MalformedId(raw.to_string()));
        }
        let owner_len = raw.find('-').ok_or_else(|| InputError::MalformedId(raw.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            owner_len,
        })
    }

    /// Join an owner and a CA-local name.
    pub fn new(owner: &str, local_name: &str) -> Result<Self, InputError> {
        if !OWNER_PATTERN.is_match(owner) {
            return Err(InputError::MalformedId(format!("{owner}-{local_name}")));
        }
        Self::parse(&format!("{owner}-{local_name}"))
    }

    pub fn owner(&self) -> &str {
        &self.raw[..self.owner_len]
    }

    pub fn local_name(&self) -> &str {
        &self.raw[self.owner_len + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Name shared by the cache tier's deployment, service and network policy.
    pub fn redis_name(&self) -> String {
        format!("redis-{}", self.raw)
    }

    /// Name of the dedicated volume claim of one cache instance.
    pub fn volume_claim_name(&self, timestamp: &str) -> String {
        format!("redis-{}-{}", self.raw, timestamp)
    }
}

/// Owner part of a CA id (`<owner>-<caLocalName>`).
///
/// Hostnames cannot carry `_`, so it is folded to `-` first.
pub fn owner_of_ca(ca_id: &str) -> Result<String, InputError> {
    let normalized = ca_id.replace('_', "-");
    match normalized.split_once('-') {
        Some((owner, rest)) if OWNER_PATTERN.is_match(owner) && !rest.is_empty() => {
            Ok(owner.to_string())
        }
        _ => Err(InputError::MalformedCaId(ca_id.to_string())),
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for DeploymentId {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.raw
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
