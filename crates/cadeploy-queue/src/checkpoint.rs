//! Persisted form of a prepared transaction.
//!
//! Version 1 documents carried one `reply_method` for the whole queue.
//! Version 2 moved it onto each logged action, so actions recorded with
//! different reply methods in one transaction keep them across a resume.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::action::Action;
use crate::error::{QueueError, QueueResult};

pub const CHECKPOINT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedAction {
    pub request_id: Uuid,
    pub action: Action,
    /// CA method that receives the reply; `None` drops it.
    #[serde(default)]
    pub reply_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub ca: String,
    pub actions: Vec<LoggedAction>,
}

#[derive(Deserialize)]
struct CheckpointV1 {
    ca: String,
    #[serde(default)]
    reply_method: Option<String>,
    #[serde(default)]
    actions: Vec<LoggedActionV1>,
}

#[derive(Deserialize)]
struct LoggedActionV1 {
    request_id: Uuid,
    action: Action,
}

impl From<CheckpointV1> for Checkpoint {
    fn from(old: CheckpointV1) -> Self {
        let reply_method = old.reply_method;
        Self {
            version: CHECKPOINT_VERSION,
            ca: old.ca,
            actions: old
                .actions
                .into_iter()
                .map(|a| LoggedAction {
                    request_id: a.request_id,
                    action: a.action,
                    reply_method: reply_method.clone(),
                })
                .collect(),
        }
    }
}

impl Checkpoint {
    pub fn new(ca: impl Into<String>, actions: Vec<LoggedAction>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            ca: ca.into(),
            actions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn encode(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a checkpoint of any supported version. A missing `version`
    /// means version 1.
    pub fn decode(raw: &str) -> QueueResult<Self> {
        let doc: Value = serde_json::from_str(raw)?;
        let version = doc
            .get("version")
            .and_then(Value::as_u64)
            .map_or(1, |v| u32::try_from(v).unwrap_or(u32::MAX));
        match version {
            1 => Ok(serde_json::from_value::<CheckpointV1>(doc)?.into()),
            CHECKPOINT_VERSION => Ok(serde_json::from_value(doc)?),
            found => Err(QueueError::UnsupportedVersion {
                found,
                supported: CHECKPOINT_VERSION,
            }),
        }
    }
}
