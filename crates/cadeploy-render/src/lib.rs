//! cadeploy-render — Kubernetes manifests for the app and cache tiers.
//!
//! Manifests come from askama templates in `templates/`, compiled into the
//! crate. Every string substituted into a template is pre-quoted as a JSON
//! string, which is also a valid YAML scalar, so user-supplied values can
//! never break the document structure. The rendered multi-document stream
//! is parsed back into `serde_json::Value`s keyed by `kind`.
//!
//! [`patches`] builds the strategic-merge bodies used for in-place updates.

pub mod error;
pub mod manifests;
pub mod patches;

pub use error::{RenderError, RenderResult};
pub use manifests::{AppManifests, RedisManifests, ResourceKind, render_app, render_redis};
