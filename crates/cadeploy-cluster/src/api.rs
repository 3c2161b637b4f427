//! The orchestrator client boundary.

use async_trait::async_trait;
use cadeploy_render::ResourceKind;
use serde_json::Value;

use crate::error::ClusterResult;

/// Namespaced object operations on the orchestrator.
///
/// Objects travel as JSON; patches are strategic-merge bodies.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create(&self, namespace: &str, kind: ResourceKind, manifest: &Value)
    -> ClusterResult<()>;

    async fn patch(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> ClusterResult<()>;

    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> ClusterResult<()>;

    /// List objects, optionally filtered by a `key=value[,key=value]` label
    /// selector.
    async fn list(
        &self,
        namespace: &str,
        kind: ResourceKind,
        label_selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>>;
}
