//! [`ClusterApi`] over a live Kubernetes API server.

use async_trait::async_trait;
use cadeploy_render::ResourceKind;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, info};

use crate::api::ClusterApi;
use crate::error::{ClusterError, ClusterResult};

const FIELD_MANAGER: &str = "cadeploy";

#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the local kubeconfig or from in-cluster
    /// service-account credentials.
    pub async fn connect(use_kube_config: bool) -> ClusterResult<Self> {
        let config = if use_kube_config {
            Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .map_err(|e| ClusterError::Connect(e.to_string()))?
        } else {
            Config::incluster().map_err(|e| ClusterError::Connect(e.to_string()))?
        };
        info!(cluster_url = %config.cluster_url, use_kube_config, "connecting to orchestrator");
        let client = Client::try_from(config).map_err(|e| ClusterError::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn api(&self, namespace: &str, kind: ResourceKind) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn from_kube(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) => ClusterError::Api {
            code: resp.code,
            reason: resp.reason,
            message: resp.message,
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create(
        &self,
        namespace: &str,
        kind: ResourceKind,
        manifest: &Value,
    ) -> ClusterResult<()> {
        let object: DynamicObject = serde_json::from_value(manifest.clone())?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PostParams::default()
        };
        self.api(namespace, kind)
            .create(&params, &object)
            .await
            .map_err(from_kube)?;
        debug!(%namespace, %kind, name = ?object.metadata.name, "created");
        Ok(())
    }

    async fn patch(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
        patch: &Value,
    ) -> ClusterResult<()> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        self.api(namespace, kind)
            .patch(name, &params, &Patch::Strategic(patch))
            .await
            .map_err(from_kube)?;
        debug!(%namespace, %kind, %name, "patched");
        Ok(())
    }

    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> ClusterResult<()> {
        self.api(namespace, kind)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(from_kube)?;
        debug!(%namespace, %kind, %name, "deleted");
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        kind: ResourceKind,
        label_selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .api(namespace, kind)
            .list(&params)
            .await
            .map_err(from_kube)?;
        // List items come back without their own type meta.
        list.items
            .into_iter()
            .map(|mut item| {
                item.types.get_or_insert_with(|| TypeMeta {
                    api_version: kind.api_version(),
                    kind: kind.kind().to_string(),
                });
                serde_json::to_value(item).map_err(ClusterError::from)
            })
            .collect()
    }
}
