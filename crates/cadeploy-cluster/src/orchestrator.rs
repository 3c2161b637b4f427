//! Deployment-level operations over a [`ClusterApi`].
//!
//! Creates run in dependency order and stop at the first failure. Deletes
//! are best effort: each object is deleted independently, a missing object
//! counts as deleted, and failures are reported per step.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadeploy_core::types::{
    ID_LABEL, PROPS_ANNOTATION, TIER_LABEL, TIMESTAMP_LABEL, TOUCH_ANNOTATION,
};
use cadeploy_core::{
    AppPatch, DeployerConfig, DeploymentId, DeploymentProps, FieldPatch, RedisPatch, StatSnapshot,
};
use cadeploy_render::{ResourceKind, patches, render_app, render_redis};
use k8s_openapi::api::apps::v1::Deployment;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::ClusterApi;
use crate::error::{ClusterError, ClusterResult};

/// Props before and after a change, with the per-tier patches between them.
pub struct Change<'a> {
    pub baseline: &'a DeploymentProps,
    pub props: &'a DeploymentProps,
    pub app: Option<&'a AppPatch>,
    pub redis: Option<&'a RedisPatch>,
    /// `resourceVersion` of the app Deployment `baseline` was read from.
    /// Writes of the props annotation are rejected once it is stale.
    pub resource_version: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
    Failed(String),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteStep {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub outcome: DeleteOutcome,
}

/// Per-object result of a best-effort delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub steps: Vec<DeleteStep>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeleteStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, DeleteOutcome::Failed(_)))
    }

    pub fn extend(&mut self, other: DeleteReport) {
        self.steps.extend(other.steps);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    api: Arc<dyn ClusterApi>,
    config: Arc<DeployerConfig>,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn ClusterApi>, config: Arc<DeployerConfig>) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    /// Bound one orchestrator call by the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = ClusterResult<T>>) -> ClusterResult<T> {
        let limit = self.call_timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ClusterError::Timeout(limit))?
    }

    /// Patch an app Deployment, flagging writes that lost a race.
    async fn patch_app(&self, namespace: &str, name: &str, body: &Value) -> ClusterResult<()> {
        self.bounded(self.api.patch(namespace, ResourceKind::Deployment, name, body))
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(%name, "deployment changed since it was read");
                }
            })
    }

    async fn create_all(&self, namespace: &str, objects: Vec<(ResourceKind, &Value)>) -> ClusterResult<()> {
        for (kind, manifest) in objects {
            match self.bounded(self.api.create(namespace, kind, manifest)).await {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => {
                    debug!(%namespace, %kind, name = %manifest["metadata"]["name"], "already exists");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ── Create ──────────────────────────────────────────────────

    pub async fn create_redis(&self, props: &DeploymentProps) -> ClusterResult<()> {
        let manifests = render_redis(&props.redis, &self.config.redis.shared_storage)?;
        self.create_all(&props.redis.namespace, manifests.in_apply_order()).await?;
        info!(id = %props.id(), dedicated = props.redis.is_dedicated_volume, "cache created");
        Ok(())
    }

    pub async fn create_app_process(&self, props: &DeploymentProps) -> ClusterResult<()> {
        let annotation = props.to_annotation()?;
        let manifests = render_app(&props.app, &annotation)?;
        self.create_all(&props.app.namespace, manifests.in_apply_order()).await?;
        info!(id = %props.id(), instances = props.app.instances, "app created");
        Ok(())
    }

    // ── Update ──────────────────────────────────────────────────

    /// Patch the app Deployment; the patch also records the new props.
    pub async fn update_app_process(&self, change: &Change<'_>) -> ClusterResult<()> {
        let Some(patch) = change.app else {
            return Ok(());
        };
        let annotation = change.props.to_annotation()?;
        let body = patches::app_patch(
            &change.baseline.app,
            patch,
            &annotation,
            change.resource_version,
        );
        let app = &change.props.app;
        self.patch_app(&app.namespace, app.id.as_str(), &body).await?;
        debug!(id = %app.id, fields = ?patch.changed_fields(), "app patched");
        Ok(())
    }

    /// Patch the cache Deployment and grow its claim. With `create_disk` the
    /// dedicated claim is created first.
    pub async fn update_redis(&self, change: &Change<'_>, create_disk: bool) -> ClusterResult<()> {
        let redis = &change.props.redis;

        if create_disk {
            let manifests = render_redis(redis, &self.config.redis.shared_storage)?;
            let claim = manifests.volume_claim.ok_or_else(|| {
                ClusterError::Manifest(format!("{} has no dedicated volume", redis.id))
            })?;
            self.create_all(&redis.namespace, vec![(ResourceKind::PersistentVolumeClaim, &claim)])
                .await?;
        }

        let Some(patch) = change.redis else {
            return Ok(());
        };

        if let Some(body) = patches::redis_patch(&change.baseline.redis, patch) {
            self.bounded(
                self.api
                    .patch(&redis.namespace, ResourceKind::Deployment, &redis.name(), &body),
            )
            .await?;
        }

        if let Some(size) = patch.dedicated_volume_size_gb {
            if change.baseline.redis.is_dedicated_volume {
                let body = patches::volume_resize_patch(size);
                self.bounded(self.api.patch(
                    &redis.namespace,
                    ResourceKind::PersistentVolumeClaim,
                    &redis.volume_claim_name(),
                    &body,
                ))
                .await?;
                info!(id = %redis.id, size_gb = size, "cache volume grown");
            }
        }
        debug!(id = %redis.id, "cache patched");
        Ok(())
    }

    /// Rewrite the props annotation without touching the pods.
    pub async fn record_props(
        &self,
        props: &DeploymentProps,
        resource_version: Option<&str>,
    ) -> ClusterResult<()> {
        let body = patches::props_annotation_patch(&props.to_annotation()?, resource_version);
        self.patch_app(&props.app.namespace, props.id().as_str(), &body)
            .await?;
        debug!(id = %props.id(), plan = %props.plan, number_of_cas = props.number_of_cas, "props recorded");
        Ok(())
    }

    /// Claim, mount, then record: the props only say "dedicated" once the
    /// cache actually uses the claim.
    pub async fn upgrade_to_dedicated_disk(&self, change: &Change<'_>) -> ClusterResult<()> {
        self.update_redis(change, true).await?;
        self.record_props(change.props, change.resource_version).await?;
        info!(id = %change.props.id(), "cache moved to dedicated volume");
        Ok(())
    }

    pub async fn restart_app(&self, id: &DeploymentId, touch: &str) -> ClusterResult<()> {
        let body = patches::restart_patch(touch);
        self.bounded(self.api.patch(
            &self.config.app.namespace,
            ResourceKind::Deployment,
            id.as_str(),
            &body,
        ))
        .await?;
        info!(%id, %touch, "app restarting");
        Ok(())
    }

    // ── Delete ──────────────────────────────────────────────────

    async fn delete_step(&self, namespace: &str, kind: ResourceKind, name: &str) -> DeleteStep {
        let outcome = match self.bounded(self.api.delete(namespace, kind, name)).await {
            Ok(()) => DeleteOutcome::Deleted,
            Err(e) if e.is_not_found() => {
                debug!(%namespace, %kind, %name, "already gone");
                DeleteOutcome::AlreadyGone
            }
            Err(e) => {
                warn!(%namespace, %kind, %name, error = %e, "delete failed");
                DeleteOutcome::Failed(e.to_string())
            }
        };
        DeleteStep {
            namespace: namespace.to_string(),
            kind: kind.kind().to_string(),
            name: name.to_string(),
            outcome,
        }
    }

    pub async fn delete_app_process(&self, id: &DeploymentId) -> DeleteReport {
        let namespace = &self.config.app.namespace;
        let mut report = DeleteReport::default();
        for kind in [ResourceKind::Deployment, ResourceKind::Service, ResourceKind::NetworkPolicy] {
            report.steps.push(self.delete_step(namespace, kind, id.as_str()).await);
        }
        report
    }

    /// Delete the cache tier. Without a timestamp every claim labelled with
    /// the id is removed; `keep_data` leaves claims alone.
    pub async fn delete_redis(
        &self,
        id: &DeploymentId,
        timestamp: Option<&str>,
        keep_data: bool,
    ) -> DeleteReport {
        let namespace = &self.config.redis.namespace;
        let name = id.redis_name();
        let mut report = DeleteReport::default();
        for kind in [ResourceKind::Deployment, ResourceKind::Service, ResourceKind::NetworkPolicy] {
            report.steps.push(self.delete_step(namespace, kind, &name).await);
        }

        if keep_data {
            info!(%id, "keeping cache data");
            report.steps.push(DeleteStep {
                namespace: namespace.to_string(),
                kind: ResourceKind::PersistentVolumeClaim.kind().to_string(),
                name: timestamp.map_or_else(|| format!("{name}-*"), |ts| id.volume_claim_name(ts)),
                outcome: DeleteOutcome::Skipped,
            });
            return report;
        }

        let claims = match timestamp {
            Some(ts) => vec![id.volume_claim_name(ts)],
            None => match self.claims_of(id).await {
                Ok(claims) => claims,
                Err(e) => {
                    warn!(%id, error = %e, "cannot list volume claims");
                    report.steps.push(DeleteStep {
                        namespace: namespace.to_string(),
                        kind: ResourceKind::PersistentVolumeClaim.kind().to_string(),
                        name: format!("{name}-*"),
                        outcome: DeleteOutcome::Failed(e.to_string()),
                    });
                    return report;
                }
            },
        };
        for claim in claims {
            report
                .steps
                .push(self.delete_step(namespace, ResourceKind::PersistentVolumeClaim, &claim).await);
        }
        report
    }

    async fn claims_of(&self, id: &DeploymentId) -> ClusterResult<Vec<String>> {
        let selector = format!("{ID_LABEL}={id}");
        let claims = self
            .bounded(self.api.list(
                &self.config.redis.namespace,
                ResourceKind::PersistentVolumeClaim,
                Some(&selector),
            ))
            .await?;
        Ok(claims
            .iter()
            .filter_map(|c| c["metadata"]["name"].as_str().map(str::to_string))
            .collect())
    }

    /// Timestamp of a cache Deployment left behind by an earlier, partial
    /// create of `id`.
    pub async fn cache_timestamp(&self, id: &DeploymentId) -> ClusterResult<Option<String>> {
        let selector = format!("{ID_LABEL}={id},{TIER_LABEL}=redis");
        let caches = self
            .bounded(self.api.list(
                &self.config.redis.namespace,
                ResourceKind::Deployment,
                Some(&selector),
            ))
            .await?;
        Ok(caches
            .iter()
            .find_map(|c| c["metadata"]["labels"][TIMESTAMP_LABEL].as_str().map(str::to_string)))
    }

    // ── Stat ────────────────────────────────────────────────────

    /// Observe every app Deployment in the app namespace.
    pub async fn stat_all(&self) -> ClusterResult<Vec<StatSnapshot>> {
        let selector = format!("{TIER_LABEL}=app");
        let objects = self
            .bounded(self.api.list(
                &self.config.app.namespace,
                ResourceKind::Deployment,
                Some(&selector),
            ))
            .await?;
        Ok(objects.into_iter().filter_map(snapshot).collect())
    }
}

/// Extract `{id, tasks_running, props, version}` from a Deployment.
fn snapshot(object: Value) -> Option<StatSnapshot> {
    let deployment: Deployment = match serde_json::from_value(object) {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "skipping undecodable deployment");
            return None;
        }
    };
    let Some(id) = deployment.metadata.name.clone() else {
        debug!("skipping deployment without a name");
        return None;
    };

    let tasks_running = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .map_or(0, |n| n.max(0) as u32);

    let props = deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROPS_ANNOTATION))
        .and_then(|encoded| match DeploymentProps::from_annotation(encoded) {
            Ok(props) => Some(props),
            Err(e) => {
                debug!(%id, error = %e, "ignoring undecodable props");
                None
            }
        });

    let version = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(TOUCH_ANNOTATION))
        .cloned();

    let resource_version = deployment.metadata.resource_version.clone();

    Some(StatSnapshot {
        id,
        tasks_running,
        props,
        version,
        resource_version,
    })
}
