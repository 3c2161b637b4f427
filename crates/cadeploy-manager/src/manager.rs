//! The deployment manager.
//!
//! Every mutating call refreshes the status cache first and decides from
//! what the cluster reports, never from what this process last wrote.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cadeploy_cluster::{Change, ClusterApi, DeleteReport, Orchestrator};
use cadeploy_core::{
    ChangeImageOptions, CreateOptions, DeployerConfig, DeploymentId, DeploymentProps,
    DeleteOptions, FieldPatch, InputError, StatSnapshot, UpdateOptions,
};
use cadeploy_props::{
    PropsUpdate, change_image_props, create_props, dedicated_disk_props, touch_stamp, update_props,
};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, ManagerResult};

/// Snapshot of every observed deployment, keyed by id.
pub type AppsStatus = Arc<BTreeMap<String, StatSnapshot>>;

/// What `update_app` did to the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub props: DeploymentProps,
    /// The cache was moved to a dedicated volume first.
    pub dedicated_disk: bool,
    pub applied: Applied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Nothing differed.
    Unchanged,
    /// Only the props annotation was rewritten.
    Recorded,
    Patched {
        app: Vec<&'static str>,
        redis: Vec<&'static str>,
    },
}

fn change_of<'a>(update: &'a PropsUpdate, resource_version: Option<&'a str>) -> Change<'a> {
    Change {
        baseline: &update.baseline,
        props: &update.props,
        app: update.app.as_ref(),
        redis: update.redis.as_ref(),
        resource_version,
    }
}

/// Props to decide from, with the `resourceVersion` they were listed at.
/// Caller-supplied props carry no version.
struct Observed {
    props: DeploymentProps,
    resource_version: Option<String>,
}

#[derive(Clone)]
pub struct DeploymentManager {
    orchestrator: Orchestrator,
    config: Arc<DeployerConfig>,
    status: Arc<watch::Sender<AppsStatus>>,
}

impl DeploymentManager {
    pub fn new(api: Arc<dyn ClusterApi>, config: Arc<DeployerConfig>) -> Self {
        let (status, _) = watch::channel(AppsStatus::default());
        Self {
            orchestrator: Orchestrator::new(api, config.clone()),
            config,
            status: Arc::new(status),
        }
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    /// Receiver that observes every cache replacement.
    pub fn subscribe(&self) -> watch::Receiver<AppsStatus> {
        self.status.subscribe()
    }

    /// Current cache contents.
    pub fn apps_status(&self) -> AppsStatus {
        self.status.borrow().clone()
    }

    /// Re-list the cluster and replace the cache wholesale.
    pub async fn refresh(&self) -> ManagerResult<AppsStatus> {
        let snapshots = self.orchestrator.stat_all().await?;
        let map: BTreeMap<String, StatSnapshot> = snapshots
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let status = Arc::new(map);
        self.status.send_replace(status.clone());
        debug!(apps = status.len(), "status refreshed");
        Ok(status)
    }

    fn cached(&self, id: &DeploymentId) -> Option<Observed> {
        let status = self.status.borrow();
        let snapshot = status.get(id.as_str())?;
        Some(Observed {
            props: snapshot.props.clone()?,
            resource_version: snapshot.resource_version.clone(),
        })
    }

    fn cached_props(&self, id: &DeploymentId) -> Option<DeploymentProps> {
        self.cached(id).map(|o| o.props)
    }

    fn current_props(
        &self,
        id: &DeploymentId,
        given: Option<&DeploymentProps>,
    ) -> ManagerResult<Observed> {
        match given {
            Some(props) => Ok(Observed {
                props: props.clone(),
                resource_version: None,
            }),
            None => self
                .cached(id)
                .ok_or_else(|| ManagerError::UnknownDeployment(id.to_string())),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Create both tiers, cache first. An id that already exists is left
    /// untouched.
    pub async fn create_app(&self, opts: &CreateOptions) -> ManagerResult<DeploymentId> {
        opts.validate()?;
        if self.config.plan_capacity(&opts.plan).is_none() {
            return Err(InputError::UnknownPlan(opts.plan.clone()).into());
        }

        let status = self.refresh().await?;
        if status.contains_key(opts.id.as_str()) {
            debug!(id = %opts.id, "already deployed");
            return Ok(opts.id.clone());
        }

        let mut opts = opts.clone();
        if opts.timestamp.is_none() {
            // Resume a half-created deployment on the cache instance it already has.
            opts.timestamp = self.orchestrator.cache_timestamp(&opts.id).await?;
        }
        let props = create_props(&opts, &self.config, Utc::now())?;
        self.orchestrator.create_redis(&props).await?;
        self.orchestrator.create_app_process(&props).await?;
        info!(id = %opts.id, plan = %opts.plan, untrusted = opts.is_untrusted, "deployment created");
        Ok(opts.id.clone())
    }

    /// Rescale for a new plan or load.
    pub async fn update_app(&self, opts: &UpdateOptions) -> ManagerResult<UpdateOutcome> {
        let Some(capacity) = self.config.plan_capacity(&opts.plan) else {
            return Err(InputError::UnknownPlan(opts.plan.clone()).into());
        };
        self.refresh().await?;
        let mut current = self.current_props(&opts.id, opts.current_props.as_ref())?;

        let leaving_incubation = current.props.app.is_incubator
            && f64::from(opts.number_of_cas) > f64::from(capacity) * self.config.incubation_ratio;
        let mut dedicated_disk = false;
        if leaving_incubation
            && !current.props.redis.is_dedicated_volume
            && self.config.redis.dedicated_volumes
        {
            let upgrade = dedicated_disk_props(&current.props, &self.config)?;
            self.orchestrator
                .upgrade_to_dedicated_disk(&change_of(&upgrade, current.resource_version.as_deref()))
                .await?;
            self.refresh().await?;
            current = self.cached(&opts.id).unwrap_or(Observed {
                props: upgrade.props,
                resource_version: None,
            });
            dedicated_disk = true;
        }

        let update = update_props(opts, &current.props, &self.config)?;
        let applied = self
            .apply(&update, current.resource_version.as_deref())
            .await?;
        info!(
            id = %opts.id,
            plan = %opts.plan,
            number_of_cas = opts.number_of_cas,
            instances = update.props.app.instances,
            ?applied,
            "deployment updated"
        );
        Ok(UpdateOutcome {
            props: update.props,
            dedicated_disk,
            applied,
        })
    }

    async fn apply(
        &self,
        update: &PropsUpdate,
        resource_version: Option<&str>,
    ) -> ManagerResult<Applied> {
        if update.is_unchanged() {
            return Ok(Applied::Unchanged);
        }
        let change = change_of(update, resource_version);
        if update.redis.is_some() {
            self.orchestrator.update_redis(&change, false).await?;
        }
        if update.app.is_some() {
            // The app patch carries the props annotation.
            self.orchestrator.update_app_process(&change).await?;
        } else {
            self.orchestrator
                .record_props(&update.props, resource_version)
                .await?;
        }
        if !update.has_patches() {
            return Ok(Applied::Recorded);
        }
        Ok(Applied::Patched {
            app: update.app.as_ref().map(|p| p.changed_fields()).unwrap_or_default(),
            redis: update.redis.as_ref().map(|p| p.changed_fields()).unwrap_or_default(),
        })
    }

    pub async fn change_image(&self, opts: &ChangeImageOptions) -> ManagerResult<DeploymentProps> {
        cadeploy_core::types::validate_image(&opts.image)?;
        self.refresh().await?;
        let current = self.current_props(&opts.id, opts.current_props.as_ref())?;
        let update = change_image_props(opts, &current.props, Utc::now())?;
        self.orchestrator
            .update_app_process(&change_of(&update, current.resource_version.as_deref()))
            .await?;
        info!(id = %opts.id, image = %opts.image, "image changed");
        Ok(update.props)
    }

    /// Delete the app tier, then the cache tier. Both are always attempted.
    pub async fn delete_app(&self, opts: &DeleteOptions) -> ManagerResult<DeleteReport> {
        if let Err(e) = self.refresh().await {
            warn!(id = %opts.id, error = %e, "refresh before delete failed");
        }
        let timestamp = opts
            .timestamp
            .clone()
            .or_else(|| self.cached_props(&opts.id).map(|p| p.redis.timestamp));

        let mut report = self.orchestrator.delete_app_process(&opts.id).await;
        report.extend(
            self.orchestrator
                .delete_redis(&opts.id, timestamp.as_deref(), opts.keep_data)
                .await,
        );
        if report.is_clean() {
            info!(id = %opts.id, keep_data = opts.keep_data, "deployment deleted");
        } else {
            warn!(id = %opts.id, failures = report.failures().count(), "deployment partially deleted");
        }
        Ok(report)
    }

    /// Roll every app pod without changing the props.
    pub async fn restart_app(&self, id: &DeploymentId) -> ManagerResult<()> {
        let status = self.refresh().await?;
        if !status.contains_key(id.as_str()) {
            return Err(ManagerError::UnknownDeployment(id.to_string()));
        }
        self.orchestrator.restart_app(id, &touch_stamp(Utc::now())).await?;
        Ok(())
    }

    pub async fn upgrade_to_dedicated_disk(&self, id: &DeploymentId) -> ManagerResult<DeploymentProps> {
        self.refresh().await?;
        let current = self.current_props(id, None)?;
        let update = dedicated_disk_props(&current.props, &self.config)?;
        self.orchestrator
            .upgrade_to_dedicated_disk(&change_of(&update, current.resource_version.as_deref()))
            .await?;
        Ok(update.props)
    }

    /// Last cached status of `id`. No cluster I/O.
    pub fn stat_app(&self, id: &str) -> Option<StatSnapshot> {
        self.status.borrow().get(id).cloned()
    }

    /// Cached status of each of `ids`, in order, `None` where unknown.
    pub fn stat_apps<S: AsRef<str>>(&self, ids: &[S]) -> Vec<Option<StatSnapshot>> {
        let status = self.status.borrow();
        ids.iter().map(|id| status.get(id.as_ref()).cloned()).collect()
    }

    /// Cached status of every app of `owner`, keyed by local name.
    pub fn apps_of_owner(&self, owner: &str) -> BTreeMap<String, StatSnapshot> {
        let prefix = format!("{owner}-");
        self.status
            .borrow()
            .iter()
            .filter_map(|(id, snapshot)| {
                id.strip_prefix(&prefix)
                    .map(|local| (local.to_string(), snapshot.clone()))
            })
            .collect()
    }

    pub async fn stat_all(&self) -> ManagerResult<AppsStatus> {
        self.refresh().await
    }

    // ── Background refresh ──────────────────────────────────────

    /// Refresh every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?interval, "refresh loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "periodic refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("refresh loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadeploy_cluster::InMemoryCluster;

    fn manager() -> (InMemoryCluster, DeploymentManager) {
        let cluster = InMemoryCluster::new();
        let config = Arc::new(DeployerConfig::scaffold("apps", "caches"));
        (cluster.clone(), DeploymentManager::new(Arc::new(cluster), config))
    }

    #[tokio::test]
    async fn unknown_plan_fails_before_io() {
        let (cluster, mgr) = manager();
        let id = DeploymentId::parse("alice-foo").unwrap();
        let err = mgr
            .create_app(&CreateOptions::new(id, "app:1", false, "platinum"))
            .await
            .unwrap_err();
        assert_eq!(err, ManagerError::Input(InputError::UnknownPlan("platinum".into())));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn update_of_unknown_id() {
        let (_, mgr) = manager();
        let opts = UpdateOptions {
            id: DeploymentId::parse("bob-bar").unwrap(),
            plan: "bronze".to_string(),
            number_of_cas: 3,
            current_props: None,
        };
        let err = mgr.update_app(&opts).await.unwrap_err();
        assert_eq!(err, ManagerError::UnknownDeployment("bob-bar".into()));
    }

    #[tokio::test]
    async fn refresh_replaces_the_whole_map() {
        let (cluster, mgr) = manager();
        let mut rx = mgr.subscribe();
        let id = DeploymentId::parse("alice-foo").unwrap();
        mgr.create_app(&CreateOptions::new(id.clone(), "app:1", false, "bronze"))
            .await
            .unwrap();
        mgr.refresh().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().contains_key("alice-foo"));

        cluster.clear_calls();
        mgr.delete_app(&DeleteOptions {
            id,
            timestamp: None,
            keep_data: false,
        })
        .await
        .unwrap();
        mgr.refresh().await.unwrap();
        assert!(mgr.apps_status().is_empty());
        assert_eq!(mgr.stat_app("alice-foo"), None);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_, mgr) = manager();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.run(Duration::from_millis(10), rx).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn batch_and_owner_views_read_the_cache() {
        let (cluster, mgr) = manager();
        for raw in ["alice-foo", "alice-bar", "alicex-foo"] {
            let id = DeploymentId::parse(raw).unwrap();
            mgr.create_app(&CreateOptions::new(id, "app:1", false, "bronze"))
                .await
                .unwrap();
        }
        mgr.refresh().await.unwrap();
        cluster.clear_calls();

        let batch = mgr.stat_apps(&["alice-bar", "bob-none", "alice-foo"]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].as_ref().map(|s| s.id.as_str()), Some("alice-bar"));
        assert!(batch[1].is_none());
        assert_eq!(batch[2].as_ref().map(|s| s.id.as_str()), Some("alice-foo"));

        let owned = mgr.apps_of_owner("alice");
        assert_eq!(owned.keys().collect::<Vec<_>>(), vec!["bar", "foo"]);
        assert_eq!(owned["foo"].id, "alice-foo");
        assert!(cluster.calls().is_empty());
    }
}
