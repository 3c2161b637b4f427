//! Props construction for create, update, image change and disk upgrade.

use cadeploy_core::types::PROPS_VERSION;
use cadeploy_core::{
    AppPatch, AppProps, ChangeImageOptions, Changeable, CreateOptions, DeployerConfig,
    DeploymentProps, FieldPatch, InputError, RedisPatch, RedisProps, UpdateOptions,
};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::error::{PropsError, PropsResult};
use crate::scaling::{Resources, apply_app_tier, apply_redis_tier, compute_resources, tier_index};

/// Result of a props computation: the new record plus the per-tier patches
/// that take the cluster from `baseline` to `props`.
#[derive(Debug, Clone, PartialEq)]
pub struct PropsUpdate {
    pub baseline: DeploymentProps,
    pub props: DeploymentProps,
    pub app: Option<AppPatch>,
    pub redis: Option<RedisPatch>,
}

impl PropsUpdate {
    pub fn has_patches(&self) -> bool {
        self.app.is_some() || self.redis.is_some()
    }

    /// Only `plan` or `number_of_cas` moved.
    pub fn is_record_only(&self) -> bool {
        !self.has_patches()
            && (self.baseline.plan != self.props.plan
                || self.baseline.number_of_cas != self.props.number_of_cas)
    }

    pub fn is_unchanged(&self) -> bool {
        !self.has_patches() && !self.is_record_only()
    }

    /// The cache volume grows with this update.
    pub fn grows_volume(&self) -> bool {
        self.redis
            .as_ref()
            .and_then(|p| p.dedicated_volume_size_gb)
            .is_some()
            && self.baseline.redis.is_dedicated_volume
    }
}

/// Initial props of a new deployment.
///
/// New untrusted deployments start incubating. The cache timestamp is the
/// caller's, or `now` in milliseconds.
pub fn create_props(
    opts: &CreateOptions,
    config: &DeployerConfig,
    now: DateTime<Utc>,
) -> PropsResult<DeploymentProps> {
    opts.validate()?;
    if config.plan_capacity(&opts.plan).is_none() {
        return Err(InputError::UnknownPlan(opts.plan.clone()).into());
    }

    let is_incubator = opts.is_untrusted;
    let tier = tier_index(opts.is_untrusted, is_incubator);
    let id = opts.id.clone();

    let mut app = AppProps {
        id: id.clone(),
        namespace: config.app.namespace.clone(),
        redis_namespace: config.redis.namespace.clone(),
        app_publisher: id.owner().to_string(),
        app_local_name: id.local_name().to_string(),
        app_suffix: config.app.app_suffix.clone(),
        instances: 1,
        cpu_millis: 0,
        cpu_limit_millis: 0,
        memory_mb: 0,
        memory_limit_mb: 0,
        storage_mb: 0,
        storage_limit_mb: 0,
        egress_limit_mbps: 0,
        pool_key: String::new(),
        pool_value: String::new(),
        is_gvisor: false,
        is_incubator,
        is_untrusted: opts.is_untrusted,
        image: opts.image.clone(),
        cdn: opts.cdn.clone(),
        env: opts.env.clone(),
        args: config.app.args.clone(),
        touch: touch_stamp(now),
    };
    apply_app_tier(&mut app, tier, config);

    let mut redis = RedisProps {
        id,
        namespace: config.redis.namespace.clone(),
        image: config.redis.image.clone(),
        cpu_millis: 0,
        cpu_limit_millis: 0,
        memory_mb: 0,
        memory_limit_mb: 0,
        pool_key: String::new(),
        pool_value: String::new(),
        is_gvisor: false,
        timestamp: opts
            .timestamp
            .clone()
            .unwrap_or_else(|| now.timestamp_millis().to_string()),
        is_dedicated_volume: config.redis.dedicated_volumes && !is_incubator,
        dedicated_volume_size_gb: config.redis.dedicated_volume_size,
        is_untrusted: opts.is_untrusted,
    };
    apply_redis_tier(&mut redis, tier, 0, config);

    Ok(DeploymentProps {
        version: PROPS_VERSION,
        plan: opts.plan.clone(),
        number_of_cas: 0,
        app,
        redis,
    })
}

/// Rescale `current` for the load and plan in `opts`.
pub fn update_props(
    opts: &UpdateOptions,
    current: &DeploymentProps,
    config: &DeployerConfig,
) -> PropsResult<PropsUpdate> {
    let target = compute_resources(current, &opts.plan, opts.number_of_cas, config)?;
    let (app, redis) = delta_resources(current, &target);
    let props = gen_props(current, &opts.plan, opts.number_of_cas, app.as_ref(), redis.as_ref());
    Ok(PropsUpdate {
        baseline: current.clone(),
        props,
        app,
        redis,
    })
}

/// Diff `current` against `target`, dropping empty sub-patches.
///
/// A dedicated volume never shrinks: a smaller computed size is removed
/// from the patch.
pub fn delta_resources(
    current: &DeploymentProps,
    target: &Resources,
) -> (Option<AppPatch>, Option<RedisPatch>) {
    let app = current.app.diff(&target.app);
    let redis = current.redis.diff(&target.redis).and_then(|mut patch| {
        if let Some(size) = patch.dedicated_volume_size_gb {
            if size < current.redis.dedicated_volume_size_gb {
                warn!(
                    id = %current.redis.id,
                    current = current.redis.dedicated_volume_size_gb,
                    computed = size,
                    "ignoring volume shrink"
                );
                patch.dedicated_volume_size_gb = None;
            }
        }
        (!patch.is_empty()).then_some(patch)
    });
    (app, redis)
}

/// Overlay the patches on a copy of `current`.
pub fn gen_props(
    current: &DeploymentProps,
    plan: &str,
    number_of_cas: u32,
    app: Option<&AppPatch>,
    redis: Option<&RedisPatch>,
) -> DeploymentProps {
    let mut props = current.clone();
    props.version = PROPS_VERSION;
    props.plan = plan.to_string();
    props.number_of_cas = number_of_cas;
    if let Some(patch) = app {
        props.app.apply(patch);
    }
    if let Some(patch) = redis {
        props.redis.apply(patch);
    }
    props
}

/// Swap the app image; `touch` is bumped so the pods always roll.
pub fn change_image_props(
    opts: &ChangeImageOptions,
    current: &DeploymentProps,
    now: DateTime<Utc>,
) -> PropsResult<PropsUpdate> {
    cadeploy_core::types::validate_image(&opts.image)?;
    let patch = AppPatch {
        image: Some(opts.image.clone()),
        touch: Some(touch_stamp(now)),
        ..AppPatch::default()
    };
    let props = gen_props(
        current,
        &current.plan,
        current.number_of_cas,
        Some(&patch),
        None,
    );
    Ok(PropsUpdate {
        baseline: current.clone(),
        props,
        app: Some(patch),
        redis: None,
    })
}

/// Move the cache from the shared volume to a dedicated one.
pub fn dedicated_disk_props(
    current: &DeploymentProps,
    config: &DeployerConfig,
) -> PropsResult<PropsUpdate> {
    if current.redis.is_dedicated_volume {
        return Err(PropsError::AlreadyDedicated(current.id().to_string()));
    }
    if !config.redis.dedicated_volumes {
        return Err(PropsError::DedicatedVolumesDisabled);
    }

    let patch = RedisPatch {
        is_dedicated_volume: Some(true),
        dedicated_volume_size_gb: Some(
            current
                .redis
                .dedicated_volume_size_gb
                .max(config.redis.dedicated_volume_size),
        ),
        ..RedisPatch::default()
    };
    let props = gen_props(
        current,
        &current.plan,
        current.number_of_cas,
        None,
        Some(&patch),
    );
    Ok(PropsUpdate {
        baseline: current.clone(),
        props,
        app: None,
        redis: Some(patch),
    })
}

/// ISO-8601 timestamp used for the pod-template touch annotation.
pub fn touch_stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadeploy_core::{DeploymentId, Tier};
    use chrono::TimeZone;

    fn config() -> DeployerConfig {
        DeployerConfig::scaffold("apps", "caches")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn create(is_untrusted: bool) -> DeploymentProps {
        let id = DeploymentId::parse("alice-foo").unwrap();
        let opts = CreateOptions::new(id, "app:1", is_untrusted, "bronze");
        create_props(&opts, &config(), now()).unwrap()
    }

    fn update(plan: &str, n: u32) -> UpdateOptions {
        UpdateOptions {
            id: DeploymentId::parse("alice-foo").unwrap(),
            plan: plan.to_string(),
            number_of_cas: n,
            current_props: None,
        }
    }

    #[test]
    fn create_untrusted_starts_incubating() {
        let cfg = config();
        let props = create(true);
        assert!(props.app.is_incubator);
        assert!(!props.redis.is_dedicated_volume);
        assert_eq!(props.app.instances, 1);
        assert_eq!(props.number_of_cas, 0);
        assert_eq!(props.app.cpu_millis, cfg.app.request.cpu_millis(Tier::Incubating));
        assert_eq!(props.redis.timestamp, now().timestamp_millis().to_string());
        assert_eq!(props.app.touch, "2024-01-01T00:00:00.000Z");
        assert_eq!(props.app.app_publisher, "alice");
        assert_eq!(props.app.app_local_name, "foo");
    }

    #[test]
    fn create_trusted_gets_dedicated_volume() {
        let props = create(false);
        assert!(!props.app.is_incubator);
        assert!(props.redis.is_dedicated_volume);
        assert_eq!(props.app.pool_value, "trusted-pool");
    }

    #[test]
    fn create_keeps_supplied_timestamp() {
        let id = DeploymentId::parse("alice-foo").unwrap();
        let mut opts = CreateOptions::new(id, "app:1", false, "bronze");
        opts.timestamp = Some("42".to_string());
        let props = create_props(&opts, &config(), now()).unwrap();
        assert_eq!(props.redis.timestamp, "42");
    }

    #[test]
    fn create_rejects_unknown_plan() {
        let id = DeploymentId::parse("alice-foo").unwrap();
        let opts = CreateOptions::new(id, "app:1", false, "platinum");
        assert!(matches!(
            create_props(&opts, &config(), now()),
            Err(PropsError::Input(InputError::UnknownPlan(_)))
        ));
    }

    #[test]
    fn unchanged_load_yields_no_patch() {
        let current = create(false);
        let up = update_props(&update("bronze", 0), &current, &config()).unwrap();
        assert!(up.app.is_none());
        assert!(up.redis.is_none());
        assert!(up.is_unchanged());
        assert_eq!(up.props, current);
    }

    #[test]
    fn load_change_within_instance_is_record_only() {
        let current = create(false);
        let up = update_props(&update("bronze", 3), &current, &config()).unwrap();
        assert!(up.is_record_only());
        assert_eq!(up.props.number_of_cas, 3);
    }

    #[test]
    fn scale_out_patches_app_only_until_redis_step() {
        let current = create(false);
        let up = update_props(&update("bronze", 5), &current, &config()).unwrap();
        let app = up.app.clone().unwrap();
        assert_eq!(app.instances, Some(2));
        assert_eq!(app.changed_fields(), vec!["instances"]);
        assert!(up.redis.is_none());
        assert_eq!(up.props.app.instances, 2);
    }

    #[test]
    fn volume_grows_with_redis_step() {
        let cfg = config();
        let current = create(false);
        let up = update_props(&update("bronze", 10), &current, &cfg).unwrap();
        let redis = up.redis.clone().unwrap();
        assert_eq!(
            redis.dedicated_volume_size_gb,
            Some(cfg.redis.dedicated_volume_size + cfg.redis.delta_dedicated_volume_size)
        );
        assert!(up.grows_volume());
    }

    #[test]
    fn volume_never_shrinks() {
        let cfg = config();
        let mut current = create(false);
        current.redis.dedicated_volume_size_gb = 100;
        let up = update_props(&update("bronze", 0), &current, &cfg).unwrap();
        assert!(up.redis.is_none(), "{:?}", up.redis);
        assert_eq!(up.props.redis.dedicated_volume_size_gb, 100);
    }

    #[test]
    fn incubation_exit_is_one_way() {
        let cfg = config();
        let current = create(true);
        let promoted = update_props(&update("bronze", 3), &current, &cfg).unwrap();
        assert_eq!(promoted.app.as_ref().unwrap().is_incubator, Some(false));
        assert!(!promoted.props.app.is_incubator);

        // dropping the load afterwards does not re-enter incubation
        let back = update_props(&update("bronze", 0), &promoted.props, &cfg).unwrap();
        assert!(!back.props.app.is_incubator);
    }

    #[test]
    fn change_image_touches_only_image() {
        let current = create(false);
        let opts = ChangeImageOptions {
            id: current.id().clone(),
            image: "app:2".to_string(),
            current_props: None,
        };
        let later = now() + chrono::Duration::seconds(5);
        let up = change_image_props(&opts, &current, later).unwrap();
        let app = up.app.clone().unwrap();
        assert_eq!(app.changed_fields(), vec!["image", "touch"]);
        assert_eq!(up.props.plan, current.plan);
        assert_eq!(up.props.number_of_cas, current.number_of_cas);
        assert_eq!(up.props.app.image, "app:2");
        assert!(up.redis.is_none());
    }

    #[test]
    fn change_image_validates() {
        let current = create(false);
        let opts = ChangeImageOptions {
            id: current.id().clone(),
            image: "not an image".to_string(),
            current_props: None,
        };
        assert!(change_image_props(&opts, &current, now()).is_err());
    }

    #[test]
    fn dedicated_disk_upgrade_once() {
        let cfg = config();
        let current = create(true);
        let up = dedicated_disk_props(&current, &cfg).unwrap();
        assert!(up.props.redis.is_dedicated_volume);
        assert_eq!(up.redis.as_ref().unwrap().is_dedicated_volume, Some(true));

        assert_eq!(
            dedicated_disk_props(&up.props, &cfg),
            Err(PropsError::AlreadyDedicated("alice-foo".to_string()))
        );
    }

    #[test]
    fn dedicated_disk_requires_feature() {
        let mut cfg = config();
        cfg.redis.dedicated_volumes = false;
        assert_eq!(
            dedicated_disk_props(&create(true), &cfg),
            Err(PropsError::DedicatedVolumesDisabled)
        );
    }
}
