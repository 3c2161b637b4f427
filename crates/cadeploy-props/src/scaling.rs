//! Tier selection and resource computation.

use cadeploy_core::config::cores_to_millis;
use cadeploy_core::{AppProps, DeployerConfig, DeploymentProps, InputError, RedisProps, Tier};
use tracing::debug;

use crate::error::PropsResult;

/// Pick the resource tier of a deployment.
pub fn tier_index(is_untrusted: bool, is_incubating: bool) -> Tier {
    match (is_untrusted, is_incubating) {
        (false, _) => Tier::Trusted,
        (true, true) => Tier::Incubating,
        (true, false) => Tier::Stable,
    }
}

/// Target values of every changeable field for a given load.
#[derive(Debug, Clone, PartialEq)]
pub struct Resources {
    pub tier: Tier,
    pub app: AppProps,
    pub redis: RedisProps,
}

/// Compute where `current` should be for `number_of_cas` CAs under `plan`.
pub fn compute_resources(
    current: &DeploymentProps,
    plan: &str,
    number_of_cas: u32,
    config: &DeployerConfig,
) -> PropsResult<Resources> {
    let capacity = config
        .plan_capacity(plan)
        .ok_or_else(|| InputError::UnknownPlan(plan.to_string()))?;

    let mut app = current.app.clone();
    let mut redis = current.redis.clone();

    let promote = app.is_incubator
        && f64::from(number_of_cas) > f64::from(capacity) * config.incubation_ratio;

    let tier = if promote {
        debug!(id = %app.id, number_of_cas, capacity, "leaving incubation");
        app.instances = 1;
        app.is_incubator = false;
        tier_index(app.is_untrusted, false)
    } else {
        app.instances = app_instances(number_of_cas, capacity, app.is_untrusted, config);
        tier_index(app.is_untrusted, app.is_incubator)
    };

    apply_app_tier(&mut app, tier, config);

    let step = (app.instances - 1) / config.redis.update_ratio;
    apply_redis_tier(&mut redis, tier, step, config);

    Ok(Resources { tier, app, redis })
}

/// `ceil((n + 1) / capacity)`, at least one, capped for untrusted apps.
fn app_instances(number_of_cas: u32, capacity: u32, is_untrusted: bool, config: &DeployerConfig) -> u32 {
    let wanted = number_of_cas.saturating_add(capacity) / capacity;
    let wanted = wanted.max(1);
    if is_untrusted {
        wanted.min(config.app.max_untrusted_instances)
    } else {
        wanted
    }
}

pub(crate) fn apply_app_tier(app: &mut AppProps, tier: Tier, config: &DeployerConfig) {
    let request = &config.app.request;
    let limit = &config.app.limit;
    let pool = &config.app.node_pool;

    app.cpu_millis = request.cpu_millis(tier);
    app.cpu_limit_millis = limit.cpu_millis(tier);
    app.memory_mb = *tier.select(&request.memory);
    app.memory_limit_mb = *tier.select(&limit.memory);
    app.storage_mb = *tier.select(&request.storage);
    app.storage_limit_mb = *tier.select(&limit.storage);
    app.egress_limit_mbps = *tier.select(&limit.egress);
    app.pool_key = tier.select(&pool.pool_key).clone();
    app.pool_value = tier.select(&pool.pool_value).clone();
    app.is_gvisor = *tier.select(&pool.gvisor);
}

/// Cache resources at `step` increments above the tier's base.
pub(crate) fn apply_redis_tier(redis: &mut RedisProps, tier: Tier, step: u32, config: &DeployerConfig) {
    let rc = &config.redis;
    let i = tier.index();
    let k = f64::from(step);

    redis.cpu_millis = cores_to_millis(rc.request.cpus[i] + k * rc.delta_request.cpus[i]);
    redis.cpu_limit_millis = cores_to_millis(rc.limit.cpus[i] + k * rc.delta_limit.cpus[i]);
    redis.memory_mb = stepped(rc.request.memory[i], step, rc.delta_request.memory[i]);
    redis.memory_limit_mb = stepped(rc.limit.memory[i], step, rc.delta_limit.memory[i]);
    redis.pool_key = rc.node_pool.pool_key[i].clone();
    redis.pool_value = rc.node_pool.pool_value[i].clone();
    redis.is_gvisor = rc.node_pool.gvisor[i];

    // A shared volume has no size of its own.
    if redis.is_dedicated_volume {
        redis.dedicated_volume_size_gb =
            stepped(rc.dedicated_volume_size, step, rc.delta_dedicated_volume_size);
    }
}

/// `base + step × delta`, pinned at `u32::MAX` for huge loads.
fn stepped(base: u32, step: u32, delta: u32) -> u32 {
    base.saturating_add(step.saturating_mul(delta))
}
