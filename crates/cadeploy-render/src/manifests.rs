//! Full-object manifests for create.

use std::collections::BTreeMap;
use std::fmt;

use askama::Template;
use cadeploy_core::config::SharedStorage;
use cadeploy_core::{AppProps, EnvVar, RedisProps};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{RenderError, RenderResult};

/// Port the app process listens on.
pub const APP_PORT: u16 = 3000;

/// Port of the cache service.
pub const REDIS_PORT: u16 = 6379;

/// Egress untrusted apps may never reach.
const PRIVATE_RANGES: [&str; 4] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];

/// Object kinds the deployer creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    NetworkPolicy,
    PersistentVolumeClaim,
    Service,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::NetworkPolicy,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::Service,
        ResourceKind::Deployment,
    ];

    pub fn kind(self) -> &'static str {
        match self {
            ResourceKind::NetworkPolicy => "NetworkPolicy",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Service => "Service",
            ResourceKind::Deployment => "Deployment",
        }
    }

    /// API group; empty for the core group.
    pub fn group(self) -> &'static str {
        match self {
            ResourceKind::NetworkPolicy => "networking.k8s.io",
            ResourceKind::PersistentVolumeClaim | ResourceKind::Service => "",
            ResourceKind::Deployment => "apps",
        }
    }

    pub fn version(self) -> &'static str {
        "v1"
    }

    /// `apiVersion` as written in manifests.
    pub fn api_version(self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            group => format!("{group}/{}", self.version()),
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::NetworkPolicy => "networkpolicies",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ResourceKind::Service => "services",
            ResourceKind::Deployment => "deployments",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind() == kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppManifests {
    pub network_policy: Value,
    pub service: Value,
    pub deployment: Value,
}

impl AppManifests {
    pub fn in_apply_order(&self) -> Vec<(ResourceKind, &Value)> {
        vec![
            (ResourceKind::NetworkPolicy, &self.network_policy),
            (ResourceKind::Service, &self.service),
            (ResourceKind::Deployment, &self.deployment),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedisManifests {
    pub network_policy: Value,
    /// Present only for a dedicated volume.
    pub volume_claim: Option<Value>,
    pub service: Value,
    pub deployment: Value,
}

impl RedisManifests {
    pub fn in_apply_order(&self) -> Vec<(ResourceKind, &Value)> {
        let mut order = vec![(ResourceKind::NetworkPolicy, &self.network_policy)];
        if let Some(claim) = &self.volume_claim {
            order.push((ResourceKind::PersistentVolumeClaim, claim));
        }
        order.push((ResourceKind::Service, &self.service));
        order.push((ResourceKind::Deployment, &self.deployment));
        order
    }
}

// ── Templates ───────────────────────────────────────────────────

#[derive(Template)]
#[template(path = "app.yaml", escape = "none")]
struct AppTemplate {
    name: String,
    namespace: String,
    redis_namespace: String,
    publisher: String,
    host: String,
    props: String,
    instances: u32,
    touch: String,
    egress: String,
    is_gvisor: bool,
    pool_key: String,
    pool_value: String,
    image: String,
    args: String,
    env: String,
    app_port: u16,
    private_ranges: String,
    cpu: String,
    cpu_limit: String,
    memory: String,
    memory_limit: String,
    storage: String,
    storage_limit: String,
}

#[derive(Template)]
#[template(path = "redis.yaml", escape = "none")]
struct RedisTemplate {
    id: String,
    name: String,
    namespace: String,
    timestamp: String,
    claim_name: String,
    is_dedicated_volume: bool,
    volume_size: String,
    is_gvisor: bool,
    pool_key: String,
    pool_value: String,
    image: String,
    cpu: String,
    cpu_limit: String,
    memory: String,
    memory_limit: String,
    nfs_server: String,
    nfs_path: String,
}

/// JSON-quote a scalar so it can be dropped into YAML verbatim.
fn q(value: &str) -> RenderResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn millicores(millis: u32) -> String {
    format!("{millis}m")
}

pub fn megabytes(mb: u32) -> String {
    format!("{mb}M")
}

pub fn gigabytes(gb: u32) -> String {
    format!("{gb}Gi")
}

pub fn egress_bandwidth(mbps: u32) -> String {
    format!("{mbps}M")
}

/// In-cluster DNS name of a deployment's cache service.
pub fn redis_host(props: &AppProps) -> String {
    format!(
        "{}.{}.svc.cluster.local",
        props.id.redis_name(),
        props.redis_namespace
    )
}

/// NFS directory of a cache that has no dedicated volume.
pub fn shared_volume_path(props: &RedisProps, storage: &SharedStorage) -> String {
    format!(
        "{}/{}",
        storage.nfs_path.trim_end_matches('/'),
        props.volume_claim_name()
    )
}

/// Process environment: deployment wiring first, caller overrides last.
fn app_env(props: &AppProps) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar::new("APP_PUBLISHER", &props.app_publisher),
        EnvVar::new("APP_LOCAL_NAME", &props.app_local_name),
        EnvVar::new("APP_SUFFIX", &props.app_suffix),
        EnvVar::new("PORT", APP_PORT.to_string()),
        EnvVar::new("REDIS_HOST", redis_host(props)),
        EnvVar::new("REDIS_PORT", REDIS_PORT.to_string()),
        EnvVar::new("IS_UNTRUSTED", props.is_untrusted.to_string()),
        EnvVar::new("IS_INCUBATOR", props.is_incubator.to_string()),
    ];
    if let Some(cdn) = &props.cdn {
        env.push(EnvVar::new("APP_CDN", &cdn.base_url));
        env.push(EnvVar::new("APP_SUBDIR_CDN", &cdn.subdir));
    }
    env.extend(props.env.iter().cloned());
    env
}

/// Render the app tier; `props_annotation` is the encoded props record.
pub fn render_app(props: &AppProps, props_annotation: &str) -> RenderResult<AppManifests> {
    let private_ranges: &[&str] = if props.is_untrusted {
        &PRIVATE_RANGES
    } else {
        &[]
    };

    let template = AppTemplate {
        name: q(props.id.as_str())?,
        namespace: q(&props.namespace)?,
        redis_namespace: q(&props.redis_namespace)?,
        publisher: q(&props.app_publisher)?,
        host: q(&props.host())?,
        props: q(props_annotation)?,
        instances: props.instances,
        touch: q(&props.touch)?,
        egress: q(&egress_bandwidth(props.egress_limit_mbps))?,
        is_gvisor: props.is_gvisor,
        pool_key: q(&props.pool_key)?,
        pool_value: q(&props.pool_value)?,
        image: q(&props.image)?,
        args: serde_json::to_string(&props.args)?,
        env: serde_json::to_string(&app_env(props))?,
        app_port: APP_PORT,
        private_ranges: serde_json::to_string(private_ranges)?,
        cpu: q(&millicores(props.cpu_millis))?,
        cpu_limit: q(&millicores(props.cpu_limit_millis))?,
        memory: q(&megabytes(props.memory_mb))?,
        memory_limit: q(&megabytes(props.memory_limit_mb))?,
        storage: q(&megabytes(props.storage_mb))?,
        storage_limit: q(&megabytes(props.storage_limit_mb))?,
    };

    let mut docs = parse_stream(&template.render()?)?;
    Ok(AppManifests {
        network_policy: take(&mut docs, ResourceKind::NetworkPolicy)?,
        service: take(&mut docs, ResourceKind::Service)?,
        deployment: take(&mut docs, ResourceKind::Deployment)?,
    })
}

/// Render the cache tier.
pub fn render_redis(props: &RedisProps, storage: &SharedStorage) -> RenderResult<RedisManifests> {
    let template = RedisTemplate {
        id: q(props.id.as_str())?,
        name: q(&props.name())?,
        namespace: q(&props.namespace)?,
        timestamp: q(&props.timestamp)?,
        claim_name: q(&props.volume_claim_name())?,
        is_dedicated_volume: props.is_dedicated_volume,
        volume_size: q(&gigabytes(props.dedicated_volume_size_gb))?,
        is_gvisor: props.is_gvisor,
        pool_key: q(&props.pool_key)?,
        pool_value: q(&props.pool_value)?,
        image: q(&props.image)?,
        cpu: q(&millicores(props.cpu_millis))?,
        cpu_limit: q(&millicores(props.cpu_limit_millis))?,
        memory: q(&megabytes(props.memory_mb))?,
        memory_limit: q(&megabytes(props.memory_limit_mb))?,
        nfs_server: q(&storage.nfs_server)?,
        nfs_path: q(&shared_volume_path(props, storage))?,
    };

    let mut docs = parse_stream(&template.render()?)?;
    let volume_claim = docs.remove(&ResourceKind::PersistentVolumeClaim);
    Ok(RedisManifests {
        network_policy: take(&mut docs, ResourceKind::NetworkPolicy)?,
        volume_claim,
        service: take(&mut docs, ResourceKind::Service)?,
        deployment: take(&mut docs, ResourceKind::Deployment)?,
    })
}

/// Split a rendered YAML stream into one object per kind.
///
/// Empty documents (left by disabled template blocks) are skipped.
fn parse_stream(yaml: &str) -> RenderResult<BTreeMap<ResourceKind, Value>> {
    let mut docs = BTreeMap::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(RenderError::MissingKind)?;
        let kind =
            ResourceKind::from_kind(kind).ok_or_else(|| RenderError::UnknownKind(kind.to_string()))?;
        if docs.insert(kind, value).is_some() {
            return Err(RenderError::DuplicateKind(kind.kind()));
        }
    }
    Ok(docs)
}

fn take(docs: &mut BTreeMap<ResourceKind, Value>, kind: ResourceKind) -> RenderResult<Value> {
    docs.remove(&kind).ok_or(RenderError::Missing(kind.kind()))
}
