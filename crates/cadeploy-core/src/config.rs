//! Deployer configuration (`cadeploy.toml`) parser.
//!
//! The configuration is loaded once at startup and never mutated. Any
//! missing or mistyped field, any resource vector that does not have
//! exactly three entries, and any inconsistent scaling ratio is a
//! [`ConfigError`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ConfigError, ConfigResult};

/// One value per trust tier, indexed by [`Tier::index`].
pub type Tiered<T> = [T; 3];

/// Trust tier selecting one entry of every [`Tiered`] vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Trusted,
    Incubating,
    Stable,
}

impl Tier {
    pub fn index(self) -> usize {
        match self {
            Tier::Trusted => 0,
            Tier::Incubating => 1,
            Tier::Stable => 2,
        }
    }

    /// Pick this tier's entry out of a three-element vector.
    pub fn select<T>(self, values: &Tiered<T>) -> &T {
        &values[self.index()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeployerConfig {
    /// Period of the background `stat_all` refresh.
    #[serde(
        deserialize_with = "de_duration",
        serialize_with = "ser_duration",
        default = "default_refresh_interval"
    )]
    pub refresh_interval: Duration,
    /// Upper bound on every single orchestrator call.
    #[serde(
        deserialize_with = "de_duration",
        serialize_with = "ser_duration",
        default = "default_call_timeout"
    )]
    pub call_timeout: Duration,
    /// Use the local kubeconfig instead of in-cluster credentials.
    #[serde(default)]
    pub use_kube_config: bool,
    /// An incubating deployment is promoted once
    /// `number_of_cas > plan capacity × incubation_ratio`.
    pub incubation_ratio: f64,
    /// Plan name → number of CAs served by one app instance.
    pub plans: BTreeMap<String, u32>,
    pub app: AppConfig,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub namespace: String,
    /// Common URL suffix for apps, e.g. `cafjs.com`.
    pub app_suffix: String,
    /// Default arguments for the app process.
    #[serde(default)]
    pub args: Vec<String>,
    /// Horizontal scaling cap for untrusted deployments.
    pub max_untrusted_instances: u32,
    pub request: ResourceVector,
    pub limit: ResourceVector,
    pub node_pool: NodePool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub namespace: String,
    pub image: String,
    /// Step cache resources up once every `update_ratio` extra app instances.
    pub update_ratio: u32,
    /// Whether non-incubating caches get an exclusive persistent volume.
    #[serde(default = "default_true")]
    pub dedicated_volumes: bool,
    /// Base size of a dedicated volume in gigabytes.
    pub dedicated_volume_size: u32,
    /// Size increase in gigabytes per resource step.
    #[serde(default)]
    pub delta_dedicated_volume_size: u32,
    pub request: ResourceVector,
    pub limit: ResourceVector,
    pub delta_request: ResourceVector,
    pub delta_limit: ResourceVector,
    pub node_pool: NodePool,
    pub shared_storage: SharedStorage,
}

/// Resource budget per tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceVector {
    /// Virtual cores.
    pub cpus: Tiered<f64>,
    /// Megabytes.
    pub memory: Tiered<u32>,
    /// Ephemeral storage in megabytes (app tier only).
    #[serde(default)]
    pub storage: Tiered<u32>,
    /// Egress bandwidth in megabits per second (app tier only).
    #[serde(default)]
    pub egress: Tiered<u32>,
}

impl ResourceVector {
    /// Cores for `tier`, as Kubernetes millicores.
    pub fn cpu_millis(&self, tier: Tier) -> u32 {
        cores_to_millis(*tier.select(&self.cpus))
    }
}

/// Node-pool placement per tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodePool {
    pub pool_key: Tiered<String>,
    pub pool_value: Tiered<String>,
    /// Run pods under the gVisor sandbox runtime.
    #[serde(default)]
    pub gvisor: Tiered<bool>,
}

/// NFS export backing caches that have no dedicated volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SharedStorage {
    pub nfs_server: String,
    pub nfs_path: String,
}

impl DeployerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: DeployerConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Number of CAs one app instance serves under `plan`.
    pub fn plan_capacity(&self, plan: &str) -> Option<u32> {
        self.plans.get(plan).copied()
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.plans.is_empty() {
            return Err(ConfigError::invalid("plans", "at least one plan is required"));
        }
        for (name, capacity) in &self.plans {
            if *capacity == 0 {
                return Err(ConfigError::invalid(
                    format!("plans.{name}"),
                    "capacity must be greater than 0",
                ));
            }
        }
        if !self.incubation_ratio.is_finite() || self.incubation_ratio <= 0.0 {
            return Err(ConfigError::invalid(
                "incubation_ratio",
                "must be a positive number",
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid("call_timeout", "must be non-zero"));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::invalid("refresh_interval", "must be non-zero"));
        }

        require_non_empty("app.namespace", &self.app.namespace)?;
        require_non_empty("app.app_suffix", &self.app.app_suffix)?;
        if self.app.max_untrusted_instances == 0 {
            return Err(ConfigError::invalid(
                "app.max_untrusted_instances",
                "must be greater than 0",
            ));
        }
        validate_resources("app.request", &self.app.request)?;
        validate_resources("app.limit", &self.app.limit)?;
        validate_pool("app.node_pool", &self.app.node_pool)?;

        require_non_empty("redis.namespace", &self.redis.namespace)?;
        require_non_empty("redis.image", &self.redis.image)?;
        if self.redis.update_ratio == 0 {
            return Err(ConfigError::invalid("redis.update_ratio", "must be greater than 0"));
        }
        if self.redis.dedicated_volumes && self.redis.dedicated_volume_size == 0 {
            return Err(ConfigError::invalid(
                "redis.dedicated_volume_size",
                "must be greater than 0 when dedicated volumes are enabled",
            ));
        }
        validate_resources("redis.request", &self.redis.request)?;
        validate_resources("redis.limit", &self.redis.limit)?;
        validate_resources("redis.delta_request", &self.redis.delta_request)?;
        validate_resources("redis.delta_limit", &self.redis.delta_limit)?;
        validate_pool("redis.node_pool", &self.redis.node_pool)?;
        require_non_empty("redis.shared_storage.nfs_server", &self.redis.shared_storage.nfs_server)?;
        require_non_empty("redis.shared_storage.nfs_path", &self.redis.shared_storage.nfs_path)?;

        Ok(())
    }

    /// Scaffold a complete configuration for the given namespaces.
    pub fn scaffold(app_namespace: &str, redis_namespace: &str) -> Self {
        let pool = |trusted: &str, untrusted: &str| NodePool {
            pool_key: std::array::from_fn(|_| "cloud.google.com/gke-nodepool".to_string()),
            pool_value: [
                trusted.to_string(),
                untrusted.to_string(),
                untrusted.to_string(),
            ],
            gvisor: [false, true, true],
        };

        DeployerConfig {
            refresh_interval: default_refresh_interval(),
            call_timeout: default_call_timeout(),
            use_kube_config: true,
            incubation_ratio: 0.5,
            plans: BTreeMap::from([
                ("bronze".to_string(), 5),
                ("silver".to_string(), 20),
                ("gold".to_string(), 100),
            ]),
            app: AppConfig {
                namespace: app_namespace.to_string(),
                app_suffix: "cafjs.com".to_string(),
                args: Vec::new(),
                max_untrusted_instances: 4,
                request: ResourceVector {
                    cpus: [0.5, 0.1, 0.25],
                    memory: [512, 128, 256],
                    storage: [1024, 256, 512],
                    egress: [100, 10, 50],
                },
                limit: ResourceVector {
                    cpus: [1.0, 0.2, 0.5],
                    memory: [1024, 256, 512],
                    storage: [2048, 512, 1024],
                    egress: [200, 20, 100],
                },
                node_pool: pool("trusted-pool", "untrusted-pool"),
            },
            redis: RedisConfig {
                namespace: redis_namespace.to_string(),
                image: "redis:7-alpine".to_string(),
                update_ratio: 2,
                dedicated_volumes: true,
                dedicated_volume_size: 10,
                delta_dedicated_volume_size: 5,
                request: ResourceVector {
                    cpus: [0.2, 0.05, 0.1],
                    memory: [256, 64, 128],
                    storage: [0; 3],
                    egress: [0; 3],
                },
                limit: ResourceVector {
                    cpus: [0.5, 0.1, 0.25],
                    memory: [512, 128, 256],
                    storage: [0; 3],
                    egress: [0; 3],
                },
                delta_request: ResourceVector {
                    cpus: [0.1, 0.02, 0.05],
                    memory: [128, 32, 64],
                    storage: [0; 3],
                    egress: [0; 3],
                },
                delta_limit: ResourceVector {
                    cpus: [0.2, 0.05, 0.1],
                    memory: [256, 64, 128],
                    storage: [0; 3],
                    egress: [0; 3],
                },
                node_pool: pool("trusted-pool", "untrusted-pool"),
                shared_storage: SharedStorage {
                    nfs_server: "nfs.storage.svc.cluster.local".to_string(),
                    nfs_path: "/exports/redis".to_string(),
                },
            },
        }
    }
}

/// Convert fractional cores to whole millicores.
pub fn cores_to_millis(cores: f64) -> u32 {
    (cores * 1000.0).round() as u32
}

fn require_non_empty(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn validate_resources(field: &str, resources: &ResourceVector) -> ConfigResult<()> {
    if resources.cpus.iter().any(|c| !c.is_finite() || *c < 0.0) {
        return Err(ConfigError::invalid(
            format!("{field}.cpus"),
            "cores must be finite and non-negative",
        ));
    }
    Ok(())
}

fn validate_pool(field: &str, pool: &NodePool) -> ConfigResult<()> {
    for (i, key) in pool.pool_key.iter().enumerate() {
        if key.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("{field}.pool_key[{i}]"),
                "must not be empty",
            ));
        }
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn ser_duration<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffold_round_trips_through_toml() {
        let config = DeployerConfig::scaffold("apps", "caches");
        let text = config.to_toml_string().unwrap();
        let parsed = DeployerConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn tier_selects_vector_entry() {
        let v = [10, 20, 30];
        assert_eq!(*Tier::Trusted.select(&v), 10);
        assert_eq!(*Tier::Incubating.select(&v), 20);
        assert_eq!(*Tier::Stable.select(&v), 30);
    }

    #[test]
    fn wrong_vector_length_is_rejected() {
        let text = toml::to_string(&DeployerConfig::scaffold("apps", "caches"))
            .unwrap()
            .replacen("memory = [512, 128, 256]", "memory = [512, 128]", 1);
        let err = DeployerConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    fn missing_field_is_rejected() {
        let err = DeployerConfig::from_toml_str("incubation_ratio = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_plan_capacity_is_rejected() {
        let mut config = DeployerConfig::scaffold("apps", "caches");
        config.plans.insert("free".to_string(), 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("plans.free"), "{err}");
    }

    #[test]
    fn zero_update_ratio_is_rejected() {
        let mut config = DeployerConfig::scaffold("apps", "caches");
        config.redis.update_ratio = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_duration_is_rejected() {
        let text = toml::to_string(&DeployerConfig::scaffold("apps", "caches"))
            .unwrap()
            .replacen("refresh_interval = \"5s\"", "refresh_interval = \"soon\"", 1);
        assert!(DeployerConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn plan_capacity_lookup() {
        let config = DeployerConfig::scaffold("apps", "caches");
        assert_eq!(config.plan_capacity("bronze"), Some(5));
        assert_eq!(config.plan_capacity("platinum"), None);
    }

    #[test]
    fn cpu_millis_rounds() {
        assert_eq!(cores_to_millis(0.25), 250);
        assert_eq!(cores_to_millis(0.1), 100);
        assert_eq!(cores_to_millis(1.0), 1000);
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadeploy.toml");
        let config = DeployerConfig::scaffold("apps", "caches");
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(DeployerConfig::from_file(&path).unwrap(), config);
    }
}
