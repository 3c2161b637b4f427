//! cadeploy-props — turns deployment requests into [`DeploymentProps`].
//!
//! Pure functions over the validated [`DeployerConfig`]; no cluster I/O.
//!
//! # Scaling policy
//!
//! ```text
//! capacity = plans[plan]
//!
//! if is_incubator and n > capacity * incubation_ratio:
//!     tier        = tier_index(is_untrusted, false)
//!     instances   = 1
//!     is_incubator = false
//! else:
//!     instances = ceil((n + 1) / capacity)        // >= 1
//!     instances = min(instances, max_untrusted)   // untrusted only
//!
//! k = (instances - 1) / update_ratio
//! redis.x = base.x[tier] + k * delta.x[tier]
//! volume  = base_volume + k * delta_volume        // never shrinks
//! ```
//!
//! [`DeploymentProps`]: cadeploy_core::DeploymentProps
//! [`DeployerConfig`]: cadeploy_core::DeployerConfig

pub mod builder;
pub mod error;
pub mod scaling;

pub use builder::{
    PropsUpdate, change_image_props, create_props, dedicated_disk_props, delta_resources,
    gen_props, touch_stamp, update_props,
};
pub use error::{PropsError, PropsResult};
pub use scaling::{Resources, compute_resources, tier_index};
