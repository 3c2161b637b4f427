//! cadeploy-core — shared types for the cadeploy workspace.
//!
//! Holds the validated deployer configuration (resource vectors per trust
//! tier, node pools, scaling ratios), the deployment identity, and the
//! versioned `DeploymentProps` record that is persisted as an annotation on
//! the live app-tier Deployment.
//!
//! # Tiers
//!
//! Every resource vector in the configuration has exactly three entries:
//!
//! | index | tier |
//! |---|---|
//! | 0 | trusted |
//! | 1 | untrusted, incubating |
//! | 2 | untrusted, stable |

pub mod config;
pub mod error;
pub mod id;
pub mod patch;
pub mod types;

pub use config::{DeployerConfig, Tier};
pub use error::{AnnotationError, ConfigError, ConfigResult, InputError};
pub use id::DeploymentId;
pub use patch::{AppPatch, Changeable, FieldPatch, RedisPatch};
pub use types::*;
