//! cadeploy-manager — owns the deployment status cache and sequences the
//! lifecycle of paired app/cache deployments.
//!
//! # Update ordering
//!
//! ```text
//! refresh
//! if incubating and crossing the threshold and not dedicated:
//!     claim -> mount -> record, refresh, re-read baseline
//! compute props and patches
//! redis patch present  -> patch cache deployment, grow claim
//! app patch present    -> patch app deployment (carries the annotation)
//! only plan/load moved -> rewrite the annotation only
//! ```

pub mod error;
pub mod manager;

pub use error::{ManagerError, ManagerResult};
pub use manager::{Applied, AppsStatus, DeploymentManager, UpdateOutcome};
