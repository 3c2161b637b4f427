//! cadeploy-cluster — the orchestrator client boundary.
//!
//! [`ClusterApi`] is the narrow create/patch/delete/list surface the
//! deployer needs from Kubernetes. [`KubeClusterApi`] implements it over
//! `kube` dynamic objects; [`InMemoryCluster`] is an in-process fake with a
//! call journal and injectable failures for tests.
//!
//! [`Orchestrator`] sequences those calls into deployment-level operations:
//!
//! | Operation | Calls |
//! |---|---|
//! | create | network policy → volume claim → service → deployment |
//! | update | strategic-merge patch of the live deployment (and claim) |
//! | delete | deployment, service, network policy, claim; best effort |
//! | stat | list app deployments, decode the props annotation |

pub mod api;
pub mod error;
pub mod kubernetes;
pub mod memory;
pub mod orchestrator;

pub use api::ClusterApi;
pub use cadeploy_render::ResourceKind;
pub use error::{ClusterError, ClusterResult};
pub use kubernetes::KubeClusterApi;
pub use memory::{Call, InMemoryCluster, Verb};
pub use orchestrator::{Change, DeleteOutcome, DeleteReport, DeleteStep, Orchestrator};
