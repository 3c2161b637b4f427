//! cadeploy-queue — the transactional face the deployer shows to CAs.
//!
//! A CA buffers mutating requests inside its transaction. Nothing touches
//! the cluster until the transaction commits; the prepared checkpoint lets a
//! restarted daemon replay what was in flight. Results travel back as
//! independent [`Reply`] messages, never as return values.

pub mod action;
pub mod checkpoint;
pub mod error;
pub mod executor;
pub mod queue;
pub mod reply;
pub mod store;
pub mod tables;

pub use action::{Action, qualify};
pub use checkpoint::{CHECKPOINT_VERSION, Checkpoint, LoggedAction};
pub use error::{QueueError, QueueResult};
pub use executor::ActionExecutor;
pub use queue::{CommandQueue, Phase, recover_all};
pub use reply::{DEFAULT_MAILBOX_CAPACITY, Mailboxes, Outbox, Reply, ReplySink, spawn_dispatcher};
pub use store::CheckpointStore;
