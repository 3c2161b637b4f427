//! Per-CA transactional buffer of mutating actions.
//!
//! ```text
//! begin -> record* -> prepare -> commit     actions applied in order
//!                             \-> abort     actions discarded
//! resume(checkpoint)                        replay after a crash
//! ```

use std::mem;

use cadeploy_core::id::owner_of_ca;
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::action::Action;
use crate::checkpoint::{Checkpoint, LoggedAction};
use crate::error::{QueueError, QueueResult};
use crate::executor::ActionExecutor;
use crate::reply::{Outbox, Reply};
use crate::store::CheckpointStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Open,
    Prepared,
}

pub struct CommandQueue {
    ca: String,
    owner: String,
    phase: Phase,
    log: Vec<LoggedAction>,
    outbox: Outbox,
}

impl CommandQueue {
    pub fn new(ca: &str, outbox: Outbox) -> QueueResult<Self> {
        Ok(Self {
            ca: ca.to_string(),
            owner: owner_of_ca(ca)?,
            phase: Phase::Idle,
            log: Vec::new(),
            outbox,
        })
    }

    pub fn ca(&self) -> &str {
        &self.ca
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending(&self) -> &[LoggedAction] {
        &self.log
    }

    /// Start a transaction, dropping anything an earlier one left behind.
    pub fn begin(&mut self) {
        if !self.log.is_empty() {
            debug!(ca = %self.ca, dropped = self.log.len(), "discarding unfinished transaction");
        }
        self.log.clear();
        self.phase = Phase::Open;
    }

    /// Buffer `action`. The target id is validated now, before any I/O.
    pub fn record(&mut self, action: Action, reply_method: Option<&str>) -> QueueResult<Uuid> {
        match self.phase {
            Phase::Idle => return Err(QueueError::NotBegun(self.ca.clone())),
            Phase::Prepared => return Err(QueueError::AlreadyPrepared(self.ca.clone())),
            Phase::Open => {}
        }
        action.qualified_id(&self.owner)?;

        let request_id = Uuid::new_v4();
        debug!(ca = %self.ca, %request_id, op = action.op(), "action recorded");
        self.log.push(LoggedAction {
            request_id,
            action,
            reply_method: reply_method.map(str::to_string),
        });
        Ok(request_id)
    }

    /// Freeze the buffered actions into a checkpoint.
    pub fn prepare(&mut self) -> QueueResult<Checkpoint> {
        match self.phase {
            Phase::Idle => Err(QueueError::NotBegun(self.ca.clone())),
            Phase::Prepared => Err(QueueError::AlreadyPrepared(self.ca.clone())),
            Phase::Open => {
                self.phase = Phase::Prepared;
                Ok(Checkpoint::new(self.ca.clone(), self.log.clone()))
            }
        }
    }

    /// Apply the buffered actions in issue order, then clear them. Returns
    /// the number of actions applied.
    pub async fn commit(&mut self, executor: &dyn ActionExecutor) -> QueueResult<usize> {
        if self.phase == Phase::Idle {
            return Err(QueueError::NotBegun(self.ca.clone()));
        }
        let log = mem::take(&mut self.log);
        self.phase = Phase::Idle;
        Ok(self.apply(log, executor).await)
    }

    pub fn abort(&mut self) {
        debug!(ca = %self.ca, dropped = self.log.len(), "transaction aborted");
        self.log.clear();
        self.phase = Phase::Idle;
    }

    /// Replay the actions of a checkpoint written before a crash.
    pub async fn resume(
        &mut self,
        checkpoint: Checkpoint,
        executor: &dyn ActionExecutor,
    ) -> QueueResult<usize> {
        if checkpoint.ca != self.ca {
            return Err(QueueError::ForeignCheckpoint {
                expected: self.ca.clone(),
                found: checkpoint.ca,
            });
        }
        self.log.clear();
        self.phase = Phase::Idle;
        info!(ca = %self.ca, actions = checkpoint.actions.len(), "resuming from checkpoint");
        Ok(self.apply(checkpoint.actions, executor).await)
    }

    async fn apply(&self, log: Vec<LoggedAction>, executor: &dyn ActionExecutor) -> usize {
        let applied = log.len();
        for entry in log {
            let result = executor.execute(&self.owner, &entry.action).await;
            match &result {
                Ok(_) => debug!(ca = %self.ca, request_id = %entry.request_id, op = entry.action.op(), "action applied"),
                Err(e) => warn!(ca = %self.ca, request_id = %entry.request_id, op = entry.action.op(), error = %e, "action failed"),
            }

            let Some(method) = entry.reply_method else {
                trace!(ca = %self.ca, request_id = %entry.request_id, "no reply method, dropping reply");
                continue;
            };
            let (error, data) = match result {
                Ok(data) => (None, data),
                Err(e) => (Some(e.to_string()), Value::Null),
            };
            self.outbox.push(Reply {
                ca: self.ca.clone(),
                method,
                request_id: entry.request_id,
                error,
                data,
            });
        }
        applied
    }
}

/// Replay and clear every checkpoint left in `store`. A checkpoint that
/// cannot be replayed is logged and kept for the next start.
pub async fn recover_all(
    store: &CheckpointStore,
    executor: &dyn ActionExecutor,
    outbox: &Outbox,
) -> QueueResult<usize> {
    let mut resumed = 0;
    for checkpoint in store.list()? {
        let ca = checkpoint.ca.clone();
        let mut queue = match CommandQueue::new(&ca, outbox.clone()) {
            Ok(queue) => queue,
            Err(e) => {
                warn!(%ca, error = %e, "skipping checkpoint of malformed CA id");
                continue;
            }
        };
        queue.resume(checkpoint, executor).await?;
        store.remove(&ca)?;
        resumed += 1;
    }
    if resumed > 0 {
        info!(resumed, "checkpoints recovered");
    }
    Ok(resumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// Records `<owner>:<op>:<name>` and fails any action on `broken`.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionExecutor for Recorder {
        async fn execute(&self, owner: &str, action: &Action) -> QueueResult<Value> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{owner}:{}:{}", action.op(), action.app_local_name()));
            if action.app_local_name() == "broken" {
                return Err(QueueError::Rejected("no such app".to_string()));
            }
            Ok(json!({ "id": action.qualified_id(owner)? }))
        }
    }

    fn restart(name: &str) -> Action {
        Action::RestartApp {
            app_local_name: name.to_string(),
        }
    }

    fn queue() -> (CommandQueue, mpsc::UnboundedReceiver<Reply>) {
        let (outbox, rx) = Outbox::channel();
        (CommandQueue::new("alice_ca1", outbox).unwrap(), rx)
    }

    #[tokio::test]
    async fn nothing_applies_before_commit() {
        let (mut q, _rx) = queue();
        let exec = Recorder::default();
        q.begin();
        q.record(restart("foo"), Some("done")).unwrap();
        q.record(restart("bar"), Some("done")).unwrap();
        assert!(exec.seen().is_empty());

        q.prepare().unwrap();
        assert_eq!(q.commit(&exec).await.unwrap(), 2);
        assert_eq!(exec.seen(), vec!["alice:restart_app:foo", "alice:restart_app:bar"]);
        assert!(q.pending().is_empty());
        assert_eq!(q.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn abort_discards() {
        let (mut q, _rx) = queue();
        let exec = Recorder::default();
        q.begin();
        q.record(restart("foo"), None).unwrap();
        q.abort();
        assert!(matches!(q.commit(&exec).await, Err(QueueError::NotBegun(_))));
        assert!(exec.seen().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let (mut q, _rx) = queue();
        assert!(matches!(q.record(restart("foo"), None), Err(QueueError::NotBegun(_))));
        q.begin();
        assert!(matches!(q.record(restart("Bad Name"), None), Err(QueueError::Input(_))));
        q.prepare().unwrap();
        assert!(matches!(q.record(restart("foo"), None), Err(QueueError::AlreadyPrepared(_))));
        assert!(matches!(q.prepare(), Err(QueueError::AlreadyPrepared(_))));
    }

    #[tokio::test]
    async fn replies_carry_request_ids_and_errors() {
        let (mut q, mut rx) = queue();
        let exec = Recorder::default();
        q.begin();
        let ok = q.record(restart("foo"), Some("on_done")).unwrap();
        let silent = q.record(restart("quiet"), None).unwrap();
        let failed = q.record(restart("broken"), Some("on_done")).unwrap();
        q.commit(&exec).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.request_id, ok);
        assert_eq!(first.ca, "alice_ca1");
        assert_eq!(first.method, "on_done");
        assert_eq!(first.error, None);
        assert_eq!(first.data, json!({"id": "alice-foo"}));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.request_id, failed);
        assert_eq!(second.error.as_deref(), Some("action rejected: no such app"));
        assert!(rx.try_recv().is_err());
        assert_ne!(silent, ok);
        // A failing action does not stop the ones after it.
        assert_eq!(exec.seen().len(), 3);
    }

    #[tokio::test]
    async fn resume_replays_in_order() {
        let (mut q, _rx) = queue();
        let exec = Recorder::default();
        q.begin();
        q.record(restart("one"), None).unwrap();
        q.record(restart("two"), None).unwrap();
        let checkpoint = q.prepare().unwrap();

        // Crash: a fresh queue picks up the checkpoint.
        let (mut fresh, _rx) = queue();
        assert_eq!(fresh.resume(checkpoint, &exec).await.unwrap(), 2);
        assert_eq!(exec.seen(), vec!["alice:restart_app:one", "alice:restart_app:two"]);
    }

    #[tokio::test]
    async fn resume_refuses_other_cas_checkpoint() {
        let (mut q, _rx) = queue();
        let exec = Recorder::default();
        let err = q
            .resume(Checkpoint::new("bob_ca1", Vec::new()), &exec)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ForeignCheckpoint { .. }));
    }

    #[tokio::test]
    async fn recover_all_clears_the_store() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let (mut q, _rx) = queue();
        q.begin();
        q.record(restart("foo"), None).unwrap();
        store.put(&q.prepare().unwrap()).unwrap();

        let (outbox, _rx) = Outbox::channel();
        let exec = Recorder::default();
        assert_eq!(recover_all(&store, &exec, &outbox).await.unwrap(), 1);
        assert_eq!(exec.seen(), vec!["alice:restart_app:foo"]);
        assert!(store.list().unwrap().is_empty());
    }
}
