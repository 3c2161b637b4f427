//! CheckpointStore — redb-backed persistence of prepared transactions.
//!
//! A checkpoint is written when a CA's transaction is prepared and removed
//! once it commits, so whatever is left at startup was interrupted and
//! must be resumed.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;
use crate::error::{QueueError, QueueResult};
use crate::tables::CHECKPOINTS;

macro_rules! map_err {
    ($variant:ident) => {
        |e| QueueError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct CheckpointStore {
    db: Arc<Database>,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> QueueResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "checkpoint store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> QueueResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store the checkpoint of `checkpoint.ca`, replacing any earlier one.
    pub fn put(&self, checkpoint: &Checkpoint) -> QueueResult<()> {
        let value = checkpoint.encode()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            table
                .insert(checkpoint.ca.as_str(), value.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(ca = %checkpoint.ca, actions = checkpoint.actions.len(), "checkpoint stored");
        Ok(())
    }

    pub fn get(&self, ca: &str) -> QueueResult<Option<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        match table.get(ca).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored checkpoint. Undecodable entries are skipped.
    pub fn list(&self) -> QueueResult<Vec<Checkpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            match decode(value.value()) {
                Ok(checkpoint) => results.push(checkpoint),
                Err(e) => warn!(ca = %key.value(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        Ok(results)
    }

    /// Delete the checkpoint of `ca`. Returns true if it existed.
    pub fn remove(&self, ca: &str) -> QueueResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
            existed = table.remove(ca).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%ca, existed, "checkpoint removed");
        Ok(existed)
    }
}

fn decode(bytes: &[u8]) -> QueueResult<Checkpoint> {
    let raw = std::str::from_utf8(bytes).map_err(map_err!(Read))?;
    Checkpoint::decode(raw)
}
