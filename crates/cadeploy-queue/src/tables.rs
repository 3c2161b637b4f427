//! redb table definitions for the checkpoint store.

use redb::TableDefinition;

/// Encoded checkpoints keyed by CA id.
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");
