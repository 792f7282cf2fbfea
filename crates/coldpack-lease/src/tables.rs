//! Redb table definitions for the shared lease database.

use redb::TableDefinition;

// Key: lease name (e.g. "restore:node-a/20240611093012345-1f3a9c0e"), Value: bincode-encoded StoredLease
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
