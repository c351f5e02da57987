//! redb table definitions for the Avaast durable store.
//!
//! Values are JSON-serialized domain types. The change log index key
//! encodes `{collection}|{authority_id}|{created_at_ms}|{id}` with
//! zero-padded numbers so lexicographic order matches chronological order.

use redb::TableDefinition;

/// Resume cursors keyed by cursor name (e.g. `"firehose"`).
pub const CURSORS: TableDefinition<&str, &[u8]> = TableDefinition::new("cursors");

/// Change log rows keyed by insertion id.
pub const CHANGELOG: TableDefinition<u64, &[u8]> = TableDefinition::new("changelog");

/// Secondary change log index keyed by
/// `{collection}|{authority_id}|{created_at_ms:020}|{id:020}`.
pub const CHANGELOG_IDX: TableDefinition<&str, u64> = TableDefinition::new("changelog_idx");
