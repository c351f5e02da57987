//! Shared database handle for the cursor store and change log.

use std::path::Path;
use std::sync::Arc;

use redb::Database;

use crate::error::StoreResult;
use crate::tables::{CHANGELOG, CHANGELOG_IDX, CURSORS};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| crate::error::StoreError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

/// Open (or create) the durable database at the given path.
pub fn open(path: &Path) -> StoreResult<Arc<Database>> {
    let db = Database::create(path).map_err(map_err!(Open))?;
    let db = Arc::new(db);
    ensure_tables(&db)?;
    tracing::debug!(?path, "durable store opened");
    Ok(db)
}

/// Create an ephemeral in-memory database (for testing).
pub fn open_in_memory() -> StoreResult<Arc<Database>> {
    let backend = redb::backends::InMemoryBackend::new();
    let db = Database::builder()
        .create_with_backend(backend)
        .map_err(map_err!(Open))?;
    let db = Arc::new(db);
    ensure_tables(&db)?;
    tracing::debug!("in-memory durable store opened");
    Ok(db)
}

/// Create all tables if they don't exist yet.
fn ensure_tables(db: &Database) -> StoreResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(CURSORS).map_err(map_err!(Table))?;
    txn.open_table(CHANGELOG).map_err(map_err!(Table))?;
    txn.open_table(CHANGELOG_IDX).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}
