//! avaast-store — redb-backed durable state for Avaast.
//!
//! Two tables live in one embedded database: resume cursors and the
//! append-only change log. Both are write-ahead durable and safe for a
//! single writer with many readers.

pub mod changelog;
pub mod cursor;
pub mod db;
pub mod error;
pub mod tables;

pub use changelog::{ChangeFilter, ChangeLog, ChangeRow};
pub use cursor::{CursorEntry, CursorStore};
pub use error::{StoreError, StoreResult};
