//! avaast-pds — AT-Protocol PDS resolution and record access.
//!
//! Maps authority DIDs to PDS endpoints and wraps the three XRPC calls
//! the host depends on (`getRecord`, `listRecords`, `getBlob`) with
//! bounded retry. Identity documents are fetched, never verified —
//! signature checking is an upstream concern.

pub mod client;
pub mod error;
pub mod resolver;

pub use client::PdsClient;
pub use error::{PdsError, PdsResult};
pub use resolver::PdsResolver;
