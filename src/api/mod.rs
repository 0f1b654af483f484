//! Purpose: Define the public Rust API boundary for kvfiler storage backends.
//! Exports: Core types and operations needed by the CLI, the server, and tests.
//! Role: Public, additive-only surface; hides the on-disk record layout.
//! Invariants: Backends are reached only through `Store` and `Backend`.

mod remote;
mod store;

pub use crate::core::db::{Database, DbHeader, DbOptions, Records};
pub use crate::core::error::{Error, ErrorKind};
pub use remote::{
    RECORD_STREAM_CONTENT_TYPE, RemoteRecords, RemoteStore, encode_frame_header,
};
pub use store::{
    ApiResult, Backend, DEFAULT_REMOTE_PORT, EmptyStore, RecordIter, Store, StoreOptions, Target,
};
