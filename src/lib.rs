//! Purpose: Shared library crate behind the `kvfiler` and `kvfiler-serve` binaries.
//! Exports: `api` (storage backends), `archive` (pack/unpack), `keys`, `report`, `serve`, `core`.
//! Role: Internal library backing the binaries and integration tests.
//! Invariants: Storage is reached through `api::Store`; the archive engine never names a backend.
//! Invariants: Modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod archive;
pub mod core;
pub mod keys;
pub mod report;
pub mod serve;
