//! Purpose: Centralize database format versioning and upgrade guidance.
//! Exports: `DB_FORMAT_VERSION`, `SUPPORTED_DB_FORMAT_VERSIONS`, `db_version_error`.
//! Role: Shared policy for gating on-disk compatibility when a database is opened.
//! Invariants: Version list is additive; bump only for incompatible on-disk changes.

use crate::core::error::{Error, ErrorKind};

pub const DB_FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_DB_FORMAT_VERSIONS: &[u32] = &[DB_FORMAT_VERSION];

pub fn is_supported(version: u32) -> bool {
    SUPPORTED_DB_FORMAT_VERSIONS.contains(&version)
}

pub fn db_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_DB_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "unsupported database format version {detected} (supported: {supported})"
        ))
        .with_hint("Extract the archive with the kvfiler release that wrote it, then repack.")
}
