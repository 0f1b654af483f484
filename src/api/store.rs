//! Purpose: Define the uniform key-value surface the archive engine runs against.
//! Exports: `Store`, `Target`, `StoreOptions`, `Backend`, `EmptyStore`, `RecordIter`.
//! Role: Resolve a configured target into exactly one open backend per run.
//! Invariants: Embedded and remote targets are mutually exclusive; selection is static.
//! Invariants: Existence means key presence, never value size.
#![allow(clippy::result_large_err)]

use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use super::remote::RemoteStore;
use crate::core::db::{Database, DbOptions};
use crate::core::error::{Error, ErrorKind};

pub type ApiResult<T> = Result<T, Error>;

/// Lazy one-pass sequence of `(key, value)` records.
pub type RecordIter<'a> = Box<dyn Iterator<Item = ApiResult<(Vec<u8>, Vec<u8>)>> + 'a>;

pub const DEFAULT_REMOTE_PORT: u16 = 1978;

pub trait Store {
    fn exists(&self, key: &[u8]) -> ApiResult<bool>;

    fn get(&self, key: &[u8]) -> ApiResult<Vec<u8>>;

    /// Stores `value` under `key`, replacing any existing record.
    fn put(&mut self, key: &[u8], value: &[u8]) -> ApiResult<()>;

    fn records(&self) -> ApiResult<RecordIter<'_>>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    Embedded(PathBuf),
    Remote { host: String, port: u16 },
}

impl Target {
    pub fn embedded(path: impl Into<PathBuf>) -> Self {
        Self::Embedded(path.into())
    }

    pub fn remote(host: impl Into<String>, port: u16) -> Self {
        Self::Remote {
            host: host.into(),
            port,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Target::Remote { .. })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Embedded(path) => write!(f, "{}", path.display()),
            Target::Remote { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreOptions {
    pub optimize: bool,
    pub expected_records: u64,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimized_for(expected_records: u64) -> Self {
        Self {
            optimize: true,
            expected_records,
        }
    }

    fn db_options(&self) -> DbOptions {
        if self.optimize {
            DbOptions::tuned(self.expected_records)
        } else {
            DbOptions::new()
        }
    }
}

pub enum Backend {
    Embedded(Database),
    Remote(RemoteStore),
}

impl Backend {
    pub fn open(target: &Target, options: StoreOptions) -> ApiResult<Self> {
        match target {
            Target::Embedded(path) => Ok(Self::Embedded(Database::open(
                path,
                options.db_options(),
            )?)),
            Target::Remote { host, port } => {
                if options.optimize {
                    debug!(remote = %target, "optimize has no effect on a remote backend");
                }
                Ok(Self::Remote(RemoteStore::connect(host, *port)?))
            }
        }
    }

    pub fn close(self) -> ApiResult<()> {
        match self {
            Backend::Embedded(db) => db.close(),
            Backend::Remote(_) => Ok(()),
        }
    }
}

impl Store for Backend {
    fn exists(&self, key: &[u8]) -> ApiResult<bool> {
        match self {
            Backend::Embedded(db) => db.exists(key),
            Backend::Remote(remote) => remote.exists(key),
        }
    }

    fn get(&self, key: &[u8]) -> ApiResult<Vec<u8>> {
        match self {
            Backend::Embedded(db) => db.get(key),
            Backend::Remote(remote) => remote.get(key),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> ApiResult<()> {
        match self {
            Backend::Embedded(db) => db.put(key, value),
            Backend::Remote(remote) => remote.put(key, value),
        }
    }

    fn records(&self) -> ApiResult<RecordIter<'_>> {
        match self {
            Backend::Embedded(db) => Store::records(db),
            Backend::Remote(remote) => Store::records(remote),
        }
    }
}

/// Stands in for an embedded database that does not exist yet, so dry runs
/// leave the filesystem untouched. Holds no records and rejects writes.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyStore;

impl Store for EmptyStore {
    fn exists(&self, _key: &[u8]) -> ApiResult<bool> {
        Ok(false)
    }

    fn get(&self, key: &[u8]) -> ApiResult<Vec<u8>> {
        Err(Error::new(ErrorKind::NotFound)
            .with_message("record not found")
            .with_key(String::from_utf8_lossy(key)))
    }

    fn put(&mut self, _key: &[u8], _value: &[u8]) -> ApiResult<()> {
        Err(Error::new(ErrorKind::Usage).with_message("empty store is read-only"))
    }

    fn records(&self) -> ApiResult<RecordIter<'_>> {
        Ok(Box::new(std::iter::empty()))
    }
}

impl Store for Database {
    fn exists(&self, key: &[u8]) -> ApiResult<bool> {
        Database::exists(self, key)
    }

    fn get(&self, key: &[u8]) -> ApiResult<Vec<u8>> {
        Database::get(self, key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> ApiResult<()> {
        Database::put(self, key, value)
    }

    fn records(&self) -> ApiResult<RecordIter<'_>> {
        Ok(Box::new(self.iter()))
    }
}
