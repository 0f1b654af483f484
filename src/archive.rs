//! Purpose: Pack files into a key-value store and unpack records back into files.
//! Exports: `PackOptions`, `PackOutcome`, `PackEvent`, `pack`, `UnpackOptions`, `UnpackOutcome`, `UnpackEvent`, `unpack`.
//! Role: Archive engine driven by the CLI; storage-agnostic via `api::Store`.
//! Invariants: Pack failures are per-file; the loop always reaches the end of the file set.
//! Invariants: Unpack aborts on the first destination that cannot be written.
//! Invariants: Dry runs never write to the store or the filesystem.
//! Invariants: Each file mapping is released before the next file is opened.
#![allow(clippy::result_large_err)]

use std::fs::{self, File, Metadata};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::api::{Error, ErrorKind, Store};
use crate::keys::{KeyPrefix, derive_key, extraction_path};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PackOptions {
    pub verbose: bool,
    pub dry_run: bool,
    pub resume: bool,
}

/// `attempted` is the processed count reported to users; the other fields
/// break it down by result.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PackOutcome {
    pub attempted: u64,
    pub stored: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PackOutcome {
    pub fn all_failed(&self) -> bool {
        self.stored == 0 && self.failed > 0
    }
}

#[derive(Debug)]
pub enum PackEvent<'a> {
    Packing {
        index: usize,
        total: usize,
        path: &'a Path,
        key: &'a str,
    },
    AlreadyExists {
        path: &'a Path,
        key: &'a str,
    },
    NotRegular {
        path: &'a Path,
    },
    Stored {
        key: &'a str,
        bytes: u64,
    },
    Failed {
        path: &'a Path,
        error: &'a Error,
    },
}

/// `database` is the canonical path of the open embedded file, if any.
/// No record is ever extracted over it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnpackOptions {
    pub verbose: bool,
    pub dry_run: bool,
    pub dest: PathBuf,
    pub database: Option<PathBuf>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            dry_run: false,
            dest: PathBuf::from("."),
            database: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UnpackOutcome {
    pub processed: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub enum UnpackEvent<'a> {
    Extracting { key: &'a str },
}

enum FileContent {
    Empty,
    Mapped(Mmap),
}

impl FileContent {
    fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Empty => &[],
            FileContent::Mapped(map) => &map[..],
        }
    }
}

pub fn pack<S, F>(
    store: &mut S,
    files: &[PathBuf],
    prefix: &KeyPrefix,
    options: PackOptions,
    mut on_event: F,
) -> PackOutcome
where
    S: Store + ?Sized,
    F: FnMut(PackEvent<'_>),
{
    let mut outcome = PackOutcome::default();
    let total = files.len();
    let report_progress = options.verbose || options.dry_run;

    for (index, path) in files.iter().enumerate() {
        outcome.attempted += 1;

        let key = match derive_key(prefix, path) {
            Ok(key) => key,
            Err(err) => {
                outcome.failed += 1;
                on_event(PackEvent::Failed { path, error: &err });
                continue;
            }
        };

        if report_progress {
            on_event(PackEvent::Packing {
                index,
                total,
                path,
                key: &key,
            });
        }

        if options.resume {
            match store.exists(key.as_bytes()) {
                Ok(true) => {
                    outcome.skipped += 1;
                    on_event(PackEvent::AlreadyExists { path, key: &key });
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    outcome.failed += 1;
                    on_event(PackEvent::Failed { path, error: &err });
                    continue;
                }
            }
        }

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = Error::io(err, path).with_message("failed to stat file");
                outcome.failed += 1;
                on_event(PackEvent::Failed { path, error: &err });
                continue;
            }
        };
        if !metadata.is_file() {
            outcome.skipped += 1;
            on_event(PackEvent::NotRegular { path });
            continue;
        }

        if options.dry_run {
            continue;
        }

        let stored = read_file(path, &metadata).and_then(|content| {
            let bytes = content.as_bytes();
            store
                .put(key.as_bytes(), bytes)
                .map(|()| bytes.len() as u64)
                .map_err(|err| err.with_key(key.as_str()))
        });
        match stored {
            Ok(bytes) => {
                outcome.stored += 1;
                debug!(key = %key, bytes, "stored record");
                if options.verbose {
                    on_event(PackEvent::Stored { key: &key, bytes });
                }
            }
            Err(err) => {
                outcome.failed += 1;
                on_event(PackEvent::Failed { path, error: &err });
            }
        }
    }

    outcome
}

/// Maps the whole file. The length seen through the open handle must match
/// the earlier stat so the stored bytes correspond to what was enumerated.
fn read_file(path: &Path, stat: &Metadata) -> Result<FileContent, Error> {
    let file =
        File::open(path).map_err(|err| Error::io(err, path).with_message("failed to open file"))?;
    let len = file
        .metadata()
        .map_err(|err| Error::io(err, path))?
        .len();
    if len != stat.len() {
        return Err(Error::new(ErrorKind::Io)
            .with_message("file changed size while packing")
            .with_path(path));
    }
    if len == 0 {
        return Ok(FileContent::Empty);
    }
    let map = unsafe {
        Mmap::map(&file).map_err(|err| Error::io(err, path).with_message("failed to map file"))?
    };
    Ok(FileContent::Mapped(map))
}

pub fn unpack<S, F>(
    store: &S,
    options: &UnpackOptions,
    mut on_event: F,
) -> Result<UnpackOutcome, Error>
where
    S: Store + ?Sized,
    F: FnMut(UnpackEvent<'_>),
{
    let mut outcome = UnpackOutcome::default();

    for record in store.records()? {
        let (key, value) = record?;
        let key = String::from_utf8(key).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("record key is not valid UTF-8")
                .with_key(String::from_utf8_lossy(err.as_bytes()))
        })?;

        if options.verbose || options.dry_run {
            on_event(UnpackEvent::Extracting { key: &key });
        }

        if !options.dry_run {
            let dest = extraction_path(&options.dest, &key)?;
            if let Some(database) = options.database.as_deref() {
                refuse_database_target(&dest, database, &key)?;
            }
            write_file(&dest, &value).map_err(|err| err.with_key(key.as_str()))?;
        }

        outcome.processed += 1;
        outcome.bytes += value.len() as u64;
    }

    Ok(outcome)
}

fn refuse_database_target(dest: &Path, database: &Path, key: &str) -> Result<(), Error> {
    match fs::canonicalize(dest) {
        Ok(resolved) if resolved == database => Err(Error::new(ErrorKind::Usage)
            .with_message("record would overwrite the open database")
            .with_hint("Extract into another directory with -C.")
            .with_path(dest)
            .with_key(key)),
        _ => Ok(()),
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            Error::io(err, parent).with_message("failed to create destination directory")
        })?;
    }
    let mut file = File::create(path)
        .map_err(|err| Error::io(err, path).with_message("failed to open destination file"))?;
    file.write_all(contents)
        .map_err(|err| Error::io(err, path).with_message("failed to write destination file"))
}
