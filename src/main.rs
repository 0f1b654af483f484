//! Purpose: `kvfiler` CLI entry point.
//! Role: Binary crate root; parses flags, resolves a `FilerConfig`, runs pack or unpack.
//! Invariants: Progress and per-item errors go to stdout; fatal errors and logs go to stderr.
//! Invariants: Exactly one backend is opened per run and closed exactly once.
//! Invariants: Exit codes: 0 ok, 1 usage or fatal unpack, 2 embedded open, 3 remote open, 4 nothing stored.
#![allow(clippy::result_large_err)]
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueHint, error::ErrorKind as ClapErrorKind};
use glob::MatchOptions;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use kvfiler::api::{
    Backend, DEFAULT_REMOTE_PORT, EmptyStore, Error, ErrorKind, StoreOptions, Target,
};
use kvfiler::archive::{self, PackOptions, UnpackOptions};
use kvfiler::keys::KeyPrefix;
use kvfiler::report::{self, DEFAULT_PATTERN};

const EXIT_FAILURE: i32 = 1;
const EXIT_EMBEDDED_OPEN: i32 = 2;
const EXIT_REMOTE_OPEN: i32 = 3;
const EXIT_NOTHING_STORED: i32 = 4;

#[derive(Debug)]
struct Fatal {
    err: Error,
    exit_code: i32,
}

impl Fatal {
    fn usage(err: Error) -> Self {
        Self {
            err,
            exit_code: EXIT_FAILURE,
        }
    }

    fn open(err: Error, target: &Target) -> Self {
        let exit_code = if target.is_remote() {
            EXIT_REMOTE_OPEN
        } else {
            EXIT_EMBEDDED_OPEN
        };
        Self { err, exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(exit_code) => exit_code,
        Err(fatal) => {
            eprintln!("{}", report::error_text(&fatal.err));
            fatal.exit_code
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Fatal> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    Fatal::usage(
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                    )
                })?;
                return Ok(0);
            }
            _ => {
                return Err(Fatal::usage(
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `kvfiler --help`."),
                ));
            }
        },
    };

    init_tracing();

    let config = FilerConfig::from_cli(cli).map_err(Fatal::usage)?;
    debug!(?config, "resolved configuration");
    match config.action {
        Action::Pack => run_pack(&config),
        Action::Unpack => run_unpack(&config),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "kvfiler",
    version,
    about = "Pack files into a key-value database keyed by filename, and extract them back",
    after_help = r#"EXAMPLES
  $ kvfiler -c -f archive.kvf -k docs -p '*.txt'    # pack matching files as docs/<name>
  $ kvfiler -c -r -v -f archive.kvf                 # resume, skipping keys already stored
  $ kvfiler -x -f archive.kvf -C out                # extract every record under ./out
  $ kvfiler -c -H db.local -P 1978 -p '*.log'       # pack into a kvfiler-serve instance"#
)]
struct Cli {
    #[arg(short = 'c', help = "Create or append to the archive from the matched files")]
    create: bool,
    #[arg(short = 'x', help = "Extract every record into a file named by its key")]
    extract: bool,
    #[arg(
        short = 'f',
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        conflicts_with = "host",
        help = "Embedded database file"
    )]
    file: Option<PathBuf>,
    #[arg(short = 'H', value_name = "HOST", help = "Remote kvfiler-serve host")]
    host: Option<String>,
    #[arg(
        short = 'P',
        value_name = "PORT",
        default_value_t = DEFAULT_REMOTE_PORT,
        help = "Remote kvfiler-serve port"
    )]
    port: u16,
    #[arg(short = 'k', value_name = "PREFIX", help = "Key prefix; a trailing / is added")]
    key_prefix: Option<String>,
    #[arg(short = 'p', value_name = "GLOB", help = "Files to pack (default: *)")]
    pattern: Option<String>,
    #[arg(short = 'v', help = "Report every file")]
    verbose: bool,
    #[arg(short = 't', help = "Dry run; report actions without writing")]
    dry_run: bool,
    #[arg(short = 'r', help = "Resume; skip keys that already exist")]
    resume: bool,
    #[arg(short = 'o', help = "Size a new embedded database for the matched file count")]
    optimize: bool,
    #[arg(
        short = 'C',
        value_name = "DIR",
        default_value = ".",
        value_hint = ValueHint::DirPath,
        help = "Extraction destination directory"
    )]
    dest: PathBuf,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Action {
    Pack,
    Unpack,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct FilerConfig {
    action: Action,
    target: Target,
    prefix: KeyPrefix,
    pattern: String,
    pattern_defaulted: bool,
    verbose: bool,
    dry_run: bool,
    resume: bool,
    optimize: bool,
    dest: PathBuf,
}

impl FilerConfig {
    fn from_cli(cli: Cli) -> Result<Self, Error> {
        let action = match (cli.create, cli.extract) {
            (true, _) => Action::Pack,
            (false, true) => Action::Unpack,
            (false, false) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("no action specified")
                    .with_hint("Use -c to create an archive or -x to extract files from one."));
            }
        };

        let target = match (cli.file, cli.host) {
            (Some(path), None) => Target::embedded(path),
            (None, Some(host)) if !host.is_empty() => Target::remote(host, cli.port),
            (Some(_), Some(_)) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("-f and -H cannot be combined")
                    .with_hint("Pick either an embedded file or a remote host."));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("no database specified")
                    .with_hint("Use -f <dbfile> or -H <host>."));
            }
        };

        let (pattern, pattern_defaulted) = match cli.pattern {
            Some(pattern) if !pattern.is_empty() => (pattern, false),
            _ => (DEFAULT_PATTERN.to_string(), true),
        };

        Ok(Self {
            action,
            target,
            prefix: KeyPrefix::new(cli.key_prefix.unwrap_or_default()),
            pattern,
            pattern_defaulted,
            verbose: cli.verbose,
            dry_run: cli.dry_run,
            resume: cli.resume,
            optimize: cli.optimize,
            dest: cli.dest,
        })
    }
}

fn run_pack(config: &FilerConfig) -> Result<i32, Fatal> {
    if config.pattern_defaulted {
        println!("{}", report::default_pattern_notice());
    }
    let mut files = expand_pattern(&config.pattern).map_err(Fatal::usage)?;
    if let Some(database) = database_identity(&config.target) {
        exclude_database(&mut files, &database);
    }
    debug!(pattern = %config.pattern, matched = files.len(), "expanded pattern");

    let store_options = if config.optimize {
        let expected = files.len() as u64;
        if !config.target.is_remote() {
            println!("{}", report::optimize_notice(expected));
        }
        StoreOptions::optimized_for(expected)
    } else {
        StoreOptions::new()
    };
    let options = PackOptions {
        verbose: config.verbose,
        dry_run: config.dry_run,
        resume: config.resume,
    };
    let outcome = if dry_run_without_database(config) {
        archive::pack(&mut EmptyStore, &files, &config.prefix, options, |event| {
            println!("{}", report::pack_event_line(&event));
        })
    } else {
        let mut backend = open_backend(&config.target, store_options)?;
        let outcome = archive::pack(&mut backend, &files, &config.prefix, options, |event| {
            println!("{}", report::pack_event_line(&event));
        });
        close_backend(backend);
        outcome
    };
    println!("{}", report::finished_line(outcome.attempted));
    debug!(?outcome, "pack finished");

    if outcome.all_failed() {
        Ok(EXIT_NOTHING_STORED)
    } else {
        Ok(0)
    }
}

fn run_unpack(config: &FilerConfig) -> Result<i32, Fatal> {
    let options = UnpackOptions {
        verbose: config.verbose,
        dry_run: config.dry_run,
        dest: config.dest.clone(),
        database: database_identity(&config.target),
    };
    let result = if dry_run_without_database(config) {
        archive::unpack(&EmptyStore, &options, |event| {
            println!("{}", report::unpack_event_line(&event));
        })
    } else {
        let backend = open_backend(&config.target, StoreOptions::new())?;
        let result = archive::unpack(&backend, &options, |event| {
            println!("{}", report::unpack_event_line(&event));
        });
        close_backend(backend);
        result
    };

    let outcome = result.map_err(|err| Fatal {
        err,
        exit_code: EXIT_FAILURE,
    })?;
    println!("{}", report::finished_line(outcome.processed));
    debug!(?outcome, "unpack finished");
    Ok(0)
}

/// A dry run must not initialize the embedded file, so a missing or
/// zero-length one is read as empty.
fn dry_run_without_database(config: &FilerConfig) -> bool {
    let Target::Embedded(path) = &config.target else {
        return false;
    };
    if !config.dry_run {
        return false;
    }
    let uninitialized = match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() == 0,
        Err(err) => err.kind() == io::ErrorKind::NotFound,
    };
    if uninitialized {
        debug!(db = %config.target, "dry run against an uninitialized database");
    }
    uninitialized
}

/// Canonical path of an existing embedded database file.
fn database_identity(target: &Target) -> Option<PathBuf> {
    match target {
        Target::Embedded(path) => fs::canonicalize(path).ok(),
        Target::Remote { .. } => None,
    }
}

fn exclude_database(files: &mut Vec<PathBuf>, database: &Path) {
    files.retain(|file| {
        let same = fs::canonicalize(file).is_ok_and(|resolved| resolved == database);
        if same {
            debug!(path = %file.display(), "not packing the database into itself");
        }
        !same
    });
}

fn open_backend(target: &Target, options: StoreOptions) -> Result<Backend, Fatal> {
    Backend::open(target, options).map_err(|err| {
        let err = if err.message().is_none() {
            err.with_message(format!("failed to open database {target}"))
        } else {
            err
        };
        Fatal::open(err, target)
    })
}

fn close_backend(backend: Backend) {
    if let Err(err) = backend.close() {
        warn!(error = %err, "failed to close database");
    }
}

/// Expands `pattern` in enumeration order. Leading dots must be matched
/// literally, as in a shell glob.
fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>, Error> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: true,
    };
    let paths = glob::glob_with(pattern, options).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid glob pattern {pattern:?}"))
            .with_source(err)
    })?;
    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => files.push(path),
            Err(err) => warn!(
                path = %err.path().display(),
                error = %err.error(),
                "skipping unreadable path"
            ),
        }
    }
    Ok(files)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
