//! Purpose: `kvfiler-serve` entry point; exposes one embedded database over HTTP.
//! Role: Thin binary over `kvfiler::serve`; parses flags and maps failures to exit codes.
//! Invariants: Exit code 1 for usage errors, 2 when the database cannot be opened or served.
#![allow(clippy::result_large_err)]
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueHint, error::ErrorKind as ClapErrorKind};

use kvfiler::api::{DEFAULT_REMOTE_PORT, Error, ErrorKind};
use kvfiler::report;
use kvfiler::serve::{DEFAULT_MAX_BODY_BYTES, ServeConfig, serve};

#[derive(Parser, Debug)]
#[command(
    name = "kvfiler-serve",
    version,
    about = "Serve a kvfiler database over HTTP for remote -H/-P clients"
)]
struct Cli {
    #[arg(
        short = 'f',
        long = "file",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        help = "Database file to serve (created if missing)"
    )]
    file: PathBuf,
    #[arg(long, value_name = "ADDR", help = "Listen address (default: 127.0.0.1:1978)")]
    bind: Option<String>,
    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Largest accepted record body"
    )]
    max_body_bytes: u64,
    #[arg(
        short = 'o',
        long = "bucket-hint",
        value_name = "N",
        help = "Size a newly created database for N records"
    )]
    bucket_hint: Option<u64>,
    #[arg(long, help = "Permit binding a non-loopback address")]
    allow_non_loopback: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let exit_code = match err.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(exit_code);
        }
    };
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", report::error_text(&err));
            if err.kind() == ErrorKind::Usage { 1 } else { 2 }
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<(), Error> {
    let bind = match cli.bind {
        Some(raw) => raw.parse::<SocketAddr>().map_err(|_| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid bind address")
                .with_hint("Use a host:port value like 127.0.0.1:1978.")
        })?,
        None => SocketAddr::from(([127, 0, 0, 1], DEFAULT_REMOTE_PORT)),
    };
    let config = ServeConfig {
        bind,
        db_path: cli.file,
        bucket_hint: cli.bucket_hint,
        max_body_bytes: cli.max_body_bytes,
        allow_non_loopback: cli.allow_non_loopback,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(serve(config))
}
