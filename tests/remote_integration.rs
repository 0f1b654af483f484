//! Purpose: End-to-end tests for `kvfiler-serve` and the remote backend.
//! Exports: None (integration test module).
//! Role: Validate remote put/get/exists/iterate and CLI -H/-P flows across TCP.
//! Invariants: Uses loopback-only servers over temp database files.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use kvfiler::api::{ErrorKind, RemoteStore, Store};
use std::fs;
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    port: u16,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(db_path: &Path) -> TestResult<Self> {
        Self::start_with_args(db_path, &[])
    }

    fn start_with_args(db_path: &Path, extra: &[&str]) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");

            let mut child = Command::new(env!("CARGO_BIN_EXE_kvfiler-serve"))
                .arg("-f")
                .arg(db_path)
                .arg("--bind")
                .arg(&bind)
                .args(extra)
                .env("RUST_LOG", "warn")
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        port,
                        base_url: format!("http://{bind}"),
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn store(&self) -> TestResult<RemoteStore> {
        Ok(RemoteStore::new(self.base_url.clone())?)
    }

    fn cli(&self, cwd: &Path, args: &[&str]) -> TestResult<Output> {
        let port = self.port.to_string();
        let output = Command::new(env!("CARGO_BIN_EXE_kvfiler"))
            .current_dir(cwd)
            .args(["-H", "127.0.0.1", "-P", port.as_str()])
            .args(args)
            .output()?;
        Ok(output)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn remote_store_put_get_exists() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(&temp.path().join("served.kvf"))?;
    let mut store = server.store()?;

    assert!(!store.exists(b"docs/a.txt")?);
    Store::put(&mut store, b"docs/a.txt", b"hi")?;
    Store::put(&mut store, b"empty", b"")?;
    assert!(store.exists(b"docs/a.txt")?);
    assert!(store.exists(b"empty")?);
    assert_eq!(store.get(b"docs/a.txt")?, b"hi");
    assert_eq!(store.get(b"empty")?, b"");

    let err = store.get(b"missing").expect_err("missing key");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.key(), Some("missing"));

    Store::put(&mut store, b"docs/a.txt", b"again")?;
    let mut records = store.records()?.collect::<Result<Vec<_>, _>>()?;
    records.sort();
    assert_eq!(
        records,
        vec![
            (b"docs/a.txt".to_vec(), b"again".to_vec()),
            (b"empty".to_vec(), Vec::new()),
        ]
    );
    Ok(())
}

#[test]
fn remote_errors_keep_not_found_apart_from_transport() -> TestResult<()> {
    let store = RemoteStore::new("http://127.0.0.1:1")?;
    let err = store.get(b"anything").expect_err("connect refused");
    assert_eq!(err.kind(), ErrorKind::Io);
    Ok(())
}

#[test]
fn cli_round_trip_through_server() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("src");
    fs::create_dir(&src)?;
    fs::write(src.join("a.txt"), b"hi")?;
    fs::write(src.join("b.txt"), b"bye")?;
    let server = TestServer::start(&temp.path().join("served.kvf"))?;

    let pack = server.cli(temp.path(), &["-c", "-k", "docs", "-p", "src/*.txt"])?;
    assert!(pack.status.success(), "pack failed: {pack:?}");
    assert!(stdout(&pack).ends_with("Finished. Processed 2 items\n"));

    let resume = server.cli(temp.path(), &["-c", "-r", "-v", "-k", "docs", "-p", "src/*.txt"])?;
    assert!(resume.status.success());
    assert!(stdout(&resume).contains("docs/a.txt: already exists"));

    let unpack = server.cli(temp.path(), &["-x", "-C", "out"])?;
    assert!(unpack.status.success(), "unpack failed: {unpack:?}");
    assert!(stdout(&unpack).ends_with("Finished. Processed 2 items\n"));
    assert_eq!(fs::read(temp.path().join("out/docs/a.txt"))?, b"hi");
    assert_eq!(fs::read(temp.path().join("out/docs/b.txt"))?, b"bye");
    Ok(())
}

#[test]
fn served_database_is_locked_for_embedded_clients() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let db_path = temp.path().join("served.kvf");
    let _server = TestServer::start(&db_path)?;

    let output = Command::new(env!("CARGO_BIN_EXE_kvfiler"))
        .current_dir(temp.path())
        .args(["-x", "-f", "served.kvf"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("locked"));
    Ok(())
}

#[test]
fn oversized_bodies_fail_per_file() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    fs::write(temp.path().join("big.bin"), vec![7u8; 64])?;
    let server = TestServer::start_with_args(
        &temp.path().join("served.kvf"),
        &["--max-body-bytes", "16"],
    )?;

    let pack = server.cli(temp.path(), &["-c", "-p", "big.bin"])?;
    assert_eq!(pack.status.code(), Some(4));
    let text = stdout(&pack);
    assert!(text.contains("***Failed to pack big.bin"));
    assert!(text.ends_with("Finished. Processed 1 items\n"));
    assert!(!server.store()?.exists(b"big.bin")?);
    Ok(())
}

#[test]
fn non_loopback_bind_requires_opt_in() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let db_path = temp.path().join("served.kvf");
    let output = Command::new(env!("CARGO_BIN_EXE_kvfiler-serve"))
        .arg("-f")
        .arg(&db_path)
        .args(["--bind", "0.0.0.0:0"])
        .output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--allow-non-loopback"));
    assert!(!db_path.exists());
    Ok(())
}
